//! Database Module - SQLite für Kontakte und Anrufliste
//!
//! Eine Datei, eine Verbindung; die Tabellen werden in `contacts` und
//! `call_log` verwaltet.

mod call_log;
mod contacts;

pub use call_log::CallLogEntry;
pub use contacts::{Contact, NewContact};

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank (Thread-safe durch Mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Öffnet oder erstellt die Datenbank im App-Datenverzeichnis
    pub fn open() -> Result<Self, DatabaseError> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening database at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn default_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("com", "questxen", "pulse-call-core")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("calls.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                peer_id TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL,
                display_name TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_contacts_username ON contacts(username);

            CREATE TABLE IF NOT EXISTS call_log (
                call_id TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                peer_display_name TEXT NOT NULL,
                status TEXT NOT NULL,
                video INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                answered_at TEXT,
                ended_at TEXT,
                duration_secs INTEGER,
                end_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_call_log_started ON call_log(started_at);
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
