//! Kontakte
//!
//! Lokales Adressbuch. Dient der Call Engine als Quelle für Anzeigenamen.

use super::{Database, DatabaseError};
use crate::call_engine::ProfileLookup;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};

/// Lokaler Kontakt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub peer_id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Contact {
    /// Anzeigename, sonst Benutzername
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.username)
    }

    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            peer_id: row.get(1)?,
            username: row.get(2)?,
            display_name: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

/// Neuer Kontakt ohne ID (für INSERT)
#[derive(Debug, Clone)]
pub struct NewContact {
    pub peer_id: String,
    pub username: String,
    pub display_name: Option<String>,
}

const CONTACT_COLUMNS: &str =
    "id, peer_id, username, display_name, created_at, updated_at";

impl Database {
    /// Fügt einen Kontakt hinzu oder aktualisiert ihn
    pub fn add_contact(&self, contact: NewContact) -> Result<Contact, DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO contacts (peer_id, username, display_name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(peer_id) DO UPDATE SET
                username = excluded.username,
                display_name = COALESCE(excluded.display_name, display_name),
                updated_at = datetime('now')
            "#,
            params![contact.peer_id, contact.username, contact.display_name],
        )?;

        find_contact(&conn, &contact.peer_id)?
            .ok_or(DatabaseError::ContactNotFound(contact.peer_id))
    }

    pub fn contact(&self, peer_id: &str) -> Result<Option<Contact>, DatabaseError> {
        let conn = self.conn.lock();
        find_contact(&conn, peer_id)
    }

    /// Alle Kontakte, alphabetisch
    pub fn contacts(&self) -> Result<Vec<Contact>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contacts ORDER BY username ASC",
            CONTACT_COLUMNS
        ))?;

        let contacts = stmt
            .query_map([], Contact::from_row)?
            .collect::<SqliteResult<Vec<Contact>>>()?;
        Ok(contacts)
    }

    pub fn set_display_name(
        &self,
        peer_id: &str,
        display_name: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            UPDATE contacts
            SET display_name = ?2, updated_at = datetime('now')
            WHERE peer_id = ?1
            "#,
            params![peer_id, display_name],
        )?;
        if changed == 0 {
            return Err(DatabaseError::ContactNotFound(peer_id.to_string()));
        }
        Ok(())
    }

    pub fn delete_contact(&self, peer_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM contacts WHERE peer_id = ?1", params![peer_id])?;
        Ok(())
    }
}

fn find_contact(conn: &Connection, peer_id: &str) -> Result<Option<Contact>, DatabaseError> {
    let contact = conn
        .query_row(
            &format!("SELECT {} FROM contacts WHERE peer_id = ?1", CONTACT_COLUMNS),
            params![peer_id],
            Contact::from_row,
        )
        .optional()?;
    Ok(contact)
}

/// Anzeigename → Benutzername → rohe ID
#[async_trait]
impl ProfileLookup for Database {
    async fn resolve_display_name(&self, user_id: &str) -> anyhow::Result<String> {
        let name = self
            .contact(user_id)?
            .map(|c| c.label().to_string())
            .unwrap_or_else(|| user_id.to_string());
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob() -> NewContact {
        NewContact {
            peer_id: "peer-bob".to_string(),
            username: "bob".to_string(),
            display_name: None,
        }
    }

    #[test]
    fn test_add_and_update_contact() {
        let db = Database::open_in_memory().unwrap();

        let contact = db.add_contact(bob()).unwrap();
        assert_eq!(contact.username, "bob");
        assert_eq!(contact.display_name, None);

        // Upsert behält den bestehenden Anzeigenamen
        db.set_display_name("peer-bob", Some("Bob Builder")).unwrap();
        let contact = db.add_contact(bob()).unwrap();
        assert_eq!(contact.display_name.as_deref(), Some("Bob Builder"));
        assert_eq!(db.contacts().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_contact() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.contact("nobody").unwrap().is_none());
        assert!(matches!(
            db.set_display_name("nobody", Some("x")),
            Err(DatabaseError::ContactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_profile_lookup_fallbacks() {
        let db = Database::open_in_memory().unwrap();
        db.add_contact(bob()).unwrap();

        assert_eq!(db.resolve_display_name("peer-bob").await.unwrap(), "bob");

        db.set_display_name("peer-bob", Some("Bob Builder")).unwrap();
        assert_eq!(db.resolve_display_name("peer-bob").await.unwrap(), "Bob Builder");

        assert_eq!(db.resolve_display_name("peer-eve").await.unwrap(), "peer-eve");

        db.delete_contact("peer-bob").unwrap();
        assert_eq!(db.resolve_display_name("peer-bob").await.unwrap(), "peer-bob");
    }
}
