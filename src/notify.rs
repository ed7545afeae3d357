//! Benutzer-Hinweise (Toast-Äquivalent)
//!
//! Alle Komponenten melden nutzerrelevante Ereignisse über einen gemeinsamen
//! [`Notifier`]. Die UI abonniert den Stream und zeigt die Hinweise an.

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    CallStarted,
    CallEnded,
    CallFailed,
    CallCanceled,
    NoAnswer,
    Busy,
    MissedCall,
    PermissionDenied,
    /// ICE-Server Fallback aktiv, Verbindungsqualität evtl. eingeschränkt
    ConnectionDegraded,
    ConnectionRestored,
    ConnectionLost,
    Reconnecting,
    NoConnectionPaths,
    NetworkBlocked,
    ConnectionFailed,
    ConnectionStalled,
    DebugOverlay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub level: NoticeLevel,
    pub message: String,
}

/// Verteilt Hinweise an alle Abonnenten
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    /// Gibt einen Receiver für Hinweise zurück
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    pub fn notify(&self, kind: NoticeKind, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice {
            kind,
            level,
            message: message.into(),
        };

        match level {
            NoticeLevel::Info => tracing::info!("Notice {:?}: {}", kind, notice.message),
            NoticeLevel::Warning => tracing::warn!("Notice {:?}: {}", kind, notice.message),
            NoticeLevel::Error => tracing::error!("Notice {:?}: {}", kind, notice.message),
        }

        // Ohne Abonnenten geht der Hinweis verloren
        let _ = self.tx.send(notice);
    }

    pub fn info(&self, kind: NoticeKind, message: impl Into<String>) {
        self.notify(kind, NoticeLevel::Info, message);
    }

    pub fn warn(&self, kind: NoticeKind, message: impl Into<String>) {
        self.notify(kind, NoticeLevel::Warning, message);
    }

    pub fn error(&self, kind: NoticeKind, message: impl Into<String>) {
        self.notify(kind, NoticeLevel::Error, message);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
