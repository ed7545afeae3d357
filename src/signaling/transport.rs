//! Transport-Schnittstelle für Signaling
//!
//! Jede Anbindung (WebSocket-Relay, Vendor SDK, ...) implementiert
//! [`CallTransport`]. Zustellung ist at-least-once: Duplikate werden vom
//! Call Core gefiltert, nicht vom Transport.

use super::messages::{CallId, RemoteStatus, SignalEnvelope};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Probe timed out")]
    ProbeTimeout,

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Eingehende Ereignisse vom Transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,

    Disconnected,

    /// Eingehender Anruf
    Invite {
        call_id: CallId,
        from_peer_id: String,
        video: bool,
    },

    Signal {
        call_id: CallId,
        from_peer_id: String,
        signal: SignalEnvelope,
    },

    Status {
        call_id: CallId,
        from_peer_id: String,
        status: RemoteStatus,
        reason: Option<String>,
    },

    Error { code: i32, message: String },
}

impl TransportEvent {
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            TransportEvent::Invite { call_id, .. }
            | TransportEvent::Signal { call_id, .. }
            | TransportEvent::Status { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

// ============================================================================
// CALL TRANSPORT
// ============================================================================

#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn connect(&self) -> Result<(), SignalingError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Leichter Erreichbarkeitstest (Ping/Pong)
    async fn probe(&self) -> Result<(), SignalingError>;

    /// Ereignisse aller Anrufe; Empfänger filtern nach `CallId`
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    async fn invite(&self, call_id: &CallId, to_peer_id: &str, video: bool)
        -> Result<(), SignalingError>;

    async fn publish(
        &self,
        call_id: &CallId,
        to_peer_id: &str,
        signal: SignalEnvelope,
    ) -> Result<(), SignalingError>;

    async fn update_status(
        &self,
        call_id: &CallId,
        to_peer_id: &str,
        status: RemoteStatus,
        reason: Option<String>,
    ) -> Result<(), SignalingError>;
}
