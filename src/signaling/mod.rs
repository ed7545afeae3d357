//! Signaling Module
//!
//! Dieses Modul verwaltet die Kommunikation mit der Gegenseite:
//! - Nachrichtenformate und `SignalEnvelope`
//! - `CallTransport` Schnittstelle und WebSocket-Client
//! - Signal Queue (Reihenfolge, Deduplizierung, Retry)
//! - Reconnect mit exponentiellem Backoff

mod client;
mod messages;
mod queue;
mod reconnect;
mod transport;

pub use client::SignalingClient;
pub use messages::*;
pub use queue::{QueueEvent, SignalHistory, SignalQueue};
pub use reconnect::{reconnect_delay, ConnectionSupervisor, NetworkHint, TransportConnectionState};
pub use transport::{CallTransport, SignalingError, TransportEvent};
