//! Pulse Call Core - Signaling und Verbindungssteuerung für P2P Anrufe
//!
//! Der Kern einer Chat-App mit Audio/Video-Anrufen:
//! - Call State Machine mit Klingel-Timeouts
//! - Signal Queue für Offer/Answer/ICE Candidates
//! - Connection Monitor mit Qualitäts-Einstufung
//! - Reconnect des Signaling-Transports mit Backoff
//! - SQLite für Kontakte und Anrufliste

pub mod call_engine;
pub mod config;
pub mod credentials;
pub mod database;
pub mod logging;
pub mod notify;
pub mod signaling;

#[cfg(test)]
mod testing;

use call_engine::{
    CallAttempt, CallDeps, CallError, CallHistory, CallStateMachine, ConnectionStats,
    MediaDevices, PeerFactory, ProfileLookup, RtcPeerFactory,
};
use config::CallConfig;
use credentials::{AuthSession, CredentialProvider, CredentialService};
use database::{Database, DatabaseError};
use notify::{Notice, NoticeKind, Notifier};
use serde::Serialize;
use signaling::{
    CallTransport, ConnectionSupervisor, NetworkHint, SignalingClient, SignalingError,
    TransportConnectionState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

// ============================================================================
// CALL CORE
// ============================================================================

/// Externe Anbindungen des Call Core
pub struct CoreDeps {
    pub transport: Arc<dyn CallTransport>,
    pub auth: Arc<dyn AuthSession>,
    pub credential_service: Arc<dyn CredentialService>,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub profiles: Arc<dyn ProfileLookup>,
    pub history: Option<Arc<dyn CallHistory>>,
}

/// Inhalt des Diagnose-Overlays
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub connection: ConnectionStats,
    pub transport: TransportConnectionState,
    pub call: Option<CallAttempt>,
    pub debug_overlay: bool,
}

/// Besitzt alle Komponenten; ersetzt einen globalen App-State
pub struct CallCore {
    notifier: Notifier,
    transport: Arc<dyn CallTransport>,
    supervisor: ConnectionSupervisor,
    calls: CallStateMachine,
    database: Option<Arc<Database>>,
    debug_overlay: AtomicBool,
}

impl CallCore {
    /// Produktiv-Setup: WebSocket-Relay, webrtc-rs und lokale SQLite-Datenbank
    pub fn open(
        config: CallConfig,
        auth: Arc<dyn AuthSession>,
        credential_service: Arc<dyn CredentialService>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, CoreError> {
        logging::init_tracing();
        tracing::info!("Initializing call core...");

        let database = Arc::new(Database::open()?);
        tracing::info!("Database opened");

        let transport = Arc::new(SignalingClient::new(
            config.signaling_url.clone(),
            Arc::clone(&auth),
            config.probe_timeout,
        ));

        let mut core = Self::new(
            config,
            CoreDeps {
                transport,
                auth,
                credential_service,
                peers: Arc::new(RtcPeerFactory::new()),
                devices,
                profiles: database.clone(),
                history: Some(database.clone()),
            },
        );
        core.database = Some(database);
        Ok(core)
    }

    /// Setup mit beliebigen Anbindungen
    pub fn new(config: CallConfig, deps: CoreDeps) -> Self {
        let notifier = Notifier::new();

        let credentials = Arc::new(CredentialProvider::new(
            deps.credential_service,
            Arc::clone(&deps.auth),
            notifier.clone(),
            &config,
        ));
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&deps.transport),
            deps.auth,
            notifier.clone(),
            &config,
        );
        let calls = CallStateMachine::spawn(
            config,
            CallDeps {
                transport: Arc::clone(&deps.transport),
                credentials,
                peers: deps.peers,
                devices: deps.devices,
                profiles: deps.profiles,
                history: deps.history,
                notifier: notifier.clone(),
            },
        );

        Self {
            notifier,
            transport: deps.transport,
            supervisor,
            calls,
            database: None,
            debug_overlay: AtomicBool::new(false),
        }
    }

    /// Verbindet den Transport und startet die Überwachung.
    /// Schlägt der erste Versuch fehl, übernimmt der Reconnect.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let result = self.transport.connect().await;
        self.supervisor.start();
        if let Err(e) = &result {
            tracing::warn!("Initial connect failed, reconnecting in background: {}", e);
        }
        Ok(result?)
    }

    pub async fn disconnect(&self) {
        self.supervisor.stop();
        self.transport.disconnect().await;
    }

    pub fn calls(&self) -> &CallStateMachine {
        &self.calls
    }

    pub fn database(&self) -> Option<&Arc<Database>> {
        self.database.as_ref()
    }

    /// Gibt einen Receiver für Benutzer-Hinweise zurück
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notifier.subscribe()
    }

    /// Plattform-Ereignis (online/offline, Vorder-/Hintergrund)
    pub fn network_hint(&self, hint: NetworkHint) {
        self.supervisor.network_hint(hint);
    }

    pub fn connection_state(&self) -> TransportConnectionState {
        self.supervisor.state()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            connection: self.calls.diagnostics(),
            transport: self.supervisor.state(),
            call: self.calls.current(),
            debug_overlay: self.debug_overlay.load(Ordering::SeqCst),
        }
    }

    pub fn set_debug_overlay(&self, enabled: bool) {
        let previous = self.debug_overlay.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            let message = if enabled {
                "Debug overlay enabled"
            } else {
                "Debug overlay disabled"
            };
            self.notifier.info(NoticeKind::DebugOverlay, message);
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down call core");
        self.calls.shutdown().await;
        self.disconnect().await;
    }
}

impl std::fmt::Debug for CallCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCore")
            .field("calls", &self.calls)
            .field("transport", &self.supervisor.state())
            .field("debug_overlay", &self.debug_overlay.load(Ordering::SeqCst))
            .finish()
    }
}
