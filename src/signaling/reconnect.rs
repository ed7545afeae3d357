//! Reconnect-Strategie für den Signaling-Transport
//!
//! Unabhängig von einzelnen Anrufen: ein periodischer Probe prüft die
//! Erreichbarkeit, bei Verbindungsverlust wird mit exponentiellem Backoff
//! neu verbunden (ohne Obergrenze für die Anzahl der Versuche).

use super::transport::{CallTransport, TransportEvent};
use crate::config::CallConfig;
use crate::credentials::AuthSession;
use crate::notify::{NoticeKind, Notifier};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Verzögerung vor dem Versuch Nr. `attempts` (0-basiert):
/// `min(base * 2^attempts, max)`
pub fn reconnect_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Prozessweiter Verbindungszustand des Transports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportConnectionState {
    pub is_online: bool,
    pub last_ping_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

/// Hinweise der Plattform (online/offline, Sichtbarkeit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkHint {
    Online,
    Offline,
    Foreground,
    Background,
}

// ============================================================================
// CONNECTION SUPERVISOR
// ============================================================================

struct SupervisorInner {
    transport: Arc<dyn CallTransport>,
    auth: Arc<dyn AuthSession>,
    notifier: Notifier,
    state: Mutex<TransportConnectionState>,
    probe_interval: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
}

pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
    hints: mpsc::UnboundedSender<NetworkHint>,
    hints_rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkHint>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn CallTransport>,
        auth: Arc<dyn AuthSession>,
        notifier: Notifier,
        config: &CallConfig,
    ) -> Self {
        let (hints, hints_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(SupervisorInner {
                transport,
                auth,
                notifier,
                state: Mutex::new(TransportConnectionState::default()),
                probe_interval: config.probe_interval,
                reconnect_base: config.reconnect_base,
                reconnect_max: config.reconnect_max,
            }),
            hints,
            hints_rx: Mutex::new(Some(hints_rx)),
            task: Mutex::new(None),
        }
    }

    /// Startet die Überwachung. Prüft sofort und danach periodisch.
    pub fn start(&self) {
        let Some(hints) = self.hints_rx.lock().take() else {
            tracing::warn!("Connection supervisor already started");
            return;
        };
        let events = self.inner.transport.subscribe();
        let inner = Arc::clone(&self.inner);
        *self.task.lock() = Some(tokio::spawn(inner.run(hints, events)));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Plattform-Ereignis melden, löst ggf. einen sofortigen Probe aus
    pub fn network_hint(&self, hint: NetworkHint) {
        let _ = self.hints.send(hint);
    }

    pub fn state(&self) -> TransportConnectionState {
        self.inner.state.lock().clone()
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SupervisorInner {
    async fn run(
        self: Arc<Self>,
        mut hints: mpsc::UnboundedReceiver<NetworkHint>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) {
        let mut foreground = true;
        let mut ticker = tokio::time::interval(self.probe_interval);

        loop {
            tokio::select! {
                _ = ticker.tick(), if foreground => {}
                hint = hints.recv() => match hint {
                    None => break,
                    Some(NetworkHint::Background) => {
                        foreground = false;
                        continue;
                    }
                    Some(NetworkHint::Foreground) => {
                        foreground = true;
                        ticker.reset();
                    }
                    Some(NetworkHint::Offline) => self.mark_offline(),
                    Some(NetworkHint::Online) => {}
                },
                event = events.recv() => match event {
                    Ok(TransportEvent::Disconnected) => self.mark_offline(),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }

            if !self.check().await {
                self.reconnect(&mut hints).await;
            }
        }
    }

    /// Ein Probe, aktualisiert `is_online`/`last_ping_time`
    async fn check(&self) -> bool {
        let reachable = self.transport.is_connected() && self.transport.probe().await.is_ok();
        let mut state = self.state.lock();
        if reachable {
            state.is_online = true;
            state.last_ping_time = Some(Utc::now());
        } else {
            state.is_online = false;
        }
        reachable
    }

    fn mark_offline(&self) {
        let was_online = std::mem::replace(&mut self.state.lock().is_online, false);
        if was_online {
            self.notifier
                .warn(NoticeKind::ConnectionLost, "Connection to server lost");
        }
    }

    async fn reconnect(&self, hints: &mut mpsc::UnboundedReceiver<NetworkHint>) {
        self.mark_offline();

        loop {
            let attempts = self.state.lock().reconnect_attempts;
            let delay = reconnect_delay(attempts, self.reconnect_base, self.reconnect_max);
            tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempts + 1);

            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    hint = hints.recv() => match hint {
                        // Netzwerk wieder da: nicht auf den Backoff warten
                        Some(NetworkHint::Online) | Some(NetworkHint::Foreground) => break,
                        Some(_) => continue,
                        None => return,
                    },
                }
            }

            // Token vor jedem Versuch auffrischen
            if let Err(e) = self.auth.refresh().await {
                tracing::warn!("Session refresh before reconnect failed: {}", e);
            }

            match self.transport.connect().await {
                Ok(()) => {
                    {
                        let mut state = self.state.lock();
                        state.is_online = true;
                        state.last_ping_time = Some(Utc::now());
                        state.reconnect_attempts = 0;
                    }
                    tracing::info!("Reconnected to signaling server");
                    self.notifier
                        .info(NoticeKind::ConnectionRestored, "Connection restored");
                    return;
                }
                Err(e) => {
                    let mut state = self.state.lock();
                    state.reconnect_attempts = state.reconnect_attempts.saturating_add(1);
                    tracing::warn!(
                        "Reconnect attempt {} failed: {}",
                        state.reconnect_attempts,
                        e
                    );
                }
            }
        }
    }
}
