//! Connection Monitor
//!
//! Beobachtet die Peer Connection eines Anrufs, sammelt periodisch Stats
//! und meldet Probleme (keine Kandidaten, blockiertes Netzwerk, Abbrüche).

use super::peer::{
    IceConnectionState, IceGatheringState, PeerConnection, PeerConnectionState, PeerEvent,
    SignalingState,
};
use crate::notify::{NoticeKind, Notifier};
use crate::signaling::CallId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Unknown,
}

impl ConnectionQuality {
    pub fn from_rtt(rtt: Option<Duration>) -> Self {
        match rtt.map(|d| d.as_millis()) {
            None => ConnectionQuality::Unknown,
            Some(ms) if ms < 100 => ConnectionQuality::Excellent,
            Some(ms) if ms < 200 => ConnectionQuality::Good,
            Some(ms) if ms < 400 => ConnectionQuality::Fair,
            Some(_) => ConnectionQuality::Poor,
        }
    }
}

/// Momentaufnahme der Verbindung für Diagnose
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub ice_gathering_state: IceGatheringState,
    pub ice_connection_state: IceConnectionState,
    pub connection_state: PeerConnectionState,
    pub signaling_state: SignalingState,
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub round_trip_time: Option<Duration>,
    pub quality: ConnectionQuality,
}

/// Zustandsänderungen, auf die die State Machine reagiert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEventKind {
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEvent {
    pub call_id: CallId,
    pub kind: MonitorEventKind,
}

// ============================================================================
// CONNECTION MONITOR
// ============================================================================

struct Watch {
    stats: ConnectionStats,
    idle_since: Instant,
    was_disconnected: bool,
    stall_reported: bool,
    paths_reported: bool,
}

impl Watch {
    fn new() -> Self {
        Self {
            stats: ConnectionStats::default(),
            idle_since: Instant::now(),
            was_disconnected: false,
            stall_reported: false,
            paths_reported: false,
        }
    }

    fn touch(&mut self) {
        self.stats.last_activity = Some(Utc::now());
        self.idle_since = Instant::now();
    }
}

pub struct ConnectionMonitor {
    notifier: Notifier,
    events: mpsc::UnboundedSender<MonitorEvent>,
    stats_interval: Duration,
    stall_threshold: Duration,
    watch: Arc<Mutex<Watch>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    pub fn new(
        notifier: Notifier,
        events: mpsc::UnboundedSender<MonitorEvent>,
        stats_interval: Duration,
        stall_threshold: Duration,
    ) -> Self {
        Self {
            notifier,
            events,
            stats_interval,
            stall_threshold,
            watch: Arc::new(Mutex::new(Watch::new())),
            task: Mutex::new(None),
        }
    }

    /// Beginnt die Überwachung einer neuen Peer Connection
    pub fn attach(&self, call_id: CallId, peer: Arc<dyn PeerConnection>) {
        self.detach();
        *self.watch.lock() = Watch::new();

        let rx = peer.subscribe();
        let run = MonitorRun {
            call_id,
            peer,
            notifier: self.notifier.clone(),
            events: self.events.clone(),
            watch: Arc::clone(&self.watch),
            stall_threshold: self.stall_threshold,
        };
        let handle = tokio::spawn(run.run(rx, self.stats_interval));
        *self.task.lock() = Some(handle);
    }

    pub fn detach(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub fn is_attached(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.watch.lock().stats.clone()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.detach();
    }
}

struct MonitorRun {
    call_id: CallId,
    peer: Arc<dyn PeerConnection>,
    notifier: Notifier,
    events: mpsc::UnboundedSender<MonitorEvent>,
    watch: Arc<Mutex<Watch>>,
    stall_threshold: Duration,
}

impl MonitorRun {
    async fn run(self, mut rx: broadcast::Receiver<PeerEvent>, stats_interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + stats_interval, stats_interval);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => self.on_peer_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Connection monitor lagged behind by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.sample().await,
            }
        }
    }

    fn emit(&self, kind: MonitorEventKind) {
        let _ = self.events.send(MonitorEvent {
            call_id: self.call_id.clone(),
            kind,
        });
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(_) => {
                let mut watch = self.watch.lock();
                watch.stats.local_candidates += 1;
                watch.touch();
            }
            PeerEvent::IceGatheringState(state) => {
                let no_paths = {
                    let mut watch = self.watch.lock();
                    watch.stats.ice_gathering_state = state;
                    watch.touch();
                    let no_paths = state == IceGatheringState::Complete
                        && watch.stats.local_candidates == 0
                        && !watch.paths_reported;
                    if no_paths {
                        watch.paths_reported = true;
                    }
                    no_paths
                };
                if no_paths {
                    self.notifier.error(
                        NoticeKind::NoConnectionPaths,
                        "No network paths found. Check your network connection.",
                    );
                }
            }
            PeerEvent::IceConnectionState(state) => {
                {
                    let mut watch = self.watch.lock();
                    watch.stats.ice_connection_state = state;
                    watch.touch();
                }
                self.on_ice_state(state).await;
            }
            PeerEvent::ConnectionState(state) => {
                let restored = {
                    let mut watch = self.watch.lock();
                    watch.stats.connection_state = state;
                    watch.touch();
                    let restored = state == PeerConnectionState::Connected && watch.was_disconnected;
                    match state {
                        PeerConnectionState::Connected => watch.was_disconnected = false,
                        PeerConnectionState::Disconnected => watch.was_disconnected = true,
                        _ => {}
                    }
                    restored
                };
                tracing::info!("Call {} connection state: {:?}", self.call_id, state);

                match state {
                    PeerConnectionState::Connected => {
                        if restored {
                            self.notifier
                                .info(NoticeKind::ConnectionRestored, "Connection restored");
                        }
                        self.emit(MonitorEventKind::Connected);
                    }
                    PeerConnectionState::Disconnected => self.emit(MonitorEventKind::Disconnected),
                    PeerConnectionState::Failed => self.emit(MonitorEventKind::Failed),
                    PeerConnectionState::Closed => self.emit(MonitorEventKind::Closed),
                    _ => {}
                }
            }
            PeerEvent::SignalingState(state) => {
                let mut watch = self.watch.lock();
                watch.stats.signaling_state = state;
                watch.touch();
            }
        }
    }

    /// Läuft im Monitor-Task: `detach()` bricht auch eine laufende
    /// Stats-Abfrage ab
    async fn on_ice_state(&self, state: IceConnectionState) {
        tracing::debug!("Call {} ICE state: {:?}", self.call_id, state);
        match state {
            IceConnectionState::Failed => {
                let blocked = self
                    .peer
                    .get_stats()
                    .await
                    .map(|s| s.has_failed_pairs())
                    .unwrap_or(false);
                if blocked {
                    self.notifier.error(
                        NoticeKind::NetworkBlocked,
                        "Network appears to block the connection. Try another network.",
                    );
                } else {
                    self.notifier
                        .warn(NoticeKind::ConnectionFailed, "Connection failed");
                }
            }
            IceConnectionState::Disconnected => {
                self.notifier
                    .warn(NoticeKind::Reconnecting, "Connection interrupted, reconnecting...");
            }
            _ => {}
        }
    }

    async fn sample(&self) {
        match self.peer.get_stats().await {
            Ok(report) => {
                let mut watch = self.watch.lock();
                let rtt = report.round_trip_time();
                watch.stats.local_candidates = watch.stats.local_candidates.max(report.local_candidates);
                watch.stats.remote_candidates = report.remote_candidates;
                watch.stats.round_trip_time = rtt;
                watch.stats.quality = ConnectionQuality::from_rtt(rtt);
            }
            Err(e) => tracing::debug!("Stats collection failed: {}", e),
        }
        self.check_stall();
    }

    fn check_stall(&self) {
        let stalled = {
            let mut watch = self.watch.lock();
            let pending = matches!(
                watch.stats.connection_state,
                PeerConnectionState::New | PeerConnectionState::Connecting
            );
            let stalled = pending
                && !watch.stall_reported
                && watch.idle_since.elapsed() >= self.stall_threshold;
            if stalled {
                watch.stall_reported = true;
            }
            stalled
        };

        if stalled {
            tracing::warn!("Call {} made no connection progress", self.call_id);
            self.notifier
                .warn(NoticeKind::ConnectionStalled, "Connection is taking longer than usual");
        }
    }
}
