//! Call State Machine
//!
//! Einzige Instanz, die den aktuellen Anruf verändert. Lokale Aktionen
//! (start/accept/reject/end) und Ereignisse von Transport, Signal Queue,
//! Connection Monitor und Media Control laufen hier zusammen und werden
//! als Übergänge der Tabelle in [`CallStatus::next`] ausgeführt.
//!
//! Entfernte Seiteneffekte (Status an die Gegenseite) werden nur nach
//! einem erfolgreichen Übergang ausgelöst und damit genau einmal.

use super::media::{MediaControl, MediaDevices, MediaError, MediaEvent};
use super::monitor::{ConnectionMonitor, ConnectionStats, MonitorEvent, MonitorEventKind};
use super::peer::{PeerConnection, PeerError, PeerEvent, PeerFactory};
use super::state::{
    CallAttempt, CallDirection, CallReader, CallStatus, CallStore, CallTrigger, Transition,
};
use super::timers::{CallTimers, TimerKind};
use crate::config::CallConfig;
use crate::credentials::CredentialProvider;
use crate::notify::{NoticeKind, Notifier};
use crate::signaling::{
    CallId, CallTransport, QueueEvent, RemoteStatus, SignalEnvelope, SignalKind, SignalQueue,
    SignalingError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Invalid transition: {trigger:?} in state {from}")]
    InvalidTransition { from: CallStatus, trigger: CallTrigger },

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("WebRTC error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// EVENTS & COLLABORATORS
// ============================================================================

/// Events der State Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged {
        call_id: CallId,
        from: CallStatus,
        to: CallStatus,
    },
    /// Anzeigename wurde nachgeladen
    PeerResolved { call_id: CallId, display_name: String },
}

/// Auflösung von Benutzer-IDs zu Anzeigenamen
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn resolve_display_name(&self, user_id: &str) -> anyhow::Result<String>;
}

/// Ablage für beendete Anrufe
pub trait CallHistory: Send + Sync {
    fn record(&self, call: &CallAttempt) -> anyhow::Result<()>;
}

/// Alle Abhängigkeiten der State Machine
pub struct CallDeps {
    pub transport: Arc<dyn CallTransport>,
    pub credentials: Arc<CredentialProvider>,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub profiles: Arc<dyn ProfileLookup>,
    pub history: Option<Arc<dyn CallHistory>>,
    pub notifier: Notifier,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ressourcen eines laufenden Anrufs
struct CallSession {
    call_id: CallId,
    peer_id: String,
    queue: SignalQueue,
    peer: Option<Arc<dyn PeerConnection>>,
    forwarder: Option<JoinHandle<()>>,
}

/// Einladung, die während der Reset-Verzögerung ankam
struct DeferredInvite {
    call_id: CallId,
    from_peer_id: String,
    video: bool,
    signals: Vec<SignalEnvelope>,
}

// ============================================================================
// CALL STATE MACHINE
// ============================================================================

struct Inner {
    config: CallConfig,
    transport: Arc<dyn CallTransport>,
    credentials: Arc<CredentialProvider>,
    peers: Arc<dyn PeerFactory>,
    profiles: Arc<dyn ProfileLookup>,
    history: Option<Arc<dyn CallHistory>>,
    notifier: Notifier,

    store: CallStore,
    timers: CallTimers,
    media: MediaControl,
    monitor: ConnectionMonitor,
    session: Mutex<Option<CallSession>>,
    deferred: Mutex<Option<DeferredInvite>>,

    events: broadcast::Sender<CallEvent>,
    queue_events: mpsc::UnboundedSender<QueueEvent>,
}

pub struct CallStateMachine {
    inner: Arc<Inner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl CallStateMachine {
    /// Erstellt die State Machine und startet die Event-Schleife
    pub fn spawn(config: CallConfig, deps: CallDeps) -> Self {
        let (events, _) = broadcast::channel(100);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let monitor = ConnectionMonitor::new(
            deps.notifier.clone(),
            monitor_tx,
            config.stats_interval,
            config.stall_threshold,
        );
        let transport_rx = deps.transport.subscribe();

        let inner = Arc::new(Inner {
            config,
            transport: deps.transport,
            credentials: deps.credentials,
            peers: deps.peers,
            profiles: deps.profiles,
            history: deps.history,
            notifier: deps.notifier,
            store: CallStore::new(),
            timers: CallTimers::new(),
            media: MediaControl::new(deps.devices, media_tx),
            monitor,
            session: Mutex::new(None),
            deferred: Mutex::new(None),
            events,
            queue_events: queue_tx,
        });

        let event_loop = tokio::spawn(run_event_loop(
            Arc::downgrade(&inner),
            transport_rx,
            queue_rx,
            monitor_rx,
            media_rx,
        ));

        Self {
            inner,
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn reader(&self) -> CallReader {
        self.inner.store.reader()
    }

    pub fn current(&self) -> Option<CallAttempt> {
        self.inner.store.snapshot()
    }

    pub fn status(&self) -> CallStatus {
        self.inner.store.reader().status()
    }

    /// Aktuelle Verbindungswerte für das Diagnose-Overlay
    pub fn diagnostics(&self) -> ConnectionStats {
        self.inner.monitor.stats()
    }

    /// Laufende Timer (Diagnose)
    pub fn pending_timers(&self) -> Vec<TimerKind> {
        self.inner.timers.armed().into_iter().map(|(k, _)| k).collect()
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Während der Reset-Verzögerung eines beendeten Anrufs wird gewartet,
    /// bei einem aktiven Anruf schlägt der Aufruf fehl.
    pub async fn start_call(&self, peer_id: &str, video: bool) -> Result<CallId, CallError> {
        let inner = &self.inner;

        let mut reader = inner.store.reader();
        if reader.status().is_terminal() {
            tracing::debug!("Waiting for previous call to reset");
            reader.wait_for_idle().await;
        }
        if reader.status().is_active() {
            return Err(CallError::AlreadyInCall);
        }

        if let Err(e) = inner.media.acquire(video).await {
            inner.report_media_error(&e);
            return Err(e.into());
        }

        let call_id = CallId::generate();
        let attempt = CallAttempt::new(call_id.clone(), CallDirection::Outgoing, peer_id, video);
        let Some(transition) = inner.store.begin(attempt, CallTrigger::Start) else {
            inner.media.release();
            return Err(CallError::AlreadyInCall);
        };

        inner.open_session(&call_id, peer_id);
        inner.after_transition(&transition, CallTrigger::Start);
        inner.resolve_display_name(&call_id, peer_id);

        if let Err(e) = inner.dial(&call_id, peer_id, video).await {
            tracing::error!("Failed to start call {}: {}", call_id, e);
            inner.fail(&call_id, &e.to_string()).await;
            return Err(e);
        }

        Ok(call_id)
    }

    /// Nimmt den klingelnden eingehenden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let call = inner.store.snapshot().ok_or(CallError::NoActiveCall)?;
        if call.direction != CallDirection::Incoming || call.status != CallStatus::Ringing {
            return Err(CallError::InvalidTransition {
                from: call.status,
                trigger: CallTrigger::Accept,
            });
        }

        if let Err(e) = inner.media.acquire(call.video).await {
            inner.report_media_error(&e);
            let reason = e.to_string();
            if let Some(t) = inner.transition(&call.id, CallTrigger::TransportError, Some(&reason)) {
                inner
                    .send_status(&t.attempt, RemoteStatus::Rejected, Some("Media unavailable"))
                    .await;
            }
            return Err(e.into());
        }

        let Some(t) = inner.transition(&call.id, CallTrigger::Accept, None) else {
            inner.media.release();
            return Err(CallError::InvalidTransition {
                from: inner.store.reader().status(),
                trigger: CallTrigger::Accept,
            });
        };
        inner.send_status(&t.attempt, RemoteStatus::Accepted, None).await;

        // Das Offer liegt bereits in der Queue; das Answer entsteht sobald
        // es angewendet wurde
        if let Err(e) = inner.connect_peer(&call.id).await {
            tracing::error!("Failed to connect call {}: {}", call.id, e);
            inner.fail(&call.id, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Lehnt den klingelnden eingehenden Anruf ab
    pub async fn reject(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let call = inner.store.snapshot().ok_or(CallError::NoActiveCall)?;
        if call.direction != CallDirection::Incoming {
            return Err(CallError::InvalidTransition {
                from: call.status,
                trigger: CallTrigger::Reject,
            });
        }
        let t = inner
            .transition(&call.id, CallTrigger::Reject, Some("Declined"))
            .ok_or(CallError::InvalidTransition {
                from: call.status,
                trigger: CallTrigger::Reject,
            })?;
        inner.send_status(&t.attempt, RemoteStatus::Rejected, None).await;
        Ok(())
    }

    /// Beendet den aktuellen Anruf (oder bricht einen ausgehenden ab)
    pub async fn end(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let call = inner.store.snapshot().ok_or(CallError::NoActiveCall)?;
        if !call.status.is_active() {
            return Err(CallError::NoActiveCall);
        }

        // Klingelnder eingehender Anruf: Auflegen heißt Ablehnen
        if call.direction == CallDirection::Incoming && call.status == CallStatus::Ringing {
            return self.reject().await;
        }

        let t = inner
            .transition(&call.id, CallTrigger::LocalEnd, None)
            .ok_or(CallError::InvalidTransition {
                from: call.status,
                trigger: CallTrigger::LocalEnd,
            })?;
        let status = match t.to {
            CallStatus::Canceled => RemoteStatus::Canceled,
            _ => RemoteStatus::Ended,
        };
        inner.send_status(&t.attempt, status, None).await;
        Ok(())
    }

    /// Mikrofon an/aus, gibt zurück ob Audio jetzt aktiv ist
    pub fn toggle_audio(&self) -> Result<bool, CallError> {
        let call_id = self.inner.active_call_id()?;
        let enabled = self.inner.media.toggle_audio();
        self.inner.store.update(&call_id, |c| c.is_muted = !enabled);
        Ok(enabled)
    }

    /// Kamera an/aus, gibt zurück ob Video jetzt aktiv ist
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let call_id = self.inner.active_call_id()?;
        let enabled = self.inner.media.toggle_video();
        self.inner.store.update(&call_id, |c| c.is_video_enabled = enabled);
        Ok(enabled)
    }

    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        let call_id = self.inner.active_call_id()?;
        let sharing = match self.inner.media.toggle_screen_share().await {
            Ok(sharing) => sharing,
            Err(e) => {
                self.inner.report_media_error(&e);
                return Err(e.into());
            }
        };
        self.inner.store.update(&call_id, |c| c.is_screen_sharing = sharing);
        Ok(sharing)
    }

    /// Beendet einen laufenden Anruf und stoppt alle Hintergrund-Tasks
    pub async fn shutdown(&self) {
        if self.status().is_active() {
            if let Err(e) = self.end().await {
                tracing::warn!("Failed to end call during shutdown: {}", e);
            }
        }
        self.inner.timers.cancel_all();
        self.inner.teardown_session(None);
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CallStateMachine {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        self.inner.timers.cancel_all();
    }
}

impl std::fmt::Debug for CallStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStateMachine")
            .field("status", &self.status())
            .field("timers", &self.pending_timers())
            .finish()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

enum LoopEvent {
    Transport(TransportEvent),
    Queue(QueueEvent),
    Monitor(MonitorEvent),
    Media(MediaEvent),
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut transport: broadcast::Receiver<TransportEvent>,
    mut queue: mpsc::UnboundedReceiver<QueueEvent>,
    mut monitor: mpsc::UnboundedReceiver<MonitorEvent>,
    mut media: mpsc::UnboundedReceiver<MediaEvent>,
) {
    loop {
        let event = tokio::select! {
            event = transport.recv() => match event {
                Ok(event) => LoopEvent::Transport(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Call event loop lagged behind by {} transport events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Some(event) = queue.recv() => LoopEvent::Queue(event),
            Some(event) = monitor.recv() => LoopEvent::Monitor(event),
            Some(event) = media.recv() => LoopEvent::Media(event),
            else => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            LoopEvent::Transport(event) => inner.on_transport_event(event).await,
            LoopEvent::Queue(event) => inner.on_queue_event(event).await,
            LoopEvent::Monitor(event) => inner.on_monitor_event(event).await,
            LoopEvent::Media(event) => inner.on_media_event(event),
        }
    }
    tracing::debug!("Call event loop stopped");
}

impl Inner {
    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    fn transition(
        self: &Arc<Self>,
        call_id: &CallId,
        trigger: CallTrigger,
        reason: Option<&str>,
    ) -> Option<Transition> {
        let transition = self.store.transition(call_id, trigger, reason);
        match &transition {
            Some(t) => self.after_transition(t, trigger),
            None => tracing::debug!("Ignoring {:?} for call {}", trigger, call_id),
        }
        transition
    }

    /// Lokale Folgen eines Übergangs: Timer, Aufräumen, Hinweise
    fn after_transition(self: &Arc<Self>, t: &Transition, trigger: CallTrigger) {
        let call = &t.attempt;
        tracing::info!(call_id = %call.id, "Call {} -> {}", t.from, t.to);
        let _ = self.events.send(CallEvent::StateChanged {
            call_id: call.id.clone(),
            from: t.from,
            to: t.to,
        });

        match t.to {
            CallStatus::Connecting => {
                self.arm_ring_timer(TimerKind::OutgoingRing, &call.id);
            }
            CallStatus::Ringing if call.direction == CallDirection::Incoming => {
                self.arm_ring_timer(TimerKind::IncomingRing, &call.id);
            }
            CallStatus::InProgress => {
                self.timers.cancel(TimerKind::IncomingRing);
                self.timers.cancel(TimerKind::OutgoingRing);
                self.notifier.info(
                    NoticeKind::CallStarted,
                    format!("Call with {} started", call.peer_display_name),
                );
            }
            status if status.is_terminal() => {
                self.timers.cancel_call(&call.id);
                self.teardown_session(Some(&call.id));
                self.notify_ended(call, trigger);
                self.record_history(call);

                let weak = Arc::downgrade(self);
                let call_id = call.id.clone();
                self.timers.arm(
                    TimerKind::ResetGrace,
                    &call.id,
                    self.config.reset_grace,
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.reset(&call_id).await;
                        }
                    },
                );
            }
            _ => {}
        }
    }

    fn arm_ring_timer(self: &Arc<Self>, kind: TimerKind, call_id: &CallId) {
        let after = match kind {
            TimerKind::IncomingRing => self.config.incoming_ring_timeout,
            _ => self.config.outgoing_ring_timeout,
        };
        let weak = Arc::downgrade(self);
        let id = call_id.clone();
        self.timers.arm(kind, call_id, after, async move {
            if let Some(inner) = weak.upgrade() {
                inner.ring_timeout(&id).await;
            }
        });
    }

    async fn ring_timeout(self: &Arc<Self>, call_id: &CallId) {
        let Some(call) = self.store.snapshot().filter(|c| &c.id == call_id) else {
            return;
        };

        match call.direction {
            CallDirection::Incoming => {
                tracing::info!("Incoming call {} was not answered", call_id);
                if let Some(t) = self.transition(call_id, CallTrigger::Timeout, Some("Not answered")) {
                    self.send_status(&t.attempt, RemoteStatus::Timeout, None).await;
                }
            }
            CallDirection::Outgoing => {
                tracing::info!("Outgoing call {} was not answered", call_id);
                if let Some(t) =
                    self.transition(call_id, CallTrigger::Timeout, Some("Recipient did not answer"))
                {
                    self.send_status(&t.attempt, RemoteStatus::Canceled, None).await;
                }
            }
        }
    }

    async fn reset(self: &Arc<Self>, call_id: &CallId) {
        if let Some(t) = self.store.transition(call_id, CallTrigger::Reset, None) {
            self.store.clear(call_id);
            tracing::debug!("Call {} reset to idle", call_id);
            let _ = self.events.send(CallEvent::StateChanged {
                call_id: call_id.clone(),
                from: t.from,
                to: t.to,
            });
        }

        let deferred = self.deferred.lock().take();
        if let Some(invite) = deferred {
            tracing::info!("Presenting deferred invite {}", invite.call_id);
            self.on_invite(invite.call_id.clone(), invite.from_peer_id, invite.video)
                .await;
            let session = self.session.lock();
            if let Some(session) = session.as_ref().filter(|s| s.call_id == invite.call_id) {
                for signal in invite.signals {
                    session.queue.enqueue(signal);
                }
            }
        }
    }

    async fn fail(self: &Arc<Self>, call_id: &CallId, reason: &str) {
        if let Some(t) = self.transition(call_id, CallTrigger::TransportError, Some(reason)) {
            self.send_status(&t.attempt, RemoteStatus::Ended, Some(reason)).await;
        }
    }

    fn active_call_id(&self) -> Result<CallId, CallError> {
        self.store
            .snapshot()
            .filter(|c| c.status.is_active())
            .map(|c| c.id)
            .ok_or(CallError::NoActiveCall)
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    fn open_session(&self, call_id: &CallId, peer_id: &str) {
        let queue = SignalQueue::new(
            call_id.clone(),
            self.config.signal_retry_delay,
            self.queue_events.clone(),
        );
        let previous = self.session.lock().replace(CallSession {
            call_id: call_id.clone(),
            peer_id: peer_id.to_string(),
            queue,
            peer: None,
            forwarder: None,
        });
        if let Some(previous) = previous {
            tracing::warn!("Replacing stale session {}", previous.call_id);
            Self::close_session(previous);
        }
    }

    /// Baut die Peer Connection auf und verbindet Queue, Monitor und Media
    async fn connect_peer(&self, call_id: &CallId) -> Result<Arc<dyn PeerConnection>, CallError> {
        let ice_servers = self.credentials.get_ice_servers(false).await;
        let peer = self.peers.create(ice_servers).await?;

        let attached = {
            let mut session = self.session.lock();
            match session.as_mut().filter(|s| &s.call_id == call_id) {
                Some(session) => {
                    session.peer = Some(Arc::clone(&peer));
                    session.forwarder = Some(self.spawn_candidate_forwarder(
                        call_id,
                        &session.peer_id,
                        &peer,
                    ));
                    true
                }
                None => false,
            }
        };
        if !attached {
            // Anruf wurde inzwischen beendet
            let _ = peer.close().await;
            return Err(CallError::NoActiveCall);
        }

        self.monitor.attach(call_id.clone(), Arc::clone(&peer));
        self.media.attach(Arc::clone(&peer));
        self.media.publish_tracks().await?;

        if let Some(session) = self.session.lock().as_ref().filter(|s| &s.call_id == call_id) {
            session.queue.attach(Arc::clone(&peer));
        }
        Ok(peer)
    }

    /// Ausgehender Anruf: Peer Connection, Einladung, Offer
    async fn dial(&self, call_id: &CallId, peer_id: &str, video: bool) -> Result<(), CallError> {
        let peer = self.connect_peer(call_id).await?;
        let offer = peer.create_offer().await?;
        self.transport.invite(call_id, peer_id, video).await?;
        self.transport
            .publish(call_id, peer_id, SignalEnvelope::offer(offer))
            .await?;
        Ok(())
    }

    /// Leitet lokal gesammelte ICE Candidates an die Gegenseite weiter
    fn spawn_candidate_forwarder(
        &self,
        call_id: &CallId,
        peer_id: &str,
        peer: &Arc<dyn PeerConnection>,
    ) -> JoinHandle<()> {
        let mut rx = peer.subscribe();
        let transport = Arc::clone(&self.transport);
        let call_id = call_id.clone();
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PeerEvent::LocalCandidate(candidate)) => {
                        let signal = SignalEnvelope::ice_candidate(candidate);
                        if let Err(e) = transport.publish(&call_id, &peer_id, signal).await {
                            tracing::warn!("Failed to publish ICE candidate: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {} local peer events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Monitor und Queue zuerst lösen, dann die Peer Connection schließen
    fn teardown_session(&self, call_id: Option<&CallId>) {
        let session = {
            let mut session = self.session.lock();
            match (session.as_ref(), call_id) {
                (Some(s), Some(id)) if &s.call_id != id => None,
                _ => session.take(),
            }
        };

        self.monitor.detach();
        self.media.release();
        if let Some(session) = session {
            Self::close_session(session);
        }
    }

    fn close_session(session: CallSession) {
        session.queue.close();
        if let Some(forwarder) = session.forwarder {
            forwarder.abort();
        }
        if let Some(peer) = session.peer {
            let call_id = session.call_id;
            tokio::spawn(async move {
                if let Err(e) = peer.close().await {
                    tracing::warn!("Failed to close peer connection for {}: {}", call_id, e);
                }
            });
        }
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Invite {
                call_id,
                from_peer_id,
                video,
            } => self.on_invite(call_id, from_peer_id, video).await,
            TransportEvent::Signal { call_id, signal, .. } => self.on_signal(&call_id, signal),
            TransportEvent::Status {
                call_id,
                status,
                reason,
                ..
            } => self.on_remote_status(&call_id, status, reason).await,
            TransportEvent::Connected => tracing::debug!("Signaling transport connected"),
            TransportEvent::Disconnected => tracing::debug!("Signaling transport disconnected"),
            TransportEvent::Error { code, message } => {
                tracing::warn!("Signaling error {}: {}", code, message);
            }
        }
    }

    async fn on_invite(self: &Arc<Self>, call_id: CallId, from_peer_id: String, video: bool) {
        let current = self.store.snapshot();

        if let Some(call) = current.as_ref() {
            // Doppelt zugestellt
            if call.id == call_id {
                return;
            }

            if call.status.is_terminal() {
                let mut deferred = self.deferred.lock();
                match deferred.as_ref() {
                    Some(d) if d.call_id == call_id => return,
                    None => {
                        tracing::info!("Deferring invite {} until reset", call_id);
                        *deferred = Some(DeferredInvite {
                            call_id,
                            from_peer_id,
                            video,
                            signals: Vec::new(),
                        });
                        return;
                    }
                    Some(_) => {}
                }
            }

            if call.status != CallStatus::Idle {
                self.reject_busy(&call_id, &from_peer_id).await;
                return;
            }
        }

        let attempt = CallAttempt::new(call_id.clone(), CallDirection::Incoming, &from_peer_id, video);
        let Some(t) = self.store.begin(attempt, CallTrigger::IncomingInvite) else {
            self.reject_busy(&call_id, &from_peer_id).await;
            return;
        };

        self.open_session(&call_id, &from_peer_id);
        self.after_transition(&t, CallTrigger::IncomingInvite);
        self.resolve_display_name(&call_id, &from_peer_id);
        self.send_status(&t.attempt, RemoteStatus::Ringing, None).await;
    }

    /// Zweiter Anruf während eines aktiven Anrufs
    async fn reject_busy(&self, call_id: &CallId, from_peer_id: &str) {
        tracing::info!("Rejecting call {} from {}: busy", call_id, from_peer_id);
        if let Err(e) = self
            .transport
            .update_status(call_id, from_peer_id, RemoteStatus::Busy, None)
            .await
        {
            tracing::warn!("Failed to send busy status: {}", e);
        }
        self.notifier.info(
            NoticeKind::MissedCall,
            format!("Missed call from {}", from_peer_id),
        );
    }

    fn on_signal(&self, call_id: &CallId, signal: SignalEnvelope) {
        if let Some(session) = self.session.lock().as_ref().filter(|s| &s.call_id == call_id) {
            session.queue.enqueue(signal);
            return;
        }

        if let Some(invite) = self.deferred.lock().as_mut().filter(|d| &d.call_id == call_id) {
            invite.signals.push(signal);
            return;
        }

        tracing::debug!("Dropping {:?} for inactive call {}", signal.kind, call_id);
    }

    async fn on_remote_status(
        self: &Arc<Self>,
        call_id: &CallId,
        status: RemoteStatus,
        reason: Option<String>,
    ) {
        // Anrufer hat aufgegeben bevor die Einladung angezeigt wurde
        if matches!(status, RemoteStatus::Canceled | RemoteStatus::Ended) {
            let mut deferred = self.deferred.lock();
            if deferred.as_ref().is_some_and(|d| &d.call_id == call_id) {
                *deferred = None;
                return;
            }
        }

        let trigger = match status {
            RemoteStatus::Ringing => CallTrigger::RemoteRinging,
            RemoteStatus::Accepted => CallTrigger::Accept,
            RemoteStatus::Rejected => CallTrigger::Reject,
            RemoteStatus::Busy => CallTrigger::RemoteBusy,
            RemoteStatus::Timeout => CallTrigger::RemoteTimeout,
            RemoteStatus::Canceled | RemoteStatus::Ended => CallTrigger::RemoteHangup,
        };
        let reason = reason.or_else(|| match status {
            RemoteStatus::Rejected => Some("Call declined".to_string()),
            RemoteStatus::Timeout => Some("Recipient did not answer".to_string()),
            _ => None,
        });

        // Nur ausgehende Anrufe werden von der Gegenseite angenommen
        if trigger == CallTrigger::Accept
            && !self.store.snapshot().is_some_and(|c| c.is_outgoing())
        {
            return;
        }

        self.transition(call_id, trigger, reason.as_deref());
    }

    // ========================================================================
    // QUEUE / MONITOR / MEDIA EVENTS
    // ========================================================================

    async fn on_queue_event(self: &Arc<Self>, event: QueueEvent) {
        let QueueEvent::Applied { call_id, kind } = event;
        if kind != SignalKind::Offer {
            return;
        }

        let target = self
            .session
            .lock()
            .as_ref()
            .filter(|s| s.call_id == call_id)
            .and_then(|s| s.peer.clone().map(|p| (p, s.peer_id.clone())));
        let Some((peer, peer_id)) = target else {
            return;
        };

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!("Failed to create answer for {}: {}", call_id, e);
                self.fail(&call_id, "Negotiation failed").await;
                return;
            }
        };
        if let Err(e) = self
            .transport
            .publish(&call_id, &peer_id, SignalEnvelope::answer(answer))
            .await
        {
            tracing::warn!("Failed to publish answer for {}: {}", call_id, e);
        }
    }

    async fn on_monitor_event(self: &Arc<Self>, event: MonitorEvent) {
        match event.kind {
            MonitorEventKind::Connected => {
                // Medien fließen: ausgehender Anruf gilt als angenommen
                let pending_outgoing = self
                    .store
                    .snapshot()
                    .is_some_and(|c| c.id == event.call_id && c.is_outgoing() && !c.status.is_terminal());
                if pending_outgoing {
                    self.transition(&event.call_id, CallTrigger::Accept, None);
                }
            }
            MonitorEventKind::Failed => {
                self.fail(&event.call_id, "Connection failed").await;
            }
            MonitorEventKind::Disconnected | MonitorEventKind::Closed => {}
        }
    }

    fn on_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::ScreenShareEnded { camera_restored } => {
                tracing::debug!("Screen share ended, camera restored: {}", camera_restored);
                if let Ok(call_id) = self.active_call_id() {
                    self.store.update(&call_id, |c| c.is_screen_sharing = false);
                }
            }
        }
    }

    // ========================================================================
    // SIDE EFFECTS
    // ========================================================================

    async fn send_status(&self, call: &CallAttempt, status: RemoteStatus, reason: Option<&str>) {
        if let Err(e) = self
            .transport
            .update_status(&call.id, &call.peer_id, status, reason.map(str::to_string))
            .await
        {
            tracing::warn!("Failed to send {:?} for call {}: {}", status, call.id, e);
        }
    }

    fn resolve_display_name(self: &Arc<Self>, call_id: &CallId, peer_id: &str) {
        let weak = Arc::downgrade(self);
        let call_id = call_id.clone();
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let name = match inner.profiles.resolve_display_name(&peer_id).await {
                Ok(name) if !name.is_empty() => name,
                Ok(_) => return,
                Err(e) => {
                    tracing::debug!("Profile lookup for {} failed: {:#}", peer_id, e);
                    return;
                }
            };

            let updated = inner
                .store
                .update(&call_id, |c| c.peer_display_name = name.clone());
            if updated {
                let _ = inner.events.send(CallEvent::PeerResolved {
                    call_id,
                    display_name: name,
                });
            }
        });
    }

    fn report_media_error(&self, error: &MediaError) {
        match error {
            MediaError::PermissionDenied(_) => self.notifier.error(
                NoticeKind::PermissionDenied,
                "Camera or microphone access denied. Allow access and try again.",
            ),
            other => self
                .notifier
                .error(NoticeKind::CallFailed, format!("Media error: {}", other)),
        }
    }

    fn notify_ended(&self, call: &CallAttempt, trigger: CallTrigger) {
        let name = &call.peer_display_name;
        let incoming = call.direction == CallDirection::Incoming;

        match call.status {
            CallStatus::Completed if call.answered_at.is_some() => {
                self.notifier.info(NoticeKind::CallEnded, "Call ended");
            }
            CallStatus::Completed if incoming && trigger == CallTrigger::RemoteHangup => {
                self.notifier
                    .info(NoticeKind::MissedCall, format!("Missed call from {}", name));
            }
            CallStatus::Completed => {
                self.notifier.info(NoticeKind::CallEnded, "Call declined");
            }
            CallStatus::NoAnswer if incoming => {
                self.notifier
                    .info(NoticeKind::MissedCall, format!("Missed call from {}", name));
            }
            CallStatus::NoAnswer => {
                self.notifier
                    .warn(NoticeKind::NoAnswer, format!("{} did not answer", name));
            }
            CallStatus::Busy => {
                self.notifier.warn(NoticeKind::Busy, format!("{} is busy", name));
            }
            CallStatus::Canceled => {
                let reason = call.end_reason.as_deref().unwrap_or("Call canceled");
                self.notifier.info(NoticeKind::CallCanceled, reason);
            }
            CallStatus::Failed => {
                let reason = call.end_reason.as_deref().unwrap_or("unknown error");
                self.notifier
                    .error(NoticeKind::CallFailed, format!("Call failed: {}", reason));
            }
            _ => {}
        }
    }

    fn record_history(&self, call: &CallAttempt) {
        if let Some(history) = &self.history {
            if let Err(e) = history.record(call) {
                tracing::warn!("Failed to record call {}: {:#}", call.id, e);
            }
        }
    }
}
