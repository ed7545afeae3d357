//! In-Memory Doubles für alle externen Schnittstellen (nur Tests)

use crate::call_engine::{
    CallAttempt, CallHistory, LocalTrack, MediaDevices, MediaError, PeerConnection, PeerError,
    PeerEvent, PeerFactory, PeerStats, ProfileLookup, SdpKind, TrackKind, TrackSource,
};
use crate::credentials::{AuthSession, CredentialService, IceServer};
use crate::signaling::{
    CallId, CallTransport, RemoteStatus, SignalEnvelope, SignalKind, SignalingError,
    TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Lässt alle bereiten Tasks laufen, ohne die (pausierte) Zeit zu bewegen
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Nimmt einen Zähler um eins zurück, solange er > 0 ist
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// AUTH & CREDENTIALS
// ============================================================================

pub struct MockAuth {
    signed_in: bool,
    refreshes: AtomicUsize,
}

impl MockAuth {
    pub fn signed_in() -> Self {
        Self {
            signed_in: true,
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            signed_in: false,
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthSession for MockAuth {
    fn has_session(&self) -> bool {
        self.signed_in
    }

    fn access_token(&self) -> Option<String> {
        self.signed_in.then(|| "test-token".to_string())
    }

    async fn refresh(&self) -> anyhow::Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.signed_in {
            Ok(())
        } else {
            anyhow::bail!("no session")
        }
    }
}

pub struct MockCredentials {
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl MockCredentials {
    pub fn working() -> Self {
        Self::failing_times(0)
    }

    pub fn failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn servers() -> Vec<IceServer> {
        vec![IceServer {
            urls: vec!["turn:turn.test:3478".to_string()],
            username: Some("user".to_string()),
            credential: Some("secret".to_string()),
        }]
    }
}

#[async_trait]
impl CredentialService for MockCredentials {
    async fn fetch_ice_servers(&self) -> anyhow::Result<Vec<IceServer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            anyhow::bail!("credential service unavailable");
        }
        Ok(Self::servers())
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

pub struct MockPeer {
    events: broadcast::Sender<PeerEvent>,
    applied: Mutex<Vec<(SignalKind, String)>>,
    failures: AtomicUsize,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
    video_track: Mutex<Option<String>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    stats: Mutex<PeerStats>,
    stats_delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl MockPeer {
    /// Payload, den die Peer Connection als kaputt ablehnt
    pub const MALFORMED: &'static str = "malformed";

    pub fn new() -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            events,
            applied: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
            video_track: Mutex::new(None),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            stats: Mutex::new(PeerStats::default()),
            stats_delay: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Die nächsten `n` Anwendungen schlagen vorübergehend fehl
    pub fn fail_next_applies(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_stats(&self, stats: PeerStats) {
        *self.stats.lock() = stats;
    }

    /// `get_stats` antwortet erst nach `delay`
    pub fn delay_stats(&self, delay: Duration) {
        *self.stats_delay.lock() = Some(delay);
    }

    pub fn applied(&self) -> Vec<(SignalKind, String)> {
        self.applied.lock().clone()
    }

    pub fn added_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.tracks.lock().clone()
    }

    pub fn video_track_id(&self) -> Option<String> {
        self.video_track.lock().clone()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers_created(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn apply(&self, kind: SignalKind, payload: &str) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        if payload == Self::MALFORMED {
            return Err(PeerError::InvalidSignal("unparseable payload".to_string()));
        }
        if take_one(&self.failures) {
            return Err(PeerError::WebRTC("remote description not set".to_string()));
        }
        self.applied.lock().push((kind, payload.to_string()));
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let kind = match kind {
            SdpKind::Offer => SignalKind::Offer,
            SdpKind::Answer => SignalKind::Answer,
        };
        self.apply(kind, sdp)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), PeerError> {
        self.apply(SignalKind::IceCandidate, candidate)
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 offer {}", n))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 answer {}", n))
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        if track.kind() == TrackKind::Video {
            *self.video_track.lock() = Some(track.id().to_string());
        }
        self.tracks.lock().push(track);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), PeerError> {
        *self.video_track.lock() = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn get_stats(&self) -> Result<PeerStats, PeerError> {
        let delay = *self.stats_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.stats.lock().clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockPeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice_servers: Vec<IceServer>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(MockPeer::new());
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

pub struct MockDevices {
    denied: bool,
    screen_ends_immediately: bool,
    camera: Mutex<Option<Arc<LocalTrack>>>,
    screen: Mutex<Option<Arc<LocalTrack>>>,
}

impl MockDevices {
    pub fn new() -> Self {
        Self {
            denied: false,
            screen_ends_immediately: false,
            camera: Mutex::new(None),
            screen: Mutex::new(None),
        }
    }

    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::new()
        }
    }

    /// Bildschirmfreigabe, die schon beim Start beendet ist
    pub fn with_ending_screen() -> Self {
        Self {
            screen_ends_immediately: true,
            ..Self::new()
        }
    }

    pub fn last_camera_id(&self) -> Option<String> {
        self.camera.lock().as_ref().map(|t| t.id().to_string())
    }

    pub fn last_screen(&self) -> Option<Arc<LocalTrack>> {
        self.screen.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn get_user_media(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        if self.denied {
            return Err(MediaError::PermissionDenied("NotAllowedError".to_string()));
        }

        let mut tracks = Vec::new();
        if audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, TrackSource::Microphone));
        }
        if video {
            let camera = LocalTrack::new(TrackKind::Video, TrackSource::Camera);
            *self.camera.lock() = Some(Arc::clone(&camera));
            tracks.push(camera);
        }
        Ok(tracks)
    }

    async fn get_display_media(&self) -> Result<Arc<LocalTrack>, MediaError> {
        if self.denied {
            return Err(MediaError::PermissionDenied("NotAllowedError".to_string()));
        }
        let screen = LocalTrack::new(TrackKind::Video, TrackSource::Screen);
        if self.screen_ends_immediately {
            screen.stop();
        }
        *self.screen.lock() = Some(Arc::clone(&screen));
        Ok(screen)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct MockTransport {
    connected: AtomicBool,
    failures: AtomicUsize,
    connect_times: Mutex<Vec<Instant>>,
    probes: AtomicUsize,
    events: broadcast::Sender<TransportEvent>,
    invites: Mutex<Vec<(CallId, String, bool)>>,
    published: Mutex<Vec<(CallId, SignalEnvelope)>>,
    statuses: Mutex<Vec<(CallId, RemoteStatus)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            connected: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
            connect_times: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            events,
            invites: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
        }
    }

    pub fn offline() -> Self {
        let transport = Self::new();
        transport.connected.store(false, Ordering::SeqCst);
        transport
    }

    /// Die nächsten `n` Verbindungsversuche schlagen fehl
    pub fn fail_connects(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Verbindung bricht ab
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected);
    }

    /// Ereignis vom Server simulieren
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn invites(&self) -> Vec<(CallId, String, bool)> {
        self.invites.lock().clone()
    }

    pub fn published(&self) -> Vec<(CallId, SignalEnvelope)> {
        self.published.lock().clone()
    }

    pub fn statuses(&self) -> Vec<(CallId, RemoteStatus)> {
        self.statuses.lock().clone()
    }

    fn ensure_connected(&self) -> Result<(), SignalingError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SignalingError::NotConnected)
        }
    }
}

#[async_trait]
impl CallTransport for MockTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        self.connect_times.lock().push(Instant::now());
        if take_one(&self.failures) {
            return Err(SignalingError::ConnectionFailed("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<(), SignalingError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.ensure_connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn invite(
        &self,
        call_id: &CallId,
        to_peer_id: &str,
        video: bool,
    ) -> Result<(), SignalingError> {
        self.ensure_connected()?;
        self.invites
            .lock()
            .push((call_id.clone(), to_peer_id.to_string(), video));
        Ok(())
    }

    async fn publish(
        &self,
        call_id: &CallId,
        _to_peer_id: &str,
        signal: SignalEnvelope,
    ) -> Result<(), SignalingError> {
        self.ensure_connected()?;
        self.published.lock().push((call_id.clone(), signal));
        Ok(())
    }

    async fn update_status(
        &self,
        call_id: &CallId,
        _to_peer_id: &str,
        status: RemoteStatus,
        _reason: Option<String>,
    ) -> Result<(), SignalingError> {
        self.ensure_connected()?;
        self.statuses.lock().push((call_id.clone(), status));
        Ok(())
    }
}

// ============================================================================
// PROFILES & HISTORY
// ============================================================================

#[derive(Default)]
pub struct MockProfiles {
    names: HashMap<String, String>,
}

impl MockProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, user_id: &str, name: &str) -> Self {
        self.names.insert(user_id.to_string(), name.to_string());
        self
    }
}

#[async_trait]
impl ProfileLookup for MockProfiles {
    async fn resolve_display_name(&self, user_id: &str) -> anyhow::Result<String> {
        self.names
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown user {}", user_id))
    }
}

#[derive(Default)]
pub struct MockHistory {
    calls: Mutex<Vec<CallAttempt>>,
}

impl MockHistory {
    pub fn recorded(&self) -> Vec<CallAttempt> {
        self.calls.lock().clone()
    }
}

impl CallHistory for MockHistory {
    fn record(&self, call: &CallAttempt) -> anyhow::Result<()> {
        self.calls.lock().push(call.clone());
        Ok(())
    }
}
