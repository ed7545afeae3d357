//! Lokale Medien
//!
//! Mikrofon/Kamera an- und abschalten sowie Screen Sharing per Track-
//! Austausch auf der bestehenden Peer Connection (kein neues Offer/Answer).

use super::peer::{PeerConnection, PeerError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Kamera/Mikrofon verweigert: kein Retry, der Benutzer muss handeln
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("No active peer connection")]
    NoConnection,

    #[error("WebRTC error: {0}")]
    Peer(#[from] PeerError),
}

// ============================================================================
// TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// Ein lokaler Media-Track
#[derive(Debug)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source,
            enabled: AtomicBool::new(true),
            ended,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Beendet den Track. Wird auch vom Gerät/Browser ausgelöst, z.B. über
    /// die native "Freigabe beenden" Schaltfläche.
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Wartet auf das `ended` Event
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// Zugriff auf Kamera, Mikrofon und Bildschirmaufnahme
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError>;

    async fn get_display_media(&self) -> Result<Arc<LocalTrack>, MediaError>;
}

/// Meldungen an die State Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Screen Sharing endete ohne expliziten Toggle
    ScreenShareEnded { camera_restored: bool },
}

// ============================================================================
// MEDIA CONTROL
// ============================================================================

#[derive(Default)]
struct MediaState {
    tracks: Vec<Arc<LocalTrack>>,
    screen: Option<Arc<LocalTrack>>,
    peer: Option<Arc<dyn PeerConnection>>,
    screen_watcher: Option<JoinHandle<()>>,
}

impl MediaState {
    fn camera(&self) -> Option<Arc<LocalTrack>> {
        self.tracks
            .iter()
            .find(|t| t.source() == TrackSource::Camera)
            .cloned()
    }
}

pub struct MediaControl {
    devices: Arc<dyn MediaDevices>,
    state: Arc<Mutex<MediaState>>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl MediaControl {
    pub fn new(devices: Arc<dyn MediaDevices>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            devices,
            state: Arc::new(Mutex::new(MediaState::default())),
            events,
        }
    }

    /// Fordert Mikrofon (und optional Kamera) an
    pub async fn acquire(&self, video: bool) -> Result<(), MediaError> {
        let tracks = self.devices.get_user_media(true, video).await?;
        tracing::debug!("Acquired {} local tracks", tracks.len());
        self.state.lock().tracks = tracks;
        Ok(())
    }

    pub fn attach(&self, peer: Arc<dyn PeerConnection>) {
        self.state.lock().peer = Some(peer);
    }

    /// Hängt alle lokalen Tracks an die Peer Connection
    pub async fn publish_tracks(&self) -> Result<(), MediaError> {
        let (peer, tracks) = {
            let state = self.state.lock();
            (state.peer.clone(), state.tracks.clone())
        };
        let peer = peer.ok_or(MediaError::NoConnection)?;

        for track in tracks {
            peer.add_track(track).await?;
        }
        Ok(())
    }

    /// Schaltet alle Audio-Tracks um und gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> bool {
        self.toggle_kind(TrackKind::Audio)
    }

    /// Schaltet alle Video-Tracks um und gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> bool {
        self.toggle_kind(TrackKind::Video)
    }

    fn toggle_kind(&self, kind: TrackKind) -> bool {
        let state = self.state.lock();
        let tracks: Vec<_> = state.tracks.iter().filter(|t| t.kind() == kind).collect();

        let Some(first) = tracks.first() else {
            return false;
        };
        let enabled = !first.is_enabled();
        for track in tracks {
            track.set_enabled(enabled);
        }
        enabled
    }

    #[cfg(test)]
    pub fn is_screen_sharing(&self) -> bool {
        self.state.lock().screen.is_some()
    }

    /// Startet oder beendet Screen Sharing, gibt den neuen Zustand zurück
    pub async fn toggle_screen_share(&self) -> Result<bool, MediaError> {
        let active_screen = {
            let mut state = self.state.lock();
            if state.screen.is_some() {
                if let Some(watcher) = state.screen_watcher.take() {
                    watcher.abort();
                }
            }
            state.screen.clone()
        };

        if let Some(screen) = active_screen {
            screen.stop();
            restore_camera(&self.state, screen.id()).await?;
            return Ok(false);
        }

        let peer = self
            .state
            .lock()
            .peer
            .clone()
            .ok_or(MediaError::NoConnection)?;

        let screen = self.devices.get_display_media().await?;
        if let Err(e) = peer.replace_video_track(Some(Arc::clone(&screen))).await {
            screen.stop();
            return Err(e.into());
        }

        // Screen vor dem Watcher setzen, beides unter einem Lock
        let mut state = self.state.lock();
        state.screen = Some(Arc::clone(&screen));

        let shared = Arc::clone(&self.state);
        let events = self.events.clone();
        let watched = screen;
        state.screen_watcher = Some(tokio::spawn(async move {
            watched.ended().await;
            tracing::info!("Screen share track ended externally");
            let camera_restored = match restore_camera(&shared, watched.id()).await {
                Ok(restored) => restored,
                Err(e) => {
                    tracing::warn!("Failed to restore camera track: {}", e);
                    false
                }
            };
            let _ = events.send(MediaEvent::ScreenShareEnded { camera_restored });
        }));
        Ok(true)
    }

    /// Stoppt alle Tracks und löst die Peer Connection
    pub fn release(&self) {
        let mut state = self.state.lock();
        if let Some(watcher) = state.screen_watcher.take() {
            watcher.abort();
        }
        if let Some(screen) = state.screen.take() {
            screen.stop();
        }
        for track in state.tracks.drain(..) {
            track.stop();
        }
        state.peer = None;
    }
}

/// Tauscht den Screen-Track wieder gegen die Kamera. Gibt `true` zurück
/// wenn ein Kamera-Track wiederhergestellt wurde.
async fn restore_camera(state: &Arc<Mutex<MediaState>>, screen_id: &str) -> Result<bool, MediaError> {
    let (peer, camera) = {
        let mut state = state.lock();
        match &state.screen {
            Some(screen) if screen.id() == screen_id => {}
            _ => return Ok(false),
        }
        state.screen = None;
        state.screen_watcher = None;
        (state.peer.clone(), state.camera())
    };

    let Some(peer) = peer else {
        return Ok(false);
    };
    let restored = camera.is_some();
    peer.replace_video_track(camera).await?;
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, MockDevices, MockPeer};

    async fn control_with_peer(
        video: bool,
    ) -> (MediaControl, Arc<MockPeer>, Arc<MockDevices>, mpsc::UnboundedReceiver<MediaEvent>) {
        let devices = Arc::new(MockDevices::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let control = MediaControl::new(devices.clone(), tx);
        let peer = Arc::new(MockPeer::new());

        control.acquire(video).await.unwrap();
        control.attach(peer.clone());
        control.publish_tracks().await.unwrap();
        (control, peer, devices, rx)
    }

    #[tokio::test]
    async fn test_toggle_audio_and_video() {
        let (control, peer, _, _) = control_with_peer(true).await;
        assert_eq!(peer.added_tracks().len(), 2);

        assert!(!control.toggle_audio());
        assert!(control.toggle_audio());
        assert!(!control.toggle_video());
        // Kein Renegotiation
        assert_eq!(peer.offers_created(), 0);
    }

    #[tokio::test]
    async fn test_toggle_video_without_camera() {
        let (control, _, _, _) = control_with_peer(false).await;
        assert!(!control.toggle_video());
    }

    #[tokio::test]
    async fn test_screen_share_round_trip() {
        let (control, peer, devices, _) = control_with_peer(true).await;
        let camera_id = devices.last_camera_id().unwrap();

        assert!(control.toggle_screen_share().await.unwrap());
        assert!(control.is_screen_sharing());
        assert_ne!(peer.video_track_id(), Some(camera_id.clone()));

        assert!(!control.toggle_screen_share().await.unwrap());
        assert!(!control.is_screen_sharing());
        assert_eq!(peer.video_track_id(), Some(camera_id));
    }

    #[tokio::test]
    async fn test_screen_share_ended_externally() {
        let (control, peer, devices, mut events) = control_with_peer(true).await;
        let camera_id = devices.last_camera_id().unwrap();

        control.toggle_screen_share().await.unwrap();
        let screen = devices.last_screen().unwrap();

        // Benutzer klickt "Freigabe beenden" im Browser
        screen.stop();
        settle().await;

        assert!(!control.is_screen_sharing());
        assert_eq!(peer.video_track_id(), Some(camera_id));
        assert_eq!(
            events.try_recv().unwrap(),
            MediaEvent::ScreenShareEnded {
                camera_restored: true
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_screen_share_ending_immediately_restores_camera() {
        let devices = Arc::new(MockDevices::with_ending_screen());
        let (tx, mut events) = mpsc::unbounded_channel();
        let control = MediaControl::new(devices.clone(), tx);
        let peer = Arc::new(MockPeer::new());
        control.acquire(true).await.unwrap();
        control.attach(peer.clone());
        control.publish_tracks().await.unwrap();
        let camera_id = devices.last_camera_id().unwrap();

        assert!(control.toggle_screen_share().await.unwrap());

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MediaEvent::ScreenShareEnded {
                camera_restored: true
            }
        );
        assert!(!control.is_screen_sharing());
        assert_eq!(peer.video_track_id(), Some(camera_id));
    }

    #[tokio::test]
    async fn test_permission_denied_is_reported() {
        let devices = Arc::new(MockDevices::denied());
        let (tx, _rx) = mpsc::unbounded_channel();
        let control = MediaControl::new(devices, tx);

        assert!(matches!(
            control.acquire(true).await,
            Err(MediaError::PermissionDenied(_))
        ));
    }
}
