//! WebRTC Peer Connection auf Basis von webrtc-rs
//!
//! Übersetzt die `on_*` Callbacks der `RTCPeerConnection` in [`PeerEvent`]s
//! und `get_stats()` in [`PeerStats`].

use super::media::{LocalTrack, TrackKind};
use super::peer::{
    CandidatePairState, CandidatePairStats, IceConnectionState, IceGatheringState,
    PeerConnection, PeerConnectionState, PeerError, PeerEvent, PeerFactory, PeerStats, SdpKind,
    SignalingState,
};
use crate::credentials::IceServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice::candidate::CandidatePairState as RtcPairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn rtc_error(e: webrtc::Error) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

fn to_rtc_servers(servers: Vec<IceServer>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|s| RTCIceServer {
            urls: s.urls,
            username: s.username.unwrap_or_default(),
            credential: s.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

// ============================================================================
// PEER FACTORY
// ============================================================================

#[derive(Debug, Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: to_rtc_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_error)?);
        let peer = RtcPeer::new(pc);
        peer.register_handlers();

        Ok(Arc::new(peer))
    }
}

// ============================================================================
// PEER
// ============================================================================

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<PeerEvent>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            pc,
            events,
            video_sender: Mutex::new(None),
        }
    }

    fn register_handlers(&self) {
        let tx = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` markiert das Ende des Gatherings
                if let Some(c) = candidate {
                    match c.to_json().map(|json| serde_json::to_string(&json)) {
                        Ok(Ok(candidate)) => {
                            let _ = tx.send(PeerEvent::LocalCandidate(candidate));
                        }
                        Ok(Err(e)) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                        Err(e) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                let state = match s {
                    RTCIceGathererState::Gathering => IceGatheringState::Gathering,
                    RTCIceGathererState::Complete => IceGatheringState::Complete,
                    _ => IceGatheringState::New,
                };
                let _ = tx.send(PeerEvent::IceGatheringState(state));
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let state = match s {
                    RTCIceConnectionState::Checking => IceConnectionState::Checking,
                    RTCIceConnectionState::Connected => IceConnectionState::Connected,
                    RTCIceConnectionState::Completed => IceConnectionState::Completed,
                    RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                    RTCIceConnectionState::Failed => IceConnectionState::Failed,
                    RTCIceConnectionState::Closed => IceConnectionState::Closed,
                    _ => IceConnectionState::New,
                };
                let _ = tx.send(PeerEvent::IceConnectionState(state));
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                let state = match s {
                    RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                    RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                    _ => PeerConnectionState::New,
                };
                let _ = tx.send(PeerEvent::ConnectionState(state));
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                let state = match s {
                    RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
                    RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
                    RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
                    RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
                    RTCSignalingState::Closed => SignalingState::Closed,
                    _ => SignalingState::Stable,
                };
                let _ = tx.send(PeerEvent::SignalingState(state));
                Box::pin(async {})
            }));

        // Eingehende Medien werden von der Plattform abgespielt
        self.pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
            })
        }));
    }

    fn rtc_track(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                ..Default::default()
            },
            track.id().to_string(),
            "call-core".to_string(),
        ))
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
        }
        .map_err(|e| PeerError::InvalidSignal(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), PeerError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| PeerError::InvalidSignal(e.to_string()))?;

        self.pc.add_ice_candidate(candidate).await.map_err(rtc_error)
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(answer.sdp)
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError> {
        let rtc_track = Self::rtc_track(&track);
        let sender = self
            .pc
            .add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(sender);
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), PeerError> {
        let sender = self.video_sender.lock().clone();
        let Some(sender) = sender else {
            // Audio-Anruf ohne Video-Sender
            if let Some(track) = track {
                return self.add_track(track).await;
            }
            return Ok(());
        };

        let replacement = track.map(|t| Self::rtc_track(&t) as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await.map_err(rtc_error)
    }

    async fn get_stats(&self) -> Result<PeerStats, PeerError> {
        let report = self.pc.get_stats().await;
        let mut stats = PeerStats::default();

        for entry in report.reports.values() {
            match entry {
                StatsReportType::LocalCandidate(_) => stats.local_candidates += 1,
                StatsReportType::RemoteCandidate(_) => stats.remote_candidates += 1,
                StatsReportType::CandidatePair(pair) => {
                    let state = match pair.state {
                        RtcPairState::InProgress => CandidatePairState::InProgress,
                        RtcPairState::Succeeded => CandidatePairState::Succeeded,
                        RtcPairState::Failed => CandidatePairState::Failed,
                        _ => CandidatePairState::Waiting,
                    };
                    let rtt = pair.current_round_trip_time;
                    stats.candidate_pairs.push(CandidatePairStats {
                        id: pair.id.clone(),
                        state,
                        nominated: pair.nominated,
                        round_trip_time: (rtt > 0.0).then(|| Duration::from_secs_f64(rtt)),
                    });
                }
                _ => {}
            }
        }
        Ok(stats)
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.video_sender.lock().take();
        self.pc.close().await.map_err(rtc_error)
    }
}

impl std::fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeer")
            .field("connection_state", &self.pc.connection_state())
            .field("has_video_sender", &self.video_sender.lock().is_some())
            .finish()
    }
}
