//! Peer Connection Schnittstelle
//!
//! Abstraktion über die WebRTC Peer Connection. Die rohen `on*` Callbacks
//! werden als typisierte [`PeerEvent`]s über einen Broadcast-Kanal
//! verteilt, damit Signal Queue, Connection Monitor und State Machine
//! unabhängig voneinander zuhören können.

use super::media::LocalTrack;
use crate::credentials::IceServer;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    /// Signal ist kaputt und wird verworfen, nicht wiederholt
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Peer connection closed")]
    Closed,
}

// ============================================================================
// STATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Events der Peer Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Lokal gesammelter ICE Candidate (JSON)
    LocalCandidate(String),
    IceGatheringState(IceGatheringState),
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
    SignalingState(SignalingState),
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CandidatePairState {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePairStats {
    pub id: String,
    pub state: CandidatePairState,
    pub nominated: bool,
    pub round_trip_time: Option<Duration>,
}

/// Auszug aus `getStats()`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerStats {
    pub local_candidates: usize,
    pub remote_candidates: usize,
    pub candidate_pairs: Vec<CandidatePairStats>,
}

impl PeerStats {
    /// RTT des aktiven Paares: nominiert und erfolgreich, sonst irgendein
    /// erfolgreiches Paar mit Messwert
    pub fn round_trip_time(&self) -> Option<Duration> {
        let succeeded = || {
            self.candidate_pairs
                .iter()
                .filter(|p| p.state == CandidatePairState::Succeeded)
        };

        succeeded()
            .filter(|p| p.nominated)
            .find_map(|p| p.round_trip_time)
            .or_else(|| succeeded().find_map(|p| p.round_trip_time))
    }

    pub fn has_failed_pairs(&self) -> bool {
        self.candidate_pairs
            .iter()
            .any(|p| p.state == CandidatePairState::Failed)
    }
}

// ============================================================================
// PEER CONNECTION
// ============================================================================

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), PeerError>;

    /// Erstellt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Erstellt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), PeerError>;

    /// Ersetzt den ausgehenden Video-Track ohne Renegotiation
    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<(), PeerError>;

    async fn get_stats(&self) -> Result<PeerStats, PeerError>;

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erstellt Peer Connections für neue Anrufe
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, ice_servers: Vec<IceServer>)
        -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(state: CandidatePairState, nominated: bool, rtt_ms: Option<u64>) -> CandidatePairStats {
        CandidatePairStats {
            id: format!("{:?}-{}", state, nominated),
            state,
            nominated,
            round_trip_time: rtt_ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn test_rtt_prefers_nominated_pair() {
        let stats = PeerStats {
            candidate_pairs: vec![
                pair(CandidatePairState::Succeeded, false, Some(40)),
                pair(CandidatePairState::Succeeded, true, Some(90)),
                pair(CandidatePairState::Failed, false, None),
            ],
            ..Default::default()
        };

        assert_eq!(stats.round_trip_time(), Some(Duration::from_millis(90)));
        assert!(stats.has_failed_pairs());
    }

    #[test]
    fn test_rtt_without_succeeded_pairs() {
        let stats = PeerStats {
            candidate_pairs: vec![pair(CandidatePairState::InProgress, true, Some(10))],
            ..Default::default()
        };

        assert_eq!(stats.round_trip_time(), None);
        assert!(!stats.has_failed_pairs());
    }
}
