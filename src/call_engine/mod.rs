//! Call Engine Module
//!
//! Dieses Modul verwaltet:
//! - Call State Machine und Anrufzustand
//! - Klingel- und Reset-Timer
//! - WebRTC Peer Connections und Connection Monitor
//! - Lokale Medien (Mute, Kamera, Screen Sharing)

mod engine;
mod media;
mod monitor;
mod peer;
mod rtc;
mod state;
mod timers;

pub use engine::{CallDeps, CallError, CallEvent, CallHistory, CallStateMachine, ProfileLookup};
pub use media::{LocalTrack, MediaControl, MediaDevices, MediaError, MediaEvent, TrackKind, TrackSource};
pub use monitor::{
    ConnectionMonitor, ConnectionQuality, ConnectionStats, MonitorEvent, MonitorEventKind,
};
pub use peer::{
    CandidatePairState, CandidatePairStats, IceConnectionState, IceGatheringState,
    PeerConnection, PeerConnectionState, PeerError, PeerEvent, PeerFactory, PeerStats, SdpKind,
    SignalingState,
};
pub use rtc::{RtcPeer, RtcPeerFactory};
pub use state::{CallAttempt, CallDirection, CallReader, CallStatus, CallTrigger, Transition};
pub use timers::{CallTimers, TimerKind};
