//! Message Types für das Signaling-Protokoll
//!
//! Die Strukturen spiegeln das JSON-Format des Realtime-Relays wider und
//! ermöglichen typsichere Kommunikation.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Eindeutige ID eines Anrufs (vom Server vergeben oder lokal erzeugt)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Erzeugt eine lokale ID bevor der Anruf persistiert ist
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SIGNALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    /// Offer und Answer haben Vorrang vor ICE Candidates
    pub fn is_description(self) -> bool {
        matches!(self, SignalKind::Offer | SignalKind::Answer)
    }
}

/// Eine Negotiation-Nachricht (SDP oder ICE Candidate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// SDP bzw. ICE Candidate JSON, unverändert weitergereicht
    pub payload: String,
    /// Ankunftsreihenfolge, wird lokal beim Einreihen vergeben
    #[serde(default, rename = "sequenceHint")]
    pub sequence_hint: u64,
}

impl SignalEnvelope {
    pub fn new(kind: SignalKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            sequence_hint: 0,
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SignalKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SignalKind::Answer, sdp)
    }

    pub fn ice_candidate(candidate: impl Into<String>) -> Self {
        Self::new(SignalKind::IceCandidate, candidate)
    }

    /// Fingerprint über Typ und Payload, unabhängig vom `sequence_hint`
    pub fn fingerprint(&self) -> SignalFingerprint {
        let mut hasher = DefaultHasher::new();
        self.kind.hash(&mut hasher);
        self.payload.hash(&mut hasher);
        SignalFingerprint(hasher.finish())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalFingerprint(u64);

// ============================================================================
// STATUS
// ============================================================================

/// Status-Updates die zwischen den Gesprächspartnern ausgetauscht werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Ringing,
    Accepted,
    Rejected,
    Busy,
    /// Angerufener hat nicht reagiert (unterscheidet sich von `Rejected`)
    Timeout,
    Canceled,
    Ended,
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },

    Invite {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        video: bool,
    },

    Signal {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        signal: SignalEnvelope,
    },

    Status {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "toPeerId")]
        to_peer_id: String,
        status: RemoteStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    Ping {
        nonce: u64,
    },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Eingehender Anruf
    Invite {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        #[serde(default)]
        video: bool,
    },

    Signal {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        signal: SignalEnvelope,
    },

    Status {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(rename = "fromPeerId")]
        from_peer_id: String,
        status: RemoteStatus,
        #[serde(default)]
        reason: Option<String>,
    },

    Pong {
        nonce: u64,
    },

    Error {
        code: i32,
        message: String,
    },
}
