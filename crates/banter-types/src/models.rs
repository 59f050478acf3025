use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of the optional free-text feedback, in characters.
pub const MAX_FEEDBACK_CHARS: usize = 500;

/// Lifecycle status of a call record. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

/// Why a call terminated. Carried on the `call-ended` signal so the peer's
/// UI can distinguish a hangup from a dropped connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserDisconnect,
    ConnectionFailed,
}

/// One participant's view of a freshly created call. Both the matcher's
/// HTTP response and the partner's `MatchFound` push carry this shape, so
/// the two sides converge on identical session data no matter which path
/// delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedCall {
    pub call_id: Uuid,
    pub partner_id: Uuid,
    pub partner_username: String,
    /// True for the side that creates the SDP offer.
    pub initiator: bool,
}

/// A signaling message payload relayed between the two call participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
    CallEnded { reason: EndReason },
}

impl SignalPayload {
    /// The `signal_type` discriminant as stored in the database column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded { .. } => "call-ended",
        }
    }
}

/// A durable, append-only signaling record scoped to one call.
///
/// `seq` is the relay's append order within the call; receivers observe
/// envelopes in ascending `seq` and must discard envelopes whose
/// `sender_id` is their own (the relay delivers to every subscriber,
/// author included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub seq: i64,
    pub call_id: Uuid,
    pub sender_id: Uuid,
    #[serde(flatten)]
    pub signal: SignalPayload,
    pub created_at: DateTime<Utc>,
}
