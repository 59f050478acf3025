use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{EndReason, MatchedCall};

// -- JWT Claims --

/// JWT claims shared across banter-api (REST middleware) and banter-gateway
/// (WebSocket Identify). Canonical definition lives here in banter-types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Matchmaking --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    /// Paired immediately; `call` is set and this side is the initiator.
    Matched,
    /// No partner available yet — the caller stays queued and will be
    /// notified through the gateway when another search claims it.
    Searching,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub status: SearchStatus,
    pub call: Option<MatchedCall>,
}

// -- Calls --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndCallRequest {
    pub reason: EndReason,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndCallResponse {
    /// False when the call was already ended — the second end is a no-op.
    pub ended: bool,
}

// -- Post-call --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedbackRequest {
    pub rating: u8,
    pub feedback_text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FriendRequestCreate {
    pub receiver_id: Uuid,
}
