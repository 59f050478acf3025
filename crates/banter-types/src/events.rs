use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MatchedCall, SignalEnvelope, SignalPayload};

/// Events sent over the WebSocket gateway, server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Another user's search claimed this client as a partner.
    ///
    /// Only the non-initiating side learns of the match this way; the
    /// initiator gets the same `MatchedCall` in its search response.
    MatchFound(MatchedCall),

    /// A new signaling envelope was appended for a call this client is
    /// subscribed to. Delivered to every subscriber, author included —
    /// receivers drop their own envelopes by `sender_id`.
    SignalCreate(SignalEnvelope),
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to signaling envelopes for a call. Envelopes with
    /// `seq > after_seq` are replayed in order before live delivery, so a
    /// reconnecting client resumes from the durable record.
    SubscribeCall { call_id: Uuid, after_seq: i64 },

    /// Stop receiving envelopes for a call.
    UnsubscribeCall { call_id: Uuid },

    /// Append a signaling envelope and push it to the call's subscribers.
    SignalSend { call_id: Uuid, signal: SignalPayload },
}
