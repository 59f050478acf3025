use thiserror::Error;

/// Failures inside a call, from acquisition through teardown.
///
/// Everything here is state-machine relevant: media and negotiation
/// failures route the session to post-call instead of leaving it stuck in
/// connecting.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// Microphone or peer connection could not be acquired. Fatal to
    /// starting the call, reported to the user, not retried.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    /// SDP handling broke, or ICE failed/closed unexpectedly. Treated as
    /// call termination.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The relay could not accept a signal after bounded retries. Treated
    /// the same as a negotiation failure.
    #[error("signal delivery failed: {0}")]
    SignalDelivery(String),
}

/// Failures of the REST surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not authenticated")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    /// The server rejected the write as conflicting state: a duplicate
    /// friend request or feedback ("already sent"), or a search while a
    /// call is still open. Surfaced distinctly from generic failure.
    #[error("conflicting state")]
    Conflict,

    /// The server reported transient overload; retried with backoff before
    /// this surfaces.
    #[error("server unavailable")]
    Unavailable,

    #[error("unexpected status {0}")]
    Unexpected(u16),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable) || matches!(self, Self::Http(e) if e.is_timeout() || e.is_connect())
    }
}
