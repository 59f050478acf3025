use tokio::sync::mpsc;

use crate::error::CallError;

/// Peer connection states surfaced by the media engine. Mirrors the
/// WebRTC connection-state observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A locally gathered ICE candidate, ready to be relayed to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

/// Asynchronous notifications from the engine, consumed by the
/// peer connection controller one at a time.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LocalCandidate(LocalCandidate),
    ConnectionState(ConnectionState),
}

/// The local WebRTC capability set the controller drives.
///
/// Acquisition bundles microphone access and the peer connection into one
/// scoped resource: acquired when a call enters connecting, released
/// through [`MediaSession::close`] on every exit path.
pub trait MediaEngine: Send + Sync {
    type Session: MediaSession;

    fn acquire(
        &self,
    ) -> impl Future<Output = Result<(Self::Session, mpsc::UnboundedReceiver<EngineEvent>), CallError>>
    + Send;
}

/// One acquired microphone + peer connection pair.
///
/// `create_offer` and `create_answer` also install the produced SDP as the
/// local description, so the caller only relays the returned text.
pub trait MediaSession: Send + Sync {
    fn create_offer(&self) -> impl Future<Output = Result<String, CallError>> + Send;

    fn create_answer(&self) -> impl Future<Output = Result<String, CallError>> + Send;

    fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> impl Future<Output = Result<(), CallError>> + Send;

    fn add_ice_candidate(
        &self,
        candidate: LocalCandidate,
    ) -> impl Future<Output = Result<(), CallError>> + Send;

    /// Flip the local audio track. Purely local, no network effect.
    fn set_muted(&self, muted: bool);

    /// Stop local tracks and close the connection. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
