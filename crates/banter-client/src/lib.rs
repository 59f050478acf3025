pub mod backoff;
pub mod client;
pub mod controller;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod rest;
pub mod rtc;
pub mod session;

pub use client::{CallCommand, CallUpdate, VoiceCall};
pub use controller::{ControllerEvent, PeerConnectionController, SignalRelay};
pub use engine::{ConnectionState, EngineEvent, LocalCandidate, MediaEngine, MediaSession, SdpKind};
pub use error::{ApiError, CallError};
pub use session::{CallLifecycle, CallPhase};
