use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WebRtcMediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::engine::{
    ConnectionState, EngineEvent, LocalCandidate, MediaEngine, MediaSession, SdpKind,
};
use crate::error::CallError;

const SAMPLE_RATE: u32 = 48_000;

/// Default STUN configuration, sufficient for most NAT setups.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

/// [`MediaEngine`] backed by the webrtc crate.
pub struct RtcEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcEngine {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// Add TURN credentials for networks where STUN is not enough.
    pub fn with_turn_server(mut self, url: String, username: String, credential: String) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
        self
    }
}

impl Default for RtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaEngine for RtcEngine {
    type Session = RtcSession;

    fn acquire(
        &self,
    ) -> impl Future<Output = Result<(RtcSession, mpsc::UnboundedReceiver<EngineEvent>), CallError>>
    + Send {
        let ice_servers = self.ice_servers.clone();
        async move {
            let mut codecs = WebRtcMediaEngine::default();
            codecs
                .register_default_codecs()
                .map_err(|e| CallError::MediaAcquisition(e.to_string()))?;

            let mut registry = Registry::new();
            registry = register_default_interceptors(registry, &mut codecs)
                .map_err(|e| CallError::MediaAcquisition(e.to_string()))?;

            let api = APIBuilder::new()
                .with_media_engine(codecs)
                .with_interceptor_registry(registry)
                .build();

            let config = RTCConfiguration {
                ice_servers,
                ..Default::default()
            };

            let pc = Arc::new(
                api.new_peer_connection(config)
                    .await
                    .map_err(|e| CallError::MediaAcquisition(e.to_string()))?,
            );

            // Local microphone track. Feeding captured samples into it is
            // the embedder's audio pipeline; the engine only owns the
            // negotiated track and the mute flag it consults.
            let track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: SAMPLE_RATE,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_string(),
                "banter".to_string(),
            ));
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| CallError::MediaAcquisition(e.to_string()))?;

            let (event_tx, event_rx) = mpsc::unbounded_channel();

            let tx = event_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                debug!("Peer connection state: {:?}", s);
                let mapped = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = tx.send(EngineEvent::ConnectionState(state));
                }
                Box::pin(async {})
            }));

            let tx = event_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    if let Ok(json) = c.to_json() {
                        let _ = tx.send(EngineEvent::LocalCandidate(LocalCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_m_line_index: json.sdp_mline_index,
                        }));
                    }
                }
                Box::pin(async {})
            }));

            pc.on_track(Box::new(move |track, _, _| {
                Box::pin(async move {
                    info!("Received remote track: {:?}", track.codec());
                })
            }));

            let session = RtcSession {
                pc,
                _track: track,
                muted: AtomicBool::new(false),
            };
            Ok((session, event_rx))
        }
    }
}

/// One acquired peer connection plus its local audio track.
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    _track: Arc<TrackLocalStaticRTP>,
    muted: AtomicBool,
}

impl MediaSession for RtcSession {
    fn create_offer(&self) -> impl Future<Output = Result<String, CallError>> + Send {
        let pc = self.pc.clone();
        async move {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?;
            Ok(offer.sdp)
        }
    }

    fn create_answer(&self) -> impl Future<Output = Result<String, CallError>> + Send {
        let pc = self.pc.clone();
        async move {
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))?;
            Ok(answer.sdp)
        }
    }

    fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> impl Future<Output = Result<(), CallError>> + Send {
        let pc = self.pc.clone();
        async move {
            let desc = match kind {
                SdpKind::Offer => RTCSessionDescription::offer(sdp),
                SdpKind::Answer => RTCSessionDescription::answer(sdp),
            }
            .map_err(|e| CallError::Negotiation(e.to_string()))?;

            pc.set_remote_description(desc)
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))
        }
    }

    fn add_ice_candidate(
        &self,
        candidate: LocalCandidate,
    ) -> impl Future<Output = Result<(), CallError>> + Send {
        let pc = self.pc.clone();
        async move {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                ..Default::default()
            };
            pc.add_ice_candidate(init)
                .await
                .map_err(|e| CallError::Negotiation(e.to_string()))
        }
    }

    fn set_muted(&self, muted: bool) {
        // The capture pipeline consults this flag before writing samples
        // into the local track.
        self.muted.store(muted, Ordering::SeqCst);
        debug!("Local audio muted: {}", muted);
    }

    fn close(&self) -> impl Future<Output = ()> + Send {
        let pc = self.pc.clone();
        async move {
            let _ = pc.close().await;
        }
    }
}

impl Drop for RtcSession {
    fn drop(&mut self) {
        // Backstop for paths that skipped close(); closing twice is fine.
        let pc = self.pc.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}
