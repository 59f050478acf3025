use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use banter_types::models::{EndReason, MatchedCall, SignalEnvelope, SignalPayload};

use crate::backoff;
use crate::engine::{ConnectionState, EngineEvent, LocalCandidate, MediaEngine, MediaSession, SdpKind};
use crate::error::CallError;

/// Outbound half of the signaling relay, scoped to the authenticated user.
pub trait SignalRelay: Send + Sync {
    fn send(
        &self,
        call_id: Uuid,
        signal: SignalPayload,
    ) -> impl Future<Output = Result<(), CallError>> + Send;
}

/// State-machine-relevant outcomes the controller reports upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Negotiation produced a usable connection.
    Connected,
    /// The call is over; local media is already released.
    Ended(EndReason),
}

/// Drives the local media engine from relayed envelopes and feeds local
/// negotiation events back into the relay.
///
/// Sequencing is enforced here, not by the relay: the initiator emits
/// exactly one offer before any candidate; the non-initiator answers
/// exactly the first offer it observes; candidates are applied in receipt
/// order. A `call-ended` envelope is terminal — nothing is processed for
/// the call afterwards. Duplicate deliveries are tolerated by seq
/// tracking, and the controller discards envelopes it authored itself.
pub struct PeerConnectionController<S: MediaSession, R: SignalRelay> {
    user_id: Uuid,
    call_id: Uuid,
    initiator: bool,
    relay: R,
    session: Option<S>,
    muted: bool,
    answered: bool,
    local_described: bool,
    last_seq: i64,
    ended: bool,
}

impl<S: MediaSession, R: SignalRelay> PeerConnectionController<S, R> {
    /// Acquire media and, for the initiator, emit the offer. On any
    /// failure the acquired session is released before returning.
    pub async fn start<E>(
        user_id: Uuid,
        matched: &MatchedCall,
        engine: &E,
        relay: R,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>), CallError>
    where
        E: MediaEngine<Session = S>,
    {
        let (session, events) = engine.acquire().await?;

        let mut controller = Self {
            user_id,
            call_id: matched.call_id,
            initiator: matched.initiator,
            relay,
            session: Some(session),
            muted: false,
            answered: false,
            local_described: false,
            last_seq: 0,
            ended: false,
        };

        if matched.initiator {
            if let Err(e) = controller.send_offer().await {
                controller.teardown().await;
                return Err(e);
            }
        }

        Ok((controller, events))
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Apply one relayed envelope. Returns the state-machine outcome, if
    /// any. Errors mean the call cannot continue; media is already
    /// released when they surface.
    pub async fn handle_envelope(
        &mut self,
        envelope: &SignalEnvelope,
    ) -> Result<Option<ControllerEvent>, CallError> {
        if self.ended || envelope.call_id != self.call_id {
            return Ok(None);
        }
        // The relay is at-least-once; a seq we already saw is a re-delivery.
        if envelope.seq <= self.last_seq {
            return Ok(None);
        }
        self.last_seq = envelope.seq;

        // The transport delivers to both subscribers, author included.
        if envelope.sender_id == self.user_id {
            return Ok(None);
        }

        match &envelope.signal {
            SignalPayload::Offer { sdp } => self.handle_offer(sdp.clone()).await,
            SignalPayload::Answer { sdp } => self.handle_answer(sdp.clone()).await,
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                let candidate = LocalCandidate {
                    candidate: candidate.clone(),
                    sdp_mid: sdp_mid.clone(),
                    sdp_m_line_index: *sdp_m_line_index,
                };
                if let Err(e) = self.session()?.add_ice_candidate(candidate).await {
                    // A single bad candidate is not fatal; the remaining
                    // ones may still complete the path.
                    warn!("Dropping remote candidate for call {}: {}", self.call_id, e);
                }
                Ok(None)
            }
            SignalPayload::CallEnded { reason } => {
                info!("Peer ended call {} ({:?})", self.call_id, reason);
                let reason = *reason;
                self.teardown().await;
                Ok(Some(ControllerEvent::Ended(reason)))
            }
        }
    }

    /// React to one engine notification.
    pub async fn handle_engine_event(
        &mut self,
        event: EngineEvent,
    ) -> Result<Option<ControllerEvent>, CallError> {
        if self.ended {
            return Ok(None);
        }

        match event {
            EngineEvent::LocalCandidate(candidate) => {
                // Candidates may only follow this side's offer/answer.
                if !self.local_described {
                    debug!("Local candidate before description for call {}, dropped", self.call_id);
                    return Ok(None);
                }
                let signal = SignalPayload::IceCandidate {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_m_line_index: candidate.sdp_m_line_index,
                };
                if let Err(e) = self.send_with_retry(signal).await {
                    // Candidate loss alone does not doom the call.
                    warn!("Candidate delivery failed for call {}: {}", self.call_id, e);
                }
                Ok(None)
            }
            EngineEvent::ConnectionState(state) => match state {
                ConnectionState::Connected => Ok(Some(ControllerEvent::Connected)),
                ConnectionState::Failed | ConnectionState::Closed => {
                    warn!("Connection {:?} for call {}", state, self.call_id);
                    self.teardown().await;
                    Ok(Some(ControllerEvent::Ended(EndReason::ConnectionFailed)))
                }
                other => {
                    debug!("Connection state {:?} for call {}", other, self.call_id);
                    Ok(None)
                }
            },
        }
    }

    /// Flip local audio. Returns the new muted state.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        if let Some(session) = &self.session {
            session.set_muted(self.muted);
        }
        self.muted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Release media and stop processing. Safe to call on any path, any
    /// number of times.
    pub async fn shutdown(&mut self) {
        self.teardown().await;
    }

    async fn handle_offer(&mut self, sdp: String) -> Result<Option<ControllerEvent>, CallError> {
        if self.initiator {
            warn!("Initiator received an offer for call {}, ignoring", self.call_id);
            return Ok(None);
        }
        // Exactly one answer, for the first offer observed.
        if self.answered {
            debug!("Duplicate offer for call {}, already answered", self.call_id);
            return Ok(None);
        }

        let result = async {
            self.session()?
                .set_remote_description(SdpKind::Offer, sdp)
                .await?;
            let answer = self.session()?.create_answer().await?;
            Ok::<String, CallError>(answer)
        }
        .await;

        let answer = match result {
            Ok(answer) => answer,
            Err(e) => {
                self.teardown().await;
                return Err(e);
            }
        };

        self.answered = true;
        self.local_described = true;

        if let Err(e) = self.send_with_retry(SignalPayload::Answer { sdp: answer }).await {
            // An undeliverable answer leaves the peer hanging; give up on
            // the call instead.
            self.teardown().await;
            return Err(e);
        }

        Ok(None)
    }

    async fn handle_answer(&mut self, sdp: String) -> Result<Option<ControllerEvent>, CallError> {
        if !self.initiator {
            warn!("Non-initiator received an answer for call {}, ignoring", self.call_id);
            return Ok(None);
        }

        if let Err(e) = self
            .session()?
            .set_remote_description(SdpKind::Answer, sdp)
            .await
        {
            self.teardown().await;
            return Err(e);
        }
        Ok(None)
    }

    async fn send_offer(&mut self) -> Result<(), CallError> {
        let sdp = self.session()?.create_offer().await?;
        self.local_described = true;
        self.send_with_retry(SignalPayload::Offer { sdp }).await
    }

    async fn send_with_retry(&self, signal: SignalPayload) -> Result<(), CallError> {
        backoff::with_backoff(|| self.relay.send(self.call_id, signal.clone())).await
    }

    fn session(&self) -> Result<&S, CallError> {
        self.session
            .as_ref()
            .ok_or_else(|| CallError::Negotiation("media session already released".into()))
    }

    async fn teardown(&mut self) {
        self.ended = true;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    // -- Fake media engine --

    #[derive(Default)]
    struct SessionLog {
        remote: Mutex<Vec<(SdpKind, String)>>,
        candidates: Mutex<Vec<LocalCandidate>>,
        muted: AtomicBool,
        released: AtomicBool,
    }

    #[derive(Clone)]
    struct FakeSession {
        name: &'static str,
        log: Arc<SessionLog>,
    }

    impl MediaSession for FakeSession {
        async fn create_offer(&self) -> Result<String, CallError> {
            Ok(format!("offer-from-{}", self.name))
        }

        async fn create_answer(&self) -> Result<String, CallError> {
            Ok(format!("answer-from-{}", self.name))
        }

        async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), CallError> {
            self.log.remote.lock().unwrap().push((kind, sdp));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: LocalCandidate) -> Result<(), CallError> {
            self.log.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        fn set_muted(&self, muted: bool) {
            self.log.muted.store(muted, Ordering::SeqCst);
        }

        async fn close(&self) {
            self.log.released.store(true, Ordering::SeqCst);
        }
    }

    struct FakeEngine {
        name: &'static str,
        log: Arc<SessionLog>,
        events: Mutex<Option<UnboundedSender<EngineEvent>>>,
        fail_acquire: bool,
    }

    impl FakeEngine {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                log: Arc::new(SessionLog::default()),
                events: Mutex::new(None),
                fail_acquire: false,
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                fail_acquire: true,
                ..Self::new(name)
            }
        }
    }

    impl MediaEngine for FakeEngine {
        type Session = FakeSession;

        async fn acquire(
            &self,
        ) -> Result<(FakeSession, mpsc::UnboundedReceiver<EngineEvent>), CallError> {
            if self.fail_acquire {
                return Err(CallError::MediaAcquisition("microphone denied".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.lock().unwrap() = Some(tx);
            let session = FakeSession {
                name: self.name,
                log: self.log.clone(),
            };
            Ok((session, rx))
        }
    }

    // -- Fake relay: shared append-only log with seq assignment --

    #[derive(Default)]
    struct RelayLog {
        seq: Mutex<i64>,
        envelopes: Mutex<Vec<SignalEnvelope>>,
        down: AtomicBool,
    }

    #[derive(Clone)]
    struct TestRelay {
        user_id: Uuid,
        log: Arc<RelayLog>,
    }

    impl SignalRelay for TestRelay {
        async fn send(&self, call_id: Uuid, signal: SignalPayload) -> Result<(), CallError> {
            if self.log.down.load(Ordering::SeqCst) {
                return Err(CallError::SignalDelivery("relay unreachable".into()));
            }
            let mut seq = self.log.seq.lock().unwrap();
            *seq += 1;
            self.log.envelopes.lock().unwrap().push(SignalEnvelope {
                seq: *seq,
                call_id,
                sender_id: self.user_id,
                signal,
                created_at: Utc::now(),
            });
            Ok(())
        }
    }

    fn matched(call_id: Uuid, partner: Uuid, initiator: bool) -> MatchedCall {
        MatchedCall {
            call_id,
            partner_id: partner,
            partner_username: "partner".into(),
            initiator,
        }
    }

    /// Deliver every logged envelope (from `from_seq`, exclusive) to a
    /// controller in order, the way a gateway drain would.
    async fn pump<S: MediaSession, R: SignalRelay>(
        log: &Arc<RelayLog>,
        controller: &mut PeerConnectionController<S, R>,
        from_seq: i64,
    ) -> Vec<ControllerEvent> {
        let envelopes: Vec<SignalEnvelope> = log
            .envelopes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect();

        let mut events = Vec::new();
        for env in envelopes {
            if let Some(ev) = controller.handle_envelope(&env).await.unwrap() {
                events.push(ev);
            }
        }
        events
    }

    fn count_kind(log: &Arc<RelayLog>, kind: &str) -> usize {
        log.envelopes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.signal.kind() == kind)
            .count()
    }

    #[tokio::test]
    async fn offer_answer_candidates_round_trip() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());

        let engine_a = FakeEngine::new("alice");
        let engine_b = FakeEngine::new("bob");

        let (mut ctl_a, _ev_a) = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine_a,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .unwrap();

        // The initiator emitted exactly one offer at start.
        assert_eq!(count_kind(&relay_log, "offer"), 1);

        let (mut ctl_b, _ev_b) = PeerConnectionController::start(
            bob,
            &matched(call_id, alice, false),
            &engine_b,
            TestRelay { user_id: bob, log: relay_log.clone() },
        )
        .await
        .unwrap();

        // Bob observes the offer and answers it.
        pump(&relay_log, &mut ctl_b, 0).await;
        assert_eq!(count_kind(&relay_log, "answer"), 1);
        assert_eq!(
            engine_b.log.remote.lock().unwrap()[0].0,
            SdpKind::Offer
        );

        // Alice observes the answer (and skips her own offer).
        pump(&relay_log, &mut ctl_a, 0).await;
        let remote_a = engine_a.log.remote.lock().unwrap();
        assert_eq!(remote_a.len(), 1);
        assert_eq!(remote_a[0], (SdpKind::Answer, "answer-from-bob".to_string()));
        drop(remote_a);

        // Alice trickles a candidate; Bob applies it.
        let candidate = LocalCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        ctl_a
            .handle_engine_event(EngineEvent::LocalCandidate(candidate.clone()))
            .await
            .unwrap();
        pump(&relay_log, &mut ctl_b, 2).await;
        assert_eq!(*engine_b.log.candidates.lock().unwrap(), vec![candidate]);

        // Negotiation completes on both sides.
        let up_a = ctl_a
            .handle_engine_event(EngineEvent::ConnectionState(ConnectionState::Connected))
            .await
            .unwrap();
        assert_eq!(up_a, Some(ControllerEvent::Connected));
    }

    #[tokio::test]
    async fn own_envelopes_are_never_applied() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::new("alice");

        let (mut ctl, _ev) = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .unwrap();

        // The relay delivered Alice's own offer back to her.
        pump(&relay_log, &mut ctl, 0).await;
        assert!(engine.log.remote.lock().unwrap().is_empty());
        // And she did not answer herself.
        assert_eq!(count_kind(&relay_log, "answer"), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_produces_a_single_answer() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::new("bob");

        let (mut ctl, _ev) = PeerConnectionController::start(
            bob,
            &matched(call_id, alice, false),
            &engine,
            TestRelay { user_id: bob, log: relay_log.clone() },
        )
        .await
        .unwrap();

        let offer = SignalEnvelope {
            seq: 1,
            call_id,
            sender_id: alice,
            signal: SignalPayload::Offer { sdp: "v=0".into() },
            created_at: Utc::now(),
        };

        // At-least-once transport: the same envelope arrives twice.
        ctl.handle_envelope(&offer).await.unwrap();
        ctl.handle_envelope(&offer).await.unwrap();
        assert_eq!(count_kind(&relay_log, "answer"), 1);

        // A re-sent offer under a fresh seq is also not answered again.
        let resent = SignalEnvelope { seq: 5, ..offer };
        ctl.handle_envelope(&resent).await.unwrap();
        assert_eq!(count_kind(&relay_log, "answer"), 1);
    }

    #[tokio::test]
    async fn call_ended_is_terminal_and_releases_media() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::new("bob");

        let (mut ctl, _ev) = PeerConnectionController::start(
            bob,
            &matched(call_id, alice, false),
            &engine,
            TestRelay { user_id: bob, log: relay_log.clone() },
        )
        .await
        .unwrap();

        let ended = SignalEnvelope {
            seq: 1,
            call_id,
            sender_id: alice,
            signal: SignalPayload::CallEnded { reason: EndReason::UserDisconnect },
            created_at: Utc::now(),
        };
        let event = ctl.handle_envelope(&ended).await.unwrap();
        assert_eq!(event, Some(ControllerEvent::Ended(EndReason::UserDisconnect)));
        assert!(engine.log.released.load(Ordering::SeqCst));

        // Nothing after the terminal envelope is processed.
        let late_offer = SignalEnvelope {
            seq: 2,
            call_id,
            sender_id: alice,
            signal: SignalPayload::Offer { sdp: "v=0".into() },
            created_at: Utc::now(),
        };
        assert_eq!(ctl.handle_envelope(&late_offer).await.unwrap(), None);
        assert_eq!(count_kind(&relay_log, "answer"), 0);
        assert!(ctl.is_ended());
    }

    #[tokio::test]
    async fn connection_failure_tears_down_and_reports_ended() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::new("alice");

        let (mut ctl, _ev) = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .unwrap();

        let event = ctl
            .handle_engine_event(EngineEvent::ConnectionState(ConnectionState::Failed))
            .await
            .unwrap();
        assert_eq!(event, Some(ControllerEvent::Ended(EndReason::ConnectionFailed)));
        assert!(engine.log.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn media_acquisition_failure_is_fatal() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::failing("alice");

        let err = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, CallError::MediaAcquisition(_)));
        // Nothing was sent for a call that never started.
        assert!(relay_log.envelopes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_offer_fails_the_call_and_releases_media() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        relay_log.down.store(true, Ordering::SeqCst);
        let engine = FakeEngine::new("alice");

        let err = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, CallError::SignalDelivery(_)));
        assert!(engine.log.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn mute_is_local_only() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::new("alice");

        let (mut ctl, _ev) = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .unwrap();

        let sent_before = relay_log.envelopes.lock().unwrap().len();
        assert!(ctl.toggle_mute());
        assert!(engine.log.muted.load(Ordering::SeqCst));
        assert!(!ctl.toggle_mute());
        assert!(!engine.log.muted.load(Ordering::SeqCst));
        assert_eq!(relay_log.envelopes.lock().unwrap().len(), sent_before);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let call_id = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let relay_log = Arc::new(RelayLog::default());
        let engine = FakeEngine::new("alice");

        let (mut ctl, _ev) = PeerConnectionController::start(
            alice,
            &matched(call_id, bob, true),
            &engine,
            TestRelay { user_id: alice, log: relay_log.clone() },
        )
        .await
        .unwrap();

        ctl.shutdown().await;
        assert!(engine.log.released.load(Ordering::SeqCst));
        ctl.shutdown().await;
        assert!(ctl.is_ended());
    }
}
