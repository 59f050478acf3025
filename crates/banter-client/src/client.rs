use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use banter_types::events::GatewayEvent;
use banter_types::models::{EndReason, MatchedCall, SignalPayload};

use crate::controller::{ControllerEvent, PeerConnectionController, SignalRelay};
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::ApiError;
use crate::gateway::GatewayHandle;
use crate::rest::ApiClient;
use crate::session::{CallLifecycle, CallPhase};

/// UI surface of the client: everything the rest of the application can
/// ask a voice call session to do.
#[derive(Debug, Clone)]
pub enum CallCommand {
    StartSearch,
    CancelSearch,
    EndCall,
    ToggleMute,
    SubmitFeedback { rating: u8, text: Option<String> },
    SendFriendRequest,
    DismissPostCall,
}

/// Notifications surfaced back to the UI.
#[derive(Debug, Clone)]
pub enum CallUpdate {
    PhaseChanged(CallPhase),
    Matched(MatchedCall),
    MuteChanged(bool),
    FeedbackSubmitted,
    FriendRequestSent,
    /// The request already existed — shown as "already sent", not a failure.
    FriendRequestAlreadySent,
    Failed(String),
}

/// Orchestrates one user's call sessions: lifecycle state machine, REST
/// calls, gateway subscription and the peer connection controller.
///
/// Every durable status change is written server-side before the local
/// state machine advances, so a reconnect resumes from the persisted truth.
pub struct VoiceCall<E: MediaEngine> {
    api: Arc<ApiClient>,
    gateway: GatewayHandle,
    engine: E,
    user_id: Uuid,
    lifecycle: CallLifecycle,
    controller: Option<PeerConnectionController<E::Session, GatewayHandle>>,
}

impl<E: MediaEngine> VoiceCall<E> {
    pub fn new(api: Arc<ApiClient>, gateway: GatewayHandle, engine: E, user_id: Uuid) -> Self {
        Self {
            api,
            gateway,
            engine,
            user_id,
            lifecycle: CallLifecycle::new(),
            controller: None,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.lifecycle.phase()
    }

    /// Event loop: UI commands and gateway events in, updates out. Returns
    /// when the command channel closes; a live call is torn down on the
    /// way out.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut events: mpsc::UnboundedReceiver<GatewayEvent>,
        updates: mpsc::UnboundedSender<CallUpdate>,
    ) {
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<EngineEvent>();

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &engine_tx, &updates).await,
                    None => break,
                },
                Some(event) = events.recv() => {
                    self.handle_gateway_event(event, &engine_tx, &updates).await;
                }
                Some(event) = engine_rx.recv() => {
                    self.handle_engine_event(event, &updates).await;
                }
            }
        }

        if let Some(mut controller) = self.controller.take() {
            controller.shutdown().await;
        }
    }

    async fn handle_command(
        &mut self,
        cmd: CallCommand,
        engine_tx: &mpsc::UnboundedSender<EngineEvent>,
        updates: &mpsc::UnboundedSender<CallUpdate>,
    ) {
        match cmd {
            CallCommand::StartSearch => {
                if let Err(e) = self.lifecycle.begin_search() {
                    let _ = updates.send(CallUpdate::Failed(e.to_string()));
                    return;
                }
                self.emit_phase(updates);

                match self.api.start_search().await {
                    Ok(resp) => {
                        if let Some(call) = resp.call {
                            self.enter_call(call, engine_tx, updates).await;
                        }
                        // Otherwise stay searching until MatchFound arrives.
                    }
                    Err(e) => {
                        let _ = self.lifecycle.cancel_search();
                        self.emit_phase(updates);
                        let _ = updates.send(CallUpdate::Failed(format!("search failed: {}", e)));
                    }
                }
            }

            CallCommand::CancelSearch => {
                if self.lifecycle.phase() != CallPhase::Searching {
                    return;
                }
                if let Err(e) = self.api.cancel_search().await {
                    let _ = updates.send(CallUpdate::Failed(format!("cancel failed: {}", e)));
                    return;
                }
                let _ = self.lifecycle.cancel_search();
                self.emit_phase(updates);
            }

            CallCommand::EndCall => {
                self.end_call(EndReason::UserDisconnect, updates).await;
            }

            CallCommand::ToggleMute => {
                if let Some(controller) = &mut self.controller {
                    let muted = controller.toggle_mute();
                    let _ = updates.send(CallUpdate::MuteChanged(muted));
                }
            }

            CallCommand::SubmitFeedback { rating, text } => {
                if self.lifecycle.phase() != CallPhase::PostCall {
                    return;
                }
                let Some(call_id) = self.lifecycle.call().map(|c| c.call_id) else {
                    return;
                };
                match self.api.submit_feedback(call_id, rating, text.as_deref()).await {
                    Ok(()) => {
                        let _ = updates.send(CallUpdate::FeedbackSubmitted);
                        // Submission is terminal for the workflow.
                        let _ = self.lifecycle.dismiss();
                        self.emit_phase(updates);
                    }
                    Err(e) => {
                        let _ = updates.send(CallUpdate::Failed(format!("feedback failed: {}", e)));
                    }
                }
            }

            CallCommand::SendFriendRequest => {
                let Some(partner_id) = self.lifecycle.call().map(|c| c.partner_id) else {
                    return;
                };
                match self.api.send_friend_request(partner_id).await {
                    Ok(()) => {
                        let _ = updates.send(CallUpdate::FriendRequestSent);
                    }
                    Err(ApiError::Conflict) => {
                        let _ = updates.send(CallUpdate::FriendRequestAlreadySent);
                    }
                    Err(e) => {
                        let _ = updates.send(CallUpdate::Failed(format!(
                            "friend request failed: {}",
                            e
                        )));
                    }
                }
            }

            CallCommand::DismissPostCall => {
                if self.lifecycle.dismiss().is_ok() {
                    self.emit_phase(updates);
                }
            }
        }
    }

    async fn handle_gateway_event(
        &mut self,
        event: GatewayEvent,
        engine_tx: &mpsc::UnboundedSender<EngineEvent>,
        updates: &mpsc::UnboundedSender<CallUpdate>,
    ) {
        match event {
            GatewayEvent::Ready { .. } => {}

            GatewayEvent::MatchFound(call) => {
                if self.lifecycle.phase() == CallPhase::Searching {
                    self.enter_call(call, engine_tx, updates).await;
                } else if self.lifecycle.call().map(|c| c.call_id) != Some(call.call_id) {
                    // The match raced a local cancel; decline it so the
                    // partner is not left waiting in connecting.
                    info!("Declining match {} arrived in {:?}", call.call_id, self.lifecycle.phase());
                    let _ = self
                        .api
                        .end_call(call.call_id, EndReason::UserDisconnect)
                        .await;
                }
            }

            GatewayEvent::SignalCreate(envelope) => {
                let Some(controller) = &mut self.controller else {
                    return;
                };
                if envelope.call_id != controller.call_id() {
                    return;
                }
                match controller.handle_envelope(&envelope).await {
                    Ok(Some(event)) => self.apply_controller_event(event, updates).await,
                    Ok(None) => {}
                    Err(e) => self.fail_call(e.to_string(), updates).await,
                }
            }
        }
    }

    async fn handle_engine_event(
        &mut self,
        event: EngineEvent,
        updates: &mpsc::UnboundedSender<CallUpdate>,
    ) {
        let Some(controller) = &mut self.controller else {
            return;
        };
        match controller.handle_engine_event(event).await {
            Ok(Some(event)) => self.apply_controller_event(event, updates).await,
            Ok(None) => {}
            Err(e) => self.fail_call(e.to_string(), updates).await,
        }
    }

    async fn enter_call(
        &mut self,
        call: MatchedCall,
        engine_tx: &mpsc::UnboundedSender<EngineEvent>,
        updates: &mpsc::UnboundedSender<CallUpdate>,
    ) {
        if self.lifecycle.matched(call.clone()).is_err() {
            return;
        }
        let _ = updates.send(CallUpdate::Matched(call.clone()));
        self.emit_phase(updates);

        if let Err(e) = self.gateway.subscribe_call(call.call_id, 0) {
            self.fail_call(e.to_string(), updates).await;
            return;
        }

        match PeerConnectionController::start(
            self.user_id,
            &call,
            &self.engine,
            self.gateway.clone(),
        )
        .await
        {
            Ok((controller, engine_events)) => {
                self.controller = Some(controller);
                let tx = engine_tx.clone();
                tokio::spawn(async move {
                    let mut engine_events = engine_events;
                    while let Some(event) = engine_events.recv().await {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                // Media denied or the offer never made it out; either way
                // the call cannot proceed and the peer must learn of it.
                self.fail_call(e.to_string(), updates).await;
            }
        }
    }

    /// User hangup (or programmatic end) from connecting/active.
    async fn end_call(&mut self, reason: EndReason, updates: &mpsc::UnboundedSender<CallUpdate>) {
        if !matches!(self.lifecycle.phase(), CallPhase::Connecting | CallPhase::Active) {
            return;
        }
        let Some(call_id) = self.lifecycle.call().map(|c| c.call_id) else {
            return;
        };

        // Persist the transition (and let the relay notify the peer)
        // before advancing locally; the gateway is the fallback path.
        if let Err(e) = self.api.end_call(call_id, reason).await {
            warn!("End call {} via REST failed: {}", call_id, e);
            let _ = self
                .gateway
                .send(call_id, SignalPayload::CallEnded { reason })
                .await;
        }

        if let Some(mut controller) = self.controller.take() {
            controller.shutdown().await;
        }
        let _ = self.gateway.unsubscribe_call(call_id);
        if self.lifecycle.call_over() {
            self.emit_phase(updates);
        }
    }

    async fn apply_controller_event(
        &mut self,
        event: ControllerEvent,
        updates: &mpsc::UnboundedSender<CallUpdate>,
    ) {
        match event {
            ControllerEvent::Connected => {
                if self.lifecycle.connected().is_ok() {
                    self.emit_phase(updates);
                }
            }
            ControllerEvent::Ended(reason) => {
                // Media is already released by the controller.
                self.controller = None;
                if let Some(call_id) = self.lifecycle.call().map(|c| c.call_id) {
                    if reason == EndReason::ConnectionFailed {
                        // The peer may be gone entirely; make sure the
                        // record reflects the failure. Idempotent.
                        let _ = self.api.end_call(call_id, reason).await;
                    }
                    let _ = self.gateway.unsubscribe_call(call_id);
                }
                if self.lifecycle.call_over() {
                    self.emit_phase(updates);
                }
            }
        }
    }

    /// A failure that dooms the in-flight call: release media, record the
    /// termination, move to post-call. The user is never left stuck in
    /// connecting.
    async fn fail_call(&mut self, message: String, updates: &mpsc::UnboundedSender<CallUpdate>) {
        let _ = updates.send(CallUpdate::Failed(message));

        if let Some(mut controller) = self.controller.take() {
            controller.shutdown().await;
        }
        if let Some(call_id) = self.lifecycle.call().map(|c| c.call_id) {
            if self
                .api
                .end_call(call_id, EndReason::ConnectionFailed)
                .await
                .is_err()
            {
                let _ = self
                    .gateway
                    .send(
                        call_id,
                        SignalPayload::CallEnded {
                            reason: EndReason::ConnectionFailed,
                        },
                    )
                    .await;
            }
            let _ = self.gateway.unsubscribe_call(call_id);
        }
        if self.lifecycle.call_over() {
            self.emit_phase(updates);
        }
    }

    fn emit_phase(&self, updates: &mpsc::UnboundedSender<CallUpdate>) {
        let _ = updates.send(CallUpdate::PhaseChanged(self.lifecycle.phase()));
    }
}
