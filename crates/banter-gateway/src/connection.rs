use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use banter_db::Database;
use banter_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::{Dispatcher, UserMessage};
use crate::relay::{self, RelayError};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a single WebSocket connection: Identify handshake, Ready, then
/// the event loop.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    // Step 1: Wait for Identify command with JWT
    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    // Step 2: Send Ready event
    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    let (conn_id, mut user_rx) = dispatcher.register_user_channel(user_id).await;

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Spawn task to forward targeted events and drain signal logs -> client,
    // with heartbeat
    let db_send = db.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        // Per-call delivery cursors. The single owner of each cursor is
        // what keeps envelope delivery ordered and gap-free regardless of
        // how notifications interleave with subscription.
        let mut cursors: HashMap<Uuid, i64> = HashMap::new();

        loop {
            tokio::select! {
                result = user_rx.recv() => {
                    let msg = match result {
                        Some(msg) => msg,
                        None => break,
                    };

                    match msg {
                        UserMessage::Event(event) => {
                            let text = serde_json::to_string(&event).unwrap();
                            if sender.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        UserMessage::CallSubscribed { call_id, after_seq } => {
                            cursors.insert(call_id, after_seq);
                            if drain_signals(&db_send, &mut sender, &mut cursors, call_id).await.is_err() {
                                break;
                            }
                        }
                        UserMessage::CallUnsubscribed { call_id } => {
                            cursors.remove(&call_id);
                        }
                        UserMessage::SignalNotify { call_id } => {
                            if drain_signals(&db_send, &mut sender, &mut cursors, call_id).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let username_recv = username.clone();
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<GatewayCommand>(&text) {
                        Ok(cmd) => {
                            handle_command(&dispatcher_recv, &db_recv, user_id, &username_recv, cmd)
                                .await;
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                username_recv,
                                user_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // A vanished client should not hold a queue slot: if this connection
    // still owned the user's channel, drop any pending search.
    if dispatcher.user_offline(user_id, conn_id).await {
        let db_cleanup = db.clone();
        let uid = user_id.to_string();
        if let Ok(Ok(true)) = tokio::task::spawn_blocking(move || db_cleanup.cancel_search(&uid)).await
        {
            info!("{} ({}) removed from queue on disconnect", username, user_id);
        }
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Send every stored envelope past this connection's cursor, in seq order.
/// Err means the socket is gone and the send loop should stop.
async fn drain_signals(
    db: &Arc<Database>,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    cursors: &mut HashMap<Uuid, i64>,
    call_id: Uuid,
) -> Result<(), ()> {
    let Some(cursor) = cursors.get_mut(&call_id) else {
        return Ok(());
    };

    let db_fetch = db.clone();
    let cid = call_id.to_string();
    let after = *cursor;
    let rows = match tokio::task::spawn_blocking(move || db_fetch.signals_after(&cid, after)).await
    {
        Ok(Ok(rows)) => rows,
        Ok(Err(e)) => {
            warn!("Signal drain failed for call {}: {}", call_id, e);
            return Ok(());
        }
        Err(e) => {
            warn!("Signal drain task failed for call {}: {}", call_id, e);
            return Ok(());
        }
    };

    for row in rows {
        let seq = row.seq;
        if let Some(envelope) = relay::envelope_from_row(&row) {
            let text = serde_json::to_string(&GatewayEvent::SignalCreate(envelope)).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                return Err(());
            }
        }
        *cursor = seq;
    }

    Ok(())
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use banter_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::SubscribeCall { call_id, after_seq } => {
            // Only the two participants may watch a call's signal log.
            let db_lookup = db.clone();
            let cid = call_id.to_string();
            let call = match tokio::task::spawn_blocking(move || db_lookup.get_call(&cid)).await {
                Ok(Ok(call)) => call,
                Ok(Err(e)) => {
                    warn!("Subscribe lookup failed for call {}: {}", call_id, e);
                    return;
                }
                Err(e) => {
                    warn!("Subscribe task failed for call {}: {}", call_id, e);
                    return;
                }
            };

            match call {
                Some(call) if call.has_participant(&user_id.to_string()) => {
                    info!("{} ({}) subscribed to call {}", username, user_id, call_id);
                    dispatcher.subscribe_call(call_id, user_id).await;
                    dispatcher
                        .send_message(user_id, UserMessage::CallSubscribed { call_id, after_seq })
                        .await;
                }
                Some(_) => {
                    warn!(
                        "{} ({}) tried to subscribe to another pair's call {}",
                        username, user_id, call_id
                    );
                }
                None => {
                    warn!(
                        "{} ({}) subscribed to unknown call {}",
                        username, user_id, call_id
                    );
                }
            }
        }

        GatewayCommand::UnsubscribeCall { call_id } => {
            dispatcher.unsubscribe_call(call_id, user_id).await;
            dispatcher
                .send_message(user_id, UserMessage::CallUnsubscribed { call_id })
                .await;
        }

        GatewayCommand::SignalSend { call_id, signal } => {
            trace!(
                "{} ({}) -> {} for call {}",
                username,
                user_id,
                signal.kind(),
                call_id
            );
            match relay::relay_signal(db, dispatcher, call_id, user_id, signal).await {
                Ok(_) => {}
                Err(RelayError::CallOver) => {
                    // Late candidates after hangup are expected noise.
                    debug!(
                        "{} ({}) signaled into ended call {}",
                        username, user_id, call_id
                    );
                }
                Err(e) => {
                    warn!(
                        "{} ({}) signal rejected for call {}: {}",
                        username, user_id, call_id, e
                    );
                }
            }
        }
    }
}
