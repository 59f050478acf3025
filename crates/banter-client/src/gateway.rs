use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use uuid::Uuid;

use banter_types::events::{GatewayCommand, GatewayEvent};
use banter_types::models::SignalPayload;

use crate::controller::SignalRelay;
use crate::error::CallError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway connect failed: {0}")]
    Connect(String),

    #[error("gateway did not acknowledge the session in time")]
    HandshakeTimeout,
}

/// An authenticated gateway connection.
pub struct GatewaySession {
    pub handle: GatewayHandle,
    pub user_id: Uuid,
    pub username: String,
    /// Server events: MatchFound pushes and signal envelopes for
    /// subscribed calls, in order.
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
}

/// Cloneable command side of the gateway connection.
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewayHandle {
    pub fn subscribe_call(&self, call_id: Uuid, after_seq: i64) -> Result<(), CallError> {
        self.command(GatewayCommand::SubscribeCall { call_id, after_seq })
    }

    pub fn unsubscribe_call(&self, call_id: Uuid) -> Result<(), CallError> {
        self.command(GatewayCommand::UnsubscribeCall { call_id })
    }

    fn command(&self, cmd: GatewayCommand) -> Result<(), CallError> {
        self.commands
            .send(cmd)
            .map_err(|_| CallError::SignalDelivery("gateway connection closed".into()))
    }
}

impl SignalRelay for GatewayHandle {
    fn send(
        &self,
        call_id: Uuid,
        signal: SignalPayload,
    ) -> impl Future<Output = Result<(), CallError>> + Send {
        let result = self.command(GatewayCommand::SignalSend { call_id, signal });
        async move { result }
    }
}

/// Connect, Identify with the JWT, and wait for the server's Ready.
pub async fn connect(url: &str, token: &str) -> Result<GatewaySession, GatewayError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| GatewayError::Connect(e.to_string()))?;
    let (mut write, mut read) = ws.split();

    let identify = serde_json::to_string(&GatewayCommand::Identify {
        token: token.to_string(),
    })
    .unwrap();
    write
        .send(Message::Text(identify.into()))
        .await
        .map_err(|e| GatewayError::Connect(e.to_string()))?;

    let ready = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayEvent::Ready { user_id, username }) =
                    serde_json::from_str::<GatewayEvent>(&text)
                {
                    return Some((user_id, username));
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or(GatewayError::HandshakeTimeout)?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<GatewayCommand>();

    // Writer: serialize commands onto the socket.
    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            let text = serde_json::to_string(&cmd).unwrap();
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        debug!("Gateway writer stopped");
    });

    // Reader: decode server events. Pings are answered by the websocket
    // layer itself.
    tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayEvent>(&text) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Unparseable gateway event: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        debug!("Gateway reader stopped");
    });

    Ok(GatewaySession {
        handle: GatewayHandle { commands: cmd_tx },
        user_id: ready.0,
        username: ready.1,
        events: event_rx,
    })
}
