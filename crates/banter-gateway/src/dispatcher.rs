use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use banter_types::events::GatewayEvent;

/// Messages delivered to a connection's send loop.
///
/// Signal traffic is notify-then-pull: the dispatcher only tells the
/// connection that a call's log grew, and the send loop drains rows past
/// its own cursor from the database. The single cursor per (connection,
/// call) is what guarantees in-order, gap-free delivery no matter how
/// notifications interleave with subscription.
#[derive(Debug)]
pub enum UserMessage {
    /// A targeted event, forwarded to the client as-is.
    Event(GatewayEvent),
    /// Start tracking a call's signal log from this cursor.
    CallSubscribed { call_id: Uuid, after_seq: i64 },
    /// Stop tracking a call.
    CallUnsubscribed { call_id: Uuid },
    /// New envelopes exist for a subscribed call.
    SignalNotify { call_id: Uuid },
}

/// Manages connected clients: per-user targeted channels and per-call
/// signal subscriptions.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<UserMessage>)>>,

    /// Signal subscriptions: call_id -> user_ids
    call_subscribers: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                user_channels: RwLock::new(HashMap::new()),
                call_subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a per-user channel. Returns (conn_id, receiver). A newer
    /// connection for the same user replaces the old sender.
    pub async fn register_user_channel(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<UserMessage>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Send a targeted event to a specific user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        self.send_message(user_id, UserMessage::Event(event)).await;
    }

    pub async fn send_message(&self, user_id: Uuid, msg: UserMessage) {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(msg);
        }
    }

    /// Add a user to a call's signal subscribers.
    pub async fn subscribe_call(&self, call_id: Uuid, user_id: Uuid) {
        self.inner
            .call_subscribers
            .write()
            .await
            .entry(call_id)
            .or_default()
            .insert(user_id);
    }

    pub async fn unsubscribe_call(&self, call_id: Uuid, user_id: Uuid) {
        let mut subs = self.inner.call_subscribers.write().await;
        if let Some(users) = subs.get_mut(&call_id) {
            users.remove(&user_id);
            if users.is_empty() {
                subs.remove(&call_id);
            }
        }
    }

    /// Tell every subscriber of a call that its signal log grew. Delivery
    /// to the author included — receivers discard their own envelopes.
    pub async fn notify_signal(&self, call_id: Uuid) {
        let subscribers: Vec<Uuid> = {
            let subs = self.inner.call_subscribers.read().await;
            match subs.get(&call_id) {
                Some(users) => users.iter().copied().collect(),
                None => return,
            }
        };

        let channels = self.inner.user_channels.read().await;
        for user_id in subscribers {
            if let Some((_, tx)) = channels.get(&user_id) {
                let _ = tx.send(UserMessage::SignalNotify { call_id });
            }
        }
    }

    /// Tear down a disconnecting user's channel and subscriptions, but only
    /// if conn_id still owns the channel — a newer connection for the same
    /// user must not be disturbed. Returns whether cleanup ran.
    pub async fn user_offline(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        {
            let mut channels = self.inner.user_channels.write().await;
            match channels.get(&user_id) {
                Some((stored_conn_id, _)) if *stored_conn_id == conn_id => {
                    channels.remove(&user_id);
                }
                _ => return false,
            }
        }

        let mut subs = self.inner.call_subscribers.write().await;
        subs.retain(|_, users| {
            users.remove(&user_id);
            !users.is_empty()
        });

        true
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_types::models::MatchedCall;

    fn match_event() -> GatewayEvent {
        GatewayEvent::MatchFound(MatchedCall {
            call_id: Uuid::new_v4(),
            partner_id: Uuid::new_v4(),
            partner_username: "partner".into(),
            initiator: false,
        })
    }

    #[tokio::test]
    async fn targeted_send_reaches_registered_user() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_conn, mut rx) = dispatcher.register_user_channel(user).await;

        dispatcher.send_to_user(user, match_event()).await;
        dispatcher.send_to_user(Uuid::new_v4(), match_event()).await;

        assert!(matches!(
            rx.recv().await,
            Some(UserMessage::Event(GatewayEvent::MatchFound(_)))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notify_reaches_all_subscribers_including_author() {
        let dispatcher = Dispatcher::new();
        let call_id = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (_ca, mut rx_a) = dispatcher.register_user_channel(a).await;
        let (_cb, mut rx_b) = dispatcher.register_user_channel(b).await;

        dispatcher.subscribe_call(call_id, a).await;
        dispatcher.subscribe_call(call_id, b).await;
        dispatcher.notify_signal(call_id).await;

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await {
                Some(UserMessage::SignalNotify { call_id: c }) => assert_eq!(c, call_id),
                other => panic!("expected SignalNotify, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_notifications() {
        let dispatcher = Dispatcher::new();
        let call_id = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (_conn, mut rx) = dispatcher.register_user_channel(user).await;

        dispatcher.subscribe_call(call_id, user).await;
        dispatcher.unsubscribe_call(call_id, user).await;
        dispatcher.notify_signal(call_id).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_connection_cannot_tear_down_successor() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (old_conn, _rx_old) = dispatcher.register_user_channel(user).await;
        let (_new_conn, mut rx_new) = dispatcher.register_user_channel(user).await;

        assert!(!dispatcher.user_offline(user, old_conn).await);

        dispatcher.send_to_user(user, match_event()).await;
        assert!(rx_new.recv().await.is_some());
    }
}
