use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use banter_db::models::SignalRow;
use banter_db::{Database, StoreError};
use banter_types::models::{EndReason, SignalEnvelope, SignalPayload};

use crate::dispatcher::Dispatcher;

/// Failures of the signal relay, mapped to HTTP/WS responses by callers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("call not found")]
    NotFound,

    #[error("sender is not a participant of this call")]
    NotParticipant,

    #[error("call is no longer active")]
    CallOver,

    #[error("blocking task failed")]
    TaskFailed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Append a signaling envelope and notify the call's subscribers.
///
/// A `CallEnded` payload doubles as the end-call transition: the status
/// flip and the terminal envelope are one code path, so ended_at is set
/// exactly once and the peer always observes termination. For an already
/// ended call it returns `Ok(None)` (idempotent no-op). All other payloads
/// require the call to still be active.
pub async fn relay_signal(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    call_id: Uuid,
    sender_id: Uuid,
    signal: SignalPayload,
) -> Result<Option<SignalEnvelope>, RelayError> {
    let payload = serde_json::to_string(&signal).unwrap();
    let kind = signal.kind();
    let is_end = matches!(signal, SignalPayload::CallEnded { .. });

    let db_task = db.clone();
    let cid = call_id.to_string();
    let sid = sender_id.to_string();
    let row = tokio::task::spawn_blocking(move || -> Result<Option<SignalRow>, RelayError> {
        let call = db_task.get_call(&cid)?.ok_or(RelayError::NotFound)?;
        if !call.has_participant(&sid) {
            return Err(RelayError::NotParticipant);
        }

        if is_end {
            // Idempotent: only the transition that actually flipped the
            // status appends the terminal envelope.
            if !db_task.end_call(&cid)? {
                return Ok(None);
            }
        } else if !call.is_active() {
            return Err(RelayError::CallOver);
        }

        Ok(Some(db_task.append_signal(&cid, &sid, kind, &payload)?))
    })
    .await
    .map_err(|_| RelayError::TaskFailed)??;

    let Some(row) = row else {
        return Ok(None);
    };

    let envelope = SignalEnvelope {
        seq: row.seq,
        call_id,
        sender_id,
        signal,
        created_at: parse_timestamp(&row.created_at),
    };

    dispatcher.notify_signal(call_id).await;
    Ok(Some(envelope))
}

/// End a call on behalf of a participant. Returns true only when this
/// request performed the transition.
pub async fn end_call(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    call_id: Uuid,
    user_id: Uuid,
    reason: EndReason,
) -> Result<bool, RelayError> {
    let ended = relay_signal(
        db,
        dispatcher,
        call_id,
        user_id,
        SignalPayload::CallEnded { reason },
    )
    .await?;
    Ok(ended.is_some())
}

/// Rehydrate a stored signal row into a wire envelope. Rows that no longer
/// parse are logged and skipped rather than wedging the stream.
pub fn envelope_from_row(row: &SignalRow) -> Option<SignalEnvelope> {
    let call_id = match row.call_id.parse::<Uuid>() {
        Ok(id) => id,
        Err(e) => {
            warn!("Corrupt call_id '{}' on signal {}: {}", row.call_id, row.seq, e);
            return None;
        }
    };
    let sender_id = match row.sender_id.parse::<Uuid>() {
        Ok(id) => id,
        Err(e) => {
            warn!("Corrupt sender_id '{}' on signal {}: {}", row.sender_id, row.seq, e);
            return None;
        }
    };
    let signal = match serde_json::from_str::<SignalPayload>(&row.payload) {
        Ok(signal) => signal,
        Err(e) => {
            warn!("Corrupt payload on signal {}: {}", row.seq, e);
            return None;
        }
    };

    Some(SignalEnvelope {
        seq: row.seq,
        call_id,
        sender_id,
        signal,
        created_at: parse_timestamp(&row.created_at),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt created_at '{}': {}", raw, e);
        Utc::now()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    fn seed_call(db: &Arc<Database>) -> (Uuid, Uuid, Uuid) {
        let caller = Uuid::new_v4();
        let callee = Uuid::new_v4();
        db.create_user(&caller.to_string(), "caller", "hash").unwrap();
        db.create_user(&callee.to_string(), "callee", "hash").unwrap();
        db.enqueue(&callee.to_string()).unwrap();
        db.enqueue(&caller.to_string()).unwrap();
        let call = db.claim_partner(&caller.to_string()).unwrap().unwrap();
        (call.id.parse().unwrap(), caller, callee)
    }

    #[tokio::test]
    async fn relay_appends_and_notifies_subscribers() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (call_id, caller, callee) = seed_call(&db);

        let (_conn, mut rx) = dispatcher.register_user_channel(callee).await;
        dispatcher.subscribe_call(call_id, callee).await;

        let env = relay_signal(
            &db,
            &dispatcher,
            call_id,
            caller,
            SignalPayload::Offer { sdp: "v=0".into() },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(env.sender_id, caller);

        assert!(matches!(
            rx.recv().await,
            Some(crate::dispatcher::UserMessage::SignalNotify { .. })
        ));

        let rows = db.signals_after(&call_id.to_string(), 0).unwrap();
        assert_eq!(rows.len(), 1);
        let stored = envelope_from_row(&rows[0]).unwrap();
        assert_eq!(stored.signal, env.signal);
    }

    #[tokio::test]
    async fn outsider_cannot_relay_into_a_call() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (call_id, _caller, _callee) = seed_call(&db);
        let outsider = Uuid::new_v4();
        db.create_user(&outsider.to_string(), "outsider", "hash")
            .unwrap();

        let err = relay_signal(
            &db,
            &dispatcher,
            call_id,
            outsider,
            SignalPayload::Offer { sdp: "v=0".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::NotParticipant));
    }

    #[tokio::test]
    async fn end_call_transitions_once_and_appends_terminal_signal() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (call_id, caller, callee) = seed_call(&db);

        assert!(
            end_call(&db, &dispatcher, call_id, caller, EndReason::UserDisconnect)
                .await
                .unwrap()
        );
        // Peer ending again is a no-op, and no second terminal envelope
        // is appended.
        assert!(
            !end_call(&db, &dispatcher, call_id, callee, EndReason::UserDisconnect)
                .await
                .unwrap()
        );

        let rows = db.signals_after(&call_id.to_string(), 0).unwrap();
        let ended: Vec<_> = rows
            .iter()
            .filter(|r| r.signal_type == "call-ended")
            .collect();
        assert_eq!(ended.len(), 1);
    }

    #[tokio::test]
    async fn offer_into_ended_call_is_rejected() {
        let db = test_db();
        let dispatcher = Dispatcher::new();
        let (call_id, caller, _callee) = seed_call(&db);

        end_call(&db, &dispatcher, call_id, caller, EndReason::UserDisconnect)
            .await
            .unwrap();

        let err = relay_signal(
            &db,
            &dispatcher,
            call_id,
            caller,
            SignalPayload::Offer { sdp: "v=0".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::CallOver));
    }
}
