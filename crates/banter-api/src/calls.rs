use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{error, info};
use uuid::Uuid;

use banter_gateway::relay::{self, RelayError};
use banter_types::api::{Claims, EndCallRequest, EndCallResponse};

use crate::auth::AppState;
use crate::matchmaking::storage_status;

/// End a call on behalf of one participant.
///
/// The status flip and the terminal `call-ended` envelope happen together
/// in the relay, so the transition is recorded durably (and the peer is
/// notified) before the client advances to post-call. Ending a call that
/// is already over reports `ended: false` and changes nothing.
pub async fn end_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EndCallRequest>,
) -> Result<Json<EndCallResponse>, StatusCode> {
    match relay::end_call(&state.db, &state.dispatcher, call_id, claims.sub, req.reason).await {
        Ok(ended) => {
            if ended {
                info!(
                    "{} ({}) ended call {} ({:?})",
                    claims.username, claims.sub, call_id, req.reason
                );
            }
            Ok(Json(EndCallResponse { ended }))
        }
        Err(RelayError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(RelayError::NotParticipant) => Err(StatusCode::FORBIDDEN),
        Err(RelayError::Store(e)) => {
            error!("End call {} failed: {}", call_id, e);
            Err(storage_status(&e))
        }
        Err(e) => {
            error!("End call {} failed: {}", call_id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::AppStateInner;
    use crate::matchmaking::start_search;
    use banter_db::Database;
    use banter_gateway::dispatcher::Dispatcher;
    use banter_types::models::EndReason;

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::new(),
            jwt_secret: "test-secret".into(),
        })
    }

    fn seed_claims(state: &AppState, name: &str) -> Claims {
        let id = Uuid::new_v4();
        state.db.create_user(&id.to_string(), name, "hash").unwrap();
        Claims {
            sub: id,
            username: name.to_string(),
            exp: 0,
        }
    }

    async fn seed_matched_call(state: &AppState) -> (Claims, Claims, Uuid) {
        let a = seed_claims(state, "a");
        let b = seed_claims(state, "b");
        start_search(State(state.clone()), Extension(a.clone()))
            .await
            .unwrap();
        let resp = start_search(State(state.clone()), Extension(b.clone()))
            .await
            .unwrap();
        let call_id = resp.0.call.unwrap().call_id;
        (a, b, call_id)
    }

    #[tokio::test]
    async fn double_end_is_a_no_op() {
        let state = test_state();
        let (a, b, call_id) = seed_matched_call(&state).await;

        let first = end_call(
            State(state.clone()),
            Path(call_id),
            Extension(a),
            Json(EndCallRequest {
                reason: EndReason::UserDisconnect,
            }),
        )
        .await
        .unwrap();
        assert!(first.0.ended);

        let second = end_call(
            State(state.clone()),
            Path(call_id),
            Extension(b),
            Json(EndCallRequest {
                reason: EndReason::ConnectionFailed,
            }),
        )
        .await
        .unwrap();
        assert!(!second.0.ended);
    }

    #[tokio::test]
    async fn outsider_cannot_end_a_call() {
        let state = test_state();
        let (_a, _b, call_id) = seed_matched_call(&state).await;
        let outsider = seed_claims(&state, "outsider");

        let err = end_call(
            State(state.clone()),
            Path(call_id),
            Extension(outsider),
            Json(EndCallRequest {
                reason: EndReason::UserDisconnect,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::FORBIDDEN);
    }
}
