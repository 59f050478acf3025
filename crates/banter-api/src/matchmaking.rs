use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::{error, info};
use uuid::Uuid;

use banter_db::StoreError;
use banter_types::api::{Claims, SearchResponse, SearchStatus};
use banter_types::events::GatewayEvent;
use banter_types::models::MatchedCall;

use crate::auth::AppState;
use crate::retry;

/// Join the matchmaking queue and try to claim a partner.
///
/// Re-entering while already queued is a no-op, so a client may call this
/// repeatedly while waiting. When no partner is available the caller stays
/// queued and is later notified by `MatchFound` through the gateway; when
/// a partner is claimed, both sides converge on the same call data with
/// this caller as the initiator.
pub async fn start_search(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<SearchResponse>, StatusCode> {
    let user_id = claims.sub;

    // A user already on a live call cannot queue for a second one.
    let db = state.db.clone();
    let uid = user_id.to_string();
    let active = retry::run_blocking(move || db.active_call_for(&uid))
        .await
        .map_err(|e| {
            error!("Active-call lookup failed for {}: {}", user_id, e);
            storage_status(&e)
        })?;
    if active.is_some() {
        return Err(StatusCode::CONFLICT);
    }

    let claimed = retry::with_backoff(|| {
        let db = state.db.clone();
        let uid = user_id.to_string();
        async move {
            retry::run_blocking(move || {
                db.enqueue(&uid)?;
                db.claim_partner(&uid)
            })
            .await
        }
    })
    .await
    .map_err(|e| {
        error!("Matchmaking failed for {}: {}", user_id, e);
        storage_status(&e)
    })?;

    let Some(call) = claimed else {
        info!("{} ({}) is searching for a partner", claims.username, user_id);
        return Ok(Json(SearchResponse {
            status: SearchStatus::Searching,
            call: None,
        }));
    };

    let call_id: Uuid = call
        .id
        .parse()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let partner_id: Uuid = call
        .callee_id
        .parse()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let db = state.db.clone();
    let pid = call.callee_id.clone();
    let partner_username = retry::run_blocking(move || db.get_username_by_id(&pid))
        .await
        .map_err(|e| {
            error!("Partner lookup failed for call {}: {}", call_id, e);
            storage_status(&e)
        })?;

    info!(
        "{} ({}) matched with {} ({}) in call {}",
        claims.username, user_id, partner_username, partner_id, call_id
    );

    // The claimed side learns of the match by push; this side gets it in
    // the response. Both carry identical session data.
    state
        .dispatcher
        .send_to_user(
            partner_id,
            GatewayEvent::MatchFound(MatchedCall {
                call_id,
                partner_id: user_id,
                partner_username: claims.username.clone(),
                initiator: false,
            }),
        )
        .await;

    Ok(Json(SearchResponse {
        status: SearchStatus::Matched,
        call: Some(MatchedCall {
            call_id,
            partner_id,
            partner_username,
            initiator: true,
        }),
    }))
}

/// Leave the matchmaking queue. Removing an entry that is already gone
/// (matched or never queued) is a no-op.
pub async fn cancel_search(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    let user_id = claims.sub;

    let db = state.db.clone();
    let uid = user_id.to_string();
    let removed = retry::with_backoff(|| {
        let db = db.clone();
        let uid = uid.clone();
        async move { retry::run_blocking(move || db.cancel_search(&uid)).await }
    })
    .await
    .map_err(|e| {
        error!("Cancel failed for {}: {}", user_id, e);
        storage_status(&e)
    })?;

    if removed {
        info!("{} ({}) cancelled their search", claims.username, user_id);
    }

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn storage_status(e: &StoreError) -> StatusCode {
    if e.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use banter_db::Database;
    use banter_gateway::dispatcher::{Dispatcher, UserMessage};
    use crate::auth::AppStateInner;

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

    #[tokio::test]
    async fn second_searcher_matches_first_and_both_sides_converge() {
        let state = test_state();
        let user1 = seed_claims(&state, "user1");
        let user2 = seed_claims(&state, "user2");

        // user1 searches with nobody queued.
        let resp = start_search(State(state.clone()), Extension(user1.clone()))
            .await
            .unwrap();
        assert_eq!(resp.0.status, SearchStatus::Searching);
        assert!(resp.0.call.is_none());

        // user1 is listening on the gateway when user2 arrives.
        let (_conn, mut rx) = state.dispatcher.register_user_channel(user1.sub).await;

        let resp = start_search(State(state.clone()), Extension(user2.clone()))
            .await
            .unwrap();
        assert_eq!(resp.0.status, SearchStatus::Matched);
        let mine = resp.0.call.unwrap();
        assert!(mine.initiator);
        assert_eq!(mine.partner_id, user1.sub);
        assert_eq!(mine.partner_username, "user1");

        let pushed = match rx.recv().await {
            Some(UserMessage::Event(GatewayEvent::MatchFound(m))) => m,
            other => panic!("expected MatchFound, got {:?}", other),
        };
        assert_eq!(pushed.call_id, mine.call_id);
        assert_eq!(pushed.partner_id, user2.sub);
        assert_eq!(pushed.partner_username, "user2");
        assert!(!pushed.initiator);
    }

    #[tokio::test]
    async fn searching_twice_keeps_a_single_queue_entry() {
        let state = test_state();
        let user = seed_claims(&state, "solo");

        for _ in 0..2 {
            let resp = start_search(State(state.clone()), Extension(user.clone()))
                .await
                .unwrap();
            assert_eq!(resp.0.status, SearchStatus::Searching);
        }
        assert!(state.db.is_queued(&user.sub.to_string()).unwrap());
    }

    #[tokio::test]
    async fn searching_during_a_live_call_is_rejected() {
        let state = test_state();
        let user1 = seed_claims(&state, "user1");
        let user2 = seed_claims(&state, "user2");

        start_search(State(state.clone()), Extension(user1.clone()))
            .await
            .unwrap();
        start_search(State(state.clone()), Extension(user2.clone()))
            .await
            .unwrap();

        // Both are now on a call; neither may queue for a second one.
        for claims in [user1.clone(), user2] {
            let err = start_search(State(state.clone()), Extension(claims))
                .await
                .unwrap_err();
            assert_eq!(err, StatusCode::CONFLICT);
        }
        assert!(!state.db.is_queued(&user1.sub.to_string()).unwrap());
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_when_not_queued() {
        let state = test_state();
        let user = seed_claims(&state, "ghost");

        let status = cancel_search(State(state.clone()), Extension(user))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}
