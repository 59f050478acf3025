use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use tracing::{error, info};
use uuid::Uuid;

use banter_db::StoreError;
use banter_types::api::{Claims, FeedbackRequest, FriendRequestCreate};
use banter_types::models::MAX_FEEDBACK_CHARS;

use crate::auth::AppState;
use crate::matchmaking::storage_status;
use crate::retry;

/// Record a participant's rating of a finished call. One submission per
/// user per call; the workflow on the client closes after this.
pub async fn submit_feedback(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<FeedbackRequest>,
) -> Result<StatusCode, StatusCode> {
    if !(1..=5).contains(&req.rating) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let text = req
        .feedback_text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    if let Some(t) = &text {
        if t.chars().count() > MAX_FEEDBACK_CHARS {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    let db = state.db.clone();
    let cid = call_id.to_string();
    let call = retry::run_blocking(move || db.get_call(&cid))
        .await
        .map_err(|e| {
            error!("Feedback lookup failed for call {}: {}", call_id, e);
            storage_status(&e)
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    if !call.has_participant(&claims.sub.to_string()) {
        return Err(StatusCode::FORBIDDEN);
    }
    // Feedback only exists for finished calls.
    if call.is_active() {
        return Err(StatusCode::CONFLICT);
    }

    let db = state.db.clone();
    let cid = call_id.to_string();
    let uid = claims.sub.to_string();
    let rating = req.rating;
    let result = retry::run_blocking(move || {
        db.insert_feedback(
            &Uuid::new_v4().to_string(),
            &cid,
            &uid,
            rating,
            text.as_deref(),
        )
    })
    .await;

    match result {
        Ok(()) => {
            info!(
                "{} ({}) rated call {} with {}",
                claims.username, claims.sub, call_id, rating
            );
            Ok(StatusCode::CREATED)
        }
        Err(StoreError::Duplicate) => Err(StatusCode::CONFLICT),
        Err(e) => {
            error!("Feedback insert failed for call {}: {}", call_id, e);
            Err(storage_status(&e))
        }
    }
}

/// Send a friend request to the call partner. A repeat request to the same
/// receiver is answered with 409 so the UI can say "already sent" instead
/// of reporting a failure.
pub async fn send_friend_request(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<FriendRequestCreate>,
) -> Result<StatusCode, StatusCode> {
    if req.receiver_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let rid = req.receiver_id.to_string();
    let receiver = retry::run_blocking(move || db.get_user_by_id(&rid))
        .await
        .map_err(|e| {
            error!("Friend request lookup failed: {}", e);
            storage_status(&e)
        })?;
    if receiver.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let db = state.db.clone();
    let sid = claims.sub.to_string();
    let rid = req.receiver_id.to_string();
    let result =
        retry::run_blocking(move || db.insert_friend_request(&Uuid::new_v4().to_string(), &sid, &rid))
            .await;

    match result {
        Ok(()) => {
            info!(
                "{} ({}) sent a friend request to {}",
                claims.username, claims.sub, req.receiver_id
            );
            Ok(StatusCode::CREATED)
        }
        Err(StoreError::Duplicate) => Err(StatusCode::CONFLICT),
        Err(e) => {
            error!("Friend request insert failed: {}", e);
            Err(storage_status(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::AppStateInner;
    use crate::calls::end_call;
    use crate::matchmaking::start_search;
    use banter_db::Database;
    use banter_gateway::dispatcher::Dispatcher;
    use banter_types::api::{EndCallRequest, SearchStatus};
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

    async fn seed_ended_call(state: &AppState) -> (Claims, Claims, Uuid) {
        let a = seed_claims(state, "a");
        let b = seed_claims(state, "b");
        start_search(State(state.clone()), Extension(a.clone()))
            .await
            .unwrap();
        let resp = start_search(State(state.clone()), Extension(b.clone()))
            .await
            .unwrap();
        assert_eq!(resp.0.status, SearchStatus::Matched);
        let call_id = resp.0.call.unwrap().call_id;
        end_call(
            State(state.clone()),
            Path(call_id),
            Extension(a.clone()),
            Json(EndCallRequest {
                reason: EndReason::UserDisconnect,
            }),
        )
        .await
        .unwrap();
        (a, b, call_id)
    }

    #[tokio::test]
    async fn feedback_is_stored_once_per_user() {
        let state = test_state();
        let (a, _b, call_id) = seed_ended_call(&state).await;

        let status = submit_feedback(
            State(state.clone()),
            Path(call_id),
            Extension(a.clone()),
            Json(FeedbackRequest {
                rating: 5,
                feedback_text: Some("Great chat".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let err = submit_feedback(
            State(state.clone()),
            Path(call_id),
            Extension(a),
            Json(FeedbackRequest {
                rating: 4,
                feedback_text: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn feedback_validates_rating_and_length() {
        let state = test_state();
        let (a, _b, call_id) = seed_ended_call(&state).await;

        let err = submit_feedback(
            State(state.clone()),
            Path(call_id),
            Extension(a.clone()),
            Json(FeedbackRequest {
                rating: 0,
                feedback_text: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);

        let err = submit_feedback(
            State(state.clone()),
            Path(call_id),
            Extension(a),
            Json(FeedbackRequest {
                rating: 3,
                feedback_text: Some("x".repeat(MAX_FEEDBACK_CHARS + 1)),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn feedback_requires_an_ended_call() {
        let state = test_state();
        let a = seed_claims(&state, "a");
        let b = seed_claims(&state, "b");
        start_search(State(state.clone()), Extension(a.clone()))
            .await
            .unwrap();
        let resp = start_search(State(state.clone()), Extension(b))
            .await
            .unwrap();
        let call_id = resp.0.call.unwrap().call_id;

        let err = submit_feedback(
            State(state.clone()),
            Path(call_id),
            Extension(a),
            Json(FeedbackRequest {
                rating: 5,
                feedback_text: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn duplicate_friend_request_is_a_distinct_conflict() {
        let state = test_state();
        let (a, b, _call_id) = seed_ended_call(&state).await;

        let status = send_friend_request(
            State(state.clone()),
            Extension(a.clone()),
            Json(FriendRequestCreate { receiver_id: b.sub }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let err = send_friend_request(
            State(state.clone()),
            Extension(a.clone()),
            Json(FriendRequestCreate { receiver_id: b.sub }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::CONFLICT);

        // Unknown receiver is not a conflict.
        let err = send_friend_request(
            State(state.clone()),
            Extension(a),
            Json(FriendRequestCreate {
                receiver_id: Uuid::new_v4(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }
}
