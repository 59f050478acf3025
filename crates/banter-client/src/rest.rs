use std::sync::RwLock;

use reqwest::{RequestBuilder, Response, StatusCode};
use uuid::Uuid;

use banter_types::api::{
    EndCallRequest, EndCallResponse, FeedbackRequest, FriendRequestCreate, LoginRequest,
    LoginResponse, RegisterRequest, RegisterResponse, SearchResponse,
};
use banter_types::models::EndReason;

use crate::backoff;
use crate::error::ApiError;

/// REST surface of the banter server. Transient failures (timeouts,
/// refused connections, 503) are retried with bounded backoff before an
/// error reaches the caller.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    /// Install a token obtained elsewhere (e.g. a persisted session).
    pub fn set_token(&self, token: String) {
        *self.token.write().expect("token lock poisoned") = Some(token);
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<RegisterResponse, ApiError> {
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(&RegisterRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: RegisterResponse = expect_success(resp).await?.json().await?;
        self.set_token(body.token.clone());
        Ok(body)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let body: LoginResponse = expect_success(resp).await?.json().await?;
        self.set_token(body.token.clone());
        Ok(body)
    }

    /// Join the queue and try to claim a partner. Safe to call repeatedly
    /// while waiting — re-enqueueing is a no-op server-side.
    pub async fn start_search(&self) -> Result<SearchResponse, ApiError> {
        self.retrying(|| async {
            let resp = self.authed(self.http.post(self.url("/match/search")))?.send().await?;
            Ok(expect_success(resp).await?.json().await?)
        })
        .await
    }

    pub async fn cancel_search(&self) -> Result<(), ApiError> {
        self.retrying(|| async {
            let resp = self.authed(self.http.post(self.url("/match/cancel")))?.send().await?;
            expect_success(resp).await?;
            Ok(())
        })
        .await
    }

    /// Returns true when this request performed the transition; false when
    /// the call was already over.
    pub async fn end_call(&self, call_id: Uuid, reason: EndReason) -> Result<bool, ApiError> {
        self.retrying(|| async {
            let resp = self
                .authed(self.http.post(self.url(&format!("/calls/{}/end", call_id))))?
                .json(&EndCallRequest { reason })
                .send()
                .await?;
            let body: EndCallResponse = expect_success(resp).await?.json().await?;
            Ok(body.ended)
        })
        .await
    }

    pub async fn submit_feedback(
        &self,
        call_id: Uuid,
        rating: u8,
        feedback_text: Option<&str>,
    ) -> Result<(), ApiError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/calls/{}/feedback", call_id))))?
            .json(&FeedbackRequest {
                rating,
                feedback_text: feedback_text.map(str::to_string),
            })
            .send()
            .await?;
        expect_success(resp).await?;
        Ok(())
    }

    pub async fn send_friend_request(&self, receiver_id: Uuid) -> Result<(), ApiError> {
        let resp = self
            .authed(self.http.post(self.url("/friends/requests")))?
            .json(&FriendRequestCreate { receiver_id })
            .send()
            .await?;
        expect_success(resp).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.token().ok_or(ApiError::Unauthorized)?;
        Ok(builder.bearer_auth(token))
    }

    async fn retrying<T, Fut, F>(&self, op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        backoff::with_backoff_if(op, ApiError::is_transient).await
    }
}

async fn expect_success(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::CONFLICT => ApiError::Conflict,
        StatusCode::SERVICE_UNAVAILABLE => ApiError::Unavailable,
        s => ApiError::Unexpected(s.as_u16()),
    })
}
