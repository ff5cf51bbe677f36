//! REST bootstrap: joins a video session on the application server before the
//! call core is started.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::call::UserId;

pub const ACTIVE_STATUS: &str = "active";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("session {session_id} is not active (status: {status})")]
    NotActive { session_id: String, status: String },
}

/// Session metadata returned by the join call.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoSession {
    pub id: Value,
    pub status: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinSessionResponse {
    session: VideoSession,
    user_role: String,
    user_id: UserId,
}

#[derive(Debug, Clone)]
pub struct JoinedSession {
    pub session_id: String,
    pub user_id: UserId,
    pub user_role: String,
    pub session: VideoSession,
}

#[async_trait]
trait SessionBackend: Send + Sync {
    async fn join_session(
        &self,
        endpoint: Url,
        auth_token: Option<&str>,
    ) -> Result<JoinSessionResponse, SessionError>;
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn join_session(
        &self,
        endpoint: Url,
        auth_token: Option<&str>,
    ) -> Result<JoinSessionResponse, SessionError> {
        let mut builder = self.client.post(endpoint);
        if let Some(token) = auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(SessionError::HttpStatus(response.status()));
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|err| SessionError::InvalidResponse(err.to_string()))
    }
}

#[derive(Clone)]
pub struct SessionManager {
    base_url: Url,
    bearer_token: Option<String>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionManager {
    pub fn new(base_url: &Url, bearer_token: Option<String>) -> Result<Self, SessionError> {
        Ok(Self {
            base_url: base_url.clone(),
            bearer_token: bearer_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            backend: Arc::new(ReqwestSessionBackend::new()?),
        })
    }

    #[cfg(test)]
    fn with_backend(base_url: Url, backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            base_url,
            bearer_token: None,
            backend,
        }
    }

    pub fn join_url(&self, session_id: &str) -> Result<Url, SessionError> {
        self.base_url
            .join(&format!("/api/video-sessions/{session_id}/join"))
            .map_err(|err| {
                SessionError::InvalidConfig(format!(
                    "invalid join endpoint for session {session_id}: {err}"
                ))
            })
    }

    /// Joins `session_id`; only an `active` session yields a call identity.
    pub async fn join(&self, session_id: &str) -> Result<JoinedSession, SessionError> {
        let session_id = session_id.trim();
        if session_id.is_empty() || session_id.contains(['/', '?', '#']) {
            return Err(SessionError::InvalidConfig(format!(
                "invalid session id {session_id:?}"
            )));
        }
        let endpoint = self.join_url(session_id)?;
        let JoinSessionResponse {
            session,
            user_role,
            user_id,
        } = self
            .backend
            .join_session(endpoint, self.bearer_token.as_deref())
            .await?;
        tracing::debug!(
            target = "session",
            session_id,
            user_id,
            user_role = %user_role,
            status = %session.status,
            "video session join response"
        );

        if session.status != ACTIVE_STATUS {
            return Err(SessionError::NotActive {
                session_id: session_id.to_string(),
                status: session.status,
            });
        }

        Ok(JoinedSession {
            session_id: session_id.to_string(),
            user_id,
            user_role,
            session,
        })
    }
}
