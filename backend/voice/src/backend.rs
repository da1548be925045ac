//! Call-control backend client.
//!
//! The backend mints access tokens and serves the call records produced by
//! its status / recording / transcription webhooks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use callhub_core::{CallStats, PagedCallList, Transcript};

/// Transport-level failure talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Every failed exchange is worth another try except a 404, which will
    /// not change, and a body that could not be decoded.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { .. } => !self.is_not_found(),
            Self::Decode(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::Status { status: 400, .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Body of `POST /api/token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    pub identity: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Query parameters of `GET /api/calls/:identity`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl HistoryQuery {
    pub fn page(limit: u32, offset: u32) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
            ..Self::default()
        }
    }
}

/// The backend operations the subsystem consumes.
#[async_trait]
pub trait CallControlApi: Send + Sync {
    async fn request_token(&self, identity: &str) -> Result<TokenGrant, BackendError>;

    async fn fetch_transcript(&self, call_sid: &str) -> Result<Transcript, BackendError>;

    async fn fetch_calls(
        &self,
        identity: &str,
        query: &HistoryQuery,
    ) -> Result<PagedCallList, BackendError>;

    async fn fetch_stats(&self, identity: &str) -> Result<CallStats, BackendError>;

    async fn health(&self) -> Result<bool, BackendError>;
}

/// `reqwest` implementation of [`CallControlApi`].
pub struct HttpCallControl {
    client: Client,
    base_url: String,
}

impl HttpCallControl {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => parsed.error,
            Err(_) if body.trim().is_empty() => status.to_string(),
            Err(_) => body,
        };
        return Err(BackendError::Status {
            status: status.as_u16(),
            message,
        });
    }
    resp.json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl CallControlApi for HttpCallControl {
    async fn request_token(&self, identity: &str) -> Result<TokenGrant, BackendError> {
        #[derive(Serialize)]
        struct Body<'a> {
            identity: &'a str,
        }

        debug!(identity, "Requesting access token");
        let resp = self
            .client
            .post(self.url("/api/token"))
            .json(&Body { identity })
            .send()
            .await?;
        read_json(resp).await
    }

    async fn fetch_transcript(&self, call_sid: &str) -> Result<Transcript, BackendError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/transcript/{call_sid}")))
            .send()
            .await?;
        read_json(resp).await
    }

    async fn fetch_calls(
        &self,
        identity: &str,
        query: &HistoryQuery,
    ) -> Result<PagedCallList, BackendError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/calls/{identity}")))
            .query(query)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn fetch_stats(&self, identity: &str) -> Result<CallStats, BackendError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/stats/{identity}")))
            .send()
            .await?;
        read_json(resp).await
    }

    async fn health(&self) -> Result<bool, BackendError> {
        let resp = self.client.get(self.url("/health")).send().await?;
        Ok(resp.status().is_success())
    }
}
