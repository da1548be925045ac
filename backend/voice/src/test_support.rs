//! Shared fakes for the crate's unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;

use callhub_core::{
    CallDirection, CallHistoryItem, CallInfo, CallStats, PagedCallList, Pagination, Transcript,
};

use crate::backend::{BackendError, CallControlApi, HistoryQuery, TokenGrant};
use crate::engine::SimulatedEngine;
use crate::retry::RetryPolicy;

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unsigned JWT carrying `exp` (when given) and a unique `jti`.
pub fn jwt_with_exp(exp: Option<i64>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let mut claims = json!({ "jti": TOKEN_SEQ.fetch_add(1, Ordering::SeqCst) });
    if let Some(exp) = exp {
        claims["exp"] = json!(exp);
    }
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

pub fn status(status: u16, message: &str) -> BackendError {
    BackendError::Status {
        status,
        message: message.to_string(),
    }
}

pub fn sid(fill: char) -> String {
    format!("CA{}", fill.to_string().repeat(32))
}

pub fn transcript(call_sid: &str) -> Transcript {
    Transcript {
        call_sid: call_sid.to_string(),
        transcript: Some("Hello, this is a test call.".into()),
        status: "completed".into(),
        duration: Some(42),
        recording_url: Some(format!("https://recordings.example.com/{call_sid}.mp3")),
        call_info: CallInfo {
            from: Some("client:alice".into()),
            to: Some("+15551234567".into()),
            start_time: None,
            end_time: None,
            direction: Some(CallDirection::Outbound),
        },
    }
}

pub fn history_item(call_sid: &str, direction: CallDirection) -> CallHistoryItem {
    CallHistoryItem {
        call_sid: call_sid.to_string(),
        to: Some("+15551234567".into()),
        duration: Some(30),
        start_time: None,
        end_time: None,
        status: "completed".into(),
        direction,
        has_transcript: true,
        has_recording: true,
    }
}

/// Policy with the production backoff shape.
pub fn policy() -> RetryPolicy {
    RetryPolicy::default()
}

#[derive(Default)]
struct Knobs {
    token_exp: Option<i64>,
    token_delay: Duration,
    token_failures: VecDeque<u16>,
    transcript_failures: VecDeque<u16>,
    history_failures: VecDeque<u16>,
    transcripts: HashMap<String, Transcript>,
    calls: Vec<CallHistoryItem>,
    healthy: Option<bool>,
    last_query: Option<HistoryQuery>,
}

/// In-memory [`CallControlApi`] with request counters and failure injection.
#[derive(Default)]
pub struct FakeBackend {
    pub token_requests: AtomicU32,
    pub transcript_requests: AtomicU32,
    pub history_requests: AtomicU32,
    pub stats_requests: AtomicU32,
    knobs: Mutex<Knobs>,
}

impl FakeBackend {
    fn knobs(&self) -> std::sync::MutexGuard<'_, Knobs> {
        self.knobs.lock().unwrap()
    }

    pub fn set_token_exp(&self, exp: i64) {
        self.knobs().token_exp = Some(exp);
    }

    pub fn set_token_delay(&self, delay: Duration) {
        self.knobs().token_delay = delay;
    }

    /// Answer the next `count` token requests with HTTP `status`.
    pub fn fail_token_requests(&self, count: usize, status: u16) {
        self.knobs().token_failures.extend(std::iter::repeat(status).take(count));
    }

    pub fn fail_transcript_requests(&self, count: usize, status: u16) {
        self.knobs().transcript_failures.extend(std::iter::repeat(status).take(count));
    }

    pub fn fail_history_requests(&self, count: usize, status: u16) {
        self.knobs().history_failures.extend(std::iter::repeat(status).take(count));
    }

    pub fn add_transcript(&self, transcript: Transcript) {
        self.knobs()
            .transcripts
            .insert(transcript.call_sid.clone(), transcript);
    }

    pub fn add_call(&self, item: CallHistoryItem) {
        self.knobs().calls.push(item);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.knobs().healthy = Some(healthy);
    }

    pub fn last_query(&self) -> Option<HistoryQuery> {
        self.knobs().last_query.clone()
    }
}

#[async_trait]
impl CallControlApi for FakeBackend {
    async fn request_token(&self, identity: &str) -> Result<TokenGrant, BackendError> {
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        let (delay, failure, exp) = {
            let mut knobs = self.knobs();
            (knobs.token_delay, knobs.token_failures.pop_front(), knobs.token_exp)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = failure {
            return Err(status(code, "token service unavailable"));
        }
        let exp = exp.unwrap_or_else(|| Utc::now().timestamp() + 3600);
        Ok(TokenGrant {
            access_token: jwt_with_exp(Some(exp)),
            identity: identity.to_string(),
            expires_at: None,
        })
    }

    async fn fetch_transcript(&self, call_sid: &str) -> Result<Transcript, BackendError> {
        self.transcript_requests.fetch_add(1, Ordering::SeqCst);
        let mut knobs = self.knobs();
        if let Some(code) = knobs.transcript_failures.pop_front() {
            return Err(status(code, "transcription service unavailable"));
        }
        knobs
            .transcripts
            .get(call_sid)
            .cloned()
            .ok_or_else(|| status(404, &format!("Call not found: {call_sid}")))
    }

    async fn fetch_calls(
        &self,
        _identity: &str,
        query: &HistoryQuery,
    ) -> Result<PagedCallList, BackendError> {
        self.history_requests.fetch_add(1, Ordering::SeqCst);
        let mut knobs = self.knobs();
        knobs.last_query = Some(query.clone());
        if let Some(code) = knobs.history_failures.pop_front() {
            return Err(status(code, "history unavailable"));
        }

        let limit = query.limit.unwrap_or(50) as usize;
        let offset = query.offset.unwrap_or(0) as usize;
        let matching: Vec<_> = knobs
            .calls
            .iter()
            .filter(|c| query.status.as_deref().map_or(true, |s| c.status == s))
            .filter(|c| {
                query.kind.as_deref().map_or(true, |k| match c.direction {
                    CallDirection::Inbound => k == "inbound",
                    CallDirection::Outbound => k == "outbound",
                })
            })
            .cloned()
            .collect();
        let total = matching.len();
        let calls: Vec<_> = matching.into_iter().skip(offset).take(limit).collect();
        Ok(PagedCallList {
            calls,
            pagination: Pagination {
                total: total as u64,
                limit: limit as u64,
                offset: offset as u64,
                has_more: offset + limit < total,
            },
        })
    }

    async fn fetch_stats(&self, _identity: &str) -> Result<CallStats, BackendError> {
        self.stats_requests.fetch_add(1, Ordering::SeqCst);
        let knobs = self.knobs();
        let completed: Vec<_> = knobs.calls.iter().filter(|c| c.status == "completed").collect();
        let total_duration: u64 = knobs.calls.iter().filter_map(|c| c.duration).sum();
        let total = knobs.calls.len() as u64;
        Ok(CallStats {
            total_calls: total,
            completed_calls: completed.len() as u64,
            total_duration,
            average_duration: if total == 0 { 0 } else { total_duration / total },
            calls_with_transcripts: knobs.calls.iter().filter(|c| c.has_transcript).count() as u64,
            calls_with_recordings: knobs.calls.iter().filter(|c| c.has_recording).count() as u64,
        })
    }

    async fn health(&self) -> Result<bool, BackendError> {
        match self.knobs().healthy {
            Some(false) => Err(BackendError::Transport("connection refused".into())),
            _ => Ok(true),
        }
    }
}

/// Engine and backend pair behind `Arc`s, ready to hand to a controller.
pub fn fakes() -> (Arc<SimulatedEngine>, Arc<FakeBackend>) {
    (Arc::new(SimulatedEngine::new()), Arc::new(FakeBackend::default()))
}
