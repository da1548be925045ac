//! Call History/Transcript Client.
//!
//! Reads the call records the backend builds from its webhooks. Requests go
//! through the same backoff policy as token acquisition; client errors
//! (unknown SID, bad request) surface on the first attempt.

use std::sync::Arc;

use tracing::{debug, info, warn};

use callhub_core::validate::{is_valid_call_sid, is_valid_identity};
use callhub_core::{CallError, CallResult, CallStats, PagedCallList, Transcript};

use crate::backend::{BackendError, CallControlApi, HistoryQuery};
use crate::retry::{retry_with_backoff, Exhausted, RetryPolicy};

pub struct HistoryClient {
    api: Arc<dyn CallControlApi>,
    identity: String,
    policy: RetryPolicy,
}

impl HistoryClient {
    pub fn new(api: Arc<dyn CallControlApi>, identity: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            api,
            identity: identity.into(),
            policy,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn get_transcript(&self, call_sid: &str) -> CallResult<Transcript> {
        if !is_valid_call_sid(call_sid) {
            return Err(CallError::InvalidArgument(format!(
                "call SID {call_sid:?} must match ^CA[a-f0-9]{{32}}$"
            )));
        }
        let transcript = retry_with_backoff(&self.policy, "transcript", BackendError::is_retryable, || {
            self.api.fetch_transcript(call_sid)
        })
        .await
        .map_err(|e| to_call_error(e, call_sid))?;

        debug!(
            call_sid,
            status = %transcript.status,
            has_text = transcript.transcript.is_some(),
            "Transcript fetched"
        );
        Ok(transcript)
    }

    /// One page of call history. An empty page is a normal result.
    pub async fn get_history(&self, query: HistoryQuery) -> CallResult<PagedCallList> {
        self.check_identity()?;
        let page = retry_with_backoff(&self.policy, "history", BackendError::is_retryable, || {
            self.api.fetch_calls(&self.identity, &query)
        })
        .await
        .map_err(|e| to_call_error(e, &self.identity))?;

        info!(
            identity = %self.identity,
            returned = page.calls.len(),
            total = page.pagination.total,
            "Call history fetched"
        );
        Ok(page)
    }

    pub async fn stats(&self) -> CallResult<CallStats> {
        self.check_identity()?;
        retry_with_backoff(&self.policy, "stats", BackendError::is_retryable, || {
            self.api.fetch_stats(&self.identity)
        })
        .await
        .map_err(|e| to_call_error(e, &self.identity))
    }

    /// `true` when the backend answers its health probe. Never retried.
    pub async fn health_check(&self) -> bool {
        match self.api.health().await {
            Ok(healthy) => healthy,
            Err(err) => {
                warn!(error = %err, "Backend health check failed");
                false
            }
        }
    }

    fn check_identity(&self) -> CallResult<()> {
        if is_valid_identity(&self.identity) {
            Ok(())
        } else {
            Err(CallError::InvalidArgument(format!(
                "identity {:?} must match ^[a-zA-Z0-9_-]+$",
                self.identity
            )))
        }
    }
}

fn to_call_error(exhausted: Exhausted<BackendError>, subject: &str) -> CallError {
    match exhausted.error {
        err if err.is_not_found() => CallError::NotFound(subject.to_string()),
        err if err.is_bad_request() => CallError::InvalidArgument(err.to_string()),
        err => CallError::Backend(format!("{err} (after {} attempt(s))", exhausted.attempts)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{history_item, policy, sid, transcript, FakeBackend};
    use callhub_core::CallDirection;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn client(api: &Arc<FakeBackend>) -> HistoryClient {
        HistoryClient::new(api.clone(), "alice", policy())
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_sid_is_not_found_without_retry() {
        let api = Arc::new(FakeBackend::default());
        let started = tokio::time::Instant::now();

        let err = client(&api).get_transcript(&sid('a')).await.unwrap_err();
        assert!(matches!(err, CallError::NotFound(_)));
        assert_eq!(api.transcript_requests.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn malformed_sid_never_reaches_backend() {
        let api = Arc::new(FakeBackend::default());
        let uppercase = sid('A');
        for bad in ["", "CA123", "XX0123456789abcdef0123456789abcdef", uppercase.as_str()] {
            let err = client(&api).get_transcript(bad).await.unwrap_err();
            assert!(matches!(err, CallError::InvalidArgument(_)), "{bad:?}");
        }
        assert_eq!(api.transcript_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let api = Arc::new(FakeBackend::default());
        api.add_transcript(transcript(&sid('b')));
        api.fail_transcript_requests(2, 503);

        let found = client(&api).get_transcript(&sid('b')).await.unwrap();
        assert_eq!(found.duration, Some(42));
        assert_eq!(api.transcript_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_backend_error() {
        let api = Arc::new(FakeBackend::default());
        api.fail_history_requests(5, 500);

        let err = client(&api).get_history(HistoryQuery::default()).await.unwrap_err();
        assert!(matches!(err, CallError::Backend(ref m) if m.contains("3 attempt")));
        assert_eq!(api.history_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_history_is_ok() {
        let api = Arc::new(FakeBackend::default());
        let page = client(&api).get_history(HistoryQuery::page(20, 0)).await.unwrap();
        assert!(page.calls.is_empty());
        assert!(!page.pagination.has_more);
    }

    #[tokio::test]
    async fn pagination_and_filters_pass_through() {
        let api = Arc::new(FakeBackend::default());
        for (fill, direction) in [
            ('1', CallDirection::Outbound),
            ('2', CallDirection::Inbound),
            ('3', CallDirection::Outbound),
            ('4', CallDirection::Outbound),
        ] {
            api.add_call(history_item(&sid(fill), direction));
        }

        let query = HistoryQuery {
            limit: Some(2),
            offset: Some(1),
            status: None,
            kind: Some("outbound".into()),
        };
        let page = client(&api).get_history(query.clone()).await.unwrap();
        assert_eq!(api.last_query(), Some(query));
        assert_eq!(page.calls.len(), 2);
        assert_eq!(page.calls[0].call_sid, sid('3'));
        assert_eq!(page.pagination.total, 3);
        assert!(!page.pagination.has_more);
    }

    #[tokio::test]
    async fn stats_and_health() {
        let api = Arc::new(FakeBackend::default());
        api.add_call(history_item(&sid('1'), CallDirection::Outbound));
        let history = client(&api);

        let stats = history.stats().await.unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.average_duration, 30);

        assert!(history.health_check().await);
        api.set_healthy(false);
        assert!(!history.health_check().await);
    }
}
