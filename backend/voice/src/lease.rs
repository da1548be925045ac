//! Token Lease Manager.
//!
//! Owns the single cached access token for the engine. Tokens are reused
//! until they come within `refresh_threshold` of expiry; refreshes go
//! through the backend with exponential backoff. A refresh never touches a
//! call in progress: only later `register`/`connect` calls see the new token.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use callhub_core::validate::is_valid_identity;
use callhub_core::{CallError, CallResult, TokenLease};

use crate::backend::{BackendError, CallControlApi, TokenGrant};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Lease length assumed when the token carries no readable expiry.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60 * 60);

pub struct TokenLeaseManager {
    api: Arc<dyn CallControlApi>,
    identity: String,
    policy: RetryPolicy,
    refresh_threshold: chrono::Duration,
    // Held across the network fetch so overlapping callers share one request.
    lease: Mutex<Option<TokenLease>>,
}

impl TokenLeaseManager {
    pub fn new(
        api: Arc<dyn CallControlApi>,
        identity: impl Into<String>,
        policy: RetryPolicy,
        refresh_threshold: Duration,
    ) -> Self {
        Self {
            api,
            identity: identity.into(),
            policy,
            refresh_threshold: chrono::Duration::from_std(refresh_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            lease: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Return a usable token, fetching a new lease when none is cached, the
    /// cached one is inside the refresh window, or `force_refresh` is set.
    ///
    /// On failure the cached lease (if any) is kept as-is.
    pub async fn get_token(&self, force_refresh: bool) -> CallResult<String> {
        let mut slot = self.lease.lock().await;

        if !force_refresh {
            if let Some(lease) = slot.as_ref() {
                if !lease.needs_refresh(Utc::now(), self.refresh_threshold) {
                    return Ok(lease.token.clone());
                }
                debug!(expires_at = %lease.expires_at, "Access token inside refresh window");
            }
        }

        if !is_valid_identity(&self.identity) {
            return Err(CallError::InvalidArgument(format!(
                "identity {:?} must match ^[a-zA-Z0-9_-]+$",
                self.identity
            )));
        }

        let grant = retry_with_backoff(
            &self.policy,
            "token",
            BackendError::is_retryable,
            || self.api.request_token(&self.identity),
        )
        .await
        .map_err(|exhausted| CallError::TokenAcquisition {
            attempts: exhausted.attempts,
            message: exhausted.error.to_string(),
        })?;

        let lease = lease_from_grant(grant, Utc::now());
        info!(
            identity = %lease.identity,
            expires_at = %lease.expires_at,
            "Access token acquired"
        );
        let token = lease.token.clone();
        *slot = Some(lease);
        Ok(token)
    }

    /// Snapshot of the cached lease.
    pub async fn current_lease(&self) -> Option<TokenLease> {
        self.lease.lock().await.clone()
    }

    pub async fn holds_lease(&self) -> bool {
        self.lease.lock().await.is_some()
    }

    /// Drop the cached lease, returning its token.
    pub async fn invalidate(&self) -> Option<String> {
        self.lease.lock().await.take().map(|lease| lease.token)
    }
}

fn lease_from_grant(grant: TokenGrant, now: DateTime<Utc>) -> TokenLease {
    let default_expiry =
        now + chrono::Duration::from_std(DEFAULT_LEASE).unwrap_or_else(|_| chrono::Duration::hours(1));
    let expires_at = decode_expiry(&grant.access_token)
        .or(grant.expires_at)
        .unwrap_or(default_expiry);
    TokenLease {
        token: grant.access_token,
        identity: grant.identity,
        issued_at: now,
        expires_at,
    }
}

/// Read the `exp` claim from a JWT payload without verifying it.
pub fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Claims {
        exp: Option<i64>,
    }

    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp?, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{jwt_with_exp, FakeBackend};
    use std::sync::atomic::Ordering;

    fn manager(api: Arc<FakeBackend>) -> TokenLeaseManager {
        TokenLeaseManager::new(api, "alice", RetryPolicy::default(), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn reuses_cached_token_outside_refresh_window() {
        let api = Arc::new(FakeBackend::default());
        api.set_token_exp(Utc::now().timestamp() + 3600);
        let leases = manager(api.clone());

        let first = leases.get_token(false).await.unwrap();
        let second = leases.get_token(false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_inside_threshold() {
        let api = Arc::new(FakeBackend::default());
        // Two minutes left is inside the five-minute window.
        api.set_token_exp(Utc::now().timestamp() + 120);
        let leases = manager(api.clone());

        leases.get_token(false).await.unwrap();
        leases.get_token(false).await.unwrap();
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let api = Arc::new(FakeBackend::default());
        let leases = manager(api.clone());

        leases.get_token(false).await.unwrap();
        leases.get_token(true).await.unwrap();
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overlapping_callers_share_one_request() {
        let api = Arc::new(FakeBackend::default());
        api.set_token_delay(Duration::from_millis(50));
        let leases = Arc::new(manager(api.clone()));

        let (a, b, c) = tokio::join!(
            leases.get_token(false),
            leases.get_token(false),
            leases.get_token(false)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.is_ok());
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_then_token_acquisition_error() {
        let api = Arc::new(FakeBackend::default());
        api.fail_token_requests(10, 503);
        let leases = manager(api.clone());
        let started = tokio::time::Instant::now();

        let err = leases.get_token(false).await.unwrap_err();
        assert!(matches!(err, CallError::TokenAcquisition { attempts: 3, .. }));
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3_010), "{elapsed:?}");
        assert!(!leases.holds_lease().await);
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_waits_one_plus_two_seconds() {
        let api = Arc::new(FakeBackend::default());
        api.fail_token_requests(2, 502);
        let leases = manager(api.clone());
        let started = tokio::time::Instant::now();

        assert!(leases.get_token(false).await.is_ok());
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_retried_with_backoff() {
        let api = Arc::new(FakeBackend::default());
        api.fail_token_requests(10, 403);
        let leases = manager(api.clone());
        let started = tokio::time::Instant::now();

        let err = leases.get_token(false).await.unwrap_err();
        assert!(matches!(err, CallError::TokenAcquisition { attempts: 3, .. }));
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3_000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3_010), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_lease() {
        let api = Arc::new(FakeBackend::default());
        let leases = manager(api.clone());
        let original = leases.get_token(false).await.unwrap();

        api.fail_token_requests(3, 400);
        assert!(leases.get_token(true).await.is_err());
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 4);
        assert_eq!(leases.current_lease().await.unwrap().token, original);
        assert_eq!(leases.get_token(false).await.unwrap(), original);
    }

    #[tokio::test]
    async fn rejects_invalid_identity_without_request() {
        let api = Arc::new(FakeBackend::default());
        let leases =
            TokenLeaseManager::new(api.clone(), "bob smith", RetryPolicy::default(), Duration::from_secs(300));
        let err = leases.get_token(false).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidArgument(_)));
        assert_eq!(api.token_requests.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expiry_prefers_jwt_claim_then_grant_then_default() {
        let now = Utc::now();
        let exp = now.timestamp() + 600;
        let from_jwt = lease_from_grant(
            TokenGrant {
                access_token: jwt_with_exp(Some(exp)),
                identity: "alice".into(),
                expires_at: None,
            },
            now,
        );
        assert_eq!(from_jwt.expires_at.timestamp(), exp);

        let grant_expiry = now + chrono::Duration::minutes(30);
        let from_grant = lease_from_grant(
            TokenGrant {
                access_token: "opaque-token".into(),
                identity: "alice".into(),
                expires_at: Some(grant_expiry),
            },
            now,
        );
        assert_eq!(from_grant.expires_at, grant_expiry);

        let fallback = lease_from_grant(
            TokenGrant {
                access_token: jwt_with_exp(None),
                identity: "alice".into(),
                expires_at: None,
            },
            now,
        );
        assert_eq!(fallback.expires_at, now + chrono::Duration::hours(1));
    }
}
