use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Call-session subsystem configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Base URL of the call-control backend
    pub server_url: String,
    /// Identity registered with the engine and used for history lookups
    pub identity: String,
    /// Total tries for backend requests (first attempt included)
    pub retry_attempts: u32,
    /// Refresh a token this long before it expires
    #[serde(with = "minutes")]
    pub token_refresh_threshold: Duration,
    /// Reconciliation poll period
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Per-request HTTP timeout
    #[serde(with = "seconds")]
    pub request_timeout: Duration,
    /// Log level
    pub log_level: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            identity: default_identity(),
            retry_attempts: 3,
            token_refresh_threshold: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}

impl VoiceConfig {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("CALLHUB_SERVER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.server_url),
            identity: std::env::var("CALLHUB_IDENTITY").unwrap_or(defaults.identity),
            retry_attempts: env_parse("CALLHUB_RETRY_ATTEMPTS")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.retry_attempts),
            token_refresh_threshold: env_parse("CALLHUB_TOKEN_REFRESH_MINUTES")
                .map(|m: u64| Duration::from_secs(m * 60))
                .unwrap_or(defaults.token_refresh_threshold),
            poll_interval: env_parse("CALLHUB_POLL_INTERVAL_MS")
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            request_timeout: env_parse("CALLHUB_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            ..RetryPolicy::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `user_<unix-millis>`, matching what the backend would mint.
pub fn default_identity() -> String {
    format!("user_{}", chrono::Utc::now().timestamp_millis())
}

mod minutes {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)? * 60))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = VoiceConfig::default();
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.token_refresh_threshold, Duration::from_secs(300));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert!(config.identity.starts_with("user_"));
        assert!(callhub_core::validate::is_valid_identity(&config.identity));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: VoiceConfig = serde_json::from_value(serde_json::json!({
            "server_url": "https://calls.example.com",
            "identity": "alice",
            "token_refresh_threshold": 2,
            "poll_interval": 250
        }))
        .unwrap();
        assert_eq!(config.identity, "alice");
        assert_eq!(config.token_refresh_threshold, Duration::from_secs(120));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn retry_policy_uses_attempts() {
        let config = VoiceConfig {
            retry_attempts: 5,
            ..VoiceConfig::default()
        };
        assert_eq!(config.retry_policy().max_attempts, 5);
    }
}
