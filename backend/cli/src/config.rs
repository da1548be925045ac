use std::path::PathBuf;
use std::time::Duration;

use callhub_voice::VoiceConfig;

/// CallHub CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Subsystem settings (`CALLHUB_*`)
    pub voice: VoiceConfig,
    /// Directory for rolling JSON logs; console only when unset
    pub log_dir: Option<PathBuf>,
    /// How long the simulated far end takes to pick up
    pub answer_delay: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            voice: VoiceConfig::default(),
            log_dir: None,
            answer_delay: Duration::from_secs(2),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        Self {
            voice: VoiceConfig::from_env(),
            log_dir: std::env::var("CALLHUB_LOG_DIR").ok().map(PathBuf::from),
            answer_delay: std::env::var("CALLHUB_SIM_ANSWER_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(2)),
        }
    }

    /// Apply `--identity` / `--server` overrides.
    pub fn with_overrides(mut self, identity: Option<String>, server: Option<String>) -> Self {
        if let Some(identity) = identity {
            self.voice.identity = identity;
        }
        if let Some(server) = server {
            self.voice.server_url = server.trim_end_matches('/').to_string();
        }
        self
    }
}
