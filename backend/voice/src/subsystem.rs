use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use callhub_core::{CallError, CallResult, CallSession, CallStats, CallStatus, PagedCallList, Transcript};

use crate::backend::{BackendError, CallControlApi, HistoryQuery, HttpCallControl};
use crate::config::VoiceConfig;
use crate::controller::{CallSessionController, CallSnapshot};
use crate::engine::VoiceEngine;
use crate::history::HistoryClient;
use crate::lease::TokenLeaseManager;

/// The call-session subsystem as the application sees it: one controller,
/// one lease manager and one history client sharing a backend and an engine.
///
/// Built once by the composition root and passed to whatever needs it.
#[derive(Clone)]
pub struct VoiceSubsystem {
    config: Arc<VoiceConfig>,
    controller: CallSessionController,
    history: Arc<HistoryClient>,
    leases: Arc<TokenLeaseManager>,
}

impl VoiceSubsystem {
    pub fn new(
        config: VoiceConfig,
        engine: Arc<dyn VoiceEngine>,
        api: Arc<dyn CallControlApi>,
    ) -> Self {
        let policy = config.retry_policy();
        let leases = Arc::new(TokenLeaseManager::new(
            api.clone(),
            config.identity.clone(),
            policy.clone(),
            config.token_refresh_threshold,
        ));
        let history = Arc::new(HistoryClient::new(api, config.identity.clone(), policy));
        let controller = CallSessionController::spawn(engine, leases.clone(), config.poll_interval);
        info!(
            identity = %config.identity,
            server_url = %config.server_url,
            "Voice subsystem created"
        );
        Self {
            config: Arc::new(config),
            controller,
            history,
            leases,
        }
    }

    /// Wire an HTTP backend client from `config`.
    pub fn from_config(config: VoiceConfig, engine: Arc<dyn VoiceEngine>) -> Result<Self, BackendError> {
        let api = HttpCallControl::new(config.server_url.clone(), config.request_timeout)?;
        Ok(Self::new(config, engine, Arc::new(api)))
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub fn controller(&self) -> &CallSessionController {
        &self.controller
    }

    pub fn history(&self) -> &HistoryClient {
        &self.history
    }

    pub fn leases(&self) -> &TokenLeaseManager {
        &self.leases
    }

    pub async fn initialize(&self) -> CallResult<()> {
        self.controller.initialize().await
    }

    pub async fn teardown(&self) {
        self.controller.teardown().await
    }

    pub async fn make_call(&self, phone_number: &str, contact_id: Option<&str>) -> CallResult<CallSession> {
        self.controller.make_call(phone_number, contact_id).await
    }

    pub async fn end_call(&self) -> bool {
        self.controller.end_call().await
    }

    pub async fn toggle_mute(&self) -> bool {
        self.controller.toggle_mute().await
    }

    pub async fn toggle_speaker(&self) -> bool {
        self.controller.toggle_speaker().await
    }

    pub async fn send_dtmf(&self, digits: &str) -> bool {
        self.controller.send_dtmf(digits).await
    }

    pub async fn call_duration(&self) -> Duration {
        self.controller.call_duration().await
    }

    pub async fn get_call_transcript(&self, call_sid: &str) -> CallResult<Transcript> {
        let result = self.history.get_transcript(call_sid).await;
        self.surface(result).await
    }

    pub async fn get_call_history(&self, query: HistoryQuery) -> CallResult<PagedCallList> {
        let result = self.history.get_history(query).await;
        self.surface(result).await
    }

    pub async fn get_call_stats(&self) -> CallResult<CallStats> {
        let result = self.history.stats().await;
        self.surface(result).await
    }

    pub async fn health_check(&self) -> bool {
        self.history.health_check().await
    }

    // Fetch failures go to the caller and to the error observable.
    async fn surface<T>(&self, result: CallResult<T>) -> CallResult<T> {
        if let Err(err) = &result {
            if !matches!(err, CallError::NotFound(_)) {
                self.controller.record_error(err.to_string()).await;
            }
        }
        result
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.controller.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.controller.snapshot()
    }

    pub fn call_status(&self) -> CallStatus {
        self.controller.call_status()
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.controller.current_call()
    }

    pub fn is_muted(&self) -> bool {
        self.controller.is_muted()
    }

    pub fn is_speaker_on(&self) -> bool {
        self.controller.is_speaker_on()
    }

    pub fn error(&self) -> Option<String> {
        self.controller.error()
    }

    pub async fn clear_error(&self) {
        self.controller.clear_error().await
    }

    pub fn is_initialized(&self) -> bool {
        self.controller.is_initialized()
    }

    pub fn is_call_active(&self) -> bool {
        self.controller.is_call_active()
    }

    pub async fn is_registered(&self) -> bool {
        self.controller.is_registered().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimulatedEngine;
    use crate::test_support::{sid, transcript, FakeBackend};
    use callhub_core::CallEvent;

    fn subsystem(engine: &Arc<SimulatedEngine>, api: &Arc<FakeBackend>) -> VoiceSubsystem {
        let config = VoiceConfig {
            identity: "alice".into(),
            ..VoiceConfig::default()
        };
        VoiceSubsystem::new(config, engine.clone(), api.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_call_and_transcript() {
        let engine = Arc::new(SimulatedEngine::new().with_answer_delay(Duration::from_secs(1)));
        let api = Arc::new(FakeBackend::default());
        let voice = subsystem(&engine, &api);

        voice.initialize().await.unwrap();
        assert!(voice.is_registered().await);
        assert_eq!(voice.identity(), "alice");

        let session = voice.make_call("+15551234567", Some("bob")).await.unwrap();
        let mut rx = voice.subscribe();
        rx.wait_for(|s| s.status == CallStatus::Connected).await.unwrap();
        assert!(voice.is_call_active());
        assert!(voice.toggle_speaker().await);
        assert!(voice.end_call().await);

        let call_sid = session.sid.unwrap();
        api.add_transcript(transcript(&call_sid));
        let found = voice.get_call_transcript(&call_sid).await.unwrap();
        assert_eq!(found.call_sid, call_sid);

        voice.teardown().await;
        assert!(!voice.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn history_errors_reach_the_error_observable() {
        let engine = Arc::new(SimulatedEngine::new());
        let api = Arc::new(FakeBackend::default());
        let voice = subsystem(&engine, &api);

        api.fail_history_requests(3, 503);
        assert!(voice.get_call_history(HistoryQuery::default()).await.is_err());
        assert!(voice.error().unwrap().contains("503"));

        voice.clear_error().await;
        let err = voice.get_call_transcript(&sid('c')).await.unwrap_err();
        assert!(matches!(err, CallError::NotFound(_)));
        assert!(voice.error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_hangup_is_reconciled_by_poll() {
        let engine = Arc::new(SimulatedEngine::new());
        let api = Arc::new(FakeBackend::default());
        let voice = subsystem(&engine, &api);
        voice.initialize().await.unwrap();

        voice.make_call("+15551234567", None).await.unwrap();
        let sim = engine.last_call().unwrap();
        sim.emit(CallEvent::Connected);
        sim.apply_silently(CallEvent::Disconnected);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(voice.call_status(), CallStatus::Disconnected);
        assert!(voice.current_call().is_none());
    }
}
