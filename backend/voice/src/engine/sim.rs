//! Simulated Engine
//!
//! An in-process stand-in for the native voice engine. Calls are plain state
//! machines driven either by an optional auto-answer timer or by hand through
//! [`SimulatedCall::emit`]. Every engine-side action is appended to a journal
//! so callers can assert ordering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use callhub_core::{CallEvent, EngineError};

use super::{CallInvite, ConnectParams, EngineCall, EngineCallState, EngineEvent, VoiceEngine};

type Journal = Arc<Mutex<Vec<String>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(journal: &Journal, entry: impl Into<String>) {
    lock(journal).push(entry.into());
}

#[derive(Default)]
struct EngineState {
    registered_token: Option<String>,
    answer_after: Option<Duration>,
    connect_delay: Duration,
    register_failures: VecDeque<EngineError>,
    unregister_failures: VecDeque<EngineError>,
    connect_failures: VecDeque<EngineError>,
    calls: Vec<Arc<SimulatedCall>>,
}

pub struct SimulatedEngine {
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    journal: Journal,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            state: Mutex::new(EngineState::default()),
            events,
            journal: Arc::default(),
        }
    }

    /// Answer outgoing calls automatically after `delay`.
    pub fn with_answer_delay(self, delay: Duration) -> Self {
        lock(&self.state).answer_after = Some(delay);
        self
    }

    /// Hold every `connect` for `delay` before the call object exists.
    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    pub fn fail_next_register(&self, err: EngineError) {
        lock(&self.state).register_failures.push_back(err);
    }

    pub fn fail_next_unregister(&self, err: EngineError) {
        lock(&self.state).unregister_failures.push_back(err);
    }

    pub fn fail_next_connect(&self, err: EngineError) {
        lock(&self.state).connect_failures.push_back(err);
    }

    pub fn registered_token(&self) -> Option<String> {
        lock(&self.state).registered_token.clone()
    }

    pub fn calls(&self) -> Vec<Arc<SimulatedCall>> {
        lock(&self.state).calls.clone()
    }

    pub fn last_call(&self) -> Option<Arc<SimulatedCall>> {
        lock(&self.state).calls.last().cloned()
    }

    /// Ordered record of engine-side actions.
    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }

    /// Deliver an incoming call from `from`.
    pub fn ring(&self, from: &str) -> Arc<SimulatedInvite> {
        let params = ConnectParams::new("client:device", from, None);
        let call = Arc::new(SimulatedCall::new(params, String::new(), self.journal.clone()));
        lock(&self.state).calls.push(call.clone());

        let invite = Arc::new(SimulatedInvite {
            from: from.to_string(),
            call,
            journal: self.journal.clone(),
        });
        info!(call_sid = %invite.call.sid, "Simulated incoming call");
        let _ = self.events.send(EngineEvent::Invite(invite.clone()));
        invite
    }

    /// Publish an engine-level event as if the native engine raised it.
    pub fn raise(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoiceEngine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn register(&self, token: &str) -> Result<(), EngineError> {
        if token.is_empty() {
            return Err(EngineError::Unauthorized("empty access token".into()));
        }
        {
            let mut state = lock(&self.state);
            if let Some(err) = state.register_failures.pop_front() {
                return Err(err);
            }
            state.registered_token = Some(token.to_string());
        }
        record(&self.journal, "register");
        let _ = self.events.send(EngineEvent::Registered);
        Ok(())
    }

    async fn unregister(&self, _token: &str) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            if let Some(err) = state.unregister_failures.pop_front() {
                return Err(err);
            }
            state.registered_token = None;
        }
        record(&self.journal, "unregister");
        let _ = self.events.send(EngineEvent::Unregistered);
        Ok(())
    }

    async fn connect(
        &self,
        token: &str,
        params: ConnectParams,
    ) -> Result<Arc<dyn EngineCall>, EngineError> {
        if token.is_empty() {
            return Err(EngineError::Unauthorized("empty access token".into()));
        }
        let delay = lock(&self.state).connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (call, answer_after) = {
            let mut state = lock(&self.state);
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
            let call = Arc::new(SimulatedCall::new(params, token.to_string(), self.journal.clone()));
            state.calls.push(call.clone());
            (call, state.answer_after)
        };
        record(&self.journal, "connect");
        debug!(call_sid = %call.sid, "Simulated call dialing");

        if let Some(delay) = answer_after {
            let ringing = call.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if ringing.current_state() == EngineCallState::Connecting {
                    ringing.emit(CallEvent::Connected);
                }
            });
        }
        Ok(call)
    }
}

struct CallState {
    state: EngineCallState,
    reconnecting: bool,
    muted: bool,
    speaker_on: bool,
    connected_at: Option<Instant>,
    digits: String,
    fail_controls: bool,
    fail_state_reads: bool,
    state_delay: Duration,
    state_reads: u32,
}

pub struct SimulatedCall {
    sid: String,
    params: ConnectParams,
    token: String,
    inner: Mutex<CallState>,
    events: broadcast::Sender<CallEvent>,
    journal: Journal,
}

impl SimulatedCall {
    fn new(params: ConnectParams, token: String, journal: Journal) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            sid: format!("CA{}", Uuid::new_v4().simple()),
            params,
            token,
            inner: Mutex::new(CallState {
                state: EngineCallState::Connecting,
                reconnecting: false,
                muted: false,
                speaker_on: false,
                connected_at: None,
                digits: String::new(),
                fail_controls: false,
                fail_state_reads: false,
                state_delay: Duration::ZERO,
                state_reads: 0,
            }),
            events,
            journal,
        }
    }

    pub fn call_sid(&self) -> &str {
        &self.sid
    }

    /// Access token the call was placed with.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// State as `EngineCall::state` would report it.
    pub fn current_state(&self) -> EngineCallState {
        let inner = lock(&self.inner);
        if inner.reconnecting {
            EngineCallState::Connecting
        } else {
            inner.state
        }
    }

    /// Apply `event` to the call and publish it to subscribers.
    pub fn emit(&self, event: CallEvent) {
        self.apply(&event);
        let _ = self.events.send(event);
    }

    /// Apply `event` without publishing it, as if the notification was lost.
    pub fn apply_silently(&self, event: CallEvent) {
        self.apply(&event);
    }

    fn apply(&self, event: &CallEvent) {
        let mut inner = lock(&self.inner);
        match event {
            CallEvent::Connecting => {}
            CallEvent::Connected | CallEvent::Reconnected => {
                inner.state = EngineCallState::Connected;
                inner.reconnecting = false;
                if inner.connected_at.is_none() {
                    inner.connected_at = Some(Instant::now());
                }
            }
            CallEvent::Reconnecting => {
                if inner.state == EngineCallState::Connected {
                    inner.reconnecting = true;
                }
            }
            CallEvent::Disconnected => {
                inner.state = EngineCallState::Disconnected;
                inner.reconnecting = false;
            }
            CallEvent::Error(_) => {
                if inner.state == EngineCallState::Connecting {
                    inner.state = EngineCallState::Failed;
                }
            }
        }
    }

    /// Make every control (mute, speaker, digits, disconnect) fail.
    pub fn fail_controls(&self, fail: bool) {
        lock(&self.inner).fail_controls = fail;
    }

    /// Make `state()` reads fail.
    pub fn fail_state_reads(&self, fail: bool) {
        lock(&self.inner).fail_state_reads = fail;
    }

    /// Delay every `state()` read by `delay`.
    pub fn slow_state_reads(&self, delay: Duration) {
        lock(&self.inner).state_delay = delay;
    }

    /// Number of `state()` reads so far.
    pub fn state_reads(&self) -> u32 {
        lock(&self.inner).state_reads
    }

    pub fn sent_digits(&self) -> String {
        lock(&self.inner).digits.clone()
    }

    fn check_controls(&self) -> Result<(), EngineError> {
        let inner = lock(&self.inner);
        if inner.fail_controls {
            return Err(EngineError::Failed("media channel unavailable".into()));
        }
        if matches!(
            inner.state,
            EngineCallState::Disconnected | EngineCallState::Failed
        ) {
            return Err(EngineError::NoActiveCall);
        }
        Ok(())
    }
}

#[async_trait]
impl EngineCall for SimulatedCall {
    fn sid(&self) -> Option<String> {
        Some(self.sid.clone())
    }

    fn params(&self) -> &ConnectParams {
        &self.params
    }

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn state(&self) -> Result<EngineCallState, EngineError> {
        let (delay, fail) = {
            let mut inner = lock(&self.inner);
            inner.state_reads += 1;
            (inner.state_delay, inner.fail_state_reads)
        };
        // Sampled before the delay, so a slow read reports what was true when it started.
        let state = self.current_state();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(EngineError::Failed("state unavailable".into()));
        }
        Ok(state)
    }

    async fn is_muted(&self) -> Result<bool, EngineError> {
        Ok(lock(&self.inner).muted)
    }

    async fn is_speaker_on(&self) -> Result<bool, EngineError> {
        Ok(lock(&self.inner).speaker_on)
    }

    async fn duration(&self) -> Result<Duration, EngineError> {
        Ok(lock(&self.inner)
            .connected_at
            .map(|at| at.elapsed())
            .unwrap_or_default())
    }

    async fn mute(&self, muted: bool) -> Result<(), EngineError> {
        self.check_controls()?;
        lock(&self.inner).muted = muted;
        Ok(())
    }

    async fn set_speaker(&self, on: bool) -> Result<(), EngineError> {
        self.check_controls()?;
        lock(&self.inner).speaker_on = on;
        Ok(())
    }

    async fn send_digits(&self, digits: &str) -> Result<(), EngineError> {
        self.check_controls()?;
        lock(&self.inner).digits.push_str(digits);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        if lock(&self.inner).fail_controls {
            return Err(EngineError::Failed("media channel unavailable".into()));
        }
        if matches!(
            self.current_state(),
            EngineCallState::Disconnected | EngineCallState::Failed
        ) {
            return Ok(());
        }
        record(&self.journal, "disconnect");
        self.emit(CallEvent::Disconnected);
        Ok(())
    }
}

pub struct SimulatedInvite {
    from: String,
    call: Arc<SimulatedCall>,
    journal: Journal,
}

impl SimulatedInvite {
    pub fn call(&self) -> Arc<SimulatedCall> {
        self.call.clone()
    }
}

#[async_trait]
impl CallInvite for SimulatedInvite {
    fn call_sid(&self) -> &str {
        &self.call.sid
    }

    fn from(&self) -> &str {
        &self.from
    }

    async fn accept(&self) -> Result<Arc<dyn EngineCall>, EngineError> {
        if self.call.current_state() != EngineCallState::Connecting {
            return Err(EngineError::NoActiveCall);
        }
        record(&self.journal, "accept");
        self.call.apply(&CallEvent::Connected);
        Ok(self.call.clone())
    }

    async fn reject(&self) -> Result<(), EngineError> {
        record(&self.journal, "reject");
        self.call.apply(&CallEvent::Disconnected);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_follows_emitted_events() {
        let engine = SimulatedEngine::new();
        engine.register("tok").await.unwrap();
        let call = engine
            .connect("tok", ConnectParams::new("+15551234567", "alice", None))
            .await
            .unwrap();
        let mut events = call.subscribe();
        let sim = engine.last_call().unwrap();
        assert!(sim.call_sid().starts_with("CA"));
        assert_eq!(sim.call_sid().len(), 34);

        assert_eq!(call.state().await.unwrap(), EngineCallState::Connecting);
        sim.emit(CallEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), CallEvent::Connected);
        assert_eq!(call.state().await.unwrap(), EngineCallState::Connected);

        sim.emit(CallEvent::Reconnecting);
        assert_eq!(call.state().await.unwrap(), EngineCallState::Connecting);
        sim.emit(CallEvent::Reconnected);
        assert_eq!(call.state().await.unwrap(), EngineCallState::Connected);

        call.disconnect().await.unwrap();
        assert_eq!(call.state().await.unwrap(), EngineCallState::Disconnected);
        assert!(matches!(call.mute(true).await, Err(EngineError::NoActiveCall)));
        assert_eq!(engine.journal(), vec!["register", "connect", "disconnect"]);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_answer_after_delay() {
        let engine = SimulatedEngine::new().with_answer_delay(Duration::from_secs(2));
        let call = engine
            .connect("tok", ConnectParams::new("+15551234567", "alice", None))
            .await
            .unwrap();
        let mut events = call.subscribe();

        assert_eq!(events.recv().await.unwrap(), CallEvent::Connected);
        assert_eq!(call.state().await.unwrap(), EngineCallState::Connected);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(call.duration().await.unwrap(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn queued_failures_are_returned_once() {
        let engine = SimulatedEngine::new();
        engine.fail_next_connect(EngineError::Unauthorized("expired".into()));
        let params = ConnectParams::new("+15551234567", "alice", None);

        let err = engine.connect("tok", params.clone()).await.err().unwrap();
        assert!(err.is_unauthorized());
        assert!(engine.connect("tok", params).await.is_ok());
    }

    #[tokio::test]
    async fn invite_accept_connects_the_call() {
        let engine = SimulatedEngine::new();
        let mut events = engine.subscribe();
        let invite = engine.ring("+15557654321");

        match events.recv().await.unwrap() {
            EngineEvent::Invite(received) => {
                assert_eq!(received.from(), "+15557654321");
                let call = received.accept().await.unwrap();
                assert_eq!(call.state().await.unwrap(), EngineCallState::Connected);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(invite.accept().await.is_err());
    }

    #[tokio::test]
    async fn controls_can_be_forced_to_fail() {
        let engine = SimulatedEngine::new();
        let call = engine
            .connect("tok", ConnectParams::new("+15551234567", "alice", None))
            .await
            .unwrap();
        call.send_digits("12").await.unwrap();
        engine.last_call().unwrap().fail_controls(true);

        assert!(call.set_speaker(true).await.is_err());
        assert!(!call.is_speaker_on().await.unwrap());
        assert_eq!(engine.last_call().unwrap().sent_digits(), "12");
    }
}
