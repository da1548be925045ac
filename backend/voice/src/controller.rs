//! Call Session Controller.
//!
//! One actor task owns the call session and is its only writer. It is fed by
//! user operations sent through [`CallSessionController`], by engine events
//! relayed from the live call, and by a reconciliation poll that re-reads
//! the call on every tick. Events and poll reads are stamped when observed;
//! an observation older than the last one applied is dropped.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use callhub_core::validate::is_dialable;
use callhub_core::{
    CallError, CallEvent, CallResult, CallSession, CallStatus, Contact, EngineError,
};
use callhub_logging::{mask_number, CallEventLogger, CallLogEvent};

use crate::engine::{
    CallInvite, ConnectParams, EngineCall, EngineCallState, EngineEvent, VoiceEngine,
};
use crate::lease::TokenLeaseManager;

const COMMAND_BUFFER: usize = 64;

/// Read-only view of the session, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub current_call: Option<CallSession>,
    pub status: CallStatus,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub error: Option<String>,
    pub is_initialized: bool,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    state: EngineCallState,
    muted: bool,
    speaker_on: bool,
}

async fn observe(call: &dyn EngineCall) -> Result<Observation, EngineError> {
    Ok(Observation {
        state: call.state().await?,
        muted: call.is_muted().await?,
        speaker_on: call.is_speaker_on().await?,
    })
}

/// Status implied by a polled engine state. A call recovering media reads
/// back as `Connecting`.
fn reconcile(current: CallStatus, observed: EngineCallState) -> CallStatus {
    match observed {
        EngineCallState::Connecting
            if matches!(current, CallStatus::Connected | CallStatus::Reconnecting) =>
        {
            CallStatus::Reconnecting
        }
        other => other.as_status(),
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetInitialized {
        initialized: bool,
        reply: Reply<()>,
    },
    BeginDial {
        contact: Contact,
        reply: Reply<CallResult<u64>>,
    },
    Attach {
        generation: u64,
        call: Arc<dyn EngineCall>,
        events: broadcast::Receiver<CallEvent>,
        reply: Option<Reply<CallResult<CallSession>>>,
    },
    DialFailed {
        generation: u64,
        error: String,
        reply: Option<Reply<()>>,
    },
    End {
        reply: Reply<Option<Arc<dyn EngineCall>>>,
    },
    Active {
        reply: Reply<Option<(u64, Arc<dyn EngineCall>)>>,
    },
    Flags {
        generation: u64,
        muted: Option<bool>,
        speaker_on: Option<bool>,
        reply: Reply<()>,
    },
    Event {
        generation: u64,
        event: CallEvent,
        observed_at: Instant,
    },
    Observed {
        generation: u64,
        observed_at: Instant,
        result: Result<Observation, EngineError>,
        polled: bool,
    },
    Invite(Arc<dyn CallInvite>),
    /// Record `Some(message)`, or clear the error with `None`.
    SetError {
        message: Option<String>,
        reply: Option<Reply<()>>,
    },
}

struct ActiveSession {
    generation: u64,
    session: CallSession,
    call: Option<Arc<dyn EngineCall>>,
    forwarder: Option<JoinHandle<()>>,
}

struct SessionActor {
    commands: mpsc::WeakSender<Command>,
    snapshot: watch::Sender<CallSnapshot>,
    poll_interval: Duration,
    status: CallStatus,
    active: Option<ActiveSession>,
    error: Option<String>,
    initialized: bool,
    generation: u64,
    /// Arrival time of the newest status observation applied.
    last_observed: Instant,
    /// Same, for the mute and speaker flags.
    flags_observed: Instant,
    poll_in_flight: bool,
    engine_listener: JoinHandle<()>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut ticker = time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            "Call session controller started"
        );

        loop {
            tokio::select! {
                // The ticker is only armed between initialize and teardown.
                _ = ticker.tick(), if self.initialized => self.poll(),
                command = rx.recv() => match command {
                    Some(command) => {
                        let was_polling = self.initialized;
                        self.handle(command);
                        if self.initialized && !was_polling {
                            ticker.reset();
                            debug!("Reconciliation poll started");
                        } else if was_polling && !self.initialized {
                            debug!("Reconciliation poll stopped");
                        }
                    }
                    None => {
                        info!("Call session controller channel closed, shutting down");
                        break;
                    }
                }
            }
        }

        self.destroy_session();
        self.engine_listener.abort();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SetInitialized { initialized, reply } => {
                self.initialized = initialized;
                self.publish();
                let _ = reply.send(());
            }
            Command::BeginDial { contact, reply } => {
                let _ = reply.send(self.begin_dial(contact));
            }
            Command::Attach {
                generation,
                call,
                events,
                reply,
            } => {
                let result = self.attach(generation, call, events);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::DialFailed {
                generation,
                error,
                reply,
            } => {
                self.dial_failed(generation, error);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Command::End { reply } => {
                let _ = reply.send(self.end());
            }
            Command::Active { reply } => {
                let active = self
                    .active
                    .as_ref()
                    .and_then(|a| a.call.clone().map(|call| (a.generation, call)));
                let _ = reply.send(active);
            }
            Command::Flags {
                generation,
                muted,
                speaker_on,
                reply,
            } => {
                if let Some(active) = self.active.as_mut().filter(|a| a.generation == generation) {
                    if let Some(muted) = muted {
                        active.session.is_muted = muted;
                    }
                    if let Some(on) = speaker_on {
                        active.session.is_speaker_on = on;
                    }
                    self.flags_observed = self.flags_observed.max(Instant::now());
                }
                self.publish();
                let _ = reply.send(());
            }
            Command::Event {
                generation,
                event,
                observed_at,
            } => self.apply_event(generation, event, observed_at),
            Command::Observed {
                generation,
                observed_at,
                result,
                polled,
            } => {
                if polled {
                    self.poll_in_flight = false;
                }
                if !self.is_current(generation) {
                    debug!("Dropping state read for a finished call");
                    return;
                }
                match result {
                    Ok(observation) => self.apply_observation(observed_at, observation),
                    Err(err) => {
                        warn!(error = %err, "Call state read failed");
                        self.set_error(err.to_string());
                        self.publish();
                    }
                }
            }
            Command::Invite(invite) => self.invite(invite),
            Command::SetError { message, reply } => {
                match message {
                    Some(message) => self.set_error(message),
                    None => self.error = None,
                }
                self.publish();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn poll(&mut self) {
        if !self.initialized || self.poll_in_flight {
            return;
        }
        let Some((generation, call)) = self
            .active
            .as_ref()
            .and_then(|a| a.call.clone().map(|call| (a.generation, call)))
        else {
            return;
        };
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        self.poll_in_flight = true;
        let limit = self.poll_interval;
        tokio::spawn(async move {
            let observed_at = Instant::now();
            let result = match time::timeout(limit, observe(call.as_ref())).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Failed(format!(
                    "call state read exceeded {}ms",
                    limit.as_millis()
                ))),
            };
            let _ = commands
                .send(Command::Observed {
                    generation,
                    observed_at,
                    result,
                    polled: true,
                })
                .await;
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.generation == generation && a.call.is_some())
    }

    fn call_sid(&self) -> Option<String> {
        self.active.as_ref().and_then(|a| a.session.sid.clone())
    }

    fn begin_dial(&mut self, contact: Contact) -> CallResult<u64> {
        if !self.initialized {
            return Err(CallError::NotInitialized);
        }
        if self.status.is_live() || self.active.is_some() {
            return Err(CallError::SessionActive);
        }
        let generation = self.open_session(contact);
        self.transition(CallStatus::Connecting, "dial");
        Ok(generation)
    }

    /// Replace any previous session with a fresh one for `contact`.
    fn open_session(&mut self, contact: Contact) -> u64 {
        self.destroy_session();
        self.generation += 1;
        self.last_observed = Instant::now();
        self.flags_observed = self.last_observed;
        self.error = None;
        self.active = Some(ActiveSession {
            generation: self.generation,
            session: CallSession::dialing(contact),
            call: None,
            forwarder: None,
        });
        self.generation
    }

    fn attach(
        &mut self,
        generation: u64,
        call: Arc<dyn EngineCall>,
        events: broadcast::Receiver<CallEvent>,
    ) -> CallResult<CallSession> {
        let commands = self.commands.clone();
        let Some(active) = self
            .active
            .as_mut()
            .filter(|a| a.generation == generation && a.call.is_none())
        else {
            info!(call_sid = ?call.sid(), "Dial was cancelled, hanging up the late call");
            tokio::spawn(async move {
                if let Err(err) = call.disconnect().await {
                    warn!(error = %err, "Failed to hang up cancelled call");
                }
            });
            return Err(CallError::Cancelled);
        };

        active.session.sid = call.sid();
        active.forwarder = Some(tokio::spawn(forward_call_events(
            generation, events, commands,
        )));
        active.call = Some(call);
        let session = active.session.clone();
        info!(
            call_sid = session.sid.as_deref().unwrap_or("pending"),
            "Engine call attached"
        );
        self.publish();
        Ok(session)
    }

    fn dial_failed(&mut self, generation: u64, error: String) {
        if self.active.as_ref().map_or(true, |a| a.generation != generation) {
            return;
        }
        self.set_error(error);
        self.transition(CallStatus::Failed, "dial");
    }

    fn end(&mut self) -> Option<Arc<dyn EngineCall>> {
        self.last_observed = Instant::now();
        let call = self.active.as_ref().and_then(|a| a.call.clone());
        let sid = self.call_sid();
        if self.status.is_live() {
            CallEventLogger::log_event(
                sid.as_deref(),
                CallLogEvent::Control {
                    action: "end".into(),
                    enabled: true,
                },
            );
            self.transition(CallStatus::Disconnected, "end_call");
        } else {
            self.destroy_session();
            self.publish();
        }
        call
    }

    fn apply_event(&mut self, generation: u64, event: CallEvent, observed_at: Instant) {
        if !self.is_current(generation) {
            debug!(event = %event, "Ignoring event for a finished call");
            return;
        }
        if observed_at < self.last_observed {
            debug!(event = %event, "Ignoring event older than the last observation");
            return;
        }
        self.last_observed = observed_at;

        if let CallEvent::Error(message) = &event {
            self.set_error(message.clone());
        }
        match self.status.on_event(&event) {
            Some(next) => self.transition(next, "event"),
            None => {
                debug!(status = %self.status, event = %event, "Event leaves status unchanged");
                self.publish();
            }
        }
    }

    fn apply_observation(&mut self, observed_at: Instant, observation: Observation) {
        let status_fresh = observed_at >= self.last_observed;
        let flags_fresh = observed_at >= self.flags_observed;
        if !status_fresh && !flags_fresh {
            debug!(
                state = ?observation.state,
                "Discarding state read older than the last observation"
            );
            return;
        }

        if flags_fresh {
            self.flags_observed = observed_at;
            if let Some(active) = self.active.as_mut() {
                active.session.is_muted = observation.muted;
                active.session.is_speaker_on = observation.speaker_on;
            }
        }
        if status_fresh {
            self.last_observed = observed_at;
            let next = reconcile(self.status, observation.state);
            self.transition(next, "poll");
        } else {
            self.publish();
        }
    }

    fn invite(&mut self, invite: Arc<dyn CallInvite>) {
        if !self.initialized || self.status.is_live() || self.active.is_some() {
            info!(
                call_sid = invite.call_sid(),
                "Rejecting incoming call, line busy"
            );
            tokio::spawn(async move {
                if let Err(err) = invite.reject().await {
                    warn!(error = %err, "Failed to reject incoming call");
                }
            });
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        info!(call_sid = invite.call_sid(), "Accepting incoming call");
        let generation = self.open_session(Contact::new(invite.from(), None));
        self.transition(CallStatus::Connecting, "invite");

        tokio::spawn(async move {
            let call = match invite.accept().await {
                Ok(call) => call,
                Err(err) => {
                    let _ = commands
                        .send(Command::DialFailed {
                            generation,
                            error: err.to_string(),
                            reply: None,
                        })
                        .await;
                    return;
                }
            };
            let events = call.subscribe();
            let _ = commands
                .send(Command::Attach {
                    generation,
                    call: call.clone(),
                    events,
                    reply: None,
                })
                .await;
            let observed_at = Instant::now();
            let result = observe(call.as_ref()).await;
            let _ = commands
                .send(Command::Observed {
                    generation,
                    observed_at,
                    result,
                    polled: false,
                })
                .await;
        });
    }

    fn transition(&mut self, next: CallStatus, source: &str) {
        let previous = self.status;
        if previous != next {
            if !previous.can_transition_to(next) {
                warn!(from = %previous, to = %next, source, "Ignoring unreachable call status");
                self.publish();
                return;
            }
            self.status = next;
            if let Some(active) = self.active.as_mut() {
                active.session.status = next;
            }
            let sid = self.call_sid();
            info!(
                call_sid = sid.as_deref().unwrap_or("pending"),
                from = %previous,
                to = %next,
                source,
                "Call status changed"
            );
            CallEventLogger::log_event(
                sid.as_deref(),
                CallLogEvent::StatusChanged {
                    from: previous.to_string(),
                    to: next.to_string(),
                    source: source.to_string(),
                },
            );
            if next.is_terminal() {
                self.destroy_session();
            }
        }
        self.publish();
    }

    fn destroy_session(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some(forwarder) = active.forwarder {
                forwarder.abort();
            }
        }
    }

    fn set_error(&mut self, message: String) {
        CallEventLogger::log_event(
            self.call_sid().as_deref(),
            CallLogEvent::Error {
                error_msg: message.clone(),
            },
        );
        self.error = Some(message);
    }

    fn publish(&self) {
        let session = self.active.as_ref().map(|a| a.session.clone());
        let next = CallSnapshot {
            is_muted: session.as_ref().is_some_and(|s| s.is_muted),
            is_speaker_on: session.as_ref().is_some_and(|s| s.is_speaker_on),
            current_call: session,
            status: self.status,
            error: self.error.clone(),
            is_initialized: self.initialized,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Relay one call's events into the actor, stamped on arrival.
async fn forward_call_events(
    generation: u64,
    mut events: broadcast::Receiver<CallEvent>,
    commands: mpsc::WeakSender<Command>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Call events lagged, poll will reconcile");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let observed_at = Instant::now();
        let finished = event == CallEvent::Disconnected;
        let Some(tx) = commands.upgrade() else {
            break;
        };
        let sent = tx
            .send(Command::Event {
                generation,
                event,
                observed_at,
            })
            .await;
        if sent.is_err() || finished {
            break;
        }
    }
}

async fn relay_engine_events(
    mut events: broadcast::Receiver<EngineEvent>,
    commands: mpsc::WeakSender<Command>,
) {
    loop {
        let command = match events.recv().await {
            Ok(EngineEvent::Invite(invite)) => Command::Invite(invite),
            Ok(EngineEvent::Error(err)) => Command::SetError {
                message: Some(err.to_string()),
                reply: None,
            },
            Ok(EngineEvent::Registered) => {
                debug!("Engine registered");
                continue;
            }
            Ok(EngineEvent::Unregistered) => {
                debug!("Engine unregistered");
                continue;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Engine events lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(tx) = commands.upgrade() else {
            break;
        };
        if tx.send(command).await.is_err() {
            break;
        }
    }
}

/// Handle to the call session actor. Cheap to clone; the actor stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct CallSessionController {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    engine: Arc<dyn VoiceEngine>,
    leases: Arc<TokenLeaseManager>,
}

impl CallSessionController {
    /// Start the actor. Must be called from within a tokio runtime.
    pub fn spawn(
        engine: Arc<dyn VoiceEngine>,
        leases: Arc<TokenLeaseManager>,
        poll_interval: Duration,
    ) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::default());
        let engine_listener = tokio::spawn(relay_engine_events(
            engine.subscribe(),
            commands.downgrade(),
        ));

        let actor = SessionActor {
            commands: commands.downgrade(),
            snapshot: snapshot_tx,
            poll_interval,
            status: CallStatus::Idle,
            active: None,
            error: None,
            initialized: false,
            generation: 0,
            last_observed: Instant::now(),
            flags_observed: Instant::now(),
            poll_in_flight: false,
            engine_listener,
        };
        tokio::spawn(actor.run(rx));

        Self {
            commands,
            snapshot,
            engine,
            leases,
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> CallResult<T> {
        let (tx, rx) = oneshot::channel();
        let stopped = || CallError::Engine(EngineError::Failed("call controller stopped".into()));
        self.commands.send(command(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Run `op` with `token`; on an unauthorized rejection force a token
    /// refresh and run it once more.
    async fn with_token<T, F, Fut>(&self, token: String, op: F) -> CallResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match op(token).await {
            Err(err) if err.is_unauthorized() => {
                warn!(error = %err, "Engine rejected access token, refreshing");
                let fresh = self.leases.get_token(true).await?;
                Ok(op(fresh).await?)
            }
            other => Ok(other?),
        }
    }

    async fn fail(&self, err: CallError) -> CallError {
        self.record_error(err.to_string()).await;
        err
    }

    /// Write `message` to the shared error observable.
    pub async fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        let _ = self
            .request(|reply| Command::SetError {
                message: Some(message),
                reply: Some(reply),
            })
            .await;
    }

    /// Acquire a token and register the device with the engine.
    pub async fn initialize(&self) -> CallResult<()> {
        let token = match self.leases.get_token(false).await {
            Ok(token) => token,
            Err(err) => return Err(self.fail(err).await),
        };
        let registered = self
            .with_token(token, |token| {
                let engine = self.engine.clone();
                async move { engine.register(&token).await }
            })
            .await;
        if let Err(err) = registered {
            return Err(self.fail(err).await);
        }

        self.request(|reply| Command::SetInitialized {
            initialized: true,
            reply,
        })
        .await?;
        info!(
            identity = self.leases.identity(),
            engine = self.engine.name(),
            "Voice engine registered"
        );
        Ok(())
    }

    /// End any call, unregister, drop the lease and stop the reconciliation
    /// poll. Failures are recorded and never stop the remaining steps.
    pub async fn teardown(&self) {
        self.end_call().await;

        if let Some(lease) = self.leases.current_lease().await {
            if let Err(err) = self.engine.unregister(&lease.token).await {
                warn!(error = %err, "Unregister failed during teardown");
                self.record_error(format!("unregister failed: {err}")).await;
            }
        }
        self.leases.invalidate().await;

        let _ = self
            .request(|reply| Command::SetInitialized {
                initialized: false,
                reply,
            })
            .await;
        info!("Voice engine torn down");
    }

    pub async fn make_call(
        &self,
        phone_number: &str,
        contact_id: Option<&str>,
    ) -> CallResult<CallSession> {
        self.make_call_with(phone_number, contact_id, BTreeMap::new())
            .await
    }

    /// Place a call, forwarding `custom` alongside the `To`/`From`/`contactId`
    /// connect parameters.
    pub async fn make_call_with(
        &self,
        phone_number: &str,
        contact_id: Option<&str>,
        custom: BTreeMap<String, String>,
    ) -> CallResult<CallSession> {
        let number = phone_number.trim();
        if !is_dialable(number) {
            return Err(self.fail(CallError::InvalidNumber(number.to_string())).await);
        }
        let (initialized, live) = {
            let snapshot = self.snapshot.borrow();
            (snapshot.is_initialized, snapshot.status.is_live())
        };
        if !initialized {
            return Err(self.fail(CallError::NotInitialized).await);
        }
        if live {
            return Err(self.fail(CallError::SessionActive).await);
        }

        // A token failure leaves the status untouched.
        let token = match self.leases.get_token(false).await {
            Ok(token) => token,
            Err(err) => return Err(self.fail(err).await),
        };

        let contact = Contact::new(number, contact_id);
        let generation = match self
            .request(|reply| Command::BeginDial { contact, reply })
            .await?
        {
            Ok(generation) => generation,
            Err(err) => return Err(self.fail(err).await),
        };

        info!(to = %mask_number(number), "Placing call");
        CallEventLogger::log_event(
            None,
            CallLogEvent::Dialed {
                to: number.to_string(),
            },
        );

        let mut params = ConnectParams::new(number, self.leases.identity(), contact_id);
        params.custom = custom;
        let connected = self
            .with_token(token, |token| {
                let engine = self.engine.clone();
                let params = params.clone();
                async move { engine.connect(&token, params).await }
            })
            .await;

        let call = match connected {
            Ok(call) => call,
            Err(err) => {
                warn!(error = %err, "Call origination failed");
                let _ = self
                    .request(|reply| Command::DialFailed {
                        generation,
                        error: err.to_string(),
                        reply: Some(reply),
                    })
                    .await;
                return Err(err);
            }
        };

        let events = call.subscribe();
        let session = self
            .request(|reply| Command::Attach {
                generation,
                call,
                events,
                reply: Some(reply),
            })
            .await??;
        Ok(session)
    }

    /// Hang up. Always succeeds; the session ends as `Disconnected` even when
    /// the engine fails to disconnect.
    pub async fn end_call(&self) -> bool {
        let call = self.request(|reply| Command::End { reply }).await.ok().flatten();
        if let Some(call) = call {
            if let Err(err) = call.disconnect().await {
                warn!(error = %err, "Engine disconnect failed");
                self.record_error(format!("disconnect failed: {err}")).await;
            }
        }
        true
    }

    async fn active_call(&self) -> Option<(u64, Arc<dyn EngineCall>)> {
        self.request(|reply| Command::Active { reply })
            .await
            .ok()
            .flatten()
    }

    /// Invert mute on the engine call and return the new state. On failure
    /// the error is recorded and the current state returned.
    pub async fn toggle_mute(&self) -> bool {
        let Some((generation, call)) = self.active_call().await else {
            return false;
        };
        let flipped = async {
            let muted = call.is_muted().await?;
            call.mute(!muted).await?;
            Ok::<_, EngineError>(!muted)
        }
        .await;

        match flipped {
            Ok(muted) => {
                let _ = self
                    .request(|reply| Command::Flags {
                        generation,
                        muted: Some(muted),
                        speaker_on: None,
                        reply,
                    })
                    .await;
                CallEventLogger::log_event(
                    call.sid().as_deref(),
                    CallLogEvent::Control {
                        action: "mute".into(),
                        enabled: muted,
                    },
                );
                muted
            }
            Err(err) => {
                self.record_error(format!("mute failed: {err}")).await;
                self.is_muted()
            }
        }
    }

    pub async fn toggle_speaker(&self) -> bool {
        let Some((generation, call)) = self.active_call().await else {
            return false;
        };
        let flipped = async {
            let on = call.is_speaker_on().await?;
            call.set_speaker(!on).await?;
            Ok::<_, EngineError>(!on)
        }
        .await;

        match flipped {
            Ok(on) => {
                let _ = self
                    .request(|reply| Command::Flags {
                        generation,
                        muted: None,
                        speaker_on: Some(on),
                        reply,
                    })
                    .await;
                CallEventLogger::log_event(
                    call.sid().as_deref(),
                    CallLogEvent::Control {
                        action: "speaker".into(),
                        enabled: on,
                    },
                );
                on
            }
            Err(err) => {
                self.record_error(format!("speaker toggle failed: {err}")).await;
                self.is_speaker_on()
            }
        }
    }

    /// Send DTMF tones. `false` when there is no call or the engine refuses.
    pub async fn send_dtmf(&self, digits: &str) -> bool {
        if digits.is_empty() {
            return false;
        }
        let Some((_, call)) = self.active_call().await else {
            debug!("No active call for DTMF");
            return false;
        };
        match call.send_digits(digits).await {
            Ok(()) => {
                CallEventLogger::log_event(
                    call.sid().as_deref(),
                    CallLogEvent::Digits {
                        count: digits.len(),
                    },
                );
                true
            }
            Err(err) => {
                self.record_error(format!("DTMF failed: {err}")).await;
                false
            }
        }
    }

    /// Time since the active call connected; zero without one.
    pub async fn call_duration(&self) -> Duration {
        match self.active_call().await {
            Some((_, call)) => call.duration().await.unwrap_or_default(),
            None => Duration::ZERO,
        }
    }

    pub async fn clear_error(&self) {
        let _ = self
            .request(|reply| Command::SetError {
                message: None,
                reply: Some(reply),
            })
            .await;
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn call_status(&self) -> CallStatus {
        self.snapshot.borrow().status
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.snapshot.borrow().current_call.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot.borrow().is_muted
    }

    pub fn is_speaker_on(&self) -> bool {
        self.snapshot.borrow().is_speaker_on
    }

    pub fn error(&self) -> Option<String> {
        self.snapshot.borrow().error.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot.borrow().is_initialized
    }

    pub fn is_call_active(&self) -> bool {
        self.snapshot.borrow().status.is_live()
    }

    /// Initialized and holding a lease.
    pub async fn is_registered(&self) -> bool {
        self.is_initialized() && self.leases.holds_lease().await
    }

    pub fn identity(&self) -> &str {
        self.leases.identity()
    }

    pub fn leases(&self) -> &Arc<TokenLeaseManager> {
        &self.leases
    }
}
