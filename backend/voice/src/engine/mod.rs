//! Telephony Engine Adapter.
//!
//! Capability traits over the external voice engine. No business logic
//! lives here; the controller only ever talks to these traits so that the
//! simulated engine can stand in for a native one.

pub mod sim;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use callhub_core::{CallEvent, CallStatus, EngineError};

pub use sim::{SimulatedCall, SimulatedEngine, SimulatedInvite};

/// State reported by `EngineCall::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCallState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl EngineCallState {
    pub fn as_status(self) -> CallStatus {
        match self {
            Self::Connecting => CallStatus::Connecting,
            Self::Connected => CallStatus::Connected,
            Self::Disconnected => CallStatus::Disconnected,
            Self::Failed => CallStatus::Failed,
        }
    }
}

/// Parameters handed to `connect`; forwarded by the engine to the backend's
/// outgoing-call webhook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "contactId")]
    pub contact_id: String,
    #[serde(flatten)]
    pub custom: BTreeMap<String, String>,
}

impl ConnectParams {
    pub fn new(to: impl Into<String>, from: impl Into<String>, contact_id: Option<&str>) -> Self {
        let to = to.into();
        let contact_id = contact_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| to.clone());
        Self {
            to,
            from: from.into(),
            contact_id,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Flattened `{To, From, contactId, ...custom}` map.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.custom.clone();
        map.insert("To".into(), self.to.clone());
        map.insert("From".into(), self.from.clone());
        map.insert("contactId".into(), self.contact_id.clone());
        map
    }
}

/// A live call object owned by the engine.
#[async_trait]
pub trait EngineCall: Send + Sync {
    /// Engine-assigned call SID, once known.
    fn sid(&self) -> Option<String>;

    fn params(&self) -> &ConnectParams;

    /// Subscribe to lifecycle events for this call.
    fn subscribe(&self) -> broadcast::Receiver<CallEvent>;

    async fn state(&self) -> Result<EngineCallState, EngineError>;

    async fn is_muted(&self) -> Result<bool, EngineError>;

    async fn is_speaker_on(&self) -> Result<bool, EngineError>;

    /// Time since media connected; zero before that.
    async fn duration(&self) -> Result<Duration, EngineError>;

    async fn mute(&self, muted: bool) -> Result<(), EngineError>;

    async fn set_speaker(&self, on: bool) -> Result<(), EngineError>;

    async fn send_digits(&self, digits: &str) -> Result<(), EngineError>;

    async fn disconnect(&self) -> Result<(), EngineError>;
}

/// An incoming call waiting to be answered.
#[async_trait]
pub trait CallInvite: Send + Sync {
    fn call_sid(&self) -> &str;

    /// Caller address.
    fn from(&self) -> &str;

    async fn accept(&self) -> Result<Arc<dyn EngineCall>, EngineError>;

    async fn reject(&self) -> Result<(), EngineError>;
}

/// Engine-level notifications.
#[derive(Clone)]
pub enum EngineEvent {
    Registered,
    Unregistered,
    Invite(Arc<dyn CallInvite>),
    Error(EngineError),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => f.write_str("Registered"),
            Self::Unregistered => f.write_str("Unregistered"),
            Self::Invite(invite) => f
                .debug_struct("Invite")
                .field("call_sid", &invite.call_sid())
                .finish(),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// The voice engine itself.
#[async_trait]
pub trait VoiceEngine: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &str;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    async fn register(&self, token: &str) -> Result<(), EngineError>;

    async fn unregister(&self, token: &str) -> Result<(), EngineError>;

    async fn connect(
        &self,
        token: &str,
        params: ConnectParams,
    ) -> Result<Arc<dyn EngineCall>, EngineError>;
}
