//! Call-session management for CallHub.
//!
//! Turns a phone number into an observable voice call: token leases for the
//! voice engine, the engine adapter, the session state machine with its
//! reconciliation poll, and the call history client.

pub mod backend;
pub mod config;
pub mod controller;
pub mod engine;
pub mod history;
pub mod lease;
pub mod retry;
pub mod subsystem;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{BackendError, CallControlApi, HistoryQuery, HttpCallControl, TokenGrant};
pub use config::VoiceConfig;
pub use controller::{CallSessionController, CallSnapshot};
pub use engine::{
    CallInvite, ConnectParams, EngineCall, EngineCallState, EngineEvent, SimulatedEngine,
    VoiceEngine,
};
pub use history::HistoryClient;
pub use lease::TokenLeaseManager;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use subsystem::VoiceSubsystem;
