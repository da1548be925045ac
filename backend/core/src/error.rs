use thiserror::Error;

/// Failure reported by the telephony engine adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine rejected the access token (401-class).
    #[error("engine rejected credentials: {0}")]
    Unauthorized(String),

    #[error("no active call")]
    NoActiveCall,

    #[error("{0}")]
    Failed(String),
}

impl EngineError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Top-level error type for the call-session subsystem.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("token acquisition failed after {attempts} attempt(s): {message}")]
    TokenAcquisition { attempts: u32, message: String },

    #[error("voice service not initialized")]
    NotInitialized,

    #[error("invalid phone number: {0:?}")]
    InvalidNumber(String),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a call is already in progress")]
    SessionActive,

    #[error("call attempt cancelled")]
    Cancelled,

    #[error("backend request failed: {0}")]
    Backend(String),
}

pub type CallResult<T> = Result<T, CallError>;
