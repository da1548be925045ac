pub mod error;
pub mod event;
pub mod types;
pub mod validate;

pub use error::{CallError, CallResult, EngineError};
pub use event::CallEvent;
pub use types::{
    CallDirection, CallHistoryItem, CallInfo, CallSession, CallStats, CallStatus, Contact,
    PagedCallList, Pagination, TokenLease, Transcript,
};
