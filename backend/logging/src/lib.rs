//! Telemetry and structured logging components for CallHub.
//!
//! Handles log redaction, console/JSON output, file rotation, and call event logging.

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::{CallEventLogger, CallLogEntry, CallLogEvent};
pub use logger::{init_file_logger, init_logger};
pub use redact::{mask_number, redact_sensitive_data};
