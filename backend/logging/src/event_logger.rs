//! Call Event Logger
//!
//! Structured call lifecycle records (status changes, controls, errors)
//! emitted on the `call_events` target.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::redact::redact_sensitive_data;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallLogEvent {
    Dialed {
        to: String,
    },
    StatusChanged {
        from: String,
        to: String,
        source: String,
    },
    Control {
        action: String,
        enabled: bool,
    },
    Digits {
        count: usize,
    },
    Error {
        error_msg: String,
    },
}

#[derive(Debug, Serialize)]
pub struct CallLogEntry {
    pub call_sid: String,
    pub timestamp: DateTime<Utc>,
    pub event: CallLogEvent,
}

pub struct CallEventLogger;

impl CallEventLogger {
    /// Redacts free-text fields and writes the event to the tracing system.
    pub fn log_event(call_sid: Option<&str>, mut event: CallLogEvent) {
        match &mut event {
            CallLogEvent::Dialed { to } => {
                *to = redact_sensitive_data(to);
            }
            CallLogEvent::Error { error_msg } => {
                *error_msg = redact_sensitive_data(error_msg);
            }
            CallLogEvent::StatusChanged { .. }
            | CallLogEvent::Control { .. }
            | CallLogEvent::Digits { .. } => {}
        }

        let entry = CallLogEntry {
            call_sid: call_sid.unwrap_or("pending").to_string(),
            timestamp: Utc::now(),
            event,
        };

        let payload = serde_json::to_string(&entry).unwrap_or_default();
        info!(target: "call_events", call_sid = %entry.call_sid, event = %payload, "Call event");
    }
}
