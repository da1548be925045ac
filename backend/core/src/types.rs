use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::event::CallEvent;

/// Public lifecycle state of the single call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }

    /// `Disconnected` and `Failed` end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// A session in this state still owns an engine call.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Whether `next` is reachable from `self` in one step. Self-loops are allowed.
    pub fn can_transition_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected | Disconnected | Failed)
                | (Connected, Reconnecting | Disconnected | Failed)
                | (Reconnecting, Connected | Disconnected | Failed)
                | (Disconnected | Failed, Connecting)
        )
    }

    /// Status a call event moves this state to, or `None` when the event
    /// does not apply (stale event for a finished call, or an error that the
    /// engine reports without ending the call).
    pub fn on_event(self, event: &CallEvent) -> Option<CallStatus> {
        use CallStatus::*;
        let next = match (self, event) {
            (Idle | Disconnected | Failed, _) => return None,

            (Connecting, CallEvent::Connecting) => Connecting,
            (Connecting, CallEvent::Connected | CallEvent::Reconnected) => Connected,
            (Connecting, CallEvent::Reconnecting) => return None,
            (Connecting, CallEvent::Disconnected) => Disconnected,
            (Connecting, CallEvent::Error(_)) => Failed,

            (Connected, CallEvent::Connecting) => return None,
            (Connected, CallEvent::Connected | CallEvent::Reconnected) => Connected,
            (Connected, CallEvent::Reconnecting) => Reconnecting,
            (Connected, CallEvent::Disconnected) => Disconnected,
            (Connected, CallEvent::Error(_)) => return None,

            (Reconnecting, CallEvent::Connecting | CallEvent::Reconnecting) => Reconnecting,
            (Reconnecting, CallEvent::Connected | CallEvent::Reconnected) => Connected,
            (Reconnecting, CallEvent::Disconnected) => Disconnected,
            (Reconnecting, CallEvent::Error(_)) => return None,
        };
        debug_assert!(self.can_transition_to(next));
        Some(next)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The other party of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub phone_number: String,
}

impl Contact {
    /// Falls back to the number itself when no contact id is known.
    pub fn new(phone_number: impl Into<String>, contact_id: Option<&str>) -> Self {
        let phone_number = phone_number.into();
        let name = contact_id
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| phone_number.clone());
        Self { name, phone_number }
    }
}

/// In-memory record of the currently active call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub sid: Option<String>,
    pub status: CallStatus,
    pub contact: Contact,
    pub is_muted: bool,
    pub is_speaker_on: bool,
}

impl CallSession {
    pub fn dialing(contact: Contact) -> Self {
        Self {
            sid: None,
            status: CallStatus::Connecting,
            contact,
            is_muted: false,
            is_speaker_on: false,
        }
    }
}

/// Short-lived credential for registering with the telephony engine.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub token: String,
    pub identity: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenLease {
    /// True once `now` is within `threshold` of expiry.
    pub fn needs_refresh(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now >= self.expires_at - threshold
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// Tokens never reach logs.
impl fmt::Debug for TokenLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenLease")
            .field("token", &"[REDACTED]")
            .field("identity", &self.identity)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Direction of a recorded call (`type` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Call metadata attached to a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "type", default)]
    pub direction: Option<CallDirection>,
}

/// Transcript and recording details for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub call_sid: String,
    #[serde(default)]
    pub transcript: Option<String>,
    pub status: String,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub recording_url: Option<String>,
    pub call_info: CallInfo,
}

/// One row of the paginated call history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryItem {
    pub call_sid: String,
    pub to: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: String,
    #[serde(rename = "type")]
    pub direction: CallDirection,
    #[serde(default)]
    pub has_transcript: bool,
    #[serde(default)]
    pub has_recording: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedCallList {
    pub calls: Vec<CallHistoryItem>,
    pub pagination: Pagination,
}

/// Aggregate call statistics for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub total_calls: u64,
    pub completed_calls: u64,
    pub total_duration: u64,
    pub average_duration: u64,
    pub calls_with_transcripts: u64,
    pub calls_with_recordings: u64,
}

/// Call durations arrive from webhooks as strings ("42") or numbers.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Number(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}
