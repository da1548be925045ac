use serde::{Deserialize, Serialize};

/// Lifecycle events fired by the engine on a live call object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum CallEvent {
    /// The call is ringing / negotiating media
    Connecting,
    /// Media is flowing
    Connected,
    /// Media was lost and the engine is trying to recover
    Reconnecting,
    /// Media recovered after a reconnect
    Reconnected,
    /// The call ended (either side hung up, or the engine gave up)
    Disconnected,
    /// Opaque engine failure on this call
    Error(String),
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::Disconnected => "disconnected",
            Self::Error(_) => "error",
        }
    }
}

impl std::fmt::Display for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(message) => write!(f, "error: {message}"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_string(&CallEvent::Reconnecting).unwrap();
        assert_eq!(json, r#"{"type":"reconnecting"}"#);

        let err: CallEvent =
            serde_json::from_str(r#"{"type":"error","message":"31005"}"#).unwrap();
        assert_eq!(err, CallEvent::Error("31005".into()));
    }

    #[test]
    fn test_event_display() {
        assert_eq!(CallEvent::Connected.to_string(), "connected");
        assert_eq!(CallEvent::Error("boom".into()).to_string(), "error: boom");
    }
}
