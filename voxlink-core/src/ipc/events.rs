//! Session status events.
//!
//! | Event | Suggested channel |
//! |-------|-------------------|
//! | `SessionStatusEvent` | `"voxlink://status"` |

use serde::{Deserialize, Serialize};

/// Emitted whenever the session changes state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (failure reason, close reason).
    pub detail: Option<String>,
}

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No devices open, no connection.
    #[default]
    Idle,
    /// Capture open, connecting to the remote.
    Connecting,
    /// Audio flowing both ways.
    Active,
    /// Releasing devices and the connection.
    Closing,
    /// The last start failed. Devices are released; `stop` returns to `Idle`.
    Failed,
}

impl SessionStatus {
    /// Whether a session is connecting or running.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SessionStatusEvent {
            status: SessionStatus::Failed,
            detail: Some("audio device unavailable: no input".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["detail"], "audio device unavailable: no input");

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<SessionStatus>(r#""Active""#).is_err());
        assert_eq!(
            serde_json::from_str::<SessionStatus>(r#""closing""#).unwrap(),
            SessionStatus::Closing
        );
    }

    #[test]
    fn live_states() {
        assert!(SessionStatus::Connecting.is_live());
        assert!(SessionStatus::Active.is_live());
        assert!(!SessionStatus::Closing.is_live());
        assert!(!SessionStatus::Failed.is_live());
        assert_eq!(SessionStatus::Idle.to_string(), "idle");
    }
}
