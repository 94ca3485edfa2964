//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};

use crate::events::OutboundEvent;
use crate::playback::PlaybackReport;
use crate::recognition::{RecognitionEvent, SessionId};
use crate::state::ConversationState;

/// Requests from the browser client (or the perception service) to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Ping to check connectivity
    Ping,

    /// Subscribe to outbound notifications
    Subscribe,

    /// Debounced presence from the perception service
    Presence { present: bool },

    /// One raw face detection, debounced by the daemon
    Detection { face: bool },

    /// User toggled the microphone
    SetMicDesire { enabled: bool },

    /// Text for the avatar to say
    SpeakRequest { text: String },

    /// Playback report from a registered audio sink
    Playback {
        #[serde(default = "default_source")]
        source: String,
        report: PlaybackReport,
    },

    /// Lifecycle event from the client-side recognizer
    Recognition {
        session: SessionId,
        event: RecognitionEvent,
    },
}

fn default_source() -> String {
    "tts".to_string()
}

/// Responses from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Input queued for the coordinator
    Accepted,

    /// Pushed to subscribed clients
    Notification { event: OutboundEvent },

    /// Error response
    Error { code: String, message: String },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Current conversation state
    pub state: ConversationState,

    /// Whether the microphone is armed
    pub listening: bool,

    /// Whether synthesized audio is rendering
    pub playback_active: bool,

    /// Current avatar asset
    pub avatar: Option<String>,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: ConversationState::default(),
            listening: false,
            playback_active: false,
            avatar: None,
            uptime_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserialization() {
        let req: Request = serde_json::from_str(r#"{"type":"presence","present":true}"#).unwrap();
        assert!(matches!(req, Request::Presence { present: true }));

        let req: Request =
            serde_json::from_str(r#"{"type":"set_mic_desire","enabled":false}"#).unwrap();
        assert!(matches!(req, Request::SetMicDesire { enabled: false }));
    }

    #[test]
    fn test_playback_request_defaults_source() {
        let json = r#"{"type":"playback","report":{"kind":"status","position_ms":250}}"#;
        match serde_json::from_str::<Request>(json).unwrap() {
            Request::Playback { source, report } => {
                assert_eq!(source, "tts");
                match report {
                    PlaybackReport::Status(status) => {
                        assert_eq!(status.position_ms, 250);
                        assert!(!status.paused && !status.ended);
                    }
                    other => panic!("unexpected report: {other:?}"),
                }
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_recognition_request() {
        let json = r#"{"type":"recognition","session":3,"event":{"type":"result","text":"hi"}}"#;
        match serde_json::from_str::<Request>(json).unwrap() {
            Request::Recognition { session, event } => {
                assert_eq!(session, SessionId(3));
                assert_eq!(event, RecognitionEvent::Result { text: "hi".into() });
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Status(DaemonStatus::default());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"state\":\"silent\""));

        let resp = Response::Notification {
            event: OutboundEvent::Listening { on: true },
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"type":"notification","event":{"type":"listening","on":true}}"#
        );
    }
}
