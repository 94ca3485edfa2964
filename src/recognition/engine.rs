//! Engine-facing types: session ids, lifecycle events and the error taxonomy

use serde::{Deserialize, Serialize};

/// Identifies one recognition session. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Lifecycle events reported by the engine for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecognitionEvent {
    /// Engine confirmed capture has begun
    Started,
    /// The human began talking
    SpeechDetected,
    /// A finalized recognition result
    Result { text: String },
    /// The session failed
    Error { error: RecognitionError },
    /// The engine closed the session (after a stop, or on its own)
    Ended,
}

/// Errors raised at the recognizer boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RecognitionError {
    #[error("speech credential acquisition failed: {0}")]
    Auth(String),

    #[error("microphone unavailable: {0}")]
    Device(String),

    #[error("transient recognition failure: {0}")]
    Transient(String),

    #[error("speech recognition is not supported on this platform")]
    Unsupported,

    #[error("a recognition session is already active")]
    AlreadyActive,
}

impl RecognitionError {
    /// Whether a bounded retry may recover from this error
    pub fn is_transient(&self) -> bool {
        matches!(self, RecognitionError::Transient(_))
    }

    /// Stable machine-readable code for diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            RecognitionError::Auth(_) => "auth",
            RecognitionError::Device(_) => "device",
            RecognitionError::Transient(_) => "transient",
            RecognitionError::Unsupported => "unsupported",
            RecognitionError::AlreadyActive => "already_active",
        }
    }

    /// Short message suitable for showing next to the listening indicator
    pub fn user_message(&self) -> String {
        match self {
            RecognitionError::Auth(_) => {
                "Speech service sign-in failed. Listening is paused.".to_string()
            }
            RecognitionError::Device(_) => {
                "Microphone unavailable. Check the permission and turn the mic back on.".to_string()
            }
            RecognitionError::Transient(_) => {
                "Speech recognition is having trouble. Not listening right now.".to_string()
            }
            RecognitionError::Unsupported => {
                "This browser does not support speech recognition.".to_string()
            }
            RecognitionError::AlreadyActive => {
                "Speech recognition is busy.".to_string()
            }
        }
    }
}

/// Vendor-specific speech-to-text engine
///
/// Calls are made from the coordinator task only, one at a time. `abort`
/// must guarantee the engine reports nothing further for that session.
pub trait SpeechEngine: Send {
    /// Open a session and begin continuous recognition
    fn open(&mut self, session: SessionId) -> Result<(), RecognitionError>;

    /// Ask the session to stop after flushing a final result
    fn stop(&mut self, session: SessionId);

    /// Abort the session immediately
    fn abort(&mut self, session: SessionId);
}
