//! Events module for outbound coordinator notifications
//!
//! Everything the coordinator tells the outside world (state changes,
//! recognizer control, finalized utterances, diagnostics) travels as an
//! `OutboundEvent` over a broadcast channel.

use serde::{Deserialize, Serialize};

use crate::recognition::SessionId;
use crate::state::ConversationState;

/// Events emitted by the coordinator during transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// Conversation state changed
    StateChanged {
        state: ConversationState,
        previous: ConversationState,
    },

    /// Microphone capture armed or disarmed (listening indicator)
    Listening { on: bool },

    /// Avatar presentation asset for the current state
    Avatar { asset: String },

    /// A finalized utterance for the backend
    VoiceInput { text: String },

    /// Text the client should synthesize and play
    Speak { text: String },

    /// Control message for the client-side recognizer
    Recognizer {
        session: SessionId,
        action: RecognizerAction,
    },

    /// Short user-facing diagnostic (recognition failures)
    Diagnostic { code: String, message: String },
}

/// What the client-side recognizer should do with a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecognizerAction {
    /// Begin continuous recognition
    Start {
        language: String,
        initial_silence_ms: u64,
        end_silence_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Stop, letting one final result flush
    Stop,
    /// Abort immediately, discarding partial results
    Abort,
}

impl std::fmt::Display for OutboundEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboundEvent::StateChanged { state, previous } => {
                write!(f, "STATE_CHANGED ({} -> {})", previous, state)
            }
            OutboundEvent::Listening { on } => {
                write!(f, "LISTENING ({})", if *on { "on" } else { "off" })
            }
            OutboundEvent::Avatar { asset } => write!(f, "AVATAR ({})", asset),
            OutboundEvent::VoiceInput { text } => write!(f, "VOICE_INPUT ({} chars)", text.len()),
            OutboundEvent::Speak { text } => write!(f, "SPEAK ({} chars)", text.len()),
            OutboundEvent::Recognizer { session, action } => {
                let action = match action {
                    RecognizerAction::Start { .. } => "start",
                    RecognizerAction::Stop => "stop",
                    RecognizerAction::Abort => "abort",
                };
                write!(f, "RECOGNIZER {} ({})", action, session)
            }
            OutboundEvent::Diagnostic { code, .. } => write!(f, "DIAGNOSTIC ({})", code),
        }
    }
}
