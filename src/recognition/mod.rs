//! Recognition module wrapping the external speech-to-text engine
//!
//! The engine is presented as a single-session resource: at most one
//! session is ever open, and a session must be fully closed before the
//! next one may start.

mod engine;
mod lifecycle;
mod remote;

pub use engine::{RecognitionError, RecognitionEvent, SessionId, SpeechEngine};
pub use lifecycle::Recognizer;
pub use remote::RemoteEngine;
