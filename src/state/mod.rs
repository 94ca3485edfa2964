//! State module for turn-taking
//!
//! Provides the turn arbiter with three conversation states:
//! - Silent: not listening, not speaking
//! - Listening: a human is talking into an open recognition session
//! - Speaking: synthesized speech owns the audio device, microphone off
//!
//! The coordinator drives the arbiter from a single input queue and
//! executes the commands it returns.

mod driver;
mod machine;
mod timers;

pub use driver::{Coordinator, Input};
pub use machine::{ArbiterInput, ConversationState};
