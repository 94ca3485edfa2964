//! Playback module deriving the speaking gate from audio sinks
//!
//! Any number of playable resources can register; all of them drive the
//! same global gate.

mod signal;

pub use signal::{PlaybackEvent, PlaybackReport, PlaybackSignal, PlaybackSource};
