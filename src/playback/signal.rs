//! Shared playback gate with edge-triggered notifications
//!
//! Sources report either raw sink status or bare edges. The gate derives
//! activity and forwards only real edges to the coordinator. Sources share
//! one gate and the last writer wins on overlap.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{ArbiterInput, Input};

/// Edges forwarded to the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEvent {
    Started,
    Paused,
    Ended,
}

/// Raw status of an audio sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    #[serde(default)]
    pub position_ms: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub ended: bool,
}

impl PlaybackStatus {
    /// Playing at a non-zero position and not ended
    pub fn is_active(&self) -> bool {
        self.position_ms > 0 && !self.paused && !self.ended
    }
}

/// What a registered source tells the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlaybackReport {
    Status(PlaybackStatus),
    Started,
    Paused,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Playing,
    Paused,
}

impl Phase {
    fn apply(self, report: PlaybackReport) -> (Phase, Option<PlaybackEvent>) {
        let edge = match report {
            PlaybackReport::Started => PlaybackEvent::Started,
            PlaybackReport::Paused => PlaybackEvent::Paused,
            PlaybackReport::Ended => PlaybackEvent::Ended,
            PlaybackReport::Status(status) if status.ended => PlaybackEvent::Ended,
            PlaybackReport::Status(status) if status.paused => PlaybackEvent::Paused,
            PlaybackReport::Status(status) if status.is_active() => PlaybackEvent::Started,
            // Buffering at position zero
            PlaybackReport::Status(_) => return (self, None),
        };

        match (self, edge) {
            (Phase::Playing, PlaybackEvent::Started) => (self, None),
            (_, PlaybackEvent::Started) => (Phase::Playing, Some(PlaybackEvent::Started)),
            (Phase::Playing, PlaybackEvent::Paused) => (Phase::Paused, Some(PlaybackEvent::Paused)),
            (_, PlaybackEvent::Paused) => (self, None),
            (Phase::Idle, PlaybackEvent::Ended) => (self, None),
            (_, PlaybackEvent::Ended) => (Phase::Idle, Some(PlaybackEvent::Ended)),
        }
    }
}

struct Gate {
    phase: Phase,
    last_writer: Option<String>,
}

struct Inner {
    gate: Mutex<Gate>,
    input_tx: mpsc::UnboundedSender<Input>,
}

/// The single speaking gate shared by every registered source
#[derive(Clone)]
pub struct PlaybackSignal {
    inner: Arc<Inner>,
}

impl PlaybackSignal {
    pub fn new(input_tx: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(Gate {
                    phase: Phase::Idle,
                    last_writer: None,
                }),
                input_tx,
            }),
        }
    }

    /// Attach a playable resource to the gate
    pub fn register(&self, name: impl Into<String>) -> PlaybackSource {
        let name = name.into();
        info!(source = %name, "playback source registered");
        PlaybackSource {
            name,
            signal: self.clone(),
        }
    }

    /// Whether synthesized audio is rendering right now
    pub fn is_active(&self) -> bool {
        self.inner.gate.lock().phase == Phase::Playing
    }

    fn report(&self, source: &str, report: PlaybackReport) -> Option<PlaybackEvent> {
        // Edges are sent under the lock so the queue sees them in gate order
        let mut gate = self.inner.gate.lock();
        let (phase, edge) = gate.phase.apply(report);

        if let Some(previous) = gate.last_writer.as_deref() {
            if previous != source && gate.phase != Phase::Idle {
                debug!(source, previous, "overlapping playback sources, last writer wins");
            }
        }
        gate.phase = phase;
        gate.last_writer = Some(source.to_string());

        if let Some(edge) = edge {
            debug!(source, ?edge, "playback edge");
            let input = Input::Signal(ArbiterInput::Playback(edge));
            if self.inner.input_tx.send(input).is_err() {
                warn!(source, "coordinator gone, playback edge dropped");
            }
        }

        edge
    }
}

/// A registered playable resource
#[derive(Clone)]
pub struct PlaybackSource {
    name: String,
    signal: PlaybackSignal,
}

impl PlaybackSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Report sink state; returns the edge forwarded, if any
    pub fn report(&self, report: PlaybackReport) -> Option<PlaybackEvent> {
        self.signal.report(&self.name, report)
    }
}
