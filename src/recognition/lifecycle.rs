//! Single-session ownership of the speech engine
//!
//! The wrapper is the only path to the engine, so session creation and
//! destruction are serialized through it. A graceful stop keeps the slot
//! occupied until the engine reports `Ended`; starting in that window is
//! refused.

use tracing::{debug, info, warn};

use super::engine::{RecognitionError, RecognitionEvent, SessionId, SpeechEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle,
    Open(SessionId),
    Closing(SessionId),
}

/// Owns at most one live recognition session
pub struct Recognizer<E> {
    engine: E,
    slot: Slot,
}

impl<E: SpeechEngine> Recognizer<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            slot: Slot::Idle,
        }
    }

    /// Open `session`. The slot must be idle.
    pub fn start(&mut self, session: SessionId) -> Result<(), RecognitionError> {
        match self.slot {
            Slot::Open(current) | Slot::Closing(current) => {
                warn!(%session, %current, "refusing to start, microphone still claimed");
                Err(RecognitionError::AlreadyActive)
            }
            Slot::Idle => {
                self.engine.open(session)?;
                self.slot = Slot::Open(session);
                info!(%session, "recognition session opened");
                Ok(())
            }
        }
    }

    /// Stop `session`. A hard stop releases the slot before returning.
    pub fn stop(&mut self, session: SessionId, hard: bool) {
        match self.slot {
            Slot::Open(current) if current == session => {
                if hard {
                    self.engine.abort(session);
                    self.slot = Slot::Idle;
                    info!(%session, "recognition session aborted");
                } else {
                    self.engine.stop(session);
                    self.slot = Slot::Closing(session);
                    info!(%session, "recognition session closing");
                }
            }
            Slot::Closing(current) if current == session => {
                if hard {
                    self.engine.abort(session);
                    self.slot = Slot::Idle;
                    info!(%session, "closing session aborted");
                }
            }
            _ => {
                debug!(%session, "stop for inactive session ignored");
            }
        }
    }

    /// Filter an engine event. Returns false when it must be discarded.
    pub fn accept(&mut self, session: SessionId, event: &RecognitionEvent) -> bool {
        let current = match self.slot {
            Slot::Open(id) | Slot::Closing(id) => id,
            Slot::Idle => {
                debug!(%session, ?event, "event with no live session dropped");
                return false;
            }
        };

        if current != session {
            debug!(%session, %current, ?event, "stale session event dropped");
            return false;
        }

        if matches!(event, RecognitionEvent::Ended) {
            debug!(%session, "engine released session");
            self.slot = Slot::Idle;
        }

        true
    }

    /// The live session, open or closing
    pub fn session(&self) -> Option<SessionId> {
        match self.slot {
            Slot::Open(id) | Slot::Closing(id) => Some(id),
            Slot::Idle => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }
}
