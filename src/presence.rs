//! Turns raw per-frame face detections into stable presence edges

use tokio::time::Instant;
use tracing::debug;

use crate::config::PresenceSettings;

/// Debounces face detections
///
/// Presence turns on once a face has been seen continuously for the greet
/// delay, and off once no face has been seen for the farewell delay.
#[derive(Debug)]
pub struct PresenceDebouncer {
    greet_delay: std::time::Duration,
    farewell_delay: std::time::Duration,
    first_seen: Option<Instant>,
    last_seen: Option<Instant>,
    present: bool,
}

impl PresenceDebouncer {
    pub fn new(settings: &PresenceSettings) -> Self {
        Self {
            greet_delay: settings.greet_delay,
            farewell_delay: settings.farewell_delay,
            first_seen: None,
            last_seen: None,
            present: false,
        }
    }

    /// Feed one detection result; returns the new presence on an edge
    pub fn observe(&mut self, face: bool, now: Instant) -> Option<bool> {
        if face {
            self.last_seen = Some(now);
            let first_seen = *self.first_seen.get_or_insert(now);

            if !self.present && now.duration_since(first_seen) >= self.greet_delay {
                self.present = true;
                debug!("face stable, presence on");
                return Some(true);
            }
        } else {
            // Arrival must be continuous
            self.first_seen = None;

            if let Some(last_seen) = self.last_seen {
                if self.present && now.duration_since(last_seen) >= self.farewell_delay {
                    self.present = false;
                    self.last_seen = None;
                    debug!("face gone, presence off");
                    return Some(false);
                }
            }
        }

        None
    }

    pub fn is_present(&self) -> bool {
        self.present
    }
}
