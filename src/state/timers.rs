//! Cancellable timers backing the arbiter's scheduled tasks

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::driver::Input;
use super::machine::{ArbiterInput, TimerKind};

/// One pending task per timer kind
///
/// A fire that races an abort is still delivered; the arbiter drops it by
/// generation.
#[derive(Default)]
pub struct Timers {
    pending: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    pub fn schedule(
        &mut self,
        timer: TimerKind,
        generation: u64,
        after: Duration,
        input_tx: mpsc::UnboundedSender<Input>,
    ) {
        self.cancel(timer);

        debug!(?timer, generation, after_ms = after.as_millis() as u64, "timer scheduled");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = input_tx.send(Input::Signal(ArbiterInput::TimerFired { timer, generation }));
        });
        self.pending.insert(timer, handle);
    }

    pub fn cancel(&mut self, timer: TimerKind) {
        if let Some(handle) = self.pending.remove(&timer) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}
