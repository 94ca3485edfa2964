//! Coordinator task running the arbiter
//!
//! Every signal source (IPC clients, playback sources, timers) feeds one
//! unbounded queue. Each input is processed to completion, including any
//! failure the recognizer wrapper reports while executing the resulting
//! commands, before the next input is taken.

use std::collections::VecDeque;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::avatar::AvatarProjector;
use crate::config::{Config, PresenceSettings};
use crate::events::OutboundEvent;
use crate::presence::PresenceDebouncer;
use crate::recognition::{Recognizer, SpeechEngine};

use super::machine::{ArbiterInput, Command, ConversationState, TurnArbiter};
use super::timers::Timers;

/// Inputs accepted by the coordinator queue
#[derive(Debug, Clone)]
pub enum Input {
    /// Straight to the arbiter
    Signal(ArbiterInput),
    /// Raw face detection from the perception service
    Detection { face: bool },
    /// Text the avatar should say
    SpeakRequest { text: String },
}

pub struct Coordinator<E> {
    arbiter: TurnArbiter,
    recognizer: Recognizer<E>,
    presence: PresenceDebouncer,
    presence_settings: PresenceSettings,
    projector: AvatarProjector,
    timers: Timers,
    input_tx: mpsc::UnboundedSender<Input>,
    event_tx: broadcast::Sender<OutboundEvent>,
}

impl<E: SpeechEngine> Coordinator<E> {
    pub fn new(
        config: &Config,
        recognizer: Recognizer<E>,
        input_tx: mpsc::UnboundedSender<Input>,
        event_tx: broadcast::Sender<OutboundEvent>,
    ) -> Self {
        Self {
            arbiter: TurnArbiter::new(config.timings.clone()),
            recognizer,
            presence: PresenceDebouncer::new(&config.presence),
            presence_settings: config.presence.clone(),
            projector: AvatarProjector::new(config.avatar.clone()),
            timers: Timers::default(),
            input_tx,
            event_tx,
        }
    }

    /// Run until every input sender is gone
    pub async fn run(&mut self, mut input_rx: mpsc::UnboundedReceiver<Input>) {
        info!(state = %self.arbiter.state(), "coordinator started");
        self.project(self.arbiter.state());

        while let Some(input) = input_rx.recv().await {
            self.dispatch(input);
        }

        self.shutdown();
    }

    /// Cancel pending timers and abort any live recognition session
    ///
    /// `run` holds a sender of its own queue, so callers stop it by dropping
    /// its future and then call this.
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        if let Some(session) = self.recognizer.session() {
            info!(%session, "aborting recognition session");
            self.recognizer.stop(session, true);
            self.publish(OutboundEvent::Listening { on: false });
        }
        info!("coordinator stopped");
    }

    fn dispatch(&mut self, input: Input) {
        match input {
            Input::Signal(signal) => self.process(signal),
            Input::Detection { face } => {
                let edge = self.presence.observe(face, Instant::now());
                debug!(face, present = self.presence.is_present(), "detection observed");
                if let Some(present) = edge {
                    let line = if present {
                        self.presence_settings.greeting.clone()
                    } else {
                        self.presence_settings.farewell.clone()
                    };
                    // The client gets the line before any recognizer start, so
                    // TTS can begin as early as possible. The session still
                    // opens and is aborted by the playback start edge.
                    if let Some(text) = line {
                        self.speak(&text);
                    }
                    self.process(ArbiterInput::PresenceChanged(present));
                }
            }
            Input::SpeakRequest { text } => self.speak(&text),
        }
    }

    fn speak(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            debug!("empty speak request ignored");
            return;
        }
        self.publish(OutboundEvent::Speak {
            text: text.to_string(),
        });
    }

    fn process(&mut self, input: ArbiterInput) {
        let mut pending = VecDeque::from([input]);

        while let Some(input) = pending.pop_front() {
            if let ArbiterInput::Recognition { session, event } = &input {
                if !self.recognizer.accept(*session, event) {
                    continue;
                }
            }

            for command in self.arbiter.handle(input) {
                match command {
                    Command::StartRecognizer(session) => {
                        if let Err(error) = self.recognizer.start(session) {
                            pending.push_back(ArbiterInput::RecognizerFailed { session, error });
                        }
                    }
                    Command::StopRecognizer { session, hard } => {
                        self.recognizer.stop(session, hard);
                    }
                    Command::Schedule {
                        timer,
                        generation,
                        after,
                    } => {
                        self.timers
                            .schedule(timer, generation, after, self.input_tx.clone());
                    }
                    Command::Cancel(timer) => self.timers.cancel(timer),
                    Command::Emit(event) => {
                        let state = match &event {
                            OutboundEvent::StateChanged { state, .. } => Some(*state),
                            _ => None,
                        };
                        self.publish(event);
                        if let Some(state) = state {
                            self.project(state);
                        }
                    }
                }
            }
        }

        debug!(
            state = %self.arbiter.state(),
            presence = self.arbiter.presence(),
            mic_desire = self.arbiter.mic_desire(),
            playback = self.arbiter.playback_active(),
            session = ?self.arbiter.session(),
            "input processed"
        );
    }

    fn project(&self, state: ConversationState) {
        let asset = self.projector.project(state).to_string();
        self.publish(OutboundEvent::Avatar { asset });
    }

    fn publish(&self, event: OutboundEvent) {
        debug!(%event, "publishing");
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}
