//! Core turn arbiter implementation
//!
//! `TurnArbiter::handle` is the only transition function. It consumes one
//! input, updates the arbiter's fields and returns the commands the
//! coordinator must execute, in order. Playback start always wins: any
//! recognition session is hard-stopped before anything else happens.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::TurnTimings;
use crate::events::OutboundEvent;
use crate::playback::PlaybackEvent;
use crate::recognition::{RecognitionError, RecognitionEvent, SessionId};

/// The three conversation states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Neither listening nor speaking
    Silent,
    /// The human is talking into an open session
    Listening,
    /// Synthesized speech owns the audio device
    Speaking,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::Silent
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationState::Silent => write!(f, "Silent"),
            ConversationState::Listening => write!(f, "Listening"),
            ConversationState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// Timers owned by the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Clears the anti-duplicate utterance lock
    UtteranceCooldown,
    /// Re-arms the microphone after playback ends
    Settle,
    /// Single retry after a transient recognition failure
    RetryBackoff,
}

/// Everything the arbiter reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterInput {
    PresenceChanged(bool),
    MicDesireChanged(bool),
    Playback(PlaybackEvent),
    Recognition {
        session: SessionId,
        event: RecognitionEvent,
    },
    /// The recognizer wrapper refused or failed to open a session
    RecognizerFailed {
        session: SessionId,
        error: RecognitionError,
    },
    TimerFired {
        timer: TimerKind,
        generation: u64,
    },
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartRecognizer(SessionId),
    StopRecognizer { session: SessionId, hard: bool },
    Schedule {
        timer: TimerKind,
        generation: u64,
        after: Duration,
    },
    Cancel(TimerKind),
    Emit(OutboundEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackPhase {
    Idle,
    Playing,
    /// Paused mid-clip; still speaking until the clip really ends
    Paused,
    /// Ended, waiting out the settle delay
    Settling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mic {
    Off,
    Open(SessionId),
    Closing(SessionId),
}

impl Mic {
    fn session(&self) -> Option<SessionId> {
        match self {
            Mic::Open(id) | Mic::Closing(id) => Some(*id),
            Mic::Off => None,
        }
    }
}

/// The single authority over listen / speak / silent
pub struct TurnArbiter {
    state: ConversationState,
    presence: bool,
    mic_desire: bool,
    playback: PlaybackPhase,
    mic: Mic,
    next_session: u64,
    /// Anti-duplicate lock held for the utterance cooldown
    utterance_lock: bool,
    /// The single transient-failure retry has been used
    retry_spent: bool,
    /// Auth or device failure; cleared when the user re-enables the mic
    blocked: bool,
    /// Recognition unavailable for the rest of the process
    unsupported: bool,
    /// Pending timers and their current generation
    armed: HashMap<TimerKind, u64>,
    next_generation: u64,
    timings: TurnTimings,
    commands: Vec<Command>,
}

impl TurnArbiter {
    pub fn new(timings: TurnTimings) -> Self {
        Self {
            state: ConversationState::Silent,
            presence: false,
            mic_desire: true,
            playback: PlaybackPhase::Idle,
            mic: Mic::Off,
            next_session: 0,
            utterance_lock: false,
            retry_spent: false,
            blocked: false,
            unsupported: false,
            armed: HashMap::new(),
            next_generation: 0,
            timings,
            commands: Vec::new(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn presence(&self) -> bool {
        self.presence
    }

    pub fn mic_desire(&self) -> bool {
        self.mic_desire
    }

    /// True only while audio is actually rendering
    pub fn playback_active(&self) -> bool {
        self.playback == PlaybackPhase::Playing
    }

    /// The live recognition session, open or closing
    pub fn session(&self) -> Option<SessionId> {
        self.mic.session()
    }

    /// Process one input and return the commands to execute
    pub fn handle(&mut self, input: ArbiterInput) -> Vec<Command> {
        match input {
            ArbiterInput::PresenceChanged(present) => self.on_presence(present),
            ArbiterInput::MicDesireChanged(enabled) => self.on_mic_desire(enabled),
            ArbiterInput::Playback(edge) => self.on_playback(edge),
            ArbiterInput::Recognition { session, event } => self.on_recognition(session, event),
            ArbiterInput::RecognizerFailed { session, error } => {
                if self.mic.session() == Some(session) {
                    self.on_failure(session, error);
                } else {
                    debug!(%session, %error, "failure for stale session ignored");
                }
            }
            ArbiterInput::TimerFired { timer, generation } => self.on_timer(timer, generation),
        }

        std::mem::take(&mut self.commands)
    }

    fn on_presence(&mut self, present: bool) {
        if present == self.presence {
            debug!(present, "presence unchanged");
            return;
        }

        info!(present, "presence changed");
        self.presence = present;
        self.reset_retry();
        // Nobody left to hear a final flush
        self.reevaluate(!present);
    }

    fn on_mic_desire(&mut self, enabled: bool) {
        let unblocked = enabled && std::mem::replace(&mut self.blocked, false);
        if unblocked {
            info!("microphone re-enabled, clearing recognition block");
        }
        if enabled == self.mic_desire && !unblocked {
            debug!(enabled, "mic desire unchanged");
            return;
        }

        info!(enabled, "mic desire changed");
        self.mic_desire = enabled;
        self.reset_retry();
        // Explicit user stop is graceful
        self.reevaluate(false);
    }

    fn on_playback(&mut self, edge: PlaybackEvent) {
        match edge {
            PlaybackEvent::Started => {
                self.disarm_microphone(true);
                self.cancel(TimerKind::Settle);
                // A pending retry is dropped, so its budget comes back
                self.reset_retry();
                if self.playback != PlaybackPhase::Playing {
                    info!("playback started");
                }
                self.playback = PlaybackPhase::Playing;
                self.set_state(ConversationState::Speaking);
            }
            PlaybackEvent::Paused => {
                if self.playback == PlaybackPhase::Playing {
                    // Pause holds Speaking until the clip ends
                    debug!("playback paused, holding speaking state");
                    self.playback = PlaybackPhase::Paused;
                }
            }
            PlaybackEvent::Ended => match self.playback {
                PlaybackPhase::Playing | PlaybackPhase::Paused => {
                    info!(settle_ms = self.timings.settle.as_millis() as u64, "playback ended");
                    if self.timings.settle.is_zero() {
                        self.playback = PlaybackPhase::Idle;
                        self.reevaluate(true);
                    } else {
                        self.playback = PlaybackPhase::Settling;
                        self.schedule(TimerKind::Settle, self.timings.settle);
                    }
                }
                PlaybackPhase::Idle | PlaybackPhase::Settling => {
                    debug!("playback end without active clip ignored");
                }
            },
        }
    }

    fn on_recognition(&mut self, session: SessionId, event: RecognitionEvent) {
        if self.mic.session() != Some(session) {
            debug!(%session, ?event, "event for stale session ignored");
            return;
        }

        match event {
            RecognitionEvent::Started => {
                debug!(%session, "recognizer confirmed capture");
            }
            RecognitionEvent::SpeechDetected => {
                self.retry_spent = false;
                if self.mic == Mic::Open(session) && self.playback == PlaybackPhase::Idle {
                    self.set_state(ConversationState::Listening);
                }
            }
            RecognitionEvent::Result { text } => self.on_result(session, &text),
            RecognitionEvent::Error { error } => self.on_failure(session, error),
            RecognitionEvent::Ended => {
                // The session ran to completion, so the retry budget is restored
                self.retry_spent = false;
                if matches!(self.mic, Mic::Open(_)) {
                    info!(%session, "recognizer ended on its own");
                    self.emit(OutboundEvent::Listening { on: false });
                } else {
                    debug!(%session, "graceful close completed");
                }
                self.mic = Mic::Off;
                self.reevaluate(true);
            }
        }
    }

    fn on_result(&mut self, session: SessionId, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            debug!(%session, "empty result ignored");
            return;
        }
        if self.utterance_lock {
            debug!(%session, "duplicate utterance dropped");
            return;
        }
        if self.playback != PlaybackPhase::Idle {
            warn!(%session, "result while speaking dropped");
            return;
        }

        self.retry_spent = false;
        self.utterance_lock = true;
        // Keep the upcoming reply out of this session
        self.disarm_microphone(true);
        info!(%session, chars = text.len(), "utterance finalized");
        self.emit(OutboundEvent::VoiceInput {
            text: text.to_string(),
        });
        self.schedule(TimerKind::UtteranceCooldown, self.timings.utterance_cooldown);
        self.normalize_state();
    }

    fn on_failure(&mut self, session: SessionId, error: RecognitionError) {
        warn!(%session, %error, "recognition session failed");
        self.disarm_microphone(true);
        if self.playback == PlaybackPhase::Idle {
            self.normalize_state();
        }

        match &error {
            transient if transient.is_transient() => {
                if self.retry_spent {
                    self.surface(transient);
                } else if self.may_listen() {
                    self.retry_spent = true;
                    info!(
                        backoff_ms = self.timings.retry_backoff.as_millis() as u64,
                        "scheduling recognition retry"
                    );
                    self.schedule(TimerKind::RetryBackoff, self.timings.retry_backoff);
                } else {
                    debug!("listening no longer allowed, no retry");
                }
            }
            RecognitionError::Auth(_) | RecognitionError::Device(_) => {
                self.blocked = true;
                self.surface(&error);
            }
            RecognitionError::Unsupported => {
                if !self.unsupported {
                    self.unsupported = true;
                    self.surface(&error);
                }
            }
            _ => {
                error!(%session, %error, "recognizer still holds a session the arbiter released");
            }
        }
    }

    fn on_timer(&mut self, timer: TimerKind, generation: u64) {
        if self.armed.get(&timer) != Some(&generation) {
            debug!(?timer, generation, "stale timer ignored");
            return;
        }
        self.armed.remove(&timer);

        match timer {
            TimerKind::Settle => {
                if self.playback == PlaybackPhase::Settling {
                    debug!("settle elapsed");
                    self.playback = PlaybackPhase::Idle;
                    self.reevaluate(true);
                }
            }
            TimerKind::UtteranceCooldown => {
                debug!("utterance lock cleared");
                self.utterance_lock = false;
                self.reevaluate(true);
            }
            TimerKind::RetryBackoff => {
                debug!("retrying recognition");
                self.reevaluate(true);
            }
        }
    }

    fn may_listen(&self) -> bool {
        self.presence
            && self.mic_desire
            && self.playback == PlaybackPhase::Idle
            && !self.utterance_lock
            && !self.blocked
            && !self.unsupported
    }

    /// Start or stop the microphone to match the gating predicate
    fn reevaluate(&mut self, hard_stop: bool) {
        if self.playback != PlaybackPhase::Idle {
            debug!("speaking, microphone stays off");
            return;
        }

        if self.may_listen() {
            self.arm_microphone();
        } else {
            self.disarm_microphone(hard_stop);
        }
        self.normalize_state();
    }

    /// With playback idle, only an open session that heard speech is Listening
    fn normalize_state(&mut self) {
        let listening =
            self.state == ConversationState::Listening && matches!(self.mic, Mic::Open(_));
        if !listening {
            self.set_state(ConversationState::Silent);
        }
    }

    fn arm_microphone(&mut self) {
        if self.mic != Mic::Off {
            debug!(session = ?self.mic.session(), "session already live");
            return;
        }

        self.next_session += 1;
        let session = SessionId(self.next_session);
        self.mic = Mic::Open(session);
        info!(%session, "arming microphone");
        self.commands.push(Command::StartRecognizer(session));
        self.emit(OutboundEvent::Listening { on: true });
    }

    fn disarm_microphone(&mut self, hard: bool) {
        match self.mic {
            Mic::Off => {}
            Mic::Open(session) => {
                self.commands.push(Command::StopRecognizer { session, hard });
                self.mic = if hard { Mic::Off } else { Mic::Closing(session) };
                self.emit(OutboundEvent::Listening { on: false });
            }
            Mic::Closing(session) => {
                if hard {
                    self.commands.push(Command::StopRecognizer { session, hard });
                    self.mic = Mic::Off;
                }
            }
        }
    }

    fn reset_retry(&mut self) {
        self.retry_spent = false;
        self.cancel(TimerKind::RetryBackoff);
    }

    fn surface(&mut self, error: &RecognitionError) {
        warn!(code = error.code(), %error, "surfacing recognition failure");
        self.emit(OutboundEvent::Diagnostic {
            code: error.code().to_string(),
            message: error.user_message(),
        });
    }

    fn set_state(&mut self, new_state: ConversationState) {
        let old_state = self.state;
        if new_state == old_state {
            return;
        }

        info!(from = %old_state, to = %new_state, "state transition");
        self.state = new_state;
        self.emit(OutboundEvent::StateChanged {
            state: new_state,
            previous: old_state,
        });
    }

    fn schedule(&mut self, timer: TimerKind, after: Duration) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(timer, generation);
        self.commands.push(Command::Schedule {
            timer,
            generation,
            after,
        });
    }

    fn cancel(&mut self, timer: TimerKind) {
        if self.armed.remove(&timer).is_some() {
            debug!(?timer, "timer cancelled");
            self.commands.push(Command::Cancel(timer));
        }
    }

    fn emit(&mut self, event: OutboundEvent) {
        self.commands.push(Command::Emit(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: ConversationState = ConversationState::Silent;
    const L: ConversationState = ConversationState::Listening;
    const K: ConversationState = ConversationState::Speaking;

    fn create_arbiter() -> TurnArbiter {
        TurnArbiter::new(TurnTimings::default())
    }

    fn started(commands: &[Command]) -> Vec<SessionId> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::StartRecognizer(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn stopped(commands: &[Command]) -> Vec<(SessionId, bool)> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::StopRecognizer { session, hard } => Some((*session, *hard)),
                _ => None,
            })
            .collect()
    }

    fn scheduled(commands: &[Command], kind: TimerKind) -> Option<u64> {
        commands.iter().find_map(|c| match c {
            Command::Schedule { timer, generation, .. } if *timer == kind => Some(*generation),
            _ => None,
        })
    }

    fn voice_inputs(commands: &[Command]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Emit(OutboundEvent::VoiceInput { text }) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn diagnostics(commands: &[Command]) -> Vec<String> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Emit(OutboundEvent::Diagnostic { code, .. }) => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    fn recognition(session: SessionId, event: RecognitionEvent) -> ArbiterInput {
        ArbiterInput::Recognition { session, event }
    }

    fn result(session: SessionId, text: &str) -> ArbiterInput {
        recognition(session, RecognitionEvent::Result { text: text.into() })
    }

    fn transient(session: SessionId) -> ArbiterInput {
        recognition(
            session,
            RecognitionEvent::Error {
                error: RecognitionError::Transient("network".into()),
            },
        )
    }

    fn fire(arbiter: &mut TurnArbiter, timer: TimerKind, generation: u64) -> Vec<Command> {
        arbiter.handle(ArbiterInput::TimerFired { timer, generation })
    }

    /// Presence on with defaults; returns the opened session
    fn arrive(arbiter: &mut TurnArbiter) -> SessionId {
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        let sessions = started(&commands);
        assert_eq!(sessions.len(), 1);
        sessions[0]
    }

    fn assert_invariants(arbiter: &TurnArbiter) {
        if arbiter.playback_active() {
            assert_eq!(arbiter.state(), K);
            assert_eq!(arbiter.session(), None);
        }
        if arbiter.session().is_some() {
            assert!(!arbiter.playback_active());
        }
        if arbiter.state() == L {
            assert!(arbiter.presence() && arbiter.mic_desire() && !arbiter.playback_active());
        }
    }

    #[test]
    fn test_initial_state() {
        let arbiter = create_arbiter();
        assert_eq!(arbiter.state(), S);
        assert!(arbiter.mic_desire());
        assert!(!arbiter.presence());
        assert_eq!(arbiter.session(), None);
    }

    #[test]
    fn test_presence_starts_session_then_speech_listens() {
        let mut arbiter = create_arbiter();

        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        let session = started(&commands)[0];
        assert!(commands.contains(&Command::Emit(OutboundEvent::Listening { on: true })));
        assert_eq!(arbiter.state(), S);

        arbiter.handle(recognition(session, RecognitionEvent::Started));
        assert_eq!(arbiter.state(), S);

        let commands = arbiter.handle(recognition(session, RecognitionEvent::SpeechDetected));
        assert_eq!(arbiter.state(), L);
        assert!(commands.contains(&Command::Emit(OutboundEvent::StateChanged {
            state: L,
            previous: S,
        })));
        assert_invariants(&arbiter);
    }

    #[test]
    fn test_repeated_presence_is_idempotent() {
        let mut arbiter = create_arbiter();
        arrive(&mut arbiter);

        for _ in 0..3 {
            let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
            assert!(commands.is_empty());
        }
    }

    #[test]
    fn test_no_session_without_mic_desire() {
        let mut arbiter = create_arbiter();
        arbiter.handle(ArbiterInput::MicDesireChanged(false));
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        assert!(started(&commands).is_empty());

        let commands = arbiter.handle(ArbiterInput::MicDesireChanged(true));
        assert_eq!(started(&commands).len(), 1);
    }

    #[test]
    fn test_playback_start_hard_stops_listening() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        arbiter.handle(recognition(session, RecognitionEvent::SpeechDetected));
        assert_eq!(arbiter.state(), L);

        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));
        // The stop precedes every other command
        assert_eq!(
            commands[0],
            Command::StopRecognizer {
                session,
                hard: true
            }
        );
        assert_eq!(arbiter.state(), K);
        assert_eq!(arbiter.session(), None);

        // A late result from the aborted session goes nowhere
        let commands = arbiter.handle(result(session, "echo of the bot"));
        assert!(commands.is_empty());
        assert_invariants(&arbiter);
    }

    #[test]
    fn test_pause_holds_speaking_until_ended() {
        let mut arbiter = create_arbiter();
        arrive(&mut arbiter);
        arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));

        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Paused));
        assert!(commands.is_empty());
        assert_eq!(arbiter.state(), K);
        assert!(!arbiter.playback_active());

        // Presence flapping while paused does not arm the microphone
        arbiter.handle(ArbiterInput::PresenceChanged(false));
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        assert!(started(&commands).is_empty());
        assert_eq!(arbiter.state(), K);

        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Ended));
        assert!(scheduled(&commands, TimerKind::Settle).is_some());
        assert_eq!(arbiter.state(), K);
    }

    #[test]
    fn test_settle_delays_rearm() {
        let mut arbiter = create_arbiter();
        arrive(&mut arbiter);
        arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));

        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Ended));
        assert!(started(&commands).is_empty());
        let generation = scheduled(&commands, TimerKind::Settle).unwrap();

        let commands = fire(&mut arbiter, TimerKind::Settle, generation);
        assert_eq!(started(&commands).len(), 1);
        assert_eq!(arbiter.state(), S);
        assert_invariants(&arbiter);
    }

    #[test]
    fn test_new_playback_cancels_settle() {
        let mut arbiter = create_arbiter();
        arrive(&mut arbiter);
        arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));
        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Ended));
        let generation = scheduled(&commands, TimerKind::Settle).unwrap();

        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));
        assert!(commands.contains(&Command::Cancel(TimerKind::Settle)));

        // The aborted timer firing anyway must not arm the microphone
        let commands = fire(&mut arbiter, TimerKind::Settle, generation);
        assert!(commands.is_empty());
        assert_eq!(arbiter.state(), K);
    }

    #[test]
    fn test_zero_settle_rearms_immediately() {
        let mut arbiter = TurnArbiter::new(TurnTimings {
            settle: Duration::ZERO,
            ..TurnTimings::default()
        });
        arrive(&mut arbiter);
        arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));
        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Ended));
        assert_eq!(started(&commands).len(), 1);
        assert_eq!(arbiter.state(), S);
    }

    #[test]
    fn test_ended_without_presence_goes_silent() {
        let mut arbiter = create_arbiter();
        arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));
        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Ended));
        let generation = scheduled(&commands, TimerKind::Settle).unwrap();

        let commands = fire(&mut arbiter, TimerKind::Settle, generation);
        assert!(started(&commands).is_empty());
        assert_eq!(arbiter.state(), S);
    }

    #[test]
    fn test_duplicate_results_forward_once() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);

        let first = arbiter.handle(result(session, "hello"));
        assert_eq!(voice_inputs(&first), vec!["hello".to_string()]);
        assert_eq!(stopped(&first), vec![(session, true)]);
        let cooldown = scheduled(&first, TimerKind::UtteranceCooldown).unwrap();

        let second = arbiter.handle(result(session, "hello"));
        assert!(voice_inputs(&second).is_empty());

        // Cooldown clears the lock and re-arms the microphone
        let commands = fire(&mut arbiter, TimerKind::UtteranceCooldown, cooldown);
        assert_eq!(started(&commands).len(), 1);
    }

    #[test]
    fn test_microphone_stays_off_during_cooldown() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        arbiter.handle(result(session, "hello"));

        arbiter.handle(ArbiterInput::PresenceChanged(false));
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        assert!(started(&commands).is_empty());
        assert_eq!(arbiter.session(), None);
    }

    #[test]
    fn test_blank_result_ignored() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        let commands = arbiter.handle(result(session, "   "));
        assert!(commands.is_empty());
        assert_eq!(arbiter.session(), Some(session));
    }

    #[test]
    fn test_transient_error_retries_once_then_surfaces() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);

        let commands = arbiter.handle(transient(session));
        assert_eq!(stopped(&commands), vec![(session, true)]);
        assert!(diagnostics(&commands).is_empty());
        let backoff = scheduled(&commands, TimerKind::RetryBackoff).unwrap();

        let commands = fire(&mut arbiter, TimerKind::RetryBackoff, backoff);
        let retry = started(&commands);
        assert_eq!(retry.len(), 1);

        let commands = arbiter.handle(transient(retry[0]));
        assert_eq!(diagnostics(&commands), vec!["transient".to_string()]);
        assert!(scheduled(&commands, TimerKind::RetryBackoff).is_none());
        assert!(started(&commands).is_empty());
        assert_eq!(arbiter.state(), S);
        assert_eq!(arbiter.session(), None);
    }

    #[test]
    fn test_start_failure_counts_as_retry_failure() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        let commands = arbiter.handle(transient(session));
        let backoff = scheduled(&commands, TimerKind::RetryBackoff).unwrap();
        let retry = started(&fire(&mut arbiter, TimerKind::RetryBackoff, backoff))[0];

        let commands = arbiter.handle(ArbiterInput::RecognizerFailed {
            session: retry,
            error: RecognitionError::Transient("socket closed".into()),
        });
        assert_eq!(diagnostics(&commands).len(), 1);
        assert_eq!(arbiter.state(), S);
    }

    #[test]
    fn test_playback_during_backoff_keeps_retry_available() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        let commands = arbiter.handle(transient(session));
        assert!(scheduled(&commands, TimerKind::RetryBackoff).is_some());

        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Started));
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::Cancel(TimerKind::RetryBackoff))));
        let commands = arbiter.handle(ArbiterInput::Playback(PlaybackEvent::Ended));
        let settle = scheduled(&commands, TimerKind::Settle).unwrap();
        let rearmed = started(&fire(&mut arbiter, TimerKind::Settle, settle))[0];

        let commands = arbiter.handle(transient(rearmed));
        assert!(diagnostics(&commands).is_empty());
        assert!(scheduled(&commands, TimerKind::RetryBackoff).is_some());
    }

    #[test]
    fn test_completed_retry_session_restores_budget() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        let commands = arbiter.handle(transient(session));
        let backoff = scheduled(&commands, TimerKind::RetryBackoff).unwrap();
        let retry = started(&fire(&mut arbiter, TimerKind::RetryBackoff, backoff))[0];

        arbiter.handle(recognition(retry, RecognitionEvent::Started));
        let commands = arbiter.handle(recognition(retry, RecognitionEvent::Ended));
        let next = started(&commands)[0];
        arbiter.handle(recognition(next, RecognitionEvent::Started));

        let commands = arbiter.handle(transient(next));
        assert!(diagnostics(&commands).is_empty());
        assert!(scheduled(&commands, TimerKind::RetryBackoff).is_some());
    }

    #[test]
    fn test_auth_failure_blocks_until_mic_reenabled() {
        let mut arbiter = create_arbiter();
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        let session = started(&commands)[0];

        let commands = arbiter.handle(ArbiterInput::RecognizerFailed {
            session,
            error: RecognitionError::Auth("token expired".into()),
        });
        assert_eq!(diagnostics(&commands), vec!["auth".to_string()]);

        // Presence flapping does not retry
        arbiter.handle(ArbiterInput::PresenceChanged(false));
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        assert!(started(&commands).is_empty());

        // The user turning the mic back on does
        let commands = arbiter.handle(ArbiterInput::MicDesireChanged(true));
        assert_eq!(started(&commands).len(), 1);
    }

    #[test]
    fn test_unsupported_surfaces_once() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        let unsupported = RecognitionEvent::Error {
            error: RecognitionError::Unsupported,
        };

        let commands = arbiter.handle(recognition(session, unsupported));
        assert_eq!(diagnostics(&commands), vec!["unsupported".to_string()]);

        let commands = arbiter.handle(ArbiterInput::MicDesireChanged(true));
        assert!(started(&commands).is_empty());
        arbiter.handle(ArbiterInput::PresenceChanged(false));
        let commands = arbiter.handle(ArbiterInput::PresenceChanged(true));
        assert!(started(&commands).is_empty());
        assert!(diagnostics(&commands).is_empty());
    }

    #[test]
    fn test_mic_off_stops_gracefully_and_waits_for_close() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        arbiter.handle(recognition(session, RecognitionEvent::SpeechDetected));

        let commands = arbiter.handle(ArbiterInput::MicDesireChanged(false));
        assert_eq!(stopped(&commands), vec![(session, false)]);
        assert_eq!(arbiter.state(), S);

        // Turning it back on before the close lands must not open a second session
        let commands = arbiter.handle(ArbiterInput::MicDesireChanged(true));
        assert!(started(&commands).is_empty());

        // The flushed result is still delivered
        let commands = arbiter.handle(result(session, "last words"));
        assert_eq!(voice_inputs(&commands), vec!["last words".to_string()]);
    }

    #[test]
    fn test_engine_end_restarts_session() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);

        let commands = arbiter.handle(recognition(session, RecognitionEvent::Ended));
        let restarted = started(&commands);
        assert_eq!(restarted.len(), 1);
        assert_ne!(restarted[0], session);
    }

    #[test]
    fn test_presence_loss_hard_stops() {
        let mut arbiter = create_arbiter();
        let session = arrive(&mut arbiter);
        arbiter.handle(recognition(session, RecognitionEvent::SpeechDetected));

        let commands = arbiter.handle(ArbiterInput::PresenceChanged(false));
        assert_eq!(stopped(&commands), vec![(session, true)]);
        assert_eq!(arbiter.state(), S);
    }

    /// Drives random interleavings and checks the invariants after every step
    #[test]
    fn test_invariants_hold_under_interleavings() {
        for seed in 1..=64u64 {
            let mut rng = seed;
            let mut next = move || {
                rng = rng
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (rng >> 33) as usize
            };

            let mut arbiter = create_arbiter();
            let mut live: Vec<SessionId> = Vec::new();
            let mut generations: HashMap<TimerKind, u64> = HashMap::new();

            for _ in 0..300 {
                let current = arbiter.session();
                let input = match next() % 12 {
                    0 => ArbiterInput::PresenceChanged(next() % 2 == 0),
                    1 => ArbiterInput::MicDesireChanged(next() % 4 != 0),
                    2 => ArbiterInput::Playback(PlaybackEvent::Started),
                    3 => ArbiterInput::Playback(PlaybackEvent::Paused),
                    4 => ArbiterInput::Playback(PlaybackEvent::Ended),
                    5 => match current {
                        Some(s) => recognition(s, RecognitionEvent::SpeechDetected),
                        None => continue,
                    },
                    6 => match current {
                        Some(s) => result(s, "hello"),
                        None => continue,
                    },
                    7 => match live.first().copied() {
                        Some(s) => recognition(s, RecognitionEvent::Ended),
                        None => continue,
                    },
                    8 => match current {
                        Some(s) => transient(s),
                        None => continue,
                    },
                    _ => {
                        let kind = match next() % 3 {
                            0 => TimerKind::Settle,
                            1 => TimerKind::UtteranceCooldown,
                            _ => TimerKind::RetryBackoff,
                        };
                        match generations.get(&kind) {
                            Some(g) => ArbiterInput::TimerFired {
                                timer: kind,
                                generation: *g,
                            },
                            None => continue,
                        }
                    }
                };

                if let ArbiterInput::Recognition {
                    session,
                    event: RecognitionEvent::Ended,
                } = &input
                {
                    live.retain(|s| s != session);
                }

                for command in arbiter.handle(input) {
                    match command {
                        Command::StartRecognizer(id) => {
                            assert!(live.is_empty(), "second session opened: {live:?}");
                            live.push(id);
                        }
                        Command::StopRecognizer { session, hard: true } => {
                            live.retain(|s| *s != session);
                        }
                        Command::Schedule { timer, generation, .. } => {
                            generations.insert(timer, generation);
                        }
                        _ => {}
                    }
                }

                assert!(live.len() <= 1);
                assert_eq!(arbiter.session(), live.first().copied());
                assert_invariants(&arbiter);
            }
        }
    }
}
