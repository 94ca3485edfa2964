//! Speech engine driven remotely by the browser client
//!
//! The client owns the actual recognizer. Session control goes out as
//! `recognizer` notifications; lifecycle events come back over IPC.

use tokio::sync::broadcast;
use tracing::debug;

use crate::config::RecognitionSettings;
use crate::events::{OutboundEvent, RecognizerAction};

use super::engine::{RecognitionError, SessionId, SpeechEngine};

pub struct RemoteEngine {
    event_tx: broadcast::Sender<OutboundEvent>,
    settings: RecognitionSettings,
}

impl RemoteEngine {
    pub fn new(event_tx: broadcast::Sender<OutboundEvent>, settings: RecognitionSettings) -> Self {
        Self { event_tx, settings }
    }

    /// Credential handed to the client for the vendor SDK
    fn acquire_token(&self) -> Result<Option<String>, RecognitionError> {
        match (&self.settings.credential, self.settings.require_credential) {
            (Some(token), _) => Ok(Some(token.clone())),
            (None, true) => Err(RecognitionError::Auth(
                "no speech credential configured".to_string(),
            )),
            (None, false) => Ok(None),
        }
    }

    fn send(&self, session: SessionId, action: RecognizerAction) {
        let event = OutboundEvent::Recognizer { session, action };
        debug!(%event, "sending recognizer control");
        let _ = self.event_tx.send(event);
    }
}

impl SpeechEngine for RemoteEngine {
    fn open(&mut self, session: SessionId) -> Result<(), RecognitionError> {
        let token = self.acquire_token()?;
        self.send(
            session,
            RecognizerAction::Start {
                language: self.settings.language.clone(),
                initial_silence_ms: self.settings.initial_silence.as_millis() as u64,
                end_silence_ms: self.settings.end_silence.as_millis() as u64,
                token,
            },
        );
        Ok(())
    }

    fn stop(&mut self, session: SessionId) {
        self.send(session, RecognizerAction::Stop);
    }

    fn abort(&mut self, session: SessionId) {
        self.send(session, RecognizerAction::Abort);
    }
}
