//! Configuration loading and management
//!
//! Defaults come from the deployed kiosk; every value can be overridden
//! through a `VOICE_AVATAR_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Turn-taking timers
    pub timings: TurnTimings,

    /// Settings forwarded to the client-side recognizer
    pub recognition: RecognitionSettings,

    /// Presence debouncing and greetings
    pub presence: PresenceSettings,

    /// Avatar clip per conversation state
    pub avatar: AvatarAssets,
}

/// Timers owned by the turn arbiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnTimings {
    /// How long the anti-duplicate utterance lock is held
    pub utterance_cooldown: Duration,
    /// Delay after playback ends before the microphone re-arms
    pub settle: Duration,
    /// Backoff before the single retry of a transient recognition failure
    pub retry_backoff: Duration,
}

impl Default for TurnTimings {
    fn default() -> Self {
        Self {
            utterance_cooldown: Duration::from_millis(600),
            settle: Duration::from_millis(1500),
            retry_backoff: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionSettings {
    pub language: String,
    pub initial_silence: Duration,
    pub end_silence: Duration,
    pub credential: Option<String>,
    pub require_credential: bool,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            language: "ar-SA".to_string(),
            initial_silence: Duration::from_secs(5),
            end_silence: Duration::from_millis(800),
            credential: None,
            require_credential: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSettings {
    /// Face must stay in view this long before presence turns on
    pub greet_delay: Duration,
    /// Face must stay out of view this long before presence turns off
    pub farewell_delay: Duration,
    pub greeting: Option<String>,
    pub farewell: Option<String>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            greet_delay: Duration::from_secs(2),
            farewell_delay: Duration::from_secs(5),
            greeting: None,
            farewell: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarAssets {
    pub silent: Option<String>,
    pub listening: Option<String>,
    pub speaking: Option<String>,
    pub fallback: String,
}

impl Default for AvatarAssets {
    fn default() -> Self {
        Self {
            silent: Some("assets/avatar_silent.mp4".to_string()),
            listening: None,
            speaking: Some("assets/avatar_speaking.mp4".to_string()),
            fallback: "assets/avatar.png".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("voice-avatar");

        let socket_path = lookup("VOICE_AVATAR_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let defaults = TurnTimings::default();
        let timings = TurnTimings {
            utterance_cooldown: millis(&lookup, "VOICE_AVATAR_UTTERANCE_COOLDOWN_MS", defaults.utterance_cooldown)?,
            settle: millis(&lookup, "VOICE_AVATAR_SETTLE_MS", defaults.settle)?,
            retry_backoff: millis(&lookup, "VOICE_AVATAR_RETRY_BACKOFF_MS", defaults.retry_backoff)?,
        };

        let defaults = RecognitionSettings::default();
        let recognition = RecognitionSettings {
            language: lookup("VOICE_AVATAR_LANGUAGE").unwrap_or(defaults.language),
            initial_silence: millis(&lookup, "VOICE_AVATAR_INITIAL_SILENCE_MS", defaults.initial_silence)?,
            end_silence: millis(&lookup, "VOICE_AVATAR_END_SILENCE_MS", defaults.end_silence)?,
            credential: non_empty(lookup("VOICE_AVATAR_SPEECH_KEY")),
            require_credential: flag(&lookup, "VOICE_AVATAR_REQUIRE_SPEECH_KEY", defaults.require_credential)?,
        };

        let defaults = PresenceSettings::default();
        let presence = PresenceSettings {
            greet_delay: millis(&lookup, "VOICE_AVATAR_GREET_DELAY_MS", defaults.greet_delay)?,
            farewell_delay: millis(&lookup, "VOICE_AVATAR_FAREWELL_DELAY_MS", defaults.farewell_delay)?,
            greeting: non_empty(lookup("VOICE_AVATAR_GREETING")),
            farewell: non_empty(lookup("VOICE_AVATAR_FAREWELL")),
        };

        let defaults = AvatarAssets::default();
        let avatar = AvatarAssets {
            silent: lookup("VOICE_AVATAR_ASSET_SILENT").map_or(defaults.silent, non_empty_str),
            listening: lookup("VOICE_AVATAR_ASSET_LISTENING").map_or(defaults.listening, non_empty_str),
            speaking: lookup("VOICE_AVATAR_ASSET_SPEAKING").map_or(defaults.speaking, non_empty_str),
            fallback: lookup("VOICE_AVATAR_ASSET_FALLBACK").unwrap_or(defaults.fallback),
        };

        Ok(Self {
            socket_path,
            data_dir,
            timings,
            recognition,
            presence,
            avatar,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        Ok(())
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a whole number of milliseconds, got {raw:?}"))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(default),
    }
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => anyhow::bail!("{key} must be true or false, got {other:?}"),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(non_empty_str)
}

fn non_empty_str(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
