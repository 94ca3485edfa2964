//! Maps conversation state to the avatar clip the client should show
//!
//! One-way: the projector only reads state, it never gates the microphone.

use crate::config::AvatarAssets;
use crate::state::ConversationState;

#[derive(Debug, Clone)]
pub struct AvatarProjector {
    assets: AvatarAssets,
}

impl AvatarProjector {
    pub fn new(assets: AvatarAssets) -> Self {
        Self { assets }
    }

    /// Asset reference for `state`
    ///
    /// A missing listening clip falls back to the silent one; anything
    /// else missing falls back to the still image.
    pub fn project(&self, state: ConversationState) -> &str {
        let clip = match state {
            ConversationState::Silent => self.assets.silent.as_deref(),
            ConversationState::Listening => self
                .assets
                .listening
                .as_deref()
                .or(self.assets.silent.as_deref()),
            ConversationState::Speaking => self.assets.speaking.as_deref(),
        };
        clip.unwrap_or(&self.assets.fallback)
    }
}
