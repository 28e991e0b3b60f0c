//! # Voicechat Music
//!
//! Playback core for a group voice-chat music bot: a user's "play X" request
//! becomes continuous audio in the chat's voice call.
//!
//! - [`sources`]: track resolution through an ordered cascade of strategies
//! - [`audio`]: per-chat playlists, voice sessions and temporary audio artifacts
//! - [`playback`]: the per-chat state machine tying everything together
//! - [`bot`]: thin text-command gateway over the orchestrator

use std::fmt;

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod playback;
pub mod sources;

/// Identificador de un chat (grupo con llamada de voz)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Usuario que pidió un track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequesterId(pub u64);

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
