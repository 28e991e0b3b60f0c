//! # Playback Module
//!
//! The per-chat state machine that turns commands and transport events into
//! calls on the resolver, the playlist and the session controller.
//!
//! ## Concurrency
//!
//! - Each chat owns one `tokio::sync::Mutex` guarding its playback state and
//!   playlist together
//! - The lock is released around resolution and join/change-stream calls; on
//!   re-acquire the chat's generation counter tells whether the world moved on
//! - Transport events are routed to a per-chat worker and handled in order
//! - Different chats never share a lock
//!
//! ## Notices
//!
//! System-initiated transitions (auto-advance, failure cap) are broadcast as
//! [`PlaybackNotice`] values; replies to commands come back as return values.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{Orchestrator, OrchestratorSettings, PlayOutcome, SkipOutcome, StopOutcome};
pub use state::{ChatPlaybackState, PlaybackStatus, QueueSnapshot};

use crate::{sources::Track, ChatId};

/// Aviso para el chat sobre transiciones que nadie pidió explícitamente
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    NowPlaying {
        chat_id: ChatId,
        track: Track,
    },
    TrackFailed {
        chat_id: ChatId,
        title: String,
        error: String,
    },
    QueueFinished {
        chat_id: ChatId,
    },
    PersistentFailure {
        chat_id: ChatId,
        attempts: u32,
        last_error: String,
    },
}

impl PlaybackNotice {
    pub fn chat_id(&self) -> ChatId {
        match self {
            PlaybackNotice::NowPlaying { chat_id, .. }
            | PlaybackNotice::TrackFailed { chat_id, .. }
            | PlaybackNotice::QueueFinished { chat_id }
            | PlaybackNotice::PersistentFailure { chat_id, .. } => *chat_id,
        }
    }
}
