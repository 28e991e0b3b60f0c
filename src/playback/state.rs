use std::fmt;

use crate::{audio::SessionHandle, sources::Track, ChatId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackStatus {
    Idle,
    Resolving,
    Joining,
    Playing,
    Paused,
    LeavingQueueEmpty,
}

impl PlaybackStatus {
    /// Estados en los que hay un track `current`
    pub fn has_current(&self) -> bool {
        matches!(
            self,
            PlaybackStatus::Joining | PlaybackStatus::Playing | PlaybackStatus::Paused
        )
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlaybackStatus::Idle => "inactivo",
            PlaybackStatus::Resolving => "buscando",
            PlaybackStatus::Joining => "conectando",
            PlaybackStatus::Playing => "reproduciendo",
            PlaybackStatus::Paused => "pausado",
            PlaybackStatus::LeavingQueueEmpty => "saliendo",
        };
        f.write_str(label)
    }
}

/// Estado de reproducción de un chat
///
/// Solo lo modifica el orquestador y siempre bajo el lock del chat, junto con
/// su playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPlaybackState {
    pub chat_id: ChatId,
    pub status: PlaybackStatus,
    pub current: Option<Track>,
    pub failure_streak: u32,
    pub session: Option<SessionHandle>,
    /// Se incrementa en cada join/change_stream/leave/stop
    pub generation: u64,
}

impl ChatPlaybackState {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            status: PlaybackStatus::Idle,
            current: None,
            failure_streak: 0,
            session: None,
            generation: 0,
        }
    }

    /// `current` existe sii el estado lo admite, e Idle nunca tiene sesión
    pub fn is_consistent(&self) -> bool {
        let current_ok = self.current.is_some() == self.status.has_current();
        let idle_ok = self.status != PlaybackStatus::Idle
            || (self.current.is_none() && self.session.is_none());
        current_ok && idle_ok
    }
}

/// Vista de solo lectura para mostrar la cola
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub status: PlaybackStatus,
    pub current: Option<Track>,
    pub upcoming: Vec<Track>,
}

impl QueueSnapshot {
    pub fn idle() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            current: None,
            upcoming: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.upcoming.is_empty()
    }

    /// Duración conocida de lo que queda por sonar
    pub fn total_duration_ms(&self) -> u64 {
        self.current
            .iter()
            .chain(self.upcoming.iter())
            .map(Track::duration_ms)
            .sum()
    }
}
