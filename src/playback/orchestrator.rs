use dashmap::DashMap;
use futures::future::join_all;
use std::sync::{Arc, Weak};
use tokio::{
    sync::{broadcast, Mutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    state::{ChatPlaybackState, PlaybackStatus, QueueSnapshot},
    PlaybackNotice,
};
use crate::{
    audio::{
        ArtifactStore, EndReason, EventStream, Playlist, SessionController, SessionEvent,
        SessionEventKind,
    },
    error::{PlaybackError, ResolutionError, SessionError},
    sources::{Track, TrackResolver},
    ChatId, RequesterId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub max_queue_size: usize,
    /// Fallos consecutivos tolerados antes de abandonar el chat
    pub failure_streak_cap: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            failure_streak_cap: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayOutcome {
    Started(Track),
    /// `position` es 1 para el siguiente en sonar
    Queued { track: Track, position: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipOutcome {
    Next(Track),
    QueueEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyIdle,
}

/// Estado y playlist de un chat, siempre bajo el mismo lock
struct ChatSlot {
    state: ChatPlaybackState,
    playlist: Playlist,
    /// Resoluciones en curso para este chat
    resolving: usize,
    cancel: CancellationToken,
}

impl ChatSlot {
    fn new(chat_id: ChatId, max_queue_size: usize) -> Self {
        Self {
            state: ChatPlaybackState::new(chat_id),
            playlist: Playlist::new(max_queue_size),
            resolving: 0,
            cancel: CancellationToken::new(),
        }
    }

    fn settle_resolving(&mut self) {
        if self.resolving == 0 && self.state.status == PlaybackStatus::Resolving {
            self.state.status = PlaybackStatus::Idle;
        }
    }
}

struct ChatHandle {
    chat_id: ChatId,
    slot: Mutex<ChatSlot>,
    events: flume::Sender<SessionEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Command,
    Transport,
}

enum Advance {
    Started(Track),
    Drained { last_error: Option<SessionError> },
    Abandoned { attempts: u32, last_error: String },
    /// Otra operación cambió la generación mientras esperábamos
    Superseded,
}

struct Inner {
    chats: DashMap<ChatId, Arc<ChatHandle>>,
    resolver: Arc<TrackResolver>,
    controller: Arc<dyn SessionController>,
    artifacts: Arc<ArtifactStore>,
    settings: OrchestratorSettings,
    notices: broadcast::Sender<PlaybackNotice>,
}

/// Orquestador de reproducción: una máquina de estados por chat
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        resolver: Arc<TrackResolver>,
        controller: Arc<dyn SessionController>,
        artifacts: Arc<ArtifactStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (notices, _) = broadcast::channel(64);
        info!(
            "🎛️ Orquestador listo (cola máx {}, tope de fallos {})",
            settings.max_queue_size, settings.failure_streak_cap
        );

        Self {
            inner: Arc::new(Inner {
                chats: DashMap::new(),
                resolver,
                controller,
                artifacts,
                settings,
                notices,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackNotice> {
        self.inner.notices.subscribe()
    }

    pub fn active_chats(&self) -> usize {
        self.inner.chats.len()
    }

    /// Resuelve la consulta y la reproduce o la agrega a la cola
    pub async fn play(
        &self,
        chat: ChatId,
        requester: RequesterId,
        query: &str,
    ) -> Result<PlayOutcome, PlaybackError> {
        let handle = self.chat_handle(chat);
        let cancel = {
            let mut slot = handle.slot.lock().await;
            slot.resolving += 1;
            if slot.state.status == PlaybackStatus::Idle {
                slot.state.status = PlaybackStatus::Resolving;
            }
            slot.cancel.clone()
        };

        info!("🔍 Resolviendo '{}' para chat {}", query, chat);
        let resolved = self.inner.resolver.resolve(query, requester, &cancel).await;

        let mut slot = handle.slot.lock().await;
        slot.resolving = slot.resolving.saturating_sub(1);
        let track = match resolved {
            Ok(track) if !cancel.is_cancelled() => track,
            Ok(track) => {
                // stop llegó justo después de resolver
                slot.settle_resolving();
                drop(slot);
                self.retire(Some(track)).await;
                return Err(ResolutionError::Cancelled.into());
            }
            Err(e) => {
                slot.settle_resolving();
                warn!("❌ No se pudo resolver '{}' en chat {}: {}", query, chat, e);
                return Err(e.into());
            }
        };

        let idle = matches!(
            slot.state.status,
            PlaybackStatus::Idle | PlaybackStatus::Resolving
        ) && slot.state.current.is_none()
            && slot.playlist.is_empty();

        if !idle {
            return match slot.playlist.enqueue(track.clone()) {
                Ok(position) => Ok(PlayOutcome::Queued { track, position }),
                Err(full) => {
                    drop(slot);
                    self.retire(Some(track)).await;
                    Err(full.into())
                }
            };
        }

        match self.advance(&handle, slot, Some(track), Origin::Command).await {
            Advance::Started(track) => Ok(PlayOutcome::Started(track)),
            Advance::Drained { last_error } => Err(last_error
                .map(PlaybackError::from)
                .unwrap_or(PlaybackError::NotPlaying)),
            Advance::Abandoned {
                attempts,
                last_error,
            } => Err(PlaybackError::PersistentFailure {
                attempts,
                last_error,
            }),
            Advance::Superseded => Err(ResolutionError::Cancelled.into()),
        }
    }

    /// Pasa al siguiente de la cola; con la cola vacía sale de la llamada
    pub async fn skip(&self, chat: ChatId) -> Result<SkipOutcome, PlaybackError> {
        let handle = self.existing(chat).ok_or(PlaybackError::NotPlaying)?;
        let slot = handle.slot.lock().await;

        match &slot.state.current {
            Some(current) => info!("⏭️ Saltando '{}' en chat {}", current.title(), chat),
            None => return Err(PlaybackError::NotPlaying),
        }

        match self.advance(&handle, slot, None, Origin::Command).await {
            Advance::Started(track) => Ok(SkipOutcome::Next(track)),
            Advance::Drained { .. } => Ok(SkipOutcome::QueueEmpty),
            Advance::Abandoned {
                attempts,
                last_error,
            } => Err(PlaybackError::PersistentFailure {
                attempts,
                last_error,
            }),
            Advance::Superseded => Err(PlaybackError::NotPlaying),
        }
    }

    /// Cancela resoluciones, vacía la cola y sale. Nunca falla.
    pub async fn stop(&self, chat: ChatId) -> StopOutcome {
        let Some(handle) = self.existing(chat) else {
            return StopOutcome::AlreadyIdle;
        };
        let mut slot = handle.slot.lock().await;

        slot.cancel.cancel();
        slot.cancel = CancellationToken::new();

        let was_active = slot.state.status != PlaybackStatus::Idle
            || slot.state.current.is_some()
            || !slot.playlist.is_empty()
            || slot.resolving > 0;

        let discarded = slot.playlist.clear();
        let previous = slot.state.current.take();
        slot.state.generation += 1;
        slot.state.status = PlaybackStatus::Idle;
        slot.state.session = None;
        slot.state.failure_streak = 0;

        self.inner.controller.leave(chat).await;
        drop(slot);

        self.retire(previous).await;
        self.inner.artifacts.release_all(&discarded).await;

        if was_active {
            info!("⏹️ Reproducción detenida en chat {}", chat);
            StopOutcome::Stopped
        } else {
            StopOutcome::AlreadyIdle
        }
    }

    pub async fn pause(&self, chat: ChatId) -> Result<(), PlaybackError> {
        let handle = self.existing(chat).ok_or(PlaybackError::NotPlaying)?;
        let mut slot = handle.slot.lock().await;

        match slot.state.status {
            PlaybackStatus::Paused => Ok(()),
            PlaybackStatus::Playing => {
                self.inner.controller.pause(chat).await?;
                slot.state.status = PlaybackStatus::Paused;
                info!("⏸️ Pausado en chat {}", chat);
                Ok(())
            }
            _ => Err(PlaybackError::NotPlaying),
        }
    }

    pub async fn resume(&self, chat: ChatId) -> Result<(), PlaybackError> {
        let handle = self.existing(chat).ok_or(PlaybackError::NotPlaying)?;
        let mut slot = handle.slot.lock().await;

        match slot.state.status {
            PlaybackStatus::Playing => Ok(()),
            PlaybackStatus::Paused => {
                self.inner.controller.resume(chat).await?;
                slot.state.status = PlaybackStatus::Playing;
                info!("▶️ Reanudado en chat {}", chat);
                Ok(())
            }
            _ => Err(PlaybackError::NotPlaying),
        }
    }

    pub async fn get_queue(&self, chat: ChatId) -> QueueSnapshot {
        let Some(handle) = self.existing(chat) else {
            return QueueSnapshot::idle();
        };
        let slot = handle.slot.lock().await;

        QueueSnapshot {
            status: slot.state.status,
            current: slot.state.current.clone(),
            upcoming: slot.playlist.snapshot(),
        }
    }

    pub async fn now_playing(&self, chat: ChatId) -> Option<Track> {
        let handle = self.existing(chat)?;
        let slot = handle.slot.lock().await;
        slot.state.current.clone()
    }

    pub async fn state(&self, chat: ChatId) -> Option<ChatPlaybackState> {
        let handle = self.existing(chat)?;
        let slot = handle.slot.lock().await;
        Some(slot.state.clone())
    }

    /// Procesa un evento del transporte para su chat
    pub async fn handle_event(&self, event: SessionEvent) {
        let chat = event.chat_id;
        let Some(handle) = self.existing(chat) else {
            debug!("📡 Evento para chat sin estado {}, ignorado", chat);
            return;
        };
        let mut slot = handle.slot.lock().await;

        if event.generation != slot.state.generation {
            debug!(
                "🗑️ Evento obsoleto en chat {} (gen {} != {}): {:?}",
                chat, event.generation, slot.state.generation, event.kind
            );
            return;
        }

        let failure = match event.kind {
            SessionEventKind::StreamStarted { title } => {
                if slot.state.status == PlaybackStatus::Joining {
                    slot.state.status = PlaybackStatus::Playing;
                    slot.state.failure_streak = 0;
                    info!("▶️ Sonando '{}' en chat {}", title, chat);
                }
                return;
            }
            SessionEventKind::StreamEnded {
                title,
                reason: EndReason::Completed,
            } => {
                debug!("🏁 Terminó '{}' en chat {}", title, chat);
                None
            }
            SessionEventKind::StreamEnded {
                title,
                reason: EndReason::TransportError(e),
            } => Some((title, e, false)),
            SessionEventKind::SessionLost { reason } => {
                let title = slot
                    .state
                    .current
                    .as_ref()
                    .map(|t| t.title().to_string())
                    .unwrap_or_default();
                Some((title, SessionError::TransportLost(reason).to_string(), true))
            }
        };

        if !slot.state.status.has_current() {
            return;
        }

        if let Some((title, reason, lost)) = failure {
            slot.state.failure_streak += 1;
            if lost {
                slot.state.session = None;
            }
            warn!(
                "⚠️ Falló '{}' en chat {} ({}/{}): {}",
                title, chat, slot.state.failure_streak, self.inner.settings.failure_streak_cap, reason
            );
            self.notify(PlaybackNotice::TrackFailed {
                chat_id: chat,
                title,
                error: reason.clone(),
            });

            if slot.state.failure_streak >= self.inner.settings.failure_streak_cap {
                self.abandon(chat, slot, reason).await;
                return;
            }
        }

        match self.advance(&handle, slot, None, Origin::Transport).await {
            Advance::Started(track) => debug!("➡️ Auto-avance a '{}' en chat {}", track.title(), chat),
            Advance::Drained { .. } => debug!("📭 Chat {} terminó su cola", chat),
            Advance::Abandoned { .. } | Advance::Superseded => {}
        }
    }

    /// Envía el evento al worker del chat, que los procesa en orden
    pub fn dispatch(&self, event: SessionEvent) {
        match self.existing(event.chat_id) {
            Some(handle) => {
                if handle.events.send(event).is_err() {
                    warn!("⚠️ Worker del chat cerrado");
                }
            }
            None => debug!("📡 Evento para chat desconocido {}", event.chat_id),
        }
    }

    /// Lleva los eventos del controlador a los workers de cada chat
    pub fn spawn_event_router(&self, stream: EventStream) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Ok(event) = stream.recv_async().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Orchestrator { inner }.dispatch(event);
            }
            debug!("📡 Router de eventos terminado");
        })
    }

    /// Detiene todos los chats (salida ordenada)
    pub async fn shutdown(&self) {
        let chats: Vec<ChatId> = self.inner.chats.iter().map(|entry| *entry.key()).collect();
        info!("🛑 Deteniendo {} chats", chats.len());
        join_all(chats.into_iter().map(|chat| self.stop(chat))).await;
    }

    fn existing(&self, chat: ChatId) -> Option<Arc<ChatHandle>> {
        self.inner.chats.get(&chat).map(|entry| entry.value().clone())
    }

    fn chat_handle(&self, chat: ChatId) -> Arc<ChatHandle> {
        self.inner
            .chats
            .entry(chat)
            .or_insert_with(|| {
                let (events, rx) = flume::unbounded();
                tokio::spawn(run_worker(Arc::downgrade(&self.inner), rx));
                debug!("🆕 Estado creado para chat {}", chat);

                Arc::new(ChatHandle {
                    chat_id: chat,
                    slot: Mutex::new(ChatSlot::new(chat, self.inner.settings.max_queue_size)),
                    events,
                })
            })
            .value()
            .clone()
    }

    /// Bucle acotado: intenta el siguiente track hasta que uno arranque, la cola
    /// se vacíe o se alcance el tope de fallos
    async fn advance<'a>(
        &self,
        handle: &'a ChatHandle,
        mut slot: MutexGuard<'a, ChatSlot>,
        mut next: Option<Track>,
        origin: Origin,
    ) -> Advance {
        let chat = handle.chat_id;
        let cap = self.inner.settings.failure_streak_cap;
        let mut last_error = None;

        loop {
            let track = match next.take().or_else(|| slot.playlist.dequeue_front()) {
                Some(track) => track,
                None => {
                    let previous = slot.state.current.take();
                    slot.state.generation += 1;
                    let generation = slot.state.generation;
                    slot.state.status = PlaybackStatus::LeavingQueueEmpty;
                    slot.state.session = None;
                    drop(slot);

                    self.retire(previous).await;
                    info!("📭 Cola vacía en chat {}, saliendo de la llamada", chat);
                    self.inner.controller.leave(chat).await;

                    slot = handle.slot.lock().await;
                    if slot.state.generation != generation {
                        return Advance::Superseded;
                    }
                    if !slot.playlist.is_empty() {
                        debug!("➕ Llegaron canciones mientras salíamos de chat {}", chat);
                        continue;
                    }

                    slot.state.status = if slot.resolving > 0 {
                        PlaybackStatus::Resolving
                    } else {
                        PlaybackStatus::Idle
                    };
                    slot.state.failure_streak = 0;
                    if origin == Origin::Transport {
                        self.notify(PlaybackNotice::QueueFinished { chat_id: chat });
                    }
                    return Advance::Drained { last_error };
                }
            };

            let previous = slot.state.current.replace(track.clone());
            slot.state.generation += 1;
            let generation = slot.state.generation;
            slot.state.status = PlaybackStatus::Joining;
            let has_session = slot.state.session.is_some();
            drop(slot);

            self.retire(previous).await;
            info!(
                "🎵 Iniciando '{}' en chat {} (gen {})",
                track.title(),
                chat,
                generation
            );

            let result = if has_session {
                self.inner
                    .controller
                    .change_stream(chat, &track, generation)
                    .await
                    .map(|()| None)
            } else {
                self.inner
                    .controller
                    .join(chat, &track, generation)
                    .await
                    .map(Some)
            };

            slot = handle.slot.lock().await;
            if slot.state.generation != generation {
                debug!(
                    "🗑️ Resultado obsoleto para '{}' en chat {}",
                    track.title(),
                    chat
                );
                if result.is_ok() && !slot.state.status.has_current() {
                    // Nadie quiere ya esta sesión, ni siquiera una salida en curso
                    self.inner.controller.leave(chat).await;
                }
                return Advance::Superseded;
            }

            match result {
                Ok(session) => {
                    if session.is_some() {
                        slot.state.session = session;
                    }
                    if origin == Origin::Transport {
                        self.notify(PlaybackNotice::NowPlaying {
                            chat_id: chat,
                            track: track.clone(),
                        });
                    }
                    return Advance::Started(track);
                }
                Err(e) => {
                    slot.state.failure_streak += 1;
                    slot.state.current = None;
                    if !has_session || e == SessionError::NotPlaying {
                        slot.state.session = None;
                    }
                    warn!(
                        "❌ No se pudo reproducir '{}' en chat {} ({}/{}): {}",
                        track.title(),
                        chat,
                        slot.state.failure_streak,
                        cap,
                        e
                    );
                    self.retire(Some(track.clone())).await;

                    if origin == Origin::Transport {
                        self.notify(PlaybackNotice::TrackFailed {
                            chat_id: chat,
                            title: track.title().to_string(),
                            error: e.to_string(),
                        });
                    }

                    if slot.state.failure_streak >= cap {
                        return self.abandon(chat, slot, e.to_string()).await;
                    }
                    last_error = Some(e);
                }
            }
        }
    }

    /// Tope de fallos alcanzado: vaciar todo y quedar inactivo
    async fn abandon(
        &self,
        chat: ChatId,
        mut slot: MutexGuard<'_, ChatSlot>,
        last_error: String,
    ) -> Advance {
        let attempts = slot.state.failure_streak;
        let discarded = slot.playlist.clear();
        let previous = slot.state.current.take();
        slot.state.generation += 1;
        slot.state.status = PlaybackStatus::Idle;
        slot.state.session = None;
        slot.state.failure_streak = 0;

        self.inner.controller.leave(chat).await;
        drop(slot);

        self.retire(previous).await;
        self.inner.artifacts.release_all(&discarded).await;

        error!(
            "🚫 Chat {} abandonado tras {} fallos consecutivos: {}",
            chat, attempts, last_error
        );
        self.notify(PlaybackNotice::PersistentFailure {
            chat_id: chat,
            attempts,
            last_error: last_error.clone(),
        });

        Advance::Abandoned {
            attempts,
            last_error,
        }
    }

    /// Libera el archivo temporal de un track que ya no es `current`
    async fn retire(&self, track: Option<Track>) {
        if let Some(track) = track {
            if self.inner.artifacts.release(&track).await {
                debug!("🗑️ Artefacto liberado de '{}'", track.title());
            }
        }
    }

    fn notify(&self, notice: PlaybackNotice) {
        // Sin suscriptores no es un error
        let _ = self.inner.notices.send(notice);
    }
}

async fn run_worker(inner: Weak<Inner>, events: flume::Receiver<SessionEvent>) {
    while let Ok(event) = events.recv_async().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Orchestrator { inner }.handle_event(event).await;
    }
}
