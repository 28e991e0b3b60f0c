use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    events::{CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent},
    input::{File as FileInput, HttpRequest, Input},
    tracks::{PlayMode, TrackHandle},
    Call, Songbird,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::session::{
    EndReason, EventSink, SessionController, SessionEvent, SessionEventKind, SessionHandle,
    SessionState,
};
use crate::{
    error::SessionError,
    sources::{SourceHandle, Track},
    ChatId,
};

/// Canal de voz al que pertenece un chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTarget {
    pub guild: GuildId,
    pub channel: ChannelId,
}

/// Qué hace `join` según el estado del chat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinPlan {
    /// Ya hay sesión: basta con cambiar el stream
    Reuse(SessionHandle),
    Connect(VoiceTarget),
}

fn plan_join(
    existing: Option<SessionHandle>,
    target: Option<VoiceTarget>,
) -> Result<JoinPlan, SessionError> {
    match (existing, target) {
        (Some(handle), _) => Ok(JoinPlan::Reuse(handle)),
        (None, Some(target)) => Ok(JoinPlan::Connect(target)),
        (None, None) => Err(SessionError::Join("no hay llamada activa en el chat".into())),
    }
}

struct ActiveSession {
    handle: SessionHandle,
    call: Arc<Mutex<Call>>,
    target: VoiceTarget,
    current: Option<(Track, TrackHandle)>,
    generation: u64,
    paused: bool,
    reconnected: bool,
}

struct Inner {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    sink: EventSink,
    volume: f32,
    targets: DashMap<ChatId, VoiceTarget>,
    sessions: DashMap<ChatId, ActiveSession>,
    joining: DashMap<ChatId, u64>,
    next_handle: AtomicU64,
}

/// Controlador de sesiones sobre songbird
///
/// El gateway asocia cada chat a un canal de voz con [`bind`](Self::bind);
/// sin esa asociación `join` falla con `SessionError::Join`.
#[derive(Clone)]
pub struct SongbirdSessions {
    inner: Arc<Inner>,
}

impl SongbirdSessions {
    pub fn new(manager: Arc<Songbird>, sink: EventSink, volume: f32) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                http: reqwest::Client::new(),
                sink,
                volume: volume.clamp(0.0, 2.0),
                targets: DashMap::new(),
                sessions: DashMap::new(),
                joining: DashMap::new(),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Asocia el chat al canal de voz donde está quien pidió música
    pub fn bind(&self, chat: ChatId, guild: GuildId, channel: ChannelId) {
        let target = VoiceTarget { guild, channel };
        if self.inner.targets.insert(chat, target) != Some(target) {
            debug!("🎯 Chat {} asociado al canal {} en guild {}", chat, channel, guild);
        }
    }

    pub fn target(&self, chat: ChatId) -> Option<VoiceTarget> {
        self.inner.targets.get(&chat).map(|t| *t)
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    fn input_for(&self, track: &Track) -> Input {
        match track.source() {
            SourceHandle::Remote(url) => HttpRequest::new(self.inner.http.clone(), url.clone()).into(),
            SourceHandle::LocalFile(path) => FileInput::new(path.clone()).into(),
        }
    }

    /// Reemplaza lo que suena en la llamada y espera a que el input esté listo
    async fn start_track(
        &self,
        chat: ChatId,
        call: Arc<Mutex<Call>>,
        track: &Track,
        generation: u64,
    ) -> Result<TrackHandle, SessionError> {
        let input = self.input_for(track);
        let handle = {
            let mut call_lock = call.lock().await;
            call_lock.play_only_input(input)
        };

        for (event, kind) in [
            (TrackEvent::End, NotifyKind::Ended),
            (TrackEvent::Error, NotifyKind::Errored),
        ] {
            let notifier = TrackNotifier {
                chat,
                generation,
                title: track.title().to_string(),
                kind,
                sink: self.inner.sink.clone(),
            };
            handle
                .add_event(Event::Track(event), notifier)
                .map_err(|e| SessionError::Stream(format!("Error al agregar event handler: {:?}", e)))?;
        }

        if let Err(e) = handle.make_playable_async().await {
            let _ = handle.stop();
            return Err(SessionError::Stream(format!("{:?}", e)));
        }

        let _ = handle.set_volume(self.inner.volume);
        let _ = handle.play();

        info!("🎵 Reproduciendo: {} en chat {}", track.title(), chat);
        self.inner.sink.emit(SessionEvent {
            chat_id: chat,
            generation,
            kind: SessionEventKind::StreamStarted {
                title: track.title().to_string(),
            },
        });

        Ok(handle)
    }

    async fn connect(
        &self,
        chat: ChatId,
        target: VoiceTarget,
        track: &Track,
        generation: u64,
    ) -> Result<SessionHandle, SessionError> {
        info!(
            "🔗 Conectando al canal {} en guild {}",
            target.channel, target.guild
        );

        let call = self
            .inner
            .manager
            .join(target.guild, target.channel)
            .await
            .map_err(|e| SessionError::Join(format!("Error al unirse al canal: {:?}", e)))?;

        {
            let mut call_lock = call.lock().await;
            call_lock.remove_all_global_events();
            call_lock.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectHandler {
                    chat,
                    inner: Arc::downgrade(&self.inner),
                },
            );
        }

        let track_handle = match self.start_track(chat, call.clone(), track, generation).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = self.inner.manager.remove(target.guild).await;
                return Err(e);
            }
        };

        let handle = SessionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        self.inner.sessions.insert(
            chat,
            ActiveSession {
                handle,
                call,
                target,
                current: Some((track.clone(), track_handle)),
                generation,
                paused: false,
                reconnected: false,
            },
        );

        info!("✅ Conectado exitosamente en chat {} ({})", chat, handle);
        Ok(handle)
    }

    /// Un intento de reconexión; si falla la sesión se da por perdida
    async fn recover(&self, chat: ChatId, reason: String) {
        let snapshot = self.inner.sessions.get_mut(&chat).map(|mut session| {
            let first_attempt = !session.reconnected;
            session.reconnected = true;
            (
                session.target,
                session.current.as_ref().map(|(track, _)| track.clone()),
                session.generation,
                first_attempt,
            )
        });
        let Some((target, current, generation, first_attempt)) = snapshot else {
            return;
        };

        if first_attempt {
            warn!("🔄 Reconectando al canal de voz en chat {}: {}", chat, reason);
            match self.inner.manager.join(target.guild, target.channel).await {
                Ok(call) => {
                    let Some(track) = current else {
                        return;
                    };
                    match self.start_track(chat, call.clone(), &track, generation).await {
                        Ok(handle) => {
                            if let Some(mut session) = self.inner.sessions.get_mut(&chat) {
                                if session.generation == generation {
                                    session.call = call;
                                    session.current = Some((track, handle));
                                    session.paused = false;
                                }
                            }
                            info!("✅ Reconectado en chat {}", chat);
                            return;
                        }
                        Err(e) => warn!("❌ No se pudo retomar el stream: {}", e),
                    }
                }
                Err(e) => warn!("❌ Reconexión fallida en chat {}: {:?}", chat, e),
            }
        }

        if self
            .inner
            .sessions
            .remove_if(&chat, |_, session| session.generation == generation)
            .is_some()
        {
            let _ = self.inner.manager.remove(target.guild).await;
            error!("🔌 Sesión de voz perdida en chat {}: {}", chat, reason);
            self.inner.sink.emit(SessionEvent {
                chat_id: chat,
                generation,
                kind: SessionEventKind::SessionLost { reason },
            });
        }
    }
}

#[async_trait]
impl SessionController for SongbirdSessions {
    async fn join(
        &self,
        chat: ChatId,
        track: &Track,
        generation: u64,
    ) -> Result<SessionHandle, SessionError> {
        let existing = self.inner.sessions.get(&chat).map(|s| s.handle);

        match plan_join(existing, self.target(chat))? {
            JoinPlan::Reuse(handle) => {
                self.change_stream(chat, track, generation).await?;
                Ok(handle)
            }
            JoinPlan::Connect(target) => {
                self.inner.joining.insert(chat, generation);
                let result = self.connect(chat, target, track, generation).await;
                self.inner.joining.remove(&chat);
                result
            }
        }
    }

    async fn change_stream(
        &self,
        chat: ChatId,
        track: &Track,
        generation: u64,
    ) -> Result<(), SessionError> {
        let call = match self.inner.sessions.get_mut(&chat) {
            Some(mut session) => {
                session.generation = generation;
                session.current = None;
                session.call.clone()
            }
            None => return Err(SessionError::NotPlaying),
        };

        let handle = self.start_track(chat, call, track, generation).await?;

        if let Some(mut session) = self.inner.sessions.get_mut(&chat) {
            if session.generation == generation {
                session.current = Some((track.clone(), handle));
                session.paused = false;
                session.reconnected = false;
            }
        }
        Ok(())
    }

    async fn pause(&self, chat: ChatId) -> Result<(), SessionError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(&chat)
            .ok_or(SessionError::NotPlaying)?;
        let (_, handle) = session.current.as_ref().ok_or(SessionError::NotPlaying)?;

        handle
            .pause()
            .map_err(|e| SessionError::Stream(format!("{:?}", e)))?;
        session.paused = true;
        info!("⏸️ Reproducción pausada en chat {}", chat);
        Ok(())
    }

    async fn resume(&self, chat: ChatId) -> Result<(), SessionError> {
        let mut session = self
            .inner
            .sessions
            .get_mut(&chat)
            .ok_or(SessionError::NotPlaying)?;
        let (_, handle) = session.current.as_ref().ok_or(SessionError::NotPlaying)?;

        handle
            .play()
            .map_err(|e| SessionError::Stream(format!("{:?}", e)))?;
        session.paused = false;
        info!("▶️ Reproducción reanudada en chat {}", chat);
        Ok(())
    }

    async fn leave(&self, chat: ChatId) {
        let removed = self.inner.sessions.remove(&chat);
        if let Some((_, session)) = &removed {
            if let Some((_, handle)) = &session.current {
                let _ = handle.stop();
            }
        }

        let guild = removed
            .map(|(_, session)| session.target.guild)
            .or_else(|| self.target(chat).map(|t| t.guild));

        if let Some(guild) = guild {
            if self.inner.manager.get(guild).is_some() {
                if let Err(e) = self.inner.manager.remove(guild).await {
                    warn!("⚠️ Error al salir del canal en chat {}: {:?}", chat, e);
                } else {
                    info!("👋 Desconectado del canal de voz en chat {}", chat);
                }
            }
        }
    }

    fn state(&self, chat: ChatId) -> SessionState {
        if self.inner.joining.contains_key(&chat) {
            return SessionState::Joining;
        }
        match self.inner.sessions.get(&chat) {
            Some(session) if session.paused => SessionState::Paused,
            Some(_) => SessionState::Streaming,
            None => SessionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NotifyKind {
    Ended,
    Errored,
}

/// Un error del track gana aunque el evento sea de fin normal
fn end_reason(kind: NotifyKind, errored: Option<String>) -> EndReason {
    match (kind, errored) {
        (_, Some(e)) => EndReason::TransportError(e),
        (NotifyKind::Errored, None) => EndReason::TransportError("error de reproducción".into()),
        (NotifyKind::Ended, None) => EndReason::Completed,
    }
}

/// Handler para fin y errores de un track concreto
struct TrackNotifier {
    chat: ChatId,
    generation: u64,
    title: String,
    kind: NotifyKind,
    sink: EventSink,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let errored = match ctx {
            EventContext::Track(track_list) => track_list.iter().find_map(|(state, _)| {
                match &state.playing {
                    PlayMode::Errored(e) => Some(format!("{:?}", e)),
                    _ => None,
                }
            }),
            _ => None,
        };

        let reason = end_reason(self.kind, errored);
        if let EndReason::TransportError(e) = &reason {
            error!("❌ Error en track para chat {}: {}", self.chat, e);
        }

        self.sink.emit(SessionEvent {
            chat_id: self.chat,
            generation: self.generation,
            kind: SessionEventKind::StreamEnded {
                title: self.title.clone(),
                reason,
            },
        });

        None
    }
}

/// Handler para desconexiones del driver de voz
struct DisconnectHandler {
    chat: ChatId,
    inner: Weak<Inner>,
}

#[async_trait]
impl VoiceEventHandler for DisconnectHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::DriverDisconnect(data) = ctx else {
            return None;
        };

        // Sin razón = desconexión pedida por nosotros
        let Some(reason) = &data.reason else {
            debug!("🔌 Desconexión solicitada en chat {}", self.chat);
            return None;
        };

        let inner = self.inner.upgrade()?;
        let sessions = SongbirdSessions { inner };
        let chat = self.chat;
        let reason = format!("{:?}", reason);

        tokio::spawn(async move {
            sessions.recover(chat, reason).await;
        });

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn target() -> VoiceTarget {
        VoiceTarget {
            guild: GuildId::new(10),
            channel: ChannelId::new(20),
        }
    }

    #[test]
    fn test_join_reuses_existing_session() {
        let handle = SessionHandle(4);
        assert_eq!(plan_join(Some(handle), Some(target())), Ok(JoinPlan::Reuse(handle)));
        // La sesión existente basta aunque el canal ya no esté asociado
        assert_eq!(plan_join(Some(handle), None), Ok(JoinPlan::Reuse(handle)));
    }

    #[test]
    fn test_join_connects_to_bound_channel() {
        assert_eq!(plan_join(None, Some(target())), Ok(JoinPlan::Connect(target())));
    }

    #[test]
    fn test_join_without_channel_fails() {
        let err = plan_join(None, None).unwrap_err();
        assert!(matches!(err, SessionError::Join(_)));
    }

    #[test]
    fn test_end_reason_prefers_track_error() {
        assert_eq!(end_reason(NotifyKind::Ended, None), EndReason::Completed);
        assert_eq!(
            end_reason(NotifyKind::Ended, Some("decoder".into())),
            EndReason::TransportError("decoder".into())
        );
        assert!(matches!(
            end_reason(NotifyKind::Errored, None),
            EndReason::TransportError(_)
        ));
    }
}
