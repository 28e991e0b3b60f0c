//! # Bot Module
//!
//! Thin text-command gateway between Discord and the [`Orchestrator`].
//!
//! - Parses prefixed commands from guild messages (see [`commands`])
//! - Binds each chat to its caller's voice channel before `play`
//! - Renders orchestrator results as replies in the channel that asked
//! - Forwards [`PlaybackNotice`]s to the last text channel used in each chat
//!
//! A chat is a guild; its [`ChatId`] is the guild id.

use dashmap::DashMap;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Message, Ready},
    async_trait,
    http::Http,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

pub mod commands;

use crate::{
    audio::SongbirdSessions,
    cache::SearchCache,
    config::Config,
    playback::{Orchestrator, PlaybackNotice},
    ChatId, RequesterId,
};
use commands::Command;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct MusicBot {
    config: Arc<Config>,
    orchestrator: Orchestrator,
    sessions: SongbirdSessions,
    search_cache: SearchCache,
    /// Último canal de texto usado en cada chat, destino de los avisos
    text_channels: Arc<DashMap<ChatId, ChannelId>>,
    background_started: AtomicBool,
}

impl MusicBot {
    pub fn new(
        config: Arc<Config>,
        orchestrator: Orchestrator,
        sessions: SongbirdSessions,
        search_cache: SearchCache,
    ) -> Self {
        Self {
            config,
            orchestrator,
            sessions,
            search_cache,
            text_channels: Arc::new(DashMap::new()),
            background_started: AtomicBool::new(false),
        }
    }

    async fn execute(&self, ctx: &Context, msg: &Message, guild_id: GuildId, command: Command) -> String {
        let chat = chat_for(guild_id);

        match command {
            Command::Play(query) if query.is_empty() => {
                format!("❌ Uso: `{}play <búsqueda o URL>`", self.config.command_prefix)
            }
            Command::Play(query) => {
                // El GuildRef no puede cruzar un await
                let voice_channel = msg.guild(&ctx.cache).and_then(|guild| {
                    guild
                        .voice_states
                        .get(&msg.author.id)
                        .and_then(|state| state.channel_id)
                });

                let Some(channel_id) = voice_channel else {
                    return "❌ Debes estar en un canal de voz".to_string();
                };
                self.sessions.bind(chat, guild_id, channel_id);

                if let Err(e) = msg.channel_id.broadcast_typing(&ctx.http).await {
                    debug!("No se pudo enviar typing: {:?}", e);
                }

                let requester = RequesterId(msg.author.id.get());
                match self.orchestrator.play(chat, requester, &query).await {
                    Ok(outcome) => commands::render_play(&outcome),
                    Err(e) => {
                        warn!("❌ play falló en chat {}: {}", chat, e);
                        commands::render_error(&e)
                    }
                }
            }
            Command::Skip => match self.orchestrator.skip(chat).await {
                Ok(outcome) => commands::render_skip(&outcome),
                Err(e) => commands::render_error(&e),
            },
            Command::Stop => commands::render_stop(&self.orchestrator.stop(chat).await).to_string(),
            Command::Pause => match self.orchestrator.pause(chat).await {
                Ok(()) => "⏸️ Reproducción pausada".to_string(),
                Err(e) => commands::render_error(&e),
            },
            Command::Resume => match self.orchestrator.resume(chat).await {
                Ok(()) => "▶️ Reproducción reanudada".to_string(),
                Err(e) => commands::render_error(&e),
            },
            Command::Queue => commands::render_queue(&self.orchestrator.get_queue(chat).await),
            Command::Current => {
                commands::render_current(self.orchestrator.now_playing(chat).await.as_ref())
            }
            Command::Help => commands::help_text(&self.config.command_prefix),
        }
    }
}

fn chat_for(guild_id: GuildId) -> ChatId {
    ChatId(guild_id.get() as i64)
}

#[async_trait]
impl EventHandler for MusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        // ready se repite en cada reconexión del gateway
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        tokio::spawn(forward_notices(
            ctx.http.clone(),
            self.orchestrator.subscribe(),
            self.text_channels.clone(),
        ));

        let cache = self.search_cache.clone();
        tokio::spawn(async move {
            maintenance_tasks(cache).await;
        });
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let Some(command) = Command::parse(&self.config.command_prefix, &msg.content) else {
            return;
        };

        let Some(guild_id) = msg.guild_id else {
            if let Err(e) = msg.channel_id.say(&ctx.http, "❌ Los comandos solo funcionan en servidores").await {
                error!("Error enviando respuesta: {:?}", e);
            }
            return;
        };

        debug!("📨 Comando {:?} de {} en guild {}", command, msg.author.name, guild_id);
        self.text_channels.insert(chat_for(guild_id), msg.channel_id);

        let reply = self.execute(&ctx, &msg, guild_id, command).await;
        if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
            error!("Error enviando respuesta: {:?}", e);
        }
    }
}

/// Publica los avisos del orquestador en el canal de texto de cada chat
async fn forward_notices(
    http: Arc<Http>,
    mut notices: broadcast::Receiver<PlaybackNotice>,
    channels: Arc<DashMap<ChatId, ChannelId>>,
) {
    loop {
        match notices.recv().await {
            Ok(notice) => {
                let chat = notice.chat_id();
                let Some(channel) = channels.get(&chat).map(|c| *c) else {
                    debug!("Aviso sin canal de texto para chat {}", chat);
                    continue;
                };
                if let Err(e) = channel.say(&http, commands::render_notice(&notice)).await {
                    warn!("⚠️ No se pudo enviar aviso a chat {}: {:?}", chat, e);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("⚠️ Se perdieron {} avisos de reproducción", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn maintenance_tasks(cache: SearchCache) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        interval.tick().await;
        cache.cleanup_old_entries();
        debug!("🧹 Tareas de mantenimiento completadas");
    }
}
