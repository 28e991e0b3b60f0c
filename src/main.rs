use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

use voicechat_music::{
    audio::{event_channel, ArtifactStore, SongbirdSessions},
    bot::MusicBot,
    cache::SearchCache,
    config::Config,
    playback::Orchestrator,
    sources::{TrackResolver, YtDlpService},
};

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voicechat_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando voicechat-music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check(&config));
    }

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    if config.discord_token.trim().is_empty() {
        anyhow::bail!("DISCORD_TOKEN es obligatorio");
    }
    let config = Arc::new(config);

    // Directorio temporal de audio descargado
    let artifacts = Arc::new(ArtifactStore::new(config.cache_dir.as_deref())?);

    let cookies = match &config.cookies_file {
        Some(path) => Some(path.clone()),
        None => YtDlpService::find_cookies_file().await,
    };
    let ytdlp = YtDlpService::new(&config.ytdlp_path, artifacts.clone()).with_cookies(cookies);
    if let Some(path) = ytdlp.cookies() {
        info!("🍪 Usando cookies de {}", path.display());
    }
    ytdlp.check_version().await?;

    let search_cache = SearchCache::for_searches(config.search_cache_size, config.search_cache_ttl);
    let resolver = TrackResolver::new(
        Arc::new(ytdlp),
        config.strategy_profiles(),
        config.retry_policy(),
    )
    .with_search_cache(search_cache.clone());

    // Transporte de voz
    let (sink, events) = event_channel();
    let songbird = Songbird::serenity();
    let sessions = SongbirdSessions::new(songbird.clone(), sink, config.default_volume);

    let orchestrator = Orchestrator::new(
        Arc::new(resolver),
        Arc::new(sessions.clone()),
        artifacts.clone(),
        config.orchestrator_settings(),
    );
    let router = orchestrator.spawn_event_router(events);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = MusicBot::new(
        config.clone(),
        orchestrator.clone(),
        sessions.clone(),
        search_cache,
    );

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown_orchestrator = orchestrator.clone();
    let shutdown_sessions = sessions;
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!(
            "⚠️ Señal de shutdown recibida, cerrando {} chats ({} llamadas de voz)...",
            shutdown_orchestrator.active_chats(),
            shutdown_sessions.active_sessions()
        );
        shutdown_orchestrator.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    router.abort();
    let leftover = artifacts.count();
    if leftover > 0 {
        warn!("🗑️ {} archivos temporales se eliminan al cerrar", leftover);
    }
    info!("👋 Bot detenido");

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let artifacts = Arc::new(ArtifactStore::new(config.cache_dir.as_deref())?);
    let ytdlp = YtDlpService::new(&config.ytdlp_path, artifacts);

    match ytdlp.check_version().await {
        Ok(_) => {
            println!("OK");
            Ok(())
        }
        Err(e) => anyhow::bail!("Dependencias faltantes: {}", e),
    }
}
