use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tracing::{error, info, warn};

use open_music_engine::{
    audio::{events::Notifier, registry::QueueRegistry},
    config::Config,
    sources::{transcode::Transcoder, youtube::YtDlpClient, SourceResolver},
    voice::SongbirdTransport,
};

mod bot;

use crate::bot::OpenMusicBot;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_engine=debug".parse()?)
                .add_directive("open_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    if config.discord_token.trim().is_empty() {
        anyhow::bail!("DISCORD_TOKEN no está configurado");
    }
    info!("⚙️ {}", config.summary());

    let resolver = Arc::new(SourceResolver::from_config(&config)?);

    let songbird = Songbird::serenity();
    let transport = Arc::new(SongbirdTransport::new(Arc::clone(&songbird)));
    let (notifier, notifications) = Notifier::channel();
    let registry = QueueRegistry::new(config.playback_settings(), transport, notifier);

    // Sin UI: las notificaciones van al log
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv_async().await {
            info!("📣 [{}] {}", notification.guild_id(), notification.describe());
        }
    });

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let handler = OpenMusicBot::new(registry.clone(), resolver);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = Arc::clone(&client.shard_manager);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        registry.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let ytdlp = YtDlpClient::new(config.ytdlp_path.clone(), config.extractor_timeout());
    let transcoder = Transcoder::new(config.ffmpeg_path.clone(), config.extractor_timeout());

    let (ytdlp_version, ffmpeg_version) = tokio::join!(ytdlp.version(), transcoder.version());
    match (ytdlp_version, ffmpeg_version) {
        (Ok(ytdlp_version), Ok(ffmpeg_version)) => {
            info!("yt-dlp {} | {}", ytdlp_version, ffmpeg_version);
            println!("OK");
            Ok(())
        }
        (ytdlp_version, ffmpeg_version) => {
            if let Err(e) = ytdlp_version {
                warn!("yt-dlp no disponible: {:#}", e);
            }
            if let Err(e) = ffmpeg_version {
                warn!("ffmpeg no disponible: {:#}", e);
            }
            anyhow::bail!("Dependencias faltantes");
        }
    }
}
