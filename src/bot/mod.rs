//! # Bot Module
//!
//! Serenity event handler hosting the playback engine.
//!
//! The handler registers no commands. It logs the connection, runs the
//! periodic cache maintenance and destroys a guild's queue when the bot is
//! removed from its voice channel (kicked, moved out, channel deleted).
//! Everything else happens through the library API.

use serenity::{
    all::{Context, EventHandler, Ready, VoiceState},
    async_trait,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use open_music_engine::{audio::QueueRegistry, sources::SourceResolver};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

pub struct OpenMusicBot {
    registry: QueueRegistry,
    resolver: Arc<SourceResolver>,
}

impl OpenMusicBot {
    pub fn new(registry: QueueRegistry, resolver: Arc<SourceResolver>) -> Self {
        Self { registry, resolver }
    }
}

#[async_trait]
impl EventHandler for OpenMusicBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        let resolver = Arc::clone(&self.resolver);
        tokio::spawn(async move {
            maintenance_tasks(resolver).await;
        });
    }

    /// Destruye la cola cuando el bot sale del canal de voz
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }

        let Some(guild_id) = new.guild_id else {
            return;
        };

        info!("🔌 Bot desconectado en guild {}", guild_id);
        if self.registry.destroy(guild_id).await {
            debug!("🗑️ Cola de guild {} destruida tras la desconexión", guild_id);
        }
    }
}

/// Limpieza periódica de la caché de metadatos
async fn maintenance_tasks(resolver: Arc<SourceResolver>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    // El primer tick es inmediato
    interval.tick().await;

    loop {
        interval.tick().await;
        resolver.cache().cleanup_old_entries();
        info!("🧹 Tareas de mantenimiento completadas");
    }
}
