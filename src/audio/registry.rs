use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::{
    audio::{events::Notifier, player::GuildPlayer},
    config::PlaybackSettings,
    voice::TransportProvider,
};

/// One [`GuildPlayer`] per guild, created on first access.
///
/// Players remove themselves when they are destroyed (stop, idle timeout,
/// lost session), so a later [`QueueRegistry::get_or_create`] always hands
/// out a fresh queue.
#[derive(Clone)]
pub struct QueueRegistry {
    players: Arc<DashMap<GuildId, GuildPlayer>>,
    settings: PlaybackSettings,
    transport: Arc<dyn TransportProvider>,
    notifier: Notifier,
}

/// Back-reference a player uses to leave the registry.
#[derive(Clone)]
pub(crate) struct RegistryHandle {
    players: Weak<DashMap<GuildId, GuildPlayer>>,
}

impl RegistryHandle {
    /// Quita el reproductor solo si sigue siendo el registrado
    pub(crate) fn detach(&self, player: &GuildPlayer) {
        let Some(players) = self.players.upgrade() else {
            return;
        };
        if players
            .remove_if(&player.guild_id(), |_, current| current.same_as(player))
            .is_some()
        {
            debug!("📤 Guild {} removida del registro", player.guild_id());
        }
    }
}

impl QueueRegistry {
    pub fn new(
        settings: PlaybackSettings,
        transport: Arc<dyn TransportProvider>,
        notifier: Notifier,
    ) -> Self {
        Self {
            players: Arc::new(DashMap::new()),
            settings,
            transport,
            notifier,
        }
    }

    pub fn get_or_create(&self, guild_id: GuildId) -> GuildPlayer {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                GuildPlayer::with_registry(
                    guild_id,
                    self.settings,
                    Arc::clone(&self.transport),
                    self.notifier.clone(),
                    RegistryHandle {
                        players: Arc::downgrade(&self.players),
                    },
                )
            })
            .value()
            .clone()
    }

    pub fn get(&self, guild_id: GuildId) -> Option<GuildPlayer> {
        self.players.get(&guild_id).map(|player| player.value().clone())
    }

    /// Destruye la cola de un servidor; `false` si no existía
    pub async fn destroy(&self, guild_id: GuildId) -> bool {
        let Some((_, player)) = self.players.remove(&guild_id) else {
            return false;
        };
        player.destroy().await;
        true
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.players.iter().map(|entry| *entry.key()).collect()
    }

    /// Destruye todas las colas (apagado del proceso)
    pub async fn shutdown(&self) {
        let guilds = self.guilds();
        info!("🛑 Cerrando {} colas activas", guilds.len());
        for guild_id in guilds {
            self.destroy(guild_id).await;
        }
    }
}
