use serenity::model::id::GuildId;
use tracing::debug;

use crate::audio::track::TrackInfo;

/// Playback events surfaced to the host (chat messages, embeds, logs).
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NowPlaying {
        guild_id: GuildId,
        track: TrackInfo,
    },
    /// A track could not be started and was skipped.
    TrackFailed {
        guild_id: GuildId,
        track: TrackInfo,
        reason: String,
    },
    /// The last track finished and nothing is left.
    QueueEnded { guild_id: GuildId },
    /// The sink failed and the queue ran dry while recovering.
    PlaybackFailed { guild_id: GuildId, reason: String },
    /// The voice session dropped and could not be recovered.
    SessionLost { guild_id: GuildId, reason: String },
    /// The idle timer reclaimed the queue.
    IdleDisconnect { guild_id: GuildId },
}

impl Notification {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Self::NowPlaying { guild_id, .. }
            | Self::TrackFailed { guild_id, .. }
            | Self::QueueEnded { guild_id }
            | Self::PlaybackFailed { guild_id, .. }
            | Self::SessionLost { guild_id, .. }
            | Self::IdleDisconnect { guild_id } => *guild_id,
        }
    }

    /// Mensaje listo para mostrar en el canal de texto
    pub fn describe(&self) -> String {
        match self {
            Self::NowPlaying { track, .. } => {
                format!("🎵 Reproduciendo: **{}** [{}]", track.title, track.duration_label())
            }
            Self::TrackFailed { track, reason, .. } => {
                format!("❌ No se pudo reproducir **{}**: {}", track.title, reason)
            }
            Self::QueueEnded { .. } => "📭 La cola ha terminado".to_string(),
            Self::PlaybackFailed { reason, .. } => {
                format!("❌ Error en la reproducción: {}", reason)
            }
            Self::SessionLost { reason, .. } => {
                format!("🔌 Se perdió la conexión de voz: {}", reason)
            }
            Self::IdleDisconnect { .. } => {
                "👋 Desconectado por inactividad".to_string()
            }
        }
    }
}

/// Sending half of the notification channel. Never blocks the engine.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<flume::Sender<Notification>>,
}

impl Notifier {
    pub fn channel() -> (Self, flume::Receiver<Notification>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// Notifier that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, notification: Notification) {
        let Some(tx) = &self.tx else {
            return;
        };

        if tx.send(notification).is_err() {
            debug!("📪 Receptor de notificaciones cerrado");
        }
    }
}
