//! Error taxonomy for the playback engine.
//!
//! Failures fall in two groups:
//! - **Track-local** ([`PlayerError::ResolutionFailure`], [`PlayerError::SinkFault`]):
//!   recovered automatically by advancing the queue and reported as
//!   [`Notification`](crate::audio::events::Notification)s.
//! - **Session-level** ([`PlayerError::TransportJoinFailure`],
//!   [`PlayerError::TransportDisconnected`]): terminate the guild queue and are
//!   surfaced to the caller.
//!
//! [`PlayerError::InvalidOperation`] never mutates state.

use serenity::model::id::ChannelId;

/// Errores del motor de reproducción
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlayerError {
    /// Every stage of the fallback chain failed for a track.
    #[error("no se pudo reproducir '{title}': {reason}")]
    ResolutionFailure {
        /// Title of the track that could not be resolved.
        title: String,
        /// Last error reported by the chain.
        reason: String,
    },

    /// The voice session never reached the ready state.
    #[error("no se pudo conectar al canal {channel_id}: {reason}")]
    TransportJoinFailure {
        channel_id: ChannelId,
        reason: String,
    },

    /// The voice session was lost and the reconnect attempt failed.
    #[error("conexión de voz perdida: {reason}")]
    TransportDisconnected { reason: String },

    /// The audio sink reported an error for the active stream.
    #[error("error en el reproductor: {0}")]
    SinkFault(String),

    /// Rejected request (index out of range, full queue, destroyed queue...).
    #[error("operación inválida: {0}")]
    InvalidOperation(String),
}

impl PlayerError {
    /// `true` for failures that only affect the current track.
    pub fn is_track_local(&self) -> bool {
        matches!(self, Self::ResolutionFailure { .. } | Self::SinkFault(_))
    }
}

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;
