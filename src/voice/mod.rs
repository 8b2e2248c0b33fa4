//! # Voice Module
//!
//! Seams between the playback engine and the real-time voice transport.
//!
//! The engine never talks to Discord directly. It consumes:
//!
//! - a [`TransportProvider`] that joins a voice channel and hands back a
//!   [`TransportSession`],
//! - the session's [`AudioSink`], which plays one [`AudioStream`] at a time
//!   and returns a [`StreamHandle`] for live volume and position,
//! - a stream of [`VoiceEvent`]s describing sink and session status changes.
//!
//! Sink events carry the id of the stream they refer to, so the engine can
//! drop late events from a stream it already replaced (seek, skip, stop).
//!
//! [`discord`] implements these traits on top of songbird.

pub mod discord;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

use crate::audio::track::AudioStream;

pub use discord::SongbirdTransport;

/// Estado de la sesión de voz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Connecting,
    Ready,
    Disconnected,
}

/// Estado reportado por el sink de audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    Idle,
    Buffering,
    Playing,
    Paused,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Sink { stream_id: u64, status: SinkStatus },
    Session(SessionStatus),
}

pub type VoiceEventSender = mpsc::UnboundedSender<VoiceEvent>;
pub type VoiceEventReceiver = mpsc::UnboundedReceiver<VoiceEvent>;

/// Joins voice channels on behalf of a guild.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Connects to `channel_id` and resolves once the session is ready.
    ///
    /// Every status change of the session and its sink must be pushed into
    /// `events`, in the order they happen.
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: VoiceEventSender,
    ) -> Result<Arc<dyn TransportSession>>;
}

/// A live voice connection, exclusively owned by one guild queue.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn status(&self) -> SessionStatus;

    fn channel_id(&self) -> ChannelId;

    /// Sink that plays audio through this session.
    fn subscribe(&self) -> Arc<dyn AudioSink>;

    /// Tries to bring a disconnected session back.
    async fn reconnect(&self) -> Result<()>;

    /// Releases the connection. Must be idempotent.
    ///
    /// A session superseded by a later `join` for the same guild only stops
    /// its own audio: the guild's connection belongs to the newer session.
    async fn destroy(&self);
}

/// Audio endpoint that consumes a byte stream and reports playback status.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Replaces whatever is playing with `stream`.
    async fn play(&self, stream: AudioStream) -> Result<Arc<dyn StreamHandle>>;

    /// `false` when nothing was playing.
    async fn pause(&self) -> bool;

    /// `false` when nothing was paused.
    async fn unpause(&self) -> bool;

    /// Stops the active stream; the sink then reports [`SinkStatus::Idle`].
    async fn stop(&self);
}

/// Handle to the stream currently attached to a sink.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    /// Id echoed back in [`VoiceEvent::Sink`] events for this stream.
    fn id(&self) -> u64;

    fn set_volume(&self, volume: f32);

    /// Tiempo reproducido
    async fn position(&self) -> Option<Duration>;
}

/// Which session owns each guild's voice connection.
///
/// The driver keeps a single connection per guild, so joining another
/// channel moves the connection an older session still points to. Each
/// `join` claims the guild with a fresh generation; only the current owner
/// may leave the guild on release.
#[derive(Debug, Clone, Default)]
pub struct SessionOwnership {
    owners: Arc<DashMap<GuildId, u64>>,
    next: Arc<AtomicU64>,
}

impl SessionOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toma la conexión del guild; devuelve la generación nueva
    pub fn claim(&self, guild_id: GuildId) -> u64 {
        let generation = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.owners.insert(guild_id, generation);
        generation
    }

    pub fn is_owner(&self, guild_id: GuildId, generation: u64) -> bool {
        self.owners
            .get(&guild_id)
            .is_some_and(|owner| *owner == generation)
    }

    /// `true` si `generation` era la dueña y debe abandonar el guild
    pub fn release(&self, guild_id: GuildId, generation: u64) -> bool {
        self.owners
            .remove_if(&guild_id, |_, owner| *owner == generation)
            .is_some()
    }
}
