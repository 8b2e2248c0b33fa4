//! # Audio Module
//!
//! Per-guild playback queues and the engine that drives them.
//!
//! ## Architecture
//!
//! ### [`track`] - Track Descriptor
//! - Immutable metadata plus a lazy way to open the audio stream
//! - The stream is only opened when the engine is about to play it
//!
//! ### [`queue`] - Guild Queue
//! - Ordered track list whose head is the current track
//! - Loop modes, volume, 24/7 flag and the attached voice session
//!
//! ### [`player`] - Playback Engine
//! - State machine: `Idle → Starting → Playing ⇄ Paused`, with
//!   `ErrorRecovering` when a start fails
//! - One start at a time per guild; late sink events are ignored
//! - Idle timer that tears the guild down when nothing is playing
//!
//! ### [`registry`] - Queue Registry
//! - One player per guild, created lazily and removed on teardown
//!
//! ### [`events`] - Notifications
//! - Now playing, failures, end of queue and disconnects, delivered over a
//!   channel so the host decides how to present them
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_music_engine::{
//!     audio::{events::Notifier, registry::QueueRegistry},
//!     config::Config,
//!     sources::SourceResolver,
//!     voice::TransportProvider,
//! };
//! use serenity::model::id::{ChannelId, GuildId, UserId};
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn TransportProvider>) -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let resolver = SourceResolver::from_config(&config)?;
//! let (notifier, _notifications) = Notifier::channel();
//! let registry = QueueRegistry::new(config.playback_settings(), transport, notifier);
//!
//! let player = registry.get_or_create(GuildId::new(1));
//! player.connect(ChannelId::new(2)).await?;
//! for track in resolver.search("never gonna give you up", UserId::new(3)).await {
//!     player.enqueue(track).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod player;
pub mod queue;
pub mod registry;
pub mod track;

pub use events::{Notification, Notifier};
pub use player::{GuildPlayer, PlayerState, QueueStatus};
pub use queue::{GuildQueue, LoopMode};
pub use registry::QueueRegistry;
pub use track::{AudioStream, StreamEncoding, StreamProvider, TrackDescriptor, TrackInfo};
