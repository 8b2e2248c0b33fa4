//! # Open Music Engine
//!
//! Playback core for Discord music bots: per-guild queues, a source resolver
//! with a fallback chain of extraction strategies, the playback state
//! machine and idle reclamation.
//!
//! The voice transport is abstracted behind the traits in [`voice`];
//! [`voice::SongbirdTransport`] plugs in the songbird driver.

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

pub use audio::{GuildPlayer, LoopMode, Notification, Notifier, PlayerState, QueueRegistry};
pub use config::{Config, PlaybackSettings};
pub use error::{PlayerError, PlayerResult};
pub use sources::SourceResolver;
