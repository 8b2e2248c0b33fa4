use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::io::AsyncRead;

use crate::error::PlayerResult;

/// Fuente de bytes de audio
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Sample rate of the normalized PCM format.
pub const PCM_SAMPLE_RATE: u32 = 48_000;
/// Channel count of the normalized PCM format.
pub const PCM_CHANNELS: u16 = 2;

/// Declared encoding of an [`AudioStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEncoding {
    /// Container/codec the sink has to probe (webm, m4a, mp3...).
    Arbitrary,
    /// Raw interleaved signed 16-bit little-endian PCM.
    PcmS16Le { sample_rate: u32, channels: u16 },
}

impl StreamEncoding {
    /// Formato de salida fijo del transcodificador
    pub const NORMALIZED_PCM: Self = Self::PcmS16Le {
        sample_rate: PCM_SAMPLE_RATE,
        channels: PCM_CHANNELS,
    };
}

/// A live audio byte stream ready to be handed to a sink.
///
/// Dropping the stream releases everything attached to it (subprocesses,
/// temp files), whether it was fully consumed or not.
pub struct AudioStream {
    reader: ByteReader,
    encoding: StreamEncoding,
    origin: &'static str,
}

impl AudioStream {
    pub fn new(reader: ByteReader, encoding: StreamEncoding, origin: &'static str) -> Self {
        Self {
            reader,
            encoding,
            origin,
        }
    }

    /// In-memory stream, mostly useful for tests and prerecorded clips.
    pub fn from_bytes(bytes: Vec<u8>, encoding: StreamEncoding, origin: &'static str) -> Self {
        Self::new(Box::pin(std::io::Cursor::new(bytes)), encoding, origin)
    }

    pub fn encoding(&self) -> StreamEncoding {
        self.encoding
    }

    /// Name of the backend that produced this stream.
    pub fn origin(&self) -> &'static str {
        self.origin
    }

    pub fn into_parts(self) -> (ByteReader, StreamEncoding) {
        (self.reader, self.encoding)
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("encoding", &self.encoding)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Capability to produce a playable stream for a track, on demand.
///
/// Tracks may sit in a queue long before they play, so nothing is fetched
/// until [`StreamProvider::open_stream`] is called.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    async fn open_stream(&self, track: &TrackInfo, offset: Duration) -> PlayerResult<AudioStream>;
}

/// Metadata of a playable item, without the stream capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub url: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    pub requested_by: Option<UserId>,
    pub added_at: DateTime<Utc>,
}

impl TrackInfo {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            artist: None,
            duration: None,
            thumbnail: None,
            requested_by: None,
            added_at: Utc::now(),
        }
    }

    pub fn with_artist(mut self, artist: String) -> Self {
        self.artist = Some(artist);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: String) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    /// Duración en formato `mm:ss` o `h:mm:ss`
    pub fn duration_label(&self) -> String {
        match self.duration {
            Some(duration) => format_duration(duration),
            None => "Unknown".to_string(),
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable queue entry: metadata plus the lazy stream capability.
///
/// Cloning is cheap and preserves identity ([`TrackDescriptor::id`]), so the
/// engine can tell whether the head of the queue changed while a stream was
/// being resolved.
#[derive(Clone)]
pub struct TrackDescriptor {
    id: u64,
    info: Arc<TrackInfo>,
    provider: Arc<dyn StreamProvider>,
}

impl TrackDescriptor {
    pub fn new(info: TrackInfo, provider: Arc<dyn StreamProvider>) -> Self {
        Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            info: Arc::new(info),
            provider,
        }
    }

    /// Copia con otro solicitante (los resultados de búsqueda llegan sin él)
    pub fn with_requested_by(self, user_id: UserId) -> Self {
        let mut info = (*self.info).clone();
        info.requested_by = Some(user_id);
        Self::new(info, self.provider)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn url(&self) -> &str {
        &self.info.url
    }

    pub fn duration(&self) -> Option<Duration> {
        self.info.duration
    }

    pub fn thumbnail(&self) -> Option<&str> {
        self.info.thumbnail.as_deref()
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.info.requested_by
    }

    pub fn same_as(&self, other: &TrackDescriptor) -> bool {
        self.id == other.id
    }

    /// Produce un stream de audio, opcionalmente desde un offset
    pub async fn open_stream(&self, offset: Duration) -> PlayerResult<AudioStream> {
        self.provider.open_stream(&self.info, offset).await
    }
}

impl fmt::Debug for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackDescriptor")
            .field("id", &self.id)
            .field("title", &self.info.title)
            .field("url", &self.info.url)
            .finish_non_exhaustive()
    }
}
