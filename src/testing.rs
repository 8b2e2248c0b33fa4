//! In-memory transport, sink and stream providers for unit tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    audio::track::{AudioStream, StreamEncoding, StreamProvider, TrackDescriptor, TrackInfo},
    error::{PlayerError, PlayerResult},
    voice::{
        AudioSink, SessionOwnership, SessionStatus, SinkStatus, StreamHandle, TransportProvider,
        TransportSession, VoiceEvent, VoiceEventSender,
    },
};

/// 20 ms of stereo silence.
const SILENCE: usize = 3840;

pub(crate) struct StaticProvider;

#[async_trait]
impl StreamProvider for StaticProvider {
    async fn open_stream(&self, _track: &TrackInfo, _offset: Duration) -> PlayerResult<AudioStream> {
        Ok(AudioStream::from_bytes(
            vec![0u8; SILENCE],
            StreamEncoding::NORMALIZED_PCM,
            "memory",
        ))
    }
}

pub(crate) struct FailingProvider;

#[async_trait]
impl StreamProvider for FailingProvider {
    async fn open_stream(&self, track: &TrackInfo, _offset: Duration) -> PlayerResult<AudioStream> {
        Err(PlayerError::ResolutionFailure {
            title: track.title.clone(),
            reason: "fuente no disponible".to_string(),
        })
    }
}

/// Records every requested offset; optionally refuses non-zero offsets.
#[derive(Default)]
pub(crate) struct OffsetProvider {
    pub(crate) fail_seek: bool,
    pub(crate) offsets: Mutex<Vec<Duration>>,
}

#[async_trait]
impl StreamProvider for OffsetProvider {
    async fn open_stream(&self, track: &TrackInfo, offset: Duration) -> PlayerResult<AudioStream> {
        self.offsets.lock().push(offset);
        if self.fail_seek && !offset.is_zero() {
            return Err(PlayerError::ResolutionFailure {
                title: track.title.clone(),
                reason: "seek no soportado".to_string(),
            });
        }
        StaticProvider.open_stream(track, offset).await
    }
}

fn info(title: &str) -> TrackInfo {
    TrackInfo::new(title, format!("https://example.com/watch?v={}", title))
        .with_duration(Duration::from_secs(180))
}

pub(crate) fn track(title: &str) -> TrackDescriptor {
    TrackDescriptor::new(info(title), Arc::new(StaticProvider))
}

pub(crate) fn failing_track(title: &str) -> TrackDescriptor {
    TrackDescriptor::new(info(title), Arc::new(FailingProvider))
}

pub(crate) fn track_with(title: &str, provider: Arc<dyn StreamProvider>) -> TrackDescriptor {
    TrackDescriptor::new(info(title), provider)
}

/// One voice connection per guild, shared by every session joined on it,
/// like the real driver.
#[derive(Default)]
pub(crate) struct MockConnection {
    owners: SessionOwnership,
    channel: Mutex<Option<ChannelId>>,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    pub(crate) fail_join: AtomicBool,
    pub(crate) fail_reconnect: AtomicBool,
    connection: Arc<MockConnection>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    pub(crate) fn joins(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Channel the guild's connection is currently in.
    pub(crate) fn connected_channel(&self) -> Option<ChannelId> {
        *self.connection.channel.lock()
    }
}

#[async_trait]
impl TransportProvider for MockTransport {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: VoiceEventSender,
    ) -> Result<Arc<dyn TransportSession>> {
        if self.fail_join.load(Ordering::SeqCst) {
            bail!("el gateway no respondió");
        }

        *self.connection.channel.lock() = Some(channel_id);
        let session = Arc::new(MockSession {
            guild_id,
            generation: self.connection.owners.claim(guild_id),
            connection: Arc::clone(&self.connection),
            channel_id,
            status: Mutex::new(SessionStatus::Ready),
            sink: Arc::new(MockSink::new(events.clone())),
            events,
            fail_reconnect: self.fail_reconnect.load(Ordering::SeqCst),
            destroyed: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub(crate) struct MockSession {
    guild_id: GuildId,
    generation: u64,
    connection: Arc<MockConnection>,
    channel_id: ChannelId,
    status: Mutex<SessionStatus>,
    sink: Arc<MockSink>,
    events: VoiceEventSender,
    fail_reconnect: bool,
    destroyed: AtomicBool,
    reconnects: AtomicUsize,
}

impl MockSession {
    pub(crate) fn sink(&self) -> Arc<MockSink> {
        Arc::clone(&self.sink)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Simulates the gateway dropping the voice connection.
    pub(crate) fn drop_connection(&self) {
        self.set_status(SessionStatus::Disconnected);
    }

    /// Changes the session status and reports it like the driver does.
    pub(crate) fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
        let _ = self.events.send(VoiceEvent::Session(status));
    }
}

#[async_trait]
impl TransportSession for MockSession {
    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    fn subscribe(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_reconnect {
            bail!("reconexión rechazada");
        }
        *self.status.lock() = SessionStatus::Ready;
        Ok(())
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        *self.status.lock() = SessionStatus::Disconnected;
        self.sink.stop().await;

        // Solo la última sesión unida abandona la conexión
        if self.connection.owners.release(self.guild_id, self.generation) {
            *self.connection.channel.lock() = None;
        }
    }
}

pub(crate) struct MockSink {
    events: VoiceEventSender,
    next_id: AtomicU64,
    current: Mutex<Option<u64>>,
    paused: AtomicBool,
    plays: Mutex<Vec<&'static str>>,
    volume: Arc<Mutex<f32>>,
    pub(crate) fail_play: AtomicBool,
}

impl MockSink {
    fn new(events: VoiceEventSender) -> Self {
        Self {
            events,
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
            paused: AtomicBool::new(false),
            plays: Mutex::new(Vec::new()),
            volume: Arc::new(Mutex::new(1.0)),
            fail_play: AtomicBool::new(false),
        }
    }

    fn emit(&self, stream_id: u64, status: SinkStatus) {
        let _ = self.events.send(VoiceEvent::Sink { stream_id, status });
    }

    pub(crate) fn plays(&self) -> usize {
        self.plays.lock().len()
    }

    pub(crate) fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub(crate) fn current(&self) -> Option<u64> {
        *self.current.lock()
    }

    /// The active stream reached its end.
    pub(crate) fn finish_current(&self) {
        if let Some(id) = self.current.lock().take() {
            self.emit(id, SinkStatus::Idle);
        }
    }

    /// The decoder failed on the active stream.
    pub(crate) fn fail_current(&self, reason: &str) {
        if let Some(id) = self.current.lock().take() {
            self.emit(id, SinkStatus::Error(reason.to_string()));
        }
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn play(&self, stream: AudioStream) -> Result<Arc<dyn StreamHandle>> {
        if self.fail_play.load(Ordering::SeqCst) {
            bail!("el decodificador rechazó el stream");
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Some(previous) = self.current.lock().replace(id) {
            self.emit(previous, SinkStatus::Idle);
        }
        self.paused.store(false, Ordering::SeqCst);
        self.plays.lock().push(stream.origin());
        self.emit(id, SinkStatus::Playing);

        Ok(Arc::new(MockHandle {
            id,
            volume: Arc::clone(&self.volume),
        }))
    }

    async fn pause(&self) -> bool {
        let Some(id) = self.current() else {
            return false;
        };
        if self.paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(id, SinkStatus::Paused);
        true
    }

    async fn unpause(&self) -> bool {
        let Some(id) = self.current() else {
            return false;
        };
        if !self.paused.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.emit(id, SinkStatus::Playing);
        true
    }

    async fn stop(&self) {
        self.finish_current();
    }
}

pub(crate) struct MockHandle {
    id: u64,
    volume: Arc<Mutex<f32>>,
}

#[async_trait]
impl StreamHandle for MockHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }

    async fn position(&self) -> Option<Duration> {
        Some(Duration::from_secs(42))
    }
}
