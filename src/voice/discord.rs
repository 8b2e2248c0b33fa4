use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    events::CoreEvent,
    input::{Input, LiveInput},
    tracks::{PlayMode, TrackHandle},
    Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    io::{self, Cursor, Read, Seek, SeekFrom},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use symphonia::core::{io::MediaSource, probe::Hint};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info, warn};

use super::{
    AudioSink, SessionOwnership, SessionStatus, SinkStatus, StreamHandle, TransportProvider,
    TransportSession, VoiceEvent, VoiceEventSender,
};
use crate::audio::track::{AudioStream, ByteReader, StreamEncoding};

type CallLock = Arc<tokio::sync::Mutex<Call>>;

/// Voice transport backed by the songbird manager registered on the
/// serenity client.
#[derive(Clone)]
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    owners: SessionOwnership,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            owners: SessionOwnership::new(),
        }
    }
}

#[async_trait]
impl TransportProvider for SongbirdTransport {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        events: VoiceEventSender,
    ) -> Result<Arc<dyn TransportSession>> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| anyhow::anyhow!("Error al unirse al canal: {:?}", e))?;

        let status = Arc::new(Mutex::new(SessionStatus::Ready));
        attach_session_events(&call, guild_id, &events, &status).await;

        // songbird reutiliza el mismo Call: la sesión anterior deja de ser dueña
        let generation = self.owners.claim(guild_id);

        info!("🔊 Sesión de voz lista en guild {} (canal {})", guild_id, channel_id);
        Ok(Arc::new(SongbirdSession {
            manager: Arc::clone(&self.manager),
            owners: self.owners.clone(),
            generation,
            guild_id,
            channel_id,
            status,
            sink: Arc::new(SongbirdSink {
                call: Mutex::new(call),
                events,
                next_id: AtomicU64::new(1),
                current: Mutex::new(None),
            }),
        }))
    }
}

/// Replaces the call's global handlers with this session's forwarders.
async fn attach_session_events(
    call: &CallLock,
    guild_id: GuildId,
    events: &VoiceEventSender,
    status: &Arc<Mutex<SessionStatus>>,
) {
    let mut handler = call.lock().await;
    // Una cola por guild: los handlers de sesiones anteriores sobran
    handler.remove_all_global_events();

    for (event, next) in [
        (CoreEvent::DriverConnect, SessionStatus::Ready),
        (CoreEvent::DriverReconnect, SessionStatus::Ready),
        (CoreEvent::DriverDisconnect, SessionStatus::Disconnected),
    ] {
        handler.add_global_event(
            Event::Core(event),
            SessionForwarder {
                guild_id,
                next,
                status: Arc::clone(status),
                events: events.clone(),
            },
        );
    }
}

/// Reenvía cambios de estado de la conexión al motor
struct SessionForwarder {
    guild_id: GuildId,
    next: SessionStatus,
    status: Arc<Mutex<SessionStatus>>,
    events: VoiceEventSender,
}

#[async_trait]
impl VoiceEventHandler for SessionForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            warn!(
                "🔌 Driver de voz desconectado en guild {}: {:?}",
                self.guild_id, data.reason
            );
        }

        *self.status.lock() = self.next;
        let _ = self.events.send(VoiceEvent::Session(self.next));
        None
    }
}

struct SongbirdSession {
    manager: Arc<Songbird>,
    owners: SessionOwnership,
    generation: u64,
    guild_id: GuildId,
    channel_id: ChannelId,
    status: Arc<Mutex<SessionStatus>>,
    sink: Arc<SongbirdSink>,
}

#[async_trait]
impl TransportSession for SongbirdSession {
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
        if !self.owners.is_owner(self.guild_id, self.generation) {
            anyhow::bail!("Otra sesión controla la conexión de voz de este servidor");
        }

        *self.status.lock() = SessionStatus::Connecting;
        let call = self
            .manager
            .join(self.guild_id, self.channel_id)
            .await
            .map_err(|e| anyhow::anyhow!("Error al reconectar: {:?}", e))?;

        // Si el Call anterior fue eliminado, songbird crea uno nuevo
        if !Arc::ptr_eq(&call, &self.sink.call()) {
            debug!("🔁 Nuevo Call para guild {}, reenganchando eventos", self.guild_id);
            attach_session_events(&call, self.guild_id, &self.sink.events, &self.status).await;
            self.sink.replace_call(call);
        }

        *self.status.lock() = SessionStatus::Ready;
        Ok(())
    }

    async fn destroy(&self) {
        self.sink.stop().await;
        *self.status.lock() = SessionStatus::Disconnected;

        if !self.owners.release(self.guild_id, self.generation) {
            debug!(
                "Sesión reemplazada en guild {}: se conserva la conexión",
                self.guild_id
            );
            return;
        }

        if let Err(e) = self.manager.remove(self.guild_id).await {
            // Ya no estaba conectado: nada que liberar
            debug!("Sesión de guild {} ya liberada: {:?}", self.guild_id, e);
        }
    }
}

struct SongbirdSink {
    call: Mutex<CallLock>,
    events: VoiceEventSender,
    next_id: AtomicU64,
    current: Mutex<Option<TrackHandle>>,
}

impl SongbirdSink {
    fn current(&self) -> Option<TrackHandle> {
        self.current.lock().clone()
    }

    fn call(&self) -> CallLock {
        self.call.lock().clone()
    }

    fn replace_call(&self, call: CallLock) {
        *self.call.lock() = call;
    }
}

#[async_trait]
impl AudioSink for SongbirdSink {
    async fn play(&self, stream: AudioStream) -> Result<Arc<dyn StreamHandle>> {
        let stream_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let origin = stream.origin();
        let input = into_input(stream);

        let call = self.call();
        let track = {
            let mut handler = call.lock().await;
            if let Some(previous) = self.current.lock().take() {
                let _ = previous.stop();
            }
            handler.play_input(input)
        };

        for (event, status) in [
            (TrackEvent::Play, SinkStatus::Playing),
            (TrackEvent::Pause, SinkStatus::Paused),
            (TrackEvent::End, SinkStatus::Idle),
            (TrackEvent::Error, SinkStatus::Error(String::new())),
        ] {
            track
                .add_event(
                    Event::Track(event),
                    TrackForwarder {
                        stream_id,
                        status,
                        events: self.events.clone(),
                    },
                )
                .context("No se pudieron registrar eventos del track")?;
        }

        debug!("🎶 Stream {} enviado al driver (origen: {})", stream_id, origin);
        *self.current.lock() = Some(track.clone());
        Ok(Arc::new(SongbirdHandle { stream_id, track }))
    }

    async fn pause(&self) -> bool {
        let Some(track) = self.current() else {
            return false;
        };
        match track.get_info().await {
            Ok(state) if matches!(state.playing, PlayMode::Play) => track.pause().is_ok(),
            _ => false,
        }
    }

    async fn unpause(&self) -> bool {
        let Some(track) = self.current() else {
            return false;
        };
        match track.get_info().await {
            Ok(state) if matches!(state.playing, PlayMode::Pause) => track.play().is_ok(),
            _ => false,
        }
    }

    async fn stop(&self) {
        if let Some(track) = self.current.lock().take() {
            let _ = track.stop();
        }
    }
}

/// Handler para eventos de un track concreto
struct TrackForwarder {
    stream_id: u64,
    status: SinkStatus,
    events: VoiceEventSender,
}

#[async_trait]
impl VoiceEventHandler for TrackForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let status = match (&self.status, ctx) {
            (SinkStatus::Error(_), EventContext::Track(track_list)) => {
                let reason = track_list
                    .iter()
                    .find_map(|(state, _handle)| match &state.playing {
                        PlayMode::Errored(e) => Some(format!("{:?}", e)),
                        _ => None,
                    })
                    .unwrap_or_else(|| "error desconocido del driver".to_string());
                error!("❌ Error en stream {}: {}", self.stream_id, reason);
                SinkStatus::Error(reason)
            }
            (status, _) => status.clone(),
        };

        let _ = self.events.send(VoiceEvent::Sink {
            stream_id: self.stream_id,
            status,
        });

        // El track ya terminó: no hace falta seguir escuchando
        if matches!(self.status, SinkStatus::Idle | SinkStatus::Error(_)) {
            Some(Event::Cancel)
        } else {
            None
        }
    }
}

struct SongbirdHandle {
    stream_id: u64,
    track: TrackHandle,
}

#[async_trait]
impl StreamHandle for SongbirdHandle {
    fn id(&self) -> u64 {
        self.stream_id
    }

    fn set_volume(&self, volume: f32) {
        if let Err(e) = self.track.set_volume(volume) {
            debug!("No se pudo ajustar volumen del stream {}: {:?}", self.stream_id, e);
        }
    }

    async fn position(&self) -> Option<Duration> {
        self.track.get_info().await.ok().map(|state| state.position)
    }
}

fn into_input(stream: AudioStream) -> Input {
    let (reader, encoding) = stream.into_parts();
    let mut hint = Hint::new();

    // El PCM crudo no se puede sondear: se antepone una cabecera WAV
    let prefix = match encoding {
        StreamEncoding::PcmS16Le {
            sample_rate,
            channels,
        } => {
            hint.with_extension("wav");
            wav_header(sample_rate, channels).to_vec()
        }
        StreamEncoding::Arbitrary => Vec::new(),
    };

    let source: Box<dyn MediaSource> = Box::new(BlockingReader::new(prefix, reader));
    Input::Live(
        LiveInput::Raw(songbird::input::AudioStream {
            input: source,
            hint: Some(hint),
        }),
        None,
    )
}

/// Streaming WAV header for s16le PCM of unknown length.
fn wav_header(sample_rate: u32, channels: u16) -> [u8; 44] {
    const UNKNOWN_LEN: u32 = u32::MAX;
    let block_align = channels * 2;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut header = [0u8; 44];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&UNKNOWN_LEN.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&16u16.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&UNKNOWN_LEN.to_le_bytes());
    header
}

/// Synchronous view over an async byte stream for the driver's decoder
/// threads. Not seekable.
struct BlockingReader {
    prefix: Cursor<Vec<u8>>,
    inner: Mutex<SyncIoBridge<ByteReader>>,
}

impl BlockingReader {
    /// Debe crearse dentro del runtime de tokio
    fn new(prefix: Vec<u8>, reader: ByteReader) -> Self {
        Self {
            prefix: Cursor::new(prefix),
            inner: Mutex::new(SyncIoBridge::new(reader)),
        }
    }
}

impl Read for BlockingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.prefix.read(buf)?;
        if n > 0 {
            return Ok(n);
        }
        self.inner.get_mut().read(buf)
    }
}

impl Seek for BlockingReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream de audio no soporta seek",
        ))
    }
}

impl MediaSource for BlockingReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
