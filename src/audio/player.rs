use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        events::{Notification, Notifier},
        queue::{Advance, GuildQueue, IdleTimer, LoopMode},
        registry::RegistryHandle,
        track::{TrackDescriptor, TrackInfo},
    },
    config::PlaybackSettings,
    error::{PlayerError, PlayerResult},
    voice::{
        SessionStatus, SinkStatus, TransportProvider, TransportSession, VoiceEvent,
        VoiceEventReceiver,
    },
};

/// Estado de la máquina de reproducción
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerState {
    Idle,
    Starting,
    Playing,
    Paused,
    ErrorRecovering,
}

/// Plain-data snapshot of a guild player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub guild_id: GuildId,
    pub state: PlayerState,
    pub tracks: Vec<TrackInfo>,
    pub current_track: Option<TrackInfo>,
    pub playing: bool,
    pub loop_mode: LoopMode,
    pub volume: f32,
    pub persist_connection: bool,
    pub session_status: Option<SessionStatus>,
    pub channel_id: Option<ChannelId>,
    pub idle_disconnect_pending: bool,
    pub total_duration: Duration,
}

struct Shared {
    queue: GuildQueue,
    state: PlayerState,
    /// A start or advance is in flight; other triggers are coalesced.
    busy: bool,
    /// The next sink idle comes from a skip and must leave the current track.
    skip_requested: bool,
    /// Bumped by every `stop()`; an advance started before it stays quiet.
    stops: u64,
    destroyed: bool,
}

struct PlayerInner {
    guild_id: GuildId,
    settings: PlaybackSettings,
    transport: Arc<dyn TransportProvider>,
    notifier: Notifier,
    registry: Option<RegistryHandle>,
    shared: Mutex<Shared>,
}

/// Playback engine of one guild.
///
/// Cloning is cheap: every clone drives the same queue. All transitions go
/// through a single async mutex per guild, and at most one start/advance is
/// in flight at any time. Sink and session events are consumed by a
/// dedicated task spawned on [`GuildPlayer::connect`].
#[derive(Clone)]
pub struct GuildPlayer {
    inner: Arc<PlayerInner>,
}

impl GuildPlayer {
    pub fn new(
        guild_id: GuildId,
        settings: PlaybackSettings,
        transport: Arc<dyn TransportProvider>,
        notifier: Notifier,
    ) -> Self {
        Self::build(guild_id, settings, transport, notifier, None)
    }

    pub(crate) fn with_registry(
        guild_id: GuildId,
        settings: PlaybackSettings,
        transport: Arc<dyn TransportProvider>,
        notifier: Notifier,
        registry: RegistryHandle,
    ) -> Self {
        Self::build(guild_id, settings, transport, notifier, Some(registry))
    }

    fn build(
        guild_id: GuildId,
        settings: PlaybackSettings,
        transport: Arc<dyn TransportProvider>,
        notifier: Notifier,
        registry: Option<RegistryHandle>,
    ) -> Self {
        debug!("🎛️ Creando reproductor para guild {}", guild_id);
        Self {
            inner: Arc::new(PlayerInner {
                guild_id,
                settings,
                transport,
                notifier,
                registry,
                shared: Mutex::new(Shared {
                    queue: GuildQueue::new(guild_id, &settings),
                    state: PlayerState::Idle,
                    busy: false,
                    skip_requested: false,
                    stops: 0,
                    destroyed: false,
                }),
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    pub(crate) fn same_as(&self, other: &GuildPlayer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Conecta al canal de voz; reutiliza la sesión si ya está en ese canal
    pub async fn connect(&self, channel_id: ChannelId) -> PlayerResult<()> {
        let inner = &self.inner;

        {
            let shared = inner.shared.lock().await;
            if shared.destroyed {
                return Err(destroyed_error());
            }
            if let Some(session) = shared.queue.session() {
                if session.channel_id() == channel_id
                    && session.status() != SessionStatus::Disconnected
                {
                    debug!("🔗 Ya conectado al canal {}", channel_id);
                    return Ok(());
                }
            }
        }

        info!("🔗 Conectando a canal de voz {} en guild {}", channel_id, inner.guild_id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let joined = tokio::time::timeout(
            inner.settings.join_timeout,
            inner.transport.join(inner.guild_id, channel_id, events_tx),
        )
        .await;

        let session = match joined {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                error!("❌ Error al unirse al canal {}: {:?}", channel_id, e);
                return Err(PlayerError::TransportJoinFailure {
                    channel_id,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                error!("⏰ Timeout al unirse al canal {}", channel_id);
                return Err(PlayerError::TransportJoinFailure {
                    channel_id,
                    reason: format!(
                        "la sesión no estuvo lista en {}",
                        humantime::format_duration(inner.settings.join_timeout)
                    ),
                });
            }
        };

        let previous = {
            let mut shared = inner.shared.lock().await;
            if shared.destroyed {
                drop(shared);
                session.destroy().await;
                return Err(destroyed_error());
            }

            let previous = shared.queue.take_session();
            if previous.is_some() && !shared.busy {
                // El stream anterior muere con la sesión vieja
                shared.queue.take_active_stream();
                shared.queue.set_playing(false);
                shared.state = PlayerState::Idle;
            }
            // Los eventos se procesan solo mientras esta sesión siga adjunta
            tokio::spawn(run_events(
                Arc::downgrade(inner),
                Arc::downgrade(&session),
                events_rx,
            ));
            shared.queue.attach_session(session);
            inner.refresh_idle_timer(&mut shared);
            inner.start_if_idle(&mut shared);
            previous
        };

        if let Some(previous) = previous {
            previous.destroy().await;
        }

        info!("✅ Conectado a canal de voz {}", channel_id);
        Ok(())
    }

    /// Agrega un track; si la cola estaba parada, arranca la reproducción
    pub async fn enqueue(&self, track: TrackDescriptor) -> PlayerResult<usize> {
        let mut shared = self.lock_alive().await?;
        let position = shared.queue.push(track)?;
        self.inner.refresh_idle_timer(&mut shared);
        self.inner.start_if_idle(&mut shared);
        Ok(position)
    }

    /// Agrega una playlist completa; devuelve cuántos tracks entraron
    pub async fn enqueue_many(&self, tracks: Vec<TrackDescriptor>) -> PlayerResult<usize> {
        let mut shared = self.lock_alive().await?;
        let added = shared.queue.extend(tracks);
        self.inner.refresh_idle_timer(&mut shared);
        self.inner.start_if_idle(&mut shared);
        Ok(added)
    }

    /// Salta el track actual. Con loop de canción igual avanza.
    pub async fn skip(&self) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };

        let streaming = shared.queue.active_stream().is_some()
            && matches!(shared.state, PlayerState::Playing | PlayerState::Paused);

        if streaming {
            let Some(sink) = shared.queue.session().map(|session| session.subscribe()) else {
                return false;
            };
            shared.skip_requested = true;
            drop(shared);

            info!("⏭️ Saltando track actual");
            sink.stop().await;
            return true;
        }

        if shared.busy || shared.queue.is_empty() {
            return false;
        }

        // Sin stream activo (p. ej. sin sesión): se avanza directamente
        if shared.queue.advance(true) == Advance::Ended {
            self.inner.refresh_idle_timer(&mut shared);
        }
        self.inner.start_if_idle(&mut shared);
        true
    }

    pub async fn pause(&self) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        if shared.state != PlayerState::Playing || shared.busy {
            return false;
        }
        let Some(sink) = shared.queue.session().map(|session| session.subscribe()) else {
            return false;
        };

        if !sink.pause().await {
            return false;
        }

        shared.state = PlayerState::Paused;
        shared.queue.set_playing(false);
        info!("⏸️ Reproducción pausada");
        true
    }

    pub async fn resume(&self) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        if shared.state != PlayerState::Paused || shared.busy {
            return false;
        }
        let Some(sink) = shared.queue.session().map(|session| session.subscribe()) else {
            return false;
        };

        if !sink.unpause().await {
            return false;
        }

        shared.state = PlayerState::Playing;
        shared.queue.set_playing(true);
        info!("▶️ Reproducción reanudada");
        true
    }

    /// Detiene todo y vacía la cola. Sin modo 24/7 también libera la sesión
    /// y saca la cola del registro.
    pub async fn stop(&self) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };

        shared.queue.clear();
        shared.skip_requested = false;
        shared.stops = shared.stops.wrapping_add(1);
        let was_streaming = shared.queue.take_active_stream().is_some();
        let sink = shared.queue.session().map(|session| session.subscribe());
        if !shared.busy {
            shared.state = PlayerState::Idle;
        }

        if shared.queue.persist_connection() {
            self.inner.refresh_idle_timer(&mut shared);
            drop(shared);
            if let (true, Some(sink)) = (was_streaming, sink) {
                sink.stop().await;
            }
            info!("⏹️ Reproducción detenida (modo 24/7, se mantiene la conexión)");
            return true;
        }

        let session = self.inner.teardown(&mut shared);
        drop(shared);
        info!("⏹️ Reproducción detenida en guild {}", self.inner.guild_id);
        self.inner.finish_teardown(session).await;
        true
    }

    /// Volumen en porcentaje (0-100); devuelve la fracción aplicada
    pub async fn set_volume(&self, percent: i64) -> f32 {
        let mut shared = self.inner.shared.lock().await;
        shared.queue.set_volume_percent(percent)
    }

    /// Ajuste relativo (los botones de volumen usan ±10)
    pub async fn adjust_volume(&self, delta: i64) -> f32 {
        let mut shared = self.inner.shared.lock().await;
        let target = shared.queue.volume_percent() + delta;
        shared.queue.set_volume_percent(target)
    }

    pub async fn set_loop_mode(&self, mode: LoopMode) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        shared.queue.set_loop_mode(mode);
        true
    }

    pub async fn shuffle(&self) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        shared.queue.shuffle_upcoming()
    }

    /// Mueve un track (posiciones 1-based desde la siguiente canción)
    pub async fn move_track(&self, from: usize, to: usize) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        match shared.queue.move_track(from, to) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    pub async fn remove(&self, index: usize) -> Option<TrackDescriptor> {
        let mut shared = self.lock_alive().await.ok()?;
        shared.queue.remove(index).ok()
    }

    /// Limpia las canciones pendientes; la actual sigue sonando
    pub async fn clear(&self) -> usize {
        let Ok(mut shared) = self.lock_alive().await else {
            return 0;
        };
        shared.queue.clear_upcoming()
    }

    /// Re-resuelve el track actual desde `offset`. Si falla, el track se
    /// reinicia desde el principio y se devuelve `false`.
    pub async fn seek(&self, offset: Duration) -> bool {
        let inner = &self.inner;

        let (track, session) = {
            let Ok(mut shared) = self.lock_alive().await else {
                return false;
            };
            if shared.busy || !matches!(shared.state, PlayerState::Playing | PlayerState::Paused) {
                return false;
            }
            let (Some(track), Some(session)) = (
                shared.queue.current().cloned(),
                shared.queue.session().cloned(),
            ) else {
                return false;
            };
            if track.duration().is_some_and(|duration| offset >= duration) {
                debug!("⏩ Offset {:?} fuera de la duración de {}", offset, track.title());
                return false;
            }

            shared.busy = true;
            shared.state = PlayerState::Starting;
            (track, session)
        };

        info!("⏩ Buscando {} en {}", humantime::format_duration(offset), track.title());
        let resolved = track.open_stream(offset).await;

        let mut shared = inner.shared.lock().await;
        if !shared.is_current(&track, &session) {
            drop(shared);
            inner.clone().resume_drive().await;
            return false;
        }

        let failure = match resolved {
            Ok(stream) => match session.subscribe().play(stream).await {
                Ok(handle) => {
                    shared.queue.set_active_stream(handle);
                    shared.queue.set_playing(true);
                    shared.state = PlayerState::Playing;
                    shared.busy = false;
                    return true;
                }
                Err(e) => PlayerError::SinkFault(e.to_string()),
            },
            Err(e) => e,
        };

        warn!("⚠️ Seek falló para {}: {}, reiniciando track", track.title(), failure);
        drop(shared);
        inner.clone().resume_drive().await;
        false
    }

    pub async fn set_persist_connection(&self, persist: bool) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        shared.queue.set_persist_connection(persist);
        self.inner.refresh_idle_timer(&mut shared);
        true
    }

    /// Alterna el modo 24/7; devuelve el nuevo valor
    pub async fn toggle_persist_connection(&self) -> Option<bool> {
        let mut shared = self.lock_alive().await.ok()?;
        let persist = !shared.queue.persist_connection();
        shared.queue.set_persist_connection(persist);
        self.inner.refresh_idle_timer(&mut shared);
        Some(persist)
    }

    /// Tiempo transcurrido del stream activo
    pub async fn position(&self) -> Option<Duration> {
        let handle = {
            let shared = self.inner.shared.lock().await;
            shared.queue.active_stream().cloned()?
        };
        handle.position().await
    }

    pub async fn status(&self) -> QueueStatus {
        let shared = self.inner.shared.lock().await;
        let queue = &shared.queue;
        QueueStatus {
            guild_id: self.inner.guild_id,
            state: shared.state,
            tracks: queue.track_infos(),
            current_track: queue.current().map(|track| track.info().clone()),
            playing: queue.playing(),
            loop_mode: queue.loop_mode(),
            volume: queue.volume(),
            persist_connection: queue.persist_connection(),
            session_status: queue.session().map(|session| session.status()),
            channel_id: queue.channel_id(),
            idle_disconnect_pending: queue.idle_timer_armed(),
            total_duration: queue.total_duration(),
        }
    }

    pub async fn is_destroyed(&self) -> bool {
        self.inner.shared.lock().await.destroyed
    }

    /// Libera la sesión y sale del registro; `false` si ya estaba destruida
    pub async fn destroy(&self) -> bool {
        let Ok(mut shared) = self.lock_alive().await else {
            return false;
        };
        let session = self.inner.teardown(&mut shared);
        drop(shared);
        self.inner.finish_teardown(session).await;
        true
    }

    async fn lock_alive(&self) -> PlayerResult<MutexGuard<'_, Shared>> {
        let shared = self.inner.shared.lock().await;
        if shared.destroyed {
            return Err(destroyed_error());
        }
        Ok(shared)
    }
}

impl fmt::Debug for GuildPlayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuildPlayer")
            .field("guild_id", &self.inner.guild_id)
            .finish_non_exhaustive()
    }
}

fn destroyed_error() -> PlayerError {
    PlayerError::InvalidOperation("la cola de este servidor ya fue destruida".to_string())
}

impl Shared {
    /// The head and the session are still the ones a pending start captured.
    fn is_current(&self, track: &TrackDescriptor, session: &Arc<dyn TransportSession>) -> bool {
        !self.destroyed
            && self.queue.current().is_some_and(|head| head.same_as(track))
            && self
                .queue
                .session()
                .is_some_and(|current| Arc::ptr_eq(current, session))
    }
}

impl PlayerInner {
    /// Arranca la reproducción si nada está en curso
    fn start_if_idle(self: &Arc<Self>, shared: &mut Shared) {
        if shared.busy
            || shared.state != PlayerState::Idle
            || shared.queue.is_empty()
            || shared.queue.session().is_none()
        {
            return;
        }

        shared.busy = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drive().await });
    }

    /// Continues a transition that already holds the guard.
    async fn resume_drive(self: Arc<Self>) {
        tokio::spawn(async move { self.drive().await });
    }

    /// Starts `tracks[0]`, skipping tracks that cannot be resolved.
    ///
    /// Must be entered with `busy` set; always leaves it cleared.
    async fn drive(self: Arc<Self>) {
        loop {
            let (track, session) = {
                let mut shared = self.shared.lock().await;
                if shared.destroyed {
                    shared.busy = false;
                    return;
                }

                let (Some(track), Some(session)) = (
                    shared.queue.current().cloned(),
                    shared.queue.session().cloned(),
                ) else {
                    shared.busy = false;
                    shared.state = PlayerState::Idle;
                    shared.queue.set_playing(false);
                    self.refresh_idle_timer(&mut shared);
                    return;
                };

                // Se reanuda con el evento Ready de la sesión
                if session.status() != SessionStatus::Ready {
                    debug!(
                        "⏸️ Sesión de voz no lista ({:?}), {} queda en espera",
                        session.status(),
                        track.title()
                    );
                    shared.busy = false;
                    shared.state = PlayerState::Idle;
                    shared.queue.set_playing(false);
                    return;
                }

                shared.state = PlayerState::Starting;
                (track, session)
            };

            debug!("🔍 Resolviendo stream para: {}", track.title());
            let resolved = track.open_stream(Duration::ZERO).await;

            let failure = {
                let mut shared = self.shared.lock().await;
                if !shared.is_current(&track, &session) {
                    debug!("🔄 La cola cambió durante la resolución, reintentando");
                    continue;
                }

                let failure = match resolved {
                    Ok(stream) => {
                        let origin = stream.origin();
                        match session.subscribe().play(stream).await {
                            Ok(handle) => {
                                shared.queue.set_active_stream(handle);
                                shared.queue.set_playing(true);
                                shared.queue.cancel_idle_timer();
                                shared.state = PlayerState::Playing;
                                shared.busy = false;

                                info!("🎵 Reproduciendo: {} (vía {})", track.title(), origin);
                                self.notifier.send(Notification::NowPlaying {
                                    guild_id: self.guild_id,
                                    track: track.info().clone(),
                                });
                                return;
                            }
                            Err(e) => PlayerError::SinkFault(e.to_string()),
                        }
                    }
                    Err(e) => e,
                };

                warn!("⚠️ No se pudo reproducir {}: {}", track.title(), failure);
                self.notifier.send(Notification::TrackFailed {
                    guild_id: self.guild_id,
                    track: track.info().clone(),
                    reason: failure.to_string(),
                });
                shared.queue.pop_current();

                if shared.queue.is_empty() {
                    shared.busy = false;
                    shared.state = PlayerState::Idle;
                    self.refresh_idle_timer(&mut shared);
                    info!("📭 Cola terminada en guild {}", self.guild_id);
                    self.notifier.send(Notification::QueueEnded {
                        guild_id: self.guild_id,
                    });
                    return;
                }

                shared.state = PlayerState::ErrorRecovering;
                failure
            };

            debug!("⏳ Reintentando con el siguiente track tras: {}", failure);
            tokio::time::sleep(self.settings.retry_backoff).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: VoiceEvent) {
        match event {
            VoiceEvent::Sink { stream_id, status } => self.handle_sink(stream_id, status).await,
            VoiceEvent::Session(SessionStatus::Disconnected) => self.handle_disconnect().await,
            VoiceEvent::Session(SessionStatus::Ready) => self.handle_ready().await,
            VoiceEvent::Session(status) => {
                debug!("📡 Sesión de voz en guild {}: {:?}", self.guild_id, status)
            }
        }
    }

    async fn handle_sink(self: &Arc<Self>, stream_id: u64, status: SinkStatus) {
        let mut shared = self.shared.lock().await;
        if shared.destroyed {
            return;
        }
        if !shared.queue.is_active_stream(stream_id) {
            debug!("🗑️ Evento de stream {} descartado: {:?}", stream_id, status);
            return;
        }

        match status {
            SinkStatus::Playing => {
                shared.queue.set_playing(true);
                shared.queue.cancel_idle_timer();
                if !shared.busy {
                    shared.state = PlayerState::Playing;
                }
            }
            SinkStatus::Paused => {
                shared.queue.set_playing(false);
                if !shared.busy {
                    shared.state = PlayerState::Paused;
                }
            }
            SinkStatus::Buffering => debug!("⏳ Buffering en guild {}", self.guild_id),
            SinkStatus::Idle => {
                if shared.busy {
                    debug!("🔒 Transición en curso, fin de stream ignorado");
                    return;
                }

                shared.busy = true;
                shared.queue.take_active_stream();
                shared.queue.set_playing(false);
                let force = std::mem::take(&mut shared.skip_requested);
                let stops = shared.stops;
                drop(shared);

                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.advance_after_idle(force, stops).await });
            }
            SinkStatus::Error(reason) => {
                if shared.busy {
                    debug!("🔒 Transición en curso, error de stream ignorado: {}", reason);
                    return;
                }

                error!("❌ Error en el reproductor de guild {}: {}", self.guild_id, reason);
                shared.busy = true;
                shared.skip_requested = false;
                shared.state = PlayerState::ErrorRecovering;
                shared.queue.take_active_stream();

                // Un track que falla nunca se repite, aunque haya loop
                if let Some(failed) = shared.queue.pop_current() {
                    self.notifier.send(Notification::TrackFailed {
                        guild_id: self.guild_id,
                        track: failed.info().clone(),
                        reason: PlayerError::SinkFault(reason.clone()).to_string(),
                    });
                }

                if shared.queue.is_empty() {
                    shared.busy = false;
                    shared.state = PlayerState::Idle;
                    self.refresh_idle_timer(&mut shared);
                    self.notifier.send(Notification::PlaybackFailed {
                        guild_id: self.guild_id,
                        reason,
                    });
                    return;
                }
                drop(shared);

                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(inner.settings.retry_backoff).await;
                    inner.drive().await;
                });
            }
        }
    }

    async fn advance_after_idle(self: Arc<Self>, force: bool, stops: u64) {
        tokio::time::sleep(self.settings.advance_delay).await;

        let mut shared = self.shared.lock().await;
        if shared.destroyed {
            shared.busy = false;
            return;
        }

        match shared.queue.advance(force) {
            Advance::Replay | Advance::Next => {
                drop(shared);
                self.drive().await;
            }
            Advance::Ended => {
                shared.busy = false;
                shared.state = PlayerState::Idle;
                self.refresh_idle_timer(&mut shared);
                if shared.stops != stops {
                    debug!("⏹️ Cola vaciada por stop en guild {}", self.guild_id);
                    return;
                }
                info!("📭 Cola terminada en guild {}", self.guild_id);
                self.notifier.send(Notification::QueueEnded {
                    guild_id: self.guild_id,
                });
            }
        }
    }

    /// One bounded reconnect attempt, then teardown.
    async fn handle_disconnect(self: &Arc<Self>) {
        let session = {
            let shared = self.shared.lock().await;
            if shared.destroyed {
                return;
            }
            match shared.queue.session() {
                Some(session) => Arc::clone(session),
                None => return,
            }
        };

        warn!("🔌 Conexión de voz perdida en guild {}, reintentando", self.guild_id);
        let reason = match tokio::time::timeout(
            self.settings.reconnect_timeout,
            session.reconnect(),
        )
        .await
        {
            Ok(Ok(())) => {
                info!("🔗 Reconectado en guild {}", self.guild_id);
                self.handle_ready().await;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "la reconexión excedió el tiempo límite".to_string(),
        };

        let mut shared = self.shared.lock().await;
        let still_attached = shared
            .queue
            .session()
            .is_some_and(|current| Arc::ptr_eq(current, &session));
        if shared.destroyed || !still_attached {
            return;
        }

        let failure = PlayerError::TransportDisconnected { reason };
        error!("❌ {} (guild {})", failure, self.guild_id);
        let session = self.teardown(&mut shared);
        drop(shared);
        self.finish_teardown(session).await;
        self.notifier.send(Notification::SessionLost {
            guild_id: self.guild_id,
            reason: failure.to_string(),
        });
    }

    /// Arranca lo que esperaba a que la sesión estuviera lista
    async fn handle_ready(self: &Arc<Self>) {
        let mut shared = self.shared.lock().await;
        if shared.destroyed {
            return;
        }
        debug!("📡 Sesión de voz lista en guild {}", self.guild_id);
        self.start_if_idle(&mut shared);
    }

    /// Arma o cancela el temporizador de inactividad según el estado actual
    fn refresh_idle_timer(self: &Arc<Self>, shared: &mut Shared) {
        if !shared.queue.should_arm_idle_timer() {
            shared.queue.cancel_idle_timer();
            return;
        }
        if shared.queue.idle_timer_armed() {
            return;
        }

        let timeout = self.settings.idle_timeout;
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.reclaim_idle().await;
            }
        });

        debug!(
            "⏱️ Desconexión por inactividad en {} para guild {}",
            humantime::format_duration(timeout),
            self.guild_id
        );
        shared.queue.set_idle_timer(IdleTimer::new(handle));
    }

    async fn reclaim_idle(self: &Arc<Self>) {
        let mut shared = self.shared.lock().await;
        // Se suelta antes del teardown para no abortar esta misma tarea
        shared.queue.release_idle_timer();
        if shared.destroyed || !shared.queue.should_arm_idle_timer() {
            return;
        }

        info!("👋 Desconectando guild {} por inactividad", self.guild_id);
        let session = self.teardown(&mut shared);
        drop(shared);
        self.finish_teardown(session).await;
        self.notifier.send(Notification::IdleDisconnect {
            guild_id: self.guild_id,
        });
    }

    /// Marks the queue destroyed, leaves the registry and hands back the
    /// session to release.
    fn teardown(self: &Arc<Self>, shared: &mut Shared) -> Option<Arc<dyn TransportSession>> {
        if let Some(registry) = &self.registry {
            registry.detach(&GuildPlayer {
                inner: Arc::clone(self),
            });
        }
        shared.destroyed = true;
        shared.skip_requested = false;
        shared.state = PlayerState::Idle;
        shared.queue.cancel_idle_timer();
        shared.queue.clear();
        shared.queue.take_active_stream();
        shared.queue.take_session()
    }

    async fn finish_teardown(&self, session: Option<Arc<dyn TransportSession>>) {
        if let Some(session) = session {
            session.destroy().await;
        }
        info!("🧹 Cola de guild {} destruida", self.guild_id);
    }
}

/// Consume los eventos de voz de una sesión, en orden, mientras siga
/// siendo la sesión adjunta a la cola
async fn run_events(
    player: Weak<PlayerInner>,
    session: Weak<dyn TransportSession>,
    mut events: VoiceEventReceiver,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = player.upgrade() else {
            break;
        };
        {
            let shared = inner.shared.lock().await;
            let attached = session.upgrade().is_some_and(|session| {
                shared
                    .queue
                    .session()
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
            });
            if shared.destroyed || !attached {
                break;
            }
        }
        inner.handle_event(event).await;
    }
    debug!("📪 Canal de eventos de voz cerrado");
}
