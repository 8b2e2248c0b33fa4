use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{collections::VecDeque, fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    audio::track::{TrackDescriptor, TrackInfo},
    config::PlaybackSettings,
    error::{PlayerError, PlayerResult},
    voice::{StreamHandle, TransportSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl FromStr for LoopMode {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "track" | "song" => Ok(Self::Track),
            "queue" => Ok(Self::Queue),
            other => Err(PlayerError::InvalidOperation(format!(
                "modo de repetición desconocido: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Track => "track",
            Self::Queue => "queue",
        })
    }
}

/// Result of advancing the queue after the current track finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Play `tracks[0]` again without dequeuing it.
    Replay,
    /// The head changed; play the new `tracks[0]`.
    Next,
    /// Nothing left to play.
    Ended,
}

/// Scheduled idle reclamation. Dropping it cancels the task.
pub(crate) struct IdleTimer(Option<JoinHandle<()>>);

impl IdleTimer {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self(Some(handle))
    }

    /// Se suelta sin abortar: la usa la propia tarea del temporizador
    pub(crate) fn release(mut self) {
        self.0.take();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Mutable playback state of one guild.
///
/// `tracks[0]` is the track currently playing (or about to play); every
/// 1-based index used by [`GuildQueue::move_track`] and
/// [`GuildQueue::remove`] counts from the next song.
pub struct GuildQueue {
    guild_id: GuildId,
    tracks: VecDeque<TrackDescriptor>,
    playing: bool,
    loop_mode: LoopMode,
    volume: f32,
    persist_connection: bool,
    session: Option<Arc<dyn TransportSession>>,
    idle_timer: Option<IdleTimer>,
    active_stream: Option<Arc<dyn StreamHandle>>,
    max_size: usize,
}

impl GuildQueue {
    pub fn new(guild_id: GuildId, settings: &PlaybackSettings) -> Self {
        Self {
            guild_id,
            tracks: VecDeque::new(),
            playing: false,
            loop_mode: LoopMode::Off,
            volume: settings.default_volume.clamp(0.0, 1.0),
            persist_connection: settings.persist_connection,
            session: None,
            idle_timer: None,
            active_stream: None,
            max_size: settings.max_queue_size,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Agrega un track al final; devuelve su posición (0 = suena ahora)
    pub fn push(&mut self, track: TrackDescriptor) -> PlayerResult<usize> {
        if self.tracks.len() >= self.max_size {
            return Err(PlayerError::InvalidOperation(format!(
                "La cola está llena (máximo {} canciones)",
                self.max_size
            )));
        }

        info!("➕ Agregado a la cola: {}", track.title());
        self.tracks.push_back(track);
        Ok(self.tracks.len() - 1)
    }

    /// Agrega varios tracks (playlist) respetando la capacidad
    pub fn extend(&mut self, tracks: Vec<TrackDescriptor>) -> usize {
        let available = self.max_size.saturating_sub(self.tracks.len());
        let to_add = tracks.len().min(available);
        self.tracks.extend(tracks.into_iter().take(to_add));
        info!("➕ Agregadas {} canciones a la cola", to_add);
        to_add
    }

    pub fn current(&self) -> Option<&TrackDescriptor> {
        self.tracks.front()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackDescriptor> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drops the current track.
    pub fn pop_current(&mut self) -> Option<TrackDescriptor> {
        let popped = self.tracks.pop_front();
        if self.tracks.is_empty() {
            self.playing = false;
        }
        popped
    }

    /// Applies the loop rules after the current track ended.
    ///
    /// `force` comes from an explicit skip: it leaves the current track even
    /// in [`LoopMode::Track`]. A single track in [`LoopMode::Queue`] is
    /// replayed in place so the queue never looks empty.
    pub fn advance(&mut self, force: bool) -> Advance {
        if self.tracks.is_empty() {
            self.playing = false;
            return Advance::Ended;
        }

        match self.loop_mode {
            LoopMode::Track if !force => {
                debug!("🔂 Repitiendo track: {}", self.tracks[0].title());
                return Advance::Replay;
            }
            LoopMode::Queue if self.tracks.len() == 1 => {
                debug!("🔁 Loop de cola con un solo track, repitiendo");
                return Advance::Replay;
            }
            _ => {}
        }

        let finished = self.tracks.pop_front();
        if let (LoopMode::Queue, Some(track)) = (self.loop_mode, finished) {
            debug!("🔁 Track agregado al final por loop de cola: {}", track.title());
            self.tracks.push_back(track);
        }

        if self.tracks.is_empty() {
            self.playing = false;
            info!("📭 Cola vacía, no hay siguiente track");
            Advance::Ended
        } else {
            Advance::Next
        }
    }

    /// Limpia las canciones pendientes (el track actual se conserva)
    pub fn clear_upcoming(&mut self) -> usize {
        let removed = self.tracks.len().saturating_sub(1);
        self.tracks.truncate(1);
        if removed > 0 {
            info!("🗑️ Cola limpiada: {} tracks removidos", removed);
        }
        removed
    }

    /// Removes every track, the current one included.
    pub fn clear(&mut self) -> usize {
        let removed = self.tracks.len();
        self.tracks.clear();
        self.playing = false;
        removed
    }

    /// Mezcla las canciones pendientes; el track actual nunca se mueve
    pub fn shuffle_upcoming(&mut self) -> bool {
        self.shuffle_upcoming_with(&mut rand::thread_rng())
    }

    pub fn shuffle_upcoming_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        if self.tracks.len() <= 2 {
            return false;
        }

        // Fisher-Yates sobre tracks[1..]
        self.tracks.make_contiguous()[1..].shuffle(rng);
        info!("🔀 Cola mezclada ({} pendientes)", self.tracks.len() - 1);
        true
    }

    /// Moves the song at 1-based `from` to 1-based `to`.
    pub fn move_track(&mut self, from: usize, to: usize) -> PlayerResult<()> {
        self.check_upcoming_index(from)?;
        self.check_upcoming_index(to)?;

        if from != to {
            let track = self
                .tracks
                .remove(from)
                .ok_or_else(|| PlayerError::InvalidOperation("No se pudo mover el track".into()))?;
            self.tracks.insert(to, track);
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Removes the song at 1-based `index`.
    pub fn remove(&mut self, index: usize) -> PlayerResult<TrackDescriptor> {
        self.check_upcoming_index(index)?;
        let track = self
            .tracks
            .remove(index)
            .ok_or_else(|| PlayerError::InvalidOperation("No se pudo remover el track".into()))?;
        debug!("❌ Track eliminado en posición {}", index);
        Ok(track)
    }

    fn check_upcoming_index(&self, index: usize) -> PlayerResult<()> {
        if index == 0 || index >= self.tracks.len() {
            return Err(PlayerError::InvalidOperation(format!(
                "Posición inválida {}: la cola tiene {} canciones pendientes",
                index,
                self.tracks.len().saturating_sub(1)
            )));
        }
        Ok(())
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Track and queue looping are exclusive; setting one replaces the other.
    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn loop_track(&self) -> bool {
        self.loop_mode == LoopMode::Track
    }

    pub fn loop_queue(&self) -> bool {
        self.loop_mode == LoopMode::Queue
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the volume from a 0..=100 percentage and applies it to the
    /// active stream. Returns the applied fraction.
    pub fn set_volume_percent(&mut self, percent: i64) -> f32 {
        let volume = percent.clamp(0, 100) as f32 / 100.0;
        self.volume = volume;
        if let Some(stream) = &self.active_stream {
            stream.set_volume(volume);
        }
        info!("🔊 Volumen ajustado a {}%", percent.clamp(0, 100));
        volume
    }

    pub fn volume_percent(&self) -> i64 {
        (self.volume * 100.0).round() as i64
    }

    pub fn playing(&self) -> bool {
        self.playing
    }

    pub fn set_playing(&mut self, playing: bool) {
        // Sin tracks nunca se está reproduciendo
        self.playing = playing && !self.tracks.is_empty();
    }

    pub fn persist_connection(&self) -> bool {
        self.persist_connection
    }

    pub fn set_persist_connection(&mut self, persist: bool) {
        self.persist_connection = persist;
        info!(
            "🕒 Modo 24/7 {} en guild {}",
            if persist { "activado" } else { "desactivado" },
            self.guild_id
        );
    }

    pub fn session(&self) -> Option<&Arc<dyn TransportSession>> {
        self.session.as_ref()
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.session.as_ref().map(|session| session.channel_id())
    }

    pub(crate) fn attach_session(&mut self, session: Arc<dyn TransportSession>) {
        self.session = Some(session);
    }

    pub(crate) fn take_session(&mut self) -> Option<Arc<dyn TransportSession>> {
        self.session.take()
    }

    pub fn active_stream(&self) -> Option<&Arc<dyn StreamHandle>> {
        self.active_stream.as_ref()
    }

    pub(crate) fn set_active_stream(&mut self, stream: Arc<dyn StreamHandle>) {
        stream.set_volume(self.volume);
        self.active_stream = Some(stream);
    }

    pub(crate) fn take_active_stream(&mut self) -> Option<Arc<dyn StreamHandle>> {
        self.active_stream.take()
    }

    /// `true` when the id belongs to the stream currently attached.
    pub fn is_active_stream(&self, stream_id: u64) -> bool {
        self.active_stream
            .as_ref()
            .is_some_and(|stream| stream.id() == stream_id)
    }

    /// Empty, not in 24/7 mode and still holding a session.
    pub fn should_arm_idle_timer(&self) -> bool {
        self.tracks.is_empty() && !self.persist_connection && self.session.is_some()
    }

    pub fn idle_timer_armed(&self) -> bool {
        self.idle_timer.is_some()
    }

    pub(crate) fn set_idle_timer(&mut self, timer: IdleTimer) {
        // El anterior se aborta al soltarse
        self.idle_timer = Some(timer);
    }

    pub(crate) fn cancel_idle_timer(&mut self) {
        if self.idle_timer.take().is_some() {
            debug!("⏱️ Temporizador de inactividad cancelado en guild {}", self.guild_id);
        }
    }

    pub(crate) fn release_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.release();
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.tracks.iter().filter_map(|track| track.duration()).sum()
    }

    pub fn track_infos(&self) -> Vec<TrackInfo> {
        self.tracks.iter().map(|track| track.info().clone()).collect()
    }
}

impl fmt::Debug for GuildQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuildQueue")
            .field("guild_id", &self.guild_id)
            .field("tracks", &self.tracks)
            .field("playing", &self.playing)
            .field("loop_mode", &self.loop_mode)
            .field("volume", &self.volume)
            .field("persist_connection", &self.persist_connection)
            .field("session", &self.session.is_some())
            .field("idle_timer", &self.idle_timer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::track;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn queue_with(titles: &[&str]) -> GuildQueue {
        let mut queue = GuildQueue::new(GuildId::new(1), &PlaybackSettings::default());
        for title in titles {
            queue.push(track(title)).unwrap();
        }
        queue
    }

    fn titles(queue: &GuildQueue) -> Vec<String> {
        queue.tracks().map(|t| t.title().to_string()).collect()
    }

    #[test]
    fn push_is_fifo_and_reports_position() {
        let mut queue = queue_with(&[]);
        assert_eq!(queue.push(track("a")).unwrap(), 0);
        assert_eq!(queue.push(track("b")).unwrap(), 1);
        assert_eq!(queue.push(track("c")).unwrap(), 2);
        assert_eq!(titles(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.current().unwrap().title(), "a");
    }

    #[test]
    fn push_rejects_full_queue_without_mutating() {
        let settings = PlaybackSettings {
            max_queue_size: 2,
            ..PlaybackSettings::default()
        };
        let mut queue = GuildQueue::new(GuildId::new(1), &settings);
        queue.push(track("a")).unwrap();
        queue.push(track("b")).unwrap();
        assert!(matches!(
            queue.push(track("c")),
            Err(PlayerError::InvalidOperation(_))
        ));
        assert_eq!(titles(&queue), vec!["a", "b"]);
        assert_eq!(queue.extend(vec![track("d")]), 0);
    }

    #[test]
    fn shuffle_never_moves_current_track() {
        let mut queue = queue_with(&["now", "a", "b", "c", "d", "e", "f"]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert!(queue.shuffle_upcoming_with(&mut rng));
            assert_eq!(queue.current().unwrap().title(), "now");
        }
        let mut rest = titles(&queue)[1..].to_vec();
        rest.sort();
        assert_eq!(rest, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn shuffle_needs_two_upcoming_tracks() {
        let mut queue = queue_with(&["now", "a"]);
        assert!(!queue.shuffle_upcoming());
        assert_eq!(titles(&queue), vec!["now", "a"]);
    }

    #[test]
    fn move_swaps_queued_tracks_without_touching_current() {
        let mut queue = queue_with(&["now", "a", "b"]);
        queue.move_track(2, 1).unwrap();
        assert_eq!(titles(&queue), vec!["now", "b", "a"]);
    }

    #[test]
    fn move_and_remove_reject_current_and_out_of_range() {
        let mut queue = queue_with(&["now", "a", "b"]);
        assert!(queue.move_track(0, 1).is_err());
        assert!(queue.move_track(1, 3).is_err());
        assert!(queue.remove(0).is_err());
        assert!(queue.remove(3).is_err());
        assert_eq!(titles(&queue), vec!["now", "a", "b"]);

        let removed = queue.remove(1).unwrap();
        assert_eq!(removed.title(), "a");
        assert_eq!(titles(&queue), vec!["now", "b"]);
    }

    #[test]
    fn loop_modes_are_exclusive() {
        let mut queue = queue_with(&["a"]);
        queue.set_loop_mode(LoopMode::Track);
        assert!(queue.loop_track() && !queue.loop_queue());
        queue.set_loop_mode(LoopMode::Queue);
        assert!(queue.loop_queue() && !queue.loop_track());
        queue.set_loop_mode(LoopMode::Off);
        assert!(!queue.loop_queue() && !queue.loop_track());
    }

    #[test]
    fn loop_mode_parses_user_input() {
        assert_eq!("Track".parse::<LoopMode>().unwrap(), LoopMode::Track);
        assert_eq!(" queue ".parse::<LoopMode>().unwrap(), LoopMode::Queue);
        assert_eq!("off".parse::<LoopMode>().unwrap(), LoopMode::Off);
        assert!("forever".parse::<LoopMode>().is_err());
    }

    #[test]
    fn volume_round_trips_as_fraction() {
        let mut queue = queue_with(&[]);
        assert_eq!(queue.set_volume_percent(50), 0.5);
        assert_eq!(queue.volume(), 0.5);
        assert_eq!(queue.set_volume_percent(250), 1.0);
        assert_eq!(queue.set_volume_percent(-3), 0.0);
        assert_eq!(queue.volume_percent(), 0);
    }

    #[test]
    fn advance_without_loop_dequeues() {
        let mut queue = queue_with(&["a", "b"]);
        assert_eq!(queue.advance(false), Advance::Next);
        assert_eq!(titles(&queue), vec!["b"]);
        assert_eq!(queue.advance(false), Advance::Ended);
        assert!(queue.is_empty());
        assert!(!queue.playing());
    }

    #[test]
    fn advance_with_loop_track_replays_unless_forced() {
        let mut queue = queue_with(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        assert_eq!(queue.advance(false), Advance::Replay);
        assert_eq!(titles(&queue), vec!["a", "b"]);
        assert_eq!(queue.advance(true), Advance::Next);
        assert_eq!(titles(&queue), vec!["b"]);
    }

    #[test]
    fn advance_with_loop_queue_requeues_at_tail() {
        let mut queue = queue_with(&["a", "b", "c"]);
        queue.set_loop_mode(LoopMode::Queue);
        assert_eq!(queue.advance(false), Advance::Next);
        assert_eq!(titles(&queue), vec!["b", "c", "a"]);
    }

    #[test]
    fn advance_with_loop_queue_replays_single_track_in_place() {
        let mut queue = queue_with(&["solo"]);
        queue.set_loop_mode(LoopMode::Queue);
        for _ in 0..3 {
            assert_eq!(queue.advance(false), Advance::Replay);
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn playing_flag_requires_tracks() {
        let mut queue = queue_with(&[]);
        queue.set_playing(true);
        assert!(!queue.playing());

        queue.push(track("a")).unwrap();
        queue.set_playing(true);
        assert!(queue.playing());
        queue.pop_current();
        assert!(!queue.playing());
    }

    #[test]
    fn clear_upcoming_keeps_current() {
        let mut queue = queue_with(&["now", "a", "b"]);
        assert_eq!(queue.clear_upcoming(), 2);
        assert_eq!(titles(&queue), vec!["now"]);
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn idle_timer_needs_a_session() {
        let mut queue = queue_with(&[]);
        assert!(!queue.should_arm_idle_timer());
        queue.set_persist_connection(true);
        assert!(!queue.should_arm_idle_timer());
    }
}
