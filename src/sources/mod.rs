//! # Sources Module
//!
//! Turns user queries into [`TrackDescriptor`]s and tracks into playable
//! [`AudioStream`]s.
//!
//! ## Resolution chain
//!
//! Streams are produced lazily by a [`FallbackChain`], which tries each
//! [`ResolutionStrategy`] in order and moves on when one fails:
//!
//! 1. [`youtube::DirectStream`]: direct media URL from yt-dlp, streamed over HTTP
//! 2. [`transcode::PipedTranscode`]: `yt-dlp -o -` piped through ffmpeg
//! 3. [`download::DownloadFirst`]: full download to a temp file, then playback
//!
//! Subprocess pipelines are primed before being returned, and every process
//! or temp file belongs to the stream it feeds.

pub mod download;
pub mod transcode;
pub mod youtube;

use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::UserId;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    audio::track::{AudioStream, StreamProvider, TrackDescriptor, TrackInfo},
    cache::MetadataCache,
    config::Config,
    error::{PlayerError, PlayerResult},
};
use download::DownloadFirst;
use transcode::{PipedTranscode, Transcoder};
use youtube::{DirectStream, YtDlpBinary, YtDlpClient};

/// Máximo de tracks cargados desde una playlist
pub const MAX_PLAYLIST_ITEMS: usize = 100;

/// One way of turning a track into an audio stream.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, track: &TrackInfo, offset: Duration) -> Result<AudioStream>;
}

/// Metadata lookups (search, single URL, playlist).
#[async_trait]
pub trait TrackSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TrackInfo>>;

    async fn lookup(&self, url: &str) -> Result<TrackInfo>;

    async fn playlist(&self, url: &str, limit: usize) -> Result<Vec<TrackInfo>>;
}

/// Ordered list of strategies; the first one that succeeds wins.
pub struct FallbackChain {
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
}

impl FallbackChain {
    pub fn new(strategies: Vec<Arc<dyn ResolutionStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl StreamProvider for FallbackChain {
    async fn open_stream(&self, track: &TrackInfo, offset: Duration) -> PlayerResult<AudioStream> {
        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("🎯 Probando estrategia '{}' para: {}", strategy.name(), track.title);
            match strategy.resolve(track, offset).await {
                Ok(stream) => {
                    info!("✅ Stream obtenido con '{}' para: {}", strategy.name(), track.title);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("❌ Estrategia '{}' falló para {}: {:#}", strategy.name(), track.title, e);
                    last_error = Some(format!("{}: {:#}", strategy.name(), e));
                }
            }
        }

        Err(PlayerError::ResolutionFailure {
            title: track.title.clone(),
            reason: last_error.unwrap_or_else(|| "no hay estrategias configuradas".to_string()),
        })
    }
}

/// Entry point for everything the host needs from the sources.
pub struct SourceResolver {
    search: Arc<dyn TrackSearch>,
    chain: Arc<FallbackChain>,
    cache: MetadataCache,
    limit: usize,
}

impl SourceResolver {
    pub fn new(
        search: Arc<dyn TrackSearch>,
        chain: Arc<FallbackChain>,
        cache: MetadataCache,
        limit: usize,
    ) -> Self {
        Self {
            search,
            chain,
            cache,
            limit,
        }
    }

    /// yt-dlp + ffmpeg con la cadena completa de estrategias
    pub fn from_config(config: &Config) -> Result<Self> {
        let binary = YtDlpBinary::new(config.ytdlp_path.clone())
            .with_cookies(config.ytdlp_cookies.clone());
        if let Some(cookies) = binary.cookies() {
            info!("🍪 yt-dlp usará cookies de {}", cookies.display());
        }

        let ytdlp = Arc::new(YtDlpClient::new(binary.clone(), config.extractor_timeout()));
        let transcoder = Arc::new(Transcoder::new(
            config.ffmpeg_path.clone(),
            config.extractor_timeout(),
        ));

        let chain = FallbackChain::new(vec![
            Arc::new(DirectStream::new(Arc::clone(&ytdlp), Arc::clone(&transcoder))?),
            Arc::new(PipedTranscode::new(binary.clone(), Arc::clone(&transcoder))),
            Arc::new(DownloadFirst::new(
                binary,
                config.temp_dir.clone(),
                config.download_timeout(),
                transcoder,
            )),
        ]);
        info!("🎼 Cadena de fuentes: {}", chain.names().join(" → "));

        Ok(Self::new(
            ytdlp,
            Arc::new(chain),
            MetadataCache::for_ttl(Duration::from_secs(config.metadata_cache_ttl)),
            config.search_limit,
        ))
    }

    /// Busca tracks para una consulta o URL. Nunca falla: los errores se
    /// registran y se devuelve una lista vacía.
    pub async fn search(&self, query: &str, requester: UserId) -> Vec<TrackDescriptor> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }

        let found = if is_url(query) {
            if YtDlpClient::is_playlist_url(query) {
                self.search.playlist(query, MAX_PLAYLIST_ITEMS).await
            } else {
                self.lookup_cached(query).await.map(|info| vec![info])
            }
        } else {
            self.search
                .search(query, self.limit)
                .await
                .map(|results| rank_results(results, query))
        };

        match found {
            Ok(infos) => infos
                .into_iter()
                .map(|info| self.descriptor(info).with_requested_by(requester))
                .collect(),
            Err(e) => {
                warn!("🔍 Búsqueda fallida para '{}': {:#}", query, e);
                Vec::new()
            }
        }
    }

    async fn lookup_cached(&self, url: &str) -> Result<TrackInfo> {
        if let Some(info) = self.cache.get(&url.to_string()) {
            debug!("💾 Metadatos en cache para {}", url);
            return Ok(info);
        }

        let info = self.search.lookup(url).await?;
        self.cache.insert(url.to_string(), info.clone());
        Ok(info)
    }

    /// Abre el stream de un track a través de su proveedor
    pub async fn resolve_stream(
        &self,
        track: &TrackDescriptor,
        offset: Duration,
    ) -> PlayerResult<AudioStream> {
        track.open_stream(offset).await
    }

    /// Descriptor respaldado por la cadena de fallback
    pub fn descriptor(&self, info: TrackInfo) -> TrackDescriptor {
        TrackDescriptor::new(info, self.chain.clone())
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }
}

/// `true` for absolute http(s) URLs.
pub fn is_url(query: &str) -> bool {
    Url::parse(query).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

/// Ordena por relevancia: primero títulos que contienen la consulta, luego
/// duraciones típicas de canciones. Descarta directos y duraciones extremas.
pub fn rank_results(results: Vec<TrackInfo>, query: &str) -> Vec<TrackInfo> {
    let mut filtered = results;
    let query_lower = query.to_lowercase();

    // Filtrar videos muy largos o muy cortos
    filtered.retain(|track| match track.duration {
        Some(duration) => {
            let minutes = duration.as_secs() / 60;
            (1..=600).contains(&minutes)
        }
        None => false,
    });

    // sort_by es estable: empates conservan el orden de yt-dlp
    filtered.sort_by(|a, b| {
        let a_match = a.title.to_lowercase().contains(&query_lower);
        let b_match = b.title.to_lowercase().contains(&query_lower);

        b_match.cmp(&a_match).then_with(|| {
            let score_a = a.duration.map(duration_score).unwrap_or_default();
            let score_b = b.duration.map(duration_score).unwrap_or_default();
            score_b.total_cmp(&score_a)
        })
    });

    filtered
}

/// Calcula score de relevancia basado en duración
fn duration_score(duration: Duration) -> f64 {
    let minutes = duration.as_secs() as f64 / 60.0;

    if minutes < 1.0 {
        0.1 // Muy corto
    } else if minutes <= 3.0 {
        0.9 // Muy bueno para música
    } else if minutes <= 6.0 {
        1.0 // Perfecto para música
    } else if minutes <= 10.0 {
        0.8 // Aceptable
    } else if minutes <= 20.0 {
        0.6 // Posiblemente mix o podcast
    } else {
        0.3 // Muy largo, probablemente no es música
    }
}
