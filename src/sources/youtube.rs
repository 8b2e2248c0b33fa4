use anyhow::{bail, Context, Result};
use async_process::Command;
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::Semaphore;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

use super::{transcode::Transcoder, ResolutionStrategy, TrackSearch};
use crate::audio::track::{AudioStream, StreamEncoding, TrackInfo};

/// Máximo de procesos yt-dlp simultáneos
const MAX_CONCURRENT_EXTRACTIONS: usize = 3;

/// yt-dlp executable plus the flags every invocation shares.
#[derive(Debug, Clone)]
pub struct YtDlpBinary {
    path: String,
    cookies: Option<PathBuf>,
}

impl YtDlpBinary {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cookies: None,
        }
    }

    /// Archivo de cookies (formato Netscape) para videos restringidos
    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cookies(&self) -> Option<&Path> {
        self.cookies.as_deref()
    }

    /// Flags comunes, antes de los de cada llamada
    pub fn common_args(&self) -> Vec<OsString> {
        match &self.cookies {
            Some(cookies) => vec!["--cookies".into(), cookies.clone().into_os_string()],
            None => Vec::new(),
        }
    }
}

impl From<&str> for YtDlpBinary {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for YtDlpBinary {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

/// Cliente para interactuar con YouTube/yt-dlp
pub struct YtDlpClient {
    binary: YtDlpBinary,
    timeout: Duration,
    // Limitar requests concurrentes para evitar rate limiting
    rate_limiter: Semaphore,
}

/// Información extraída de yt-dlp
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    webpage_url: Option<String>,
    url: Option<String>,
    is_live: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl YtDlpInfo {
    fn into_track_info(self) -> Option<TrackInfo> {
        let url = self
            .webpage_url
            .or(self.url)
            .or_else(|| {
                self.id
                    .as_ref()
                    .map(|id| format!("https://www.youtube.com/watch?v={}", id))
            })?;

        let mut info = TrackInfo::new(self.title.unwrap_or_else(|| url.clone()), url);

        if let Some(artist) = self.uploader.or(self.channel) {
            info = info.with_artist(artist);
        }

        // Los directos no tienen duración y se descartan al rankear
        if let (Some(duration), false) = (self.duration, self.is_live.unwrap_or(false)) {
            if duration.is_finite() && duration > 0.0 {
                info = info.with_duration(Duration::from_secs_f64(duration));
            }
        }

        // En modo --flat-playlist solo viene la lista de miniaturas
        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().last().map(|t| t.url));
        if let Some(thumbnail) = thumbnail {
            info = info.with_thumbnail(thumbnail);
        }

        Some(info)
    }
}

fn parse_json_lines(stdout: &str) -> Vec<TrackInfo> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<YtDlpInfo>(line).ok())
        .filter_map(YtDlpInfo::into_track_info)
        .collect()
}

impl YtDlpClient {
    pub fn new(binary: impl Into<YtDlpBinary>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            rate_limiter: Semaphore::new(MAX_CONCURRENT_EXTRACTIONS),
        }
    }

    /// Ejecuta yt-dlp con timeout y devuelve stdout
    async fn run(&self, args: &[&str]) -> Result<String> {
        let _permit = self.rate_limiter.acquire().await?;

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(self.binary.path())
                .args(self.binary.common_args())
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| {
            format!(
                "yt-dlp no respondió en {}",
                humantime::format_duration(self.timeout)
            )
        })?
        .context("Error al ejecutar yt-dlp")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp error: {}", error.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Busca videos en YouTube
    pub async fn search_metadata(&self, query: &str, limit: usize) -> Result<Vec<TrackInfo>> {
        info!("🔍 Buscando en YouTube: {}", query);

        let search_query = format!("ytsearch{}:{}", limit, query);
        let stdout = self
            .run(&[
                "--no-playlist",
                "--dump-json",
                "--flat-playlist",
                "--skip-download",
                "--no-warnings",
                &search_query,
            ])
            .await?;

        Ok(parse_json_lines(&stdout))
    }

    /// Obtiene información de una URL específica
    pub async fn get_info(&self, url: &str) -> Result<TrackInfo> {
        debug!("📊 Obteniendo info de: {}", url);

        let stdout = self
            .run(&["--no-playlist", "--dump-json", "--no-warnings", url])
            .await?;

        let info: YtDlpInfo =
            serde_json::from_str(stdout.trim()).context("Error al parsear respuesta de yt-dlp")?;
        info.into_track_info()
            .context("yt-dlp no devolvió una URL para el video")
    }

    /// Obtiene información de una playlist
    pub async fn get_playlist_info(&self, url: &str, max_items: usize) -> Result<Vec<TrackInfo>> {
        info!("📋 Obteniendo playlist: {}", url);

        let max_items = max_items.to_string();
        let stdout = self
            .run(&[
                "--flat-playlist",
                "--dump-json",
                "--playlist-end",
                &max_items,
                "--no-warnings",
                url,
            ])
            .await?;

        Ok(parse_json_lines(&stdout))
    }

    /// Obtiene la URL de streaming de audio
    pub async fn get_stream_url(&self, url: &str) -> Result<String> {
        debug!("🎵 Obteniendo URL de stream para: {}", url);

        let stdout = self
            .run(&[
                "--no-playlist",
                "-f",
                "bestaudio/best",
                "--get-url",
                "--no-warnings",
                url,
            ])
            .await?;

        match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(stream_url) => Ok(stream_url.to_string()),
            None => bail!("No se pudo obtener URL de stream"),
        }
    }

    /// Versión instalada (health check)
    pub async fn version(&self) -> Result<String> {
        Ok(self.run(&["--version"]).await?.trim().to_string())
    }

    /// Verifica si una URL es de YouTube
    pub fn is_youtube_url(url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        matches!(
            parsed.host_str(),
            Some("youtube.com" | "www.youtube.com" | "m.youtube.com" | "music.youtube.com" | "youtu.be")
        )
    }

    /// Playlist sin video concreto (`/playlist?list=...`)
    pub fn is_playlist_url(url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let has_list = parsed.query_pairs().any(|(key, _)| key == "list");
        let has_video = parsed.query_pairs().any(|(key, _)| key == "v");
        has_list && (!has_video || parsed.path() == "/playlist")
    }
}

#[async_trait]
impl TrackSearch for YtDlpClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<TrackInfo>> {
        self.search_metadata(query, limit).await
    }

    async fn lookup(&self, url: &str) -> Result<TrackInfo> {
        self.get_info(url).await
    }

    async fn playlist(&self, url: &str, limit: usize) -> Result<Vec<TrackInfo>> {
        self.get_playlist_info(url, limit).await
    }
}

/// First stage: direct media URL from yt-dlp, streamed over HTTP.
pub struct DirectStream {
    ytdlp: Arc<YtDlpClient>,
    http: reqwest::Client,
    transcoder: Arc<Transcoder>,
}

impl DirectStream {
    pub fn new(ytdlp: Arc<YtDlpClient>, transcoder: Arc<Transcoder>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("open-music-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("No se pudo crear el cliente HTTP")?;

        Ok(Self {
            ytdlp,
            http,
            transcoder,
        })
    }
}

#[async_trait]
impl ResolutionStrategy for DirectStream {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn resolve(&self, track: &TrackInfo, offset: Duration) -> Result<AudioStream> {
        let stream_url = self.ytdlp.get_stream_url(&track.url).await?;

        if !offset.is_zero() {
            // HTTP no permite buscar por tiempo: ffmpeg lee la URL desde el offset
            let stream = self.transcoder.from_url(&stream_url, offset).await?;
            return Ok(stream.into_audio_stream(self.name()));
        }

        let response = self
            .http
            .get(&stream_url)
            .send()
            .await
            .context("Error conectando con la URL de audio")?
            .error_for_status()?;

        if response.content_length() == Some(0) {
            warn!("⚠️ Respuesta vacía para {}", track.title);
            bail!("El servidor devolvió un stream vacío");
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(AudioStream::new(
            Box::pin(StreamReader::new(body)),
            StreamEncoding::Arbitrary,
            self.name(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_url_detection() {
        assert!(YtDlpClient::is_youtube_url(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        ));
        assert!(YtDlpClient::is_youtube_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(YtDlpClient::is_youtube_url(
            "https://music.youtube.com/watch?v=test"
        ));
        assert!(!YtDlpClient::is_youtube_url("https://example.com/video"));
        assert!(!YtDlpClient::is_youtube_url("never gonna give you up"));
    }

    #[test]
    fn cookies_go_before_call_arguments() {
        let plain = YtDlpBinary::new("yt-dlp");
        assert!(plain.common_args().is_empty());

        let binary = plain.with_cookies(Some(PathBuf::from("/etc/open-music/cookies.txt")));
        assert_eq!(
            binary.common_args(),
            vec![
                OsString::from("--cookies"),
                OsString::from("/etc/open-music/cookies.txt")
            ]
        );
        assert_eq!(binary.path(), "yt-dlp");
    }

    #[test]
    fn playlist_urls_without_video() {
        assert!(YtDlpClient::is_playlist_url(
            "https://www.youtube.com/playlist?list=PL123"
        ));
        assert!(!YtDlpClient::is_playlist_url(
            "https://www.youtube.com/watch?v=abc&list=PL123"
        ));
        assert!(!YtDlpClient::is_playlist_url("https://youtu.be/abc"));
    }

    #[test]
    fn parses_flat_search_output() {
        let stdout = concat!(
            r#"{"id":"abc","title":"Song A","duration":215.0,"channel":"Band","thumbnails":[{"url":"s.jpg"},{"url":"l.jpg"}]}"#,
            "\n",
            "not json\n",
            r#"{"title":"Live radio","webpage_url":"https://www.youtube.com/watch?v=live","is_live":true,"duration":10.0}"#,
            "\n",
            r#"{"title":"no url at all"}"#,
        );

        let tracks = parse_json_lines(stdout);
        assert_eq!(tracks.len(), 2);

        assert_eq!(tracks[0].title, "Song A");
        assert_eq!(tracks[0].url, "https://www.youtube.com/watch?v=abc");
        assert_eq!(tracks[0].artist.as_deref(), Some("Band"));
        assert_eq!(tracks[0].duration, Some(Duration::from_secs(215)));
        assert_eq!(tracks[0].thumbnail.as_deref(), Some("l.jpg"));

        assert_eq!(tracks[1].duration, None);
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let client = YtDlpClient::new("/nonexistent/yt-dlp-binary", Duration::from_secs(1));
        assert!(client.version().await.is_err());
        assert!(client.search_metadata("x", 1).await.is_err());
    }
}
