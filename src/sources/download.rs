use anyhow::{bail, Context, Result};
use async_process::Command;
use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    fs::File,
    io::{AsyncRead, ReadBuf},
};
use tracing::{debug, info};

use super::{transcode::Transcoder, youtube::YtDlpBinary, ResolutionStrategy};
use crate::audio::track::{AudioStream, StreamEncoding, TrackInfo};

/// Last stage: download the whole track to disk, then play the file.
///
/// Each download gets its own temp directory; it is removed when the
/// returned stream is dropped, or right away if the download fails.
pub struct DownloadFirst {
    ytdlp: YtDlpBinary,
    temp_dir: PathBuf,
    timeout: Duration,
    transcoder: Arc<Transcoder>,
}

impl DownloadFirst {
    pub fn new(
        ytdlp: impl Into<YtDlpBinary>,
        temp_dir: PathBuf,
        timeout: Duration,
        transcoder: Arc<Transcoder>,
    ) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            temp_dir,
            timeout,
            transcoder,
        }
    }

    async fn download(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        let template = dir.join("audio.%(ext)s");
        let template = template
            .to_str()
            .context("Directorio temporal no es UTF-8")?;

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(self.ytdlp.path())
                .args(self.ytdlp.common_args())
                .args([
                    "-x",
                    "--audio-format",
                    "mp3",
                    "--no-playlist",
                    "--quiet",
                    "--no-warnings",
                    "-o",
                    template,
                    url,
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("Timeout descargando audio")?
        .with_context(|| format!("No se pudo ejecutar {}", self.ytdlp.path()))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp error: {}", error.trim());
        }

        find_download(dir).await
    }
}

/// Primer archivo completo del directorio (ignora `.part`)
async fn find_download(dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let partial = path.extension().is_some_and(|ext| ext == "part");
        if !partial && entry.metadata().await?.len() > 0 {
            return Ok(path);
        }
    }
    bail!("yt-dlp no generó ningún archivo de audio")
}

#[async_trait]
impl ResolutionStrategy for DownloadFirst {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn resolve(&self, track: &TrackInfo, offset: Duration) -> Result<AudioStream> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix("audio_")
            .tempdir_in(&self.temp_dir)
            .context("No se pudo crear directorio temporal")?;

        info!("💾 Descargando {} antes de reproducir", track.title);
        // Si falla, `dir` se borra aquí mismo al salir con `?`
        let path = self.download(&track.url, dir.path()).await?;
        debug!("💾 Archivo descargado: {}", path.display());

        if offset.is_zero() {
            let file = File::open(&path).await?;
            return Ok(AudioStream::new(
                Box::pin(DownloadedFile { file, _dir: dir }),
                StreamEncoding::Arbitrary,
                self.name(),
            ));
        }

        let stream = self.transcoder.from_file(&path, offset).await?.with_temp(dir);
        Ok(stream.into_audio_stream(self.name()))
    }
}

/// A downloaded file that takes its temp directory with it.
struct DownloadedFile {
    file: File,
    _dir: TempDir,
}

impl AsyncRead for DownloadedFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn finds_completed_file_and_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("audio.mp3.part"), b"half").await.unwrap();
        assert!(find_download(dir.path()).await.is_err());

        tokio::fs::write(dir.path().join("audio.mp3"), b"ID3").await.unwrap();
        let found = find_download(dir.path()).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "audio.mp3");
    }

    #[tokio::test]
    async fn dropping_the_stream_removes_the_download() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = dir.path().to_path_buf();
        let file_path = dir_path.join("audio.mp3");
        tokio::fs::write(&file_path, b"ID3-data").await.unwrap();

        let mut stream = DownloadedFile {
            file: File::open(&file_path).await.unwrap(),
            _dir: dir,
        };
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ID3-data");

        drop(stream);
        assert!(!dir_path.exists());
    }

    #[tokio::test]
    async fn failed_download_leaves_nothing_behind() {
        let scratch = tempfile::tempdir().unwrap();
        let strategy = DownloadFirst::new(
            "/nonexistent/yt-dlp-binary",
            scratch.path().to_path_buf(),
            Duration::from_secs(5),
            Arc::new(Transcoder::new("ffmpeg", Duration::from_secs(5))),
        );
        let track = TrackInfo::new("t", "https://www.youtube.com/watch?v=x");

        assert!(strategy.resolve(&track, Duration::ZERO).await.is_err());
        let leftovers = std::fs::read_dir(scratch.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
