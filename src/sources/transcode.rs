use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::{
    io,
    path::Path,
    pin::Pin,
    process::Stdio,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{Child, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{youtube::YtDlpBinary, ResolutionStrategy};
use crate::audio::track::{AudioStream, StreamEncoding, TrackInfo, PCM_CHANNELS, PCM_SAMPLE_RATE};

/// Runs ffmpeg to normalize any input to raw s16le, 48 kHz, stereo.
pub struct Transcoder {
    ffmpeg: String,
    prime_timeout: Duration,
}

impl Transcoder {
    pub fn new(ffmpeg: impl Into<String>, prime_timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            prime_timeout,
        }
    }

    /// Argumentos de ffmpeg para una entrada y un offset
    pub(crate) fn args(input: &str, offset: Duration) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        if input.starts_with("http://") || input.starts_with("https://") {
            args.extend(
                ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
                    .map(String::from),
            );
        }

        if !offset.is_zero() {
            // -ss antes de -i: búsqueda rápida en la entrada
            args.push("-ss".into());
            args.push(format!("{:.3}", offset.as_secs_f64()));
        }

        args.push("-i".into());
        args.push(input.into());
        args.extend(
            [
                "-vn".to_string(),
                "-f".to_string(),
                "s16le".to_string(),
                "-ar".to_string(),
                PCM_SAMPLE_RATE.to_string(),
                "-ac".to_string(),
                PCM_CHANNELS.to_string(),
                "pipe:1".to_string(),
            ],
        );
        args
    }

    fn command(&self, input: &str, offset: Duration) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(Self::args(input, offset))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Transcodifica una URL o ruta local; el stream sale ya cebado
    pub async fn from_url(&self, input: &str, offset: Duration) -> Result<ProcessStream> {
        debug!("🎚️ ffmpeg desde {} (offset {:?})", input, offset);
        let child = self
            .command(input, offset)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("No se pudo iniciar {}", self.ffmpeg))?;

        ProcessStream::new(child)?.primed(self.prime_timeout).await
    }

    pub async fn from_file(&self, path: &Path, offset: Duration) -> Result<ProcessStream> {
        let input = path
            .to_str()
            .context("Ruta de archivo temporal no es UTF-8")?;
        self.from_url(input, offset).await
    }

    /// Transcodifica lo que llegue por `reader`. El stream devuelto no está
    /// cebado: el llamador adjunta sus procesos y luego llama a
    /// [`ProcessStream::primed`].
    pub fn from_reader<R>(&self, mut reader: R, offset: Duration) -> Result<ProcessStream>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut child = self
            .command("pipe:0", offset)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("No se pudo iniciar {}", self.ffmpeg))?;

        let mut stdin = child
            .stdin
            .take()
            .context("ffmpeg no expuso stdin")?;

        let pump = tokio::spawn(async move {
            match tokio::io::copy(&mut reader, &mut stdin).await {
                Ok(bytes) => debug!("📦 {} bytes enviados a ffmpeg", bytes),
                // ffmpeg cierra stdin al terminar o al ser detenido
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => warn!("⚠️ Error alimentando ffmpeg: {}", e),
            }
        });

        Ok(ProcessStream::new(child)?.with_pump(pump))
    }

    pub fn prime_timeout(&self) -> Duration {
        self.prime_timeout
    }

    /// Versión instalada (health check)
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.ffmpeg)
            .arg("-version")
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("{} no está disponible", self.ffmpeg))?;

        if !output.status.success() {
            bail!("{} no puede ejecutarse correctamente", self.ffmpeg);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }
}

/// Stdout of a subprocess pipeline, readable as an audio stream.
///
/// Owns every process feeding it (killed on drop), the task copying data
/// between them and the temp directory holding downloaded media.
pub struct ProcessStream {
    stdout: BufReader<ChildStdout>,
    children: Vec<Child>,
    pump: Option<JoinHandle<()>>,
    temp: Option<TempDir>,
}

impl ProcessStream {
    fn new(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .context("El proceso no expuso stdout")?;

        Ok(Self {
            stdout: BufReader::new(stdout),
            children: vec![child],
            pump: None,
            temp: None,
        })
    }

    /// Mantiene vivo un proceso que alimenta al pipeline
    pub fn with_child(mut self, child: Child) -> Self {
        self.children.push(child);
        self
    }

    fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Borra el directorio cuando el stream se suelta
    pub fn with_temp(mut self, temp: TempDir) -> Self {
        self.temp = Some(temp);
        self
    }

    /// Waits for the first chunk so an empty pipeline is never handed out.
    pub async fn primed(mut self, timeout: Duration) -> Result<Self> {
        let filled = match tokio::time::timeout(timeout, self.stdout.fill_buf()).await {
            Ok(Ok(buf)) => buf.len(),
            Ok(Err(e)) => return Err(e).context("Error leyendo salida del transcodificador"),
            Err(_) => bail!(
                "El transcodificador no produjo audio en {}",
                humantime::format_duration(timeout)
            ),
        };

        if filled == 0 {
            bail!("El transcodificador terminó sin producir audio");
        }

        Ok(self)
    }

    pub fn into_audio_stream(self, origin: &'static str) -> AudioStream {
        AudioStream::new(Box::pin(self), StreamEncoding::NORMALIZED_PCM, origin)
    }
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if self.temp.is_some() {
            debug!("🧹 Liberando archivo temporal de audio");
        }
    }
}

/// Second stage: `yt-dlp -o -` piped through ffmpeg.
pub struct PipedTranscode {
    ytdlp: YtDlpBinary,
    transcoder: Arc<Transcoder>,
}

impl PipedTranscode {
    pub fn new(ytdlp: impl Into<YtDlpBinary>, transcoder: Arc<Transcoder>) -> Self {
        Self {
            ytdlp: ytdlp.into(),
            transcoder,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for PipedTranscode {
    fn name(&self) -> &'static str {
        "transcode"
    }

    async fn resolve(&self, track: &TrackInfo, offset: Duration) -> Result<AudioStream> {
        info!("🔧 Descargando {} vía yt-dlp | ffmpeg", track.title);

        let mut downloader = Command::new(self.ytdlp.path())
            .args(self.ytdlp.common_args())
            .args([
                "-f",
                "bestaudio/best",
                "--no-playlist",
                "--quiet",
                "--no-warnings",
                "-o",
                "-",
                &track.url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("No se pudo iniciar {}", self.ytdlp.path()))?;

        let media = downloader
            .stdout
            .take()
            .context("yt-dlp no expuso stdout")?;

        let stream = self
            .transcoder
            .from_reader(media, offset)?
            .with_child(downloader)
            .primed(self.transcoder.prime_timeout())
            .await?;

        Ok(stream.into_audio_stream(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_is_fixed_pcm() {
        let args = Transcoder::args("pipe:0", Duration::ZERO);
        assert_eq!(
            args.join(" "),
            "-hide_banner -loglevel error -i pipe:0 -vn -f s16le -ar 48000 -ac 2 pipe:1"
        );
    }

    #[test]
    fn offset_seeks_before_input() {
        let args = Transcoder::args("https://cdn.example.com/a.webm", Duration::from_millis(90_500));
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "90.500");
        assert!(args.contains(&"-reconnect".to_string()));
    }

    #[tokio::test]
    async fn missing_binary_fails_fast() {
        let transcoder = Transcoder::new("/nonexistent/ffmpeg-binary", Duration::from_secs(1));
        assert!(transcoder
            .from_url("/tmp/does-not-matter.mp3", Duration::ZERO)
            .await
            .is_err());
        assert!(transcoder.version().await.is_err());
    }
}
