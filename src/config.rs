use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

const DOWNLOAD_TIMEOUT_FACTOR: u32 = 4;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord (solo lo necesita el binario)
    pub discord_token: String,

    // Reproducción
    pub default_volume: u8, // porcentaje 0-100
    pub disconnect_timeout_ms: u64,
    pub enable_24_7_mode: bool,
    pub max_queue_size: usize,

    // Tiempos del motor
    pub join_timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub advance_delay_ms: u64,
    pub retry_backoff_ms: u64,

    // Fuentes
    pub extractor_timeout_ms: u64,
    pub search_limit: usize,
    pub metadata_cache_ttl: u64, // En segundos
    pub temp_dir: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    /// Cookies para yt-dlp (videos con restricción de edad o verificación)
    pub ytdlp_cookies: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN").unwrap_or_default(),

            default_volume: env_or("DEFAULT_VOLUME", "50")?,
            disconnect_timeout_ms: env_or("DEFAULT_DISCONNECT_TIMEOUT", "300000")?, // 5 minutos
            enable_24_7_mode: env_or("ENABLE_24_7_MODE", "false")?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", "1000")?,

            join_timeout_ms: env_or("JOIN_TIMEOUT_MS", "30000")?,
            reconnect_timeout_ms: env_or("RECONNECT_TIMEOUT_MS", "5000")?,
            advance_delay_ms: env_or("ADVANCE_DELAY_MS", "100")?,
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", "500")?,

            extractor_timeout_ms: env_or("EXTRACTOR_TIMEOUT_MS", "30000")?,
            search_limit: env_or("SEARCH_LIMIT", "10")?,
            metadata_cache_ttl: env_or("METADATA_CACHE_TTL", "3600")?,
            temp_dir: match std::env::var("TEMP_DIR") {
                Ok(val) if !val.trim().is_empty() => val.into(),
                _ => std::env::temp_dir().join("open-music"),
            },
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ytdlp_cookies: match std::env::var("YTDLP_COOKIES") {
                Ok(val) if !val.trim().is_empty() => Some(val.trim().into()),
                _ => None,
            },
        };

        std::fs::create_dir_all(&config.temp_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 100
    /// - Queue size and search limit must be greater than 0
    /// - Idle and join timeouts must be greater than 0
    /// - Binary paths must not be empty
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > 100 {
            anyhow::bail!("Default volume must be between 0 and 100, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.search_limit == 0 {
            anyhow::bail!("Search limit must be greater than 0");
        }

        if self.disconnect_timeout_ms == 0 {
            anyhow::bail!("Disconnect timeout must be greater than 0");
        }

        if self.join_timeout_ms == 0 || self.reconnect_timeout_ms == 0 {
            anyhow::bail!("Join and reconnect timeouts must be greater than 0");
        }

        if self.ytdlp_path.trim().is_empty() || self.ffmpeg_path.trim().is_empty() {
            anyhow::bail!("yt-dlp and ffmpeg paths must not be empty");
        }

        if let Some(cookies) = &self.ytdlp_cookies {
            if !cookies.is_file() {
                anyhow::bail!("YTDLP_COOKIES file not found: {}", cookies.display());
            }
        }

        Ok(())
    }

    /// Engine-facing subset of the configuration.
    pub fn playback_settings(&self) -> PlaybackSettings {
        PlaybackSettings {
            default_volume: f32::from(self.default_volume.min(100)) / 100.0,
            persist_connection: self.enable_24_7_mode,
            max_queue_size: self.max_queue_size,
            idle_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
            advance_delay: Duration::from_millis(self.advance_delay_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn extractor_timeout(&self) -> Duration {
        Duration::from_millis(self.extractor_timeout_ms)
    }

    /// Límite para descargas completas (más lentas que una consulta)
    pub fn download_timeout(&self) -> Duration {
        self.extractor_timeout() * DOWNLOAD_TIMEOUT_FACTOR
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The Discord token is never included.
    pub fn summary(&self) -> String {
        let settings = self.playback_settings();
        format!(
            "Config Summary:\n  \
            Playback: {}% vol, 24/7={}, {} max queue\n  \
            Timers: idle {}, join {}, reconnect {}, advance {}, backoff {}\n  \
            Sources: {} / {}, {} results, cache ttl {}s, temp {}, cookies {}",
            self.default_volume,
            self.enable_24_7_mode,
            self.max_queue_size,
            humantime::format_duration(settings.idle_timeout),
            humantime::format_duration(settings.join_timeout),
            humantime::format_duration(settings.reconnect_timeout),
            humantime::format_duration(settings.advance_delay),
            humantime::format_duration(settings.retry_backoff),
            self.ytdlp_path,
            self.ffmpeg_path,
            self.search_limit,
            self.metadata_cache_ttl,
            self.temp_dir.display(),
            if self.ytdlp_cookies.is_some() { "sí" } else { "no" },
        )
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Valor inválido para {}: {} ({})", key, raw, e))
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),

            default_volume: 50,
            disconnect_timeout_ms: 300_000, // 5 minutos
            enable_24_7_mode: false,
            max_queue_size: 1000,

            join_timeout_ms: 30_000,
            reconnect_timeout_ms: 5_000,
            advance_delay_ms: 100,
            retry_backoff_ms: 500,

            extractor_timeout_ms: 30_000,
            search_limit: 10,
            metadata_cache_ttl: 3600,
            temp_dir: std::env::temp_dir().join("open-music"),
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_cookies: None,
        }
    }
}

/// Timing and default values the playback engine runs with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSettings {
    /// Initial queue volume as a fraction in [0, 1].
    pub default_volume: f32,
    /// Initial value of the 24/7 flag for new queues.
    pub persist_connection: bool,
    pub max_queue_size: usize,
    /// Delay before an empty, non-persistent queue is reclaimed.
    pub idle_timeout: Duration,
    pub join_timeout: Duration,
    pub reconnect_timeout: Duration,
    /// Pause between the sink going idle and the next track starting.
    pub advance_delay: Duration,
    /// Pause before retrying with the next track after a failed start.
    pub retry_backoff: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Config::default().playback_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_settings_match_documented_values() {
        let settings = PlaybackSettings::default();
        assert_eq!(settings.default_volume, 0.5);
        assert_eq!(settings.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.join_timeout, Duration::from_secs(30));
        assert_eq!(settings.reconnect_timeout, Duration::from_secs(5));
        assert_eq!(settings.advance_delay, Duration::from_millis(100));
        assert_eq!(settings.retry_backoff, Duration::from_millis(500));
        assert!(!settings.persist_connection);
    }

    #[test]
    fn validate_rejects_out_of_range_volume() {
        let config = Config {
            default_volume: 150,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let config = Config {
            max_queue_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            disconnect_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_checks_cookie_file() {
        let missing = Config {
            ytdlp_cookies: Some(PathBuf::from("/nonexistent/open-music/cookies.txt")),
            ..Config::default()
        };
        assert!(missing.validate().is_err());

        let file = tempfile::NamedTempFile::new().unwrap();
        let present = Config {
            ytdlp_cookies: Some(file.path().to_path_buf()),
            ..Config::default()
        };
        assert!(present.validate().is_ok());
        assert!(present.summary().contains("cookies sí"));
    }

    #[test]
    fn summary_never_leaks_token() {
        let config = Config {
            discord_token: "super-secret-token".to_string(),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("super-secret-token"));
        assert!(summary.contains("50% vol"));
    }
}
