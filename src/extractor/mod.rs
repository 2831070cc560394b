//! Boundary with the external media-extraction tool.
//!
//! Everything site-specific (metadata, format negotiation, transcoding and
//! the transfer itself) happens behind [`MediaExtractor`]. The rest of the
//! crate only builds [`ExtractorOptions`] and reacts to the outcome.

mod identity;
mod options;
mod ytdlp;

use std::{future::Future, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use identity::{ClientIdentity, DEFAULT_REFERER, PLAYER_CLIENTS, USER_AGENTS};
pub use options::ExtractorOptions;
pub use ytdlp::{YtDlp, ffmpeg_available, parse_progress_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Video,
    Audio,
}

impl MediaFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "1080")]
    P1080,
    #[serde(rename = "720")]
    P720,
    #[serde(rename = "480")]
    P480,
}

impl Quality {
    /// Accepts `best` or a height with at most one trailing `p`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "best" {
            return Some(Self::Best);
        }
        match value.strip_suffix('p').unwrap_or(&value) {
            "1080" => Some(Self::P1080),
            "720" => Some(Self::P720),
            "480" => Some(Self::P480),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::P1080 => "1080",
            Self::P720 => "720",
            Self::P480 => "480",
        }
    }

    pub fn max_height(self) -> Option<u32> {
        match self {
            Self::Best => None,
            Self::P1080 => Some(1080),
            Self::P720 => Some(720),
            Self::P480 => Some(480),
        }
    }
}

/// Validated input of one download, captured by value by its runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRequest {
    pub url: String,
    pub format: MediaFormat,
    pub quality: Quality,
}

impl MediaRequest {
    pub fn format_selector(&self) -> String {
        match (self.format, self.quality.max_height()) {
            (MediaFormat::Audio, _) => "bestaudio".to_string(),
            (MediaFormat::Video, None) => "best".to_string(),
            (MediaFormat::Video, Some(height)) => format!("best[height<={height}]"),
        }
    }

    pub fn is_short(&self) -> bool {
        self.url.contains("youtube.com/shorts/")
    }
}

/// Metadata resolved without downloading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub title: String,
    pub id: Option<String>,
    pub ext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    pub title: String,
}

/// Byte counters reported while a transfer is running. `total_bytes` is
/// absent when the tool cannot tell (live transcoding, chunked streams).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl TransferProgress {
    /// `floor(100 * downloaded / total)`, capped at 99. `None` when the
    /// total is unknown.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total_bytes.filter(|total| *total > 0)?;
        let percent = u128::from(self.downloaded_bytes) * 100 / u128::from(total);
        Some(percent.min(99) as u8)
    }
}

pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("{0} no esta instalado en el sistema")]
    NotInstalled(String),
    #[error("No se pudo ejecutar el extractor: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("El extractor excedio el tiempo limite de {0} segundos")]
    TimedOut(u64),
    #[error("Descarga cancelada")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error("Respuesta invalida del extractor: {0}")]
    InvalidOutput(String),
    #[error("No se encontro el archivo descargado")]
    MissingFile,
    #[error("Error de E/S en la carpeta temporal: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractorError {
    /// Errors where another attempt with a different identity cannot help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotInstalled(_) | Self::Cancelled)
    }
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract_info(
        &self,
        url: &str,
        options: &ExtractorOptions,
    ) -> Result<MediaInfo, ExtractorError>;

    async fn download(
        &self,
        url: &str,
        options: &ExtractorOptions,
        progress: ProgressSink,
    ) -> Result<DownloadedMedia, ExtractorError>;

    async fn is_available(&self) -> bool;
}

/// Runs `operation` up to `attempts` times, switching to a fresh random
/// identity after every failure. Only the last error is returned; earlier
/// ones are logged.
pub async fn with_identity_rotation<T, F, Fut>(
    attempts: usize,
    mut options: ExtractorOptions,
    mut operation: F,
) -> Result<T, ExtractorError>
where
    F: FnMut(ExtractorOptions) -> Fut,
    Fut: Future<Output = Result<T, ExtractorError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(options.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && error.is_retryable() => {
                warn!(
                    attempt,
                    attempts,
                    user_agent = options.identity.user_agent,
                    player_client = options.identity.player_client,
                    "Intento de extraccion fallido: {error}"
                );
                options.rotate_identity();
                attempt += 1;
            }
            Err(error) => {
                warn!(attempt, attempts, "Extraccion abandonada: {error}");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(format: MediaFormat, quality: Quality) -> MediaRequest {
        MediaRequest {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            format,
            quality,
        }
    }

    #[test]
    fn format_selector_follows_format_and_quality() {
        assert_eq!(
            request(MediaFormat::Video, Quality::Best).format_selector(),
            "best"
        );
        assert_eq!(
            request(MediaFormat::Video, Quality::P720).format_selector(),
            "best[height<=720]"
        );
        assert_eq!(
            request(MediaFormat::Audio, Quality::P1080).format_selector(),
            "bestaudio"
        );
    }

    #[test]
    fn quality_parsing_accepts_p_suffix() {
        assert_eq!(Quality::parse("1080p"), Some(Quality::P1080));
        assert_eq!(Quality::parse(" BEST "), Some(Quality::Best));
        assert_eq!(Quality::parse("4k"), None);
        assert_eq!(Quality::parse("720"), Some(Quality::P720));
        assert_eq!(Quality::parse("1080pp"), None);
        assert_eq!(Quality::parse("bestp"), None);
        assert_eq!(MediaFormat::parse("Audio"), Some(MediaFormat::Audio));
        assert_eq!(MediaFormat::parse("gif"), None);
    }

    #[test]
    fn percent_is_floored_and_capped() {
        let progress = |downloaded, total| TransferProgress {
            downloaded_bytes: downloaded,
            total_bytes: total,
        };
        assert_eq!(progress(1, Some(3)).percent(), Some(33));
        assert_eq!(progress(999, Some(1000)).percent(), Some(99));
        assert_eq!(progress(1000, Some(1000)).percent(), Some(99));
        assert_eq!(progress(10, None).percent(), None);
        assert_eq!(progress(10, Some(0)).percent(), None);
    }

    #[tokio::test]
    async fn rotation_retries_until_success() {
        let calls = AtomicUsize::new(0);
        let options = ExtractorOptions::for_request(
            &request(MediaFormat::Video, Quality::Best),
            false,
        );

        let result = with_identity_rotation(3, options, |_| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(ExtractorError::Failed(format!("fallo {call}")))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rotation_keeps_only_the_last_error() {
        let calls = AtomicUsize::new(0);
        let options = ExtractorOptions::for_request(
            &request(MediaFormat::Audio, Quality::Best),
            false,
        );

        let result: Result<(), _> = with_identity_rotation(3, options, |_| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(ExtractorError::Failed(format!("fallo {call}"))) }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "fallo 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_binary_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let options = ExtractorOptions::for_request(
            &request(MediaFormat::Video, Quality::Best),
            false,
        );

        let result: Result<(), _> = with_identity_rotation(3, options, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExtractorError::NotInstalled("yt-dlp".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ExtractorError::NotInstalled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
