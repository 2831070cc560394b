use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    time::timeout,
};
use tracing::{debug, warn};

use super::{
    DownloadedMedia, ExtractorError, ExtractorOptions, MediaExtractor, MediaInfo, ProgressSink,
    TransferProgress,
};

const PROGRESS_PREFIX: &str = "[progress]";
const STDERR_TAIL_LINES: usize = 200;
const VERSION_CHECK_TIMEOUT_SECONDS: u64 = 10;

/// `yt-dlp` driven as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    id: Option<String>,
    ext: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
struct PrintedResult {
    title: Option<String>,
    filepath: Option<String>,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn spawn_error(&self, error: std::io::Error) -> ExtractorError {
        if error.kind() == ErrorKind::NotFound {
            ExtractorError::NotInstalled(self.binary.clone())
        } else {
            ExtractorError::Spawn(error)
        }
    }

    async fn run_captured(&self, args: Vec<String>) -> Result<Output, ExtractorError> {
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| ExtractorError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| self.spawn_error(error))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractorError::Failed(run_error_message(stderr.lines())));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn extract_info(
        &self,
        url: &str,
        options: &ExtractorOptions,
    ) -> Result<MediaInfo, ExtractorError> {
        let output = self.run_captured(options.metadata_args(url)).await?;
        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| ExtractorError::InvalidOutput(error.to_string()))?;

        let title = info
            .title
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ExtractorError::Failed("No se pudo obtener informacion del video".to_string())
            })?;

        Ok(MediaInfo {
            title,
            id: info.id,
            ext: info.ext,
        })
    }

    async fn download(
        &self,
        url: &str,
        options: &ExtractorOptions,
        progress: ProgressSink,
    ) -> Result<DownloadedMedia, ExtractorError> {
        let output_dir = options
            .output_dir
            .clone()
            .ok_or_else(|| ExtractorError::InvalidOutput("falta carpeta de salida".to_string()))?;

        let mut child = Command::new(&self.binary)
            .args(options.download_args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| self.spawn_error(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractorError::InvalidOutput("stdout no disponible".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExtractorError::InvalidOutput("stderr no disponible".to_string()))?;

        let stderr_progress = progress.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(update) = parse_progress_line(&line) {
                    stderr_progress(update);
                    continue;
                }
                debug!("yt-dlp stderr: {line}");
                tail.push_back(line);
                if tail.len() > STDERR_TAIL_LINES {
                    tail.pop_front();
                }
            }
            tail
        });

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut printed = None;
            while let Some(line) = lines.next_line().await? {
                if let Some(update) = parse_progress_line(&line) {
                    progress(update);
                } else if let Some(result) = parse_printed_result(&line) {
                    printed = Some(result);
                } else {
                    debug!("yt-dlp stdout: {line}");
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, printed))
        };

        let (status, printed) = timeout(self.timeout, run)
            .await
            .map_err(|_| ExtractorError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                ExtractorError::Failed(format!("Fallo leyendo la salida de yt-dlp: {error}"))
            })?;

        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ExtractorError::Failed(run_error_message(
                stderr_tail.iter().map(String::as_str),
            )));
        }

        let printed_path = printed.as_ref().and_then(|result| result.filepath.as_deref());
        let path = resolve_downloaded_file(&output_dir, printed_path).await?;
        let title = printed
            .and_then(|result| result.title)
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| "download".to_string());

        Ok(DownloadedMedia { path, title })
    }

    async fn is_available(&self) -> bool {
        let check = Command::new(&self.binary)
            .arg("--version")
            .kill_on_drop(true)
            .output();
        matches!(
            timeout(Duration::from_secs(VERSION_CHECK_TIMEOUT_SECONDS), check).await,
            Ok(Ok(output)) if output.status.success()
        )
    }
}

/// Whether ffmpeg is on the path, which audio-to-mp3 conversion needs.
pub async fn ffmpeg_available() -> bool {
    let check = Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    matches!(
        timeout(Duration::from_secs(VERSION_CHECK_TIMEOUT_SECONDS), check).await,
        Ok(Ok(status)) if status.success()
    )
}

/// Parses a line produced by the progress template:
/// `[progress] <downloaded> <total> <estimate>`, where missing values are `NA`.
pub fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split_whitespace().map(parse_byte_count);

    let downloaded_bytes = fields.next()??;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();

    Some(TransferProgress {
        downloaded_bytes,
        total_bytes: total.or(estimate),
    })
}

fn parse_byte_count(value: &str) -> Option<u64> {
    let parsed = value.parse::<f64>().ok()?;
    if parsed.is_finite() && parsed >= 0.0 {
        Some(parsed as u64)
    } else {
        None
    }
}

fn parse_printed_result(line: &str) -> Option<PrintedResult> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn run_error_message<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let meaningful: Vec<&str> = lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let message = meaningful
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| meaningful.last())
        .copied()
        .unwrap_or("yt-dlp no pudo completar la operacion")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "URL no soportada o invalida para descarga.".to_string()
    } else if lower.contains("nonetype") {
        "No se pudieron obtener metadatos de la URL. Reintenta mas tarde.".to_string()
    } else {
        message
    }
}

async fn resolve_downloaded_file(
    job_dir: &Path,
    printed_path: Option<&str>,
) -> Result<PathBuf, ExtractorError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await?;

    if let Some(path_value) = printed_path {
        let path = PathBuf::from(path_value);
        if let Some(valid_path) = resolve_download_candidate(&canonical_job_dir, &path).await? {
            return Ok(valid_path);
        }

        let relative_candidate = job_dir.join(path_value);
        if let Some(valid_path) =
            resolve_download_candidate(&canonical_job_dir, &relative_candidate).await?
        {
            return Ok(valid_path);
        }
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "part" | "ytdl" | "temp"));
        if is_partial {
            continue;
        }
        if let Some(valid_path) = resolve_download_candidate(&canonical_job_dir, &path).await? {
            return Ok(valid_path);
        }
    }

    Err(ExtractorError::MissingFile)
}

async fn resolve_download_candidate(
    canonical_job_dir: &Path,
    candidate_path: &Path,
) -> Result<Option<PathBuf>, ExtractorError> {
    let metadata = match tokio::fs::metadata(candidate_path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate_path).await?;
    if !canonical_candidate.starts_with(canonical_job_dir) {
        warn!(
            "Se bloqueo un archivo fuera de la carpeta temporal esperada: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{MediaFormat, MediaRequest, Quality};
    use std::sync::Arc;

    #[test]
    fn progress_lines_with_known_total() {
        let parsed = parse_progress_line("[progress] 512 2048 NA").unwrap();
        assert_eq!(parsed.downloaded_bytes, 512);
        assert_eq!(parsed.total_bytes, Some(2048));
        assert_eq!(parsed.percent(), Some(25));
    }

    #[test]
    fn progress_lines_fall_back_to_estimate() {
        let parsed = parse_progress_line("  [progress] 100 NA 400.5").unwrap();
        assert_eq!(parsed.total_bytes, Some(400));
    }

    #[test]
    fn progress_lines_without_total_are_indeterminate() {
        let parsed = parse_progress_line("[progress] 100 NA NA").unwrap();
        assert_eq!(parsed.total_bytes, None);
        assert_eq!(parsed.percent(), None);
    }

    #[test]
    fn other_lines_are_not_progress() {
        assert!(parse_progress_line("[download] Destination: a.mp4").is_none());
        assert!(parse_progress_line("[progress] NA NA NA").is_none());
    }

    #[test]
    fn printed_result_is_parsed_from_json_lines() {
        let parsed =
            parse_printed_result(r#"{"title": "Clip", "filepath": "/tmp/a.mp4"}"#)
                .unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Clip"));
        assert_eq!(parsed.filepath.as_deref(), Some("/tmp/a.mp4"));
        assert!(parse_printed_result("[info] Writing").is_none());
    }

    #[test]
    fn error_message_prefers_error_lines() {
        let stderr = "ERROR: [youtube] abc: Video unavailable\nsome trailing noise";
        assert_eq!(
            run_error_message(stderr.lines()),
            "ERROR: [youtube] abc: Video unavailable"
        );
        assert_eq!(
            run_error_message("".lines()),
            "yt-dlp no pudo completar la operacion"
        );
        assert_eq!(
            run_error_message("ERROR: Unsupported URL: https://example.com".lines()),
            "URL no soportada o invalida para descarga."
        );
    }

    #[tokio::test]
    async fn resolves_printed_file_inside_job_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Clip-abc.mp4");
        tokio::fs::write(&file, b"data").await.unwrap();

        let resolved = resolve_downloaded_file(dir.path(), file.to_str())
            .await
            .unwrap();
        assert_eq!(resolved, tokio::fs::canonicalize(&file).await.unwrap());
    }

    #[tokio::test]
    async fn skips_partial_files_when_scanning() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("Clip.mp4.part"), b"x")
            .await
            .unwrap();

        let result = resolve_downloaded_file(dir.path(), None).await;
        assert!(matches!(result, Err(ExtractorError::MissingFile)));
    }

    #[tokio::test]
    async fn missing_binary_reports_not_installed() {
        let extractor = YtDlp::new("tube-grab-missing-binary", Duration::from_secs(5));
        let request = MediaRequest {
            url: "https://youtu.be/abc".to_string(),
            format: MediaFormat::Video,
            quality: Quality::Best,
        };
        let dir = tempfile::tempdir().unwrap();
        let options = ExtractorOptions::for_request(&request, false).with_output_dir(dir.path());

        let result = extractor
            .download(&request.url, &options, Arc::new(|_| {}))
            .await;
        assert!(matches!(result, Err(ExtractorError::NotInstalled(_))));
        assert!(!extractor.is_available().await);
    }
}
