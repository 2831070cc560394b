use std::{path::PathBuf, time::Duration};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_TRANSFER_DIR: &str = "temp_downloads";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_DOWNLOAD_ATTEMPTS: usize = 3;
const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 10 * 60;
const DEFAULT_JOB_RETENTION_SECONDS: u64 = 20 * 60;
const DEFAULT_MAX_TRACKED_JOBS: usize = 1_000;
const DEFAULT_FILE_RETENTION_SECONDS: u64 = 60;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 9 * 60;
const DEFAULT_STALE_TRANSFER_SECONDS: u64 = 2 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub allowed_origins: Vec<String>,
    pub transfer_dir: PathBuf,
    pub yt_dlp_bin: String,
    pub yt_dlp_timeout: Duration,
    pub max_concurrent_downloads: usize,
    pub download_attempts: usize,
    /// Age after which a job that has not finished is reported as failed.
    pub job_timeout: Duration,
    /// How long finished jobs stay queryable.
    pub job_retention: Duration,
    pub max_tracked_jobs: usize,
    /// Delay between serving a file and deleting it.
    pub file_retention: Duration,
    pub stale_transfer_age: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            allowed_origins: Vec::new(),
            transfer_dir: PathBuf::from(DEFAULT_TRANSFER_DIR),
            yt_dlp_bin: DEFAULT_YT_DLP_BIN.to_string(),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            download_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECONDS),
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_SECONDS),
            max_tracked_jobs: DEFAULT_MAX_TRACKED_JOBS,
            file_retention: Duration::from_secs(DEFAULT_FILE_RETENTION_SECONDS),
            stale_transfer_age: Duration::from_secs(DEFAULT_STALE_TRANSFER_SECONDS),
        }
    }
}

impl AppConfig {
    /// Reads the environment, after loading `.env` when present. Missing or
    /// unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            bind_addr: resolve_bind_addr(),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            transfer_dir: std::env::var("TRANSFER_DIR")
                .ok()
                .and_then(|value| non_empty(&value).map(PathBuf::from))
                .unwrap_or(defaults.transfer_dir),
            yt_dlp_bin: std::env::var("YT_DLP_BIN")
                .ok()
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or(defaults.yt_dlp_bin),
            yt_dlp_timeout: read_seconds_env("YT_DLP_TIMEOUT_SECONDS")
                .unwrap_or(defaults.yt_dlp_timeout),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_concurrent_downloads),
            download_attempts: read_usize_env("DOWNLOAD_ATTEMPTS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.download_attempts),
            job_timeout: read_seconds_env("JOB_TIMEOUT_SECONDS").unwrap_or(defaults.job_timeout),
            job_retention: read_seconds_env("JOB_RETENTION_SECONDS")
                .unwrap_or(defaults.job_retention),
            max_tracked_jobs: read_usize_env("MAX_TRACKED_JOBS")
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_tracked_jobs),
            file_retention: read_seconds_env("FILE_RETENTION_SECONDS")
                .unwrap_or(defaults.file_retention),
            stale_transfer_age: read_seconds_env("STALE_TRANSFER_SECONDS")
                .unwrap_or(defaults.stale_transfer_age),
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_seconds_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_secs)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
