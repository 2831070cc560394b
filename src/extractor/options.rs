use std::path::{Path, PathBuf};

use super::{ClientIdentity, DEFAULT_REFERER, MediaFormat, MediaRequest};

const SOCKET_TIMEOUT_SECONDS: u32 = 20;
const NETWORK_RETRIES: u32 = 5;
const FRAGMENT_RETRIES: u32 = 5;
const FRAGMENT_RETRY_SLEEP: &str = "fragment:linear=5::5";
const THROTTLED_RATE: &str = "100K";
const SOURCE_ADDRESS: &str = "0.0.0.0";
const AUDIO_CODEC: &str = "mp3";
const AUDIO_QUALITY: &str = "256K";
const OUTPUT_FILENAME_TEMPLATE: &str = "%(title).140B-%(id)s.%(ext)s";
const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s";
const RESULT_TEMPLATE: &str = "after_move:%(.{title,filepath})j";

/// Configuration handed to the extraction tool for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorOptions {
    pub format_selector: String,
    pub output_dir: Option<PathBuf>,
    pub extract_audio: bool,
    pub identity: ClientIdentity,
    pub referer: &'static str,
    pub socket_timeout_secs: u32,
    pub retries: u32,
    pub fragment_retries: u32,
}

impl ExtractorOptions {
    /// Base options for `request` merged with a random identity.
    /// `audio_conversion` reports whether ffmpeg can transcode to mp3.
    pub fn for_request(request: &MediaRequest, audio_conversion: bool) -> Self {
        Self {
            format_selector: request.format_selector(),
            output_dir: None,
            extract_audio: audio_conversion && request.format == MediaFormat::Audio,
            identity: ClientIdentity::random(),
            referer: DEFAULT_REFERER,
            socket_timeout_secs: SOCKET_TIMEOUT_SECONDS,
            retries: NETWORK_RETRIES,
            fragment_retries: FRAGMENT_RETRIES,
        }
    }

    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = Some(dir.to_path_buf());
        self
    }

    pub fn rotate_identity(&mut self) {
        self.identity = ClientIdentity::random();
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            "--format".to_string(),
            self.format_selector.clone(),
            "--no-playlist".to_string(),
            "--restrict-filenames".to_string(),
            "--no-warnings".to_string(),
            "--user-agent".to_string(),
            self.identity.user_agent.to_string(),
            "--referer".to_string(),
            self.referer.to_string(),
            "--extractor-args".to_string(),
            format!("youtube:player_client={}", self.identity.player_client),
            "--socket-timeout".to_string(),
            self.socket_timeout_secs.to_string(),
            "--retries".to_string(),
            self.retries.to_string(),
            "--source-address".to_string(),
            SOURCE_ADDRESS.to_string(),
            "--no-check-certificates".to_string(),
        ]
    }

    /// Arguments that resolve metadata only, as one JSON document.
    pub fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push("-J".to_string());
        args.push(url.to_string());
        args
    }

    /// Arguments that download into `output_dir`, emit progress lines and
    /// print the final file location as JSON.
    pub fn download_args(&self, url: &str) -> Vec<String> {
        let mut args = self.common_args();

        args.extend([
            "--fragment-retries".to_string(),
            self.fragment_retries.to_string(),
            "--abort-on-unavailable-fragments".to_string(),
            "--retry-sleep".to_string(),
            FRAGMENT_RETRY_SLEEP.to_string(),
            "--throttled-rate".to_string(),
            THROTTLED_RATE.to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            RESULT_TEMPLATE.to_string(),
        ]);

        if let Some(dir) = &self.output_dir {
            args.push("-o".to_string());
            args.push(format!(
                "{}/{OUTPUT_FILENAME_TEMPLATE}",
                dir.to_string_lossy()
            ));
        }

        if self.extract_audio {
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                AUDIO_CODEC.to_string(),
                "--audio-quality".to_string(),
                AUDIO_QUALITY.to_string(),
            ]);
        }

        args.push(url.to_string());
        args
    }
}
