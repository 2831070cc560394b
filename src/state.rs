use std::sync::Arc;

use crate::{
    config::AppConfig,
    extractor::MediaExtractor,
    jobs::{JobRegistry, JobRunner, RunnerSettings},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub extractor: Arc<dyn MediaExtractor>,
    pub runner: Arc<JobRunner>,
    /// yt-dlp answered `--version` at startup.
    pub extractor_available: bool,
    /// ffmpeg was found at startup, so audio can be converted to mp3.
    pub audio_conversion: bool,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        extractor: Arc<dyn MediaExtractor>,
        extractor_available: bool,
        audio_conversion: bool,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(
            config.job_retention,
            config.max_tracked_jobs,
        ));
        let runner = Arc::new(JobRunner::new(
            registry,
            Arc::clone(&extractor),
            RunnerSettings {
                transfer_dir: config.transfer_dir.clone(),
                attempts: config.download_attempts,
                max_concurrent_downloads: config.max_concurrent_downloads,
                audio_conversion,
            },
        ));

        Self {
            config: Arc::new(config),
            extractor,
            runner,
            extractor_available,
            audio_conversion,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        self.runner.registry()
    }
}
