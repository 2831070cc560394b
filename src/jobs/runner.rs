use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{JobId, JobRegistry, JobUpdate};
use crate::{
    extractor::{
        DownloadedMedia, ExtractorError, ExtractorOptions, MediaExtractor, MediaRequest,
        ProgressSink, with_identity_rotation,
    },
    files::{cleanup_download_job, descriptive_filename},
};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub transfer_dir: PathBuf,
    pub attempts: usize,
    pub max_concurrent_downloads: usize,
    pub audio_conversion: bool,
}

/// Drives each submitted job on its own tokio task.
///
/// Concurrency is bounded by a semaphore; a job stays pending until it holds
/// a permit. Every job listens on a child of the runner's shutdown token.
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    extractor: Arc<dyn MediaExtractor>,
    settings: RunnerSettings,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    cancellations: Mutex<HashMap<JobId, CancellationToken>>,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        extractor: Arc<dyn MediaExtractor>,
        settings: RunnerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1)));
        Self {
            registry,
            extractor,
            settings,
            permits,
            shutdown: CancellationToken::new(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.settings.transfer_dir.join(id.to_string())
    }

    fn cancellations(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a job for `request` and starts it in the background.
    /// Returns as soon as the job exists.
    pub fn submit(self: &Arc<Self>, request: MediaRequest) -> JobId {
        for evicted in self.registry.prune(Utc::now()) {
            self.cancellations().remove(&evicted.id);
            let job_dir = self.job_dir(evicted.id);
            tokio::spawn(async move { cleanup_download_job(&job_dir).await });
        }

        let id = self.registry.create(request.clone());
        let token = self.shutdown.child_token();
        self.cancellations().insert(id, token.clone());

        info!(job_id = %id, url = %request.url, format = request.format.as_str(), "Descarga en segundo plano iniciada");

        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run(id, request, token).await });
        id
    }

    /// Stops the job's extractor if it is still running.
    pub fn cancel(&self, id: JobId) {
        if let Some(token) = self.cancellations().remove(&id) {
            token.cancel();
        }
    }

    /// Cancels every running job; used on graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(&self, id: JobId, request: MediaRequest, token: CancellationToken) {
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(ExtractorError::Cancelled),
            result = self.execute(id, &request) => result,
        };

        match outcome {
            Ok(media) => {
                let filename = descriptive_filename(&media.title, &request, Some(&media.path));
                let recorded = self
                    .registry
                    .update(id, JobUpdate::completed(media.path, media.title, filename.clone()));
                if recorded {
                    info!(job_id = %id, filename = %filename, "Descarga completada");
                } else {
                    // Already failed by a status read; nobody can fetch the file.
                    warn!(job_id = %id, "Descarga terminada despues de expirar, se descarta");
                    cleanup_download_job(&self.job_dir(id)).await;
                }
            }
            Err(error) => {
                warn!(job_id = %id, "Descarga fallida: {error}");
                self.registry.update(id, JobUpdate::failed(error.to_string()));
                cleanup_download_job(&self.job_dir(id)).await;
            }
        }

        self.cancellations().remove(&id);
    }

    async fn execute(
        &self,
        id: JobId,
        request: &MediaRequest,
    ) -> Result<DownloadedMedia, ExtractorError> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExtractorError::Cancelled)?;

        let job_dir = self.job_dir(id);
        tokio::fs::create_dir_all(&job_dir).await?;
        self.registry.update(id, JobUpdate::downloading());

        let sink: ProgressSink = {
            let registry = Arc::clone(&self.registry);
            Arc::new(move |progress| {
                registry.update(id, JobUpdate::transfer(progress));
            })
        };

        download_with_retries(
            self.extractor.as_ref(),
            request,
            &job_dir,
            self.settings.attempts,
            self.settings.audio_conversion,
            sink,
        )
        .await
    }
}

/// Downloads `request` into `job_dir`, rotating identities between attempts.
pub async fn download_with_retries(
    extractor: &dyn MediaExtractor,
    request: &MediaRequest,
    job_dir: &Path,
    attempts: usize,
    audio_conversion: bool,
    progress: ProgressSink,
) -> Result<DownloadedMedia, ExtractorError> {
    let options =
        ExtractorOptions::for_request(request, audio_conversion).with_output_dir(job_dir);

    with_identity_rotation(attempts, options, |options| {
        let progress = progress.clone();
        async move { extractor.download(&request.url, &options, progress).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        extractor::{MediaFormat, MediaInfo, Quality},
        jobs::JobStatus,
    };

    /// Finishes the download but first fails the job in the registry, the
    /// way a status read past the deadline does.
    struct ExpiringExtractor {
        registry: Arc<JobRegistry>,
    }

    #[async_trait]
    impl MediaExtractor for ExpiringExtractor {
        async fn extract_info(
            &self,
            _url: &str,
            _options: &ExtractorOptions,
        ) -> Result<MediaInfo, ExtractorError> {
            Err(ExtractorError::Failed("sin metadatos".to_string()))
        }

        async fn download(
            &self,
            _url: &str,
            options: &ExtractorOptions,
            _progress: ProgressSink,
        ) -> Result<DownloadedMedia, ExtractorError> {
            let job_dir = options.output_dir.clone().ok_or(ExtractorError::MissingFile)?;
            let id: JobId = job_dir
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse().ok())
                .ok_or(ExtractorError::MissingFile)?;
            self.registry
                .update(id, JobUpdate::failed("La descarga excedio el tiempo limite"));

            let path = job_dir.join("clip.mp4");
            tokio::fs::write(&path, b"late bytes").await?;
            Ok(DownloadedMedia {
                path,
                title: "Clip".to_string(),
            })
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn late_completion_of_an_expired_job_removes_its_files() {
        let transfer_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(1200), 1000));
        let extractor = Arc::new(ExpiringExtractor {
            registry: Arc::clone(&registry),
        });
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&registry),
            extractor,
            RunnerSettings {
                transfer_dir: transfer_dir.path().to_path_buf(),
                attempts: 1,
                max_concurrent_downloads: 1,
                audio_conversion: false,
            },
        ));

        let id = runner.submit(MediaRequest {
            url: "https://www.youtube.com/watch?v=abc".to_string(),
            format: MediaFormat::Video,
            quality: Quality::Best,
        });

        let job_dir = runner.job_dir(id);
        for _ in 0..200 {
            let job = registry.get(id).unwrap();
            if job.status == JobStatus::Failed && !job_dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.file_path.is_none());
        assert!(!job_dir.exists());
    }
}
