#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use tempfile::TempDir;
use tower::ServiceExt;
use tube_grab::{
    config::AppConfig,
    extractor::{
        DownloadedMedia, ExtractorError, ExtractorOptions, MediaExtractor, MediaInfo,
        ProgressSink, TransferProgress,
    },
    routes::router,
    state::AppState,
};

/// Stand-in for yt-dlp: fails a fixed number of times, then writes a small
/// file into the output directory.
pub struct ScriptedExtractor {
    pub failures_before_success: usize,
    pub failure_message: String,
    pub total_bytes: Option<u64>,
    pub title: String,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn succeeding() -> Self {
        Self {
            failures_before_success: 0,
            failure_message: String::new(),
            total_bytes: Some(200),
            title: "Sample Clip".to_string(),
            delay: Duration::from_millis(10),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failures_before_success: usize::MAX,
            failure_message: message.to_string(),
            ..Self::succeeding()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_attempt(&self) -> Result<(), ExtractorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            Err(ExtractorError::Failed(format!(
                "{} (intento {})",
                self.failure_message,
                call + 1
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaExtractor for ScriptedExtractor {
    async fn extract_info(
        &self,
        _url: &str,
        _options: &ExtractorOptions,
    ) -> Result<MediaInfo, ExtractorError> {
        self.next_attempt()?;
        Ok(MediaInfo {
            title: self.title.clone(),
            id: Some("abc123".to_string()),
            ext: Some("mp4".to_string()),
        })
    }

    async fn download(
        &self,
        _url: &str,
        options: &ExtractorOptions,
        progress: ProgressSink,
    ) -> Result<DownloadedMedia, ExtractorError> {
        self.next_attempt()?;

        progress(TransferProgress {
            downloaded_bytes: 50,
            total_bytes: self.total_bytes,
        });
        tokio::time::sleep(self.delay).await;

        let output_dir = options
            .output_dir
            .clone()
            .ok_or(ExtractorError::MissingFile)?;
        let extension = if options.extract_audio { "mp3" } else { "mp4" };
        let path = output_dir.join(format!("Sample_Clip-abc123.{extension}"));
        tokio::fs::write(&path, b"media bytes").await?;

        Ok(DownloadedMedia {
            path,
            title: self.title.clone(),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub extractor: Arc<ScriptedExtractor>,
    _transfer_dir: TempDir,
}

pub fn spawn_app(extractor: ScriptedExtractor) -> TestApp {
    spawn_app_with(extractor, |_| {})
}

/// Like [`spawn_app`], with a hook to adjust the configuration first.
pub fn spawn_app_with(
    extractor: ScriptedExtractor,
    configure: impl FnOnce(&mut AppConfig),
) -> TestApp {
    let transfer_dir = tempfile::tempdir().expect("temp dir");
    let mut config = AppConfig {
        transfer_dir: transfer_dir.path().to_path_buf(),
        file_retention: Duration::from_secs(3600),
        ..AppConfig::default()
    };
    configure(&mut config);
    let extractor = Arc::new(extractor);
    let state = AppState::new(config, extractor.clone(), true, false);

    TestApp {
        router: router(state.clone()),
        state,
        extractor,
        _transfer_dir: transfer_dir,
    }
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
        let response = self
            .router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body.to_vec(), headers)
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body, _) = self.get(uri).await;
        let json = serde_json::from_slice(&body).expect("json body");
        (status, json)
    }

    pub async fn post_json(&self, uri: &str, payload: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request");
        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&body).expect("json body"))
    }

    /// Polls the status route until the job reaches a terminal state.
    pub async fn wait_for_terminal(&self, job_id: &str) -> serde_json::Value {
        for _ in 0..250 {
            let (status, body) = self.get_json(&format!("/download-status/{job_id}")).await;
            assert_eq!(status, StatusCode::OK);
            if matches!(body["status"].as_str(), Some("completed" | "failed")) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never finished");
    }
}
