use std::{io::ErrorKind, path::Path, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::non_empty,
    error::ApiError,
    extractor::{
        ExtractorOptions, MediaFormat, MediaRequest, ProgressSink, Quality, TransferProgress,
        with_identity_rotation,
    },
    files::{
        build_content_disposition, cleanup_download_job, content_type_for_filename,
        descriptive_filename, schedule_cleanup_download_job,
    },
    jobs::{Job, JobId, JobStatus, download_with_retries},
    state::AppState,
};

pub const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/download", post(prepare_download))
        .route("/stream-download", get(stream_download))
        .route("/initiate-download", get(initiate_download))
        .route("/download-status/{job_id}", get(download_status))
        .route("/download-file/{job_id}", get(download_file))
        .with_state(state)
}

/// Query string or JSON body shared by every download entry point.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadParams {
    pub url: Option<String>,
    pub format: Option<String>,
    pub quality: Option<String>,
}

impl DownloadParams {
    pub fn into_request(self) -> Result<MediaRequest, ApiError> {
        let url = self
            .url
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| ApiError::bad_request("No se proporciono una URL."))?;
        if !is_http_url(url) {
            return Err(ApiError::bad_request(
                "La URL no es valida. Usa una direccion http o https completa.",
            ));
        }

        let format = match self.format.as_deref().and_then(non_empty) {
            None => MediaFormat::Video,
            Some(value) => MediaFormat::parse(value).ok_or_else(|| {
                ApiError::bad_request(format!("Formato no soportado: {value}. Usa video o audio."))
            })?,
        };
        let quality = match self.quality.as_deref().and_then(non_empty) {
            None => Quality::Best,
            Some(value) => Quality::parse(value).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "Calidad no soportada: {value}. Usa best, 1080, 720 o 480."
                ))
            })?,
        };

        Ok(MediaRequest {
            url: url.to_string(),
            format,
            quality,
        })
    }
}

fn is_http_url(input: &str) -> bool {
    Url::parse(input)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some())
        .unwrap_or(false)
}

fn stream_download_url(request: &MediaRequest) -> String {
    format!(
        "/stream-download?url={}&format={}&quality={}",
        urlencoding::encode(&request.url),
        request.format.as_str(),
        request.quality.as_str()
    )
}

fn parse_job_id(value: &str) -> Result<JobId, ApiError> {
    Uuid::parse_str(value.trim()).map_err(|_| ApiError::not_found("Descarga no encontrada."))
}

#[derive(Debug, Serialize)]
struct PrepareResponse {
    success: bool,
    message: String,
    title: String,
    download_url: String,
    filename: String,
}

#[derive(Debug, Serialize)]
struct InitiateResponse {
    job_id: JobId,
    status: JobStatus,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct StatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_known: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for StatusResponse {
    fn from(job: &Job) -> Self {
        let completed = job.status == JobStatus::Completed;
        let failed = job.status == JobStatus::Failed;

        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            progress_known: job.progress_known,
            title: job.title.clone().filter(|_| completed),
            filename: job.filename.clone().filter(|_| completed),
            download_url: completed.then(|| format!("/download-file/{}", job.id)),
            error: job.error.clone().filter(|_| failed),
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let registry = state.registry();
    let pending = registry.count_with_status(JobStatus::Pending);
    let downloading = registry.count_with_status(JobStatus::Downloading);
    Json(serde_json::json!({
        "status": "ok",
        "extractor_available": state.extractor_available,
        "audio_conversion": state.audio_conversion,
        "tracked_jobs": registry.len(),
        "active_jobs": pending + downloading,
        "pending_jobs": pending,
    }))
}

async fn prepare_download(
    State(state): State<AppState>,
    Json(params): Json<DownloadParams>,
) -> Result<Json<PrepareResponse>, ApiError> {
    let request = params.into_request()?;
    let extractor = state.extractor.as_ref();
    let url = request.url.as_str();
    let options = ExtractorOptions::for_request(&request, state.audio_conversion);

    let info = with_identity_rotation(state.config.download_attempts, options, |options| async move {
        extractor.extract_info(url, &options).await
    })
    .await
    .map_err(|error| {
        warn!(url = %request.url, "No se pudo obtener informacion del video: {error}");
        ApiError::from(error)
    })?;

    let kind = match request.format {
        MediaFormat::Video => "video",
        MediaFormat::Audio => "audio",
    };

    Ok(Json(PrepareResponse {
        success: true,
        message: format!("Listo para descargar. Pulsa el boton para obtener tu {kind}."),
        filename: descriptive_filename(&info.title, &request, None),
        title: info.title,
        download_url: stream_download_url(&request),
    }))
}

async fn stream_download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let request = params.into_request()?;
    let job_dir = state
        .config
        .transfer_dir
        .join(format!("stream-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&job_dir).await.map_err(|error| {
        ApiError::internal(format!("No se pudo preparar la descarga temporal: {error}"))
    })?;

    let ignore_progress: ProgressSink = Arc::new(|_: TransferProgress| {});
    let result = download_with_retries(
        state.extractor.as_ref(),
        &request,
        &job_dir,
        state.config.download_attempts,
        state.audio_conversion,
        ignore_progress,
    )
    .await;

    let media = match result {
        Ok(media) => media,
        Err(error) => {
            warn!(url = %request.url, "Descarga directa fallida: {error}");
            cleanup_download_job(&job_dir).await;
            return Err(error.into());
        }
    };

    let filename = descriptive_filename(&media.title, &request, Some(&media.path));
    let response = attachment_response(&media.path, &filename).await;
    schedule_cleanup_download_job(job_dir, state.config.file_retention);
    response
}

async fn initiate_download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<Json<InitiateResponse>, ApiError> {
    let request = params.into_request()?;
    let job_id = state.runner.submit(request);

    Ok(Json(InitiateResponse {
        job_id,
        status: JobStatus::Pending,
    }))
}

async fn download_status(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_job_id(&job_id)?;
    let query = state
        .registry()
        .query(id, Utc::now(), state.config.job_timeout)
        .ok_or_else(|| ApiError::not_found("Descarga no encontrada."))?;

    if query.timed_out {
        state.runner.cancel(id);
    }

    Ok(Json(StatusResponse::from(&query.job)))
}

async fn download_file(
    State(state): State<AppState>,
    UrlPath(job_id): UrlPath<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&job_id)?;
    let job = state
        .registry()
        .get(id)
        .ok_or_else(|| ApiError::not_found("Descarga no encontrada."))?;

    let path = job
        .file_path
        .as_deref()
        .filter(|_| job.status == JobStatus::Completed)
        .ok_or_else(|| ApiError::not_found("La descarga aun no esta lista."))?;
    let filename = job
        .filename
        .clone()
        .unwrap_or_else(|| descriptive_filename("", &job.request, Some(path)));

    let response = attachment_response(path, &filename).await?;
    info!(job_id = %id, filename = %filename, "Archivo entregado");
    schedule_cleanup_download_job(state.runner.job_dir(id), state.config.file_retention);
    Ok(response)
}

async fn attachment_response(path: &Path, filename: &str) -> Result<Response, ApiError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("El archivo ya no esta disponible."));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "No se pudo leer el archivo temporal: {error}"
            )));
        }
    };
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!(
            "No se pudo leer metadata del archivo temporal: {error}"
        ))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    if let Ok(value) = HeaderValue::from_str(filename) {
        headers.insert(HeaderName::from_static(DOWNLOAD_FILENAME_HEADER), value);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}
