use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::AppConfig,
    error::ApiError,
    extractor::{MediaExtractor, YtDlp, ffmpeg_available},
    files::cleanup_stale_download_jobs,
    routes::{DOWNLOAD_FILENAME_HEADER, router},
    state::AppState,
};

const DEV_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

pub async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.transfer_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "No se pudo crear la carpeta temporal de descargas: {error}"
            ))
        })?;
    cleanup_stale_download_jobs(&config.transfer_dir, config.stale_transfer_age).await;

    let extractor = YtDlp::new(config.yt_dlp_bin.clone(), config.yt_dlp_timeout);
    let extractor_available = extractor.is_available().await;
    if !extractor_available {
        warn!(
            "{} no responde. Las descargas fallaran hasta que se instale.",
            config.yt_dlp_bin
        );
    }
    let audio_conversion = ffmpeg_available().await;
    if !audio_conversion {
        warn!("ffmpeg no encontrado. El audio se entregara en su formato original.");
    }

    let cors = build_cors_layer(&config.allowed_origins)?;
    let addr = config.bind_addr.clone();
    let extractor: Arc<dyn MediaExtractor> = Arc::new(extractor);
    let state = AppState::new(config, extractor, extractor_available, audio_conversion);
    let runner = Arc::clone(&state.runner);

    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("No se pudo iniciar el puerto {addr}: {error}"))
    })?;

    info!("Servidor listo en http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!("No se pudo escuchar la senal de apagado: {error}");
                std::future::pending::<()>().await;
            }
            info!("Apagando servidor, cancelando descargas en curso");
            runner.shutdown();
        })
        .await
        .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")))
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let origins: Vec<String> = if configured.is_empty() {
        warn!("ALLOWED_ORIGINS no esta configurado. Se usaran origenes de desarrollo por defecto.");
        DEV_ORIGINS.iter().map(ToString::to_string).collect()
    } else {
        configured.to_vec()
    };

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        normalized_origins.len(),
        normalized_origins
    );

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(?origin, ?normalized, allowed, "CORS origin check");
        allowed
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        ]))
}

/// `scheme://host[:port]` with the default port dropped, or `None` when the
/// value is not a bare http(s) origin.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // Url already strips a port that matches the scheme default.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
