use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{info, warn};

use crate::extractor::MediaRequest;

const FALLBACK_TITLE: &str = "download";
const SHORT_PREFIX: &str = "Short_";

/// Title reduced to letters, digits, `-` and `_` in any script, with
/// spaces turned into underscores.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|character| character.is_alphanumeric() || matches!(character, ' ' | '-' | '_'))
        .collect();
    kept.trim().replace(' ', "_")
}

/// Name offered to the browser. The extension comes from the downloaded
/// file when there is one, otherwise from the requested format.
pub fn descriptive_filename(title: &str, request: &MediaRequest, file: Option<&Path>) -> String {
    let mut stem = sanitize_title(title);
    if stem.is_empty() {
        stem = FALLBACK_TITLE.to_string();
    }
    if request.is_short() {
        stem = format!("{SHORT_PREFIX}{stem}");
    }

    let extension = file
        .and_then(|path| path.extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| request.format.default_extension().to_string());

    format!("{stem}.{extension}")
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

pub async fn cleanup_download_job(job_dir: &Path) {
    match tokio::fs::remove_dir_all(job_dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => info!("No se pudo limpiar carpeta temporal {:?}: {error}", job_dir),
    }
}

pub fn schedule_cleanup_download_job(job_dir: PathBuf, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        cleanup_download_job(&job_dir).await;
    });
}

/// Removes leftovers from a previous run: anything in `transfer_dir` not
/// modified for `max_age`.
pub async fn cleanup_stale_download_jobs(transfer_dir: &Path, max_age: Duration) {
    if max_age.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir carpeta temporal para limpieza: {error}");
            }
            return;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("No se pudo iterar carpeta temporal para limpieza: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!(removed, "Descargas temporales antiguas eliminadas");
    }
}
