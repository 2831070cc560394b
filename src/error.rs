use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::extractor::ExtractorError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("NOT_FOUND"),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }

    pub fn upstream_rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
            code: Some("UPSTREAM_RATE_LIMITED"),
        }
    }

    pub fn upstream_blocked(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            code: Some("UPSTREAM_BLOCKED"),
        }
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: message.into(),
            code: Some("UPSTREAM_TIMEOUT"),
        }
    }
}

/// Substring classification of an upstream failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamRejection {
    RateLimited,
    Blocked,
    Other,
}

pub fn classify_upstream_message(message: &str) -> UpstreamRejection {
    let lower = message.to_ascii_lowercase();

    if lower.contains("429") || lower.contains("too many requests") {
        UpstreamRejection::RateLimited
    } else if lower.contains("403")
        || lower.contains("forbidden")
        || lower.contains("sign in to confirm")
        || lower.contains("not a bot")
    {
        UpstreamRejection::Blocked
    } else {
        UpstreamRejection::Other
    }
}

impl From<ExtractorError> for ApiError {
    fn from(error: ExtractorError) -> Self {
        match error {
            ExtractorError::NotInstalled(binary) => ApiError::internal(format!(
                "{binary} no esta instalado en el sistema. Instala yt-dlp y reinicia el backend."
            )),
            ExtractorError::TimedOut(seconds) => ApiError::upstream_timeout(format!(
                "La descarga excedio el tiempo limite de {seconds} segundos. Intenta con otra URL o calidad."
            )),
            ExtractorError::Failed(message) => match classify_upstream_message(&message) {
                UpstreamRejection::RateLimited => ApiError::upstream_rate_limited(format!(
                    "El sitio de origen esta limitando las solicitudes: {message}"
                )),
                UpstreamRejection::Blocked => ApiError::upstream_blocked(format!(
                    "El sitio de origen bloqueo la descarga: {message}"
                )),
                UpstreamRejection::Other => ApiError::internal(message),
            },
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
        });

        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_messages_map_to_429() {
        let error = ApiError::from(ExtractorError::Failed(
            "ERROR: [youtube] abc: HTTP Error 429: Too Many Requests".to_string(),
        ));
        assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error.code, Some("UPSTREAM_RATE_LIMITED"));
    }

    #[test]
    fn bot_check_messages_map_to_403() {
        let error = ApiError::from(ExtractorError::Failed(
            "ERROR: [youtube] abc: Sign in to confirm you're not a bot".to_string(),
        ));
        assert_eq!(error.status, StatusCode::FORBIDDEN);

        let error = ApiError::from(ExtractorError::Failed(
            "HTTP Error 403: Forbidden".to_string(),
        ));
        assert_eq!(error.status, StatusCode::FORBIDDEN);

        let error = ApiError::from(ExtractorError::Failed(
            "Both formats are unavailable".to_string(),
        ));
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn generic_failures_map_to_500() {
        let error = ApiError::from(ExtractorError::Failed("Video unavailable".to_string()));
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message, "Video unavailable");
    }

    #[test]
    fn timeouts_map_to_504() {
        let error = ApiError::from(ExtractorError::TimedOut(180));
        assert_eq!(error.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(error.message.contains("180"));
    }

    #[test]
    fn missing_binary_is_an_internal_error() {
        let error = ApiError::from(ExtractorError::NotInstalled("yt-dlp".to_string()));
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error.message.starts_with("yt-dlp no esta instalado"));
    }
}
