use thiserror::Error;

/// Failure talking to the remote store.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Remote rejected the request credentials")]
    Unauthorized,

    #[error("Remote denied access: {0}")]
    AccessDenied(String),

    #[error("Remote record not found: {0}")]
    NotFound(String),

    #[error("Remote rejected conflicting write: {0}")]
    Conflict(String),

    #[error("Remote rate limit exceeded")]
    RateLimited,

    #[error("Remote server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),
}

/// Error bodies are cut to this many bytes before they reach an operation's error field
const MAX_ERROR_BODY_BYTES: usize = 500;

impl ApiError {
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_BYTES {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... ({} bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(body),
            404 => ApiError::NotFound(body),
            409 => ApiError::Conflict(body),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(body),
            _ => ApiError::InvalidResponse(format!("{}: {}", status, body)),
        }
    }

    /// Whether a later attempt could plausibly succeed without any change to
    /// the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited | ApiError::ServerError(_) | ApiError::Network(_) | ApiError::Unavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(ApiError::from_status(StatusCode::UNAUTHORIZED, ""), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(StatusCode::NOT_FOUND, "gone"), ApiError::NotFound(ref b) if b == "gone"));
        assert!(matches!(ApiError::from_status(StatusCode::CONFLICT, "dup"), ApiError::Conflict(_)));
        assert!(matches!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_GATEWAY, "x"), ApiError::ServerError(_)));
        assert!(matches!(ApiError::from_status(StatusCode::IM_A_TEAPOT, ""), ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ApiError::RateLimited.is_transient());
        assert!(ApiError::Unavailable("offline".into()).is_transient());
        assert!(!ApiError::Conflict("dup".into()).is_transient());
        assert!(!ApiError::Unauthorized.is_transient());
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.ends_with("(800 bytes)"));
        assert_eq!(ApiError::truncate_body("short"), "short");
    }
}
