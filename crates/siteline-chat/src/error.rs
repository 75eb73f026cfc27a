//! Error types for the chat core

use thiserror::Error;

/// Longest error body kept from a failed endpoint response.
pub(crate) const MAX_ERROR_BODY: usize = 512;

/// Chat core error types
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Endpoint {endpoint} returned HTTP {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Stream ended before completion: {0}")]
    StreamAborted(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether another attempt (same or next endpoint) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            Self::InvalidResponse { .. }
            | Self::Timeout(_)
            | Self::StreamAborted(_)
            | Self::Http(_) => true,
            Self::WebSocket(_) => true,
            Self::Cancelled | Self::Url(_) | Self::Config(_) | Self::Json(_) => false,
        }
    }

    pub(crate) fn status(endpoint: &str, status: u16, body: String) -> Self {
        Self::Status {
            endpoint: endpoint.to_string(),
            status,
            message: truncate_body(body),
        }
    }

    pub(crate) fn invalid(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}

/// Truncate error body to keep large or sensitive responses out of logs.
pub(crate) fn truncate_body(body: String) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut cut = MAX_ERROR_BODY;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated]", &body[..cut])
}

/// Result type alias for chat operations
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retryability() {
        assert!(ChatError::status("/api/chat", 503, String::new()).is_retryable());
        assert!(ChatError::status("/api/chat", 429, String::new()).is_retryable());
        assert!(!ChatError::status("/api/chat", 404, String::new()).is_retryable());
        assert!(!ChatError::Cancelled.is_retryable());
        assert!(ChatError::StreamAborted("eof".to_string()).is_retryable());
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate_body(body);
        assert!(truncated.ends_with("... [truncated]"));
        assert!(truncated.len() <= MAX_ERROR_BODY + "... [truncated]".len());

        assert_eq!(truncate_body("short".to_string()), "short");
    }
}
