/// Error taxonomy for the consolidation engine.
///
/// Model-call failures carry a `ModelErrorKind` so the retry policy can
/// decide by inspection instead of string matching. Everything else folds
/// into `KaiError`, which commands render as a single diagnostic line.
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

// ── Model error kinds ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    RateLimit,
    ServerOverloaded,
    NetworkError,
    NoResponse,
    EmptyResponse,
    InvalidApiKey,
    InvalidModel,
    SafetyBlock,
    RecitationBlock,
}

impl ModelErrorKind {
    /// Retryable kinds are retried inside the client with exponential
    /// backoff; terminal kinds surface immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ModelErrorKind::RateLimit
                | ModelErrorKind::ServerOverloaded
                | ModelErrorKind::NetworkError
                | ModelErrorKind::NoResponse
                | ModelErrorKind::EmptyResponse
        )
    }
}

impl fmt::Display for ModelErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelErrorKind::RateLimit => "RATE_LIMIT",
            ModelErrorKind::ServerOverloaded => "SERVER_OVERLOADED",
            ModelErrorKind::NetworkError => "NETWORK_ERROR",
            ModelErrorKind::NoResponse => "NO_RESPONSE",
            ModelErrorKind::EmptyResponse => "EMPTY_RESPONSE",
            ModelErrorKind::InvalidApiKey => "INVALID_API_KEY",
            ModelErrorKind::InvalidModel => "INVALID_MODEL",
            ModelErrorKind::SafetyBlock => "SAFETY_BLOCK",
            ModelErrorKind::RecitationBlock => "RECITATION_BLOCK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("model error [{kind}] from {model}: {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
    /// Model identifier the call was issued against.
    pub model: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            model: model.into(),
        }
    }
}

// ── Engine-level errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KaiError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path escapes project root: {}", .0.display())]
    PathEscape(PathBuf),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("patch failed: {0}")]
    Patch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ModelErrorKind::RateLimit.is_retryable());
        assert!(ModelErrorKind::ServerOverloaded.is_retryable());
        assert!(ModelErrorKind::NetworkError.is_retryable());
        assert!(ModelErrorKind::NoResponse.is_retryable());
        assert!(ModelErrorKind::EmptyResponse.is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!ModelErrorKind::InvalidApiKey.is_retryable());
        assert!(!ModelErrorKind::InvalidModel.is_retryable());
        assert!(!ModelErrorKind::SafetyBlock.is_retryable());
        assert!(!ModelErrorKind::RecitationBlock.is_retryable());
    }

    #[test]
    fn test_model_error_display() {
        let e = ModelError::new(ModelErrorKind::RateLimit, "too many requests", "primary");
        let s = e.to_string();
        assert!(s.contains("RATE_LIMIT"));
        assert!(s.contains("primary"));
        assert!(s.contains("too many requests"));
    }
}
