//! Error types for the ggufsmith pipeline.
//!
//! Required-stage errors propagate and halt the pipeline; fan-out and
//! publish errors are collected into the final report instead.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    // Environment provisioning (fatal: stages that need the environment
    // must not run with unmet dependencies)
    #[error("Provisioning failed: {message}")]
    Provisioning { message: String },

    // External stage execution
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    // Per-file publish failures
    #[error("Publish failed for {path}: {message}")]
    Publish { path: PathBuf, message: String },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(Duration::from_secs(0))
        } else {
            Error::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl Error {
    /// Create an IO error with operation and path context.
    pub fn io(context: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Error::Io {
            message: format!("{context}: {err}"),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a stage execution error.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Check if this error should trigger a retry.
    ///
    /// Only transient transport failures qualify; a rejected upload or a
    /// failed external process will not improve on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network { .. } | Error::Timeout(_) | Error::Publish { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::stage("merge-adapter", "exited with status 1");
        assert_eq!(
            err.to_string(),
            "Stage 'merge-adapter' failed: exited with status 1"
        );

        let err = Error::Provisioning {
            message: "pip install failed".into(),
        };
        assert_eq!(err.to_string(), "Provisioning failed: pip install failed");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(Error::Publish {
            path: PathBuf::from("model.gguf"),
            message: "HTTP 500".into(),
        }
        .is_retryable());
        assert!(!Error::Provisioning {
            message: "venv creation failed".into(),
        }
        .is_retryable());
        assert!(!Error::stage("convert-gguf", "missing output").is_retryable());
    }

    #[test]
    fn test_io_context() {
        let err = Error::io(
            "creating artifact dir",
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("creating artifact dir"));
        assert!(rendered.contains("/tmp/x"));
    }
}
