//! Error types for the consistency pipeline.
//!
//! Each concern gets its own enum so callers can tell a malformed box apart
//! from an exhausted network call. Per-image code converts everything into
//! `anyhow::Error` at the image boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to read a bounding box from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoxParseError {
    #[error("empty box text")]
    Empty,

    #[error("unrecognized box encoding: {0:?}")]
    UnknownEncoding(String),

    #[error("expected 4 coordinates, found {found} in {text:?}")]
    WrongArity { text: String, found: usize },

    #[error("coordinate {0:?} is not a non-negative integer")]
    BadCoordinate(String),

    #[error("box corners out of order: ({x1}, {y1}) must be left of and above ({x2}, {y2})")]
    Unordered { x1: u32, y1: u32, x2: u32, y2: u32 },
}

/// Failure to pull a JSON document out of model output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("model output is empty")]
    Empty,

    #[error("no code fence found")]
    NoFence,

    #[error("no brace-delimited object found")]
    NoObject,

    #[error("invalid JSON: {0}")]
    Invalid(String),

    #[error("no extraction strategy succeeded (last error: {0})")]
    Exhausted(Box<ExtractError>),
}

/// Failure of a single call to an annotation service.
#[derive(Debug, Error)]
pub enum AnnotationError {
    /// Network failure, timeout, throttling or server-side error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service refused the request (4xx other than 429).
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The service answered but the answer is unusable.
    #[error("content error: {0}")]
    Content(String),

    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AnnotationError {
    /// Whether a retry might succeed.
    #[inline]
    #[must_use = "returns whether the error is retryable"]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ExtractError> for AnnotationError {
    fn from(err: ExtractError) -> Self {
        Self::Content(err.to_string())
    }
}

/// Failure of the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("results file {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

/// Failure to load configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_retry() {
        assert!(AnnotationError::Transport("timeout".into()).is_retryable());
        assert!(!AnnotationError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
        assert!(!AnnotationError::Content("empty".into()).is_retryable());
    }

    #[test]
    fn test_extract_error_becomes_content_error() {
        let err: AnnotationError = ExtractError::Empty.into();
        assert!(matches!(err, AnnotationError::Content(_)));
    }
}
