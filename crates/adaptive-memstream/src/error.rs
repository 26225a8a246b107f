//! Error types for adaptive streaming
//!
//! Telemetry and reclamation never fail. Only admission checks, file access
//! and caller callbacks surface errors, and none of them are retried.

use std::path::PathBuf;

use thiserror::Error;

use crate::streaming::OpenMode;

/// Boxed error returned by caller-supplied processing callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, StreamingError>;

#[derive(Error, Debug)]
pub enum StreamingError {
    // ─── Environment ───

    #[error("Insufficient memory: required {required} bytes, {available} bytes available")]
    InsufficientMemory { required: u64, available: u64 },

    #[error("I/O error on {}: {source}", path.display())]
    StreamingIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─── Caller callbacks ───

    #[error("Processing failed at unit {index}: {source}")]
    StreamProcessing {
        index: usize,
        #[source]
        source: BoxError,
    },

    // ─── Argument validation ───

    #[error("Invalid open mode '{mode}': expected {expected}")]
    InvalidMode { mode: OpenMode, expected: &'static str },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StreamingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamingError::StreamingIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn processing(index: usize, source: impl Into<BoxError>) -> Self {
        StreamingError::StreamProcessing {
            index,
            source: source.into(),
        }
    }

    /// Index of the unit whose callback failed, if this is a processing error
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            StreamingError::StreamProcessing { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// True for caller programming errors rather than environment conditions
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            StreamingError::InvalidMode { .. } | StreamingError::InvalidConfig(_)
        )
    }
}
