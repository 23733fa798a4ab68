//! Error types for the batching pipeline.

use std::io;
use thiserror::Error;

use crate::worker::WorkerId;

/// Main error type for batching operations.
///
/// The type is `Clone` so a terminal service status can hand the same
/// failure to every subsequent `status`/`take` call.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("range {offset}+{count} out of bounds for {path} ({size} bytes)")]
    OutOfRange {
        path: String,
        offset: u64,
        count: u64,
        size: u64,
    },

    #[error("shape mismatch at item {index}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("cannot open {path}: {message}")]
    Open { path: String, message: String },

    #[error("transient failure: {0}")]
    Transient(String),

    /// Cooperative cancellation signal.
    ///
    /// Never surfaced to consumers as a failure; they observe the terminal
    /// `None` instead.
    #[error("channel closed")]
    ChannelClosed,

    #[error("worker {worker} lost")]
    WorkerLost { worker: WorkerId },

    #[error("worker {worker}: {source}")]
    Remote {
        worker: WorkerId,
        #[source]
        source: Box<BatchError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl BatchError {
    /// Shorthand for an `InvalidArgument` with a formatted message.
    pub fn invalid(message: impl Into<String>) -> Self {
        BatchError::InvalidArgument(message.into())
    }

    /// Wrap a worker-side failure with the worker's identity.
    ///
    /// Errors that already carry a worker id are passed through unchanged.
    pub fn remote(worker: WorkerId, source: BatchError) -> Self {
        match source {
            remote @ BatchError::Remote { .. } => remote,
            other => BatchError::Remote {
                worker,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, BatchError::Transient(_))
    }

    /// Whether this error is the cooperative cancellation signal.
    pub fn is_closed(&self) -> bool {
        matches!(self, BatchError::ChannelClosed)
    }

    /// Classify an I/O failure from a storage backend.
    ///
    /// Interrupted and partial reads are transient and subject to retry;
    /// missing or unreadable objects are not.
    pub fn from_io(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => BatchError::Transient(format!("{}: {}", path, err)),
            _ => BatchError::Open {
                path: path.to_string(),
                message: err.to_string(),
            },
        }
    }
}
