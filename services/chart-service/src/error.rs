//! Error types for the chart service

use crate::bucket::BucketKey;
use services_common::TypeError;
use thiserror::Error;

/// Chart service error types
#[derive(Debug, Error)]
pub enum ChartError {
    /// Backing store could not be reached; retried with backoff
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Retry budget exhausted for a sealed bar
    #[error("Persistence failed for {key} after {attempts} attempts: {reason}")]
    PersistenceFailed {
        /// Bar that was dropped
        key: BucketKey,
        /// Attempts made
        attempts: u32,
        /// Last storage error
        reason: String,
    },

    /// Subscriber queue stayed full past the grace period
    #[error("Subscriber {session_id} overran its queue")]
    SubscriberOverrun {
        /// Closed session
        session_id: u64,
    },

    /// Engine is tearing down and refuses new work
    #[error("Engine is shutting down")]
    EngineShuttingDown,

    /// Invariant violation; a programming defect
    #[error("Logic error: {0}")]
    Logic(String),

    /// Invalid request error
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encoding error
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Journal integrity violation
    #[error("Corrupt journal: {0}")]
    Corrupt(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ChartError {
    /// True for errors that must abort the process rather than be handled
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Logic(_))
    }

    /// True for transient storage failures worth another attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Io(_))
    }
}

impl From<TypeError> for ChartError {
    fn from(err: TypeError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<config::ConfigError> for ChartError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for chart operations
pub type ChartResult<T> = Result<T, ChartError>;
