//! Error types for cast-stream.

use std::time::Duration;

use crate::transport::TransportError;

/// Main error type for driver and node operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Transport error that cannot be retried away.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The transport stopped delivering events.
    #[error("transport event stream closed")]
    EventsClosed,

    /// I/O error on the byte-stream side.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A per-tick or per-payload failure on the data path.
///
/// Faults are values, not errors: the pipeline reports them and carries on
/// with the next member, tick or payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineFault {
    /// No flow token became available in time.
    #[error("no flow token within {0:?}")]
    TokenTimeout(Duration),

    /// The transport refused a submission.
    #[error("send on member {index} rejected: {reason}")]
    SendRejected {
        /// Member index.
        index: usize,
        /// Transport error text.
        reason: String,
    },
}

/// Result type alias for cast-stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
