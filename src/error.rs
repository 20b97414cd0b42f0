//! Error types for conditions callers need to branch on
//!
//! Most of the crate propagates `anyhow::Error` with context. The variants here
//! are the ones that carry protocol meaning: their `Display` text is sent to
//! clients as failure codes, and transport failures are retried by workers.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("work item {0} not found")]
    JobNotFound(u64),

    #[error("duplicate work item {0}")]
    DuplicateJob(u64),

    #[error("mismatched pipeline hash")]
    HashMismatch,

    #[error("timed out after {timeout:?} while {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("transport error while {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported address scheme '{0}' (expected tcp)")]
    UnsupportedScheme(String),

    #[error("work server is already running")]
    AlreadyServing,

    #[error("distributor has not been prepared")]
    NotPrepared,

    #[error("work server failed to start: {0}")]
    Startup(String),

    #[error("measurement {name} for image set {image_set} already exists")]
    MeasurementConflict { image_set: u64, name: String },
}

impl BrokerError {
    /// Whether the failure means the server could not be reached or answered too late.
    pub fn is_transport(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. } | BrokerError::Transport { .. })
    }
}

/// Classify an `anyhow` error chain as a transport failure.
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<BrokerError>())
        .any(BrokerError::is_transport)
}

/// Whether the server refused a new connection, as it does once it stopped listening.
pub fn is_connection_refused(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<BrokerError>())
        .any(|cause| matches!(
            cause,
            BrokerError::Transport { source, .. } if source.kind() == std::io::ErrorKind::ConnectionRefused
        ))
}
