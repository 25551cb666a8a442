//! Error types for the queue crate.

use thiserror::Error;

use crate::job::AckToken;
use crate::storage::StorageError;

/// Errors that can occur when using a [`Queue`](crate::Queue).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was built with an invalid configuration.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The ack token does not match an outstanding, unexpired claim.
    ///
    /// The job was already acknowledged, its visibility window lapsed, or the
    /// token was never issued. The caller no longer owns the job and should
    /// stop processing it rather than retry.
    #[error("Unknown ack token: {ack}")]
    UnknownAck { ack: AckToken },

    /// A payload could not be converted to JSON.
    #[error("Payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl QueueError {
    /// Returns true when ownership of the job was lost.
    #[must_use]
    pub fn is_unknown_ack(&self) -> bool {
        matches!(self, Self::UnknownAck { .. })
    }
}
