//! Error types for hostmesh operations.
//!
//! Only genuine failures are errors. Stale updates, duplicate deliveries and
//! no-op merges are ordinary outcomes of last-writer-wins replication and are
//! reported as `Ok(None)` by the store, never through this type.
use thiserror::Error;

/// The main error type for hostmesh operations.
#[derive(Error, Debug)]
pub enum HostError {
    /// Malformed or incomplete input rejected at the API boundary
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the input was rejected
        reason: String,
    },

    /// Wire encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Peer unreachable or a frame could not be delivered
    #[error("Transport error: {0}")]
    Transport(String),

    /// Start/stop called in the wrong state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl HostError {
    /// Shorthand for an [`HostError::InvalidArgument`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Result type alias for hostmesh operations.
pub type HostResult<T> = Result<T, HostError>;
