//! Error types for the backend crate.

use studio_core::MachineClass;
use thiserror::Error;

/// Errors returned by a [`Backend`](crate::Backend).
#[derive(Error, Debug)]
pub enum BackendError {
    /// The addressed entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The write conflicts with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No machine of the class is available.
    #[error("No capacity for machine class {0}")]
    NoCapacity(MachineClass),

    /// The backend did not answer in time.
    #[error("Backend timeout: {0}")]
    Timeout(String),

    /// The request could not be delivered.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend is temporarily unable to serve the request.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request.
    #[error("Backend rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Message from the backend.
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Check if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity(_) | Self::Timeout(_) | Self::Transport(_) | Self::Unavailable(_)
        )
    }

    /// Check if this error means the entity is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A specialized Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
