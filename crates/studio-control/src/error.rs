//! Error types for the control plane.
//!
//! Every failure surfaces as a distinct [`ErrorKind`] with enough context
//! (identity, state, failed ranks) for the caller to act on.

use std::time::Duration;

use studio_backend::{BackendError, JobStatus, StudioState};
use studio_core::{CoreError, IdentityError, JobId, MachineClass, StudioIdentity};
use thiserror::Error;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in control plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Credentials were missing or rejected.
    #[error("authentication error: {0}")]
    Authentication(#[from] studio_auth::AuthError),

    /// A live studio already holds the identity.
    #[error("studio {identity} already exists")]
    Conflict {
        /// The contested identity.
        identity: StudioIdentity,
    },

    /// The studio does not exist or has been deleted.
    #[error("studio not found: {0}")]
    StudioNotFound(StudioIdentity),

    /// The job does not exist.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The operation is not valid in the studio's current state.
    #[error("cannot {operation} studio {identity} while it is {state}")]
    InvalidState {
        /// The studio.
        identity: StudioIdentity,
        /// Its current state.
        state: StudioState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The operation is not valid in the job's current status.
    #[error("cannot {operation} job {job_id} while it is {status}")]
    InvalidJobState {
        /// The job.
        job_id: JobId,
        /// Its current status.
        status: JobStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// No machine of the requested class could be obtained.
    #[error("machine class {class} unavailable: {reason}")]
    MachineUnavailable {
        /// The requested class.
        class: MachineClass,
        /// Why.
        reason: String,
    },

    /// Another lifecycle operation is in flight for the same studio.
    #[error("another operation is in progress for studio {0}")]
    ConcurrentModification(StudioIdentity),

    /// Some ranks of a multi-machine job failed; the fleet was rolled back.
    #[error("job {job_id} failed on ranks {failed_ranks:?}: {reason}")]
    PartialFailure {
        /// The job.
        job_id: JobId,
        /// Zero-based ranks that failed.
        failed_ranks: Vec<u32>,
        /// First failure reason.
        reason: String,
    },

    /// A bounded wait elapsed.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for.
        operation: &'static str,
        /// The configured bound.
        after: Duration,
    },

    /// The request itself is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Backend error.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Inspectable category of a [`ControlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid credential.
    Authentication,
    /// Identity collision on create.
    Conflict,
    /// Unknown or deleted studio or job.
    NotFound,
    /// Operation not valid for the current state.
    InvalidStateTransition,
    /// Requested class lacks capacity.
    MachineUnavailable,
    /// Serialization violation on one identity.
    ConcurrentModification,
    /// Multi-machine rollback.
    PartialFailure,
    /// Bounded wait exceeded.
    Timeout,
    /// Malformed request.
    InvalidRequest,
    /// Transport or backend failure.
    Backend,
}

impl ControlError {
    /// The category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::StudioNotFound(_) | Self::JobNotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } | Self::InvalidJobState { .. } => {
                ErrorKind::InvalidStateTransition
            }
            Self::MachineUnavailable { .. } => ErrorKind::MachineUnavailable,
            Self::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    ///
    /// State-machine and identity errors are never retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::Authentication(e) => e.is_retriable(),
            Self::Backend(e) => e.is_retriable(),
            Self::MachineUnavailable { .. }
            | Self::ConcurrentModification(_)
            | Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<CoreError> for ControlError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownMachine(class) => Self::MachineUnavailable {
                class,
                reason: "unknown machine class".to_string(),
            },
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}

impl From<IdentityError> for ControlError {
    fn from(err: IdentityError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> StudioIdentity {
        StudioIdentity::new("demo", "team", "org1").unwrap()
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            ControlError::StudioNotFound(identity()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ControlError::JobNotFound(JobId::generate()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ControlError::InvalidState {
                identity: identity(),
                state: StudioState::Stopped,
                operation: "run",
            }
            .kind(),
            ErrorKind::InvalidStateTransition
        );
        assert_eq!(
            ControlError::from(CoreError::UnknownMachine(MachineClass::new("TPU"))).kind(),
            ErrorKind::MachineUnavailable
        );
        assert_eq!(
            ControlError::from(studio_auth::AuthError::MissingCredential("api key")).kind(),
            ErrorKind::Authentication
        );
    }

    #[test]
    fn retriable_errors() {
        assert!(ControlError::ConcurrentModification(identity()).is_retriable());
        assert!(ControlError::Timeout {
            operation: "provision",
            after: Duration::from_secs(1)
        }
        .is_retriable());
        assert!(ControlError::Backend(BackendError::Transport("reset".into())).is_retriable());
        assert!(!ControlError::Conflict {
            identity: identity()
        }
        .is_retriable());
        assert!(!ControlError::InvalidState {
            identity: identity(),
            state: StudioState::Error,
            operation: "start",
        }
        .is_retriable());
    }

    #[test]
    fn messages_carry_context() {
        let err = ControlError::InvalidState {
            identity: identity(),
            state: StudioState::Stopped,
            operation: "run",
        };
        assert_eq!(
            err.to_string(),
            "cannot run studio org1/team/demo while it is stopped"
        );

        let err = ControlError::PartialFailure {
            job_id: JobId::generate(),
            failed_ranks: vec![3],
            reason: "rank 3 failed to provision".to_string(),
        };
        assert!(err.to_string().contains("[3]"));
    }
}
