//! Common error types for the studio control plane.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

use crate::identity::IdentityError;
use crate::ids::IdError;
use crate::machine::MachineClass;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the system.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// An invalid studio identity was provided.
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    /// The machine class is not in the catalog.
    #[error("unknown machine class: {0}")]
    UnknownMachine(MachineClass),
}
