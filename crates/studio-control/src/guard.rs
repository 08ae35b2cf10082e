//! Per-identity serialization of lifecycle-mutating operations.
//!
//! At most one start, stop, switch, delete, create or duplicate may be in
//! flight for a studio identity. A second caller is rejected rather than
//! queued.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use studio_core::StudioIdentity;

use crate::error::{ControlError, Result};

/// Registry of identities with an operation in flight.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    busy: Arc<Mutex<HashSet<StudioIdentity>>>,
}

impl InFlight {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an identity for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrentModification` if the identity is already claimed.
    pub fn acquire(&self, identity: &StudioIdentity) -> Result<IdentityGuard> {
        if !self.busy.lock().insert(identity.clone()) {
            tracing::debug!(studio = %identity, "Rejected concurrent operation");
            return Err(ControlError::ConcurrentModification(identity.clone()));
        }

        Ok(IdentityGuard {
            busy: Arc::clone(&self.busy),
            identity: identity.clone(),
        })
    }

    /// Check if an identity is currently claimed.
    #[must_use]
    pub fn is_busy(&self, identity: &StudioIdentity) -> bool {
        self.busy.lock().contains(identity)
    }

    /// Number of identities currently claimed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.busy.lock().len()
    }

    /// Check if nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.busy.lock().is_empty()
    }
}

/// Releases its identity on drop. Can be moved into a spawned task.
#[derive(Debug)]
pub struct IdentityGuard {
    busy: Arc<Mutex<HashSet<StudioIdentity>>>,
    identity: StudioIdentity,
}

impl IdentityGuard {
    /// The claimed identity.
    #[must_use]
    pub const fn identity(&self) -> &StudioIdentity {
        &self.identity
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.identity);
    }
}
