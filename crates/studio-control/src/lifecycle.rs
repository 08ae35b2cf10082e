//! Studio lifecycle state machine.
//!
//! This module defines the valid state transitions for studios and provides
//! validation logic to ensure state machine invariants are maintained.
//!
//! # State Machine
//!
//! ```text
//!     ┌─────────┐  start   ┌──────────┐  ready   ┌─────────┐
//!     │ Created │─────────▶│ Starting │─────────▶│ Running │
//!     └─────────┘          └────┬─────┘          └────┬────┘
//!                               │ ▲                   │ stop / switch
//!                       failure │ │ switch            ▼
//!                               │ │              ┌──────────┐
//!                               │ └──────────────│ Stopping │
//!                               ▼                └────┬─────┘
//!                          ┌─────────┐  failure       │ released
//!                          │  Error  │◀───────────────┤
//!                          └─────────┘                ▼
//!                                                ┌─────────┐
//!                                   start ◀──────│ Stopped │
//!                                                └─────────┘
//!
//!     Any state except Deleted ──delete──▶ Deleted (terminal)
//! ```

use studio_backend::StudioState;
use studio_core::StudioIdentity;

use crate::error::{ControlError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    identity: &StudioIdentity,
    from: StudioState,
    to: StudioState,
    operation: &'static str,
) -> Result<StudioState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidState {
            identity: identity.clone(),
            state: from,
            operation,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: StudioState, to: StudioState) -> bool {
    use StudioState::{Created, Deleted, Error, Running, Starting, Stopped, Stopping};

    matches!(
        (from, to),
        (Created | Stopped, Starting)
            | (Starting, Running | Error)
            | (Running, Stopping)
            // Stopping leads to Starting during a live machine switch
            | (Stopping, Stopped | Starting | Error)
            | (Created | Starting | Running | Stopping | Stopped | Error, Deleted)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: StudioState) -> Vec<StudioState> {
    use StudioState::{Created, Deleted, Error, Running, Starting, Stopped, Stopping};

    match state {
        Created | Stopped => vec![Starting, Deleted],
        Starting => vec![Running, Error, Deleted],
        Running => vec![Stopping, Deleted],
        Stopping => vec![Stopped, Starting, Error, Deleted],
        Error => vec![Deleted],
        Deleted => vec![],
    }
}

/// Returns true if the studio can be started.
#[must_use]
pub const fn can_start(state: StudioState) -> bool {
    matches!(state, StudioState::Created | StudioState::Stopped)
}

/// Returns true if the studio's machine class can be changed without a migration.
#[must_use]
pub const fn can_rebind_lazily(state: StudioState) -> bool {
    matches!(state, StudioState::Created | StudioState::Stopped)
}

/// Returns true if the studio can be duplicated.
#[must_use]
pub const fn can_duplicate(state: StudioState) -> bool {
    !matches!(state, StudioState::Error | StudioState::Deleted)
}

/// State a duplicate starts in, mirroring the source's persisted state.
///
/// A copy never inherits a machine, so anything past `Created` maps to `Stopped`.
#[must_use]
pub const fn duplicate_state(source: StudioState) -> StudioState {
    match source {
        StudioState::Created => StudioState::Created,
        _ => StudioState::Stopped,
    }
}
