//! Core types for the studio control plane.
//!
//! This crate provides the foundational types shared by every other crate:
//!
//! - **Identifiers**: strongly-typed IDs for studios, users, jobs, machines and volumes
//! - **Identity**: the `(name, teamspace, org)` triple addressing a studio
//! - **Machines**: machine classes and the immutable [`MachineCatalog`]
//! - **Error types**: common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use studio_core::{MachineCatalog, MachineClass, StudioId, StudioIdentity, UserId};
//!
//! let identity = StudioIdentity::new("my-sdk-studio", "language-model", "23110301").unwrap();
//! let owner = UserId::generate();
//! let studio_id = StudioId::generate(&owner, &identity);
//!
//! let catalog = MachineCatalog::builtin();
//! assert!(catalog.contains(&MachineClass::A10G));
//! # let _ = studio_id;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod identity;
pub mod ids;
pub mod machine;

pub use error::{CoreError, Result};
pub use identity::{IdentityError, StudioIdentity};
pub use ids::{IdError, JobId, MachineId, StudioId, UserId, VolumeId};
pub use machine::{MachineCatalog, MachineClass, MachineSpec};
