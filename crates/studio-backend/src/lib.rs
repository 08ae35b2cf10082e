//! Remote backend transport for the studio control plane.
//!
//! The control plane never talks to machines or storage directly. It issues
//! abstract verbs through the [`Backend`] trait: read and write studio and job
//! records, manage volumes, request and release machines, execute commands and
//! launch jobs.
//!
//! - [`HttpBackend`] speaks the platform's REST API with the caller's API key.
//! - `MockBackend` (feature `test-utils`) keeps everything in memory and
//!   supports fault injection for provisioning failures.
//!
//! # Example
//!
//! ```ignore
//! use studio_backend::{Backend, MockBackend, MachineOwner, MachineRequest};
//! use studio_core::MachineClass;
//!
//! # async fn example(studio_id: studio_core::StudioId) -> studio_backend::Result<()> {
//! let backend = MockBackend::default();
//! let machine = backend
//!     .request_machine(&MachineRequest {
//!         owner: MachineOwner::Studio { studio_id },
//!         class: MachineClass::CPU_4,
//!     })
//!     .await?;
//! let output = backend.execute(&machine, "echo ok").await?;
//! assert_eq!(output.exit_code, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod http;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use backend::Backend;
pub use error::{BackendError, Result};
pub use http::{HttpBackend, HttpBackendConfig};
pub use types::{
    CommandOutput, JobRecord, JobStatus, LaunchRequest, MachineInfo, MachineOwner,
    MachineRequest, MachineStatus, RankAssignment, RankRecord, RankStatus, StudioRecord,
    StudioState,
};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockBackend;
