//! Batch jobs.
//!
//! Jobs run on machines of their own, never on a studio's machine. Both
//! submitters share one dispatcher: submission writes a `Queued` record and
//! hands provisioning to a background task, so `submit` returns at once.
//!
//! ```text
//!   submit ──▶ Queued ──all ranks ready──▶ Running ──▶ Succeeded | Failed
//!                │                            │
//!                │ rank failed / barrier      │ cancel
//!                ▼ timed out (rollback)       ▼
//!              Failed                      Cancelled
//! ```

mod fleet;
mod multi;
mod single;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use studio_backend::JobRecord;
use studio_core::{JobId, MachineClass, StudioId};

use crate::error::Result;
use crate::studio::Studio;

pub use multi::MultiMachineTrainingPlugin;
pub use single::JobsPlugin;

/// What to run, and on which machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Display name. Derived from the job ID when unset.
    pub name: Option<String>,
    /// Shell command run on every machine.
    pub command: String,
    /// Extra environment for the command.
    pub env: BTreeMap<String, String>,
    /// Machine class for every rank.
    pub machine: MachineClass,
    /// Number of machines. Ranks are numbered from 0.
    pub num_machines: u32,
    /// Studio the job was submitted from, if any.
    pub studio_id: Option<StudioId>,
}

impl JobSpec {
    /// A single-machine job.
    #[must_use]
    pub fn new(command: impl Into<String>, machine: impl Into<MachineClass>) -> Self {
        Self {
            name: None,
            command: command.into(),
            env: BTreeMap::new(),
            machine: machine.into(),
            num_machines: 1,
            studio_id: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the number of machines.
    #[must_use]
    pub const fn with_machines(mut self, num_machines: u32) -> Self {
        self.num_machines = num_machines;
        self
    }

    /// Associate the job with the studio it was launched from.
    #[must_use]
    pub fn from_studio(mut self, studio: &Studio) -> Self {
        self.studio_id = Some(*studio.id());
        self
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    job_id: JobId,
}

impl JobHandle {
    /// The job's identifier.
    #[must_use]
    pub const fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl From<JobId> for JobHandle {
    fn from(job_id: JobId) -> Self {
        Self { job_id }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.job_id, f)
    }
}

/// Submits and tracks jobs.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Queue a job and return immediately.
    async fn submit(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Current job record. Never changes the job.
    async fn status(&self, handle: &JobHandle) -> Result<JobRecord>;

    /// Cancel a job that has not finished, releasing all its machines.
    async fn cancel(&self, handle: &JobHandle) -> Result<JobRecord>;

    /// Wait until provisioning has settled: the fleet launched or was rolled
    /// back. A process that exits right after [`submit`](Self::submit)
    /// must call this first, or the fleet is cut off half provisioned.
    /// Jobs submitted by another client are returned as they stand.
    async fn settle(&self, handle: &JobHandle) -> Result<JobRecord>;

    /// Wait until the job reaches a terminal status.
    async fn wait(&self, handle: &JobHandle, timeout: Duration) -> Result<JobRecord>;

    /// Jobs of the current user, optionally only those from one studio.
    async fn list(&self, studio_id: Option<&StudioId>) -> Result<Vec<JobRecord>>;
}
