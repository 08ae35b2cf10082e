//! Records and wire types exchanged with the backend.
//!
//! Studio and job records are owned by the backend; the control plane reads
//! them, applies a transition and writes them back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use studio_core::{JobId, MachineClass, MachineId, StudioId, StudioIdentity, UserId, VolumeId};

/// Lifecycle states for a studio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudioState {
    /// Record exists, never started.
    Created,
    /// Machine is being provisioned.
    Starting,
    /// Bound to a ready machine.
    Running,
    /// Machine is being released.
    Stopping,
    /// No machine bound, storage preserved.
    Stopped,
    /// Provisioning or release failed.
    Error,
    /// Terminal.
    Deleted,
}

impl std::fmt::Display for StudioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A studio record held by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudioRecord {
    /// Unique identifier.
    pub studio_id: StudioId,
    /// Name, teamspace and org.
    pub identity: StudioIdentity,
    /// User who created the studio.
    pub owner: UserId,
    /// Current lifecycle state.
    pub state: StudioState,
    /// Bound machine class; `None` until first set.
    pub machine_class: Option<MachineClass>,
    /// Machine currently provisioned for the studio.
    pub machine_id: Option<MachineId>,
    /// Filesystem volume.
    pub filesystem: VolumeId,
    /// Environment volume (installed packages, settings).
    pub environment: VolumeId,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Error message when the studio is in `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, machines not yet ready.
    Queued,
    /// All ranks launched.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Provisioning or execution failed.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    /// Check if the job can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single rank within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankStatus {
    /// Machine requested, not ready.
    Pending,
    /// Machine ready, waiting at the barrier.
    Ready,
    /// Process launched.
    Running,
    /// Process exited successfully.
    Succeeded,
    /// Provisioning or execution failed on this rank.
    Failed,
    /// Machine released without the rank having failed.
    Released,
}

/// One rank of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    /// Zero-based index in the fleet.
    pub rank: u32,
    /// Machine bound to the rank, once requested.
    pub machine_id: Option<MachineId>,
    /// Current status.
    pub status: RankStatus,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RankRecord {
    /// A rank that has not been provisioned yet.
    #[must_use]
    pub const fn pending(rank: u32) -> Self {
        Self {
            rank,
            machine_id: None,
            status: RankStatus::Pending,
            message: None,
        }
    }
}

/// A job record held by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier.
    pub job_id: JobId,
    /// Submitting user.
    pub owner: UserId,
    /// Studio the job was submitted from, if any.
    pub studio_id: Option<StudioId>,
    /// Human-readable name.
    pub name: String,
    /// Command run on every rank.
    pub command: String,
    /// Extra environment for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Machine class of every rank.
    pub machine_class: MachineClass,
    /// Number of machines.
    pub num_machines: u32,
    /// Aggregated status.
    pub status: JobStatus,
    /// Per-rank status vector.
    pub ranks: Vec<RankRecord>,
    /// Ranks that failed to provision or run.
    #[serde(default)]
    pub failed_ranks: Vec<u32>,
    /// Failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Who a machine is provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MachineOwner {
    /// An interactive studio.
    Studio {
        /// The studio.
        studio_id: StudioId,
    },
    /// One rank of a job.
    Job {
        /// The job.
        job_id: JobId,
        /// The rank.
        rank: u32,
    },
}

impl MachineOwner {
    /// The job this machine belongs to, if any.
    #[must_use]
    pub const fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Job { job_id, .. } => Some(*job_id),
            Self::Studio { .. } => None,
        }
    }
}

/// Request for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRequest {
    /// Owner of the machine.
    pub owner: MachineOwner,
    /// Hardware class.
    pub class: MachineClass,
}

/// Provisioning status of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum MachineStatus {
    /// Still provisioning.
    Pending,
    /// Ready to run commands.
    Ready,
    /// Provisioning failed.
    Failed {
        /// Reason reported by the backend.
        reason: String,
    },
}

/// A provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Machine identifier.
    pub machine_id: MachineId,
    /// Hardware class.
    pub class: MachineClass,
    /// Owner.
    pub owner: MachineOwner,
    /// Provisioning status.
    pub status: MachineStatus,
}

/// Captured output of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code, passed through verbatim.
    pub exit_code: i32,
}

/// Rank to machine binding sent with a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankAssignment {
    /// Zero-based rank.
    pub rank: u32,
    /// Machine hosting the rank.
    pub machine_id: MachineId,
}

/// Request to start a job on a ready fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// The job.
    pub job_id: JobId,
    /// Command run on every rank.
    pub command: String,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
    /// One entry per rank, ordered by rank.
    pub assignments: Vec<RankAssignment>,
    /// Number of ranks.
    pub world_size: u32,
}
