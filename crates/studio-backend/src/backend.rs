//! The [`Backend`] trait: abstract verbs the control plane issues.

use async_trait::async_trait;

use studio_core::{JobId, MachineClass, MachineId, StudioId, StudioIdentity, UserId, VolumeId};

use crate::error::Result;
use crate::types::{
    CommandOutput, JobRecord, LaunchRequest, MachineInfo, MachineRequest, MachineStatus,
    StudioRecord,
};

/// Trait for the remote backend.
///
/// Implementations own retries and timeouts below this boundary. Records are
/// replaced wholesale on `put_*`.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========================================================================
    // Studios
    // ========================================================================

    /// Create or replace a studio record.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if another live studio already holds the identity.
    async fn put_studio(&self, record: &StudioRecord) -> Result<()>;

    /// Get a studio by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn get_studio(&self, studio_id: &StudioId) -> Result<Option<StudioRecord>>;

    /// Find the live studio holding an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn find_studio(&self, identity: &StudioIdentity) -> Result<Option<StudioRecord>>;

    /// List live studios in a teamspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_studios(&self, teamspace: &str, org: &str) -> Result<Vec<StudioRecord>>;

    /// Remove a studio record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record does not exist.
    async fn delete_studio(&self, studio_id: &StudioId) -> Result<()>;

    // ========================================================================
    // Volumes
    // ========================================================================

    /// Create an empty volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn create_volume(&self) -> Result<VolumeId>;

    /// Deep-copy a volume. The copy shares nothing with the source.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the source does not exist.
    async fn clone_volume(&self, source: &VolumeId) -> Result<VolumeId>;

    /// Delete a volume.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the volume does not exist.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()>;

    /// Write a file into a volume, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the volume does not exist.
    async fn write_file(&self, volume_id: &VolumeId, path: &str, contents: &[u8]) -> Result<()>;

    /// Read a file from a volume.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the volume or file does not exist.
    async fn read_file(&self, volume_id: &VolumeId, path: &str) -> Result<Vec<u8>>;

    /// List file paths in a volume, sorted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the volume does not exist.
    async fn list_files(&self, volume_id: &VolumeId) -> Result<Vec<String>>;

    // ========================================================================
    // Machines
    // ========================================================================

    /// Request a machine. Returns as soon as the request is accepted.
    ///
    /// # Errors
    ///
    /// Returns `NoCapacity` if the class is exhausted.
    async fn request_machine(&self, request: &MachineRequest) -> Result<MachineId>;

    /// Get the provisioning status of a machine.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the machine does not exist.
    async fn machine_status(&self, machine_id: &MachineId) -> Result<MachineStatus>;

    /// Release a machine back to the fleet.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the machine does not exist.
    async fn release_machine(&self, machine_id: &MachineId) -> Result<()>;

    /// List machines held for a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_job_machines(&self, job_id: &JobId) -> Result<Vec<MachineInfo>>;

    /// Number of machines of a class that can still be requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn available_capacity(&self, class: &MachineClass) -> Result<u32>;

    /// Run a command on a ready machine and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the machine is not ready or the request fails.
    /// A non-zero exit code is not an error.
    async fn execute(&self, machine_id: &MachineId, command: &str) -> Result<CommandOutput>;

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Create or replace a job record.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn put_job(&self, record: &JobRecord) -> Result<()>;

    /// Get a job by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>>;

    /// List jobs of a user, optionally only those submitted from one studio.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_jobs(&self, owner: &UserId, studio_id: Option<&StudioId>)
        -> Result<Vec<JobRecord>>;

    /// Start a job on its ready fleet.
    ///
    /// # Errors
    ///
    /// Returns an error if any assigned machine is not ready.
    async fn launch_job(&self, request: &LaunchRequest) -> Result<()>;

    /// Stop a launched job's processes. Machines are released separately.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the job was never launched.
    async fn stop_job(&self, job_id: &JobId) -> Result<()>;
}
