//! Handle to a single studio and its lifecycle operations.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use studio_backend::{MachineOwner, StudioRecord, StudioState};
use studio_core::{MachineClass, StudioId, StudioIdentity};

use crate::client::{discard_volume, Context};
use crate::error::{ControlError, Result};
use crate::lifecycle;

/// Handle to a studio.
///
/// The handle holds no state of its own: every call reads the current
/// record from the backend, so handles stay valid across processes and
/// clones observe each other's changes.
#[derive(Clone)]
pub struct Studio {
    pub(crate) ctx: Arc<Context>,
    studio_id: StudioId,
    identity: StudioIdentity,
}

impl fmt::Debug for Studio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Studio")
            .field("studio_id", &self.studio_id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Studio {
    pub(crate) fn new(ctx: Arc<Context>, record: &StudioRecord) -> Self {
        Self {
            ctx,
            studio_id: record.studio_id,
            identity: record.identity.clone(),
        }
    }

    /// The studio's backend identifier.
    #[must_use]
    pub const fn id(&self) -> &StudioId {
        &self.studio_id
    }

    /// The studio's `(name, teamspace, org)` identity.
    #[must_use]
    pub const fn identity(&self) -> &StudioIdentity {
        &self.identity
    }

    /// Current lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `StudioNotFound` once the studio has been deleted.
    pub async fn status(&self) -> Result<StudioState> {
        Ok(self.load().await?.state)
    }

    /// The full studio record.
    ///
    /// # Errors
    ///
    /// Returns `StudioNotFound` once the studio has been deleted.
    pub async fn info(&self) -> Result<StudioRecord> {
        self.load().await
    }

    /// The machine class the studio is bound to, or will start on.
    ///
    /// # Errors
    ///
    /// Returns `StudioNotFound` once the studio has been deleted.
    pub async fn machine(&self) -> Result<Option<MachineClass>> {
        Ok(self.load().await?.machine_class)
    }

    /// Start the studio on its recorded machine class, or the configured
    /// default if it has none.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the studio is `Created` or `Stopped`.
    /// Provisioning failures leave the studio in `Error`.
    pub async fn start(&self) -> Result<()> {
        self.start_on(None).await
    }

    /// Start the studio on a specific machine class.
    ///
    /// # Errors
    ///
    /// Same as [`Studio::start`], plus `MachineUnavailable` for an unknown class.
    pub async fn start_with(&self, class: impl Into<MachineClass>) -> Result<()> {
        self.start_on(Some(class.into())).await
    }

    async fn start_on(&self, class: Option<MachineClass>) -> Result<()> {
        let _guard = self.ctx.in_flight.acquire(&self.identity)?;
        let mut record = self.load().await?;

        if !lifecycle::can_start(record.state) {
            return Err(ControlError::InvalidState {
                identity: self.identity.clone(),
                state: record.state,
                operation: "start",
            });
        }

        let class = class
            .or_else(|| record.machine_class.clone())
            .unwrap_or_else(|| self.ctx.config.default_machine.clone());
        self.ctx.catalog.require(&class)?;

        record.machine_class = Some(class.clone());
        record.error_message = None;
        self.transition(&mut record, StudioState::Starting, "start")
            .await?;
        info!(studio = %self.identity, machine = %class, "Starting studio");

        match self
            .ctx
            .provisioner
            .acquire(self.machine_owner(), &class)
            .await
        {
            Ok(machine_id) => {
                record.machine_id = Some(machine_id);
                if let Err(e) = self
                    .transition(&mut record, StudioState::Running, "start")
                    .await
                {
                    self.ctx.provisioner.release_quietly(&machine_id).await;
                    record.machine_id = None;
                    self.mark_error(&mut record, &e, "start").await;
                    return Err(e);
                }
                info!(studio = %self.identity, machine_id = %machine_id, "Studio running");
                Ok(())
            }
            Err(e) => {
                self.mark_error(&mut record, &e, "start").await;
                Err(e)
            }
        }
    }

    /// Stop a running studio and release its machine. Files persist.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the studio is `Running`.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.ctx.in_flight.acquire(&self.identity)?;
        let mut record = self.load().await?;
        self.stop_locked(&mut record, "stop").await
    }

    async fn stop_locked(&self, record: &mut StudioRecord, operation: &'static str) -> Result<()> {
        self.transition(record, StudioState::Stopping, operation)
            .await?;

        if let Some(machine_id) = record.machine_id {
            if let Err(e) = self.ctx.provisioner.release(&machine_id).await {
                self.mark_error(record, &e, operation).await;
                return Err(e);
            }
            record.machine_id = None;
        }

        if let Err(e) = self
            .transition(record, StudioState::Stopped, operation)
            .await
        {
            self.mark_error(record, &e, operation).await;
            return Err(e);
        }
        info!(studio = %self.identity, "Studio stopped");
        Ok(())
    }

    /// Delete the studio, its machine and its volumes.
    ///
    /// A running studio is stopped first. Jobs submitted from the studio
    /// are left alone.
    ///
    /// # Errors
    ///
    /// Returns `StudioNotFound` if the studio is already deleted.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.ctx.in_flight.acquire(&self.identity)?;
        let mut record = self.load().await?;

        if record.state == StudioState::Running {
            if let Err(e) = self.stop_locked(&mut record, "delete").await {
                warn!(studio = %self.identity, error = %e, "Stop before delete failed");
            }
        }

        if let Some(machine_id) = record.machine_id {
            self.ctx.provisioner.release(&machine_id).await?;
            record.machine_id = None;
        }

        self.transition(&mut record, StudioState::Deleted, "delete")
            .await?;

        discard_volume(&self.ctx, &record.filesystem).await;
        discard_volume(&self.ctx, &record.environment).await;

        match self.ctx.backend.delete_studio(&self.studio_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!(studio = %self.identity, studio_id = %self.studio_id.short(), "Deleted studio");
        Ok(())
    }

    /// Write a file into the studio's filesystem.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for an empty path.
    pub async fn upload_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let path = normalize_path(path)?;
        let record = self.load().await?;
        self.ctx
            .backend
            .write_file(&record.filesystem, path, contents)
            .await?;
        debug!(studio = %self.identity, path, bytes = contents.len(), "Uploaded file");
        Ok(())
    }

    /// Read a file from the studio's filesystem.
    ///
    /// # Errors
    ///
    /// Returns a backend `NotFound` error if the file does not exist.
    pub async fn download_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path)?;
        let record = self.load().await?;
        Ok(self
            .ctx
            .backend
            .read_file(&record.filesystem, path)
            .await?)
    }

    /// List the paths in the studio's filesystem.
    ///
    /// # Errors
    ///
    /// Returns `StudioNotFound` once the studio has been deleted.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let record = self.load().await?;
        Ok(self.ctx.backend.list_files(&record.filesystem).await?)
    }

    pub(crate) async fn load(&self) -> Result<StudioRecord> {
        match self.ctx.backend.get_studio(&self.studio_id).await? {
            Some(record) if record.state != StudioState::Deleted => Ok(record),
            _ => Err(ControlError::StudioNotFound(self.identity.clone())),
        }
    }

    pub(crate) async fn transition(
        &self,
        record: &mut StudioRecord,
        to: StudioState,
        operation: &'static str,
    ) -> Result<()> {
        lifecycle::validate_transition(&self.identity, record.state, to, operation)?;
        let from = record.state;
        record.state = to;
        record.updated_at = Utc::now();
        if let Err(e) = self.ctx.backend.put_studio(record).await {
            // The stored record is still in `from`.
            record.state = from;
            return Err(e.into());
        }
        debug!(studio = %self.identity, %from, %to, "Studio state changed");
        Ok(())
    }

    /// Move a studio whose operation failed midway into `Error`.
    ///
    /// `record.machine_id` must already name only a machine the studio still
    /// holds. Best effort: a failed write is logged.
    pub(crate) async fn mark_error(
        &self,
        record: &mut StudioRecord,
        cause: &ControlError,
        operation: &'static str,
    ) {
        error!(studio = %self.identity, operation, error = %cause, "Studio operation failed");
        record.error_message = Some(cause.to_string());
        if let Err(e) = self
            .transition(record, StudioState::Error, operation)
            .await
        {
            error!(studio = %self.identity, error = %e, "Failed to record studio error");
        }
    }

    pub(crate) const fn machine_owner(&self) -> MachineOwner {
        MachineOwner::Studio {
            studio_id: self.studio_id,
        }
    }
}

fn normalize_path(path: &str) -> Result<&str> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.trim().is_empty() {
        return Err(ControlError::InvalidRequest("file path must not be empty".into()));
    }
    Ok(trimmed)
}
