//! Machine acquisition and live migration.
//!
//! Acquiring a machine is two phases: a bounded retry loop around the
//! backend request (capacity can free up between attempts), then polling
//! until the machine reports ready, under the provisioning timeout. A
//! machine that never becomes ready is released before the error surfaces.

use std::sync::Arc;

use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use studio_backend::{
    Backend, BackendError, MachineOwner, MachineRequest, MachineStatus, StudioRecord, StudioState,
};
use studio_core::{MachineClass, MachineId};

use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::studio::Studio;
use crate::types::{ControlConfig, SwitchMode};

/// Requests, awaits and releases machines on the backend.
#[derive(Clone)]
pub struct Provisioner {
    backend: Arc<dyn Backend>,
    config: ControlConfig,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Create a provisioner.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, config: ControlConfig) -> Self {
        Self { backend, config }
    }

    /// Request a machine and wait until it is ready.
    ///
    /// # Errors
    ///
    /// Returns `MachineUnavailable` if capacity never appears or the machine
    /// fails, and `Timeout` if it is not ready within the provisioning timeout.
    pub async fn acquire(&self, owner: MachineOwner, class: &MachineClass) -> Result<MachineId> {
        let machine_id = self.request(owner, class).await?;

        let result = match timeout(
            self.config.provision_timeout,
            self.wait_ready(&machine_id, class),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout {
                operation: "provision",
                after: self.config.provision_timeout,
            }),
        };

        if let Err(e) = result {
            self.release_quietly(&machine_id).await;
            return Err(e);
        }
        Ok(machine_id)
    }

    /// Request a machine, retrying transient failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns `MachineUnavailable` once retries are exhausted on a capacity
    /// shortage, or the backend error for anything else.
    pub async fn request(&self, owner: MachineOwner, class: &MachineClass) -> Result<MachineId> {
        let request = MachineRequest {
            owner,
            class: class.clone(),
        };

        let mut attempt = 0;
        loop {
            match self.backend.request_machine(&request).await {
                Ok(machine_id) => {
                    debug!(machine = %class, machine_id = %machine_id, attempt, "Machine requested");
                    return Ok(machine_id);
                }
                Err(e) if e.is_retriable() && attempt < self.config.provision_retries => {
                    let delay = self.config.backoff(attempt);
                    debug!(machine = %class, attempt, error = %e, ?delay, "Retrying machine request");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(BackendError::NoCapacity(class)) => {
                    return Err(ControlError::MachineUnavailable {
                        class,
                        reason: format!("no capacity after {} attempts", attempt + 1),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Poll until the machine is ready. Unbounded; callers apply a timeout.
    ///
    /// # Errors
    ///
    /// Returns `MachineUnavailable` if the machine reports a failure.
    pub async fn wait_ready(&self, machine_id: &MachineId, class: &MachineClass) -> Result<()> {
        loop {
            match self.backend.machine_status(machine_id).await? {
                MachineStatus::Ready => return Ok(()),
                MachineStatus::Failed { reason } => {
                    return Err(ControlError::MachineUnavailable {
                        class: class.clone(),
                        reason,
                    });
                }
                MachineStatus::Pending => sleep(self.config.poll_interval).await,
            }
        }
    }

    /// Release a machine. Already released machines are not an error.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the release fails.
    pub async fn release(&self, machine_id: &MachineId) -> Result<()> {
        match self.backend.release_machine(machine_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn release_quietly(&self, machine_id: &MachineId) {
        if let Err(e) = self.release(machine_id).await {
            warn!(machine_id = %machine_id, error = %e, "Failed to release machine");
        }
    }

    async fn ensure_capacity(&self, class: &MachineClass) -> Result<()> {
        if self.backend.available_capacity(class).await? == 0 {
            return Err(ControlError::MachineUnavailable {
                class: class.clone(),
                reason: "no capacity".to_string(),
            });
        }
        Ok(())
    }
}

impl Studio {
    /// Rebind the studio to another machine class.
    ///
    /// A created or stopped studio only records the class for its next start.
    /// A running studio is migrated: the new machine is acquired first, then
    /// the studio passes through `Stopping` and `Starting` back to `Running`
    /// with its files intact. If the new machine cannot be acquired the studio
    /// stays on its current machine.
    ///
    /// With [`SwitchMode::Detached`] the call returns once the new machine is
    /// ready and the rebinding continues in the background.
    ///
    /// # Errors
    ///
    /// Returns `MachineUnavailable` for an unknown class or one without
    /// capacity, and `InvalidState` outside `Created`, `Stopped` and `Running`.
    pub async fn switch_machine(&self, class: impl Into<MachineClass>) -> Result<()> {
        let class = class.into();
        self.ctx.catalog.require(&class)?;
        let guard = self.ctx.in_flight.acquire(self.identity())?;
        let mut record = self.load().await?;
        let provisioner = &self.ctx.provisioner;

        if lifecycle::can_rebind_lazily(record.state) {
            provisioner.ensure_capacity(&class).await?;
            record.machine_class = Some(class.clone());
            record.updated_at = chrono::Utc::now();
            self.ctx.backend.put_studio(&record).await?;
            info!(studio = %self.identity(), machine = %class, "Machine applies on next start");
            return Ok(());
        }

        if record.state != StudioState::Running {
            return Err(ControlError::InvalidState {
                identity: self.identity().clone(),
                state: record.state,
                operation: "switch machine of",
            });
        }

        if record.machine_class.as_ref() == Some(&class) {
            debug!(studio = %self.identity(), machine = %class, "Already on requested machine");
            return Ok(());
        }

        provisioner.ensure_capacity(&class).await?;
        let new_machine = provisioner.acquire(self.machine_owner(), &class).await?;
        info!(
            studio = %self.identity(),
            from = ?record.machine_class,
            to = %class,
            "Migrating studio"
        );

        match self.ctx.config.switch_mode {
            SwitchMode::Blocking => self.migrate(&mut record, class, new_machine).await,
            SwitchMode::Detached => {
                let studio = self.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = studio.migrate(&mut record, class, new_machine).await {
                        error!(studio = %studio.identity(), error = %e, "Background migration failed");
                    }
                });
                Ok(())
            }
        }
    }

    /// Move a running studio onto `new_machine`. The new machine is released
    /// if the studio does not end up bound to it.
    async fn migrate(
        &self,
        record: &mut StudioRecord,
        class: MachineClass,
        new_machine: MachineId,
    ) -> Result<()> {
        let result = self.rebind(record, class, new_machine).await;
        if result.is_err() && record.machine_id != Some(new_machine) {
            self.ctx.provisioner.release_quietly(&new_machine).await;
        }
        result
    }

    async fn rebind(
        &self,
        record: &mut StudioRecord,
        class: MachineClass,
        new_machine: MachineId,
    ) -> Result<()> {
        const OPERATION: &str = "switch machine of";

        self.transition(record, StudioState::Stopping, OPERATION)
            .await?;

        let previous_class = record.machine_class.clone();
        if let Err(e) = self.swap_machine(record, &class, new_machine).await {
            record.machine_class = previous_class;
            if record.machine_id == Some(new_machine) {
                record.machine_id = None;
            }
            self.mark_error(record, &e, OPERATION).await;
            return Err(e);
        }

        info!(studio = %self.identity(), machine = %class, "Studio migrated");
        Ok(())
    }

    /// From `Stopping`: release the current machine and come back up on
    /// `new_machine`.
    async fn swap_machine(
        &self,
        record: &mut StudioRecord,
        class: &MachineClass,
        new_machine: MachineId,
    ) -> Result<()> {
        const OPERATION: &str = "switch machine of";

        if let Some(old_machine) = record.machine_id {
            self.ctx.provisioner.release(&old_machine).await?;
            record.machine_id = None;
        }

        self.transition(record, StudioState::Starting, OPERATION)
            .await?;
        record.machine_class = Some(class.clone());
        record.machine_id = Some(new_machine);
        self.transition(record, StudioState::Running, OPERATION)
            .await
    }
}
