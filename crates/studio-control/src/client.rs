//! Entry point: an authenticated client that hands out studio handles.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use studio_auth::{Authenticator, Credentials, Principal};
use studio_backend::{Backend, BackendError, StudioRecord, StudioState};
use studio_core::{JobId, MachineCatalog, StudioId, StudioIdentity};

use crate::error::{ControlError, Result};
use crate::guard::InFlight;
use crate::jobs::{JobsPlugin, MultiMachineTrainingPlugin};
use crate::provisioner::Provisioner;
use crate::studio::Studio;
use crate::types::ControlConfig;

/// State shared by a client and every handle it produced.
pub(crate) struct Context {
    pub(crate) principal: Principal,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) catalog: Arc<MachineCatalog>,
    pub(crate) config: ControlConfig,
    pub(crate) in_flight: InFlight,
    pub(crate) provisioner: Provisioner,
    pub(crate) job_tasks: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

/// Authenticated control-plane client.
///
/// Cheap to clone. Handles obtained from one client share its in-flight
/// registry, so lifecycle calls on the same identity are serialized across
/// all of them.
#[derive(Clone)]
pub struct StudioClient {
    ctx: Arc<Context>,
}

impl std::fmt::Debug for StudioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudioClient")
            .field("principal", &self.ctx.principal)
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}

impl StudioClient {
    /// Create a client for an already verified principal.
    #[must_use]
    pub fn new(
        principal: Principal,
        backend: Arc<dyn Backend>,
        catalog: Arc<MachineCatalog>,
        config: ControlConfig,
    ) -> Self {
        let provisioner = Provisioner::new(Arc::clone(&backend), config.clone());
        Self {
            ctx: Arc::new(Context {
                principal,
                backend,
                catalog,
                config,
                in_flight: InFlight::new(),
                provisioner,
                job_tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Verify credentials, then create a client.
    ///
    /// # Errors
    ///
    /// Returns `Authentication` if the credentials are missing or rejected.
    pub async fn connect(
        authenticator: &dyn Authenticator,
        credentials: &Credentials,
        backend: Arc<dyn Backend>,
        catalog: Arc<MachineCatalog>,
        config: ControlConfig,
    ) -> Result<Self> {
        let principal = authenticator.authenticate(credentials).await?;
        Ok(Self::new(principal, backend, catalog, config))
    }

    /// The principal every operation runs as.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.ctx.principal
    }

    /// The machine catalog.
    #[must_use]
    pub fn catalog(&self) -> &MachineCatalog {
        &self.ctx.catalog
    }

    /// The client configuration.
    #[must_use]
    pub fn config(&self) -> &ControlConfig {
        &self.ctx.config
    }

    /// Create a studio, or return the caller's live one holding `identity`
    /// when `create_ok` is true.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the identity is taken and either `create_ok` is
    /// false or the studio belongs to another user, and
    /// `ConcurrentModification` if another operation on the identity is in flight.
    pub async fn create(&self, identity: StudioIdentity, create_ok: bool) -> Result<Studio> {
        let _guard = self.ctx.in_flight.acquire(&identity)?;

        if let Some(existing) = self.ctx.backend.find_studio(&identity).await? {
            if create_ok && existing.owner == *self.ctx.principal.user_id() {
                tracing::debug!(studio = %identity, "Attached to existing studio");
                return Ok(Studio::new(Arc::clone(&self.ctx), &existing));
            }
            return Err(ControlError::Conflict { identity });
        }

        let record = provision_record(&self.ctx, identity, None).await?;
        tracing::info!(
            studio = %record.identity,
            studio_id = %record.studio_id.short(),
            user_id = %self.ctx.principal.user_id(),
            "Created studio"
        );
        Ok(Studio::new(Arc::clone(&self.ctx), &record))
    }

    /// Attach to an existing live studio.
    ///
    /// # Errors
    ///
    /// Returns `StudioNotFound` if no live studio holds the identity.
    pub async fn studio(&self, identity: StudioIdentity) -> Result<Studio> {
        self.ctx
            .backend
            .find_studio(&identity)
            .await?
            .map(|record| Studio::new(Arc::clone(&self.ctx), &record))
            .ok_or(ControlError::StudioNotFound(identity))
    }

    /// List live studios in a teamspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend request fails.
    pub async fn list_studios(&self, teamspace: &str, org: &str) -> Result<Vec<StudioRecord>> {
        Ok(self.ctx.backend.list_studios(teamspace, org).await?)
    }

    /// Single-machine job submitter.
    #[must_use]
    pub fn jobs(&self) -> JobsPlugin {
        JobsPlugin::new(Arc::clone(&self.ctx))
    }

    /// Multi-machine job submitter.
    #[must_use]
    pub fn multi_machine(&self) -> MultiMachineTrainingPlugin {
        MultiMachineTrainingPlugin::new(Arc::clone(&self.ctx))
    }
}

/// Volumes a new studio record starts from: fresh ones, or copies.
pub(crate) struct Volumes {
    pub(crate) filesystem: studio_core::VolumeId,
    pub(crate) environment: studio_core::VolumeId,
}

/// Write a new studio record, creating fresh volumes unless some are given.
///
/// Volumes are deleted again if the record cannot be written.
pub(crate) async fn provision_record(
    ctx: &Context,
    identity: StudioIdentity,
    volumes: Option<Volumes>,
) -> Result<StudioRecord> {
    provision_record_with(ctx, identity, volumes, StudioState::Created, None).await
}

pub(crate) async fn provision_record_with(
    ctx: &Context,
    identity: StudioIdentity,
    volumes: Option<Volumes>,
    state: StudioState,
    machine_class: Option<studio_core::MachineClass>,
) -> Result<StudioRecord> {
    let volumes = match volumes {
        Some(volumes) => volumes,
        None => {
            let filesystem = ctx.backend.create_volume().await?;
            match ctx.backend.create_volume().await {
                Ok(environment) => Volumes {
                    filesystem,
                    environment,
                },
                Err(e) => {
                    discard_volume(ctx, &filesystem).await;
                    return Err(e.into());
                }
            }
        }
    };

    let now = Utc::now();
    let record = StudioRecord {
        studio_id: StudioId::generate(ctx.principal.user_id(), &identity),
        identity,
        owner: *ctx.principal.user_id(),
        state,
        machine_class,
        machine_id: None,
        filesystem: volumes.filesystem,
        environment: volumes.environment,
        created_at: now,
        updated_at: now,
        error_message: None,
    };

    if let Err(e) = ctx.backend.put_studio(&record).await {
        discard_volume(ctx, &volumes.filesystem).await;
        discard_volume(ctx, &volumes.environment).await;
        return Err(match e {
            BackendError::Conflict(_) => ControlError::Conflict {
                identity: record.identity,
            },
            other => other.into(),
        });
    }

    Ok(record)
}

/// Delete a volume, logging instead of failing. Missing volumes are fine.
pub(crate) async fn discard_volume(ctx: &Context, volume_id: &studio_core::VolumeId) {
    match ctx.backend.delete_volume(volume_id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => tracing::warn!(volume_id = %volume_id, error = %e, "Failed to delete volume"),
    }
}
