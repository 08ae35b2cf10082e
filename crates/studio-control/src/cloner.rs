//! Studio duplication.
//!
//! A duplicate gets copies of both volumes and a fresh identity. It never
//! shares a machine with its source: a running source yields a stopped
//! duplicate that remembers the source's machine class.

use std::sync::Arc;

use tracing::info;

use studio_core::StudioIdentity;

use crate::client::{discard_volume, provision_record_with, Volumes};
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::studio::Studio;
use crate::types::DuplicateOptions;

/// Attempts at finding a free `-copy` name before giving up.
const MAX_COPY_SUFFIX: u32 = 100;

impl Studio {
    /// Duplicate the studio under the first free `<name>-copy` name.
    ///
    /// # Errors
    ///
    /// See [`Studio::duplicate_with`].
    pub async fn duplicate(&self) -> Result<Studio> {
        self.duplicate_with(DuplicateOptions::default()).await
    }

    /// Duplicate the studio.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a studio in `Error`, `Conflict` if the
    /// requested name is taken, and `ConcurrentModification` if either
    /// identity is busy.
    pub async fn duplicate_with(&self, options: DuplicateOptions) -> Result<Studio> {
        let _source_guard = self.ctx.in_flight.acquire(self.identity())?;
        let source = self.load().await?;
        if !lifecycle::can_duplicate(source.state) {
            return Err(ControlError::InvalidState {
                identity: self.identity().clone(),
                state: source.state,
                operation: "duplicate",
            });
        }

        let target = self.target_identity(&options).await?;
        let _target_guard = self.ctx.in_flight.acquire(&target)?;

        let backend = &self.ctx.backend;
        let filesystem = backend.clone_volume(&source.filesystem).await?;
        let environment = match backend.clone_volume(&source.environment).await {
            Ok(volume) => volume,
            Err(e) => {
                discard_volume(&self.ctx, &filesystem).await;
                return Err(e.into());
            }
        };

        let record = provision_record_with(
            &self.ctx,
            target,
            Some(Volumes {
                filesystem,
                environment,
            }),
            lifecycle::duplicate_state(source.state),
            source.machine_class.clone(),
        )
        .await?;

        info!(
            source = %self.identity(),
            studio = %record.identity,
            state = %record.state,
            "Duplicated studio"
        );
        Ok(Studio::new(Arc::clone(&self.ctx), &record))
    }

    async fn target_identity(&self, options: &DuplicateOptions) -> Result<StudioIdentity> {
        let source = self.identity();
        let teamspace = options
            .teamspace
            .clone()
            .unwrap_or_else(|| source.teamspace().to_string());
        let org = options
            .org
            .clone()
            .unwrap_or_else(|| source.org().to_string());

        if let Some(name) = &options.name {
            let identity = StudioIdentity::new(name.clone(), teamspace, org)?;
            if self.ctx.backend.find_studio(&identity).await?.is_some() {
                return Err(ControlError::Conflict { identity });
            }
            return Ok(identity);
        }

        for attempt in 1..=MAX_COPY_SUFFIX {
            let name = copy_name(source.name(), attempt);
            let identity = StudioIdentity::new(name, teamspace.clone(), org.clone())?;
            if self.ctx.backend.find_studio(&identity).await?.is_none() {
                return Ok(identity);
            }
        }

        Err(ControlError::InvalidRequest(format!(
            "no free copy name for studio {source}"
        )))
    }
}

fn copy_name(base: &str, attempt: u32) -> String {
    if attempt == 1 {
        format!("{base}-copy")
    } else {
        format!("{base}-copy-{attempt}")
    }
}
