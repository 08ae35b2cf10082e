use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use studio_backend::JobRecord;
use studio_core::{MachineClass, StudioId};

use super::fleet::Dispatcher;
use super::{JobHandle, JobSpec, JobSubmitter};
use crate::client::Context;
use crate::error::Result;

/// Submits jobs that run on a fleet of identical machines.
///
/// The fleet is all or nothing: ranks launch together once every machine
/// is ready, and a single failed rank releases the whole fleet.
#[derive(Clone)]
pub struct MultiMachineTrainingPlugin {
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for MultiMachineTrainingPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiMachineTrainingPlugin")
            .finish_non_exhaustive()
    }
}

impl MultiMachineTrainingPlugin {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self {
            dispatcher: Dispatcher::new(ctx),
        }
    }

    /// Submit `command` on `num_machines` machines of one class.
    ///
    /// # Errors
    ///
    /// See [`JobSubmitter::submit`].
    pub async fn run(
        &self,
        command: impl Into<String>,
        machine: impl Into<MachineClass>,
        num_machines: u32,
    ) -> Result<JobHandle> {
        self.submit(JobSpec::new(command, machine).with_machines(num_machines))
            .await
    }
}

#[async_trait]
impl JobSubmitter for MultiMachineTrainingPlugin {
    async fn submit(&self, spec: JobSpec) -> Result<JobHandle> {
        self.dispatcher.submit(spec).await
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobRecord> {
        self.dispatcher.status(handle).await
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<JobRecord> {
        self.dispatcher.cancel(handle).await
    }

    async fn settle(&self, handle: &JobHandle) -> Result<JobRecord> {
        self.dispatcher.settle(handle).await
    }

    async fn wait(&self, handle: &JobHandle, timeout: Duration) -> Result<JobRecord> {
        self.dispatcher.wait(handle, timeout).await
    }

    async fn list(&self, studio_id: Option<&StudioId>) -> Result<Vec<JobRecord>> {
        self.dispatcher.list(studio_id).await
    }
}
