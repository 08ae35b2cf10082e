use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use studio_backend::JobRecord;
use studio_core::StudioId;

use super::fleet::Dispatcher;
use super::{JobHandle, JobSpec, JobSubmitter};
use crate::client::Context;
use crate::error::{ControlError, Result};

/// Submits single-machine jobs.
#[derive(Clone)]
pub struct JobsPlugin {
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for JobsPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobsPlugin").finish_non_exhaustive()
    }
}

impl JobsPlugin {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self {
            dispatcher: Dispatcher::new(ctx),
        }
    }
}

#[async_trait]
impl JobSubmitter for JobsPlugin {
    async fn submit(&self, spec: JobSpec) -> Result<JobHandle> {
        if spec.num_machines != 1 {
            return Err(ControlError::InvalidRequest(format!(
                "jobs plugin runs on one machine, got {}; use the multi-machine plugin",
                spec.num_machines
            )));
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use studio_backend::{JobStatus, MockBackend};
    use studio_core::{MachineClass, StudioIdentity};

    use crate::studio::tests::{client_with, fast_config};

    #[tokio::test]
    async fn single_machine_only() {
        let backend = Arc::new(MockBackend::default());
        let jobs = client_with(Arc::clone(&backend), fast_config()).jobs();

        let err = jobs
            .submit(JobSpec::new("train", MachineClass::T4).with_machines(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn submit_returns_before_machine_is_ready() {
        let backend = Arc::new(MockBackend::default().with_ready_after_polls(u32::MAX));
        let jobs = client_with(Arc::clone(&backend), fast_config()).jobs();

        let handle = jobs
            .submit(JobSpec::new("python train.py", MachineClass::A10G).with_name("train"))
            .await
            .unwrap();

        let record = jobs.status(&handle).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.name, "train");
        assert_eq!(record.num_machines, 1);
    }

    #[tokio::test]
    async fn jobs_are_listed_per_studio() {
        let backend = Arc::new(MockBackend::default());
        let client = client_with(Arc::clone(&backend), fast_config());
        let studio = client
            .create(StudioIdentity::new("demo", "team", "org1").unwrap(), false)
            .await
            .unwrap();
        let jobs = client.jobs();

        let from_studio = jobs
            .submit(JobSpec::new("train", MachineClass::CPU_4).from_studio(&studio))
            .await
            .unwrap();
        jobs.submit(JobSpec::new("eval", MachineClass::CPU_4))
            .await
            .unwrap();

        let listed = jobs.list(Some(studio.id())).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(&listed[0].job_id, from_studio.job_id());
        assert_eq!(jobs.list(None).await.unwrap().len(), 2);

        let other_user = client_with(backend, fast_config()).jobs();
        assert!(other_user.list(None).await.unwrap().is_empty());
    }
}
