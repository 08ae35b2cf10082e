//! Job dispatcher shared by both submitters.
//!
//! Every rank's machine is requested and awaited concurrently. The fleet
//! launches only once all ranks are ready; the first failed rank, or the
//! barrier timeout, rolls the whole fleet back so no machine outlives a
//! failed job. Rank progress is written to the job record as it happens.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use studio_backend::{
    JobRecord, JobStatus, LaunchRequest, MachineOwner, RankAssignment, RankRecord, RankStatus,
};
use studio_core::{JobId, MachineClass, MachineId, StudioId};

use super::{JobHandle, JobSpec};
use crate::client::Context;
use crate::error::{ControlError, Result};

#[derive(Clone)]
pub(crate) struct Dispatcher {
    ctx: Arc<Context>,
}

impl Dispatcher {
    pub(crate) const fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn submit(&self, spec: JobSpec) -> Result<JobHandle> {
        self.validate(&spec)?;

        let job_id = JobId::generate();
        let now = Utc::now();
        let record = JobRecord {
            job_id,
            owner: *self.ctx.principal.user_id(),
            studio_id: spec.studio_id,
            name: spec.name.unwrap_or_else(|| default_name(&job_id)),
            command: spec.command,
            env: spec.env,
            machine_class: spec.machine,
            num_machines: spec.num_machines,
            status: JobStatus::Queued,
            ranks: (0..spec.num_machines).map(RankRecord::pending).collect(),
            failed_ranks: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx.backend.put_job(&record).await?;
        info!(
            job_id = %job_id,
            name = %record.name,
            machine = %record.machine_class,
            num_machines = record.num_machines,
            "Job queued"
        );

        let task = tokio::spawn(run_fleet(Arc::clone(&self.ctx), record));
        let mut tasks = self.ctx.job_tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(job_id, task);

        Ok(JobHandle::from(job_id))
    }

    fn validate(&self, spec: &JobSpec) -> Result<()> {
        if spec.command.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "job command must not be empty".into(),
            ));
        }
        if spec.num_machines == 0 {
            return Err(ControlError::InvalidRequest(
                "a job needs at least one machine".into(),
            ));
        }
        let machine = self.ctx.catalog.require(&spec.machine)?;
        if spec.num_machines > machine.capacity {
            return Err(ControlError::MachineUnavailable {
                class: spec.machine.clone(),
                reason: format!(
                    "{} machines requested, fleet holds {}",
                    spec.num_machines, machine.capacity
                ),
            });
        }
        Ok(())
    }

    pub(crate) async fn status(&self, handle: &JobHandle) -> Result<JobRecord> {
        self.ctx
            .backend
            .get_job(handle.job_id())
            .await?
            .ok_or(ControlError::JobNotFound(*handle.job_id()))
    }

    pub(crate) async fn cancel(&self, handle: &JobHandle) -> Result<JobRecord> {
        let job_id = *handle.job_id();
        ensure_cancellable(&self.status(handle).await?)?;

        let task = self.ctx.job_tasks.lock().remove(&job_id);
        if let Some(task) = task {
            task.abort();
            // Cancelled or finished, either way the fleet task is gone.
            let _ = task.await;
        }

        let mut record = self.status(handle).await?;
        ensure_cancellable(&record)?;

        // The fleet may have launched without recording it.
        match self.ctx.backend.stop_job(&job_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        release_fleet(&self.ctx, &job_id, &known_machines(&record)).await?;

        for rank in &mut record.ranks {
            if rank.status != RankStatus::Failed {
                rank.status = RankStatus::Released;
            }
        }
        record.status = JobStatus::Cancelled;
        record.updated_at = Utc::now();
        self.ctx.backend.put_job(&record).await?;

        info!(job_id = %job_id, "Job cancelled");
        Ok(record)
    }

    /// Wait for this process's fleet task to launch or roll back the job.
    pub(crate) async fn settle(&self, handle: &JobHandle) -> Result<JobRecord> {
        loop {
            let active = self
                .ctx
                .job_tasks
                .lock()
                .get(handle.job_id())
                .is_some_and(|task| !task.is_finished());
            if !active {
                break;
            }
            sleep(self.ctx.config.poll_interval).await;
        }
        self.status(handle).await
    }

    pub(crate) async fn wait(&self, handle: &JobHandle, limit: Duration) -> Result<JobRecord> {
        let poll = async {
            loop {
                let record = self.status(handle).await?;
                if record.status.is_terminal() {
                    return Ok(record);
                }
                sleep(self.ctx.config.poll_interval).await;
            }
        };

        timeout(limit, poll).await.unwrap_or(Err(ControlError::Timeout {
            operation: "wait for job",
            after: limit,
        }))
    }

    pub(crate) async fn list(&self, studio_id: Option<&StudioId>) -> Result<Vec<JobRecord>> {
        Ok(self
            .ctx
            .backend
            .list_jobs(self.ctx.principal.user_id(), studio_id)
            .await?)
    }
}

fn ensure_cancellable(record: &JobRecord) -> Result<()> {
    if record.status.is_terminal() {
        return Err(ControlError::InvalidJobState {
            job_id: record.job_id,
            status: record.status,
            operation: "cancel",
        });
    }
    Ok(())
}

fn default_name(job_id: &JobId) -> String {
    let id = job_id.to_string();
    format!("job-{}", &id[..8])
}

fn known_machines(record: &JobRecord) -> Vec<MachineId> {
    record.ranks.iter().filter_map(|r| r.machine_id).collect()
}

/// Provision every rank, then launch or roll back.
async fn run_fleet(ctx: Arc<Context>, record: JobRecord) {
    let job_id = record.job_id;
    let barrier_timeout = ctx.config.barrier_timeout;
    let num_machines = record.num_machines;
    let class = record.machine_class.clone();
    let progress = Arc::new(Mutex::new(record));

    let pending: FuturesUnordered<_> = (0..num_machines)
        .map(|rank| {
            provision_rank(
                Arc::clone(&ctx),
                job_id,
                rank,
                class.clone(),
                Arc::clone(&progress),
            )
        })
        .collect();
    let barrier = async move {
        let mut pending = pending;
        while let Some(result) = pending.next().await {
            result?;
        }
        Ok::<(), String>(())
    };
    let outcome = timeout(barrier_timeout, barrier).await;
    let record = progress.lock().await.clone();

    match outcome {
        Ok(Ok(())) => launch(&ctx, record).await,
        Ok(Err(reason)) => {
            let failed = ranks_where(&record, |r| r.status == RankStatus::Failed);
            rollback(&ctx, record, failed, reason).await;
        }
        Err(_) => {
            let failed = ranks_where(&record, |r| r.status != RankStatus::Ready);
            let reason = format!("barrier timed out after {barrier_timeout:?}");
            rollback(&ctx, record, failed, reason).await;
        }
    }
}

async fn provision_rank(
    ctx: Arc<Context>,
    job_id: JobId,
    rank: u32,
    class: MachineClass,
    progress: Arc<Mutex<JobRecord>>,
) -> std::result::Result<(), String> {
    let result = async {
        let machine_id = ctx
            .provisioner
            .request(MachineOwner::Job { job_id, rank }, &class)
            .await?;
        record_rank(&ctx, &progress, rank, |r| r.machine_id = Some(machine_id)).await;
        ctx.provisioner.wait_ready(&machine_id, &class).await
    }
    .await;

    match result {
        Ok(()) => {
            record_rank(&ctx, &progress, rank, |r| r.status = RankStatus::Ready).await;
            debug!(job_id = %job_id, rank, "Rank ready");
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            record_rank(&ctx, &progress, rank, |r| {
                r.status = RankStatus::Failed;
                r.message = Some(message.clone());
            })
            .await;
            warn!(job_id = %job_id, rank, error = %message, "Rank failed to provision");
            Err(format!("rank {rank}: {message}"))
        }
    }
}

/// Apply a rank change and write the job record. The lock is held across
/// the write so records reach the backend in order.
async fn record_rank(
    ctx: &Context,
    progress: &Mutex<JobRecord>,
    rank: u32,
    f: impl FnOnce(&mut RankRecord),
) {
    let mut record = progress.lock().await;
    if let Some(entry) = record.ranks.iter_mut().find(|r| r.rank == rank) {
        f(entry);
    }
    record.updated_at = Utc::now();
    if let Err(e) = ctx.backend.put_job(&record).await {
        warn!(job_id = %record.job_id, rank, error = %e, "Failed to record rank progress");
    }
}

fn ranks_where(record: &JobRecord, predicate: impl Fn(&RankRecord) -> bool) -> Vec<u32> {
    record
        .ranks
        .iter()
        .filter(|r| predicate(r))
        .map(|r| r.rank)
        .collect()
}

async fn launch(ctx: &Context, mut record: JobRecord) {
    let job_id = record.job_id;
    record.updated_at = Utc::now();
    if let Err(e) = ctx.backend.put_job(&record).await {
        warn!(job_id = %job_id, error = %e, "Failed to record ready ranks");
    }

    let request = LaunchRequest {
        job_id,
        command: record.command.clone(),
        env: record.env.clone(),
        assignments: record
            .ranks
            .iter()
            .filter_map(|r| {
                r.machine_id.map(|machine_id| RankAssignment {
                    rank: r.rank,
                    machine_id,
                })
            })
            .collect(),
        world_size: record.num_machines,
    };

    if let Err(e) = ctx.backend.launch_job(&request).await {
        let all = (0..record.num_machines).collect();
        rollback(ctx, record, all, format!("launch failed: {e}")).await;
        return;
    }

    record.status = JobStatus::Running;
    for rank in &mut record.ranks {
        rank.status = RankStatus::Running;
    }
    record.updated_at = Utc::now();
    if let Err(e) = ctx.backend.put_job(&record).await {
        error!(job_id = %job_id, error = %e, "Failed to record running job");
    }
    info!(job_id = %job_id, world_size = record.num_machines, "Job running");
}

async fn rollback(ctx: &Context, mut record: JobRecord, failed_ranks: Vec<u32>, reason: String) {
    let job_id = record.job_id;
    warn!(job_id = %job_id, ?failed_ranks, %reason, "Rolling back job fleet");

    if let Err(e) = release_fleet(ctx, &job_id, &known_machines(&record)).await {
        error!(job_id = %job_id, error = %e, "Failed to release job machines");
    }

    for rank in &mut record.ranks {
        rank.status = if failed_ranks.contains(&rank.rank) {
            RankStatus::Failed
        } else {
            RankStatus::Released
        };
    }
    record.error_message = Some(
        ControlError::PartialFailure {
            job_id,
            failed_ranks: failed_ranks.clone(),
            reason,
        }
        .to_string(),
    );
    record.failed_ranks = failed_ranks;
    record.status = JobStatus::Failed;
    record.updated_at = Utc::now();

    if let Err(e) = ctx.backend.put_job(&record).await {
        error!(job_id = %job_id, error = %e, "Failed to record job failure");
    }
}

/// Release every machine of a job: the ones the record knows about plus
/// whatever the backend still attributes to it.
async fn release_fleet(ctx: &Context, job_id: &JobId, known: &[MachineId]) -> Result<()> {
    let mut machines: BTreeSet<MachineId> = known.iter().copied().collect();
    let mut first_error = None;

    match ctx.backend.list_job_machines(job_id).await {
        Ok(listed) => machines.extend(listed.into_iter().map(|m| m.machine_id)),
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to list job machines");
            first_error = Some(ControlError::from(e));
        }
    }

    for machine_id in &machines {
        if let Err(e) = ctx.provisioner.release(machine_id).await {
            warn!(job_id = %job_id, machine_id = %machine_id, error = %e, "Failed to release machine");
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_backend::{Backend, MockBackend};

    use crate::jobs::{JobSubmitter, MultiMachineTrainingPlugin};
    use crate::studio::tests::{client_with, fast_config};
    use crate::types::ControlConfig;

    fn plugin(backend: &Arc<MockBackend>, config: ControlConfig) -> MultiMachineTrainingPlugin {
        client_with(Arc::clone(backend), config).multi_machine()
    }

    async fn settled(plugin: &MultiMachineTrainingPlugin, handle: &JobHandle) -> JobRecord {
        for _ in 0..500 {
            let record = plugin.status(handle).await.unwrap();
            if record.status != JobStatus::Queued {
                return record;
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!("job {handle} never left Queued");
    }

    #[test]
    fn default_names_use_job_prefix() {
        let name = default_name(&JobId::generate());
        assert!(name.starts_with("job-"));
        assert_eq!(name.len(), 12);
    }

    #[tokio::test]
    async fn fleet_launches_when_all_ranks_ready() {
        let backend = Arc::new(MockBackend::default().with_ready_after_polls(2));
        let plugin = plugin(&backend, fast_config());

        let handle = plugin
            .submit(JobSpec::new("torchrun train.py", MachineClass::A10G).with_machines(3))
            .await
            .unwrap();
        let record = settled(&plugin, &handle).await;

        assert_eq!(record.status, JobStatus::Running);
        assert!(record.ranks.iter().all(|r| r.status == RankStatus::Running));
        assert_eq!(backend.job_machine_count(handle.job_id()), 3);
        assert!(backend.is_launched(handle.job_id()));
    }

    #[tokio::test]
    async fn failed_rank_rolls_back_fleet() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_rank(2);
        let plugin = plugin(&backend, fast_config());

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::T4).with_machines(4))
            .await
            .unwrap();
        let record = settled(&plugin, &handle).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failed_ranks, vec![2]);
        assert_eq!(record.ranks[2].status, RankStatus::Failed);
        assert!(record.error_message.unwrap().contains("rank 2"));
        assert_eq!(backend.job_machine_count(handle.job_id()), 0);
        assert!(!backend.is_launched(handle.job_id()));
    }

    #[tokio::test]
    async fn settle_returns_once_fleet_launched() {
        let backend = Arc::new(MockBackend::default().with_ready_after_polls(3));
        let plugin = plugin(&backend, fast_config());

        let handle = plugin
            .submit(JobSpec::new("torchrun train.py", MachineClass::A10G).with_machines(4))
            .await
            .unwrap();
        let record = plugin.settle(&handle).await.unwrap();

        assert_eq!(record.status, JobStatus::Running);
        assert!(backend.is_launched(handle.job_id()));
        assert_eq!(backend.job_machine_count(handle.job_id()), 4);
    }

    #[tokio::test]
    async fn settle_returns_once_fleet_rolled_back() {
        let backend = Arc::new(MockBackend::default());
        backend.fail_rank(1);
        let plugin = plugin(&backend, fast_config());

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::T4).with_machines(3))
            .await
            .unwrap();
        let record = plugin.settle(&handle).await.unwrap();

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failed_ranks, vec![1]);
        assert_eq!(backend.job_machine_count(handle.job_id()), 0);
    }

    #[tokio::test]
    async fn rank_progress_is_visible_before_barrier() {
        let backend = Arc::new(MockBackend::default());
        backend.stall_rank(2);
        let plugin = plugin(
            &backend,
            ControlConfig {
                barrier_timeout: Duration::from_secs(60),
                provision_timeout: Duration::from_secs(60),
                ..fast_config()
            },
        );

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::L4).with_machines(3))
            .await
            .unwrap();

        let mut record = plugin.status(&handle).await.unwrap();
        for _ in 0..500 {
            let bound = record.ranks.iter().all(|r| r.machine_id.is_some());
            let ready = record
                .ranks
                .iter()
                .filter(|r| r.status == RankStatus::Ready)
                .count();
            if bound && ready == 2 {
                break;
            }
            sleep(Duration::from_millis(2)).await;
            record = plugin.status(&handle).await.unwrap();
        }

        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.ranks[0].status, RankStatus::Ready);
        assert_eq!(record.ranks[1].status, RankStatus::Ready);
        assert_eq!(record.ranks[2].status, RankStatus::Pending);
        assert!(record.ranks.iter().all(|r| r.machine_id.is_some()));

        plugin.cancel(&handle).await.unwrap();
        assert_eq!(backend.machine_count(), 0);
    }

    #[tokio::test]
    async fn barrier_timeout_rolls_back_fleet() {
        let backend = Arc::new(MockBackend::default().with_ready_after_polls(u32::MAX));
        let plugin = plugin(
            &backend,
            ControlConfig {
                barrier_timeout: Duration::from_millis(30),
                ..fast_config()
            },
        );

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::L4).with_machines(2))
            .await
            .unwrap();
        let record = settled(&plugin, &handle).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failed_ranks, vec![0, 1]);
        assert!(record
            .error_message
            .unwrap()
            .contains("barrier timed out"));
        assert_eq!(backend.machine_count(), 0);
    }

    #[tokio::test]
    async fn submit_rejects_bad_specs() {
        let backend = Arc::new(MockBackend::default());
        let plugin = plugin(&backend, fast_config());

        let empty = plugin.submit(JobSpec::new("  ", MachineClass::T4)).await;
        assert!(matches!(empty, Err(ControlError::InvalidRequest(_))));

        let zero = plugin
            .submit(JobSpec::new("train", MachineClass::T4).with_machines(0))
            .await;
        assert!(matches!(zero, Err(ControlError::InvalidRequest(_))));

        let unknown = plugin.submit(JobSpec::new("train", "TPU-v5")).await;
        assert!(matches!(
            unknown,
            Err(ControlError::MachineUnavailable { .. })
        ));

        let too_many = plugin
            .submit(JobSpec::new("train", MachineClass::H100_X_8).with_machines(9))
            .await;
        assert!(matches!(
            too_many,
            Err(ControlError::MachineUnavailable { .. })
        ));
        assert!(plugin.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_queued_job_releases_machines() {
        let backend = Arc::new(MockBackend::default().with_ready_after_polls(u32::MAX));
        let plugin = plugin(
            &backend,
            ControlConfig {
                barrier_timeout: Duration::from_secs(60),
                ..fast_config()
            },
        );

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::CPU_8).with_machines(2))
            .await
            .unwrap();
        while backend.job_machine_count(handle.job_id()) < 2 {
            sleep(Duration::from_millis(1)).await;
        }

        let record = plugin.cancel(&handle).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.ranks.iter().all(|r| r.status == RankStatus::Released));
        assert_eq!(backend.machine_count(), 0);

        let again = plugin.cancel(&handle).await.unwrap_err();
        assert!(matches!(again, ControlError::InvalidJobState { .. }));
    }

    #[tokio::test]
    async fn cancel_running_job_stops_it() {
        let backend = Arc::new(MockBackend::default());
        let plugin = plugin(&backend, fast_config());

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::CPU_4).with_machines(2))
            .await
            .unwrap();
        assert_eq!(settled(&plugin, &handle).await.status, JobStatus::Running);

        plugin.cancel(&handle).await.unwrap();
        assert!(!backend.is_launched(handle.job_id()));
        assert_eq!(backend.job_machine_count(handle.job_id()), 0);
    }

    #[tokio::test]
    async fn cancel_stops_launch_missing_from_record() {
        let backend = Arc::new(MockBackend::default().with_ready_after_polls(u32::MAX));
        let plugin = plugin(
            &backend,
            ControlConfig {
                barrier_timeout: Duration::from_secs(60),
                provision_timeout: Duration::from_secs(60),
                ..fast_config()
            },
        );

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::CPU_8).with_machines(2))
            .await
            .unwrap();
        while backend.job_machine_count(handle.job_id()) < 2 {
            sleep(Duration::from_millis(1)).await;
        }
        // Launched on the backend, but the record still says Queued.
        backend
            .launch_job(&LaunchRequest {
                job_id: *handle.job_id(),
                command: "train".to_string(),
                env: std::collections::BTreeMap::new(),
                assignments: Vec::new(),
                world_size: 2,
            })
            .await
            .unwrap();
        assert_eq!(plugin.status(&handle).await.unwrap().status, JobStatus::Queued);

        let record = plugin.cancel(&handle).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(!backend.is_launched(handle.job_id()));
        assert_eq!(backend.machine_count(), 0);
    }

    #[tokio::test]
    async fn wait_returns_terminal_record() {
        let backend = Arc::new(MockBackend::default());
        let plugin = plugin(&backend, fast_config());

        let handle = plugin
            .submit(JobSpec::new("train", MachineClass::CPU_4))
            .await
            .unwrap();
        settled(&plugin, &handle).await;

        let timed_out = plugin
            .wait(&handle, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(timed_out, ControlError::Timeout { .. }));

        assert!(backend.finish_job(handle.job_id(), true));
        let record = plugin.wait(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn status_of_unknown_job() {
        let backend = Arc::new(MockBackend::default());
        let plugin = plugin(&backend, fast_config());

        let err = plugin
            .status(&JobHandle::from(JobId::generate()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::JobNotFound(_)));
    }
}
