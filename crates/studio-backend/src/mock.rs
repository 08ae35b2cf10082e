//! In-memory backend for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use studio_core::{
    JobId, MachineCatalog, MachineClass, MachineId, StudioId, StudioIdentity, UserId, VolumeId,
};

use crate::backend::Backend;
use crate::error::{BackendError, Result};
use crate::types::{
    CommandOutput, JobRecord, JobStatus, LaunchRequest, MachineInfo, MachineOwner,
    MachineRequest, MachineStatus, RankStatus, StudioRecord, StudioState,
};

/// A mock backend that keeps all state in memory.
///
/// Capacity per class comes from the catalog and can be overridden. Machines
/// become ready after a configurable number of status polls.
pub struct MockBackend {
    catalog: MachineCatalog,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    studios: HashMap<StudioId, StudioRecord>,
    history: HashMap<StudioId, Vec<StudioState>>,
    volumes: HashMap<VolumeId, BTreeMap<String, Vec<u8>>>,
    machines: HashMap<MachineId, MockMachine>,
    capacity: HashMap<MachineClass, u32>,
    transient_failures: HashMap<MachineClass, u32>,
    failing_ranks: HashSet<u32>,
    stalled_ranks: HashSet<u32>,
    failing_studio_writes: HashSet<StudioState>,
    jobs: HashMap<JobId, JobRecord>,
    launched: HashSet<JobId>,
    ready_after_polls: u32,
    commands: Vec<(MachineId, String)>,
}

struct MockMachine {
    class: MachineClass,
    owner: MachineOwner,
    polls: u32,
    failure: Option<String>,
    stalled: bool,
}

impl MockMachine {
    fn status(&self, ready_after_polls: u32) -> MachineStatus {
        match &self.failure {
            Some(reason) => MachineStatus::Failed {
                reason: reason.clone(),
            },
            None if !self.stalled && self.polls >= ready_after_polls => MachineStatus::Ready,
            None => MachineStatus::Pending,
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(MachineCatalog::builtin())
    }
}

impl MockBackend {
    /// Create a mock backend over a catalog.
    #[must_use]
    pub fn new(catalog: MachineCatalog) -> Self {
        Self {
            catalog,
            state: Mutex::new(MockState {
                ready_after_polls: 1,
                ..MockState::default()
            }),
        }
    }

    /// Number of status polls before a machine reports ready.
    #[must_use]
    pub fn with_ready_after_polls(self, polls: u32) -> Self {
        self.state.lock().ready_after_polls = polls;
        self
    }

    /// Override the fleet capacity of a class.
    pub fn set_capacity(&self, class: &MachineClass, capacity: u32) {
        self.state.lock().capacity.insert(class.clone(), capacity);
    }

    /// Make the next `count` requests for a class fail with `NoCapacity`.
    pub fn fail_next_requests(&self, class: &MachineClass, count: u32) {
        self.state
            .lock()
            .transient_failures
            .insert(class.clone(), count);
    }

    /// Make every machine requested for this job rank fail to provision.
    pub fn fail_rank(&self, rank: u32) {
        self.state.lock().failing_ranks.insert(rank);
    }

    /// Keep every machine requested for this job rank pending forever.
    pub fn stall_rank(&self, rank: u32) {
        self.state.lock().stalled_ranks.insert(rank);
    }

    /// Fail the next write of a studio record in `state`.
    pub fn fail_next_studio_write(&self, state: StudioState) {
        self.state.lock().failing_studio_writes.insert(state);
    }

    /// Number of machines currently held, of any class.
    #[must_use]
    pub fn machine_count(&self) -> usize {
        self.state.lock().machines.len()
    }

    /// Number of machines of a class currently held.
    #[must_use]
    pub fn held(&self, class: &MachineClass) -> usize {
        self.state
            .lock()
            .machines
            .values()
            .filter(|m| &m.class == class)
            .count()
    }

    /// Number of machines currently held for a job.
    #[must_use]
    pub fn job_machine_count(&self, job_id: &JobId) -> usize {
        self.state
            .lock()
            .machines
            .values()
            .filter(|m| m.owner.job_id() == Some(*job_id))
            .count()
    }

    /// Every state a studio record was written with, in order.
    #[must_use]
    pub fn state_history(&self, studio_id: &StudioId) -> Vec<StudioState> {
        self.state
            .lock()
            .history
            .get(studio_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live volumes.
    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    /// Commands executed so far, in order.
    #[must_use]
    pub fn executed_commands(&self) -> Vec<(MachineId, String)> {
        self.state.lock().commands.clone()
    }

    /// Whether a job has been launched and not stopped.
    #[must_use]
    pub fn is_launched(&self, job_id: &JobId) -> bool {
        self.state.lock().launched.contains(job_id)
    }

    /// Complete a launched job as the remote side would: record the outcome
    /// and release its machines. Returns `false` if the job is unknown.
    pub fn finish_job(&self, job_id: &JobId, success: bool) -> bool {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return false;
        };

        let (status, rank_status) = if success {
            (JobStatus::Succeeded, RankStatus::Succeeded)
        } else {
            (JobStatus::Failed, RankStatus::Failed)
        };
        job.status = status;
        for rank in &mut job.ranks {
            rank.status = rank_status;
        }
        if !success {
            job.failed_ranks = job.ranks.iter().map(|r| r.rank).collect();
            job.error_message = Some("process exited with non-zero status".to_string());
        }
        job.updated_at = Utc::now();

        state.launched.remove(job_id);
        state.machines.retain(|_, m| m.owner.job_id() != Some(*job_id));
        true
    }

    fn capacity_of(state: &MockState, catalog: &MachineCatalog, class: &MachineClass) -> u32 {
        let total = state
            .capacity
            .get(class)
            .copied()
            .unwrap_or_else(|| catalog.capacity(class));
        let held = state.machines.values().filter(|m| &m.class == class).count();
        total.saturating_sub(u32::try_from(held).unwrap_or(u32::MAX))
    }

    fn studio_volume(state: &MockState, owner: &MachineOwner) -> Option<VolumeId> {
        match owner {
            MachineOwner::Studio { studio_id } => {
                state.studios.get(studio_id).map(|s| s.filesystem)
            }
            MachineOwner::Job { .. } => None,
        }
    }

    fn interpret(&self, machine: &MockMachine, volume: Option<&BTreeMap<String, Vec<u8>>>, command: &str) -> CommandOutput {
        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();

        let ok = |stdout: String| CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        };
        let fail = |stderr: String, exit_code| CommandOutput {
            stdout: String::new(),
            stderr,
            exit_code,
        };

        match program {
            "echo" => ok(format!("{}\n", args.join(" "))),
            "true" => ok(String::new()),
            "false" => fail(String::new(), 1),
            "exit" => fail(
                String::new(),
                args.first().and_then(|a| a.parse().ok()).unwrap_or(0),
            ),
            "cat" => {
                let path = args.first().copied().unwrap_or_default();
                match volume.and_then(|v| v.get(path)) {
                    Some(bytes) => ok(String::from_utf8_lossy(bytes).into_owned()),
                    None => fail(format!("cat: {path}: No such file or directory\n"), 1),
                }
            }
            "nvidia-smi" => match self.catalog.get(&machine.class) {
                Some(spec) if spec.is_gpu() => ok(format!(
                    "{} x NVIDIA {}\n",
                    spec.gpus,
                    spec.gpu_model.as_deref().unwrap_or("GPU")
                )),
                _ => fail(
                    "NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver\n"
                        .to_string(),
                    9,
                ),
            },
            other => fail(format!("{other}: command not found\n"), 127),
        }
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> BackendError {
    BackendError::NotFound(format!("{what} {id}"))
}

#[async_trait]
impl Backend for MockBackend {
    async fn put_studio(&self, record: &StudioRecord) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_studio_writes.remove(&record.state) {
            return Err(BackendError::Unavailable(format!(
                "write of {} studio record failed",
                record.state
            )));
        }
        let taken = state.studios.values().any(|s| {
            s.studio_id != record.studio_id
                && s.identity == record.identity
                && s.state != StudioState::Deleted
        });
        if taken {
            return Err(BackendError::Conflict(format!(
                "studio {} already exists",
                record.identity
            )));
        }

        state
            .history
            .entry(record.studio_id)
            .or_default()
            .push(record.state);
        state.studios.insert(record.studio_id, record.clone());
        Ok(())
    }

    async fn get_studio(&self, studio_id: &StudioId) -> Result<Option<StudioRecord>> {
        Ok(self.state.lock().studios.get(studio_id).cloned())
    }

    async fn find_studio(&self, identity: &StudioIdentity) -> Result<Option<StudioRecord>> {
        Ok(self
            .state
            .lock()
            .studios
            .values()
            .find(|s| &s.identity == identity && s.state != StudioState::Deleted)
            .cloned())
    }

    async fn list_studios(&self, teamspace: &str, org: &str) -> Result<Vec<StudioRecord>> {
        let state = self.state.lock();
        let mut studios: Vec<StudioRecord> = state
            .studios
            .values()
            .filter(|s| s.identity.teamspace() == teamspace && s.identity.org() == org)
            .filter(|s| s.state != StudioState::Deleted)
            .cloned()
            .collect();
        studios.sort_by(|a, b| a.identity.name().cmp(b.identity.name()));
        Ok(studios)
    }

    async fn delete_studio(&self, studio_id: &StudioId) -> Result<()> {
        self.state
            .lock()
            .studios
            .remove(studio_id)
            .map(|_| ())
            .ok_or_else(|| not_found("studio", studio_id))
    }

    async fn create_volume(&self) -> Result<VolumeId> {
        let id = VolumeId::generate();
        self.state.lock().volumes.insert(id, BTreeMap::new());
        Ok(id)
    }

    async fn clone_volume(&self, source: &VolumeId) -> Result<VolumeId> {
        let mut state = self.state.lock();
        let files = state
            .volumes
            .get(source)
            .cloned()
            .ok_or_else(|| not_found("volume", source))?;
        let id = VolumeId::generate();
        state.volumes.insert(id, files);
        Ok(id)
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<()> {
        self.state
            .lock()
            .volumes
            .remove(volume_id)
            .map(|_| ())
            .ok_or_else(|| not_found("volume", volume_id))
    }

    async fn write_file(&self, volume_id: &VolumeId, path: &str, contents: &[u8]) -> Result<()> {
        self.state
            .lock()
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?
            .insert(path.to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, volume_id: &VolumeId, path: &str) -> Result<Vec<u8>> {
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("file", path))
    }

    async fn list_files(&self, volume_id: &VolumeId) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .volumes
            .get(volume_id)
            .ok_or_else(|| not_found("volume", volume_id))?
            .keys()
            .cloned()
            .collect())
    }

    async fn request_machine(&self, request: &MachineRequest) -> Result<MachineId> {
        if !self.catalog.contains(&request.class) {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("unknown machine class {}", request.class),
            });
        }

        let mut state = self.state.lock();
        if let Some(remaining) = state.transient_failures.get_mut(&request.class) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::NoCapacity(request.class.clone()));
            }
        }
        if Self::capacity_of(&state, &self.catalog, &request.class) == 0 {
            return Err(BackendError::NoCapacity(request.class.clone()));
        }

        let failure = match request.owner {
            MachineOwner::Job { rank, .. } if state.failing_ranks.contains(&rank) => {
                Some(format!("rank {rank} failed to provision"))
            }
            _ => None,
        };
        let stalled = matches!(
            request.owner,
            MachineOwner::Job { rank, .. } if state.stalled_ranks.contains(&rank)
        );

        let id = MachineId::generate();
        state.machines.insert(
            id,
            MockMachine {
                class: request.class.clone(),
                owner: request.owner,
                polls: 0,
                failure,
                stalled,
            },
        );
        Ok(id)
    }

    async fn machine_status(&self, machine_id: &MachineId) -> Result<MachineStatus> {
        let mut state = self.state.lock();
        let ready_after = state.ready_after_polls;
        let machine = state
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| not_found("machine", machine_id))?;
        machine.polls = machine.polls.saturating_add(1);
        Ok(machine.status(ready_after))
    }

    async fn release_machine(&self, machine_id: &MachineId) -> Result<()> {
        self.state
            .lock()
            .machines
            .remove(machine_id)
            .map(|_| ())
            .ok_or_else(|| not_found("machine", machine_id))
    }

    async fn list_job_machines(&self, job_id: &JobId) -> Result<Vec<MachineInfo>> {
        let state = self.state.lock();
        Ok(state
            .machines
            .iter()
            .filter(|(_, m)| m.owner.job_id() == Some(*job_id))
            .map(|(id, m)| MachineInfo {
                machine_id: *id,
                class: m.class.clone(),
                owner: m.owner,
                status: m.status(state.ready_after_polls),
            })
            .collect())
    }

    async fn available_capacity(&self, class: &MachineClass) -> Result<u32> {
        Ok(Self::capacity_of(&self.state.lock(), &self.catalog, class))
    }

    async fn execute(&self, machine_id: &MachineId, command: &str) -> Result<CommandOutput> {
        let (output, sleep) = {
            let mut state = self.state.lock();
            let ready_after = state.ready_after_polls;
            let machine = state
                .machines
                .get(machine_id)
                .ok_or_else(|| not_found("machine", machine_id))?;
            if machine.status(ready_after) != MachineStatus::Ready {
                return Err(BackendError::Conflict(format!(
                    "machine {machine_id} is not ready"
                )));
            }

            let volume = Self::studio_volume(&state, &machine.owner)
                .and_then(|v| state.volumes.get(&v));
            let output = self.interpret(machine, volume, command);
            let sleep = command
                .strip_prefix("sleep ")
                .and_then(|secs| secs.trim().parse::<f64>().ok())
                .map(Duration::from_secs_f64);

            state.commands.push((*machine_id, command.to_string()));
            (output, sleep)
        };

        if let Some(duration) = sleep {
            tokio::time::sleep(duration).await;
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            });
        }
        Ok(output)
    }

    async fn put_job(&self, record: &JobRecord) -> Result<()> {
        self.state.lock().jobs.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    async fn list_jobs(
        &self,
        owner: &UserId,
        studio_id: Option<&StudioId>,
    ) -> Result<Vec<JobRecord>> {
        let state = self.state.lock();
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| &j.owner == owner)
            .filter(|j| studio_id.map_or(true, |s| j.studio_id.as_ref() == Some(s)))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn launch_job(&self, request: &LaunchRequest) -> Result<()> {
        let mut state = self.state.lock();
        let ready_after = state.ready_after_polls;
        for assignment in &request.assignments {
            let machine = state
                .machines
                .get(&assignment.machine_id)
                .ok_or_else(|| not_found("machine", assignment.machine_id))?;
            if machine.status(ready_after) != MachineStatus::Ready {
                return Err(BackendError::Conflict(format!(
                    "rank {} machine is not ready",
                    assignment.rank
                )));
            }
        }
        state.launched.insert(request.job_id);
        Ok(())
    }

    async fn stop_job(&self, job_id: &JobId) -> Result<()> {
        if self.state.lock().launched.remove(job_id) {
            Ok(())
        } else {
            Err(not_found("launched job", job_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn studio_owner() -> MachineOwner {
        let owner = UserId::generate();
        let identity = StudioIdentity::new("demo", "team", "org1").unwrap();
        MachineOwner::Studio {
            studio_id: StudioId::generate_deterministic(&owner, &identity, 1),
        }
    }

    fn request(class: MachineClass) -> MachineRequest {
        MachineRequest {
            owner: studio_owner(),
            class,
        }
    }

    #[tokio::test]
    async fn capacity_is_consumed_and_returned() {
        let backend = MockBackend::default();
        backend.set_capacity(&MachineClass::A10G, 2);

        let a = backend.request_machine(&request(MachineClass::A10G)).await.unwrap();
        let _b = backend.request_machine(&request(MachineClass::A10G)).await.unwrap();
        assert_eq!(backend.available_capacity(&MachineClass::A10G).await.unwrap(), 0);

        let err = backend
            .request_machine(&request(MachineClass::A10G))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NoCapacity(_)));

        backend.release_machine(&a).await.unwrap();
        assert_eq!(backend.available_capacity(&MachineClass::A10G).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn machines_become_ready_after_polls() {
        let backend = MockBackend::default().with_ready_after_polls(3);
        let id = backend.request_machine(&request(MachineClass::CPU_4)).await.unwrap();

        assert_eq!(backend.machine_status(&id).await.unwrap(), MachineStatus::Pending);
        assert_eq!(backend.machine_status(&id).await.unwrap(), MachineStatus::Pending);
        assert_eq!(backend.machine_status(&id).await.unwrap(), MachineStatus::Ready);
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let backend = MockBackend::default();
        backend.fail_next_requests(&MachineClass::T4, 1);

        assert!(backend.request_machine(&request(MachineClass::T4)).await.is_err());
        assert!(backend.request_machine(&request(MachineClass::T4)).await.is_ok());
    }

    #[tokio::test]
    async fn failing_rank_reports_failed() {
        let backend = MockBackend::default();
        backend.fail_rank(3);
        let job_id = JobId::generate();

        let ok = backend
            .request_machine(&MachineRequest {
                owner: MachineOwner::Job { job_id, rank: 0 },
                class: MachineClass::A10G,
            })
            .await
            .unwrap();
        let bad = backend
            .request_machine(&MachineRequest {
                owner: MachineOwner::Job { job_id, rank: 3 },
                class: MachineClass::A10G,
            })
            .await
            .unwrap();

        assert_eq!(backend.machine_status(&ok).await.unwrap(), MachineStatus::Ready);
        assert!(matches!(
            backend.machine_status(&bad).await.unwrap(),
            MachineStatus::Failed { .. }
        ));
        assert_eq!(backend.list_job_machines(&job_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stalled_rank_never_becomes_ready() {
        let backend = MockBackend::default();
        backend.stall_rank(1);
        let job_id = JobId::generate();

        let stalled = backend
            .request_machine(&MachineRequest {
                owner: MachineOwner::Job { job_id, rank: 1 },
                class: MachineClass::L4,
            })
            .await
            .unwrap();
        for _ in 0..5 {
            assert_eq!(
                backend.machine_status(&stalled).await.unwrap(),
                MachineStatus::Pending
            );
        }
    }

    #[tokio::test]
    async fn injected_studio_write_failure_fires_once() {
        let backend = MockBackend::default();
        let owner = UserId::generate();
        let identity = StudioIdentity::new("demo", "team", "org1").unwrap();
        let mut record = StudioRecord {
            studio_id: StudioId::generate(&owner, &identity),
            identity,
            owner,
            state: StudioState::Created,
            machine_class: None,
            machine_id: None,
            filesystem: VolumeId::generate(),
            environment: VolumeId::generate(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            error_message: None,
        };
        backend.put_studio(&record).await.unwrap();
        backend.fail_next_studio_write(StudioState::Starting);

        record.state = StudioState::Starting;
        assert!(backend.put_studio(&record).await.unwrap_err().is_retriable());
        assert_eq!(backend.state_history(&record.studio_id), vec![StudioState::Created]);
        backend.put_studio(&record).await.unwrap();
    }

    #[tokio::test]
    async fn cloned_volumes_are_independent() {
        let backend = MockBackend::default();
        let source = backend.create_volume().await.unwrap();
        backend.write_file(&source, "a.txt", b"one").await.unwrap();

        let copy = backend.clone_volume(&source).await.unwrap();
        backend.write_file(&copy, "a.txt", b"two").await.unwrap();
        backend.delete_volume(&source).await.unwrap();

        assert_eq!(backend.read_file(&copy, "a.txt").await.unwrap(), b"two");
        assert!(backend.read_file(&source, "a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn execute_interprets_simple_commands() {
        let backend = MockBackend::default();
        let id = backend.request_machine(&request(MachineClass::CPU_4)).await.unwrap();
        backend.machine_status(&id).await.unwrap();

        let out = backend.execute(&id, "echo ok").await.unwrap();
        assert_eq!(out.stdout, "ok\n");
        assert_eq!(out.exit_code, 0);

        assert_eq!(backend.execute(&id, "exit 3").await.unwrap().exit_code, 3);
        assert_eq!(backend.execute(&id, "nvidia-smi").await.unwrap().exit_code, 9);
        assert_eq!(backend.execute(&id, "frobnicate").await.unwrap().exit_code, 127);
        assert_eq!(backend.executed_commands().len(), 4);
    }

    #[tokio::test]
    async fn execute_requires_ready_machine() {
        let backend = MockBackend::default().with_ready_after_polls(5);
        let id = backend.request_machine(&request(MachineClass::CPU_4)).await.unwrap();
        assert!(backend.execute(&id, "echo hi").await.is_err());
    }

    #[tokio::test]
    async fn finish_job_releases_machines() {
        let backend = MockBackend::default();
        let job_id = JobId::generate();
        let owner = UserId::generate();
        let machine = backend
            .request_machine(&MachineRequest {
                owner: MachineOwner::Job { job_id, rank: 0 },
                class: MachineClass::CPU_4,
            })
            .await
            .unwrap();
        backend
            .put_job(&JobRecord {
                job_id,
                owner,
                studio_id: None,
                name: "train".to_string(),
                command: "python train.py".to_string(),
                env: BTreeMap::new(),
                machine_class: MachineClass::CPU_4,
                num_machines: 1,
                status: JobStatus::Running,
                ranks: vec![crate::RankRecord {
                    rank: 0,
                    machine_id: Some(machine),
                    status: RankStatus::Running,
                    message: None,
                }],
                failed_ranks: Vec::new(),
                error_message: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(backend.finish_job(&job_id, true));
        assert_eq!(backend.job_machine_count(&job_id), 0);
        let job = backend.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(backend.list_jobs(&owner, None).await.unwrap().len(), 1);
    }
}
