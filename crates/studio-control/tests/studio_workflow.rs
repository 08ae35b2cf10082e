//! End-to-end studio and job workflows against the in-memory backend.
//!
//! Run with:
//!   cargo test -p studio-control --test studio_workflow

use std::sync::Arc;
use std::time::Duration;

use studio_auth::MockAuthenticator;
use studio_backend::MockBackend;
use studio_control::{
    ControlConfig, ControlError, DuplicateOptions, ErrorKind, JobSpec, JobStatus, JobSubmitter,
    MachineCatalog, MachineClass, RankStatus, StudioClient, StudioIdentity, StudioState,
    SwitchMode, UserId,
};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> ControlConfig {
    ControlConfig {
        poll_interval: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(1),
        provision_timeout: Duration::from_secs(2),
        run_timeout: Duration::from_secs(2),
        barrier_timeout: Duration::from_secs(2),
        ..ControlConfig::default()
    }
}

fn client(backend: &Arc<MockBackend>, config: ControlConfig) -> StudioClient {
    StudioClient::new(
        MockAuthenticator::principal(UserId::generate()),
        Arc::clone(backend) as Arc<dyn studio_backend::Backend>,
        Arc::new(MachineCatalog::builtin()),
        config,
    )
}

fn identity(name: &str) -> StudioIdentity {
    StudioIdentity::new(name, "team", "org1").unwrap()
}

async fn wait_until<F>(mut done: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..2_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Studio lifecycle
// =============================================================================

#[tokio::test]
async fn full_studio_lifecycle() {
    let backend = Arc::new(MockBackend::default().with_ready_after_polls(2));
    let client = client(&backend, config());

    let studio = client.create(identity("demo"), true).await.unwrap();
    assert_eq!(studio.status().await.unwrap(), StudioState::Created);

    studio.start().await.unwrap();
    assert_eq!(studio.status().await.unwrap(), StudioState::Running);
    assert_eq!(studio.machine().await.unwrap(), Some(MachineClass::CPU_4));

    studio
        .upload_file("train.py", b"print('hello')")
        .await
        .unwrap();

    studio.switch_machine(MachineClass::A10G).await.unwrap();
    assert_eq!(studio.status().await.unwrap(), StudioState::Running);
    assert_eq!(studio.machine().await.unwrap(), Some(MachineClass::A10G));

    let history = backend.state_history(studio.id());
    assert_eq!(
        history,
        vec![
            StudioState::Created,
            StudioState::Starting,
            StudioState::Running,
            StudioState::Stopping,
            StudioState::Starting,
            StudioState::Running,
        ]
    );

    let output = studio.run("cat train.py").await.unwrap();
    assert_eq!(output.stdout, "print('hello')");

    let ok = studio.run("echo ok").await.unwrap();
    assert_eq!(ok.exit_code, 0);
    assert_eq!(ok.stdout.trim(), "ok");

    studio.stop().await.unwrap();
    assert_eq!(studio.status().await.unwrap(), StudioState::Stopped);
    assert_eq!(backend.machine_count(), 0);

    studio.delete().await.unwrap();
    let err = studio.status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(matches!(
        client.studio(identity("demo")).await,
        Err(ControlError::StudioNotFound(_))
    ));
}

#[tokio::test]
async fn handles_from_separate_lookups_share_state() {
    let backend = Arc::new(MockBackend::default());
    let client = client(&backend, config());

    let created = client.create(identity("shared"), false).await.unwrap();
    let attached = client.studio(identity("shared")).await.unwrap();

    created.start().await.unwrap();
    assert_eq!(attached.status().await.unwrap(), StudioState::Running);

    attached.stop().await.unwrap();
    assert_eq!(created.status().await.unwrap(), StudioState::Stopped);
}

#[tokio::test]
async fn transient_capacity_shortage_is_retried_on_start() {
    let backend = Arc::new(MockBackend::default());
    backend.fail_next_requests(&MachineClass::T4, 2);
    let client = client(&backend, config());

    let studio = client.create(identity("retry"), false).await.unwrap();
    studio.start_with(MachineClass::T4).await.unwrap();

    assert_eq!(studio.status().await.unwrap(), StudioState::Running);
    assert_eq!(backend.held(&MachineClass::T4), 1);
}

#[tokio::test]
async fn provisioning_timeout_marks_studio_errored() {
    let backend = Arc::new(MockBackend::default().with_ready_after_polls(u32::MAX));
    let client = client(
        &backend,
        ControlConfig {
            provision_timeout: Duration::from_millis(20),
            ..config()
        },
    );

    let studio = client.create(identity("slow"), false).await.unwrap();
    let err = studio.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let info = studio.info().await.unwrap();
    assert_eq!(info.state, StudioState::Error);
    assert!(info.machine_id.is_none());
    assert_eq!(backend.machine_count(), 0);

    // Only deletion leaves the error state.
    assert!(studio.switch_machine(MachineClass::CPU_8).await.is_err());
    studio.delete().await.unwrap();
}

#[tokio::test]
async fn detached_switch_completes_in_background() {
    let backend = Arc::new(MockBackend::default());
    let client = client(
        &backend,
        ControlConfig {
            switch_mode: SwitchMode::Detached,
            ..config()
        },
    );

    let studio = client.create(identity("detached"), false).await.unwrap();
    studio.start().await.unwrap();
    studio.switch_machine(MachineClass::L4).await.unwrap();

    let probe = Arc::clone(&backend);
    wait_until(move || probe.held(&MachineClass::CPU_4) == 0).await;
    for _ in 0..1_000 {
        if studio.machine().await.unwrap() == Some(MachineClass::L4)
            && studio.status().await.unwrap() == StudioState::Running
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(studio.status().await.unwrap(), StudioState::Running);
    assert_eq!(studio.machine().await.unwrap(), Some(MachineClass::L4));
    assert_eq!(backend.held(&MachineClass::L4), 1);
}

// =============================================================================
// Duplication
// =============================================================================

#[tokio::test]
async fn duplicates_are_independent_in_both_directions() {
    let backend = Arc::new(MockBackend::default());
    let client = client(&backend, config());

    let source = client.create(identity("source"), false).await.unwrap();
    source.upload_file("shared.txt", b"v1").await.unwrap();
    source.start().await.unwrap();

    let copy = source
        .duplicate_with(DuplicateOptions::named("fork"))
        .await
        .unwrap();
    assert_eq!(copy.status().await.unwrap(), StudioState::Stopped);

    source.upload_file("shared.txt", b"v2-source").await.unwrap();
    copy.upload_file("shared.txt", b"v2-copy").await.unwrap();
    copy.upload_file("only-copy.txt", b"x").await.unwrap();

    assert_eq!(source.download_file("shared.txt").await.unwrap(), b"v2-source");
    assert_eq!(copy.download_file("shared.txt").await.unwrap(), b"v2-copy");
    assert_eq!(source.list_files().await.unwrap(), vec!["shared.txt"]);

    copy.start().await.unwrap();
    assert_eq!(copy.run("cat shared.txt").await.unwrap().stdout, "v2-copy");

    copy.delete().await.unwrap();
    assert_eq!(source.status().await.unwrap(), StudioState::Running);
    assert_eq!(source.download_file("shared.txt").await.unwrap(), b"v2-source");
}

#[tokio::test]
async fn deleting_the_source_leaves_its_duplicate() {
    let backend = Arc::new(MockBackend::default());
    let client = client(&backend, config());

    let source = client.create(identity("origin"), false).await.unwrap();
    source.upload_file("model.py", b"weights = 1").await.unwrap();
    source.start().await.unwrap();

    let copy = source.duplicate().await.unwrap();
    assert_eq!(copy.identity().name(), "origin-copy");

    source.delete().await.unwrap();
    assert_eq!(
        source.status().await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    assert_eq!(copy.status().await.unwrap(), StudioState::Stopped);
    assert_eq!(copy.download_file("model.py").await.unwrap(), b"weights = 1");
    copy.start().await.unwrap();
    assert_eq!(copy.run("cat model.py").await.unwrap().stdout, "weights = 1");
    assert_eq!(backend.machine_count(), 1);

    copy.delete().await.unwrap();
    assert_eq!(backend.machine_count(), 0);
    assert_eq!(backend.volume_count(), 0);
}

// =============================================================================
// Jobs
// =============================================================================

#[tokio::test]
async fn multi_machine_job_with_failed_rank_releases_everything() {
    let backend = Arc::new(MockBackend::default());
    backend.fail_rank(3);
    let client = client(&backend, config());
    let capacity_before = backend_capacity(&backend, &MachineClass::A10G).await;

    let trainer = client.multi_machine();
    let handle = trainer
        .run("torchrun train.py", MachineClass::A10G, 4)
        .await
        .unwrap();

    let record = trainer
        .wait(&handle, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.failed_ranks, vec![3]);
    assert_eq!(record.ranks[3].status, RankStatus::Failed);
    assert!(record
        .ranks
        .iter()
        .filter(|r| r.rank != 3)
        .all(|r| r.status == RankStatus::Released));
    assert_eq!(backend.job_machine_count(handle.job_id()), 0);
    assert_eq!(
        backend_capacity(&backend, &MachineClass::A10G).await,
        capacity_before
    );
}

#[tokio::test]
async fn multi_machine_job_runs_and_finishes() {
    let backend = Arc::new(MockBackend::default().with_ready_after_polls(3));
    let client = client(&backend, config());
    let trainer = client.multi_machine();

    let handle = trainer
        .submit(
            JobSpec::new("torchrun train.py", MachineClass::A10G_X_4)
                .with_machines(4)
                .with_env("NCCL_DEBUG", "INFO"),
        )
        .await
        .unwrap();

    let probe = Arc::clone(&backend);
    let job_id = *handle.job_id();
    wait_until(move || probe.is_launched(&job_id)).await;
    assert_eq!(backend.job_machine_count(handle.job_id()), 4);

    assert!(backend.finish_job(handle.job_id(), true));
    let record = trainer
        .wait(&handle, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Succeeded);
    assert_eq!(backend.machine_count(), 0);
}

#[tokio::test]
async fn cancelling_a_job_releases_its_machines() {
    let backend = Arc::new(MockBackend::default());
    let client = client(&backend, config());
    let jobs = client.jobs();

    let handle = jobs
        .submit(JobSpec::new("python serve.py", MachineClass::T4))
        .await
        .unwrap();
    let probe = Arc::clone(&backend);
    let job_id = *handle.job_id();
    wait_until(move || probe.is_launched(&job_id)).await;

    let record = jobs.cancel(&handle).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(backend.machine_count(), 0);
    assert_eq!(
        jobs.status(&handle).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn jobs_do_not_touch_the_studio_machine_and_survive_its_deletion() {
    let backend = Arc::new(MockBackend::default());
    let client = client(&backend, config());

    let studio = client.create(identity("launcher"), false).await.unwrap();
    studio.start().await.unwrap();
    let studio_machine = studio.info().await.unwrap().machine_id;

    let jobs = client.jobs();
    let handle = jobs
        .submit(JobSpec::new("python train.py", MachineClass::CPU_4).from_studio(&studio))
        .await
        .unwrap();
    let probe = Arc::clone(&backend);
    let job_id = *handle.job_id();
    wait_until(move || probe.is_launched(&job_id)).await;

    assert_eq!(studio.info().await.unwrap().machine_id, studio_machine);
    assert_eq!(backend.held(&MachineClass::CPU_4), 2);

    studio.delete().await.unwrap();

    let record = jobs.status(&handle).await.unwrap();
    assert_eq!(record.status, JobStatus::Running);
    assert_eq!(backend.job_machine_count(handle.job_id()), 1);
    assert_eq!(jobs.list(Some(studio.id())).await.unwrap().len(), 1);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn overlapping_operations_on_one_studio_are_rejected() {
    let backend = Arc::new(MockBackend::default().with_ready_after_polls(200));
    let client = client(&backend, config());
    let studio = client.create(identity("busy"), false).await.unwrap();

    let starter = {
        let studio = studio.clone();
        tokio::spawn(async move { studio.start().await })
    };
    let probe = Arc::clone(&backend);
    wait_until(move || probe.machine_count() == 1).await;

    let err = studio.switch_machine(MachineClass::T4).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
    let err = studio.delete().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModification);

    starter.await.unwrap().unwrap();
    assert_eq!(studio.status().await.unwrap(), StudioState::Running);

    // Other identities are unaffected.
    let other = client.create(identity("idle"), false).await.unwrap();
    other.start().await.unwrap();
}

async fn backend_capacity(backend: &MockBackend, class: &MachineClass) -> u32 {
    use studio_backend::Backend;
    backend.available_capacity(class).await.unwrap()
}
