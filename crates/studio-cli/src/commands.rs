//! Command execution.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use studio_auth::{ApiKeyAuthenticator, AuthConfig, Credentials};
use studio_backend::{HttpBackend, HttpBackendConfig};
use studio_control::{
    ControlConfig, DuplicateOptions, JobHandle, JobId, JobSpec, JobSubmitter, MachineCatalog,
    MachineClass, StudioClient, StudioIdentity, SwitchMode,
};

use crate::output;
use crate::{Args, Command, JobCommand, SubmitArgs};

/// Run one parsed command line.
pub async fn execute(args: Args) -> Result<ExitCode> {
    let catalog = Arc::new(MachineCatalog::builtin());

    // The catalog is local; no credentials needed.
    if matches!(args.command, Command::Machines) {
        output::machines(&catalog, args.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = ControlConfig::from_env();
    // The process exits after one command, which would cut off a background migration.
    config.switch_mode = SwitchMode::Blocking;
    let client = connect(&args, catalog, config).await?;
    let json = args.json;
    let scope = Scope {
        teamspace: &args.teamspace,
        org: &args.org,
    };

    match args.command {
        Command::Create { name, exists_ok } => {
            let studio = client.create(scope.identity(&name)?, exists_ok).await?;
            output::studio(&studio.info().await?, json)?;
        }
        Command::Start { name, machine } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            match machine {
                Some(machine) => studio.start_with(MachineClass::new(machine)).await?,
                None => studio.start().await?,
            }
            output::studio(&studio.info().await?, json)?;
        }
        Command::Stop { name } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            studio.stop().await?;
            output::studio(&studio.info().await?, json)?;
        }
        Command::Status { name } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            output::state(studio.status().await?, json)?;
        }
        Command::Info { name } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            output::studio(&studio.info().await?, json)?;
        }
        Command::Switch { name, machine } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            studio.switch_machine(MachineClass::new(machine)).await?;
            output::studio(&studio.info().await?, json)?;
        }
        Command::Run { name, command } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            let result = studio.run(&command.join(" ")).await?;
            output::execution(&result, json)?;
            return Ok(ExitCode::from(exit_status(result.exit_code)));
        }
        Command::Duplicate {
            name,
            new_name,
            to_teamspace,
            to_org,
        } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            let options = DuplicateOptions {
                name: new_name,
                teamspace: to_teamspace,
                org: to_org,
            };
            let copy = studio.duplicate_with(options).await?;
            output::studio(&copy.info().await?, json)?;
        }
        Command::Delete { name } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            studio.delete().await?;
            output::message(&format!("deleted {}", studio.identity()), json)?;
        }
        Command::List => {
            let studios = client.list_studios(scope.teamspace, scope.org).await?;
            output::studios(&studios, json)?;
        }
        Command::Upload {
            name,
            local,
            remote,
        } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            let remote = match remote {
                Some(remote) => remote,
                None => file_name(&local)?,
            };
            let contents = tokio::fs::read(&local)
                .await
                .with_context(|| format!("failed to read {}", local.display()))?;
            studio.upload_file(&remote, &contents).await?;
            output::message(&format!("uploaded {} bytes to {remote}", contents.len()), json)?;
        }
        Command::Download {
            name,
            remote,
            local,
        } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            let contents = studio.download_file(&remote).await?;
            let local = match local {
                Some(local) => local,
                None => file_name(Path::new(&remote))?.into(),
            };
            tokio::fs::write(&local, &contents)
                .await
                .with_context(|| format!("failed to write {}", local.display()))?;
            output::message(
                &format!("downloaded {} bytes to {}", contents.len(), local.display()),
                json,
            )?;
        }
        Command::Files { name } => {
            let studio = client.studio(scope.identity(&name)?).await?;
            output::lines(&studio.list_files().await?, json)?;
        }
        Command::Machines => output::machines(client.catalog(), json)?,
        Command::Job(command) => return job(&client, &scope, command, json).await,
    }

    Ok(ExitCode::SUCCESS)
}

async fn job(
    client: &StudioClient,
    scope: &Scope<'_>,
    command: JobCommand,
    json: bool,
) -> Result<ExitCode> {
    let trainer = client.multi_machine();

    match command {
        JobCommand::Submit(submit) => {
            let spec = job_spec(client, scope, submit).await?;
            let submitted = if spec.num_machines > 1 {
                trainer.submit(spec).await?
            } else {
                client.jobs().submit(spec).await?
            };
            // The fleet task dies with the process, so let it launch or roll back first.
            output::job(&trainer.settle(&submitted).await?, json)?;
        }
        JobCommand::Status { job_id } => {
            output::job(&trainer.status(&handle(&job_id)?).await?, json)?;
        }
        JobCommand::Cancel { job_id } => {
            output::job(&trainer.cancel(&handle(&job_id)?).await?, json)?;
        }
        JobCommand::Wait { job_id, timeout } => {
            let record = trainer
                .wait(&handle(&job_id)?, Duration::from_secs(timeout))
                .await?;
            output::job(&record, json)?;
            if record.status != studio_control::JobStatus::Succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        JobCommand::List { studio } => {
            let studio_id = match studio {
                Some(name) => Some(*client.studio(scope.identity(&name)?).await?.id()),
                None => None,
            };
            output::jobs(&trainer.list(studio_id.as_ref()).await?, json)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn job_spec(client: &StudioClient, scope: &Scope<'_>, submit: SubmitArgs) -> Result<JobSpec> {
    let mut spec = JobSpec::new(submit.command.join(" "), MachineClass::new(submit.machine))
        .with_machines(submit.count);
    if let Some(name) = submit.name {
        spec = spec.with_name(name);
    }
    for (key, value) in submit.env {
        spec = spec.with_env(key, value);
    }
    if let Some(studio) = submit.studio {
        let studio = client.studio(scope.identity(&studio)?).await?;
        spec = spec.from_studio(&studio);
    }
    Ok(spec)
}

async fn connect(args: &Args, catalog: Arc<MachineCatalog>, config: ControlConfig) -> Result<StudioClient> {
    let auth_config = AuthConfig {
        base_url: args.api_url.clone(),
        ..AuthConfig::from_env()
    };
    let backend_config = HttpBackendConfig {
        base_url: args.api_url.clone(),
        ..HttpBackendConfig::from_env()
    };
    let credentials = Credentials::from_parts(args.user_id.clone(), args.api_key.clone());

    let authenticator = ApiKeyAuthenticator::new(auth_config);
    let principal = studio_auth::Authenticator::authenticate(&authenticator, &credentials)
        .await
        .context("authentication failed")?;
    tracing::debug!(user_id = %principal.user_id(), api_url = %args.api_url, "Connected");

    let backend = Arc::new(HttpBackend::new(&backend_config, principal.clone()));
    Ok(StudioClient::new(principal, backend, catalog, config))
}

/// Teamspace and org studio names resolve in.
struct Scope<'a> {
    teamspace: &'a str,
    org: &'a str,
}

impl Scope<'_> {
    fn identity(&self, name: &str) -> Result<StudioIdentity> {
        StudioIdentity::new(name, self.teamspace, self.org)
            .with_context(|| format!("invalid studio name {name:?}"))
    }
}

fn handle(job_id: &str) -> Result<JobHandle> {
    let job_id: JobId = job_id
        .parse()
        .with_context(|| format!("invalid job id {job_id:?}"))?;
    Ok(JobHandle::from(job_id))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a file name from {}", path.display()))
}

/// Map a remote exit code onto a process exit status.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
