//! Studio CLI - manage studios and jobs from the terminal.
//!
//! This is the entry point for the `studio` binary.

mod commands;
mod output;

use std::process::ExitCode;

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Studio CLI - manage studios and jobs from the terminal.
#[derive(Parser, Debug)]
#[command(name = "studio")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Platform user ID.
    #[arg(long, env = "STUDIO_USER_ID", global = true, hide_env_values = true)]
    pub user_id: Option<String>,

    /// Platform API key.
    #[arg(long, env = "STUDIO_API_KEY", global = true, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Platform API URL.
    #[arg(
        long,
        env = "STUDIO_API_URL",
        global = true,
        default_value = "https://api.studio.dev"
    )]
    pub api_url: String,

    /// Teamspace studios live in.
    #[arg(long, env = "STUDIO_TEAMSPACE", global = true, default_value = "default")]
    pub teamspace: String,

    /// Organization owning the teamspace.
    #[arg(long, env = "STUDIO_ORG", global = true, default_value = "default")]
    pub org: String,

    /// Print machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable debug logging.
    #[arg(long, global = true, default_value = "false")]
    pub debug: bool,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a studio.
    Create {
        /// Studio name.
        name: String,
        /// Succeed if the studio already exists.
        #[arg(long)]
        exists_ok: bool,
    },
    /// Start a studio.
    Start {
        /// Studio name.
        name: String,
        /// Machine class to start on.
        #[arg(long)]
        machine: Option<String>,
    },
    /// Stop a running studio.
    Stop {
        /// Studio name.
        name: String,
    },
    /// Print a studio's state.
    Status {
        /// Studio name.
        name: String,
    },
    /// Print a studio's full record.
    Info {
        /// Studio name.
        name: String,
    },
    /// Move a studio to another machine class.
    Switch {
        /// Studio name.
        name: String,
        /// Target machine class.
        machine: String,
    },
    /// Run a command on a running studio.
    Run {
        /// Studio name.
        name: String,
        /// Command and arguments.
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Duplicate a studio.
    Duplicate {
        /// Studio name.
        name: String,
        /// Name of the copy.
        #[arg(long = "as")]
        new_name: Option<String>,
        /// Teamspace of the copy.
        #[arg(long, requires = "to_org")]
        to_teamspace: Option<String>,
        /// Organization of the copy.
        #[arg(long, requires = "to_teamspace")]
        to_org: Option<String>,
    },
    /// Delete a studio and its files.
    Delete {
        /// Studio name.
        name: String,
    },
    /// List studios in the teamspace.
    List,
    /// List machine classes.
    Machines,
    /// Copy a local file into a studio.
    Upload {
        /// Studio name.
        name: String,
        /// Local file.
        local: std::path::PathBuf,
        /// Path inside the studio. Defaults to the local file name.
        remote: Option<String>,
    },
    /// Copy a file out of a studio.
    Download {
        /// Studio name.
        name: String,
        /// Path inside the studio.
        remote: String,
        /// Local destination. Defaults to the remote file name.
        local: Option<std::path::PathBuf>,
    },
    /// List files in a studio.
    Files {
        /// Studio name.
        name: String,
    },
    /// Submit and manage jobs.
    #[command(subcommand)]
    Job(JobCommand),
}

/// Job commands.
#[derive(Subcommand, Debug)]
pub enum JobCommand {
    /// Submit a job.
    Submit(SubmitArgs),
    /// Print a job's record.
    Status {
        /// Job ID.
        job_id: String,
    },
    /// Cancel a job.
    Cancel {
        /// Job ID.
        job_id: String,
    },
    /// Wait for a job to finish.
    Wait {
        /// Job ID.
        job_id: String,
        /// Seconds to wait.
        #[arg(long, default_value = "3600")]
        timeout: u64,
    },
    /// List jobs.
    List {
        /// Only jobs submitted from this studio.
        #[arg(long)]
        studio: Option<String>,
    },
}

/// Arguments of `job submit`.
#[derive(ClapArgs, Debug)]
pub struct SubmitArgs {
    /// Machine class of every rank.
    #[arg(long)]
    pub machine: String,
    /// Number of machines.
    #[arg(long, default_value = "1")]
    pub count: u32,
    /// Job name.
    #[arg(long)]
    pub name: Option<String>,
    /// Studio the job belongs to.
    #[arg(long)]
    pub studio: Option<String>,
    /// Environment variables as KEY=VALUE.
    #[arg(long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,
    /// Command and arguments.
    #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse arguments
    let args = Args::parse();

    // Initialize logging
    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter("studio_cli=debug,studio_control=debug,studio_backend=debug,warn")
            .with_writer(std::io::stderr)
            .init();
    }

    commands::execute(args).await
}
