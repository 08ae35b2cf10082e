//! Control plane client for studios.
//!
//! A studio is a persistent workspace (a filesystem and an environment
//! volume) that can be bound to a machine. This crate drives its lifecycle,
//! moves it between machine classes, runs commands on it, duplicates it,
//! and submits batch jobs on dedicated machines.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         StudioClient                        │
//! │  ┌────────────┐ ┌──────────────┐ ┌──────────────────────┐   │
//! │  │  Studio    │ │  JobsPlugin  │ │ MultiMachineTraining │   │
//! │  │  handles   │ │              │ │       Plugin         │   │
//! │  └────────────┘ └──────────────┘ └──────────────────────┘   │
//! │   lifecycle · provisioner · executor · cloner · dispatcher  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               ▼                             ▼
//!        ┌──────────────┐              ┌──────────────┐
//!        │  Backend     │              │   Auth       │
//!        │ (HTTP / mock)│              │  (API key)   │
//!        └──────────────┘              └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use studio_auth::{ApiKeyAuthenticator, AuthConfig, Credentials, Authenticator};
//! use studio_backend::{HttpBackend, HttpBackendConfig};
//! use studio_control::{ControlConfig, MachineCatalog, MachineClass, StudioClient, StudioIdentity};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let authenticator = ApiKeyAuthenticator::new(AuthConfig::from_env());
//! let principal = authenticator.authenticate(&Credentials::from_env()).await?;
//! let backend = Arc::new(HttpBackend::new(&HttpBackendConfig::from_env(), principal.clone()));
//!
//! let client = StudioClient::new(
//!     principal,
//!     backend,
//!     Arc::new(MachineCatalog::builtin()),
//!     ControlConfig::from_env(),
//! );
//!
//! let studio = client
//!     .create(StudioIdentity::new("my-studio", "research", "acme")?, true)
//!     .await?;
//! studio.start().await?;
//! studio.switch_machine(MachineClass::A10G).await?;
//! let result = studio.run("nvidia-smi").await?;
//! println!("{}", result.stdout);
//! studio.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Lifecycle operations on one studio identity never overlap: a second
//! operation started while one is in flight fails with
//! [`ControlError::ConcurrentModification`] instead of queueing.
//!
//! See the [`lifecycle`] module for the state machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod cloner;
pub mod error;
mod executor;
pub mod guard;
pub mod jobs;
pub mod lifecycle;
pub mod provisioner;
mod studio;
pub mod types;

pub use client::StudioClient;
pub use error::{ControlError, ErrorKind, Result};
pub use jobs::{JobHandle, JobSpec, JobSubmitter, JobsPlugin, MultiMachineTrainingPlugin};
pub use studio::Studio;
pub use types::{ControlConfig, DuplicateOptions, ExecutionResult, SwitchMode};

// Re-export commonly used types from dependencies for convenience
pub use studio_backend::{JobRecord, JobStatus, RankRecord, RankStatus, StudioRecord, StudioState};
pub use studio_core::{
    JobId, MachineCatalog, MachineClass, MachineSpec, StudioId, StudioIdentity, UserId,
};
