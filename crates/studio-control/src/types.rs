//! Configuration and value types for control plane operations.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use studio_core::MachineClass;

/// How `switch_machine` behaves on a running studio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchMode {
    /// Return once the studio is running on the new machine.
    #[default]
    Blocking,
    /// Return once the new machine is secured; finish the migration in the background.
    Detached,
}

impl FromStr for SwitchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking" | "sync" => Ok(Self::Blocking),
            "detached" | "async" | "background" => Ok(Self::Detached),
            other => Err(format!("unknown switch mode: {other}")),
        }
    }
}

/// Configuration for the control plane client.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Machine class used when a studio starts without one.
    pub default_machine: MachineClass,
    /// Upper bound on waiting for a single machine to become ready.
    pub provision_timeout: Duration,
    /// Interval between readiness polls.
    pub poll_interval: Duration,
    /// Extra attempts after a retriable provisioning failure.
    pub provision_retries: u32,
    /// Base delay between provisioning attempts, doubled each retry.
    pub retry_backoff: Duration,
    /// Upper bound on a remote command.
    pub run_timeout: Duration,
    /// Upper bound on all ranks of a job reaching the barrier.
    pub barrier_timeout: Duration,
    /// Behaviour of `switch_machine` while running.
    pub switch_mode: SwitchMode,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            default_machine: MachineClass::CPU_4,
            provision_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            provision_retries: 3,
            retry_backoff: Duration::from_millis(500),
            run_timeout: Duration::from_secs(300),
            barrier_timeout: Duration::from_secs(900),
            switch_mode: SwitchMode::Blocking,
        }
    }
}

impl ControlConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `STUDIO_DEFAULT_MACHINE`: Machine class for a first start
    /// - `STUDIO_PROVISION_TIMEOUT_SECS`: Per-machine readiness bound
    /// - `STUDIO_POLL_INTERVAL_MS`: Readiness poll interval
    /// - `STUDIO_PROVISION_RETRIES`: Retry budget for provisioning
    /// - `STUDIO_RETRY_BACKOFF_MS`: Base retry backoff
    /// - `STUDIO_RUN_TIMEOUT_SECS`: Remote command bound
    /// - `STUDIO_BARRIER_TIMEOUT_SECS`: Multi-machine barrier bound
    /// - `STUDIO_SWITCH_MODE`: "blocking" or "detached"
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("STUDIO_DEFAULT_MACHINE") {
            config.default_machine = MachineClass::new(val);
        }
        if let Some(secs) = env_parse("STUDIO_PROVISION_TIMEOUT_SECS") {
            config.provision_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("STUDIO_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(retries) = env_parse("STUDIO_PROVISION_RETRIES") {
            config.provision_retries = retries;
        }
        if let Some(ms) = env_parse("STUDIO_RETRY_BACKOFF_MS") {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("STUDIO_RUN_TIMEOUT_SECS") {
            config.run_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("STUDIO_BARRIER_TIMEOUT_SECS") {
            config.barrier_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("STUDIO_SWITCH_MODE") {
            match val.parse() {
                Ok(mode) => config.switch_mode = mode,
                Err(e) => tracing::warn!(error = %e, "Ignoring STUDIO_SWITCH_MODE"),
            }
        }

        config
    }

    /// Backoff before retry number `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(1 << attempt.min(16))
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The command as submitted.
    pub command: String,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code, verbatim.
    pub exit_code: i32,
    /// When the command was sent.
    pub started_at: DateTime<Utc>,
    /// When the result came back.
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// True if the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Overrides for [`Studio::duplicate_with`](crate::Studio::duplicate_with).
#[derive(Debug, Clone, Default)]
pub struct DuplicateOptions {
    /// Name of the copy. Derived from the source when unset.
    pub name: Option<String>,
    /// Target teamspace. Same as the source when unset.
    pub teamspace: Option<String>,
    /// Target org. Same as the source when unset.
    pub org: Option<String>,
}

impl DuplicateOptions {
    /// Copy under an explicit name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Place the copy in another teamspace.
    #[must_use]
    pub fn in_teamspace(mut self, teamspace: impl Into<String>, org: impl Into<String>) -> Self {
        self.teamspace = Some(teamspace.into());
        self.org = Some(org.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_config_defaults() {
        let config = ControlConfig::default();
        assert_eq!(config.default_machine, MachineClass::CPU_4);
        assert_eq!(config.provision_retries, 3);
        assert_eq!(config.switch_mode, SwitchMode::Blocking);
    }

    #[test]
    fn backoff_doubles() {
        let config = ControlConfig {
            retry_backoff: Duration::from_millis(100),
            ..ControlConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn switch_mode_parses() {
        assert_eq!("Blocking".parse::<SwitchMode>(), Ok(SwitchMode::Blocking));
        assert_eq!("detached".parse::<SwitchMode>(), Ok(SwitchMode::Detached));
        assert!("sometimes".parse::<SwitchMode>().is_err());
    }

    #[test]
    fn duplicate_options_builder() {
        let opts = DuplicateOptions::named("copy").in_teamspace("research", "org2");
        assert_eq!(opts.name.as_deref(), Some("copy"));
        assert_eq!(opts.teamspace.as_deref(), Some("research"));
        assert_eq!(opts.org.as_deref(), Some("org2"));
    }
}
