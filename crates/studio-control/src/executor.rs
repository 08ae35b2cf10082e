//! Remote command execution on a running studio.

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use studio_backend::StudioState;

use crate::error::{ControlError, Result};
use crate::studio::Studio;
use crate::types::ExecutionResult;

impl Studio {
    /// Run a shell command on the studio's machine and wait for it to finish.
    ///
    /// A non-zero exit code is reported in the result, not as an error.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the studio is `Running`, and `Timeout`
    /// if the command outlives the configured run timeout. The studio stays
    /// running either way.
    pub async fn run(&self, command: &str) -> Result<ExecutionResult> {
        if command.trim().is_empty() {
            return Err(ControlError::InvalidRequest("command must not be empty".into()));
        }

        let record = self.load().await?;
        let machine_id = match (record.state, record.machine_id) {
            (StudioState::Running, Some(machine_id)) => machine_id,
            (state, _) => {
                return Err(ControlError::InvalidState {
                    identity: self.identity().clone(),
                    state,
                    operation: "run a command on",
                })
            }
        };

        let limit = self.ctx.config.run_timeout;
        let started_at = Utc::now();
        debug!(studio = %self.identity(), machine_id = %machine_id, command, "Running command");

        let output = match timeout(limit, self.ctx.backend.execute(&machine_id, command)).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(studio = %self.identity(), command, ?limit, "Command timed out");
                return Err(ControlError::Timeout {
                    operation: "run",
                    after: limit,
                });
            }
        };

        let result = ExecutionResult {
            command: command.to_string(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            started_at,
            finished_at: Utc::now(),
        };
        debug!(studio = %self.identity(), exit_code = result.exit_code, "Command finished");
        Ok(result)
    }
}
