//! Remote execution adapter

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cloud::{CloudApi, CommandInvocation, CommandState};
use crate::errors::PilotError;
use crate::models::credentials::AwsCredentials;

const ONLINE: &str = "Online";

/// Poll settings for remote commands
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub poll_interval: Duration,
    /// Hard wall-clock limit for one command
    pub timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Runs shell scripts on virtual machines through the managed command channel
pub struct RemoteExecutor {
    cloud: Arc<dyn CloudApi>,
    options: RemoteOptions,
}

impl RemoteExecutor {
    pub fn new(cloud: Arc<dyn CloudApi>, options: RemoteOptions) -> Self {
        Self { cloud, options }
    }

    /// Fail unless the instance is registered with the channel and online
    pub async fn ensure_online(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<(), PilotError> {
        match self.cloud.remote_agent_status(creds, instance_id).await? {
            Some(status) if status == ONLINE => Ok(()),
            Some(status) => Err(PilotError::UnreachableTarget(format!(
                "instance {} command agent is {}",
                instance_id, status
            ))),
            None => Err(PilotError::UnreachableTarget(format!(
                "instance {} is not registered with the remote command channel; \
                 check that the agent is installed and the instance profile allows it",
                instance_id
            ))),
        }
    }

    /// Ship `commands` and wait for a terminal state
    pub async fn run(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
        commands: &[String],
        comment: &str,
    ) -> Result<CommandInvocation, PilotError> {
        let command_id = self
            .cloud
            .send_command(creds, instance_id, commands, comment)
            .await?;
        info!(instance_id, command_id = %command_id, "Sent remote command");

        let deadline = Instant::now() + self.options.timeout;
        loop {
            tokio::time::sleep(self.options.poll_interval).await;

            let invocation = match self
                .cloud
                .command_invocation(creds, &command_id, instance_id)
                .await
            {
                Ok(invocation) => invocation,
                Err(PilotError::Network(e)) => {
                    warn!(command_id = %command_id, "Polling remote command failed: {}", e);
                    if Instant::now() >= deadline {
                        return Err(timed_out(&command_id, self.options.timeout));
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(command_id = %command_id, state = ?invocation.state, "Remote command status");

            if invocation.state.is_terminal() {
                return match invocation.state {
                    CommandState::Success => Ok(invocation),
                    state => Err(PilotError::ToolExecution(format!(
                        "remote command ended {:?}: {}",
                        state,
                        failure_text(&invocation)
                    ))),
                };
            }
            if Instant::now() >= deadline {
                return Err(timed_out(&command_id, self.options.timeout));
            }
        }
    }
}

fn timed_out(command_id: &str, limit: Duration) -> PilotError {
    PilotError::Timeout(format!(
        "remote command {} did not finish within {}s",
        command_id,
        limit.as_secs()
    ))
}

fn failure_text(invocation: &CommandInvocation) -> String {
    let stderr = invocation.stderr.trim();
    if stderr.is_empty() {
        invocation.stdout.trim().to_string()
    } else {
        stderr.to_string()
    }
}
