//! Cloud provider API
//!
//! The orchestration core talks to the provider only through [`CloudApi`].
//! [`aws_cli::AwsCli`] implements it on top of the provider's CLI.

pub mod aws_cli;

use std::collections::BTreeMap;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::PilotError;
use crate::models::credentials::AwsCredentials;

/// Relevant parts of a virtual machine description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    /// Provider lifecycle state, e.g. `running` or `terminated`
    pub state: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub security_group_ids: Vec<String>,
}

impl InstanceDescription {
    /// Terminated instances count as gone
    pub fn is_terminated(&self) -> bool {
        matches!(self.state.as_str(), "terminated" | "shutting-down")
    }
}

/// Outcome of a read-only existence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProbe {
    pub exists: bool,
    /// Provider message explaining the result, if any
    pub detail: Option<String>,
}

impl ResourceProbe {
    pub fn present() -> Self {
        Self {
            exists: true,
            detail: None,
        }
    }

    pub fn absent(detail: impl Into<String>) -> Self {
        Self {
            exists: false,
            detail: Some(detail.into()),
        }
    }
}

/// Short-lived registry login
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: SecretString,
    /// Registry host, without scheme
    pub endpoint: String,
}

/// A single-container task definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinitionSpec {
    pub family: String,
    pub container_name: String,
    pub image: String,
    pub cpu: u32,
    pub memory: u32,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub log_group: String,
    pub region: String,
    pub execution_role_arn: String,
}

/// Remote command lifecycle as reported by the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Pending,
    InProgress,
    Delayed,
    Success,
    Cancelled,
    TimedOut,
    Failed,
    Cancelling,
}

impl CommandState {
    pub fn parse(status: &str) -> Self {
        match status {
            "Pending" => CommandState::Pending,
            "InProgress" => CommandState::InProgress,
            "Delayed" => CommandState::Delayed,
            "Success" => CommandState::Success,
            "Cancelled" => CommandState::Cancelled,
            "TimedOut" => CommandState::TimedOut,
            "Cancelling" => CommandState::Cancelling,
            _ => CommandState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Success
                | CommandState::Cancelled
                | CommandState::TimedOut
                | CommandState::Failed
        )
    }
}

/// Status and output of a remote command on one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub state: CommandState,
    pub stdout: String,
    pub stderr: String,
}

/// Provider operations used by the orchestration core
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// `None` when the instance id is unknown to the provider
    async fn describe_instance(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, PilotError>;

    async fn probe_bucket(
        &self,
        creds: &AwsCredentials,
        bucket: &str,
    ) -> Result<ResourceProbe, PilotError>;

    async fn probe_user(
        &self,
        creds: &AwsCredentials,
        user_name: &str,
    ) -> Result<ResourceProbe, PilotError>;

    async fn account_id(&self, creds: &AwsCredentials) -> Result<String, PilotError>;

    /// Create the registry repository if absent; returns its URI
    async fn ensure_repository(
        &self,
        creds: &AwsCredentials,
        name: &str,
    ) -> Result<String, PilotError>;

    async fn registry_auth(&self, creds: &AwsCredentials) -> Result<RegistryAuth, PilotError>;

    /// Create the cluster if absent or inactive
    async fn ensure_cluster(&self, creds: &AwsCredentials, name: &str) -> Result<(), PilotError>;

    /// Register a new task definition revision; returns its ARN
    async fn register_task_definition(
        &self,
        creds: &AwsCredentials,
        spec: &TaskDefinitionSpec,
    ) -> Result<String, PilotError>;

    async fn scale_service(
        &self,
        creds: &AwsCredentials,
        cluster: &str,
        service: &str,
        desired_count: u32,
    ) -> Result<(), PilotError>;

    /// Ping status of the remote command agent, `None` if not registered
    async fn remote_agent_status(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<Option<String>, PilotError>;

    /// Ship shell lines to the instance; returns the command id
    async fn send_command(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
        commands: &[String],
        comment: &str,
    ) -> Result<String, PilotError>;

    async fn command_invocation(
        &self,
        creds: &AwsCredentials,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation, PilotError>;

    /// Store an encrypted parameter, replacing any previous value
    async fn put_secure_parameter(
        &self,
        creds: &AwsCredentials,
        name: &str,
        value: &SecretString,
    ) -> Result<(), PilotError>;

    /// Succeeds when the parameter is already gone
    async fn delete_parameter(&self, creds: &AwsCredentials, name: &str) -> Result<(), PilotError>;
}
