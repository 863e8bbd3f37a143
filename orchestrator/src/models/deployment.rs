//! Infrastructure deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::generate_uuid;

/// Kind of cloud resource a deployment manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// A single virtual machine
    ComputeInstance,

    /// An object storage bucket
    ObjectStore,

    /// An identity (IAM user)
    Identity,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ComputeInstance => "compute-instance",
            ResourceKind::ObjectStore => "object-store",
            ResourceKind::Identity => "identity",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Completed,
    Failed,
    Destroying,
    Destroyed,
    DestroyFailed,
    DeletedExternally,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Completed => "completed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Destroying => "destroying",
            DeploymentStatus::Destroyed => "destroyed",
            DeploymentStatus::DestroyFailed => "destroy_failed",
            DeploymentStatus::DeletedExternally => "deleted_externally",
        }
    }

    /// Pending and destroying are the only states with work in flight
    pub fn is_in_progress(&self) -> bool {
        matches!(self, DeploymentStatus::Pending | DeploymentStatus::Destroying)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who removed the underlying resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletedBy {
    Ui,
    CloudConsole,
    Unknown,
}

/// A request to create (and later destroy) a single cloud resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Unique deployment ID
    pub id: String,

    /// Owner user ID
    pub owner_id: String,

    /// Credential set used for every provider call
    pub credential_id: String,

    pub resource_kind: ResourceKind,

    pub resource_name: String,

    /// Kind-specific configuration
    #[serde(default)]
    pub config: Map<String, Value>,

    pub status: DeploymentStatus,

    /// Raw IaC tool output of the last run
    pub output: Option<String>,

    pub error_message: Option<String>,

    /// Set once the workspace executor has been invoked for this record
    pub workspace_id: Option<String>,

    pub deleted_by: Option<DeletedBy>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    pub deleted_at: Option<DateTime<Utc>>,

    pub last_synced_at: Option<DateTime<Utc>>,

    /// Incremented on every persisted change
    #[serde(default)]
    pub version: u64,
}

impl Deployment {
    /// Create a new pending deployment record
    pub fn new(request: CreateDeployment) -> Self {
        let now = Utc::now();
        Self {
            id: generate_uuid(),
            owner_id: request.owner_id,
            credential_id: request.credential_id,
            resource_kind: request.resource_kind,
            resource_name: request.resource_name,
            config: request.config,
            status: DeploymentStatus::Pending,
            output: None,
            error_message: None,
            workspace_id: None,
            deleted_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_synced_at: None,
            version: 0,
        }
    }
}

/// Request body for creating a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeployment {
    pub owner_id: String,
    pub credential_id: String,
    pub resource_kind: ResourceKind,
    pub resource_name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Acknowledgment returned by asynchronous deployment operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentAck {
    pub deployment_id: String,
    pub status: DeploymentStatus,
}

impl From<&Deployment> for DeploymentAck {
    fn from(deployment: &Deployment) -> Self {
        Self {
            deployment_id: deployment.id.clone(),
            status: deployment.status,
        }
    }
}

/// Result of a bulk drift sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub checked: usize,
    pub drifted: usize,
    pub errors: usize,
}
