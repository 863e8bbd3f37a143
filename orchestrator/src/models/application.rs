//! Application deployment models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::generate_uuid;

/// Application lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Pending,
    Cloning,
    Building,
    Pushing,
    Deploying,
    Running,
    Stopped,
    Failed,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Pending => "pending",
            AppStatus::Cloning => "cloning",
            AppStatus::Building => "building",
            AppStatus::Pushing => "pushing",
            AppStatus::Deploying => "deploying",
            AppStatus::Running => "running",
            AppStatus::Stopped => "stopped",
            AppStatus::Failed => "failed",
            AppStatus::Error => "error",
        }
    }

    /// States a pipeline is actively driving
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            AppStatus::Pending
                | AppStatus::Cloning
                | AppStatus::Building
                | AppStatus::Pushing
                | AppStatus::Deploying
        )
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_in_progress()
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime category of a source repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Detect from repository markers
    Auto,
    Node,
    NextJs,
    Python,
    Go,
    Static,
    Generic,
}

impl RuntimeKind {
    /// Port the runtime listens on when none is configured
    pub fn default_port(&self) -> u16 {
        match self {
            RuntimeKind::Node | RuntimeKind::NextJs | RuntimeKind::Auto => 3000,
            RuntimeKind::Python => 8000,
            RuntimeKind::Go | RuntimeKind::Generic => 8080,
            RuntimeKind::Static => 80,
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuntimeKind::Auto => "auto",
            RuntimeKind::Node => "node",
            RuntimeKind::NextJs => "nextjs",
            RuntimeKind::Python => "python",
            RuntimeKind::Go => "go",
            RuntimeKind::Static => "static",
            RuntimeKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Build from a source repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySource {
    pub url: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    pub build_command: Option<String>,

    pub start_command: Option<String>,

    #[serde(default = "default_runtime")]
    pub runtime: RuntimeKind,

    /// Filled in after auto-detection
    pub detected_runtime: Option<RuntimeKind>,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_runtime() -> RuntimeKind {
    RuntimeKind::Auto
}

impl RepositorySource {
    /// The runtime to build with, once known
    pub fn effective_runtime(&self) -> RuntimeKind {
        match self.runtime {
            RuntimeKind::Auto => self.detected_runtime.unwrap_or(RuntimeKind::Generic),
            other => other,
        }
    }
}

/// Deploy a pre-built registry image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    pub image: String,

    #[serde(default = "default_tag")]
    pub tag: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl ImageSource {
    /// Full image reference, keeping an explicit tag or digest in `image`
    pub fn reference(&self) -> String {
        let last_segment = self.image.rsplit('/').next().unwrap_or(&self.image);
        if last_segment.contains(':') || last_segment.contains('@') || self.tag.is_empty() {
            self.image.clone()
        } else {
            format!("{}:{}", self.image, self.tag)
        }
    }
}

/// Where the application's code comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AppSource {
    Repository(RepositorySource),
    Image(ImageSource),
}

/// Container runtime parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub port: u16,

    /// CPU units (1024 = one vCPU)
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory in MiB
    #[serde(default = "default_memory")]
    pub memory: u32,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    512
}

/// Where the application runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Target {
    /// The provider's container-orchestration service
    #[serde(rename_all = "camelCase")]
    ManagedCluster {
        cluster_name: Option<String>,
        task_definition: Option<String>,
        service_name: Option<String>,
    },

    /// A user-owned virtual machine reached through the remote command channel
    #[serde(rename_all = "camelCase")]
    VirtualMachine {
        instance_id: String,
        public_ip: Option<String>,
        private_ip: Option<String>,
    },
}

impl Target {
    pub fn is_virtual_machine(&self) -> bool {
        matches!(self, Target::VirtualMachine { .. })
    }
}

/// A deployable unit and its delivery history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub owner_id: String,
    pub credential_id: String,
    pub name: String,
    pub source: AppSource,
    pub runtime: RuntimeSpec,
    pub target: Target,
    pub status: AppStatus,

    /// Append-only, timestamped progress lines
    #[serde(default)]
    pub logs: Vec<String>,

    pub error_message: Option<String>,
    pub url: Option<String>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub version: u64,
}

impl Application {
    pub fn new(request: CreateApplication) -> Self {
        let now = Utc::now();
        let port = request.runtime.port;
        Self {
            id: generate_uuid(),
            owner_id: request.owner_id,
            credential_id: request.credential_id,
            name: request.name,
            source: request.source,
            runtime: RuntimeSpec { port, ..request.runtime },
            target: request.target,
            status: AppStatus::Pending,
            logs: Vec::new(),
            error_message: None,
            url: None,
            last_deployed_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// DNS- and container-safe name derived from the application name
    pub fn slug(&self) -> String {
        slugify(&self.name, &self.id)
    }

    pub fn push_log(&mut self, message: impl AsRef<str>) {
        self.logs.push(format_log_line(message.as_ref()));
    }
}

/// Lowercase `[a-z0-9-]` name, at most 40 chars; falls back to the id prefix
pub fn slugify(name: &str, fallback_id: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(40).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        format!("app-{}", fallback_id.chars().take(8).collect::<String>())
    } else {
        slug
    }
}

/// Prefix a record log message with an RFC3339 timestamp
pub fn format_log_line(message: &str) -> String {
    format!("[{}] {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), message)
}

/// Request body for creating an application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateApplication {
    pub owner_id: String,
    pub credential_id: String,
    pub name: String,
    pub source: AppSource,
    pub runtime: RuntimeSpec,
    pub target: Target,
}

/// Acknowledgment returned by asynchronous application operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationAck {
    pub application_id: String,
    pub status: AppStatus,
}

impl From<&Application> for ApplicationAck {
    fn from(application: &Application) -> Self {
        Self {
            application_id: application.id.clone(),
            status: application.status,
        }
    }
}
