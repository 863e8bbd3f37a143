//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to daily files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Storage root; the platform default applies when unset
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// External tool binaries
    #[serde(default)]
    pub tools: ToolSettings,

    /// Cloud provider defaults
    #[serde(default)]
    pub cloud: CloudSettings,

    /// Background pipeline configuration
    #[serde(default)]
    pub pipelines: PipelineSettings,

    /// Drift sync interval in seconds; 0 disables the periodic sync
    #[serde(default = "default_drift_interval")]
    pub drift_interval_secs: u64,

    /// Optional webhook that receives owner notifications
    #[serde(default)]
    pub notification_webhook: Option<String>,
}

fn default_drift_interval() -> u64 {
    900
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            base_dir: None,
            server: ServerSettings::default(),
            tools: ToolSettings::default(),
            cloud: CloudSettings::default(),
            pipelines: PipelineSettings::default(),
            drift_interval_secs: default_drift_interval(),
            notification_webhook: None,
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Paths or names of the external binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_terraform")]
    pub terraform: String,

    #[serde(default = "default_docker")]
    pub docker: String,

    #[serde(default = "default_git")]
    pub git: String,

    #[serde(default = "default_aws")]
    pub aws: String,
}

fn default_terraform() -> String {
    "terraform".to_string()
}

fn default_docker() -> String {
    "docker".to_string()
}

fn default_git() -> String {
    "git".to_string()
}

fn default_aws() -> String {
    "aws".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            terraform: default_terraform(),
            docker: default_docker(),
            git: default_git(),
            aws: default_aws(),
        }
    }
}

/// Cloud provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Region used when a credential set does not name one
    #[serde(default = "default_region")]
    pub default_region: String,

    /// Shared cluster for managed-cluster applications
    #[serde(default = "default_cluster")]
    pub cluster_name: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_cluster() -> String {
    crate::deploy::cluster::DEFAULT_CLUSTER.to_string()
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            cluster_name: default_cluster(),
        }
    }
}

/// Pipeline execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Upper bound on background tasks running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,

    /// Hard limit for one remote command
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,

    #[serde(default = "default_remote_poll")]
    pub remote_poll_secs: u64,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_clone_timeout() -> u64 {
    300
}

fn default_remote_timeout() -> u64 {
    600
}

fn default_remote_poll() -> u64 {
    5
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            clone_timeout_secs: default_clone_timeout(),
            remote_timeout_secs: default_remote_timeout(),
            remote_poll_secs: default_remote_poll(),
        }
    }
}
