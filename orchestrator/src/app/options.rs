//! Application configuration options

use std::time::Duration;

use crate::deploy::remote::RemoteOptions;
use crate::deploy::workspace::ExecutorOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{Settings, ToolSettings};
use crate::workers::{dispatcher, reconciler};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Enable the HTTP API
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Background task dispatcher options
    pub dispatcher: dispatcher::Options,

    /// Periodic drift reconciliation; `None` disables the worker
    pub reconciler: Option<reconciler::Options>,

    /// IaC workspace executor options
    pub executor: ExecutorOptions,

    /// Remote command channel options
    pub remote: RemoteOptions,

    /// External tool binaries
    pub tools: ToolSettings,

    /// Region for credential sets that do not name one
    pub default_region: String,

    /// Shared cluster for managed-cluster applications
    pub cluster_name: String,

    pub clone_timeout: Duration,

    /// Webhook receiving owner notifications; notifications are logged when unset
    pub notification_webhook: Option<String>,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let pipelines = &settings.pipelines;

        let reconciler = (settings.drift_interval_secs > 0).then(|| reconciler::Options {
            interval: Duration::from_secs(settings.drift_interval_secs),
            ..reconciler::Options::default()
        });

        Self {
            layout,
            enable_server: true,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            dispatcher: dispatcher::Options {
                max_concurrent: pipelines.max_concurrent.max(1),
                ..dispatcher::Options::default()
            },
            reconciler,
            executor: ExecutorOptions {
                binary: settings.tools.terraform.clone(),
                ..ExecutorOptions::default()
            },
            remote: RemoteOptions {
                poll_interval: Duration::from_secs(pipelines.remote_poll_secs.max(1)),
                timeout: Duration::from_secs(pipelines.remote_timeout_secs),
            },
            tools: settings.tools.clone(),
            default_region: settings.cloud.default_region.clone(),
            cluster_name: settings.cloud.cluster_name.clone(),
            clone_timeout: Duration::from_secs(pipelines.clone_timeout_secs),
            notification_webhook: settings.notification_webhook.clone(),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP API server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}
