//! Application state management

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::cloud::aws_cli::AwsCli;
use crate::cloud::CloudApi;
use crate::deploy::application::{ApplicationController, ApplicationDeps};
use crate::deploy::arena::WorkspaceArena;
use crate::deploy::cluster::ClusterControl;
use crate::deploy::container::ContainerToolchain;
use crate::deploy::drift::DriftReconciler;
use crate::deploy::infra::{InfraController, InfraDeps};
use crate::deploy::locks::RecordLocks;
use crate::deploy::remote::RemoteExecutor;
use crate::deploy::source::SourceFetcher;
use crate::deploy::workspace::WorkspaceExecutor;
use crate::errors::PilotError;
use crate::process::{CommandRunner, TokioCommandRunner};
use crate::services::credentials::{CredentialStore, LocalCredentialStore};
use crate::services::notify::{LogSink, NotificationSink, WebhookSink};
use crate::services::quota::{AllowAll, QuotaGate};
use crate::services::records::LocalStore;
use crate::workers::dispatcher::{Dispatcher, TaskOutcome};

/// Main application state
pub struct AppState {
    pub infra: InfraController,
    pub applications: ApplicationController,
    pub dispatcher: Dispatcher,
}

impl AppState {
    /// Wire every component on top of the local storage layout
    pub async fn init(
        options: &AppOptions,
    ) -> Result<(Self, mpsc::Receiver<TaskOutcome>), PilotError> {
        info!("Initializing application state...");

        let layout = &options.layout;
        layout.setup().await?;

        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
        let cloud: Arc<dyn CloudApi> = Arc::new(AwsCli::new(runner.clone(), &options.tools.aws));

        let arena = Arc::new(WorkspaceArena::new(layout.workspaces_dir()));
        let on_disk = arena.scan().await?;
        if !on_disk.is_empty() {
            info!("{} workspaces found on disk", on_disk.len());
        }
        let executor = Arc::new(WorkspaceExecutor::new(
            runner.clone(),
            arena,
            options.executor.clone(),
        ));

        let credentials: Arc<dyn CredentialStore> = Arc::new(
            LocalCredentialStore::load(&layout.credentials_file(), &options.default_region).await?,
        );
        let notifier: Arc<dyn NotificationSink> = match &options.notification_webhook {
            Some(url) => Arc::new(WebhookSink::new(url)?),
            None => Arc::new(LogSink),
        };
        let quota: Arc<dyn QuotaGate> = Arc::new(AllowAll);

        let (dispatcher, outcomes) = Dispatcher::new(&options.dispatcher);
        let locks = RecordLocks::new();

        // Scratch checkouts never outlive a process
        let scratch = layout.scratch_dir();
        if let Err(e) = scratch.delete().await {
            warn!("Failed to clear scratch directory: {}", e);
        }
        scratch.create().await?;

        let infra = InfraController::new(InfraDeps {
            store: Arc::new(LocalStore::open(layout.deployments_dir()).await?),
            credentials: credentials.clone(),
            executor: executor.clone(),
            drift: Arc::new(DriftReconciler::new(cloud.clone())),
            notifier: notifier.clone(),
            quota: quota.clone(),
            dispatcher: dispatcher.clone(),
            locks: locks.clone(),
        });

        let applications = ApplicationController::new(ApplicationDeps {
            store: Arc::new(LocalStore::open(layout.applications_dir()).await?),
            credentials,
            cloud: cloud.clone(),
            fetcher: Arc::new(
                SourceFetcher::new(runner.clone(), &options.tools.git, scratch)
                    .with_clone_timeout(options.clone_timeout),
            ),
            toolchain: Arc::new(ContainerToolchain::new(runner, &options.tools.docker)),
            cluster: Arc::new(ClusterControl::new(cloud.clone(), &options.cluster_name)),
            remote: Arc::new(RemoteExecutor::new(cloud, options.remote.clone())),
            executor,
            notifier,
            quota,
            dispatcher: dispatcher.clone(),
            locks,
        });

        let state = Self {
            infra,
            applications,
            dispatcher,
        };
        Ok((state, outcomes))
    }

    /// Wait for in-flight background tasks
    pub async fn shutdown(&self) {
        let in_flight = self.dispatcher.in_flight();
        if in_flight > 0 {
            info!("Waiting for {} background tasks...", in_flight);
        }
        self.dispatcher.drain().await;
    }
}
