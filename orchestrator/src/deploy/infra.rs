//! Infrastructure deployment controller
//!
//! Owns the lifecycle of [`Deployment`] records. Requests are validated and
//! persisted `pending`, then the workspace executor runs on the dispatcher.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::deploy::drift::DriftReconciler;
use crate::deploy::fsm::InfraEvent;
use crate::deploy::locks::{RecordGuard, RecordLocks};
use crate::deploy::validation::validate_deployment;
use crate::deploy::workspace::WorkspaceExecutor;
use crate::errors::PilotError;
use crate::models::credentials::AwsCredentials;
use crate::models::deployment::{
    CreateDeployment, DeletedBy, Deployment, DeploymentAck, DeploymentStatus, SyncSummary,
};
use crate::services::credentials::CredentialStore;
use crate::services::notify::{Notification, NotificationLevel, NotificationSink};
use crate::services::quota::{QuotaGate, QuotaRequest};
use crate::services::records::RecordStore;
use crate::workers::dispatcher::{Dispatcher, TaskKind};

/// Everything the controller drives
#[derive(Clone)]
pub struct InfraDeps {
    pub store: Arc<dyn RecordStore<Deployment>>,
    pub credentials: Arc<dyn CredentialStore>,
    pub executor: Arc<WorkspaceExecutor>,
    pub drift: Arc<DriftReconciler>,
    pub notifier: Arc<dyn NotificationSink>,
    pub quota: Arc<dyn QuotaGate>,
    pub dispatcher: Dispatcher,
    pub locks: RecordLocks,
}

#[derive(Clone)]
pub struct InfraController {
    deps: InfraDeps,
    sync_concurrency: usize,
}

impl InfraController {
    pub fn new(deps: InfraDeps) -> Self {
        Self {
            deps,
            sync_concurrency: 4,
        }
    }

    pub fn with_sync_concurrency(mut self, limit: usize) -> Self {
        self.sync_concurrency = limit.max(1);
        self
    }

    /// Accept a deployment and apply it in the background
    pub async fn create(&self, request: CreateDeployment) -> Result<DeploymentAck, PilotError> {
        validate_deployment(&request)?;
        self.deps
            .quota
            .check(&request.owner_id, QuotaRequest::Deployment)
            .await?;
        let creds = self
            .deps
            .credentials
            .aws_credentials(&request.owner_id, &request.credential_id)
            .await?;

        let deployment = self.deps.store.insert(Deployment::new(request)).await?;
        let guard = self.deps.locks.acquire(&deployment.id)?;
        info!(
            deployment_id = %deployment.id,
            kind = %deployment.resource_kind,
            "Deployment accepted"
        );

        let this = self.clone();
        let id = deployment.id.clone();
        self.deps.dispatcher.spawn(
            TaskKind::Apply,
            &deployment.id,
            async move { this.run_apply(id, creds, guard).await },
            self.abort_handler(deployment.id.clone()),
        );
        Ok(DeploymentAck::from(&deployment))
    }

    async fn run_apply(
        &self,
        id: String,
        creds: AwsCredentials,
        _guard: RecordGuard,
    ) -> Result<(), PilotError> {
        let deployment = self.deps.store.get(&id).await?;
        let run = self
            .deps
            .executor
            .apply(
                deployment.resource_kind,
                &deployment.resource_name,
                &deployment.config,
                &creds,
            )
            .await;

        let succeeded = run.success;
        let error_text = run.error.clone();
        let updated = self
            .deps
            .store
            .modify(
                &id,
                Box::new(move |d: &mut Deployment| {
                    let event = if run.success {
                        InfraEvent::ApplySucceeded
                    } else {
                        InfraEvent::ApplyFailed
                    };
                    d.status = d.status.on(&event)?;
                    d.workspace_id = run.workspace_id;
                    d.output = Some(run.output);
                    d.error_message = run.error;
                    Ok(())
                }),
            )
            .await?;

        if succeeded {
            info!(deployment_id = %id, "Deployment completed");
            self.notify(
                &updated,
                NotificationLevel::Success,
                "Deployment completed",
                format!("{} {} is ready", updated.resource_kind, updated.resource_name),
            )
            .await;
            Ok(())
        } else {
            let message = error_text.unwrap_or_else(|| "apply failed".to_string());
            warn!(deployment_id = %id, "Deployment failed");
            self.notify(
                &updated,
                NotificationLevel::Error,
                "Deployment failed",
                format!("{} {} could not be created", updated.resource_kind, updated.resource_name),
            )
            .await;
            Err(PilotError::ToolExecution(message))
        }
    }

    /// Destroy the deployment's resource. Only accepted from `completed`.
    pub async fn destroy(&self, id: &str) -> Result<DeploymentAck, PilotError> {
        let deployment = self.deps.store.get(id).await?;
        deployment.status.on(&InfraEvent::DestroyRequested)?;
        let workspace_id = deployment.workspace_id.clone().ok_or_else(|| {
            PilotError::Validation(format!(
                "deployment {} has no workspace; nothing to destroy",
                id
            ))
        })?;
        let creds = self
            .deps
            .credentials
            .aws_credentials(&deployment.owner_id, &deployment.credential_id)
            .await?;
        let guard = self.deps.locks.acquire(id)?;

        let updated = self
            .deps
            .store
            .modify(
                id,
                Box::new(|d: &mut Deployment| {
                    d.status = d.status.on(&InfraEvent::DestroyRequested)?;
                    d.error_message = None;
                    Ok(())
                }),
            )
            .await?;
        info!(deployment_id = %id, workspace_id = %workspace_id, "Destroy accepted");

        let this = self.clone();
        let record_id = id.to_string();
        self.deps.dispatcher.spawn(
            TaskKind::Destroy,
            id,
            async move { this.run_destroy(record_id, workspace_id, creds, guard).await },
            self.abort_handler(id.to_string()),
        );
        Ok(DeploymentAck::from(&updated))
    }

    async fn run_destroy(
        &self,
        id: String,
        workspace_id: String,
        creds: AwsCredentials,
        _guard: RecordGuard,
    ) -> Result<(), PilotError> {
        let run = self.deps.executor.destroy(&workspace_id, &creds).await;

        let succeeded = run.success;
        let error_text = run.error.clone();
        let updated = self
            .deps
            .store
            .modify(
                &id,
                Box::new(move |d: &mut Deployment| {
                    if run.success {
                        d.status = d.status.on(&InfraEvent::DestroySucceeded)?;
                        d.deleted_by = Some(DeletedBy::Ui);
                        d.deleted_at = Some(Utc::now());
                        d.error_message = None;
                    } else {
                        d.status = d.status.on(&InfraEvent::DestroyFailed)?;
                        d.error_message = run.error;
                    }
                    d.output = Some(run.output);
                    Ok(())
                }),
            )
            .await?;

        if succeeded {
            info!(deployment_id = %id, "Deployment destroyed");
            self.notify(
                &updated,
                NotificationLevel::Info,
                "Resource destroyed",
                format!("{} {} was destroyed", updated.resource_kind, updated.resource_name),
            )
            .await;
            Ok(())
        } else {
            warn!(deployment_id = %id, "Destroy failed");
            self.notify(
                &updated,
                NotificationLevel::Error,
                "Destroy failed",
                format!("{} {} could not be destroyed", updated.resource_kind, updated.resource_name),
            )
            .await;
            Err(PilotError::ToolExecution(
                error_text.unwrap_or_else(|| "destroy failed".to_string()),
            ))
        }
    }

    /// Remove the record. Resources that still exist are left in place and
    /// their workspace is abandoned with a warning.
    pub async fn delete_record(&self, id: &str) -> Result<Deployment, PilotError> {
        if self.deps.locks.is_active(id) {
            return Err(PilotError::Conflict(format!(
                "deployment {} has an operation in progress",
                id
            )));
        }
        let removed = self.deps.store.remove(id).await?;
        if let Some(workspace_id) = &removed.workspace_id {
            self.deps.executor.arena().abandon(workspace_id).await;
        }
        info!(deployment_id = %id, "Deployment record deleted");
        Ok(removed)
    }

    /// Fail operations that a previous process left running. Their
    /// workspaces stay on disk so a later destroy can still use them.
    pub async fn recover_interrupted(&self) -> Result<usize, PilotError> {
        let mut recovered = 0;
        for deployment in self.deps.store.list(None).await? {
            if !deployment.status.is_in_progress() || self.deps.locks.is_active(&deployment.id) {
                continue;
            }
            let result = self
                .deps
                .store
                .modify(
                    &deployment.id,
                    Box::new(|d: &mut Deployment| {
                        let event = match d.status {
                            DeploymentStatus::Destroying => InfraEvent::DestroyFailed,
                            _ => InfraEvent::ApplyFailed,
                        };
                        d.status = d.status.on(&event)?;
                        d.error_message = Some("interrupted by orchestrator restart".to_string());
                        Ok(())
                    }),
                )
                .await;
            match result {
                Ok(_) => recovered += 1,
                Err(e) => warn!(deployment_id = %deployment.id, "Failed to recover record: {}", e),
            }
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: &str) -> Result<Deployment, PilotError> {
        self.deps.store.get(id).await
    }

    pub async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Deployment>, PilotError> {
        self.deps.store.list(owner_id).await
    }

    /// Reconcile one deployment against the provider. Records that are not
    /// `completed` are returned unchanged.
    pub async fn sync_one(&self, id: &str) -> Result<Deployment, PilotError> {
        let deployment = self.deps.store.get(id).await?;
        self.sync_record(deployment).await.map(|(d, _)| d)
    }

    /// Reconcile every completed deployment, optionally for one owner
    pub async fn sync_all(&self, owner_id: Option<&str>) -> Result<SyncSummary, PilotError> {
        let candidates: Vec<Deployment> = self
            .deps
            .store
            .list(owner_id)
            .await?
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Completed)
            .collect();

        let results: Vec<Result<bool, PilotError>> = stream::iter(candidates)
            .map(|d| async move { self.sync_record(d).await.map(|(_, drifted)| drifted) })
            .buffer_unordered(self.sync_concurrency)
            .collect()
            .await;

        let mut summary = SyncSummary::default();
        for result in results {
            summary.checked += 1;
            match result {
                Ok(true) => summary.drifted += 1,
                Ok(false) => {}
                Err(_) => summary.errors += 1,
            }
        }
        info!(
            checked = summary.checked,
            drifted = summary.drifted,
            errors = summary.errors,
            "Drift sync finished"
        );
        Ok(summary)
    }

    /// Returns the (possibly updated) record and whether drift was found
    async fn sync_record(&self, deployment: Deployment) -> Result<(Deployment, bool), PilotError> {
        if deployment.status != DeploymentStatus::Completed {
            return Ok((deployment, false));
        }
        let creds = self
            .deps
            .credentials
            .aws_credentials(&deployment.owner_id, &deployment.credential_id)
            .await?;

        let probe = match self.deps.drift.reconcile(&deployment, &creds).await {
            Ok(probe) => probe,
            Err(e) => {
                warn!(deployment_id = %deployment.id, "Drift probe failed: {}", e);
                return Err(e);
            }
        };

        if probe.exists {
            debug!(deployment_id = %deployment.id, "Resource still exists");
            let updated = self
                .deps
                .store
                .modify(
                    &deployment.id,
                    Box::new(|d: &mut Deployment| {
                        d.last_synced_at = Some(Utc::now());
                        Ok(())
                    }),
                )
                .await?;
            return Ok((updated, false));
        }

        let detail = probe.detail;
        let result = self
            .deps
            .store
            .modify(
                &deployment.id,
                Box::new(move |d: &mut Deployment| {
                    d.status = d.status.on(&InfraEvent::DriftDetected)?;
                    let now = Utc::now();
                    d.deleted_by = Some(DeletedBy::CloudConsole);
                    d.deleted_at = Some(now);
                    d.last_synced_at = Some(now);
                    d.error_message = detail;
                    Ok(())
                }),
            )
            .await;

        match result {
            Ok(updated) => {
                info!(deployment_id = %updated.id, "Resource was deleted outside the platform");
                self.notify(
                    &updated,
                    NotificationLevel::Warning,
                    "Resource deleted externally",
                    format!(
                        "{} {} no longer exists in the cloud account",
                        updated.resource_kind, updated.resource_name
                    ),
                )
                .await;
                Ok((updated, true))
            }
            // A destroy started while the probe ran
            Err(PilotError::InvalidTransition(_)) => {
                Ok((self.deps.store.get(&deployment.id).await?, false))
            }
            Err(e) => Err(e),
        }
    }

    fn abort_handler(
        &self,
        id: String,
    ) -> impl FnOnce(String) -> futures::future::BoxFuture<'static, ()> + Send + 'static {
        let store = self.deps.store.clone();
        move |reason: String| {
            Box::pin(async move {
                let result = store
                    .modify(
                        &id,
                        Box::new(move |d: &mut Deployment| {
                            let event = match d.status {
                                DeploymentStatus::Destroying => InfraEvent::DestroyFailed,
                                _ => InfraEvent::ApplyFailed,
                            };
                            d.status = d.status.on(&event)?;
                            d.error_message = Some(format!("operation aborted: {}", reason));
                            Ok(())
                        }),
                    )
                    .await;
                if let Err(e) = result {
                    error!(deployment_id = %id, "Failed to record aborted operation: {}", e);
                }
            })
        }
    }

    async fn notify(
        &self,
        deployment: &Deployment,
        level: NotificationLevel,
        title: &str,
        message: String,
    ) {
        self.deps
            .notifier
            .notify(Notification::new(
                &deployment.owner_id,
                &deployment.id,
                level,
                title,
                message,
            ))
            .await;
    }
}
