//! Application deployment controller
//!
//! Drives an [`Application`] through
//! `pending -> cloning -> building -> pushing -> deploying -> running`.
//! Registry images start at `deploying`; virtual-machine targets skip
//! `pushing` because the host builds or pulls the image itself.

use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use tracing::{error, info, warn};

use crate::cloud::CloudApi;
use crate::deploy::cluster::ClusterControl;
use crate::deploy::container::{local_tag, registry_reference, ContainerToolchain};
use crate::deploy::fsm::AppEvent;
use crate::deploy::locks::{RecordGuard, RecordLocks};
use crate::deploy::manifest::{self, GENERATED_MANIFEST};
use crate::deploy::remote::RemoteExecutor;
use crate::deploy::script::{DeployScript, HostBuild, ImageStep, SecretParameter};
use crate::deploy::source::{detect_runtime, redact, Checkout, SourceFetcher};
use crate::deploy::ticker::{build_message, clone_message, Ticker, BUILD_TICK, CLONE_TICK};
use crate::deploy::validation::validate_application;
use crate::deploy::workspace::WorkspaceExecutor;
use crate::errors::PilotError;
use crate::filesys::dir::Dir;
use crate::models::application::{
    AppSource, AppStatus, Application, ApplicationAck, CreateApplication, RepositorySource,
    RuntimeKind, Target,
};
use crate::models::credentials::AwsCredentials;
use crate::services::credentials::CredentialStore;
use crate::services::notify::{Notification, NotificationLevel, NotificationSink};
use crate::services::quota::{QuotaGate, QuotaRequest};
use crate::services::records::RecordStore;
use crate::workers::dispatcher::{Dispatcher, TaskKind};

/// Everything the pipeline drives
#[derive(Clone)]
pub struct ApplicationDeps {
    pub store: Arc<dyn RecordStore<Application>>,
    pub credentials: Arc<dyn CredentialStore>,
    pub cloud: Arc<dyn CloudApi>,
    pub fetcher: Arc<SourceFetcher>,
    pub toolchain: Arc<ContainerToolchain>,
    pub cluster: Arc<ClusterControl>,
    pub remote: Arc<RemoteExecutor>,
    pub executor: Arc<WorkspaceExecutor>,
    pub notifier: Arc<dyn NotificationSink>,
    pub quota: Arc<dyn QuotaGate>,
    pub dispatcher: Dispatcher,
    pub locks: RecordLocks,
}

#[derive(Clone)]
pub struct ApplicationController {
    deps: ApplicationDeps,
}

/// Image produced by the source stages
enum BuiltImage {
    /// Pullable reference, local to the cluster registry or public
    Reference(String),

    /// To be built on the target host
    HostBuild(HostBuild),
}

impl ApplicationController {
    pub fn new(deps: ApplicationDeps) -> Self {
        Self { deps }
    }

    /// Accept an application and start its pipeline
    pub async fn create(&self, request: CreateApplication) -> Result<ApplicationAck, PilotError> {
        validate_application(&request)?;
        self.deps
            .quota
            .check(&request.owner_id, QuotaRequest::Application)
            .await?;
        let creds = self
            .deps
            .credentials
            .aws_credentials(&request.owner_id, &request.credential_id)
            .await?;

        let mut application = Application::new(request);
        application.push_log("Deployment initiated");
        let application = self.deps.store.insert(application).await?;
        let guard = self.deps.locks.acquire(&application.id)?;
        info!(application_id = %application.id, name = %application.name, "Application accepted");

        self.start_pipeline(&application.id, creds, guard);
        Ok(ApplicationAck::from(&application))
    }

    /// Run the whole pipeline again. The log restarts with a single line.
    pub async fn redeploy(&self, id: &str) -> Result<ApplicationAck, PilotError> {
        let application = self.deps.store.get(id).await?;
        application.status.on(&AppEvent::Redeploy)?;
        let creds = self
            .deps
            .credentials
            .aws_credentials(&application.owner_id, &application.credential_id)
            .await?;
        let guard = self.deps.locks.acquire(id)?;

        let updated = self
            .deps
            .store
            .modify(
                id,
                Box::new(|app: &mut Application| {
                    app.status = app.status.on(&AppEvent::Redeploy)?;
                    app.logs.clear();
                    app.push_log("Redeployment initiated");
                    app.error_message = None;
                    Ok(())
                }),
            )
            .await?;
        info!(application_id = %id, "Redeployment accepted");

        self.start_pipeline(id, creds, guard);
        Ok(ApplicationAck::from(&updated))
    }

    /// Cancel an in-flight pipeline. The record fails immediately; the
    /// pipeline stops at its next stage boundary.
    pub async fn cancel(&self, id: &str) -> Result<Application, PilotError> {
        let updated = self
            .deps
            .store
            .modify(
                id,
                Box::new(|app: &mut Application| {
                    app.status = app.status.on(&AppEvent::Cancel)?;
                    app.push_log("Deployment cancelled by user");
                    app.error_message = Some("Cancelled by user".to_string());
                    Ok(())
                }),
            )
            .await?;
        self.deps.locks.cancel(id);
        info!(application_id = %id, "Deployment cancelled");

        let scratch = Dir::new(self.deps.fetcher.scratch_path(id));
        if let Err(e) = scratch.delete().await {
            warn!(application_id = %id, "Failed to remove scratch directory: {}", e);
        }
        Ok(updated)
    }

    /// Scale a managed-cluster service down to zero
    pub async fn stop(&self, id: &str) -> Result<Application, PilotError> {
        self.scale(id, AppEvent::Stop, 0).await
    }

    /// Scale a stopped managed-cluster service back to one task
    pub async fn start(&self, id: &str) -> Result<Application, PilotError> {
        self.scale(id, AppEvent::Start, 1).await
    }

    async fn scale(&self, id: &str, event: AppEvent, desired: u32) -> Result<Application, PilotError> {
        let application = self.deps.store.get(id).await?;
        application.status.on(&event)?;
        let (cluster, service) = match &application.target {
            Target::ManagedCluster {
                cluster_name: Some(cluster),
                service_name: Some(service),
                ..
            } => (cluster.clone(), service.clone()),
            Target::ManagedCluster { .. } => {
                return Err(PilotError::Configuration(
                    "application has no cluster service yet".to_string(),
                ))
            }
            Target::VirtualMachine { .. } => {
                return Err(PilotError::Validation(
                    "stop and start are only supported on the managed cluster".to_string(),
                ))
            }
        };
        let creds = self
            .deps
            .credentials
            .aws_credentials(&application.owner_id, &application.credential_id)
            .await?;
        let _guard = self.deps.locks.acquire(id)?;

        let note = match self
            .deps
            .cluster
            .scale(&creds, &cluster, &service, desired)
            .await
        {
            Ok(()) => format!("Service {} scaled to {}", service, desired),
            // Only the task definition is registered on this path
            Err(PilotError::NotFound(_)) => {
                warn!(application_id = %id, service = %service, "Service not found; status only");
                format!("Service {} is not provisioned; status updated only", service)
            }
            Err(e) => return Err(e),
        };

        let stopping = event == AppEvent::Stop;
        self.deps
            .store
            .modify(
                id,
                Box::new(move |app: &mut Application| {
                    app.status = app.status.on(&event)?;
                    app.push_log(note);
                    app.push_log(if stopping {
                        "Application stopped"
                    } else {
                        "Application started"
                    });
                    Ok(())
                }),
            )
            .await
    }

    /// Remove the record. Cloud resources are not reclaimed.
    pub async fn delete(&self, id: &str) -> Result<Application, PilotError> {
        if self.deps.locks.is_active(id) {
            return Err(PilotError::Conflict(format!(
                "application {} has a pipeline in progress; cancel it first",
                id
            )));
        }
        let removed = self.deps.store.remove(id).await?;
        info!(application_id = %id, "Application record deleted");
        Ok(removed)
    }

    /// Move pipelines that a previous process left mid-stage to `error`.
    /// Returns how many records were touched.
    pub async fn recover_interrupted(&self) -> Result<usize, PilotError> {
        let mut recovered = 0;
        for application in self.deps.store.list(None).await? {
            if !application.status.is_in_progress() || self.deps.locks.is_active(&application.id) {
                continue;
            }
            let result = self
                .deps
                .store
                .modify(
                    &application.id,
                    Box::new(|app: &mut Application| {
                        let reason = "interrupted by orchestrator restart".to_string();
                        app.status = app.status.on(&AppEvent::Crash(reason.clone()))?;
                        app.push_log(format!("Error: {}", reason));
                        app.error_message = Some(reason);
                        Ok(())
                    }),
                )
                .await;
            match result {
                Ok(_) => recovered += 1,
                Err(e) => warn!(application_id = %application.id, "Failed to recover record: {}", e),
            }
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: &str) -> Result<Application, PilotError> {
        self.deps.store.get(id).await
    }

    pub async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Application>, PilotError> {
        self.deps.store.list(owner_id).await
    }

    fn start_pipeline(&self, id: &str, creds: AwsCredentials, guard: RecordGuard) {
        let this = self.clone();
        let record_id = id.to_string();
        let store = self.deps.store.clone();
        let abort_id = id.to_string();

        self.deps.dispatcher.spawn(
            TaskKind::Pipeline,
            id,
            async move { this.run_pipeline(record_id, creds, guard).await },
            move |reason: String| async move {
                let result = store
                    .modify(
                        &abort_id,
                        Box::new(move |app: &mut Application| {
                            app.status = app.status.on(&AppEvent::Crash(reason.clone()))?;
                            app.push_log(format!("Pipeline crashed: {}", reason));
                            app.error_message = Some(reason);
                            Ok(())
                        }),
                    )
                    .await;
                if let Err(e) = result {
                    error!(application_id = %abort_id, "Failed to record crashed pipeline: {}", e);
                }
            },
        );
    }

    async fn run_pipeline(
        &self,
        id: String,
        creds: AwsCredentials,
        guard: RecordGuard,
    ) -> Result<(), PilotError> {
        match self.drive(&id, &creds, &guard).await {
            Ok(()) => Ok(()),
            Err(_) if guard.is_cancelled() => {
                info!(application_id = %id, "Pipeline stopped after cancellation");
                Ok(())
            }
            Err(e) => {
                self.record_failure(&id, &e).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        id: &str,
        creds: &AwsCredentials,
        guard: &RecordGuard,
    ) -> Result<(), PilotError> {
        let application = self.deps.store.get(id).await?;
        let token = match &application.source {
            AppSource::Repository(_) => {
                self.deps
                    .credentials
                    .source_token(&application.owner_id)
                    .await?
            }
            AppSource::Image(_) => None,
        };

        let image = match &application.source {
            AppSource::Image(image) => BuiltImage::Reference(image.reference()),
            AppSource::Repository(repo) => {
                let checkout = self.clone_stage(id, guard, repo, token.as_ref()).await?;
                let repo = self.detect_stage(id, repo, &checkout).await?;

                let result = self
                    .build_stage(id, guard, &application, &repo, token.as_ref(), &checkout, creds)
                    .await;
                checkout.cleanup().await;
                result?
            }
        };

        self.advance(id, guard, AppEvent::StartDeploy, "Deploying application".to_string())
            .await?;
        match &application.target {
            Target::ManagedCluster { .. } => {
                let BuiltImage::Reference(image) = image else {
                    return Err(PilotError::Internal(
                        "cluster deploy requires an image reference".to_string(),
                    ));
                };
                self.deploy_to_cluster(id, guard, &application, &image, creds)
                    .await
            }
            Target::VirtualMachine { instance_id, .. } => {
                let step = match image {
                    BuiltImage::Reference(image) => ImageStep::Pull(image),
                    BuiltImage::HostBuild(build) => ImageStep::Build(build),
                };
                self.deploy_to_vm(id, guard, &application, instance_id, step, token.as_ref(), creds)
                    .await
            }
        }
    }

    async fn clone_stage(
        &self,
        id: &str,
        guard: &RecordGuard,
        repo: &RepositorySource,
        token: Option<&SecretString>,
    ) -> Result<Checkout, PilotError> {
        self.advance(
            id,
            guard,
            AppEvent::StartClone,
            format!("Cloning {} (branch {})", redact(&repo.url, token), repo.branch),
        )
        .await?;

        let _ticker = Ticker::start(
            self.deps.store.clone(),
            id.to_string(),
            AppStatus::Cloning,
            CLONE_TICK,
            clone_message,
        );
        let checkout = self.deps.fetcher.fetch(repo, token, id).await?;
        self.note(id, "Repository cloned").await;
        Ok(checkout)
    }

    async fn detect_stage(
        &self,
        id: &str,
        repo: &RepositorySource,
        checkout: &Checkout,
    ) -> Result<RepositorySource, PilotError> {
        let mut repo = repo.clone();
        if repo.runtime != RuntimeKind::Auto {
            return Ok(repo);
        }

        let detected = detect_runtime(checkout.path()).await;
        repo.detected_runtime = Some(detected);
        self.deps
            .store
            .modify(
                id,
                Box::new(move |app: &mut Application| {
                    if let AppSource::Repository(source) = &mut app.source {
                        source.detected_runtime = Some(detected);
                    }
                    app.push_log(format!("Detected runtime: {}", detected));
                    Ok(())
                }),
            )
            .await?;
        Ok(repo)
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_stage(
        &self,
        id: &str,
        guard: &RecordGuard,
        application: &Application,
        repo: &RepositorySource,
        token: Option<&SecretString>,
        checkout: &Checkout,
        creds: &AwsCredentials,
    ) -> Result<BuiltImage, PilotError> {
        self.advance(id, guard, AppEvent::StartBuild, "Preparing build".to_string())
            .await?;

        let generated = if checkout.has_dockerfile() {
            self.note(id, "Using the repository's Dockerfile").await;
            None
        } else {
            let contents = manifest::generate(repo, application.runtime.port);
            self.note(
                id,
                format!("Generated build manifest for {}", repo.effective_runtime()),
            )
            .await;
            Some(contents)
        };
        let tag = local_tag(&application.slug(), &Utc::now().format("%Y%m%d%H%M%S").to_string());

        if application.target.is_virtual_machine() {
            self.note(id, "Image will be built on the target host").await;
            return Ok(BuiltImage::HostBuild(HostBuild {
                clone_url: repo.url.clone(),
                branch: repo.branch.clone(),
                token_parameter: token.map(|_| SecretParameter {
                    name: source_token_parameter(id),
                    region: creds.region.clone(),
                }),
                manifest: generated,
                tag,
            }));
        }

        let manifest_path = match generated {
            Some(contents) => {
                let path = checkout.path().join(GENERATED_MANIFEST);
                tokio::fs::write(&path, contents).await?;
                path
            }
            None => checkout.path().join("Dockerfile"),
        };
        {
            let _ticker = Ticker::start(
                self.deps.store.clone(),
                id.to_string(),
                AppStatus::Building,
                BUILD_TICK,
                build_message,
            );
            self.deps
                .toolchain
                .build(checkout.path(), &manifest_path, &tag)
                .await?;
        }
        self.note(id, format!("Built image {}", tag)).await;

        self.advance(id, guard, AppEvent::StartPush, "Pushing image to registry".to_string())
            .await?;
        let repository = self
            .deps
            .cloud
            .ensure_repository(creds, &application.slug())
            .await?;
        let auth = self.deps.cloud.registry_auth(creds).await?;
        self.deps.toolchain.login(&auth).await?;

        let remote_tag = tag.rsplit(':').next().unwrap_or("latest");
        let remote = registry_reference(&repository, remote_tag);
        self.deps.toolchain.tag(&tag, &remote).await?;
        self.deps.toolchain.push(&remote).await?;
        self.note(id, format!("Pushed {}", remote)).await;
        Ok(BuiltImage::Reference(remote))
    }

    async fn deploy_to_cluster(
        &self,
        id: &str,
        guard: &RecordGuard,
        application: &Application,
        image: &str,
        creds: &AwsCredentials,
    ) -> Result<(), PilotError> {
        let deployment = self.deps.cluster.deploy(application, image, creds).await?;
        self.note(
            id,
            format!("Registered task definition {}", deployment.task_definition_arn),
        )
        .await;
        self.checkpoint(guard)?;

        let updated = self
            .deps
            .store
            .modify(
                id,
                Box::new(move |app: &mut Application| {
                    app.status = app.status.on(&AppEvent::Deployed)?;
                    app.target = Target::ManagedCluster {
                        cluster_name: Some(deployment.cluster_name),
                        task_definition: Some(deployment.task_definition_arn),
                        service_name: Some(deployment.service_name),
                    };
                    app.push_log(format!("Application running at {}", deployment.url));
                    app.url = Some(deployment.url);
                    app.last_deployed_at = Some(Utc::now());
                    app.error_message = None;
                    Ok(())
                }),
            )
            .await?;
        self.finished(&updated).await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy_to_vm(
        &self,
        id: &str,
        guard: &RecordGuard,
        application: &Application,
        instance_id: &str,
        image: ImageStep,
        token: Option<&SecretString>,
        creds: &AwsCredentials,
    ) -> Result<(), PilotError> {
        let port = application.runtime.port;
        let instance = self
            .deps
            .cloud
            .describe_instance(creds, instance_id)
            .await?
            .filter(|i| !i.is_terminated())
            .ok_or_else(|| {
                PilotError::UnreachableTarget(format!("instance {} does not exist", instance_id))
            })?;

        match instance.security_group_ids.first() {
            Some(group) => {
                let outcome = self
                    .deps
                    .executor
                    .apply_idempotent_rule(group, port, creds)
                    .await;
                let line = match (outcome.success, outcome.already_exists) {
                    (true, true) => format!("Port {} already open on {}", port, group),
                    (true, false) => format!("Opened port {} on {}", port, group),
                    (false, _) => {
                        warn!(application_id = %id, "Could not open port {}", port);
                        format!(
                            "Warning: could not open port {}: {}",
                            port,
                            outcome.error.unwrap_or_default()
                        )
                    }
                };
                self.note(id, line).await;
            }
            None => {
                self.note(
                    id,
                    format!("Warning: instance has no security group; port {} not opened", port),
                )
                .await;
            }
        }

        self.deps.remote.ensure_online(creds, instance_id).await?;
        self.note(id, "Instance is online; running deployment script").await;
        self.checkpoint(guard)?;

        let token_parameter = match (&image, token) {
            (ImageStep::Build(HostBuild {
                token_parameter: Some(parameter),
                ..
            }), Some(token)) => {
                self.deps
                    .cloud
                    .put_secure_parameter(creds, &parameter.name, token)
                    .await?;
                Some(parameter.name.clone())
            }
            _ => None,
        };

        let script = DeployScript::new(application.slug(), image, port)
            .env(application.runtime.env.clone());
        let comment = format!("stackpilot deploy {}", application.slug());
        let result = self
            .deps
            .remote
            .run(creds, instance_id, &script.render(), &comment)
            .await
            .map_err(|e| e.map_message(|m| redact(m, token)));

        if let Some(name) = token_parameter {
            if let Err(e) = self.deps.cloud.delete_parameter(creds, &name).await {
                warn!(application_id = %id, parameter = %name, "Failed to delete token parameter: {}", e);
            }
        }
        result?;
        self.checkpoint(guard)?;

        let host = instance
            .public_ip
            .clone()
            .or_else(|| instance.private_ip.clone())
            .unwrap_or_else(|| instance_id.to_string());
        let url = format!("http://{}:{}", host, port);
        let updated = self
            .deps
            .store
            .modify(
                id,
                Box::new(move |app: &mut Application| {
                    app.status = app.status.on(&AppEvent::Deployed)?;
                    if let Target::VirtualMachine {
                        public_ip,
                        private_ip,
                        ..
                    } = &mut app.target
                    {
                        *public_ip = instance.public_ip;
                        *private_ip = instance.private_ip;
                    }
                    app.push_log(format!("Application running at {}", url));
                    app.url = Some(url);
                    app.last_deployed_at = Some(Utc::now());
                    app.error_message = None;
                    Ok(())
                }),
            )
            .await?;
        self.finished(&updated).await;
        Ok(())
    }

    /// Persist the next stage; no stage starts after a cancellation
    async fn advance(
        &self,
        id: &str,
        guard: &RecordGuard,
        event: AppEvent,
        message: String,
    ) -> Result<Application, PilotError> {
        self.checkpoint(guard)?;
        let updated = self
            .deps
            .store
            .modify(
                id,
                Box::new(move |app: &mut Application| {
                    app.status = app.status.on(&event)?;
                    app.push_log(message);
                    Ok(())
                }),
            )
            .await?;
        info!(application_id = %id, stage = %updated.status, "Pipeline stage");
        Ok(updated)
    }

    fn checkpoint(&self, guard: &RecordGuard) -> Result<(), PilotError> {
        if guard.is_cancelled() {
            return Err(PilotError::InvalidTransition(format!(
                "application {} was cancelled",
                guard.id()
            )));
        }
        Ok(())
    }

    /// Append a progress line while the pipeline is still active
    async fn note(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        let result = self
            .deps
            .store
            .modify(
                id,
                Box::new(move |app: &mut Application| {
                    if !app.status.is_in_progress() {
                        return Err(PilotError::InvalidTransition(format!(
                            "pipeline is no longer active ({})",
                            app.status
                        )));
                    }
                    app.push_log(message);
                    Ok(())
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(application_id = %id, "Failed to append log line: {}", e);
        }
    }

    async fn record_failure(&self, id: &str, err: &PilotError) {
        let message = err.to_string();
        warn!(application_id = %id, "Pipeline failed: {}", message);
        let result = self
            .deps
            .store
            .modify(
                id,
                Box::new({
                    let message = message.clone();
                    move |app: &mut Application| {
                        app.status = app.status.on(&AppEvent::Fail(message.clone()))?;
                        app.push_log(format!("Deployment failed: {}", message));
                        app.error_message = Some(message);
                        Ok(())
                    }
                }),
            )
            .await;

        match result {
            Ok(updated) => {
                self.deps
                    .notifier
                    .notify(Notification::new(
                        &updated.owner_id,
                        &updated.id,
                        NotificationLevel::Error,
                        "Deployment failed",
                        format!("{} failed: {}", updated.name, message),
                    ))
                    .await;
            }
            Err(e) => {
                error!(application_id = %id, "Failed to record pipeline failure: {}", e);
            }
        }
    }

    async fn finished(&self, application: &Application) {
        info!(application_id = %application.id, url = ?application.url, "Application running");
        self.deps
            .notifier
            .notify(Notification::new(
                &application.owner_id,
                &application.id,
                NotificationLevel::Success,
                "Application deployed",
                format!(
                    "{} is running at {}",
                    application.name,
                    application.url.as_deref().unwrap_or("-")
                ),
            ))
            .await;
    }
}

/// Parameter holding a repository token while a host build clones
fn source_token_parameter(application_id: &str) -> String {
    format!("/stackpilot/{}/source-token", application_id)
}
