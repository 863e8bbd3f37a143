//! Hand-written fakes and a harness wiring both controllers to them

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Notify;

use stackpilot::cloud::{
    CloudApi, CommandInvocation, CommandState, InstanceDescription, RegistryAuth, ResourceProbe,
    TaskDefinitionSpec,
};
use stackpilot::deploy::application::{ApplicationController, ApplicationDeps};
use stackpilot::deploy::arena::WorkspaceArena;
use stackpilot::deploy::cluster::ClusterControl;
use stackpilot::deploy::container::ContainerToolchain;
use stackpilot::deploy::drift::DriftReconciler;
use stackpilot::deploy::infra::{InfraController, InfraDeps};
use stackpilot::deploy::locks::RecordLocks;
use stackpilot::deploy::remote::{RemoteExecutor, RemoteOptions};
use stackpilot::deploy::source::SourceFetcher;
use stackpilot::deploy::workspace::{ExecutorOptions, WorkspaceExecutor};
use stackpilot::errors::PilotError;
use stackpilot::filesys::dir::Dir;
use stackpilot::models::application::Application;
use stackpilot::models::credentials::AwsCredentials;
use stackpilot::models::deployment::Deployment;
use stackpilot::process::{CommandRunner, CommandSpec, ProcessOutput};
use stackpilot::services::credentials::LocalCredentialStore;
use stackpilot::services::notify::{Notification, NotificationSink};
use stackpilot::services::quota::AllowAll;
use stackpilot::services::records::{LocalStore, RecordStore};
use stackpilot::workers::dispatcher::{self, Dispatcher, TaskOutcome};

pub const OWNER: &str = "owner-1";
pub const CREDENTIAL: &str = "cred-1";
pub const REGISTRY: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

pub fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(stderr: &str) -> ProcessOutput {
    ProcessOutput {
        exit_code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Records every command; answers from scripted rules matched on the
/// command line, succeeding with empty output otherwise
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    /// Pattern, output, and whether the rule is used up by its first match
    rules: Mutex<Vec<(String, ProcessOutput, bool)>>,
    clone_files: Mutex<Vec<(String, String)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// First matching rule wins
    pub fn respond(&self, pattern: &str, output: ProcessOutput) {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), output, false));
    }

    /// Like `respond`, for the next matching command only
    pub fn respond_once(&self, pattern: &str, output: ProcessOutput) {
        self.rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), output, true));
    }

    /// Files a fake clone leaves in the checkout
    pub fn clone_with(&self, name: &str, contents: &str) {
        self.clone_files
            .lock()
            .unwrap()
            .push((name.to_string(), contents.to_string()));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, PilotError> {
        self.calls.lock().unwrap().push(spec.clone());
        let line = spec.display();

        if spec.args.first().map(String::as_str) == Some("clone") {
            if let Some(target) = spec.args.last() {
                let target = PathBuf::from(target);
                std::fs::create_dir_all(&target)?;
                for (name, contents) in self.clone_files.lock().unwrap().iter() {
                    std::fs::write(target.join(name), contents)?;
                }
            }
        }

        let mut rules = self.rules.lock().unwrap();
        let Some(index) = rules
            .iter()
            .position(|(pattern, _, _)| line.contains(pattern.as_str()))
        else {
            return Ok(ok(""));
        };
        let output = rules[index].1.clone();
        if rules[index].2 {
            rules.remove(index);
        }
        Ok(output)
    }
}

/// In-memory provider
pub struct FakeCloud {
    calls: Mutex<Vec<String>>,
    pub instance: Mutex<Option<InstanceDescription>>,
    pub users: Mutex<HashMap<String, bool>>,
    pub agent_status: Mutex<Option<String>>,
    pub command_state: Mutex<CommandState>,
    pub service_exists: Mutex<bool>,
    pub registered: Mutex<Vec<TaskDefinitionSpec>>,
    pub sent_scripts: Mutex<Vec<Vec<String>>>,
    /// Parameters currently stored, by name
    pub parameters: Mutex<HashMap<String, String>>,
    /// Every value ever written to a parameter
    pub stored_values: Mutex<Vec<String>>,
    pub command_stderr: Mutex<String>,
    /// When set, `ensure_cluster` waits for a notification
    pub hold_cluster: Mutex<Option<Arc<Notify>>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            instance: Mutex::new(None),
            users: Mutex::new(HashMap::new()),
            agent_status: Mutex::new(Some("Online".to_string())),
            command_state: Mutex::new(CommandState::Success),
            service_exists: Mutex::new(true),
            registered: Mutex::new(Vec::new()),
            sent_scripts: Mutex::new(Vec::new()),
            parameters: Mutex::new(HashMap::new()),
            stored_values: Mutex::new(Vec::new()),
            command_stderr: Mutex::new(String::new()),
            hold_cluster: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn running_instance(instance_id: &str) -> InstanceDescription {
        InstanceDescription {
            instance_id: instance_id.to_string(),
            state: "running".to_string(),
            public_ip: Some("203.0.113.10".to_string()),
            private_ip: Some("10.0.0.5".to_string()),
            security_group_ids: vec!["sg-123".to_string()],
        }
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn describe_instance(
        &self,
        _creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, PilotError> {
        self.record(format!("describe_instance {}", instance_id));
        Ok(self.instance.lock().unwrap().clone())
    }

    async fn probe_bucket(
        &self,
        _creds: &AwsCredentials,
        bucket: &str,
    ) -> Result<ResourceProbe, PilotError> {
        self.record(format!("probe_bucket {}", bucket));
        Ok(ResourceProbe::present())
    }

    async fn probe_user(
        &self,
        _creds: &AwsCredentials,
        user_name: &str,
    ) -> Result<ResourceProbe, PilotError> {
        self.record(format!("probe_user {}", user_name));
        match self.users.lock().unwrap().get(user_name) {
            Some(true) => Ok(ResourceProbe::present()),
            Some(false) => Ok(ResourceProbe::absent(format!("user {} not found", user_name))),
            None => Err(PilotError::Network("provider unreachable".to_string())),
        }
    }

    async fn account_id(&self, _creds: &AwsCredentials) -> Result<String, PilotError> {
        self.record("account_id");
        Ok("123456789012".to_string())
    }

    async fn ensure_repository(
        &self,
        _creds: &AwsCredentials,
        name: &str,
    ) -> Result<String, PilotError> {
        self.record(format!("ensure_repository {}", name));
        Ok(format!("{}/{}", REGISTRY, name))
    }

    async fn registry_auth(&self, _creds: &AwsCredentials) -> Result<RegistryAuth, PilotError> {
        self.record("registry_auth");
        Ok(RegistryAuth {
            username: "AWS".to_string(),
            password: SecretString::from("registry-password".to_string()),
            endpoint: REGISTRY.to_string(),
        })
    }

    async fn ensure_cluster(&self, _creds: &AwsCredentials, name: &str) -> Result<(), PilotError> {
        self.record(format!("ensure_cluster {}", name));
        let hold = self.hold_cluster.lock().unwrap().clone();
        if let Some(notify) = hold {
            notify.notified().await;
        }
        Ok(())
    }

    async fn register_task_definition(
        &self,
        _creds: &AwsCredentials,
        spec: &TaskDefinitionSpec,
    ) -> Result<String, PilotError> {
        self.record(format!("register_task_definition {}", spec.family));
        self.registered.lock().unwrap().push(spec.clone());
        Ok(format!(
            "arn:aws:ecs:us-east-1:123456789012:task-definition/{}:1",
            spec.family
        ))
    }

    async fn scale_service(
        &self,
        _creds: &AwsCredentials,
        cluster: &str,
        service: &str,
        desired_count: u32,
    ) -> Result<(), PilotError> {
        self.record(format!("scale_service {} {} {}", cluster, service, desired_count));
        if *self.service_exists.lock().unwrap() {
            Ok(())
        } else {
            Err(PilotError::NotFound(format!("service {}", service)))
        }
    }

    async fn remote_agent_status(
        &self,
        _creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<Option<String>, PilotError> {
        self.record(format!("remote_agent_status {}", instance_id));
        Ok(self.agent_status.lock().unwrap().clone())
    }

    async fn send_command(
        &self,
        _creds: &AwsCredentials,
        instance_id: &str,
        commands: &[String],
        _comment: &str,
    ) -> Result<String, PilotError> {
        self.record(format!("send_command {}", instance_id));
        self.sent_scripts.lock().unwrap().push(commands.to_vec());
        Ok("cmd-1".to_string())
    }

    async fn command_invocation(
        &self,
        _creds: &AwsCredentials,
        command_id: &str,
        _instance_id: &str,
    ) -> Result<CommandInvocation, PilotError> {
        self.record(format!("command_invocation {}", command_id));
        let state = *self.command_state.lock().unwrap();
        Ok(CommandInvocation {
            state,
            stdout: "container started".to_string(),
            stderr: self.command_stderr.lock().unwrap().clone(),
        })
    }

    async fn put_secure_parameter(
        &self,
        _creds: &AwsCredentials,
        name: &str,
        value: &SecretString,
    ) -> Result<(), PilotError> {
        self.record(format!("put_parameter {}", name));
        let value = value.expose_secret().to_string();
        self.stored_values.lock().unwrap().push(value.clone());
        self.parameters.lock().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    async fn delete_parameter(&self, _creds: &AwsCredentials, name: &str) -> Result<(), PilotError> {
        self.record(format!("delete_parameter {}", name));
        self.parameters.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Collects notifications for assertions
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

/// Both controllers over fakes and a scratch directory
pub struct Harness {
    pub _tmp: tempfile::TempDir,
    pub runner: Arc<FakeRunner>,
    pub cloud: Arc<FakeCloud>,
    pub notifier: Arc<RecordingSink>,
    pub deployments: Arc<LocalStore<Deployment>>,
    pub applications: Arc<LocalStore<Application>>,
    pub arena: Arc<WorkspaceArena>,
    pub executor: Arc<WorkspaceExecutor>,
    pub dispatcher: Dispatcher,
    pub outcomes: tokio::sync::mpsc::Receiver<TaskOutcome>,
    pub infra: InfraController,
    pub apps: ApplicationController,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeRunner::new());
        let cloud = Arc::new(FakeCloud::new());
        let notifier = Arc::new(RecordingSink::default());

        let credentials = Arc::new(
            LocalCredentialStore::new()
                .with_credentials(
                    CREDENTIAL,
                    OWNER,
                    AwsCredentials::new("AKIATEST", "secret", "us-east-1"),
                )
                .with_source_token(OWNER, "ghp_token"),
        );

        let arena = Arc::new(WorkspaceArena::new(Dir::new(tmp.path().join("workspaces"))));
        let executor = Arc::new(WorkspaceExecutor::new(
            runner.clone(),
            arena.clone(),
            ExecutorOptions::default(),
        ));
        let (dispatcher, outcomes) = Dispatcher::new(&dispatcher::Options::default());
        let locks = RecordLocks::new();
        let deployments = Arc::new(LocalStore::in_memory());
        let applications = Arc::new(LocalStore::in_memory());

        let infra = InfraController::new(InfraDeps {
            store: deployments.clone(),
            credentials: credentials.clone(),
            executor: executor.clone(),
            drift: Arc::new(DriftReconciler::new(cloud.clone())),
            notifier: notifier.clone(),
            quota: Arc::new(AllowAll),
            dispatcher: dispatcher.clone(),
            locks: locks.clone(),
        });

        let apps = ApplicationController::new(ApplicationDeps {
            store: applications.clone(),
            credentials,
            cloud: cloud.clone(),
            fetcher: Arc::new(SourceFetcher::new(
                runner.clone(),
                "git",
                Dir::new(tmp.path().join("scratch")),
            )),
            toolchain: Arc::new(ContainerToolchain::new(runner.clone(), "docker")),
            cluster: Arc::new(ClusterControl::new(cloud.clone(), "stackpilot")),
            remote: Arc::new(RemoteExecutor::new(
                cloud.clone(),
                RemoteOptions {
                    poll_interval: Duration::from_millis(5),
                    timeout: Duration::from_secs(5),
                },
            )),
            executor: executor.clone(),
            notifier: notifier.clone(),
            quota: Arc::new(AllowAll),
            dispatcher: dispatcher.clone(),
            locks,
        });

        Self {
            _tmp: tmp,
            runner,
            cloud,
            notifier,
            deployments,
            applications,
            arena,
            executor,
            dispatcher,
            outcomes,
            infra,
            apps,
        }
    }

    /// Wait for every background task
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.dispatcher.drain())
            .await
            .expect("background tasks did not finish");
    }

    pub async fn deployment(&self, id: &str) -> Deployment {
        self.deployments.get(id).await.unwrap()
    }

    pub async fn application(&self, id: &str) -> Application {
        self.applications.get(id).await.unwrap()
    }
}
