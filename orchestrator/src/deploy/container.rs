//! Container toolchain adapter

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::cloud::RegistryAuth;
use crate::errors::PilotError;
use crate::process::{CommandRunner, CommandSpec};

/// Builds, tags and pushes images through the local container daemon
pub struct ContainerToolchain {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    build_timeout: Duration,
    transfer_timeout: Duration,
}

impl ContainerToolchain {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            build_timeout: Duration::from_secs(1800),
            transfer_timeout: Duration::from_secs(900),
        }
    }

    pub fn with_timeouts(mut self, build: Duration, transfer: Duration) -> Self {
        self.build_timeout = build;
        self.transfer_timeout = transfer;
        self
    }

    /// Build `context` into a locally tagged image
    pub async fn build(
        &self,
        context: &Path,
        manifest: &Path,
        tag: &str,
    ) -> Result<String, PilotError> {
        info!("Building image {}", tag);
        let manifest = manifest.to_string_lossy().into_owned();
        let spec = CommandSpec::new(&self.binary)
            .args(["build", "-t", tag, "-f", manifest.as_str(), "."])
            .current_dir(context)
            .timeout(self.build_timeout);
        self.run(spec).await
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<(), PilotError> {
        debug!("Tagging {} as {}", source, target);
        let spec = CommandSpec::new(&self.binary).args(["tag", source, target]);
        self.run(spec).await.map(|_| ())
    }

    pub async fn push(&self, image: &str) -> Result<String, PilotError> {
        info!("Pushing image {}", image);
        let spec = CommandSpec::new(&self.binary)
            .args(["push", image])
            .timeout(self.transfer_timeout);
        self.run(spec).await
    }

    /// Log the daemon in to a registry; the password goes over stdin
    pub async fn login(&self, auth: &RegistryAuth) -> Result<(), PilotError> {
        debug!("Logging in to registry {}", auth.endpoint);
        let spec = CommandSpec::new(&self.binary)
            .args([
                "login",
                "--username",
                auth.username.as_str(),
                "--password-stdin",
                auth.endpoint.as_str(),
            ])
            .stdin(auth.password.expose_secret().as_bytes().to_vec())
            .timeout(Duration::from_secs(60));
        self.run(spec).await.map(|_| ())
    }

    async fn run(&self, spec: CommandSpec) -> Result<String, PilotError> {
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(output.combined())
        } else {
            Err(PilotError::ToolExecution(format!(
                "{} failed: {}",
                spec.display(),
                output.combined()
            )))
        }
    }
}

/// Registry-qualified image reference for a repository URI
pub fn registry_reference(repository_uri: &str, tag: &str) -> String {
    format!("{}:{}", repository_uri, tag)
}

/// Local image tag for an application build
pub fn local_tag(slug: &str, build_id: &str) -> String {
    let short: String = build_id.chars().filter(|c| *c != '-').take(12).collect();
    format!("stackpilot/{}:{}", slug, short)
}
