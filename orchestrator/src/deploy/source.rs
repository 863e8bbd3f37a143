//! Source fetcher
//!
//! Shallow-clones a repository into a scratch directory, detects its runtime
//! and removes the directory when the checkout is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::PilotError;
use crate::filesys::dir::Dir;
use crate::models::application::{RepositorySource, RuntimeKind};
use crate::process::{CommandRunner, CommandSpec};

const TOKEN_USER: &str = "x-access-token";
const REDACTED: &str = "***";

/// Why a clone failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneFailure {
    Authentication,
    NotFound,
    Permission,
    Timeout,
    Network,
    Other,
}

impl CloneFailure {
    /// Classify git's stderr
    pub fn classify(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("authentication failed")
            || lower.contains("could not read username")
            || lower.contains("invalid username or password")
        {
            CloneFailure::Authentication
        } else if lower.contains("not found") {
            CloneFailure::NotFound
        } else if lower.contains("permission denied") || lower.contains("403") {
            CloneFailure::Permission
        } else if lower.contains("timed out") || lower.contains("timeout") {
            CloneFailure::Timeout
        } else if lower.contains("could not resolve host")
            || lower.contains("unable to access")
            || lower.contains("connection refused")
            || lower.contains("network is unreachable")
        {
            CloneFailure::Network
        } else {
            CloneFailure::Other
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CloneFailure::Authentication => "authentication",
            CloneFailure::NotFound => "not found",
            CloneFailure::Permission => "permission",
            CloneFailure::Timeout => "timeout",
            CloneFailure::Network => "network",
            CloneFailure::Other => "clone",
        }
    }

    /// User-facing next step
    pub fn suggestion(&self) -> &'static str {
        match self {
            CloneFailure::Authentication => {
                "The repository looks private. Connect a source control token with read access."
            }
            CloneFailure::NotFound => "Check the repository URL and that the branch exists.",
            CloneFailure::Permission => {
                "The token does not grant access to this repository. Check its scopes."
            }
            CloneFailure::Timeout => {
                "The clone took too long. Try again, or reduce the repository size."
            }
            CloneFailure::Network => {
                "The repository host could not be reached. Check the URL and try again."
            }
            CloneFailure::Other => "Check the repository URL and branch, then redeploy.",
        }
    }

    fn into_error(self, detail: &str) -> PilotError {
        let message = format!("{} error while cloning: {}. {}", self.label(), detail, self.suggestion());
        match self {
            CloneFailure::Authentication => PilotError::Credential(message),
            CloneFailure::Timeout | CloneFailure::Network => PilotError::Network(message),
            CloneFailure::NotFound | CloneFailure::Permission | CloneFailure::Other => {
                PilotError::ToolExecution(message)
            }
        }
    }
}

/// Clone URL with the access token embedded as basic-auth credentials.
/// Non-http URLs are returned unchanged.
pub fn authenticated_url(url: &str, token: Option<&SecretString>) -> String {
    let Some(token) = token else {
        return url.to_string();
    };
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return url.to_string();
    }
    if parsed.set_username(TOKEN_USER).is_err()
        || parsed.set_password(Some(token.expose_secret())).is_err()
    {
        return url.to_string();
    }
    parsed.to_string()
}

/// Remove the token from text headed for logs or records
pub fn redact(text: &str, token: Option<&SecretString>) -> String {
    match token {
        Some(token) if !token.expose_secret().is_empty() => {
            text.replace(token.expose_secret(), REDACTED)
        }
        _ => text.to_string(),
    }
}

/// Runtime category from repository root markers
pub async fn detect_runtime(root: &Path) -> RuntimeKind {
    let has = |name: &str| root.join(name).exists();

    if ["next.config.js", "next.config.mjs", "next.config.ts"]
        .iter()
        .any(|f| has(f))
    {
        return RuntimeKind::NextJs;
    }
    if has("package.json") {
        let is_next = tokio::fs::read_to_string(root.join("package.json"))
            .await
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .is_some_and(|pkg| {
                ["dependencies", "devDependencies"]
                    .iter()
                    .any(|section| pkg.get(*section).and_then(|d| d.get("next")).is_some())
            });
        return if is_next {
            RuntimeKind::NextJs
        } else {
            RuntimeKind::Node
        };
    }
    if ["requirements.txt", "pyproject.toml", "Pipfile"]
        .iter()
        .any(|f| has(f))
    {
        return RuntimeKind::Python;
    }
    if has("go.mod") {
        return RuntimeKind::Go;
    }
    if has("index.html") {
        return RuntimeKind::Static;
    }
    RuntimeKind::Generic
}

/// A cloned repository; the directory is removed on drop
pub struct Checkout {
    path: PathBuf,
    removed: bool,
}

impl Checkout {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_dockerfile(&self) -> bool {
        self.path.join("Dockerfile").is_file()
    }

    pub async fn cleanup(mut self) {
        if let Err(e) = Dir::new(&self.path).delete().await {
            warn!("Failed to remove scratch directory {}: {}", self.path.display(), e);
        }
        self.removed = true;
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if !self.removed && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!("Failed to remove scratch directory {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Clones repositories into a scratch root
pub struct SourceFetcher {
    runner: Arc<dyn CommandRunner>,
    git_binary: String,
    scratch: Dir,
    clone_timeout: Duration,
}

impl SourceFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, git_binary: impl Into<String>, scratch: Dir) -> Self {
        Self {
            runner,
            git_binary: git_binary.into(),
            scratch,
            clone_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = timeout;
        self
    }

    /// Scratch directory a run will clone into
    pub fn scratch_path(&self, run_id: &str) -> PathBuf {
        self.scratch.subdir(run_id).path().to_path_buf()
    }

    /// Shallow, single-branch clone of exactly one commit
    pub async fn fetch(
        &self,
        repo: &RepositorySource,
        token: Option<&SecretString>,
        run_id: &str,
    ) -> Result<Checkout, PilotError> {
        self.scratch.create().await?;
        let target = self.scratch_path(run_id);
        if target.exists() {
            Dir::new(&target).delete().await?;
        }
        // Guard first so every failure path below removes the directory
        let checkout = Checkout {
            path: target.clone(),
            removed: false,
        };

        info!(branch = %repo.branch, "Cloning {}", redact(&repo.url, token));
        let spec = CommandSpec::new(&self.git_binary)
            .args(["clone", "--depth", "1", "--single-branch", "--no-tags", "--branch"])
            .arg(repo.branch.as_str())
            .arg(authenticated_url(&repo.url, token))
            .arg(target.to_string_lossy().into_owned())
            .envs([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())])
            .timeout(self.clone_timeout);

        match self.runner.run(&spec).await {
            Ok(output) if output.success() => {
                debug!("Clone finished in {}", target.display());
                Ok(checkout)
            }
            Ok(output) => {
                let stderr = redact(output.stderr.trim(), token);
                Err(CloneFailure::classify(&stderr).into_error(&stderr))
            }
            Err(PilotError::Timeout(msg)) => Err(CloneFailure::Timeout.into_error(&msg)),
            Err(e) => Err(PilotError::ToolExecution(redact(&e.to_string(), token))),
        }
    }
}
