//! Workspace executor
//!
//! Drives the IaC tool through `init` / `apply` / `destroy` inside an isolated
//! workspace directory per operation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::deploy::arena::{WorkspaceArena, WorkspaceEntry, WorkspaceState};
use crate::deploy::templates::{build_variables, Template};
use crate::deploy::tfvars::{self, VARIABLE_FILE};
use crate::models::credentials::AwsCredentials;
use crate::models::deployment::ResourceKind;
use crate::process::{CommandRunner, CommandSpec};

const TEMPLATE_FILE: &str = "main.tf";

/// Provider messages meaning the ingress rule is already in place
const DUPLICATE_RULE_MARKERS: &[&str] = &["InvalidPermission.Duplicate", "already exists"];

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// IaC tool binary
    pub binary: String,

    pub init_timeout: Duration,

    /// Limit for apply and destroy
    pub apply_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            init_timeout: Duration::from_secs(300),
            apply_timeout: Duration::from_secs(1800),
        }
    }
}

/// Result of one apply or destroy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    /// Workspace the run used; `None` only if no workspace could be allocated
    pub workspace_id: Option<String>,
    pub success: bool,
    /// Captured standard output and standard error
    pub output: String,
    pub error: Option<String>,
}

impl ToolRun {
    fn failed(workspace_id: Option<String>, output: String, error: String) -> Self {
        Self {
            workspace_id,
            success: false,
            output,
            error: Some(error),
        }
    }
}

/// Result of the idempotent ingress rule operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub success: bool,
    pub already_exists: bool,
    pub error: Option<String>,
}

/// Runs the IaC tool in arena-managed workspaces
pub struct WorkspaceExecutor {
    runner: Arc<dyn CommandRunner>,
    arena: Arc<WorkspaceArena>,
    options: ExecutorOptions,
}

impl WorkspaceExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        arena: Arc<WorkspaceArena>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            runner,
            arena,
            options,
        }
    }

    pub fn arena(&self) -> &Arc<WorkspaceArena> {
        &self.arena
    }

    /// Provision one resource in a fresh workspace
    pub async fn apply(
        &self,
        kind: ResourceKind,
        resource_name: &str,
        config: &Map<String, Value>,
        creds: &AwsCredentials,
    ) -> ToolRun {
        self.apply_template(Template::Resource(kind), Some(resource_name), config, creds)
            .await
    }

    /// Destroy everything a previous apply created in the workspace.
    /// The workspace directory is released on success.
    pub async fn destroy(&self, workspace_id: &str, creds: &AwsCredentials) -> ToolRun {
        let ws_id = Some(workspace_id.to_string());
        let Some(entry) = self.arena.get(workspace_id).await else {
            let msg = format!("workspace {} not found", workspace_id);
            return ToolRun::failed(ws_id, String::new(), msg);
        };
        if !entry.dir.file(VARIABLE_FILE).exists().await {
            let msg = format!("workspace {} has no variable file", workspace_id);
            return ToolRun::failed(ws_id, String::new(), msg);
        }

        info!(workspace_id = %workspace_id, "Destroying workspace resources");

        if !entry.dir.subdir(".terraform").exists().await {
            if let Err(run) = self.init(&entry, creds).await {
                return run;
            }
        }

        let run = self
            .tool(&entry, creds, &["destroy", "-auto-approve", "-input=false", "-no-color"])
            .await;
        if run.success {
            self.arena.set_state(workspace_id, WorkspaceState::Destroyed);
            if let Err(e) = self.arena.release(workspace_id).await {
                warn!(workspace_id = %workspace_id, "Failed to release workspace: {}", e);
            }
        }
        run
    }

    /// Open `port` on an existing security group. A rule that already exists
    /// counts as success.
    pub async fn apply_idempotent_rule(
        &self,
        security_group_id: &str,
        port: u16,
        creds: &AwsCredentials,
    ) -> RuleOutcome {
        let mut config = Map::new();
        config.insert("security_group_id".to_string(), json!(security_group_id));
        config.insert("port".to_string(), json!(port));

        let run = self
            .apply_template(Template::IngressRule, None, &config, creds)
            .await;
        if run.success {
            return RuleOutcome {
                success: true,
                already_exists: false,
                error: None,
            };
        }

        if is_duplicate_rule(&run.output) || run.error.as_deref().is_some_and(is_duplicate_rule) {
            debug!(security_group_id, port, "Ingress rule already exists");
            // The duplicate run created nothing
            if let Some(ws) = &run.workspace_id {
                if let Err(e) = self.arena.release(ws).await {
                    warn!(workspace_id = %ws, "Failed to release workspace: {}", e);
                }
            }
            return RuleOutcome {
                success: true,
                already_exists: true,
                error: None,
            };
        }

        RuleOutcome {
            success: false,
            already_exists: false,
            error: run.error,
        }
    }

    async fn apply_template(
        &self,
        template: Template,
        resource_name: Option<&str>,
        config: &Map<String, Value>,
        creds: &AwsCredentials,
    ) -> ToolRun {
        let entry = match self.arena.allocate(template).await {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed to allocate workspace: {}", e);
                return ToolRun::failed(None, String::new(), e.to_string());
            }
        };
        let ws_id = Some(entry.id.clone());

        let vars = build_variables(template, resource_name, config, &creds.region);
        let rendered = tfvars::render(&vars);
        let prepared = async {
            entry.dir.file(TEMPLATE_FILE).write_string(template.source()).await?;
            entry.dir.file(VARIABLE_FILE).write_string(&rendered).await
        }
        .await;
        if let Err(e) = prepared {
            self.arena.set_state(&entry.id, WorkspaceState::ApplyFailed);
            return ToolRun::failed(ws_id, String::new(), e.to_string());
        }

        info!(workspace_id = %entry.id, template = ?template, "Applying workspace");

        if let Err(run) = self.init(&entry, creds).await {
            self.arena.set_state(&entry.id, WorkspaceState::ApplyFailed);
            return run;
        }

        let run = self
            .tool(&entry, creds, &["apply", "-auto-approve", "-input=false", "-no-color"])
            .await;
        self.arena.set_state(
            &entry.id,
            if run.success {
                WorkspaceState::Applied
            } else {
                WorkspaceState::ApplyFailed
            },
        );
        run
    }

    async fn init(&self, entry: &WorkspaceEntry, creds: &AwsCredentials) -> Result<(), ToolRun> {
        let run = self
            .run_tool(entry, creds, &["init", "-input=false", "-no-color"], self.options.init_timeout)
            .await;
        if run.success {
            Ok(())
        } else {
            Err(run)
        }
    }

    async fn tool(&self, entry: &WorkspaceEntry, creds: &AwsCredentials, args: &[&str]) -> ToolRun {
        self.run_tool(entry, creds, args, self.options.apply_timeout)
            .await
    }

    async fn run_tool(
        &self,
        entry: &WorkspaceEntry,
        creds: &AwsCredentials,
        args: &[&str],
        timeout: Duration,
    ) -> ToolRun {
        let spec = CommandSpec::new(&self.options.binary)
            .args(args.iter().copied())
            .current_dir(entry.dir.path())
            .envs(creds.env_vars())
            .envs([("TF_IN_AUTOMATION".to_string(), "1".to_string())])
            .timeout(timeout);

        let ws_id = Some(entry.id.clone());
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => ToolRun {
                workspace_id: ws_id,
                success: true,
                output: output.combined(),
                error: None,
            },
            Ok(output) => {
                let combined = output.combined();
                warn!(
                    workspace_id = %entry.id,
                    exit_code = ?output.exit_code,
                    "{} {} failed",
                    self.options.binary,
                    args.first().copied().unwrap_or_default()
                );
                ToolRun::failed(ws_id, combined.clone(), combined)
            }
            Err(e) => {
                error!(workspace_id = %entry.id, "Failed to run {}: {}", self.options.binary, e);
                ToolRun::failed(ws_id, String::new(), e.to_string())
            }
        }
    }
}

pub fn is_duplicate_rule(output: &str) -> bool {
    DUPLICATE_RULE_MARKERS.iter().any(|m| output.contains(m))
}

/// Parse the `Outputs:` section printed at the end of an apply
pub fn parse_outputs(raw: &str) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    let Some(start) = raw.rfind("Outputs:") else {
        return outputs;
    };

    for line in raw[start + "Outputs:".len()..].lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        outputs.insert(key.to_string(), value.to_string());
    }
    outputs
}
