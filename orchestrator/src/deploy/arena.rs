//! Workspace arena
//!
//! Tracks the on-disk scope behind every workspace id:
//! `Created -> Applied | ApplyFailed -> Destroyed -> Released`, or
//! `Abandoned` when the owning record goes away while resources may still
//! exist. Directories are removed only on release.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::deploy::templates::Template;
use crate::errors::PilotError;
use crate::filesys::dir::Dir;
use crate::utils::generate_uuid;

const METADATA_FILE: &str = "workspace.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceState {
    Created,
    Applied,
    ApplyFailed,
    Destroyed,
    Released,
    Abandoned,
}

/// A workspace known to the arena
#[derive(Debug, Clone)]
pub struct WorkspaceEntry {
    pub id: String,
    pub template: Template,
    pub state: WorkspaceState,
    pub dir: Dir,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceMetadata {
    template: Template,
    created_at: DateTime<Utc>,
}

/// Registry of workspace directories under a common root
pub struct WorkspaceArena {
    root: Dir,
    entries: RwLock<HashMap<String, WorkspaceEntry>>,
}

impl WorkspaceArena {
    pub fn new(root: Dir) -> Self {
        Self {
            root,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    /// Allocate a fresh, never reused workspace and create its directory
    pub async fn allocate(&self, template: Template) -> Result<WorkspaceEntry, PilotError> {
        let id = generate_uuid();
        let dir = self.root.subdir(&id);
        dir.create().await?;
        dir.file(METADATA_FILE)
            .write_json(&WorkspaceMetadata {
                template,
                created_at: Utc::now(),
            })
            .await?;

        let entry = WorkspaceEntry {
            id: id.clone(),
            template,
            state: WorkspaceState::Created,
            dir,
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry.clone());
        debug!(workspace_id = %id, "Allocated workspace");
        Ok(entry)
    }

    /// Look up a workspace, adopting it from disk if this process has not
    /// seen it yet (e.g. after a restart)
    pub async fn get(&self, id: &str) -> Option<WorkspaceEntry> {
        let known = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned();
        if known.is_some() {
            return known;
        }
        if !is_valid_id(id) {
            return None;
        }

        let dir = self.root.subdir(id);
        let metadata: WorkspaceMetadata = dir.file(METADATA_FILE).read_json().await.ok()?;
        let entry = WorkspaceEntry {
            id: id.to_string(),
            template: metadata.template,
            state: WorkspaceState::Applied,
            dir,
        };
        info!(workspace_id = %id, "Adopted workspace from disk");
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), entry.clone());
        Some(entry)
    }

    pub fn state(&self, id: &str) -> Option<WorkspaceState> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|e| e.state)
    }

    pub fn set_state(&self, id: &str, state: WorkspaceState) {
        if let Some(entry) = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            entry.state = state;
        }
    }

    /// Remove the directory of a workspace whose resources are gone
    pub async fn release(&self, id: &str) -> Result<(), PilotError> {
        let entry = self
            .get(id)
            .await
            .ok_or_else(|| PilotError::NotFound(format!("workspace {}", id)))?;

        match entry.state {
            WorkspaceState::Destroyed | WorkspaceState::ApplyFailed | WorkspaceState::Created => {}
            WorkspaceState::Released => return Ok(()),
            state => {
                return Err(PilotError::InvalidTransition(format!(
                    "workspace {} cannot be released while {:?}",
                    id, state
                )));
            }
        }

        entry.dir.delete().await?;
        self.set_state(id, WorkspaceState::Released);
        debug!(workspace_id = %id, "Released workspace");
        Ok(())
    }

    /// Forget a workspace without destroying its resources. A failed apply
    /// may have created part of its resources, so its state is kept too.
    pub async fn abandon(&self, id: &str) {
        match self.get(id).await {
            Some(entry)
                if matches!(
                    entry.state,
                    WorkspaceState::Applied | WorkspaceState::ApplyFailed
                ) =>
            {
                warn!(
                    workspace_id = %id,
                    dir = %entry.dir.path().display(),
                    "Abandoning workspace with live resources; they must be removed manually"
                );
                self.set_state(id, WorkspaceState::Abandoned);
            }
            Some(entry) if entry.state == WorkspaceState::Released => {}
            Some(_) => {
                if let Err(e) = self.force_release(id).await {
                    warn!(workspace_id = %id, "Failed to remove abandoned workspace: {}", e);
                }
            }
            None => {}
        }
    }

    async fn force_release(&self, id: &str) -> Result<(), PilotError> {
        self.root.subdir(id).delete().await?;
        self.set_state(id, WorkspaceState::Released);
        Ok(())
    }

    /// Workspace ids present on disk
    pub async fn scan(&self) -> Result<Vec<String>, PilotError> {
        Ok(self
            .root
            .list_dir_names()
            .await?
            .into_iter()
            .filter(|name| is_valid_id(name))
            .collect())
    }
}

/// Ids are UUIDs; anything else is never turned into a path
fn is_valid_id(id: &str) -> bool {
    uuid::Uuid::parse_str(id).is_ok()
}
