//! Deployment record store
//!
//! Records are mutated exclusively through [`RecordStore::modify`], which runs
//! a closure under the store's write lock so that a pipeline and its progress
//! ticker never lose each other's updates.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::PilotError;
use crate::filesys::dir::Dir;
use crate::models::application::Application;
use crate::models::deployment::Deployment;

/// A persisted record with an identity and a version counter
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable record kind used in error messages
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn owner_id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    /// Bump the version and the update timestamp
    fn mark_updated(&mut self);
}

impl Record for Deployment {
    const KIND: &'static str = "deployment";

    fn id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn mark_updated(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Record for Application {
    const KIND: &'static str = "application";

    fn id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn mark_updated(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

/// A mutation applied atomically to a stored record.
/// Returning an error leaves the record untouched.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<(), PilotError> + Send>;

/// Storage for deployment and application records
#[async_trait]
pub trait RecordStore<T: Record>: Send + Sync {
    async fn insert(&self, record: T) -> Result<T, PilotError>;

    async fn get(&self, id: &str) -> Result<T, PilotError>;

    /// Records newest first, optionally filtered by owner
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<T>, PilotError>;

    async fn modify(&self, id: &str, mutation: Mutation<T>) -> Result<T, PilotError>;

    async fn remove(&self, id: &str) -> Result<T, PilotError>;
}

/// In-memory store with optional write-through JSON persistence
pub struct LocalStore<T: Record> {
    records: RwLock<HashMap<String, T>>,
    dir: Option<Dir>,
}

impl<T: Record> LocalStore<T> {
    /// Store without persistence
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Open a store persisted as one JSON file per record in `dir`
    pub async fn open(dir: Dir) -> Result<Self, PilotError> {
        dir.create().await?;

        let mut records = HashMap::new();
        for path in dir.list_files_with_extension("json").await? {
            let file = crate::filesys::file::File::new(&path);
            match file.read_json::<T>().await {
                Ok(record) => {
                    records.insert(record.id().to_string(), record);
                }
                Err(e) => {
                    warn!("Skipping unreadable {} record {}: {}", T::KIND, path.display(), e);
                }
            }
        }
        debug!("Loaded {} {} records from {}", records.len(), T::KIND, dir.path().display());

        Ok(Self {
            records: RwLock::new(records),
            dir: Some(dir),
        })
    }

    async fn persist(&self, record: &T) -> Result<(), PilotError> {
        if let Some(dir) = &self.dir {
            dir.file(&format!("{}.json", record.id()))
                .write_json(record)
                .await
                .map_err(|e| PilotError::Storage(format!("failed to persist {}: {}", T::KIND, e)))?;
        }
        Ok(())
    }

    fn not_found(id: &str) -> PilotError {
        PilotError::NotFound(format!("{} {}", T::KIND, id))
    }
}

#[async_trait]
impl<T: Record> RecordStore<T> for LocalStore<T> {
    async fn insert(&self, record: T) -> Result<T, PilotError> {
        let mut records = self.records.write().await;
        if records.contains_key(record.id()) {
            return Err(PilotError::Conflict(format!(
                "{} {} already exists",
                T::KIND,
                record.id()
            )));
        }
        self.persist(&record).await?;
        records.insert(record.id().to_string(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<T, PilotError> {
        let records = self.records.read().await;
        records.get(id).cloned().ok_or_else(|| Self::not_found(id))
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<T>, PilotError> {
        let records = self.records.read().await;
        let mut list: Vec<T> = records
            .values()
            .filter(|r| owner_id.map_or(true, |owner| r.owner_id() == owner))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(list)
    }

    async fn modify(&self, id: &str, mutation: Mutation<T>) -> Result<T, PilotError> {
        let mut records = self.records.write().await;
        let current = records.get(id).ok_or_else(|| Self::not_found(id))?;

        let mut updated = current.clone();
        mutation(&mut updated)?;
        updated.mark_updated();

        self.persist(&updated).await?;
        records.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    async fn remove(&self, id: &str) -> Result<T, PilotError> {
        let mut records = self.records.write().await;
        let removed = records.remove(id).ok_or_else(|| Self::not_found(id))?;
        if let Some(dir) = &self.dir {
            if let Err(e) = dir.file(&format!("{}.json", id)).delete().await {
                warn!("Failed to delete {} file for {}: {}", T::KIND, id, e);
            }
        }
        Ok(removed)
    }
}
