//! Credential store
//!
//! Credentials are resolved on demand for every operation and handed out as
//! [`AwsCredentials`] with secrets wrapped in `SecretString`.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::PilotError;
use crate::filesys::file::File;
use crate::models::credentials::AwsCredentials;

/// Source of decrypted credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credentials of the given set, which must belong to `owner_id`
    async fn aws_credentials(
        &self,
        owner_id: &str,
        credential_id: &str,
    ) -> Result<AwsCredentials, PilotError>;

    /// Access token for cloning the owner's private repositories
    async fn source_token(&self, owner_id: &str) -> Result<Option<SecretString>, PilotError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialEntry {
    owner_id: String,
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialFile {
    #[serde(default)]
    credentials: HashMap<String, CredentialEntry>,
    #[serde(default)]
    source_tokens: HashMap<String, String>,
}

/// Credentials kept in memory, optionally loaded from a local JSON file
#[derive(Default)]
pub struct LocalCredentialStore {
    credentials: HashMap<String, (String, AwsCredentials)>,
    source_tokens: HashMap<String, SecretString>,
}

impl LocalCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file, tightening its permissions to 0600.
    /// A missing file yields an empty store. Entries without a region get
    /// `default_region`.
    pub async fn load(file: &File, default_region: &str) -> Result<Self, PilotError> {
        if !file.exists().await {
            warn!("Credential file {} not found, no credentials loaded", file.path().display());
            return Ok(Self::new());
        }
        file.set_permissions_600().await?;

        let parsed: CredentialFile = file.read_json().await.map_err(|e| {
            PilotError::Configuration(format!("invalid credential file: {}", e))
        })?;

        let mut store = Self::new();
        for (id, entry) in parsed.credentials {
            let region = entry.region.unwrap_or_else(|| default_region.to_string());
            let mut creds = AwsCredentials::new(entry.access_key_id, entry.secret_access_key, region);
            creds.session_token = entry.session_token.map(SecretString::from);
            store.credentials.insert(id, (entry.owner_id, creds));
        }
        for (owner, token) in parsed.source_tokens {
            store.source_tokens.insert(owner, SecretString::from(token));
        }
        debug!("Loaded {} credential sets", store.credentials.len());
        Ok(store)
    }

    pub fn with_credentials(
        mut self,
        credential_id: &str,
        owner_id: &str,
        credentials: AwsCredentials,
    ) -> Self {
        self.credentials
            .insert(credential_id.to_string(), (owner_id.to_string(), credentials));
        self
    }

    pub fn with_source_token(mut self, owner_id: &str, token: &str) -> Self {
        self.source_tokens
            .insert(owner_id.to_string(), SecretString::from(token.to_string()));
        self
    }
}

#[async_trait]
impl CredentialStore for LocalCredentialStore {
    async fn aws_credentials(
        &self,
        owner_id: &str,
        credential_id: &str,
    ) -> Result<AwsCredentials, PilotError> {
        match self.credentials.get(credential_id) {
            Some((owner, creds)) if owner == owner_id => Ok(creds.clone()),
            Some(_) => Err(PilotError::Credential(format!(
                "credential set {} does not belong to {}",
                credential_id, owner_id
            ))),
            None => Err(PilotError::Credential(format!(
                "credential set {} not found",
                credential_id
            ))),
        }
    }

    async fn source_token(&self, owner_id: &str) -> Result<Option<SecretString>, PilotError> {
        Ok(self.source_tokens.get(owner_id).cloned())
    }
}
