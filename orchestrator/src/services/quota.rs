//! Quota gate consumed before accepting new work

use async_trait::async_trait;

use crate::errors::PilotError;

/// What a request would create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaRequest {
    Deployment,
    Application,
}

/// Pass/fail admission check; the policy itself lives elsewhere
#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check(&self, owner_id: &str, request: QuotaRequest) -> Result<(), PilotError>;
}

/// Admits everything
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl QuotaGate for AllowAll {
    async fn check(&self, _owner_id: &str, _request: QuotaRequest) -> Result<(), PilotError> {
        Ok(())
    }
}
