//! Error types for the orchestrator

use thiserror::Error;

/// Main error type for stackpilot
#[derive(Error, Debug)]
pub enum PilotError {
    /// Non-zero exit from the IaC tool or the container toolchain.
    /// Carries the captured output verbatim.
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Target unreachable: {0}")]
    UnreachableTarget(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The reconciliation probe itself failed (not the same as "resource absent")
    #[error("Drift probe failed: {0}")]
    Drift(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cloud provider error: {0}")]
    Cloud(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PilotError {
    /// True for errors caused by the caller's request rather than the system
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PilotError::Validation(_)
                | PilotError::InvalidTransition(_)
                | PilotError::Configuration(_)
                | PilotError::NotFound(_)
                | PilotError::Conflict(_)
                | PilotError::Credential(_)
        )
    }

    /// Rewrite the message of string-carrying variants, keeping the kind.
    /// Wrapped library errors are returned unchanged.
    pub fn map_message(self, f: impl FnOnce(&str) -> String) -> Self {
        use PilotError::*;
        match self {
            ToolExecution(m) => ToolExecution(f(&m)),
            Network(m) => Network(f(&m)),
            Credential(m) => Credential(f(&m)),
            UnreachableTarget(m) => UnreachableTarget(f(&m)),
            Configuration(m) => Configuration(f(&m)),
            Drift(m) => Drift(f(&m)),
            Validation(m) => Validation(f(&m)),
            NotFound(m) => NotFound(f(&m)),
            InvalidTransition(m) => InvalidTransition(f(&m)),
            Conflict(m) => Conflict(f(&m)),
            Timeout(m) => Timeout(f(&m)),
            Cloud(m) => Cloud(f(&m)),
            Storage(m) => Storage(f(&m)),
            Internal(m) => Internal(f(&m)),
            other @ (Io(_) | Json(_) | Http(_)) => other,
        }
    }
}
