//! Finite state machines for deployments and applications
//!
//! Controllers never assign a status directly: every change goes through
//! [`DeploymentStatus::on`] or [`AppStatus::on`], which reject transitions the
//! lifecycle does not allow.

use crate::errors::PilotError;
use crate::models::application::AppStatus;
use crate::models::deployment::DeploymentStatus;

/// Infrastructure deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraEvent {
    /// IaC apply exited successfully
    ApplySucceeded,

    /// IaC apply failed
    ApplyFailed,

    /// User asked to destroy the resource
    DestroyRequested,

    DestroySucceeded,

    DestroyFailed,

    /// Reconciliation found the resource gone
    DriftDetected,
}

impl DeploymentStatus {
    /// Process an event and return the next state
    pub fn on(self, event: &InfraEvent) -> Result<DeploymentStatus, PilotError> {
        use DeploymentStatus as S;
        use InfraEvent as E;

        let next = match (self, event) {
            (S::Pending, E::ApplySucceeded) => S::Completed,
            (S::Pending, E::ApplyFailed) => S::Failed,

            (S::Completed, E::DestroyRequested) => S::Destroying,
            (S::Completed, E::DriftDetected) => S::DeletedExternally,

            (S::Destroying, E::DestroySucceeded) => S::Destroyed,
            (S::Destroying, E::DestroyFailed) => S::DestroyFailed,

            (state, event) => {
                return Err(PilotError::InvalidTransition(format!(
                    "deployment cannot handle {:?} while {}",
                    event, state
                )));
            }
        };
        Ok(next)
    }
}

/// Application pipeline event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    StartClone,
    StartBuild,
    StartPush,
    StartDeploy,

    /// Destination-specific deploy step finished
    Deployed,

    Stop,
    Start,

    /// A stage failed
    Fail(String),

    /// The pipeline task died without reporting
    Crash(String),

    /// User cancelled the pipeline
    Cancel,

    Redeploy,
}

impl AppStatus {
    /// Process an event and return the next state
    pub fn on(self, event: &AppEvent) -> Result<AppStatus, PilotError> {
        use AppEvent as E;
        use AppStatus as S;

        let next = match (self, event) {
            (S::Pending, E::StartClone) => S::Cloning,
            (S::Cloning, E::StartBuild) => S::Building,
            (S::Building, E::StartPush) => S::Pushing,

            // Registry images go straight to deploy; VM targets skip the push
            (S::Pending | S::Building | S::Pushing, E::StartDeploy) => S::Deploying,

            (S::Deploying, E::Deployed) => S::Running,

            (S::Running, E::Stop) => S::Stopped,
            (S::Stopped, E::Start) => S::Running,

            (state, E::Fail(_)) if state.is_in_progress() => S::Failed,
            (state, E::Cancel) if state.is_cancellable() => S::Failed,
            (state, E::Crash(_)) if state.is_in_progress() => S::Error,

            (S::Running | S::Stopped | S::Failed | S::Error, E::Redeploy) => S::Pending,

            (state, event) => {
                return Err(PilotError::InvalidTransition(format!(
                    "application cannot handle {:?} while {}",
                    event, state
                )));
            }
        };
        Ok(next)
    }
}
