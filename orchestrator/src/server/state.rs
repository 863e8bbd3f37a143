//! Server state

use crate::deploy::application::ApplicationController;
use crate::deploy::infra::InfraController;

/// Server state shared across handlers
pub struct ServerState {
    pub infra: InfraController,
    pub applications: ApplicationController,
}

impl ServerState {
    pub fn new(infra: InfraController, applications: ApplicationController) -> Self {
        Self {
            infra,
            applications,
        }
    }
}
