//! Drift reconciliation
//!
//! Read-only existence probes for the resource a completed deployment
//! created. Nothing here mutates a record; callers decide what to do with
//! the probe result.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cloud::{CloudApi, ResourceProbe};
use crate::deploy::templates::{name_variable, Template};
use crate::deploy::workspace::parse_outputs;
use crate::errors::PilotError;
use crate::models::credentials::AwsCredentials;
use crate::models::deployment::{Deployment, ResourceKind};

pub struct DriftReconciler {
    cloud: Arc<dyn CloudApi>,
}

impl DriftReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>) -> Self {
        Self { cloud }
    }

    /// Probe the provider for the deployment's resource. An `Err` means the
    /// probe itself failed, never that the resource is absent.
    pub async fn reconcile(
        &self,
        deployment: &Deployment,
        creds: &AwsCredentials,
    ) -> Result<ResourceProbe, PilotError> {
        let identifier = resource_identifier(deployment).ok_or_else(|| {
            PilotError::Drift(format!(
                "deployment {} has no recorded {} identifier",
                deployment.id, deployment.resource_kind
            ))
        })?;
        debug!(deployment_id = %deployment.id, identifier = %identifier, "Probing resource");

        let probe = match deployment.resource_kind {
            ResourceKind::ComputeInstance => {
                match self.cloud.describe_instance(creds, &identifier).await {
                    Ok(None) => Ok(ResourceProbe::absent(format!(
                        "instance {} no longer exists",
                        identifier
                    ))),
                    Ok(Some(instance)) if instance.is_terminated() => {
                        Ok(ResourceProbe::absent(format!(
                            "instance {} is {}",
                            identifier, instance.state
                        )))
                    }
                    Ok(Some(_)) => Ok(ResourceProbe::present()),
                    Err(e) => Err(e),
                }
            }
            ResourceKind::ObjectStore => self.cloud.probe_bucket(creds, &identifier).await,
            ResourceKind::Identity => self.cloud.probe_user(creds, &identifier).await,
        };

        probe.map_err(|e| match e {
            PilotError::Drift(msg) => PilotError::Drift(msg),
            other => PilotError::Drift(other.to_string()),
        })
    }
}

/// Identifier of the created resource: the apply outputs first, then the
/// configured name for kinds that are addressed by name
pub fn resource_identifier(deployment: &Deployment) -> Option<String> {
    let template = Template::Resource(deployment.resource_kind);
    if let Some(output) = &deployment.output {
        if let Some(id) = parse_outputs(output)
            .remove(template.identifier_output())
            .filter(|id| !id.is_empty())
        {
            return Some(id);
        }
    }

    match deployment.resource_kind {
        ResourceKind::ComputeInstance => None,
        kind => Some(
            deployment
                .config
                .get(name_variable(kind))
                .and_then(Value::as_str)
                .unwrap_or(&deployment.resource_name)
                .to_string(),
        ),
    }
}
