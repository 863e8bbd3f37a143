//! Cluster control adapter

use std::sync::Arc;

use tracing::info;

use crate::cloud::{CloudApi, TaskDefinitionSpec};
use crate::errors::PilotError;
use crate::models::application::Application;
use crate::models::credentials::AwsCredentials;

pub const DEFAULT_CLUSTER: &str = "stackpilot";
const EXECUTION_ROLE: &str = "ecsTaskExecutionRole";

/// What the managed-cluster path produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDeployment {
    pub cluster_name: String,
    pub task_definition_arn: String,
    pub service_name: String,
    /// Internal address only; no load balancer is provisioned
    pub url: String,
}

/// Drives the provider's container-orchestration service
pub struct ClusterControl {
    cloud: Arc<dyn CloudApi>,
    cluster_name: String,
}

impl ClusterControl {
    pub fn new(cloud: Arc<dyn CloudApi>, cluster_name: impl Into<String>) -> Self {
        Self {
            cloud,
            cluster_name: cluster_name.into(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Ensure the shared cluster and register a task definition for `image`
    pub async fn deploy(
        &self,
        app: &Application,
        image: &str,
        creds: &AwsCredentials,
    ) -> Result<ClusterDeployment, PilotError> {
        let slug = app.slug();

        self.cloud.ensure_cluster(creds, &self.cluster_name).await?;
        let account_id = self.cloud.account_id(creds).await?;

        let spec = TaskDefinitionSpec {
            family: slug.clone(),
            container_name: slug.clone(),
            image: image.to_string(),
            cpu: app.runtime.cpu,
            memory: app.runtime.memory,
            port: app.runtime.port,
            env: app.runtime.env.clone(),
            log_group: format!("/stackpilot/{}", slug),
            region: creds.region.clone(),
            execution_role_arn: format!("arn:aws:iam::{}:role/{}", account_id, EXECUTION_ROLE),
        };
        let task_definition_arn = self.cloud.register_task_definition(creds, &spec).await?;
        info!(
            application_id = %app.id,
            task_definition = %task_definition_arn,
            "Registered task definition"
        );

        let service_name = format!("{}-service", slug);
        Ok(ClusterDeployment {
            url: internal_url(&service_name, &self.cluster_name, app.runtime.port),
            cluster_name: self.cluster_name.clone(),
            task_definition_arn,
            service_name,
        })
    }

    /// Set the service's desired task count
    pub async fn scale(
        &self,
        creds: &AwsCredentials,
        cluster: &str,
        service: &str,
        desired_count: u32,
    ) -> Result<(), PilotError> {
        info!(cluster, service, desired_count, "Scaling service");
        self.cloud
            .scale_service(creds, cluster, service, desired_count)
            .await
    }
}

pub fn internal_url(service: &str, cluster: &str, port: u16) -> String {
    format!("http://{}.{}.internal:{}", service, cluster, port)
}
