//! Infrastructure controller tests

use serde_json::{json, Map, Value};

use stackpilot::deploy::arena::WorkspaceState;
use stackpilot::errors::PilotError;
use stackpilot::models::credentials::AwsCredentials;
use stackpilot::models::deployment::{
    CreateDeployment, DeletedBy, Deployment, DeploymentStatus, ResourceKind,
};
use stackpilot::services::notify::NotificationLevel;
use stackpilot::services::records::RecordStore;

use crate::fakes::{failed, ok, Harness, CREDENTIAL, OWNER};

const IDENTITY_OUTPUT: &str = "Apply complete! Resources: 1 added, 0 changed, 0 destroyed.\n\
                               \n\
                               Outputs:\n\
                               \n\
                               user_name = \"deploy-bot\"\n";

fn request(kind: ResourceKind, name: &str, config: Value) -> CreateDeployment {
    let config: Map<String, Value> = match config {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    CreateDeployment {
        owner_id: OWNER.to_string(),
        credential_id: CREDENTIAL.to_string(),
        resource_kind: kind,
        resource_name: name.to_string(),
        config,
    }
}

/// Create an identity deployment and wait for it to complete
async fn completed_identity(harness: &Harness) -> String {
    harness.runner.respond("apply", ok(IDENTITY_OUTPUT));
    let ack = harness
        .infra
        .create(request(ResourceKind::Identity, "deploy-bot", json!({"path": "/ci/"})))
        .await
        .unwrap();
    harness.settle().await;
    assert_eq!(
        harness.deployment(&ack.deployment_id).await.status,
        DeploymentStatus::Completed
    );
    ack.deployment_id
}

#[tokio::test]
async fn test_create_applies_in_fresh_workspace() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;

    let deployment = harness.deployment(&id).await;
    let workspace_id = deployment.workspace_id.clone().unwrap();
    assert!(deployment.output.unwrap().contains("deploy-bot"));
    assert!(deployment.error_message.is_none());
    assert_eq!(harness.arena.state(&workspace_id), Some(WorkspaceState::Applied));

    let calls = harness.runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].args[0], "init");
    assert_eq!(calls[1].args[..2], ["apply".to_string(), "-auto-approve".to_string()]);
    let cwd = calls[1].cwd.clone().unwrap();
    assert!(cwd.ends_with(&workspace_id));
    assert!(cwd.join("main.tf").exists());
    let tfvars = std::fs::read_to_string(cwd.join("terraform.tfvars")).unwrap();
    assert!(tfvars.contains("\"deploy-bot\""));
    assert!(calls[1]
        .env
        .iter()
        .any(|(k, v)| k == "AWS_ACCESS_KEY_ID" && v == "AKIATEST"));

    let sent = harness.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].level, NotificationLevel::Success);
}

#[tokio::test]
async fn test_failed_apply_keeps_output_and_workspace() {
    let harness = Harness::new();
    harness
        .runner
        .respond("apply", failed("Error: creating IAM User: AccessDenied"));

    let ack = harness
        .infra
        .create(request(ResourceKind::Identity, "deploy-bot", json!({})))
        .await
        .unwrap();
    assert_eq!(ack.status, DeploymentStatus::Pending);
    harness.settle().await;

    let deployment = harness.deployment(&ack.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.workspace_id.is_some());
    assert!(deployment.error_message.unwrap().contains("AccessDenied"));
    assert!(deployment.output.unwrap().contains("AccessDenied"));
}

#[tokio::test]
async fn test_invalid_request_never_reaches_the_tool() {
    let harness = Harness::new();

    let err = harness
        .infra
        .create(request(
            ResourceKind::ComputeInstance,
            "vm",
            json!({"instance_type": "t3.micro", "root_volume_size": 4}),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, PilotError::Validation(_)));

    let err = harness
        .infra
        .create(request(ResourceKind::ObjectStore, "Not_A_Bucket", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, PilotError::Validation(_)));

    assert!(harness.runner.calls().is_empty());
    assert!(harness.deployments.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_credentials_are_rejected() {
    let harness = Harness::new();
    let mut req = request(ResourceKind::Identity, "deploy-bot", json!({}));
    req.credential_id = "missing".to_string();

    let err = harness.infra.create(req).await.unwrap_err();
    assert!(matches!(err, PilotError::Credential(_)));
    assert!(harness.runner.calls().is_empty());
}

#[tokio::test]
async fn test_destroy_releases_workspace() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;
    let workspace_id = harness.deployment(&id).await.workspace_id.unwrap();

    let ack = harness.infra.destroy(&id).await.unwrap();
    assert_eq!(ack.status, DeploymentStatus::Destroying);
    harness.settle().await;

    let deployment = harness.deployment(&id).await;
    assert_eq!(deployment.status, DeploymentStatus::Destroyed);
    assert_eq!(deployment.deleted_by, Some(DeletedBy::Ui));
    assert!(deployment.deleted_at.is_some());
    assert_eq!(harness.arena.state(&workspace_id), Some(WorkspaceState::Released));
    assert_eq!(harness.runner.count("destroy -auto-approve"), 1);
}

#[tokio::test]
async fn test_destroy_only_from_completed() {
    let harness = Harness::new();
    harness.runner.respond("apply", failed("boom"));
    let ack = harness
        .infra
        .create(request(ResourceKind::Identity, "deploy-bot", json!({})))
        .await
        .unwrap();
    harness.settle().await;

    let err = harness.infra.destroy(&ack.deployment_id).await.unwrap_err();
    assert!(matches!(err, PilotError::InvalidTransition(_)));
    assert_eq!(harness.runner.count("destroy"), 0);
}

#[tokio::test]
async fn test_destroy_without_workspace_is_a_client_error() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;
    harness
        .deployments
        .modify(
            &id,
            Box::new(|d: &mut Deployment| {
                d.workspace_id = None;
                Ok(())
            }),
        )
        .await
        .unwrap();

    let err = harness.infra.destroy(&id).await.unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(harness.runner.count("destroy"), 0);
    assert_eq!(harness.deployment(&id).await.status, DeploymentStatus::Completed);
}

#[tokio::test]
async fn test_drift_marks_deleted_externally() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;
    harness
        .cloud
        .users
        .lock()
        .unwrap()
        .insert("deploy-bot".to_string(), false);

    let deployment = harness.infra.sync_one(&id).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::DeletedExternally);
    assert_eq!(deployment.deleted_by, Some(DeletedBy::CloudConsole));
    assert!(deployment.deleted_at.is_some());
    assert!(harness
        .notifier
        .sent
        .lock()
        .unwrap()
        .iter()
        .any(|n| n.level == NotificationLevel::Warning));
}

#[tokio::test]
async fn test_existing_resource_only_stamps_sync_time() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;
    harness
        .cloud
        .users
        .lock()
        .unwrap()
        .insert("deploy-bot".to_string(), true);

    let summary = harness.infra.sync_all(Some(OWNER)).await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.drifted, 0);

    let deployment = harness.deployment(&id).await;
    assert_eq!(deployment.status, DeploymentStatus::Completed);
    assert!(deployment.last_synced_at.is_some());
    assert!(deployment.deleted_by.is_none());
}

#[tokio::test]
async fn test_unreachable_provider_is_not_drift() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;

    // No entry for the user: the fake provider is unreachable
    let err = harness.infra.sync_one(&id).await.unwrap_err();
    assert!(matches!(err, PilotError::Drift(_)));
    assert_eq!(harness.deployment(&id).await.status, DeploymentStatus::Completed);

    let summary = harness.infra.sync_all(None).await.unwrap();
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.drifted, 0);
}

#[tokio::test]
async fn test_delete_record_abandons_workspace() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;
    let workspace_id = harness.deployment(&id).await.workspace_id.unwrap();

    harness.infra.delete_record(&id).await.unwrap();
    assert!(matches!(
        harness.infra.get(&id).await,
        Err(PilotError::NotFound(_))
    ));
    assert_eq!(harness.arena.state(&workspace_id), Some(WorkspaceState::Abandoned));
}

#[tokio::test]
async fn test_recover_interrupted_fails_pending_records() {
    let harness = Harness::new();
    let id = completed_identity(&harness).await;
    harness
        .deployments
        .modify(
            &id,
            Box::new(|d: &mut Deployment| {
                d.status = DeploymentStatus::Destroying;
                Ok(())
            }),
        )
        .await
        .unwrap();

    assert_eq!(harness.infra.recover_interrupted().await.unwrap(), 1);
    let deployment = harness.deployment(&id).await;
    assert_eq!(deployment.status, DeploymentStatus::DestroyFailed);
    assert!(deployment.workspace_id.is_some());
}

#[tokio::test]
async fn test_delete_record_after_failed_apply_keeps_state() {
    let harness = Harness::new();
    harness
        .runner
        .respond("apply", failed("Error: creating IAM User: LimitExceeded"));
    let ack = harness
        .infra
        .create(request(ResourceKind::Identity, "deploy-bot", json!({})))
        .await
        .unwrap();
    harness.settle().await;

    let workspace_id = harness.deployment(&ack.deployment_id).await.workspace_id.unwrap();
    assert_eq!(harness.arena.state(&workspace_id), Some(WorkspaceState::ApplyFailed));

    harness.infra.delete_record(&ack.deployment_id).await.unwrap();
    assert_eq!(harness.arena.state(&workspace_id), Some(WorkspaceState::Abandoned));
    assert!(harness._tmp.path().join("workspaces").join(&workspace_id).exists());
}

#[tokio::test]
async fn test_ingress_rule_twice_reports_existing_rule() {
    let harness = Harness::new();
    harness.runner.respond_once("apply", ok("Apply complete!"));
    harness.runner.respond(
        "apply",
        failed("Error: InvalidPermission.Duplicate: the specified rule already exists"),
    );
    let creds = AwsCredentials::new("AKIATEST", "secret", "us-east-1");

    let first = harness
        .executor
        .apply_idempotent_rule("sg-123", 8080, &creds)
        .await;
    assert_eq!((first.success, first.already_exists), (true, false));

    let second = harness
        .executor
        .apply_idempotent_rule("sg-123", 8080, &creds)
        .await;
    assert_eq!((second.success, second.already_exists), (true, true));
    assert!(second.error.is_none());

    let workspaces: Vec<String> = harness
        .runner
        .calls()
        .iter()
        .filter(|c| c.args.first().map(String::as_str) == Some("apply"))
        .map(|c| {
            let cwd = c.cwd.clone().unwrap();
            cwd.file_name().unwrap().to_string_lossy().into_owned()
        })
        .collect();
    assert_eq!(workspaces.len(), 2);
    assert_eq!(harness.arena.state(&workspaces[0]), Some(WorkspaceState::Applied));
    assert_eq!(harness.arena.state(&workspaces[1]), Some(WorkspaceState::Released));
    assert!(!harness._tmp.path().join("workspaces").join(&workspaces[1]).exists());
}
