//! [`CloudApi`] implemented with the `aws` command line tool

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cloud::{
    CloudApi, CommandInvocation, CommandState, InstanceDescription, RegistryAuth, ResourceProbe,
    TaskDefinitionSpec,
};
use crate::errors::PilotError;
use crate::models::credentials::AwsCredentials;
use crate::process::{CommandRunner, CommandSpec, ProcessOutput};

const CREDENTIAL_MARKERS: &[&str] = &[
    "InvalidClientTokenId",
    "SignatureDoesNotMatch",
    "AuthFailure",
    "UnrecognizedClientException",
    "InvalidAccessKeyId",
    "ExpiredToken",
    "Unable to locate credentials",
];

const NETWORK_MARKERS: &[&str] = &[
    "Could not connect to the endpoint URL",
    "Connect timeout",
    "Read timeout",
    "EndpointConnectionError",
    "Connection was closed",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "NotFound",
    "NoSuchEntity",
    "NoSuchBucket",
    "(404)",
    "Not Found",
    "RepositoryNotFoundException",
    "ClusterNotFoundException",
    "ServiceNotFoundException",
];

/// Map CLI stderr onto the error taxonomy
pub fn classify_cli_error(stderr: &str) -> PilotError {
    let message = stderr.trim().to_string();
    if CREDENTIAL_MARKERS.iter().any(|m| stderr.contains(m)) {
        PilotError::Credential(message)
    } else if NETWORK_MARKERS.iter().any(|m| stderr.contains(m)) {
        PilotError::Network(message)
    } else {
        PilotError::Cloud(message)
    }
}

pub fn is_not_found(stderr: &str) -> bool {
    NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
}

/// Cloud API client driving the `aws` CLI
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, creds: &AwsCredentials, args: &[&str]) -> Result<ProcessOutput, PilotError> {
        self.run_with_input(creds, args, None).await
    }

    /// `input` is fed on stdin so secrets stay out of the argument list
    async fn run_with_input(
        &self,
        creds: &AwsCredentials,
        args: &[&str],
        input: Option<Vec<u8>>,
    ) -> Result<ProcessOutput, PilotError> {
        let mut spec = CommandSpec::new(&self.binary)
            .args(args.iter().copied())
            .args(["--output", "json", "--region", creds.region.as_str()])
            .envs(creds.env_vars())
            .timeout(self.timeout);
        if let Some(input) = input {
            spec = spec.stdin(input);
        }
        debug!("aws {}", args.iter().take(2).copied().collect::<Vec<_>>().join(" "));

        self.runner.run(&spec).await.map_err(|e| match e {
            PilotError::Timeout(msg) => PilotError::Network(msg),
            other => other,
        })
    }

    /// Run and parse JSON output; failures are classified
    async fn call(&self, creds: &AwsCredentials, args: &[&str]) -> Result<Value, PilotError> {
        let output = self.run(creds, args).await?;
        if !output.success() {
            return Err(classify_cli_error(&output.stderr));
        }
        parse_json(&output.stdout)
    }
}

/// `put-parameter` input document for a SecureString
pub fn secure_parameter_input(name: &str, value: &SecretString) -> Value {
    json!({
        "Name": name,
        "Value": value.expose_secret(),
        "Type": "SecureString",
        "Overwrite": true,
    })
}

fn parse_json(stdout: &str) -> Result<Value, PilotError> {
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(stdout)?)
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn required_str(value: &Value, pointer: &str) -> Result<String, PilotError> {
    str_at(value, pointer)
        .map(str::to_string)
        .ok_or_else(|| PilotError::Cloud(format!("unexpected provider response: missing {}", pointer)))
}

/// Parse the first instance of a `describe-instances` response
pub fn parse_instance(value: &Value) -> Option<InstanceDescription> {
    let instance = value.pointer("/Reservations/0/Instances/0")?;
    Some(InstanceDescription {
        instance_id: str_at(instance, "/InstanceId")?.to_string(),
        state: str_at(instance, "/State/Name").unwrap_or("unknown").to_string(),
        public_ip: str_at(instance, "/PublicIpAddress").map(str::to_string),
        private_ip: str_at(instance, "/PrivateIpAddress").map(str::to_string),
        security_group_ids: instance
            .get("SecurityGroups")
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| str_at(g, "/GroupId").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Decode a registry authorization token (`base64(user:password)`)
pub fn decode_registry_token(token: &str, endpoint: &str) -> Result<RegistryAuth, PilotError> {
    let decoded = BASE64
        .decode(token.trim())
        .map_err(|e| PilotError::Cloud(format!("invalid registry token: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| PilotError::Cloud(format!("invalid registry token: {}", e)))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| PilotError::Cloud("registry token has no separator".to_string()))?;

    Ok(RegistryAuth {
        username: username.to_string(),
        password: SecretString::from(password.to_string()),
        endpoint: endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string(),
    })
}

/// Task definition request body
pub fn task_definition_input(spec: &TaskDefinitionSpec) -> Value {
    let environment: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "family": spec.family,
        "networkMode": "awsvpc",
        "requiresCompatibilities": ["FARGATE"],
        "cpu": spec.cpu.to_string(),
        "memory": spec.memory.to_string(),
        "executionRoleArn": spec.execution_role_arn,
        "containerDefinitions": [{
            "name": spec.container_name,
            "image": spec.image,
            "essential": true,
            "portMappings": [{
                "containerPort": spec.port,
                "hostPort": spec.port,
                "protocol": "tcp"
            }],
            "environment": environment,
            "logConfiguration": {
                "logDriver": "awslogs",
                "options": {
                    "awslogs-group": spec.log_group,
                    "awslogs-region": spec.region,
                    "awslogs-stream-prefix": "ecs",
                    "awslogs-create-group": "true"
                }
            }
        }]
    })
}

#[async_trait]
impl CloudApi for AwsCli {
    async fn describe_instance(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>, PilotError> {
        let output = self
            .run(creds, &["ec2", "describe-instances", "--instance-ids", instance_id])
            .await?;
        if !output.success() {
            if is_not_found(&output.stderr) {
                return Ok(None);
            }
            return Err(classify_cli_error(&output.stderr));
        }
        Ok(parse_instance(&parse_json(&output.stdout)?))
    }

    async fn probe_bucket(
        &self,
        creds: &AwsCredentials,
        bucket: &str,
    ) -> Result<ResourceProbe, PilotError> {
        let output = self.run(creds, &["s3api", "head-bucket", "--bucket", bucket]).await?;
        if output.success() {
            return Ok(ResourceProbe::present());
        }
        if is_not_found(&output.stderr) {
            return Ok(ResourceProbe::absent(output.stderr.trim()));
        }
        if output.stderr.contains("(403)") {
            // Bucket exists but these credentials may not read it
            return Ok(ResourceProbe {
                exists: true,
                detail: Some(output.stderr.trim().to_string()),
            });
        }
        Err(classify_cli_error(&output.stderr))
    }

    async fn probe_user(
        &self,
        creds: &AwsCredentials,
        user_name: &str,
    ) -> Result<ResourceProbe, PilotError> {
        let output = self.run(creds, &["iam", "get-user", "--user-name", user_name]).await?;
        if output.success() {
            return Ok(ResourceProbe::present());
        }
        if is_not_found(&output.stderr) {
            return Ok(ResourceProbe::absent(output.stderr.trim()));
        }
        Err(classify_cli_error(&output.stderr))
    }

    async fn account_id(&self, creds: &AwsCredentials) -> Result<String, PilotError> {
        let value = self.call(creds, &["sts", "get-caller-identity"]).await?;
        required_str(&value, "/Account")
    }

    async fn ensure_repository(
        &self,
        creds: &AwsCredentials,
        name: &str,
    ) -> Result<String, PilotError> {
        let output = self
            .run(creds, &["ecr", "describe-repositories", "--repository-names", name])
            .await?;
        if output.success() {
            return required_str(&parse_json(&output.stdout)?, "/repositories/0/repositoryUri");
        }
        if !is_not_found(&output.stderr) {
            return Err(classify_cli_error(&output.stderr));
        }

        info!("Creating registry repository {}", name);
        let created = self
            .call(
                creds,
                &[
                    "ecr",
                    "create-repository",
                    "--repository-name",
                    name,
                    "--image-scanning-configuration",
                    "scanOnPush=true",
                ],
            )
            .await?;
        required_str(&created, "/repository/repositoryUri")
    }

    async fn registry_auth(&self, creds: &AwsCredentials) -> Result<RegistryAuth, PilotError> {
        let value = self.call(creds, &["ecr", "get-authorization-token"]).await?;
        let token = required_str(&value, "/authorizationData/0/authorizationToken")?;
        let endpoint = required_str(&value, "/authorizationData/0/proxyEndpoint")?;
        decode_registry_token(&token, &endpoint)
    }

    async fn ensure_cluster(&self, creds: &AwsCredentials, name: &str) -> Result<(), PilotError> {
        let value = self.call(creds, &["ecs", "describe-clusters", "--clusters", name]).await?;
        if str_at(&value, "/clusters/0/status") == Some("ACTIVE") {
            return Ok(());
        }

        info!("Creating cluster {}", name);
        self.call(creds, &["ecs", "create-cluster", "--cluster-name", name])
            .await?;
        Ok(())
    }

    async fn register_task_definition(
        &self,
        creds: &AwsCredentials,
        spec: &TaskDefinitionSpec,
    ) -> Result<String, PilotError> {
        let input = task_definition_input(spec).to_string();
        let value = self
            .call(creds, &["ecs", "register-task-definition", "--cli-input-json", &input])
            .await?;
        required_str(&value, "/taskDefinition/taskDefinitionArn")
    }

    async fn scale_service(
        &self,
        creds: &AwsCredentials,
        cluster: &str,
        service: &str,
        desired_count: u32,
    ) -> Result<(), PilotError> {
        let count = desired_count.to_string();
        let output = self
            .run(
                creds,
                &[
                    "ecs",
                    "update-service",
                    "--cluster",
                    cluster,
                    "--service",
                    service,
                    "--desired-count",
                    &count,
                ],
            )
            .await?;
        if output.success() {
            return Ok(());
        }
        if is_not_found(&output.stderr) {
            return Err(PilotError::NotFound(format!(
                "service {} in cluster {}",
                service, cluster
            )));
        }
        Err(classify_cli_error(&output.stderr))
    }

    async fn remote_agent_status(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
    ) -> Result<Option<String>, PilotError> {
        let filter = format!("Key=InstanceIds,Values={}", instance_id);
        let value = self
            .call(creds, &["ssm", "describe-instance-information", "--filters", &filter])
            .await?;
        Ok(str_at(&value, "/InstanceInformationList/0/PingStatus").map(str::to_string))
    }

    async fn send_command(
        &self,
        creds: &AwsCredentials,
        instance_id: &str,
        commands: &[String],
        comment: &str,
    ) -> Result<String, PilotError> {
        let parameters = json!({ "commands": commands }).to_string();
        let value = self
            .call(
                creds,
                &[
                    "ssm",
                    "send-command",
                    "--instance-ids",
                    instance_id,
                    "--document-name",
                    "AWS-RunShellScript",
                    "--comment",
                    comment,
                    "--parameters",
                    &parameters,
                ],
            )
            .await?;
        required_str(&value, "/Command/CommandId")
    }

    async fn command_invocation(
        &self,
        creds: &AwsCredentials,
        command_id: &str,
        instance_id: &str,
    ) -> Result<CommandInvocation, PilotError> {
        let output = self
            .run(
                creds,
                &[
                    "ssm",
                    "get-command-invocation",
                    "--command-id",
                    command_id,
                    "--instance-id",
                    instance_id,
                ],
            )
            .await?;
        if !output.success() {
            // The invocation is not visible for a moment after send-command
            if output.stderr.contains("InvocationDoesNotExist") {
                return Ok(CommandInvocation {
                    state: CommandState::Pending,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            return Err(classify_cli_error(&output.stderr));
        }

        let value = parse_json(&output.stdout)?;
        Ok(CommandInvocation {
            state: CommandState::parse(str_at(&value, "/Status").unwrap_or("Failed")),
            stdout: str_at(&value, "/StandardOutputContent").unwrap_or_default().to_string(),
            stderr: str_at(&value, "/StandardErrorContent").unwrap_or_default().to_string(),
        })
    }

    async fn put_secure_parameter(
        &self,
        creds: &AwsCredentials,
        name: &str,
        value: &SecretString,
    ) -> Result<(), PilotError> {
        let input = secure_parameter_input(name, value).to_string();
        let output = self
            .run_with_input(
                creds,
                &["ssm", "put-parameter", "--cli-input-json", "file:///dev/stdin"],
                Some(input.into_bytes()),
            )
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(classify_cli_error(&output.stderr))
        }
    }

    async fn delete_parameter(&self, creds: &AwsCredentials, name: &str) -> Result<(), PilotError> {
        let output = self
            .run(creds, &["ssm", "delete-parameter", "--name", name])
            .await?;
        if output.success() || is_not_found(&output.stderr) {
            Ok(())
        } else {
            Err(classify_cli_error(&output.stderr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_classify_cli_error() {
        assert!(matches!(
            classify_cli_error("An error occurred (InvalidClientTokenId) when calling ..."),
            PilotError::Credential(_)
        ));
        assert!(matches!(
            classify_cli_error("Could not connect to the endpoint URL: \"https://ec2...\""),
            PilotError::Network(_)
        ));
        assert!(matches!(
            classify_cli_error("An error occurred (Throttling)"),
            PilotError::Cloud(_)
        ));
    }

    #[test]
    fn test_parse_instance() {
        let value = json!({
            "Reservations": [{
                "Instances": [{
                    "InstanceId": "i-0abc",
                    "State": { "Name": "running" },
                    "PublicIpAddress": "3.3.3.3",
                    "PrivateIpAddress": "10.0.0.4",
                    "SecurityGroups": [{ "GroupId": "sg-1" }, { "GroupId": "sg-2" }]
                }]
            }]
        });
        let instance = parse_instance(&value).unwrap();
        assert_eq!(instance.instance_id, "i-0abc");
        assert_eq!(instance.public_ip.as_deref(), Some("3.3.3.3"));
        assert_eq!(instance.security_group_ids, vec!["sg-1", "sg-2"]);

        assert!(parse_instance(&json!({ "Reservations": [] })).is_none());
    }

    #[test]
    fn test_decode_registry_token() {
        let token = BASE64.encode("AWS:pa:ss");
        let auth =
            decode_registry_token(&token, "https://123.dkr.ecr.us-east-1.amazonaws.com").unwrap();
        assert_eq!(auth.username, "AWS");
        assert_eq!(auth.password.expose_secret(), "pa:ss");
        assert_eq!(auth.endpoint, "123.dkr.ecr.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_task_definition_input() {
        let mut env = BTreeMap::new();
        env.insert("MODE".to_string(), "prod".to_string());
        let spec = TaskDefinitionSpec {
            family: "web".to_string(),
            container_name: "web".to_string(),
            image: "repo/web:abc".to_string(),
            cpu: 256,
            memory: 512,
            port: 3000,
            env,
            log_group: "/stackpilot/web".to_string(),
            region: "us-east-1".to_string(),
            execution_role_arn: "arn:aws:iam::1:role/exec".to_string(),
        };
        let input = task_definition_input(&spec);
        assert_eq!(input["cpu"], "256");
        let container = &input["containerDefinitions"][0];
        assert_eq!(container["portMappings"][0]["containerPort"], 3000);
        assert_eq!(container["environment"][0]["name"], "MODE");
        assert_eq!(container["logConfiguration"]["logDriver"], "awslogs");
    }

    #[test]
    fn test_secure_parameter_input() {
        let token = SecretString::from("ghp_abc".to_string());
        let input = secure_parameter_input("/stackpilot/a/source-token", &token);
        assert_eq!(input["Type"], "SecureString");
        assert_eq!(input["Value"], "ghp_abc");
        assert_eq!(input["Overwrite"], true);
    }
}
