//! Request validation
//!
//! Everything here runs before a record is persisted, so a rejected request
//! never allocates a workspace or invokes a tool.

use serde_json::{Map, Value};

use crate::errors::PilotError;
use crate::models::application::{AppSource, CreateApplication, Target};
use crate::models::deployment::{CreateDeployment, ResourceKind};

pub const MIN_ROOT_VOLUME_GB: u64 = 8;
pub const MAX_ROOT_VOLUME_GB: u64 = 16384;

const ALLOWED_CPU: [u32; 5] = [256, 512, 1024, 2048, 4096];
const MIN_MEMORY_MB: u32 = 512;

fn invalid(msg: impl Into<String>) -> PilotError {
    PilotError::Validation(msg.into())
}

/// Validate a deployment request for its resource kind
pub fn validate_deployment(request: &CreateDeployment) -> Result<(), PilotError> {
    if request.owner_id.trim().is_empty() {
        return Err(invalid("ownerId is required"));
    }
    if request.credential_id.trim().is_empty() {
        return Err(invalid("credentialId is required"));
    }
    if request.resource_name.trim().is_empty() {
        return Err(invalid("resourceName is required"));
    }

    let config = &request.config;
    match request.resource_kind {
        ResourceKind::ComputeInstance => validate_compute(config),
        ResourceKind::ObjectStore => {
            let name = optional_str(config, "bucket_name")?.unwrap_or(&request.resource_name);
            validate_bucket_name(name)?;
            optional_bool(config, "versioning")?;
            optional_bool(config, "force_destroy")?;
            Ok(())
        }
        ResourceKind::Identity => {
            let name = optional_str(config, "user_name")?.unwrap_or(&request.resource_name);
            validate_user_name(name)?;
            if let Some(path) = optional_str(config, "path")? {
                validate_identity_path(path)?;
            }
            optional_string_array(config, "policy_arns")?;
            Ok(())
        }
    }
}

fn validate_compute(config: &Map<String, Value>) -> Result<(), PilotError> {
    match optional_str(config, "instance_type")? {
        Some(t) if !t.trim().is_empty() => {}
        _ => return Err(invalid("instance_type is required for a compute instance")),
    }

    if let Some(size) = config.get("root_volume_size").filter(|v| !v.is_null()) {
        let size = size
            .as_u64()
            .ok_or_else(|| invalid("root_volume_size must be a whole number of GB"))?;
        if !(MIN_ROOT_VOLUME_GB..=MAX_ROOT_VOLUME_GB).contains(&size) {
            return Err(invalid(format!(
                "root_volume_size must be between {} and {} GB, got {}",
                MIN_ROOT_VOLUME_GB, MAX_ROOT_VOLUME_GB, size
            )));
        }
    }

    optional_str(config, "ami")?;
    optional_str(config, "key_name")?;
    optional_string_array(config, "security_group_ids")?;
    Ok(())
}

/// Object bucket naming rules
pub fn validate_bucket_name(name: &str) -> Result<(), PilotError> {
    let len = name.len();
    if !(3..=63).contains(&len) {
        return Err(invalid(format!(
            "bucket name must be 3-63 characters, got {}",
            len
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(invalid(
            "bucket name may only contain lowercase letters, digits, dots and hyphens",
        ));
    }

    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[len - 1]) {
        return Err(invalid("bucket name must start and end with a letter or digit"));
    }
    if name.contains("..") {
        return Err(invalid("bucket name must not contain consecutive dots"));
    }
    if name.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(invalid("bucket name must not be formatted as an IP address"));
    }
    if name.starts_with("xn--") {
        return Err(invalid("bucket name must not start with xn--"));
    }
    if name.ends_with("-s3alias") {
        return Err(invalid("bucket name must not end with -s3alias"));
    }
    Ok(())
}

/// Identity user naming rules
pub fn validate_user_name(name: &str) -> Result<(), PilotError> {
    if name.is_empty() || name.len() > 64 {
        return Err(invalid("user name must be 1-64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "+=,.@_-".contains(c))
    {
        return Err(invalid(
            "user name may only contain letters, digits and +=,.@_-",
        ));
    }
    Ok(())
}

fn validate_identity_path(path: &str) -> Result<(), PilotError> {
    if !path.starts_with('/') || !path.ends_with('/') {
        return Err(invalid("identity path must start and end with /"));
    }
    Ok(())
}

/// Validate an application request
pub fn validate_application(request: &CreateApplication) -> Result<(), PilotError> {
    if request.owner_id.trim().is_empty() {
        return Err(invalid("ownerId is required"));
    }
    if request.credential_id.trim().is_empty() {
        return Err(invalid("credentialId is required"));
    }
    if request.name.trim().is_empty() {
        return Err(invalid("name is required"));
    }

    let runtime = &request.runtime;
    if runtime.port == 0 {
        return Err(invalid("port must be between 1 and 65535"));
    }
    if !ALLOWED_CPU.contains(&runtime.cpu) {
        return Err(invalid(format!(
            "cpu must be one of {:?}, got {}",
            ALLOWED_CPU, runtime.cpu
        )));
    }
    if runtime.memory < MIN_MEMORY_MB {
        return Err(invalid(format!(
            "memory must be at least {} MiB",
            MIN_MEMORY_MB
        )));
    }
    for key in runtime.env.keys() {
        if key.is_empty()
            || key.starts_with(|c: char| c.is_ascii_digit())
            || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(invalid(format!("invalid environment variable name '{}'", key)));
        }
    }

    match &request.source {
        AppSource::Repository(repo) => {
            let url = repo.url.trim();
            if !(url.starts_with("https://") || url.starts_with("http://") || url.starts_with("git@"))
            {
                return Err(invalid("repository url must be http(s) or git@"));
            }
            if repo.branch.trim().is_empty() || repo.branch.starts_with('-') {
                return Err(invalid("branch name is invalid"));
            }
        }
        AppSource::Image(image) => {
            if image.image.trim().is_empty() || image.image.contains(char::is_whitespace) {
                return Err(invalid("image reference is invalid"));
            }
        }
    }

    if let Target::VirtualMachine { instance_id, .. } = &request.target {
        if instance_id.trim().is_empty() {
            return Err(invalid("a virtual machine target requires an instance id"));
        }
    }
    Ok(())
}

fn optional_str<'a>(config: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>, PilotError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(invalid(format!("{} must be a string", key))),
    }
}

fn optional_bool(config: &Map<String, Value>, key: &str) -> Result<(), PilotError> {
    match config.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(_)) => Ok(()),
        Some(_) => Err(invalid(format!("{} must be a boolean", key))),
    }
}

fn optional_string_array(config: &Map<String, Value>, key: &str) -> Result<(), PilotError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => Ok(()),
        Some(_) => Err(invalid(format!("{} must be an array of strings", key))),
    }
}
