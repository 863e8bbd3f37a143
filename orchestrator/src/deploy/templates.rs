//! Embedded IaC templates and their variables

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::models::deployment::ResourceKind;

const COMPUTE_INSTANCE_TF: &str = include_str!("../../templates/compute_instance.tf");
const OBJECT_STORE_TF: &str = include_str!("../../templates/object_store.tf");
const IDENTITY_TF: &str = include_str!("../../templates/identity.tf");
const INGRESS_RULE_TF: &str = include_str!("../../templates/ingress_rule.tf");

/// What a workspace provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    Resource(ResourceKind),

    /// Ingress rule on an existing security group
    IngressRule,
}

impl Template {
    /// Terraform source of the template
    pub fn source(&self) -> &'static str {
        match self {
            Template::Resource(ResourceKind::ComputeInstance) => COMPUTE_INSTANCE_TF,
            Template::Resource(ResourceKind::ObjectStore) => OBJECT_STORE_TF,
            Template::Resource(ResourceKind::Identity) => IDENTITY_TF,
            Template::IngressRule => INGRESS_RULE_TF,
        }
    }

    /// Variables the template declares, with their defaults (`null` = required)
    fn declared(&self) -> Value {
        match self {
            Template::Resource(ResourceKind::ComputeInstance) => json!({
                "name": null,
                "instance_type": null,
                "ami": "",
                "root_volume_size": 8,
                "key_name": "",
                "security_group_ids": [],
                "tags": {},
            }),
            Template::Resource(ResourceKind::ObjectStore) => json!({
                "bucket_name": null,
                "versioning": false,
                "force_destroy": true,
                "tags": {},
            }),
            Template::Resource(ResourceKind::Identity) => json!({
                "user_name": null,
                "path": "/",
                "policy_arns": [],
                "tags": {},
            }),
            Template::IngressRule => json!({
                "security_group_id": null,
                "port": null,
                "protocol": "tcp",
                "cidr_blocks": ["0.0.0.0/0"],
            }),
        }
    }

    /// Output that names the created resource
    pub fn identifier_output(&self) -> &'static str {
        match self {
            Template::Resource(ResourceKind::ComputeInstance) => "instance_id",
            Template::Resource(ResourceKind::ObjectStore) => "bucket_name",
            Template::Resource(ResourceKind::Identity) => "user_name",
            Template::IngressRule => "rule_id",
        }
    }
}

/// Key of the config entry that carries the resource's own name
pub fn name_variable(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::ComputeInstance => "name",
        ResourceKind::ObjectStore => "bucket_name",
        ResourceKind::Identity => "user_name",
    }
}

/// Merge defaults, the resource name and user config into the template's
/// variable set. Keys the template does not declare are dropped.
pub fn build_variables(
    template: Template,
    resource_name: Option<&str>,
    config: &Map<String, Value>,
    region: &str,
) -> Map<String, Value> {
    let mut vars = match template.declared() {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if let (Template::Resource(kind), Some(name)) = (template, resource_name) {
        vars.insert(name_variable(kind).to_string(), Value::String(name.to_string()));
    }

    for (key, value) in config {
        if vars.contains_key(key) && !value.is_null() {
            vars.insert(key.clone(), value.clone());
        }
    }

    vars.insert("region".to_string(), Value::String(region.to_string()));
    vars
}
