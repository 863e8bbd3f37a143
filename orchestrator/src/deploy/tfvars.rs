//! Variable file rendering
//!
//! One `key = value` line per variable, keys in sorted order. Strings are
//! quoted, numbers and booleans are bare, arrays and objects are JSON, and
//! nulls are omitted.

use serde_json::{Map, Value};

pub const VARIABLE_FILE: &str = "terraform.tfvars";

/// Render a single value
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // JSON string escaping is a valid HCL quoted string
        Value::String(_) | Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Render the whole variable file
pub fn render(vars: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = vars.keys().collect();
    keys.sort();

    let mut out = String::new();
    for key in keys {
        if let Some(rendered) = render_value(&vars[key]) {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(&rendered);
            out.push('\n');
        }
    }
    out
}
