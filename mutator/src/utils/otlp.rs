//! OTLP attribute helpers
//!
//! Provides reusable functions for working with OTLP `KeyValue` attribute lists:
//! - Typed lookup and in-place mutation
//! - Scalar conversion for rule matching
//! - Shared attribute keys for context resolution

use std::collections::HashMap;

use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};

// ============================================================================
// SHARED ATTRIBUTE KEYS
// ============================================================================

/// Shared attribute keys (used by both traces and metrics)
pub mod keys {
    pub const DEPLOYMENT_ENV: &str = "deployment.environment";
    pub const DEPLOYMENT_ENV_NAME: &str = "deployment.environment.name";
    pub const NET_PEER_IP: &str = "net.peer.ip";
    pub const NET_SOCK_PEER_ADDR: &str = "net.sock.peer.addr";
    pub const SERVER_ADDRESS: &str = "server.address";
}

// ============================================================================
// LOOKUP
// ============================================================================

/// Find the value stored under `key` (last entry wins on duplicates)
pub fn get_attr<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a AnyValue> {
    attrs
        .iter()
        .rev()
        .find(|kv| kv.key == key)
        .and_then(|kv| kv.value.as_ref())
}

/// Find a string value stored under `key`
pub fn get_str<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a str> {
    match get_attr(attrs, key).and_then(|v| v.value.as_ref()) {
        Some(any_value::Value::StringValue(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Whether `key` is present with a value
pub fn has_attr(attrs: &[KeyValue], key: &str) -> bool {
    get_attr(attrs, key).is_some()
}

/// Extract environment from resource attributes
pub fn get_environment(resource_attrs: &[KeyValue]) -> Option<&str> {
    get_str(resource_attrs, keys::DEPLOYMENT_ENV)
        .or_else(|| get_str(resource_attrs, keys::DEPLOYMENT_ENV_NAME))
        .filter(|s| !s.is_empty())
}

// ============================================================================
// MUTATION
// ============================================================================

/// Build a string AnyValue
pub fn string_value(value: impl Into<String>) -> AnyValue {
    AnyValue {
        value: Some(any_value::Value::StringValue(value.into())),
    }
}

/// Create a KeyValue attribute holding a string
pub fn make_str_attr(key: &str, value: impl Into<String>) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(string_value(value)),
    }
}

/// Insert or overwrite `key` in place, keeping its position when present
pub fn set_attr(attrs: &mut Vec<KeyValue>, key: &str, value: AnyValue) {
    match attrs.iter_mut().rev().find(|kv| kv.key == key) {
        Some(kv) => kv.value = Some(value),
        None => attrs.push(KeyValue {
            key: key.to_string(),
            value: Some(value),
        }),
    }
}

/// Insert or overwrite a string value
pub fn set_str(attrs: &mut Vec<KeyValue>, key: &str, value: impl Into<String>) {
    set_attr(attrs, key, string_value(value));
}

// ============================================================================
// CONVERSION
// ============================================================================

/// Whether the value is a string/int/double/bool scalar
pub fn is_scalar(value: &AnyValue) -> bool {
    matches!(
        value.value,
        Some(
            any_value::Value::StringValue(_)
                | any_value::Value::BoolValue(_)
                | any_value::Value::IntValue(_)
                | any_value::Value::DoubleValue(_)
        )
    )
}

/// Convert AnyValue to string representation
pub fn any_value_to_string(value: &AnyValue) -> String {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::ArrayValue(arr)) => {
            let values: Vec<String> = arr.values.iter().map(any_value_to_string).collect();
            serde_json::to_string(&values).unwrap_or_default()
        }
        Some(any_value::Value::KvlistValue(kvlist)) => {
            let map: HashMap<String, String> = extract_attributes(&kvlist.values);
            serde_json::to_string(&map).unwrap_or_default()
        }
        Some(any_value::Value::BytesValue(b)) => hex::encode(b),
        None => String::new(),
    }
}

/// Extract attributes from KeyValue array into HashMap
pub fn extract_attributes(attrs: &[KeyValue]) -> HashMap<String, String> {
    attrs
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|v| (kv.key.clone(), any_value_to_string(v)))
        })
        .collect()
}
