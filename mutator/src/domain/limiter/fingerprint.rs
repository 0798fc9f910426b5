//! Series fingerprinting
//!
//! A series is identified by its attribute set, independent of attribute
//! order. The digest covers key-sorted `(key, typed value)` pairs so that
//! `"200"` and `200` are different series.

use std::collections::BTreeMap;

use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};

pub type Fingerprint = u128;

const TAG_NONE: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_KVLIST: u8 = 7;

/// 128-bit digest of an attribute set. Duplicate keys: last entry wins.
pub fn fingerprint(attrs: &[KeyValue]) -> Fingerprint {
    let sorted: BTreeMap<&str, Option<&AnyValue>> = attrs
        .iter()
        .map(|kv| (kv.key.as_str(), kv.value.as_ref()))
        .collect();

    let mut hasher = blake3::Hasher::new();
    for (key, value) in sorted {
        write_bytes(&mut hasher, key.as_bytes());
        write_value(&mut hasher, value);
    }

    let digest = hasher.finalize();
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&digest.as_bytes()[..16]);
    u128::from_le_bytes(truncated)
}

/// Length-prefixed so adjacent fields cannot run together
fn write_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn write_value(hasher: &mut blake3::Hasher, value: Option<&AnyValue>) {
    match value.and_then(|v| v.value.as_ref()) {
        None => {
            hasher.update(&[TAG_NONE]);
        }
        Some(any_value::Value::StringValue(s)) => {
            hasher.update(&[TAG_STRING]);
            write_bytes(hasher, s.as_bytes());
        }
        Some(any_value::Value::BoolValue(b)) => {
            hasher.update(&[TAG_BOOL, u8::from(*b)]);
        }
        Some(any_value::Value::IntValue(i)) => {
            hasher.update(&[TAG_INT]);
            hasher.update(&i.to_le_bytes());
        }
        Some(any_value::Value::DoubleValue(d)) => {
            hasher.update(&[TAG_DOUBLE]);
            hasher.update(&d.to_bits().to_le_bytes());
        }
        Some(any_value::Value::BytesValue(b)) => {
            hasher.update(&[TAG_BYTES]);
            write_bytes(hasher, b);
        }
        Some(any_value::Value::ArrayValue(array)) => {
            hasher.update(&[TAG_ARRAY]);
            hasher.update(&(array.values.len() as u64).to_le_bytes());
            for item in &array.values {
                write_value(hasher, Some(item));
            }
        }
        Some(any_value::Value::KvlistValue(list)) => {
            hasher.update(&[TAG_KVLIST]);
            hasher.update(&(list.values.len() as u64).to_le_bytes());
            for kv in &list.values {
                write_bytes(hasher, kv.key.as_bytes());
                write_value(hasher, kv.value.as_ref());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::otlp::make_str_attr;

    fn int_attr(key: &str, value: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::IntValue(value)),
            }),
        }
    }

    #[test]
    fn test_order_independent() {
        let a = vec![make_str_attr("service", "checkout"), make_str_attr("op", "GET")];
        let b = vec![make_str_attr("op", "GET"), make_str_attr("service", "checkout")];
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_value_type_matters() {
        let s = vec![make_str_attr("status", "200")];
        let i = vec![int_attr("status", 200)];
        assert_ne!(fingerprint(&s), fingerprint(&i));
    }

    #[test]
    fn test_key_value_boundaries() {
        let a = vec![make_str_attr("ab", "c")];
        let b = vec![make_str_attr("a", "bc")];
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_different_values_differ() {
        let a = vec![make_str_attr("service", "checkout")];
        let b = vec![make_str_attr("service", "cart")];
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&[]));
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        let dup = vec![make_str_attr("k", "old"), make_str_attr("k", "new")];
        let single = vec![make_str_attr("k", "new")];
        assert_eq!(fingerprint(&dup), fingerprint(&single));
    }

    #[test]
    fn test_deterministic() {
        let attrs = vec![make_str_attr("service", "checkout"), int_attr("code", 500)];
        assert_eq!(fingerprint(&attrs), fingerprint(&attrs.clone()));
    }
}
