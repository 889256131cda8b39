//! BLAKE3 fingerprints over canonically-encoded attribute maps.
//!
//! Map keys are hashed in sorted order so two declarations that differ only
//! in key order produce the same fingerprint. Returns `"blake3:{hex}"`.

use super::types::{AttributeMap, Value};

/// Fingerprint a resource's (resolved) attributes.
pub fn fingerprint(attributes: &AttributeMap) -> String {
    let mut hasher = blake3::Hasher::new();
    update_map(&mut hasher, attributes);
    format!("blake3:{}", hasher.finalize().to_hex())
}

fn update_map(hasher: &mut blake3::Hasher, map: &AttributeMap) {
    hasher.update(b"m");
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
        update_value(hasher, &map[key.as_str()]);
    }
}

fn update_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Reference { target } => {
            hasher.update(b"r");
            hasher.update(target.to_string().as_bytes());
            hasher.update(b"\0");
        }
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update(&[u8::from(*b)]);
        }
        Value::Integer(i) => {
            hasher.update(b"i");
            hasher.update(&i.to_le_bytes());
        }
        Value::Float(f) => {
            hasher.update(b"f");
            hasher.update(&f.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.as_bytes());
            hasher.update(b"\0");
        }
        Value::List(items) => {
            hasher.update(b"l");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                update_value(hasher, item);
            }
        }
        Value::Map(map) => update_map(hasher, map),
    }
}
