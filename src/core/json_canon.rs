//! Canonical JSON encoding.
//!
//! Checksums must not depend on the order a caller happened to build a
//! payload in, so objects are re-emitted with keys sorted bytewise at every
//! depth. Arrays keep their order. The initial encoding pass rejects values
//! JSON cannot carry faithfully: non-finite floats and non-string map keys.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonJsonError {
    #[error("value does not encode as canonical json: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serialize `value` to canonical JSON bytes.
pub fn to_canon_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonJsonError> {
    let probe = serde_json::to_vec(value).map_err(CanonJsonError::Encode)?;
    let parsed: Value = serde_json::from_slice(&probe).map_err(CanonJsonError::Encode)?;
    serde_json::to_vec(&canon_value(parsed)).map_err(CanonJsonError::Encode)
}

fn canon_value(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canon_value).collect()),
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (key, val) in entries {
                out.insert(key, canon_value(val));
            }
            Value::Object(out)
        }
        other => other,
    }
}
