//! Deterministic content hashes.
//!
//! Two values with the same canonical JSON (sorted keys, no whitespace)
//! always hash to the same fingerprint, regardless of field order.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Truncated SHA-256 over canonical JSON, rendered `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash a JSON value. Object key order does not matter.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let digest = Sha256::digest(canonical.as_bytes());
        // 128 bits is plenty for grouping configs
        Self(format!("sha256:{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render JSON with object keys sorted.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| {
                    // serde_json escapes keys the same way it escapes strings
                    let key = serde_json::Value::String((*k).clone()).to_string();
                    format!("{key}:{}", canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        scalar => scalar.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = serde_json::json!({"numNodes": 3, "version": "1.30", "rbac": true});
        let b = serde_json::json!({"rbac": true, "version": "1.30", "numNodes": 3});
        assert_eq!(Fingerprint::from_json(&a), Fingerprint::from_json(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_values() {
        let a = serde_json::json!({"numNodes": 3});
        let b = serde_json::json!({"numNodes": 4});
        assert_ne!(Fingerprint::from_json(&a), Fingerprint::from_json(&b));
    }

    #[test]
    fn test_fingerprint_nested_and_escaped() {
        let a = serde_json::json!({"outer": {"b": [1, 2], "a": "x\"y"}});
        let b = serde_json::json!({"outer": {"a": "x\"y", "b": [1, 2]}});
        let fp = Fingerprint::from_json(&a);
        assert_eq!(fp, Fingerprint::from_json(&b));
        assert!(fp.as_str().starts_with("sha256:"));
        assert_eq!(fp.as_str().len(), "sha256:".len() + 32);
    }
}
