//! Hashing System - SHA-256 for Run Manifests
//!
//! Identical layer inputs hash identically, so two runs can be checked for
//! having drawn from the same catalog.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

use crate::catalog::Layer;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => {
            Value::Array(arr.iter().map(sort_value).collect())
        }
        _ => v.clone()
    }
}

/// Compute manifest hash for a run
pub fn compute_manifest_hash<T: Serialize>(manifest: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(manifest)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

#[derive(Serialize)]
struct CatalogEntry<'a> {
    layer: &'a str,
    trait_type: &'a str,
    file: &'a str,
    value: &'a str,
    weight: u32,
}

/// catalog_hash = sha256(canonical [layer, trait_type, file, value, weight]*)
///
/// Paths are left out so the same layers hash the same wherever they live.
pub fn compute_catalog_hash(layers: &[Layer]) -> Result<String, serde_json::Error> {
    let entries: Vec<_> = layers
        .iter()
        .flat_map(|layer| {
            layer.images.iter().map(move |image| CatalogEntry {
                layer: &layer.name,
                trait_type: &layer.trait_type,
                file: &image.name,
                value: &image.attribute.value,
                weight: image.attribute.weight,
            })
        })
        .collect();
    compute_manifest_hash(&entries)
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
