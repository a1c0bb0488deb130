//! Content versions for bundles and per-type item sets.
//!
//! Each named resource is serialized on its own into canonical JSON (object keys sorted),
//! the results are gathered into a sorted `type -> name -> serialized` map and that map is
//! hashed. Insertion order of resources or of keys inside payloads never changes the output.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::ResourceBundle;

const VERSION_LEN: usize = 16;

/// Version of a whole bundle. Short and URL-safe.
pub fn hash_bundle(bundle: &ResourceBundle) -> String {
    let mut canon: BTreeMap<&str, BTreeMap<&str, String>> = BTreeMap::new();
    for (rt, items) in bundle.iter() {
        if items.is_empty() { continue; }
        canon.insert(rt.as_str(), serialize_items(items));
    }
    digest(&canon)
}

/// Version of a single type's item set.
pub fn hash_items(items: &BTreeMap<String, serde_json::Value>) -> String {
    digest(&serialize_items(items))
}

fn serialize_items(items: &BTreeMap<String, serde_json::Value>) -> BTreeMap<&str, String> {
    items
        .iter()
        .map(|(name, v)| {
            let mut out = String::new();
            canonical_json(v, &mut out);
            (name.as_str(), out)
        })
        .collect()
}

fn digest<T: serde::Serialize>(canon: &T) -> String {
    // BTreeMaps of strings always serialize
    let bytes = serde_json::to_vec(canon).unwrap_or_default();
    let sum = Sha256::digest(&bytes);
    let mut s = URL_SAFE_NO_PAD.encode(sum);
    s.truncate(VERSION_LEN);
    s
}

/// Write `v` as JSON with object keys in sorted order, regardless of map backing.
pub fn canonical_json(v: &serde_json::Value, out: &mut String) {
    use serde_json::Value as Json;
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 { out.push(','); }
                out.push_str(&Json::String((*k).clone()).to_string());
                out.push(':');
                canonical_json(&map[*k], out);
            }
            out.push('}');
        }
        Json::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 { out.push(','); }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
