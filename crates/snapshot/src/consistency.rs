//! Cross-type reference check for snapshots.
//!
//! Payloads are opaque JSON, so references are found by key name at any depth:
//!
//! | source types            | key                        | must name a   |
//! |-------------------------|----------------------------|---------------|
//! | Listener                | `route_config_name`        | Route         |
//! | Listener                | `scoped_routes_name`       | ScopedRoute   |
//! | ScopedRoute             | `route_configuration_name` | Route         |
//! | Route, Listener         | `cluster`                  | Endpoint (*)  |
//!
//! (*) only enforced when the snapshot carries Endpoint resources.

use std::collections::BTreeSet;

use keel_core::{KeelError, KeelResult, ResourceType};

use crate::Snapshot;

const RULES: &[(ResourceType, &str, ResourceType)] = &[
    (ResourceType::Listener, "route_config_name", ResourceType::Route),
    (ResourceType::Listener, "scoped_routes_name", ResourceType::ScopedRoute),
    (ResourceType::ScopedRoute, "route_configuration_name", ResourceType::Route),
    (ResourceType::Route, "cluster", ResourceType::Endpoint),
    (ResourceType::Listener, "cluster", ResourceType::Endpoint),
];

/// Validate that no resource references a name absent from the snapshot.
pub fn consistent(snap: &Snapshot) -> KeelResult<()> {
    let mut missing: Vec<String> = Vec::new();
    let endpoints_present = snap.items(ResourceType::Endpoint).map(|m| !m.is_empty()).unwrap_or(false);
    for (source, key, target) in RULES {
        if *target == ResourceType::Endpoint && !endpoints_present {
            continue;
        }
        let Some(sources) = snap.items(*source) else { continue };
        let targets = snap.items(*target);
        for (name, payload) in sources.iter() {
            let mut refs = BTreeSet::new();
            collect_refs(payload, key, &mut refs);
            for r in refs {
                if !targets.map(|t| t.contains_key(&r)).unwrap_or(false) {
                    missing.push(format!("{} {} references {} {}", source, name, target, r));
                }
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(KeelError::Inconsistent(missing.join("; ")))
    }
}

fn collect_refs(v: &serde_json::Value, key: &str, out: &mut BTreeSet<String>) {
    match v {
        serde_json::Value::Object(map) => {
            for (k, vv) in map.iter() {
                if k == key {
                    if let Some(s) = vv.as_str() { out.insert(s.to_string()); }
                }
                collect_refs(vv, key, out);
            }
        }
        serde_json::Value::Array(arr) => {
            for vv in arr.iter() { collect_refs(vv, key, out); }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ResourceBundle, WireVersion};
    use serde_json::json;

    fn listener_with_rds(route: &str) -> serde_json::Value {
        json!({
            "name": "l1",
            "filter_chains": [{
                "filters": [{
                    "name": "http_connection_manager",
                    "typed_config": { "rds": { "route_config_name": route } }
                }]
            }]
        })
    }

    #[test]
    fn listener_referencing_missing_route_fails() {
        let bundle = ResourceBundle::new()
            .with(ResourceType::Listener, "l1", listener_with_rds("r-missing"))
            .with(ResourceType::Route, "r1", json!({"name": "r1"}));
        let snap = Snapshot::from_bundle(WireVersion::V3, &bundle, "v").unwrap();
        let err = consistent(&snap).unwrap_err();
        assert!(matches!(err, KeelError::Inconsistent(ref m) if m.contains("r-missing")));
    }

    #[test]
    fn complete_graph_is_consistent() {
        let bundle = ResourceBundle::new()
            .with(ResourceType::Listener, "l1", listener_with_rds("r1"))
            .with(ResourceType::Route, "r1", json!({"virtual_hosts": [{"routes": [{"route": {"cluster": "c1"}}]}]}))
            .with(ResourceType::Cluster, "c1", json!({"name": "c1", "type": "EDS"}))
            .with(ResourceType::Endpoint, "c1", json!({"cluster_name": "c1"}));
        let snap = Snapshot::from_bundle(WireVersion::V2, &bundle, "v").unwrap();
        assert!(consistent(&snap).is_ok());
    }

    #[test]
    fn cluster_refs_checked_only_when_endpoints_present() {
        let route = json!({"virtual_hosts": [{"routes": [{"route": {"cluster": "c2"}}]}]});
        let without = ResourceBundle::new().with(ResourceType::Route, "r1", route.clone());
        assert!(consistent(&Snapshot::from_bundle(WireVersion::V3, &without, "v").unwrap()).is_ok());

        let with = without.with(ResourceType::Endpoint, "c1", json!({}));
        assert!(consistent(&Snapshot::from_bundle(WireVersion::V3, &with, "v").unwrap()).is_err());
    }

    #[test]
    fn scoped_route_chain() {
        let bundle = ResourceBundle::new()
            .with(ResourceType::Listener, "l1", json!({"scoped_routes": {"scoped_routes_name": "s1"}}))
            .with(ResourceType::ScopedRoute, "s1", json!({"route_configuration_name": "r9"}));
        let snap = Snapshot::from_bundle(WireVersion::V3, &bundle, "v").unwrap();
        let err = consistent(&snap).unwrap_err().to_string();
        assert!(err.contains("r9"));
        assert!(!err.contains("listener"));
    }
}
