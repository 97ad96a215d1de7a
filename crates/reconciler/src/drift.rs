//! Drift check: can the cached observation prove the resource is converged?
//!
//! Anything short of proof returns `false`, which sends the resource back
//! through the reconcile path.

use keel_core::{DesiredState, ObservedEntry, Resource, ResourceKind};
use serde_json::Value;

/// Whether `observed` shows `resource` in its desired state.
#[must_use]
pub fn desired_matches_observed(resource: &Resource, observed: Option<&ObservedEntry>) -> bool {
    let Some(actual) = observed.and_then(|entry| entry.actual.as_ref()) else {
        return false;
    };

    if resource.desired_state == DesiredState::Deleted {
        return actual.get("deleted").and_then(Value::as_bool) == Some(true);
    }

    let Ok(kind) = resource.resource_kind() else {
        return false;
    };

    if kind.has_running_flag() {
        let want_running = resource.desired_state != DesiredState::Paused;
        return actual.get("running").and_then(Value::as_bool) == Some(want_running);
    }

    if kind == ResourceKind::HttpRoute {
        return !is_truthy(actual.get("deleted"))
            && actual.get("hostname").and_then(Value::as_str) == resource.spec_str("hostname")
            && port(actual.get("targetPort")).is_some()
            && port(actual.get("targetPort")) == port(resource.spec.get("targetPort"));
    }

    !is_truthy(actual.get("deleted"))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_) | Value::Object(_)) => true,
    }
}

/// Port as a number; numeric strings count.
fn port(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn entry(kind: ResourceKind, actual: Value) -> ObservedEntry {
        ObservedEntry::new(kind, actual)
    }

    fn route(hostname: &str, port: u16) -> Resource {
        Resource::new("r-1", ResourceKind::HttpRoute, "p-1", "site")
            .with_spec(json!({ "hostname": hostname, "targetPort": port }))
    }

    #[test]
    fn test_cache_miss_never_matches() {
        let resource = Resource::new("r-1", ResourceKind::Compute, "p-1", "api");
        assert!(!desired_matches_observed(&resource, None));
    }

    #[test]
    fn test_entry_without_actual_never_matches() {
        let resource = Resource::new("r-1", ResourceKind::Bucket, "p-1", "assets");
        let mut observed = entry(ResourceKind::Bucket, json!({}));
        observed.actual = None;
        assert!(!desired_matches_observed(&resource, Some(&observed)));
    }

    #[test]
    fn test_compute_running_matches() {
        let resource = Resource::new("r-1", ResourceKind::Compute, "p-1", "api");
        let observed = entry(ResourceKind::Compute, json!({ "running": true }));
        assert!(desired_matches_observed(&resource, Some(&observed)));
    }

    #[test]
    fn test_paused_compute_wants_stopped() {
        let resource = Resource::new("r-1", ResourceKind::Compute, "p-1", "api")
            .with_desired_state(DesiredState::Paused);
        let running = entry(ResourceKind::Compute, json!({ "running": true }));
        let stopped = entry(ResourceKind::Compute, json!({ "running": false }));

        assert!(!desired_matches_observed(&resource, Some(&running)));
        assert!(desired_matches_observed(&resource, Some(&stopped)));
    }

    #[test]
    fn test_running_flag_must_be_boolean() {
        let resource = Resource::new("r-1", ResourceKind::Database, "p-1", "db");
        let observed = entry(ResourceKind::Database, json!({ "running": "true" }));
        assert!(!desired_matches_observed(&resource, Some(&observed)));
    }

    #[test]
    fn test_deleted_requires_deleted_snapshot() {
        let resource = Resource::new("r-1", ResourceKind::Volume, "p-1", "data")
            .with_desired_state(DesiredState::Deleted);
        let gone = ObservedEntry::deleted(ResourceKind::Volume);
        let present = entry(ResourceKind::Volume, json!({ "size_gb": 10 }));

        assert!(desired_matches_observed(&resource, Some(&gone)));
        assert!(!desired_matches_observed(&resource, Some(&present)));
    }

    #[test]
    fn test_storage_kinds_match_unless_deleted() {
        for kind in [
            ResourceKind::Volume,
            ResourceKind::Bucket,
            ResourceKind::Broker,
            ResourceKind::Observability,
        ] {
            let resource = Resource::new("r-1", kind, "p-1", "thing");
            let present = entry(kind, json!({ "deleted": false }));
            let gone = ObservedEntry::deleted(kind);

            assert!(desired_matches_observed(&resource, Some(&present)));
            assert!(!desired_matches_observed(&resource, Some(&gone)));
        }
    }

    #[test]
    fn test_route_hostname_mismatch() {
        let resource = route("app.example.com", 8080);
        let observed = entry(
            ResourceKind::HttpRoute,
            json!({ "hostname": "old.example.com", "targetPort": 8080 }),
        );
        assert!(!desired_matches_observed(&resource, Some(&observed)));
    }

    #[test]
    fn test_route_port_compared_numerically() {
        let resource = route("app.example.com", 8080);
        let observed = entry(
            ResourceKind::HttpRoute,
            json!({ "hostname": "app.example.com", "targetPort": "8080" }),
        );
        assert!(desired_matches_observed(&resource, Some(&observed)));
    }

    #[test]
    fn test_unknown_kind_never_matches() {
        let resource =
            Resource::new("r-1", ResourceKind::Bucket, "p-1", "assets").with_raw_kind("tape");
        let observed = entry(ResourceKind::Bucket, json!({ "deleted": false }));
        assert!(!desired_matches_observed(&resource, Some(&observed)));
    }

    fn any_kind() -> impl Strategy<Value = ResourceKind> {
        prop::sample::select(ResourceKind::ALL.to_vec())
    }

    fn any_desired() -> impl Strategy<Value = DesiredState> {
        prop::sample::select(vec![
            DesiredState::Running,
            DesiredState::Paused,
            DesiredState::Deleted,
        ])
    }

    proptest! {
        #[test]
        fn prop_miss_is_never_in_sync(kind in any_kind(), desired in any_desired()) {
            let resource = Resource::new("r-1", kind, "p-1", "thing").with_desired_state(desired);
            prop_assert!(!desired_matches_observed(&resource, None));
        }

        #[test]
        fn prop_deleted_snapshot_matches_only_deletion(kind in any_kind(), desired in any_desired()) {
            let resource = Resource::new("r-1", kind, "p-1", "thing").with_desired_state(desired);
            let gone = ObservedEntry::deleted(kind);
            let matches = desired_matches_observed(&resource, Some(&gone));
            prop_assert_eq!(matches, desired == DesiredState::Deleted);
        }

        #[test]
        fn prop_route_matches_iff_host_and_port_agree(
            spec_host in "[a-z]{1,8}\\.example\\.com",
            seen_host in "[a-z]{1,8}\\.example\\.com",
            spec_port in 1u16..,
            seen_port in 1u16..,
        ) {
            let resource = route(&spec_host, spec_port);
            let observed = entry(
                ResourceKind::HttpRoute,
                json!({ "hostname": seen_host, "targetPort": seen_port }),
            );
            let expected = spec_host == seen_host && spec_port == seen_port;
            prop_assert_eq!(desired_matches_observed(&resource, Some(&observed)), expected);
        }
    }
}
