//! Vigil core types: object identities, enforcement descriptors, status
//! snapshots and the shared error taxonomy.

#![forbid(unsafe_code)]

pub mod paths;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use paths::{merge_desired, prune_excluded, ExcludedPaths, FieldPath, DEFAULT_EXCLUDED_PATHS};

/// Errors surfaced by the enforcement engine.
///
/// `Transient` failures are retried with backoff and never abort a
/// reconciler; `Configuration` failures are reported once and not retried
/// until the desired set changes.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum EnforceError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl EnforceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EnforceError::Transient(_))
    }
}

pub type EnforceResult<T> = Result<T, EnforceError>;

/// Identity of one managed object: GVK key + namespace + name.
///
/// GVK keys use the `"v1/ConfigMap"` / `"group/v1/Kind"` string form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub gvk_key: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectIdentity {
    pub fn new(gvk_key: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            gvk_key: gvk_key.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }

    /// Stable identity key used for set diffing and status maps.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.gvk_key,
            self.namespace.as_deref().unwrap_or("-"),
            self.name
        )
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Stable identifier of the owning custom resource (`namespace/name`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentKey(pub String);

impl ParentKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) => Self(format!("{ns}/{name}")),
            None => Self(name.to_string()),
        }
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired state of one managed object plus its exclusion policy.
///
/// Descriptors are replaced wholesale on every spec change; content equality
/// decides whether an unchanged identity still needs an in-place restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescriptor {
    pub identity: ObjectIdentity,
    /// Full desired manifest, including apiVersion/kind/metadata.
    pub desired: Value,
    pub excluded_paths: ExcludedPaths,
    /// Leave the object in place when it drops out of the desired set.
    #[serde(default)]
    pub retain_on_removal: bool,
}

impl ResourceDescriptor {
    /// Build a descriptor from a raw manifest; identity is read from
    /// apiVersion/kind/metadata. User exclusions are unioned with defaults.
    pub fn from_manifest(
        desired: Value,
        user_excluded: impl IntoIterator<Item = FieldPath>,
    ) -> EnforceResult<Self> {
        let api_version = desired
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EnforceError::Configuration("manifest missing apiVersion".into()))?;
        let kind = desired
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EnforceError::Configuration("manifest missing kind".into()))?;
        let name = desired
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| EnforceError::Configuration("manifest missing metadata.name".into()))?;
        let namespace = desired
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(|v| v.as_str());
        let gvk_key = format!("{api_version}/{kind}");
        let identity = ObjectIdentity::new(gvk_key, namespace, name);
        Ok(Self {
            identity,
            excluded_paths: ExcludedPaths::with_defaults(user_excluded),
            desired,
            retain_on_removal: false,
        })
    }
}

/// One source-path to target-path mapping within a patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldProjection {
    pub from: FieldPath,
    pub to: FieldPath,
}

/// A rule projecting observed fields of a source object into a target
/// object, ordered relative to other patches by `priority`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub source: ObjectIdentity,
    pub target: ObjectIdentity,
    pub projections: Vec<FieldProjection>,
    #[serde(default)]
    pub priority: u32,
}

impl PatchDescriptor {
    /// Identity key for set diffing and status maps.
    pub fn key(&self) -> String {
        format!("{} -> {} #{}", self.source.key(), self.target.key(), self.priority)
    }
}

/// Registration-time validation of a patch set: object-reference cycles are
/// a configuration error, surfaced before anything starts (Kahn's algorithm).
pub fn validate_patch_set(patches: &[PatchDescriptor]) -> EnforceResult<()> {
    use std::collections::HashMap;

    let mut indegree: HashMap<&ObjectIdentity, usize> = HashMap::new();
    let mut edges: HashMap<&ObjectIdentity, Vec<&ObjectIdentity>> = HashMap::new();
    for p in patches {
        if p.projections.is_empty() {
            return Err(EnforceError::Configuration(format!(
                "patch {} declares no field projections",
                p.key()
            )));
        }
        indegree.entry(&p.source).or_insert(0);
        *indegree.entry(&p.target).or_insert(0) += 1;
        edges.entry(&p.source).or_default().push(&p.target);
    }
    let mut ready: Vec<&ObjectIdentity> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = ready.pop() {
        visited += 1;
        for next in edges.get(id).into_iter().flatten() {
            let d = indegree.get_mut(next).expect("edge endpoints registered");
            *d -= 1;
            if *d == 0 {
                ready.push(next);
            }
        }
    }
    if visited != indegree.len() {
        return Err(EnforceError::Configuration(
            "patch set forms a dependency cycle over object references".into(),
        ));
    }
    Ok(())
}

/// Reject duplicate identity keys within one desired set.
pub fn validate_resource_set(resources: &[ResourceDescriptor]) -> EnforceResult<()> {
    let mut seen = std::collections::HashSet::new();
    for r in resources {
        if !seen.insert(r.identity.key()) {
            return Err(EnforceError::Configuration(format!(
                "duplicate resource identity in desired set: {}",
                r.identity
            )));
        }
    }
    Ok(())
}

/// Enforcement phase of one reconciler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    Success,
    Failure,
}

/// Read-only status of one reconciler, aggregated per parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub resource_key: String,
    pub phase: Phase,
    pub reason: String,
    pub last_update: DateTime<Utc>,
}

impl StatusEntry {
    pub fn success(resource_key: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            phase: Phase::Success,
            reason: String::new(),
            last_update: Utc::now(),
        }
    }

    pub fn failure(resource_key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            phase: Phase::Failure,
            reason: reason.into(),
            last_update: Utc::now(),
        }
    }
}

/// Copied aggregation of per-resource statuses for one parent.
pub type StatusSnapshot = BTreeMap<String, StatusEntry>;

pub mod prelude {
    pub use super::{
        merge_desired, prune_excluded, EnforceError, EnforceResult, ExcludedPaths, FieldPath,
        FieldProjection, ObjectIdentity, ParentKey, PatchDescriptor, Phase, ResourceDescriptor,
        StatusEntry, StatusSnapshot,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(name: &str) -> ObjectIdentity {
        ObjectIdentity::new("v1/ConfigMap", Some("ns"), name)
    }

    fn patch(src: &str, tgt: &str, priority: u32) -> PatchDescriptor {
        PatchDescriptor {
            source: ident(src),
            target: ident(tgt),
            projections: vec![FieldProjection {
                from: FieldPath::parse(".data.a").unwrap(),
                to: FieldPath::parse(".data.b").unwrap(),
            }],
            priority,
        }
    }

    #[test]
    fn from_manifest_reads_identity() {
        let d = ResourceDescriptor::from_manifest(
            json!({"apiVersion": "v1", "kind": "ConfigMap",
                   "metadata": {"name": "cm", "namespace": "ns"}, "data": {}}),
            [],
        )
        .unwrap();
        assert_eq!(d.identity.key(), "v1/ConfigMap/ns/cm");
        assert!(d.excluded_paths.covers(&["status"]));
    }

    #[test]
    fn from_manifest_rejects_incomplete_objects() {
        let e = ResourceDescriptor::from_manifest(json!({"kind": "ConfigMap"}), []).unwrap_err();
        assert!(matches!(e, EnforceError::Configuration(_)));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let d = ResourceDescriptor::from_manifest(
            json!({"apiVersion": "v1", "kind": "ConfigMap",
                   "metadata": {"name": "cm", "namespace": "ns"}}),
            [],
        )
        .unwrap();
        let err = validate_resource_set(&[d.clone(), d]).unwrap_err();
        assert!(matches!(err, EnforceError::Configuration(_)));
    }

    #[test]
    fn acyclic_patch_chain_is_accepted() {
        let set = vec![patch("a", "b", 1), patch("b", "c", 2)];
        assert!(validate_patch_set(&set).is_ok());
    }

    #[test]
    fn patch_cycle_is_a_configuration_error() {
        let set = vec![patch("a", "b", 1), patch("b", "c", 2), patch("c", "a", 3)];
        let err = validate_patch_set(&set).unwrap_err();
        assert!(matches!(err, EnforceError::Configuration(_)));
    }

    #[test]
    fn empty_projection_list_is_rejected() {
        let mut p = patch("a", "b", 1);
        p.projections.clear();
        assert!(validate_patch_set(&[p]).is_err());
    }
}
