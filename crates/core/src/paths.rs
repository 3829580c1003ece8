//! Field paths and exclusion-aware merging over arbitrary JSON objects.
//!
//! Enforcement never generates per-type code: everything here operates on
//! dot-separated path strings against `serde_json::Value` trees.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;

use crate::EnforceError;

/// A parsed field path, e.g. `.spec.replicas`. The leading dot is optional
/// on input and always rendered on output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: SmallVec<[String; 4]>,
}

impl FieldPath {
    pub fn parse(s: &str) -> Result<Self, EnforceError> {
        let body = s.strip_prefix('.').unwrap_or(s);
        if body.is_empty() {
            return Err(EnforceError::Configuration(format!("empty field path: {s:?}")));
        }
        let mut segments = SmallVec::new();
        for seg in body.split('.') {
            if seg.is_empty() {
                return Err(EnforceError::Configuration(format!(
                    "malformed field path {s:?}: empty segment"
                )));
            }
            segments.push(seg.to_string());
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True when `self` equals `path` or is an ancestor of it.
    pub fn is_prefix_of<S: AsRef<str>>(&self, path: &[S]) -> bool {
        self.segments.len() <= path.len()
            && self.segments.iter().zip(path).all(|(a, b)| a == b.as_ref())
    }

    /// True when `path` is a strict ancestor of `self`.
    pub fn is_under<S: AsRef<str>>(&self, path: &[S]) -> bool {
        path.len() < self.segments.len()
            && path.iter().zip(self.segments.iter()).all(|(a, b)| a.as_ref() == b)
    }

    /// Read the value at this path, if present.
    pub fn get<'a>(&self, v: &'a Value) -> Option<&'a Value> {
        let mut cur = v;
        for seg in &self.segments {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// Write `new` at this path, creating intermediate objects as needed.
    pub fn set(&self, v: &mut Value, new: Value) {
        let mut cur = v;
        let (last, init) = self.segments.split_last().expect("non-empty path");
        for seg in init {
            if !cur.is_object() {
                *cur = Value::Object(serde_json::Map::new());
            }
            cur = cur
                .as_object_mut()
                .expect("just ensured object")
                .entry(seg.clone())
                .or_insert(Value::Object(serde_json::Map::new()));
        }
        if !cur.is_object() {
            *cur = Value::Object(serde_json::Map::new());
        }
        cur.as_object_mut()
            .expect("just ensured object")
            .insert(last.clone(), new);
    }

    /// Remove the value at this path, if present. Intermediate objects are
    /// left in place even when emptied.
    pub fn remove(&self, v: &mut Value) {
        let (last, init) = self.segments.split_last().expect("non-empty path");
        let mut cur = v;
        for seg in init {
            match cur.as_object_mut().and_then(|o| o.get_mut(seg)) {
                Some(next) => cur = next,
                None => return,
            }
        }
        if let Some(obj) = cur.as_object_mut() {
            obj.remove(last);
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            write!(f, ".{seg}")?;
        }
        Ok(())
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FieldPath::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Paths the engine never writes: cluster bookkeeping and the status
/// subresource. User exclusions are unioned on top, never subtracted.
pub const DEFAULT_EXCLUDED_PATHS: &[&str] = &[
    ".metadata.resourceVersion",
    ".metadata.generation",
    ".metadata.uid",
    ".metadata.creationTimestamp",
    ".metadata.managedFields",
    ".metadata.finalizers",
    ".metadata.ownerReferences",
    ".status",
];

/// The exclusion set for one descriptor: always a superset of
/// [`DEFAULT_EXCLUDED_PATHS`]. Sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedPaths {
    paths: Vec<FieldPath>,
}

impl ExcludedPaths {
    /// The only construction path: user paths unioned with the defaults.
    pub fn with_defaults(user: impl IntoIterator<Item = FieldPath>) -> Self {
        let mut paths: Vec<FieldPath> = DEFAULT_EXCLUDED_PATHS
            .iter()
            .map(|p| FieldPath::parse(p).expect("default paths are well-formed"))
            .collect();
        paths.extend(user);
        paths.sort();
        paths.dedup();
        Self { paths }
    }

    pub fn defaults() -> Self {
        Self::with_defaults([])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    /// True when `path` sits at or under an excluded path.
    pub fn covers<S: AsRef<str>>(&self, path: &[S]) -> bool {
        self.paths.iter().any(|p| p.is_prefix_of(path))
    }

    /// True when some excluded path lies strictly below `path`.
    pub fn reaches_into<S: AsRef<str>>(&self, path: &[S]) -> bool {
        self.paths.iter().any(|p| p.is_under(path))
    }
}

/// Compute the effective desired object for one managed resource.
///
/// Desired content wins at every non-excluded path; the live value wins at or
/// under excluded paths; live-only fields outside the exclusion set are
/// pruned. A live subtree that contains an excluded descendant is retained
/// rather than pruned, so enforcement can never drop e.g. a status branch it
/// was told to leave alone.
pub fn merge_desired(live: &Value, desired: &Value, excluded: &ExcludedPaths) -> Value {
    fn walk(
        live: &Value,
        desired: &Value,
        excluded: &ExcludedPaths,
        path: &mut Vec<String>,
    ) -> Value {
        let (Some(live_obj), Some(desired_obj)) = (live.as_object(), desired.as_object()) else {
            return desired.clone();
        };
        let mut out = serde_json::Map::new();
        for (key, dv) in desired_obj {
            path.push(key.clone());
            let merged = if excluded.covers(path) {
                live_obj.get(key).cloned()
            } else {
                match live_obj.get(key) {
                    Some(lv) => Some(walk(lv, dv, excluded, path)),
                    None => Some(dv.clone()),
                }
            };
            path.pop();
            if let Some(v) = merged {
                out.insert(key.clone(), v);
            }
        }
        for (key, lv) in live_obj {
            if desired_obj.contains_key(key) {
                continue;
            }
            path.push(key.clone());
            let keep = excluded.covers(path) || excluded.reaches_into(path);
            path.pop();
            if keep {
                out.insert(key.clone(), lv.clone());
            }
        }
        Value::Object(out)
    }
    let mut path = Vec::new();
    walk(live, desired, excluded, &mut path)
}

/// Strip every excluded path out of `v`. Used to compare a live object
/// against last-applied content without cluster bookkeeping noise.
pub fn prune_excluded(v: &Value, excluded: &ExcludedPaths) -> Value {
    let mut out = v.clone();
    for p in excluded.iter() {
        p.remove(&mut out);
    }
    out
}
