//! In-memory [`ClusterOps`] implementation for tests and demos.
//!
//! Objects live in a map keyed by identity; every mutation bumps a fake
//! resourceVersion and fans out to registered watchers. Apply failures can
//! be injected per identity to exercise backoff paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use vigil_core::{EnforceError, EnforceResult, ObjectIdentity, ParentKey, StatusSnapshot};

use crate::{CancelHandle, ClusterOps, EventSeverity, WatchEvent, WatchStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub parent: ParentKey,
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Value>,
    watchers: HashMap<String, Vec<mpsc::Sender<WatchEvent>>>,
    events: Vec<RecordedEvent>,
    statuses: HashMap<ParentKey, StatusSnapshot>,
    /// Remaining injected apply failures per identity key.
    fail_applies: HashMap<String, u32>,
    /// Remaining injected watch-establishment failures per identity key.
    fail_watches: HashMap<String, u32>,
    rv: u64,
}

/// Fake cluster with watch fan-out and injectable apply failures.
#[derive(Clone, Default)]
pub struct MemCluster {
    state: Arc<Mutex<State>>,
}

impl MemCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored object, if any.
    pub fn get(&self, id: &ObjectIdentity) -> Option<Value> {
        self.state.lock().unwrap().objects.get(&id.key()).cloned()
    }

    pub fn contains(&self, id: &ObjectIdentity) -> bool {
        self.state.lock().unwrap().objects.contains_key(&id.key())
    }

    /// The fake resourceVersion of a stored object.
    pub fn resource_version(&self, id: &ObjectIdentity) -> Option<String> {
        self.get(id)?
            .get("metadata")?
            .get("resourceVersion")?
            .as_str()
            .map(|s| s.to_string())
    }

    /// Fail the next `n` applies against `id` with a transient error.
    pub fn fail_next_applies(&self, id: &ObjectIdentity, n: u32) {
        self.state.lock().unwrap().fail_applies.insert(id.key(), n);
    }

    /// Fail the next `n` watch establishments against `id`.
    pub fn fail_next_watches(&self, id: &ObjectIdentity, n: u32) {
        self.state.lock().unwrap().fail_watches.insert(id.key(), n);
    }

    /// Simulate an external writer: mutate the stored object in place and
    /// notify watchers.
    pub fn mutate_external(&self, id: &ObjectIdentity, f: impl FnOnce(&mut Value)) {
        let mut st = self.state.lock().unwrap();
        let key = id.key();
        if let Some(obj) = st.objects.get(&key).cloned() {
            let mut obj = obj;
            f(&mut obj);
            st.rv += 1;
            let rv = st.rv.to_string();
            if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.insert("resourceVersion".into(), Value::String(rv));
            }
            st.objects.insert(key.clone(), obj.clone());
            broadcast(&mut st, &key, WatchEvent::Applied(obj));
        }
    }

    /// Seed an object without going through `apply` failure injection.
    pub fn seed(&self, id: &ObjectIdentity, obj: Value) {
        let mut st = self.state.lock().unwrap();
        let key = id.key();
        let stored = stamp(&mut st, id, obj);
        st.objects.insert(key.clone(), stored.clone());
        broadcast(&mut st, &key, WatchEvent::Applied(stored));
    }

    pub fn recorded_events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn status_of(&self, parent: &ParentKey) -> Option<StatusSnapshot> {
        self.state.lock().unwrap().statuses.get(parent).cloned()
    }

    /// Open watch channels for one identity (closed ones are pruned first).
    pub fn watcher_count(&self, id: &ObjectIdentity) -> usize {
        let mut st = self.state.lock().unwrap();
        let key = id.key();
        if let Some(list) = st.watchers.get_mut(&key) {
            list.retain(|tx| !tx.is_closed());
        }
        st.watchers.get(&key).map(|l| l.len()).unwrap_or(0)
    }
}

fn stamp(st: &mut State, id: &ObjectIdentity, mut obj: Value) -> Value {
    st.rv += 1;
    let rv = st.rv.to_string();
    if !obj.is_object() {
        obj = Value::Object(serde_json::Map::new());
    }
    let root = obj.as_object_mut().expect("just ensured object");
    let meta = root
        .entry("metadata")
        .or_insert(Value::Object(serde_json::Map::new()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("name".into(), Value::String(id.name.clone()));
        if let Some(ns) = &id.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        meta.insert("resourceVersion".into(), Value::String(rv));
    }
    obj
}

fn broadcast(st: &mut State, key: &str, ev: WatchEvent) {
    if let Some(list) = st.watchers.get_mut(key) {
        list.retain(|tx| !tx.is_closed());
        for tx in list.iter() {
            // Non-blocking; a slow consumer misses intermediate states and
            // re-fetches on the next event instead.
            let _ = tx.try_send(ev.clone());
        }
    }
}

#[async_trait]
impl ClusterOps for MemCluster {
    async fn fetch(&self, id: &ObjectIdentity) -> EnforceResult<Option<Value>> {
        Ok(self.get(id))
    }

    async fn apply(&self, id: &ObjectIdentity, obj: Value) -> EnforceResult<Value> {
        let mut st = self.state.lock().unwrap();
        let key = id.key();
        if let Some(left) = st.fail_applies.get_mut(&key) {
            if *left > 0 {
                *left -= 1;
                return Err(EnforceError::Transient(format!("injected apply failure for {key}")));
            }
        }
        let stored = stamp(&mut st, id, obj);
        st.objects.insert(key.clone(), stored.clone());
        broadcast(&mut st, &key, WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, id: &ObjectIdentity) -> EnforceResult<()> {
        let mut st = self.state.lock().unwrap();
        let key = id.key();
        if st.objects.remove(&key).is_some() {
            broadcast(&mut st, &key, WatchEvent::Deleted);
        }
        Ok(())
    }

    async fn watch(&self, id: &ObjectIdentity) -> EnforceResult<WatchStream> {
        let (tx, rx) = mpsc::channel(64);
        let mut st = self.state.lock().unwrap();
        let key = id.key();
        if let Some(left) = st.fail_watches.get_mut(&key) {
            if *left > 0 {
                *left -= 1;
                return Err(EnforceError::Transient(format!("injected watch failure for {key}")));
            }
        }
        // Initial event mirrors a relist: current existence.
        let initial = match st.objects.get(&key) {
            Some(obj) => WatchEvent::Applied(obj.clone()),
            None => WatchEvent::Deleted,
        };
        let _ = tx.try_send(initial);
        st.watchers.entry(key).or_default().push(tx);
        Ok(WatchStream { rx, cancel: CancelHandle::noop() })
    }

    async fn record_event(&self, parent: &ParentKey, severity: EventSeverity, reason: &str, message: &str) {
        self.state.lock().unwrap().events.push(RecordedEvent {
            parent: parent.clone(),
            severity,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }

    async fn persist_status(&self, parent: &ParentKey, snapshot: &StatusSnapshot) -> EnforceResult<()> {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(parent.clone(), snapshot.clone());
        Ok(())
    }
}
