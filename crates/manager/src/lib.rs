//! Vigil manager: owns the live collection of object and patch reconcilers
//! for each parent, diffs desired sets against running sets, restarts only
//! what changed, and aggregates status.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use vigil_core::{
    validate_patch_set, validate_resource_set, EnforceError, EnforceResult, ParentKey,
    PatchDescriptor, ResourceDescriptor, StatusEntry, StatusSnapshot,
};
use vigil_enforce::{
    notification_channel, spawn_object_reconciler, spawn_patch_reconciler, EnforceConfig,
    Notifier, PatchBarrier, ReconcilerHandle,
};
use vigil_kubehub::ClusterOps;

struct ResourceRecord {
    descriptor: ResourceDescriptor,
    handle: ReconcilerHandle,
}

struct PatchRecord {
    descriptor: PatchDescriptor,
    handle: ReconcilerHandle,
}

/// Membership state for one parent. All mutations go through the tokio
/// mutex; the status registry sits outside it so snapshots never wait on an
/// in-flight reconcile.
struct ParentManager {
    state: Mutex<SetState>,
    statuses: std::sync::Mutex<HashMap<String, watch::Receiver<StatusEntry>>>,
}

struct SetState {
    resources: FxHashMap<String, ResourceRecord>,
    patches: FxHashMap<String, PatchRecord>,
    barrier: Arc<PatchBarrier>,
}

impl ParentManager {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SetState {
                resources: FxHashMap::default(),
                patches: FxHashMap::default(),
                barrier: PatchBarrier::new(),
            }),
            statuses: std::sync::Mutex::new(HashMap::new()),
        })
    }

    fn refresh_statuses(&self, state: &SetState) {
        let mut sts = self.statuses.lock().unwrap();
        sts.clear();
        for rec in state.resources.values() {
            sts.insert(rec.handle.key().to_string(), rec.handle.status_watch());
        }
        for rec in state.patches.values() {
            sts.insert(rec.handle.key().to_string(), rec.handle.status_watch());
        }
    }
}

/// The enforcement engine: one instance serves many parents, each with its
/// own isolated reconciler set. Parent-level operations never serialize
/// against each other.
pub struct EnforcementEngine {
    cluster: Arc<dyn ClusterOps>,
    cfg: EnforceConfig,
    notifier: Notifier,
    notifications: std::sync::Mutex<Option<mpsc::Receiver<ParentKey>>>,
    managers: Mutex<HashMap<ParentKey, Arc<ParentManager>>>,
}

impl EnforcementEngine {
    pub fn new(cluster: Arc<dyn ClusterOps>, cfg: EnforceConfig) -> Self {
        let (notifier, rx) = notification_channel(cfg.notify_cap);
        Self {
            cluster,
            cfg,
            notifier,
            notifications: std::sync::Mutex::new(Some(rx)),
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// The stream of parent keys needing re-evaluation. Can be taken once.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<ParentKey>> {
        self.notifications.lock().unwrap().take()
    }

    async fn parent_manager(&self, parent: &ParentKey) -> Arc<ParentManager> {
        let mut managers = self.managers.lock().await;
        managers
            .entry(parent.clone())
            .or_insert_with(ParentManager::new)
            .clone()
    }

    /// Converge the running reconciler set on the desired one. Identity-key
    /// diffing decides add/remove; content equality decides in-place
    /// restarts. Idempotent: re-running with the same sets is a no-op.
    pub async fn reconcile(
        &self,
        parent: &ParentKey,
        resources: Vec<ResourceDescriptor>,
        patches: Vec<PatchDescriptor>,
    ) -> EnforceResult<()> {
        validate_resource_set(&resources)?;
        validate_patch_set(&patches)?;
        {
            let mut seen = HashSet::new();
            for p in &patches {
                if !seen.insert(p.key()) {
                    return Err(EnforceError::Configuration(format!(
                        "duplicate patch in desired set: {}",
                        p.key()
                    )));
                }
            }
        }

        let pm = self.parent_manager(parent).await;
        let mut state = pm.state.lock().await;
        let mut first_err: Option<EnforceError> = None;

        // Removed resources: stop, then delete the managed object unless the
        // descriptor opted out.
        let desired_resources: FxHashMap<String, ResourceDescriptor> = resources
            .into_iter()
            .map(|r| (r.identity.key(), r))
            .collect();
        let removed: Vec<String> = state
            .resources
            .keys()
            .filter(|k| !desired_resources.contains_key(*k))
            .cloned()
            .collect();
        for key in removed {
            let rec = state.resources.remove(&key).expect("key just listed");
            info!(parent = %parent, resource = %key, "stopping reconciler for removed resource");
            rec.handle.stop(self.cfg.stop_grace).await;
            counter!("vigil_reconcilers_stopped", 1u64);
            if !rec.descriptor.retain_on_removal {
                if let Err(e) = self.cluster.delete(&rec.descriptor.identity).await {
                    warn!(parent = %parent, resource = %key, error = %e, "failed to delete removed object");
                    first_err.get_or_insert(e);
                }
            }
        }

        // Added or changed resources. A content change restarts exactly that
        // reconciler; the old task is awaited before its replacement starts.
        for (key, descriptor) in desired_resources {
            match state.resources.get(&key) {
                Some(rec) if rec.descriptor == descriptor => continue,
                Some(_) => {
                    let rec = state.resources.remove(&key).expect("present in current set");
                    info!(parent = %parent, resource = %key, "restarting reconciler for changed content");
                    rec.handle.stop(self.cfg.stop_grace).await;
                }
                None => {
                    info!(parent = %parent, resource = %key, "starting reconciler");
                }
            }
            let handle = spawn_object_reconciler(
                Arc::clone(&self.cluster),
                parent.clone(),
                descriptor.clone(),
                self.cfg.clone(),
                self.notifier.clone(),
            );
            counter!("vigil_reconcilers_started", 1u64);
            state.resources.insert(key, ResourceRecord { descriptor, handle });
        }

        // Patches: same protocol, keyed by source/target/priority. The
        // barrier learns the full desired set before anything new starts.
        state.barrier.register(&patches);
        let desired_patches: FxHashMap<String, PatchDescriptor> =
            patches.into_iter().map(|p| (p.key(), p)).collect();
        let removed: Vec<String> = state
            .patches
            .keys()
            .filter(|k| !desired_patches.contains_key(*k))
            .cloned()
            .collect();
        for key in removed {
            let rec = state.patches.remove(&key).expect("key just listed");
            info!(parent = %parent, patch = %key, "stopping patch reconciler");
            rec.handle.stop(self.cfg.stop_grace).await;
        }
        for (key, descriptor) in desired_patches {
            match state.patches.get(&key) {
                Some(rec) if rec.descriptor == descriptor => continue,
                Some(_) => {
                    let rec = state.patches.remove(&key).expect("present in current set");
                    info!(parent = %parent, patch = %key, "restarting patch reconciler");
                    rec.handle.stop(self.cfg.stop_grace).await;
                    // content changed: its previous applies no longer count
                    state.barrier.clear_mark(&descriptor.target.key(), descriptor.priority, &key);
                }
                None => {
                    info!(parent = %parent, patch = %key, "starting patch reconciler");
                }
            }
            let handle = spawn_patch_reconciler(
                Arc::clone(&self.cluster),
                parent.clone(),
                descriptor.clone(),
                self.cfg.clone(),
                self.notifier.clone(),
                Arc::clone(&state.barrier),
            );
            state.patches.insert(key, PatchRecord { descriptor, handle });
        }

        pm.refresh_statuses(&state);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read-only status aggregation; copies the latest published entry per
    /// reconciler and never waits on membership mutations.
    pub async fn status(&self, parent: &ParentKey) -> StatusSnapshot {
        let pm = self.managers.lock().await.get(parent).cloned();
        match pm {
            None => StatusSnapshot::new(),
            Some(pm) => {
                let sts = pm.statuses.lock().unwrap();
                sts.iter()
                    .map(|(k, rx)| (k.clone(), rx.borrow().clone()))
                    .collect()
            }
        }
    }

    /// Snapshot the parent's status and hand it to the cluster for
    /// persistence.
    pub async fn publish_status(&self, parent: &ParentKey) -> EnforceResult<()> {
        let snapshot = self.status(parent).await;
        self.cluster.persist_status(parent, &snapshot).await
    }

    /// Stop every reconciler for the parent; optionally delete all managed
    /// objects. Safe to call when reconcilers already failed or the parent
    /// is unknown.
    pub async fn terminate(&self, parent: &ParentKey, delete_managed: bool) -> EnforceResult<()> {
        let pm = self.managers.lock().await.remove(parent);
        let Some(pm) = pm else {
            return Ok(());
        };
        let mut state = pm.state.lock().await;
        info!(parent = %parent, delete_managed, "terminating enforcement");

        // Patches first, so projections stop firing while objects go away.
        for (_, rec) in state.patches.drain() {
            rec.handle.stop(self.cfg.stop_grace).await;
        }
        let mut first_err: Option<EnforceError> = None;
        for (_, rec) in state.resources.drain() {
            rec.handle.stop(self.cfg.stop_grace).await;
            if delete_managed {
                if let Err(e) = self.cluster.delete(&rec.descriptor.identity).await {
                    warn!(parent = %parent, resource = %rec.descriptor.identity, error = %e, "failed to delete managed object");
                    first_err.get_or_insert(e);
                }
            }
        }
        pm.statuses.lock().unwrap().clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
