//! Patch Reconciler: one continuous loop per cross-object field projection.
//! Reads declared paths from the source object and writes them into the
//! target, gated by declared dependency priority.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use vigil_core::{EnforceError, EnforceResult, ParentKey, PatchDescriptor, StatusEntry};
use vigil_kubehub::{ClusterOps, EventSeverity};

use crate::{set_status, Backoff, EnforceConfig, Notifier, ReconcilerHandle};

/// Priority gate shared by all patch reconcilers of one parent.
///
/// A patch with priority N holds off until every lower-numbered patch
/// targeting the same object has completed at least one successful apply in
/// the current membership generation. Marks are kept per patch identity, so
/// equal-priority patches on one target each have to complete on their own.
/// Completion marks survive in-place restarts of unrelated patches; removed
/// patches drop their marks.
pub struct PatchBarrier {
    // target key -> priority -> patch key -> completed at least once
    inner: Mutex<HashMap<String, BTreeMap<u32, HashMap<String, bool>>>>,
    changed: tokio::sync::Notify,
}

impl PatchBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(HashMap::new()), changed: tokio::sync::Notify::new() })
    }

    /// Rebuild registrations from the desired patch set, carrying completion
    /// marks over for surviving patch identities.
    pub fn register(&self, patches: &[PatchDescriptor]) {
        let mut inner = self.inner.lock().unwrap();
        let mut next: HashMap<String, BTreeMap<u32, HashMap<String, bool>>> = HashMap::new();
        for p in patches {
            let target_key = p.target.key();
            let patch_key = p.key();
            let done = inner
                .get(&target_key)
                .and_then(|m| m.get(&p.priority))
                .and_then(|g| g.get(&patch_key))
                .copied()
                .unwrap_or(false);
            next.entry(target_key)
                .or_default()
                .entry(p.priority)
                .or_default()
                .insert(patch_key, done);
        }
        *inner = next;
        self.changed.notify_waiters();
    }

    pub fn mark_applied(&self, target_key: &str, priority: u32, patch_key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(done) = inner
            .get_mut(target_key)
            .and_then(|m| m.get_mut(&priority))
            .and_then(|g| g.get_mut(patch_key))
        {
            *done = true;
        }
        self.changed.notify_waiters();
    }

    /// Drop the completion mark of one patch. Used when a patch is replaced
    /// in place with different content; siblings keep their marks.
    pub fn clear_mark(&self, target_key: &str, priority: u32, patch_key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(done) = inner
            .get_mut(target_key)
            .and_then(|m| m.get_mut(&priority))
            .and_then(|g| g.get_mut(patch_key))
        {
            *done = false;
        }
        self.changed.notify_waiters();
    }

    fn lower_done(&self, target_key: &str, priority: u32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(target_key)
            .map(|m| m.range(..priority).all(|(_, g)| g.values().all(|done| *done)))
            .unwrap_or(true)
    }

    /// Wait until all lower-priority patches on `target_key` have applied.
    pub async fn wait_for_lower(&self, target_key: &str, priority: u32) {
        loop {
            let notified = self.changed.notified();
            if self.lower_done(target_key, priority) {
                return;
            }
            notified.await;
        }
    }
}

/// Start the enforcement task for one patch descriptor.
pub fn spawn_patch_reconciler(
    cluster: Arc<dyn ClusterOps>,
    parent: ParentKey,
    descriptor: PatchDescriptor,
    cfg: EnforceConfig,
    notifier: Notifier,
    barrier: Arc<PatchBarrier>,
) -> ReconcilerHandle {
    let key = descriptor.key();
    let (status_tx, status_rx) = watch::channel(StatusEntry::success(&key));
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let join = tokio::spawn(run(cluster, parent, descriptor, cfg, notifier, barrier, status_tx, cancel_rx));
    ReconcilerHandle::new(key, cancel_tx, join, status_rx)
}

#[allow(clippy::too_many_arguments)]
async fn run(
    cluster: Arc<dyn ClusterOps>,
    parent: ParentKey,
    descriptor: PatchDescriptor,
    cfg: EnforceConfig,
    notifier: Notifier,
    barrier: Arc<PatchBarrier>,
    status_tx: watch::Sender<StatusEntry>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let key = descriptor.key();
    let target_key = descriptor.target.key();

    let mut source_stream = match cluster.watch(&descriptor.source).await {
        Ok(s) => s,
        Err(e) => {
            warn!(patch = %key, error = %e, "failed to establish source watch");
            cluster
                .record_event(&parent, EventSeverity::Warning, "WatchFailed", &e.to_string())
                .await;
            set_status(&status_tx, &notifier, &parent, StatusEntry::failure(&key, e.to_string()), true);
            return;
        }
    };
    let mut target_stream = match cluster.watch(&descriptor.target).await {
        Ok(s) => s,
        Err(e) => {
            warn!(patch = %key, error = %e, "failed to establish target watch");
            source_stream.cancel.cancel();
            cluster
                .record_event(&parent, EventSeverity::Warning, "WatchFailed", &e.to_string())
                .await;
            set_status(&status_tx, &notifier, &parent, StatusEntry::failure(&key, e.to_string()), true);
            return;
        }
    };
    info!(patch = %key, "patch reconciler watching");

    let mut backoff = Backoff::new(&cfg);
    let mut failures = 0u32;

    'main: loop {
        let ev = tokio::select! {
            _ = &mut cancel_rx => break 'main,
            ev = source_stream.rx.recv() => ev,
            ev = target_stream.rx.recv() => ev,
        };
        if ev.is_none() {
            set_status(
                &status_tx,
                &notifier,
                &parent,
                StatusEntry::failure(&key, "watch stream closed"),
                true,
            );
            break 'main;
        }

        // Respect declared ordering before touching the target.
        tokio::select! {
            _ = &mut cancel_rx => break 'main,
            _ = barrier.wait_for_lower(&target_key, descriptor.priority) => {}
        }

        counter!("vigil_patch_reconcile_total", 1u64);
        loop {
            match reconcile_once(cluster.as_ref(), &descriptor).await {
                Ok(wrote) => {
                    failures = 0;
                    backoff.reset();
                    barrier.mark_applied(&target_key, descriptor.priority, &key);
                    if wrote {
                        counter!("vigil_patch_projections", 1u64);
                        info!(patch = %key, "projected source fields onto target");
                    } else {
                        debug!(patch = %key, "target already current");
                    }
                    set_status(&status_tx, &notifier, &parent, StatusEntry::success(&key), wrote);
                    break;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    counter!("vigil_enforce_failures", 1u64);
                    warn!(patch = %key, error = %e, failures, "transient patch failure");
                    if failures == cfg.failure_threshold {
                        cluster
                            .record_event(&parent, EventSeverity::Warning, "PatchFailing", &e.to_string())
                            .await;
                        set_status(&status_tx, &notifier, &parent, StatusEntry::failure(&key, e.to_string()), true);
                    }
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = &mut cancel_rx => break 'main,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(patch = %key, error = %e, "patch configuration error");
                    cluster
                        .record_event(&parent, EventSeverity::Warning, "ProcessingError", &e.to_string())
                        .await;
                    set_status(&status_tx, &notifier, &parent, StatusEntry::failure(&key, e.to_string()), true);
                    break;
                }
            }
        }
    }

    source_stream.cancel.cancel();
    target_stream.cancel.cancel();
    debug!(patch = %key, "patch reconciler stopped");
}

/// One projection pass: read source paths, write target paths when they
/// differ. Returns whether a write happened.
async fn reconcile_once(cluster: &dyn ClusterOps, p: &PatchDescriptor) -> EnforceResult<bool> {
    let source = cluster
        .fetch(&p.source)
        .await?
        .ok_or_else(|| EnforceError::Transient(format!("source object {} absent", p.source)))?;
    let mut values = Vec::with_capacity(p.projections.len());
    for proj in &p.projections {
        let v = proj.from.get(&source).ok_or_else(|| {
            EnforceError::Configuration(format!(
                "source path {} missing on {}",
                proj.from, p.source
            ))
        })?;
        values.push((&proj.to, v.clone()));
    }

    let target = cluster
        .fetch(&p.target)
        .await?
        .ok_or_else(|| EnforceError::Transient(format!("target object {} absent", p.target)))?;
    let mut updated = target.clone();
    let mut dirty = false;
    for (to, v) in values {
        if to.get(&updated) != Some(&v) {
            to.set(&mut updated, v);
            dirty = true;
        }
    }
    if dirty {
        cluster.apply(&p.target, updated).await?;
    }
    Ok(dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use vigil_core::{FieldPath, FieldProjection, ObjectIdentity, Phase};
    use vigil_kubehub::mem::MemCluster;

    fn tiny_cfg() -> EnforceConfig {
        EnforceConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            failure_threshold: 3,
            stop_grace: Duration::from_millis(500),
            notify_cap: 64,
        }
    }

    fn ident(name: &str) -> ObjectIdentity {
        ObjectIdentity::new("v1/ConfigMap", Some("ns"), name)
    }

    fn cm(name: &str, data: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns"},
            "data": data,
        })
    }

    fn patch(src: &str, tgt: &str, from: &str, to: &str, priority: u32) -> PatchDescriptor {
        PatchDescriptor {
            source: ident(src),
            target: ident(tgt),
            projections: vec![FieldProjection {
                from: FieldPath::parse(from).unwrap(),
                to: FieldPath::parse(to).unwrap(),
            }],
            priority,
        }
    }

    async fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn(
        mem: &MemCluster,
        p: PatchDescriptor,
        barrier: &Arc<PatchBarrier>,
    ) -> ReconcilerHandle {
        let (notifier, _rx) = crate::notification_channel(64);
        let parent = ParentKey::new(Some("ns"), "parent");
        spawn_patch_reconciler(
            Arc::new(mem.clone()),
            parent,
            p,
            tiny_cfg(),
            notifier,
            Arc::clone(barrier),
        )
    }

    #[tokio::test]
    async fn projects_source_field_onto_target() {
        let mem = MemCluster::new();
        mem.seed(&ident("src"), cm("src", json!({"x": "42"})));
        mem.seed(&ident("tgt"), cm("tgt", json!({})));
        let p = patch("src", "tgt", ".data.x", ".data.y", 1);
        let barrier = PatchBarrier::new();
        barrier.register(std::slice::from_ref(&p));
        let handle = spawn(&mem, p, &barrier);

        wait_until("projection", Duration::from_secs(2), || {
            mem.get(&ident("tgt")).unwrap()["data"]["y"] == json!("42")
        })
        .await;

        // source changes propagate
        mem.mutate_external(&ident("src"), |obj| {
            obj["data"]["x"] = json!("43");
        });
        wait_until("propagation", Duration::from_secs(2), || {
            mem.get(&ident("tgt")).unwrap()["data"]["y"] == json!("43")
        })
        .await;
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn target_drift_is_reverted() {
        let mem = MemCluster::new();
        mem.seed(&ident("src"), cm("src", json!({"x": "42"})));
        mem.seed(&ident("tgt"), cm("tgt", json!({})));
        let p = patch("src", "tgt", ".data.x", ".data.y", 1);
        let barrier = PatchBarrier::new();
        barrier.register(std::slice::from_ref(&p));
        let handle = spawn(&mem, p, &barrier);
        wait_until("projection", Duration::from_secs(2), || {
            mem.get(&ident("tgt")).unwrap()["data"]["y"] == json!("42")
        })
        .await;

        mem.mutate_external(&ident("tgt"), |obj| {
            obj["data"]["y"] = json!("tampered");
        });
        wait_until("revert", Duration::from_secs(2), || {
            mem.get(&ident("tgt")).unwrap()["data"]["y"] == json!("42")
        })
        .await;
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn missing_source_path_is_a_configuration_failure() {
        let mem = MemCluster::new();
        mem.seed(&ident("src"), cm("src", json!({})));
        mem.seed(&ident("tgt"), cm("tgt", json!({})));
        let p = patch("src", "tgt", ".data.nope", ".data.y", 1);
        let barrier = PatchBarrier::new();
        barrier.register(std::slice::from_ref(&p));
        let handle = spawn(&mem, p, &barrier);

        wait_until("failure status", Duration::from_secs(2), || {
            handle.status().phase == Phase::Failure
        })
        .await;
        assert!(handle.status().reason.contains("source path"));
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn higher_priority_waits_for_lower_apply() {
        let mem = MemCluster::new();
        // p1's source does not exist yet, so p1 cannot complete its first
        // apply; p2 must hold off even though its own source is ready.
        mem.seed(&ident("s2"), cm("s2", json!({"b": "2"})));
        mem.seed(&ident("tgt"), cm("tgt", json!({})));
        let p1 = patch("s1", "tgt", ".data.a", ".data.a", 1);
        let p2 = patch("s2", "tgt", ".data.b", ".data.b", 2);
        let barrier = PatchBarrier::new();
        barrier.register(&[p1.clone(), p2.clone()]);
        let h1 = spawn(&mem, p1, &barrier);
        let h2 = spawn(&mem, p2, &barrier);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            mem.get(&ident("tgt")).unwrap()["data"].get("b").is_none(),
            "priority 2 applied before priority 1"
        );

        mem.seed(&ident("s1"), cm("s1", json!({"a": "1"})));
        wait_until("ordered application", Duration::from_secs(2), || {
            let t = mem.get(&ident("tgt")).unwrap();
            t["data"].get("a") == Some(&json!("1")) && t["data"].get("b") == Some(&json!("2"))
        })
        .await;
        h1.stop(Duration::from_millis(500)).await;
        h2.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn equal_priority_patches_gate_independently() {
        let p1a = patch("s1", "tgt", ".data.a", ".data.a", 1);
        let p1b = patch("s2", "tgt", ".data.b", ".data.b", 1);
        let p2 = patch("s3", "tgt", ".data.c", ".data.c", 2);
        let tgt = ident("tgt").key();
        let barrier = PatchBarrier::new();
        barrier.register(&[p1a.clone(), p1b.clone(), p2]);

        // one of two priority-1 patches done: priority 2 must stay gated
        barrier.mark_applied(&tgt, 1, &p1a.key());
        let gated =
            tokio::time::timeout(Duration::from_millis(100), barrier.wait_for_lower(&tgt, 2))
                .await;
        assert!(gated.is_err(), "released while an equal-priority sibling never applied");

        barrier.mark_applied(&tgt, 1, &p1b.key());
        tokio::time::timeout(Duration::from_millis(500), barrier.wait_for_lower(&tgt, 2))
            .await
            .expect("both priority-1 patches done");

        // clearing one patch re-gates without touching the sibling's mark
        barrier.clear_mark(&tgt, 1, &p1a.key());
        let gated =
            tokio::time::timeout(Duration::from_millis(100), barrier.wait_for_lower(&tgt, 2))
                .await;
        assert!(gated.is_err(), "released after one mark was cleared");
        barrier.mark_applied(&tgt, 1, &p1a.key());
        tokio::time::timeout(Duration::from_millis(500), barrier.wait_for_lower(&tgt, 2))
            .await
            .expect("sibling's mark survived the clear");
    }

    #[tokio::test]
    async fn equal_priority_sibling_holds_back_higher_priority() {
        let mem = MemCluster::new();
        // s1 missing: its priority-1 patch cannot complete, so the
        // priority-2 patch must hold off even though the other priority-1
        // patch applies fine.
        mem.seed(&ident("s2"), cm("s2", json!({"b": "2"})));
        mem.seed(&ident("s3"), cm("s3", json!({"c": "3"})));
        mem.seed(&ident("tgt"), cm("tgt", json!({})));
        let p1a = patch("s1", "tgt", ".data.a", ".data.a", 1);
        let p1b = patch("s2", "tgt", ".data.b", ".data.b", 1);
        let p2 = patch("s3", "tgt", ".data.c", ".data.c", 2);
        let barrier = PatchBarrier::new();
        barrier.register(&[p1a.clone(), p1b.clone(), p2.clone()]);
        let h1a = spawn(&mem, p1a, &barrier);
        let h1b = spawn(&mem, p1b, &barrier);
        let h2 = spawn(&mem, p2, &barrier);

        wait_until("sibling applied", Duration::from_secs(2), || {
            mem.get(&ident("tgt")).unwrap()["data"].get("b") == Some(&json!("2"))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            mem.get(&ident("tgt")).unwrap()["data"].get("c").is_none(),
            "priority 2 applied while a priority-1 patch never completed"
        );

        mem.seed(&ident("s1"), cm("s1", json!({"a": "1"})));
        wait_until("full application", Duration::from_secs(2), || {
            let t = mem.get(&ident("tgt")).unwrap();
            t["data"].get("a") == Some(&json!("1")) && t["data"].get("c") == Some(&json!("3"))
        })
        .await;
        h1a.stop(Duration::from_millis(500)).await;
        h1b.stop(Duration::from_millis(500)).await;
        h2.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn watch_establishment_failure_records_event() {
        let mem = MemCluster::new();
        mem.seed(&ident("src"), cm("src", json!({"x": "42"})));
        mem.seed(&ident("tgt"), cm("tgt", json!({})));
        mem.fail_next_watches(&ident("src"), 1);
        let p = patch("src", "tgt", ".data.x", ".data.y", 1);
        let barrier = PatchBarrier::new();
        barrier.register(std::slice::from_ref(&p));
        let handle = spawn(&mem, p, &barrier);

        wait_until("failure status", Duration::from_secs(2), || {
            handle.status().phase == Phase::Failure
        })
        .await;
        assert!(mem.recorded_events().iter().any(|e| e.reason == "WatchFailed"));
        handle.stop(Duration::from_millis(500)).await;
    }
}
