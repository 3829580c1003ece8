//! Object Reconciler: one continuous watch/enforce loop per managed
//! resource. Observes drift on a single object and re-applies the desired
//! projection, leaving excluded paths untouched.

use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use vigil_core::{
    merge_desired, prune_excluded, EnforceResult, ParentKey, ResourceDescriptor, StatusEntry,
};
use vigil_kubehub::{ClusterOps, EventSeverity, WatchEvent};

use crate::{set_status, Backoff, EnforceConfig, Notifier, ReconcilerHandle};

/// Result of one drift check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Live state already matches the desired projection.
    Unchanged,
    /// The event echoes our own last write.
    SelfUpdate,
    Created,
    Corrected,
}

/// Start the enforcement task for one resource descriptor.
pub fn spawn_object_reconciler(
    cluster: Arc<dyn ClusterOps>,
    parent: ParentKey,
    descriptor: ResourceDescriptor,
    cfg: EnforceConfig,
    notifier: Notifier,
) -> ReconcilerHandle {
    let key = descriptor.identity.key();
    let (status_tx, status_rx) = watch::channel(StatusEntry::success(&key));
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let join = tokio::spawn(run(cluster, parent, descriptor, cfg, notifier, status_tx, cancel_rx));
    ReconcilerHandle::new(key, cancel_tx, join, status_rx)
}

async fn run(
    cluster: Arc<dyn ClusterOps>,
    parent: ParentKey,
    descriptor: ResourceDescriptor,
    cfg: EnforceConfig,
    notifier: Notifier,
    status_tx: watch::Sender<StatusEntry>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let key = descriptor.identity.key();

    // Starting: a watch that cannot be established is a Failure status, not
    // an endless retry.
    let mut stream = match cluster.watch(&descriptor.identity).await {
        Ok(s) => s,
        Err(e) => {
            warn!(object = %key, error = %e, "failed to establish watch");
            cluster
                .record_event(&parent, EventSeverity::Warning, "WatchFailed", &e.to_string())
                .await;
            set_status(&status_tx, &notifier, &parent, StatusEntry::failure(&key, e.to_string()), true);
            return;
        }
    };
    info!(object = %key, "object reconciler watching");

    let mut backoff = Backoff::new(&cfg);
    let mut failures = 0u32;
    let mut last_applied: Option<Value> = None;

    'main: loop {
        let ev = tokio::select! {
            _ = &mut cancel_rx => break 'main,
            ev = stream.rx.recv() => ev,
        };
        let Some(ev) = ev else {
            set_status(
                &status_tx,
                &notifier,
                &parent,
                StatusEntry::failure(&key, "watch stream closed"),
                true,
            );
            break 'main;
        };

        counter!("vigil_reconcile_total", 1u64);
        loop {
            match reconcile_once(cluster.as_ref(), &descriptor, &mut last_applied, &ev).await {
                Ok(outcome) => {
                    failures = 0;
                    backoff.reset();
                    let wrote = match outcome {
                        Outcome::Unchanged => false,
                        Outcome::SelfUpdate => {
                            debug!(object = %key, "own write observed");
                            false
                        }
                        Outcome::Created => {
                            counter!("vigil_objects_created", 1u64);
                            info!(object = %key, "created from desired content");
                            true
                        }
                        Outcome::Corrected => {
                            counter!("vigil_drift_corrections", 1u64);
                            info!(object = %key, "drift corrected");
                            true
                        }
                    };
                    set_status(&status_tx, &notifier, &parent, StatusEntry::success(&key), wrote);
                    break;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    counter!("vigil_enforce_failures", 1u64);
                    warn!(object = %key, error = %e, failures, "transient enforcement failure");
                    if failures == cfg.failure_threshold {
                        cluster
                            .record_event(&parent, EventSeverity::Warning, "EnforcementFailing", &e.to_string())
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
                    // Configuration error: report once and hold until the
                    // object (or the desired set) changes.
                    warn!(object = %key, error = %e, "enforcement configuration error");
                    cluster
                        .record_event(&parent, EventSeverity::Warning, "ProcessingError", &e.to_string())
                        .await;
                    set_status(&status_tx, &notifier, &parent, StatusEntry::failure(&key, e.to_string()), true);
                    break;
                }
            }
        }
    }

    stream.cancel.cancel();
    debug!(object = %key, "object reconciler stopped");
}

async fn reconcile_once(
    cluster: &dyn ClusterOps,
    d: &ResourceDescriptor,
    last_applied: &mut Option<Value>,
    ev: &WatchEvent,
) -> EnforceResult<Outcome> {
    // Self-generated updates are recognized against last-applied content,
    // not by diffing whatever came back from the write.
    if let WatchEvent::Applied(obj) = ev {
        if let Some(last) = last_applied.as_ref() {
            if prune_excluded(obj, &d.excluded_paths) == *last {
                return Ok(Outcome::SelfUpdate);
            }
        }
    }

    let live = cluster.fetch(&d.identity).await?;
    match live {
        None => {
            let stored = cluster.apply(&d.identity, d.desired.clone()).await?;
            *last_applied = Some(prune_excluded(&stored, &d.excluded_paths));
            Ok(Outcome::Created)
        }
        Some(live) => {
            let merged = merge_desired(&live, &d.desired, &d.excluded_paths);
            if merged == live {
                *last_applied = Some(prune_excluded(&live, &d.excluded_paths));
                return Ok(Outcome::Unchanged);
            }
            let stored = cluster.apply(&d.identity, merged).await?;
            *last_applied = Some(prune_excluded(&stored, &d.excluded_paths));
            Ok(Outcome::Corrected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use serde_json::json;
    use vigil_core::{FieldPath, Phase};
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

    fn descriptor(name: &str, data: Value) -> ResourceDescriptor {
        ResourceDescriptor::from_manifest(
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "ns"},
                "data": data,
            }),
            [],
        )
        .unwrap()
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
        d: ResourceDescriptor,
    ) -> (ReconcilerHandle, tokio::sync::mpsc::Receiver<ParentKey>) {
        let (notifier, rx) = crate::notification_channel(64);
        let parent = ParentKey::new(Some("ns"), "parent");
        let handle = spawn_object_reconciler(Arc::new(mem.clone()), parent, d, tiny_cfg(), notifier);
        (handle, rx)
    }

    #[tokio::test]
    async fn creates_absent_object() {
        let mem = MemCluster::new();
        let d = descriptor("a", json!({"k": "v"}));
        let id = d.identity.clone();
        let (handle, _rx) = spawn(&mem, d);

        wait_until("object creation", Duration::from_secs(2), || mem.contains(&id)).await;
        assert_eq!(mem.get(&id).unwrap()["data"]["k"], json!("v"));
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn corrects_external_drift_once() {
        let mem = MemCluster::new();
        let d = descriptor("a", json!({"k": "v"}));
        let id = d.identity.clone();
        let (handle, _rx) = spawn(&mem, d);
        wait_until("object creation", Duration::from_secs(2), || mem.contains(&id)).await;

        mem.mutate_external(&id, |obj| {
            obj["data"]["k"] = json!("tampered");
        });
        wait_until("drift correction", Duration::from_secs(2), || {
            mem.get(&id).unwrap()["data"]["k"] == json!("v")
        })
        .await;

        // exactly one corrective write: rv settles and stays put
        let rv = mem.resource_version(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(mem.resource_version(&id).unwrap(), rv);
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn excluded_path_mutation_never_triggers_a_write() {
        let mem = MemCluster::new();
        let mut d = descriptor("a", json!({"k": "v"}));
        d.excluded_paths = vigil_core::ExcludedPaths::with_defaults([
            FieldPath::parse(".data.external").unwrap(),
        ]);
        let id = d.identity.clone();
        let (handle, _rx) = spawn(&mem, d);
        wait_until("object creation", Duration::from_secs(2), || mem.contains(&id)).await;

        mem.mutate_external(&id, |obj| {
            obj["data"]["external"] = json!("theirs");
        });
        let rv = mem.resource_version(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(mem.resource_version(&id).unwrap(), rv, "no write expected");
        assert_eq!(mem.get(&id).unwrap()["data"]["external"], json!("theirs"));
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn failure_status_after_threshold_then_recovers() {
        let mem = MemCluster::new();
        let d = descriptor("a", json!({"k": "v"}));
        let id = d.identity.clone();
        mem.fail_next_applies(&id, 5);
        let (handle, _rx) = spawn(&mem, d);

        wait_until("failure status", Duration::from_secs(2), || {
            handle.status().phase == Phase::Failure
        })
        .await;
        // retries keep going past the threshold and eventually converge
        wait_until("recovery", Duration::from_secs(5), || {
            handle.status().phase == Phase::Success && mem.contains(&id)
        })
        .await;
        assert!(mem
            .recorded_events()
            .iter()
            .any(|e| e.reason == "EnforcementFailing"));
        handle.stop(Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn stop_cancels_mid_backoff_within_grace() {
        let mem = MemCluster::new();
        let d = descriptor("a", json!({"k": "v"}));
        let id = d.identity.clone();
        // Large max backoff so the task is parked in a backoff sleep.
        let cfg = EnforceConfig {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..tiny_cfg()
        };
        mem.fail_next_applies(&id, 1000);
        let (notifier, _rx) = crate::notification_channel(64);
        let parent = ParentKey::new(Some("ns"), "parent");
        let handle =
            spawn_object_reconciler(Arc::new(mem.clone()), parent, d, cfg, notifier);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let t0 = Instant::now();
        handle.stop(Duration::from_millis(500)).await;
        assert!(t0.elapsed() < Duration::from_millis(500));
    }
}
