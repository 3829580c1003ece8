//! Vigil kubehub: the cluster capability set consumed by the enforcement
//! engine, its kube-rs implementation, and an in-memory fake for tests.

#![forbid(unsafe_code)]

pub mod mem;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use vigil_core::{EnforceError, EnforceResult, ObjectIdentity, ParentKey, StatusSnapshot};

/// Change notification for one watched identity.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The object exists (created, updated, or seen on watch restart).
    Applied(Value),
    /// The object is absent.
    Deleted,
}

/// Severity for recorded events, mirroring Kubernetes event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Cancellation handle for an in-flight watch.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }

    fn noop() -> Self {
        Self { tx: None }
    }
}

/// A live watch on one object identity.
pub struct WatchStream {
    pub rx: mpsc::Receiver<WatchEvent>,
    pub cancel: CancelHandle,
}

fn queue_cap() -> usize {
    std::env::var("VIGIL_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(256)
}

/// The capability set the engine consumes. Everything the engine knows about
/// a cluster goes through this seam; tests use [`mem::MemCluster`].
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Fetch the live object, or `None` when absent.
    async fn fetch(&self, id: &ObjectIdentity) -> EnforceResult<Option<Value>>;

    /// Create-or-update the full object; returns the stored representation.
    async fn apply(&self, id: &ObjectIdentity, obj: Value) -> EnforceResult<Value>;

    /// Delete the object; idempotent on already-absent.
    async fn delete(&self, id: &ObjectIdentity) -> EnforceResult<()>;

    /// Infinite stream of change events for one identity, restartable on
    /// disconnect. The first event reflects current existence.
    async fn watch(&self, id: &ObjectIdentity) -> EnforceResult<WatchStream>;

    /// Best-effort event recording for the owning parent.
    async fn record_event(&self, parent: &ParentKey, severity: EventSeverity, reason: &str, message: &str);

    /// Persist the aggregated status snapshot for the owning parent.
    async fn persist_status(&self, parent: &ParentKey, snapshot: &StatusSnapshot) -> EnforceResult<()>;
}

fn parse_gvk_key(key: &str) -> EnforceResult<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(EnforceError::Configuration(format!(
            "invalid gvk key: {key} (expect v1/Kind or group/v1/Kind)"
        ))),
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> EnforceResult<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| EnforceError::Transient(format!("discovery failed: {e}")))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(EnforceError::Configuration(format!(
        "GVK not found: {}/{}/{}",
        gvk.group, gvk.version, gvk.kind
    )))
}

fn classify_kube_err(context: &str, e: kube::Error) -> EnforceError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 || ae.code >= 500 => {
            EnforceError::Transient(format!("{context}: {ae}"))
        }
        kube::Error::Api(ae) if ae.code == 404 => {
            EnforceError::NotFound(format!("{context}: {ae}"))
        }
        kube::Error::Api(ae) => EnforceError::Configuration(format!("{context}: {ae}")),
        other => EnforceError::Transient(format!("{context}: {other}")),
    }
}

/// Live-cluster implementation of [`ClusterOps`] on kube-rs dynamic APIs.
pub struct KubeCluster {
    client: Client,
    /// GVK key of the parent custom resource, when status persistence is
    /// wanted. `None` disables `persist_status`.
    parent_gvk_key: Option<String>,
}

impl KubeCluster {
    pub async fn connect(parent_gvk_key: Option<String>) -> EnforceResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| EnforceError::Transient(format!("kube client init: {e}")))?;
        Ok(Self { client, parent_gvk_key })
    }

    async fn dynamic_api(&self, id: &ObjectIdentity) -> EnforceResult<Api<DynamicObject>> {
        let gvk = parse_gvk_key(&id.gvk_key)?;
        let (ar, namespaced) = find_api_resource(self.client.clone(), &gvk).await?;
        let api = if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => {
                    return Err(EnforceError::Configuration(format!(
                        "namespace required for namespaced kind {}",
                        id.gvk_key
                    )))
                }
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn fetch(&self, id: &ObjectIdentity) -> EnforceResult<Option<Value>> {
        let api = self.dynamic_api(id).await?;
        let obj = api
            .get_opt(&id.name)
            .await
            .map_err(|e| classify_kube_err("get", e))?;
        match obj {
            Some(o) => Ok(Some(
                serde_json::to_value(&o)
                    .map_err(|e| EnforceError::Internal(format!("serializing object: {e}")))?,
            )),
            None => Ok(None),
        }
    }

    async fn apply(&self, id: &ObjectIdentity, obj: Value) -> EnforceResult<Value> {
        let api = self.dynamic_api(id).await?;
        counter!("vigil_apply_attempts", 1u64);
        let t0 = std::time::Instant::now();
        let pp = PatchParams::apply("vigil").force();
        let stored = api
            .patch(&id.name, &pp, &Patch::Apply(&obj))
            .await
            .map_err(|e| {
                counter!("vigil_apply_errors", 1u64);
                classify_kube_err("apply", e)
            })?;
        counter!("vigil_apply_ok", 1u64);
        histogram!("vigil_apply_ms", t0.elapsed().as_millis() as f64);
        serde_json::to_value(&stored)
            .map_err(|e| EnforceError::Internal(format!("serializing applied object: {e}")))
    }

    async fn delete(&self, id: &ObjectIdentity) -> EnforceResult<()> {
        let api = self.dynamic_api(id).await?;
        match api.delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(classify_kube_err("delete", e)),
        }
    }

    async fn watch(&self, id: &ObjectIdentity) -> EnforceResult<WatchStream> {
        // Resolve the API up front so unknown types fail establishment
        // instead of looping inside the watch task.
        let api = self.dynamic_api(id).await?;
        let (tx, rx) = mpsc::channel::<WatchEvent>(queue_cap());
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let name = id.name.clone();
        let key = id.key();

        tokio::spawn(async move {
            let cfg = watcher::Config::default().fields(&format!("metadata.name={name}"));
            let stream = watcher::watcher(api, cfg);
            futures::pin_mut!(stream);
            info!(object = %key, "watch started");
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!(object = %key, "watch cancelled");
                        break;
                    }
                    ev = stream.next() => {
                        let Some(ev) = ev else {
                            warn!(object = %key, "watch stream ended");
                            break;
                        };
                        match ev {
                            Ok(Event::Applied(o)) => {
                                match serde_json::to_value(&o) {
                                    Ok(v) => { let _ = tx.send(WatchEvent::Applied(v)).await; }
                                    Err(e) => warn!(object = %key, error = %e, "dropping unserializable event"),
                                }
                            }
                            Ok(Event::Deleted(_)) => {
                                let _ = tx.send(WatchEvent::Deleted).await;
                            }
                            Ok(Event::Restarted(list)) => {
                                // Name-scoped watch: the relist holds zero or one item.
                                match list.into_iter().next() {
                                    Some(o) => match serde_json::to_value(&o) {
                                        Ok(v) => { let _ = tx.send(WatchEvent::Applied(v)).await; }
                                        Err(e) => warn!(object = %key, error = %e, "dropping unserializable relist"),
                                    },
                                    None => { let _ = tx.send(WatchEvent::Deleted).await; }
                                }
                            }
                            Err(e) => {
                                // The watcher recovers on its own; surface and keep polling.
                                warn!(object = %key, error = %e, "watch error");
                                counter!("vigil_watch_errors", 1u64);
                            }
                        }
                        if tx.is_closed() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(WatchStream { rx, cancel: CancelHandle { tx: Some(cancel_tx) } })
    }

    async fn record_event(&self, parent: &ParentKey, severity: EventSeverity, reason: &str, message: &str) {
        // Dynamic parents carry no object reference to hang a v1 Event on;
        // surface through structured logs and metrics instead.
        counter!("vigil_recorded_events", 1u64);
        match severity {
            EventSeverity::Normal => info!(parent = %parent, reason, message, "event"),
            EventSeverity::Warning => warn!(parent = %parent, reason, message, "event"),
        }
    }

    async fn persist_status(&self, parent: &ParentKey, snapshot: &StatusSnapshot) -> EnforceResult<()> {
        let Some(gvk_key) = self.parent_gvk_key.as_deref() else {
            debug!(parent = %parent, "no parent GVK configured; skipping status persist");
            return Ok(());
        };
        let (namespace, name) = match parent.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, parent.0.as_str()),
        };
        let id = ObjectIdentity::new(gvk_key, namespace, name);
        let api = self.dynamic_api(&id).await?;
        let body = serde_json::json!({
            "status": { "resourceStatuses": snapshot }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| classify_kube_err("status patch", e))?;
        Ok(())
    }
}
