//! Vigil enforce: the per-resource and per-patch watch/enforce loops, plus
//! the plumbing they share (backoff, status publication, notification
//! fan-in, task handles).

#![forbid(unsafe_code)]

pub mod object;
pub mod patch;

use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use vigil_core::{ParentKey, StatusEntry};

pub use object::spawn_object_reconciler;
pub use patch::{spawn_patch_reconciler, PatchBarrier};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default)
}

/// Runtime knobs for the enforcement loops.
#[derive(Debug, Clone)]
pub struct EnforceConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive transient failures before a Failure status is published.
    pub failure_threshold: u32,
    /// How long `stop` waits for a task before aborting it.
    pub stop_grace: Duration,
    /// Capacity of the parent notification queue.
    pub notify_cap: usize,
}

impl Default for EnforceConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            failure_threshold: 5,
            stop_grace: Duration::from_millis(2000),
            notify_cap: 256,
        }
    }
}

impl EnforceConfig {
    /// Read knobs from `VIGIL_*` environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            initial_backoff: Duration::from_millis(env_u64("VIGIL_BACKOFF_INITIAL_MS", 500)),
            max_backoff: Duration::from_secs(env_u64("VIGIL_BACKOFF_MAX_SECS", 30)),
            failure_threshold: env_u64("VIGIL_FAILURE_THRESHOLD", 5) as u32,
            stop_grace: Duration::from_millis(env_u64("VIGIL_STOP_GRACE_MS", 2000)),
            notify_cap: env_u64("VIGIL_QUEUE_CAP", 256) as usize,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(cfg: &EnforceConfig) -> Self {
        Self {
            initial: cfg.initial_backoff,
            max: cfg.max_backoff,
            next: cfg.initial_backoff,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = (self.next * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Non-blocking publisher onto the parent notification queue. Shared by all
/// reconcilers of one engine; publishing never stalls a reconciler — when
/// the consumer lags, the signal is dropped and periodic resync covers it.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<ParentKey>,
}

impl Notifier {
    pub fn notify(&self, parent: &ParentKey) {
        if self.tx.try_send(parent.clone()).is_err() {
            counter!("vigil_notify_dropped", 1u64);
            debug!(parent = %parent, "notification queue full; dropping signal");
        }
    }
}

/// Build the bounded notification channel: one publisher handle fanned out
/// to every reconciler, one consumer stream for the outer control loop.
pub fn notification_channel(cap: usize) -> (Notifier, mpsc::Receiver<ParentKey>) {
    let (tx, rx) = mpsc::channel(cap.max(1));
    (Notifier { tx }, rx)
}

/// Handle to one running reconciler task. Owned exclusively by the manager;
/// never reused across a restart.
pub struct ReconcilerHandle {
    key: String,
    cancel: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    status_rx: watch::Receiver<StatusEntry>,
}

impl ReconcilerHandle {
    pub(crate) fn new(
        key: String,
        cancel: oneshot::Sender<()>,
        join: JoinHandle<()>,
        status_rx: watch::Receiver<StatusEntry>,
    ) -> Self {
        Self { key, cancel: Some(cancel), join, status_rx }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Copy of the latest published status; never blocks on the task.
    pub fn status(&self) -> StatusEntry {
        self.status_rx.borrow().clone()
    }

    /// Clone of the status channel for snapshot aggregation.
    pub fn status_watch(&self) -> watch::Receiver<StatusEntry> {
        self.status_rx.clone()
    }

    /// Cancel the task and await its termination, bounded by `grace`; the
    /// task is aborted if it overruns.
    pub async fn stop(mut self, grace: Duration) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            self.join.abort();
            let _ = self.join.await;
        }
    }
}

/// Publish a status entry and signal the parent when it is a visible change.
fn set_status(
    tx: &watch::Sender<StatusEntry>,
    notifier: &Notifier,
    parent: &ParentKey,
    entry: StatusEntry,
    force_notify: bool,
) {
    let changed = {
        let cur = tx.borrow();
        cur.phase != entry.phase || cur.reason != entry.reason
    };
    let _ = tx.send(entry);
    if changed || force_notify {
        notifier.notify(parent);
    }
}
