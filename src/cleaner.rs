//! Executor clean service.
//!
//! When an executor drops offline, its ephemeral status nodes under every
//! job can leave stale children behind on slow stores. The cleaner purges
//! `/jobs/<job>/servers/<exe>/status` for each job so the next sharding
//! snapshot sees a clean slate. Assignment records (`sharding` CSVs) are the
//! engine's to rewrite and are left alone, which is what keeps no-failover
//! jobs' shards recorded against offline executors.
//!
//! Purges run on a dedicated task; cache listeners only enqueue executor
//! names.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::{paths, CoordinationStore};

const PURGE_QUEUE_CAPACITY: usize = 64;

pub struct ExecutorCleaner {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorCleaner {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(PURGE_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    exe = rx.recv() => match exe {
                        Some(exe) => purge(store.as_ref(), &exe).await,
                        None => break,
                    },
                }
            }
        });
        Arc::new(Self {
            tx,
            cancel,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Request a purge of `exe`'s per-job state. Never blocks; a full queue
    /// drops the request (the engine's snapshot tolerates leftovers).
    pub fn schedule(&self, exe: String) {
        if let Err(err) = self.tx.try_send(exe) {
            tracing::warn!(error = %err, "Executor purge request dropped");
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().expect("cleaner handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn purge(store: &dyn CoordinationStore, exe: &str) {
    let jobs = match store.children(paths::JOBS).await {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::warn!(executor = %exe, error = %err, "Purge skipped, job listing failed");
            return;
        }
    };
    for job in jobs {
        let status = paths::server_status(&job, exe);
        if let Err(err) = store.delete(&status).await {
            tracing::warn!(executor = %exe, job = %job, error = %err, "Status purge failed");
        }
    }
    tracing::debug!(executor = %exe, "Purged offline executor state");
}
