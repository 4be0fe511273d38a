//! Namespace controller.
//!
//! Lifecycle owner for one namespace: wires the tree caches, the event
//! intake listeners and the sharding engine together, watches the store
//! connection, and tears the chain down (and back up) around session loss.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alarm::AlarmSink;
use crate::cache::TreeCacheManager;
use crate::cleaner::ExecutorCleaner;
use crate::config::CoordinatorConfig;
use crate::engine::ShardingEngine;
use crate::error::Result;
use crate::intake::{
    EventQueue, ExecutorChangeListener, JobChangeListener, LeadershipListener, ShardingEvent,
    ShardingTriggerListener,
};
use crate::store::{ensure_persistent, paths, ConnectionState, CoordinationStore};

/// One started leadership chain: caches feeding listeners feeding the
/// engine. Rebuilt from scratch after every reconnect.
struct Chain {
    caches: Arc<TreeCacheManager>,
    queue: Arc<EventQueue>,
    engine: Arc<ShardingEngine>,
    cleaner: Arc<ExecutorCleaner>,
    engine_task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    chain: Option<Chain>,
    watcher_task: Option<JoinHandle<()>>,
    watcher_cancel: Option<CancellationToken>,
}

struct Shared {
    config: CoordinatorConfig,
    store: Arc<dyn CoordinationStore>,
    alarm: Arc<dyn AlarmSink>,
    inner: Mutex<Inner>,
}

/// Owns every collaborator of one namespace coordinator. Callers hold the
/// controller by reference, `start()` it once, and `stop()` it on the way
/// out.
pub struct NamespaceController {
    shared: Arc<Shared>,
}

impl NamespaceController {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinationStore>,
        alarm: Arc<dyn AlarmSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                alarm,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Start the chain and the connection watcher. Idempotent; a second call
    /// while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.chain.is_none() {
            let chain = self.shared.build_chain().await?;
            inner.chain = Some(chain);
            tracing::info!(namespace = %self.shared.config.namespace, "Namespace coordinator started");
        }
        if inner.watcher_task.is_none() {
            let cancel = CancellationToken::new();
            let task = tokio::spawn(Shared::watch_connection(
                self.shared.clone(),
                cancel.clone(),
            ));
            inner.watcher_cancel = Some(cancel);
            inner.watcher_task = Some(task);
        }
        Ok(())
    }

    /// Orderly shutdown, reverse of `start`: connection watcher first, then
    /// caches, then the engine (which releases the leader lock).
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut inner = self.shared.inner.lock().await;
            (inner.watcher_cancel.take(), inner.watcher_task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        let chain = self.shared.inner.lock().await.chain.take();
        if let Some(chain) = chain {
            Shared::stop_chain(chain).await;
        }
        tracing::info!(namespace = %self.shared.config.namespace, "Namespace coordinator stopped");
    }

    /// Engine handle for observing leadership state; `None` while stopped.
    pub async fn engine(&self) -> Option<Arc<ShardingEngine>> {
        self.shared
            .inner
            .lock()
            .await
            .chain
            .as_ref()
            .map(|chain| chain.engine.clone())
    }
}

impl Shared {
    /// Build and wire one chain: caches, election, listeners, engine loop.
    async fn build_chain(&self) -> Result<Chain> {
        let caches = Arc::new(TreeCacheManager::new(self.store.clone()));
        let queue = Arc::new(EventQueue::new(self.config.event_queue_capacity));
        let cleaner = ExecutorCleaner::new(self.store.clone());
        let engine = ShardingEngine::new(
            self.store.clone(),
            queue.clone(),
            self.alarm.clone(),
            self.config.host_id.clone(),
            self.config.retry_base,
            self.config.retry_max,
        );

        for root in [paths::JOBS, paths::EXECUTORS, paths::SHARDING, paths::LEADER] {
            ensure_persistent(self.store.as_ref(), root).await?;
        }

        engine.elect_leader().await?;

        caches.add_cache(paths::JOBS, 1);
        caches.add_listener(
            paths::JOBS,
            1,
            Arc::new(JobChangeListener::new(queue.clone())),
        )?;
        caches.add_cache(paths::EXECUTORS, 2);
        caches.add_listener(
            paths::EXECUTORS,
            2,
            Arc::new(ExecutorChangeListener::new(queue.clone(), cleaner.clone())),
        )?;
        caches.add_cache(paths::SHARDING, 1);
        caches.add_listener(
            paths::SHARDING,
            1,
            Arc::new(ShardingTriggerListener::new(queue.clone())),
        )?;
        caches.add_cache(paths::LEADER, 1);
        caches.add_listener(
            paths::LEADER,
            1,
            Arc::new(LeadershipListener::new(queue.clone())),
        )?;

        let engine_task = tokio::spawn(engine.clone().run());

        Ok(Chain {
            caches,
            queue,
            engine,
            cleaner,
            engine_task,
        })
    }

    async fn stop_chain(chain: Chain) {
        chain.caches.shutdown().await;
        chain.queue.close();
        chain.engine.shutdown();
        if let Err(err) = chain.engine_task.await {
            if !err.is_cancelled() {
                tracing::warn!(error = %err, "Engine task failed during shutdown");
            }
        }
        chain.cleaner.shutdown().await;
    }

    /// React to store connection transitions: suspension tears the chain
    /// down, reconnection rebuilds it from scratch. Ephemeral nodes vanished
    /// with the old session, so the rebuild is a fresh election.
    async fn watch_connection(shared: Arc<Shared>, cancel: CancellationToken) {
        let mut states = shared.store.connection_events();
        loop {
            let state = tokio::select! {
                _ = cancel.cancelled() => break,
                state = states.recv() => match state {
                    Ok(state) => state,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };
            match state {
                ConnectionState::Suspended | ConnectionState::Lost => {
                    tracing::warn!(
                        namespace = %shared.config.namespace,
                        ?state,
                        "Store connection degraded, stopping sharding chain"
                    );
                    let chain = shared.inner.lock().await.chain.take();
                    if let Some(chain) = chain {
                        Self::stop_chain(chain).await;
                    }
                }
                ConnectionState::Reconnected => {
                    tracing::info!(
                        namespace = %shared.config.namespace,
                        "Store connection restored, restarting sharding chain"
                    );
                    let mut inner = shared.inner.lock().await;
                    if inner.chain.is_none() {
                        match shared.build_chain().await {
                            Ok(chain) => {
                                chain.queue.push(ShardingEvent::Resync);
                                inner.chain = Some(chain);
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "Chain restart failed, waiting for next reconnect");
                            }
                        }
                    }
                }
                ConnectionState::Connected => {}
            }
        }
    }
}
