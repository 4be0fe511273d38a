//! Tree cache manager.
//!
//! Materializes selected store subtrees to a bounded depth and fans change
//! events out to registered listeners. One cache exists per `(path, depth)`
//! pair; registering the same pair twice attaches to the existing cache.
//! Each cache runs one task, so its listeners observe events serially, in
//! store order. Listeners must only enqueue — anything slow belongs on the
//! event intake queue.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordinationError, Result};
use crate::store::{paths, CoordinationStore, NodeEvent, NodeEventKind, Stat};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    NodeAdded,
    NodeUpdated,
    NodeRemoved,
    /// Initial subtree snapshot has been delivered.
    Initialized,
    ConnectionSuspended,
    ConnectionReconnected,
    ConnectionLost,
}

/// Event delivered to cache listeners. Connection events carry the cache
/// root as their path and no data.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub path: String,
    pub data: Option<Vec<u8>>,
    pub stat: Stat,
}

pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

struct TreeCache {
    root: String,
    depth: usize,
    listeners: Arc<Mutex<Vec<Arc<dyn CacheListener>>>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every tree cache of one namespace coordinator.
pub struct TreeCacheManager {
    store: Arc<dyn CoordinationStore>,
    // Insertion order retained so shutdown can release in reverse.
    caches: Mutex<Vec<TreeCache>>,
}

impl TreeCacheManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            caches: Mutex::new(Vec::new()),
        }
    }

    /// Start caching `root` down to `depth` levels. Idempotent per
    /// `(root, depth)`.
    pub fn add_cache(&self, root: &str, depth: usize) {
        let mut caches = self.caches.lock().expect("cache registry lock");
        if caches
            .iter()
            .any(|cache| cache.root == root && cache.depth == depth)
        {
            return;
        }
        let listeners: Arc<Mutex<Vec<Arc<dyn CacheListener>>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let worker = CacheWorker {
            store: self.store.clone(),
            root: root.to_string(),
            depth,
            listeners: listeners.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());
        tracing::debug!(root = %root, depth, "Tree cache started");
        caches.push(TreeCache {
            root: root.to_string(),
            depth,
            listeners,
            cancel,
            handle,
        });
    }

    /// Attach a listener to the existing cache for `(root, depth)`.
    pub fn add_listener(
        &self,
        root: &str,
        depth: usize,
        listener: Arc<dyn CacheListener>,
    ) -> Result<()> {
        let caches = self.caches.lock().expect("cache registry lock");
        let cache = caches
            .iter()
            .find(|cache| cache.root == root && cache.depth == depth)
            .ok_or_else(|| CoordinationError::NoSuchCache {
                path: root.to_string(),
                depth,
            })?;
        cache
            .listeners
            .lock()
            .expect("cache listener lock")
            .push(listener);
        Ok(())
    }

    /// Release all caches and their listeners, newest first.
    pub async fn shutdown(&self) {
        let mut caches: Vec<TreeCache> = {
            let mut guard = self.caches.lock().expect("cache registry lock");
            guard.drain(..).collect()
        };
        while let Some(cache) = caches.pop() {
            cache.cancel.cancel();
            if let Err(err) = cache.handle.await {
                if !err.is_cancelled() {
                    tracing::warn!(root = %cache.root, error = %err, "Tree cache task failed");
                }
            }
            cache.listeners.lock().expect("cache listener lock").clear();
            tracing::debug!(root = %cache.root, depth = cache.depth, "Tree cache released");
        }
    }
}

struct CacheWorker {
    store: Arc<dyn CoordinationStore>,
    root: String,
    depth: usize,
    listeners: Arc<Mutex<Vec<Arc<dyn CacheListener>>>>,
    cancel: CancellationToken,
}

impl CacheWorker {
    async fn run(self) {
        // Subscribe before the initial load so nothing falls between.
        let mut node_events = self.store.node_events();
        let mut conn_events = self.store.connection_events();

        let mut known = std::collections::BTreeSet::new();
        self.load_initial(&mut known).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = node_events.recv() => match event {
                    Ok(event) => self.handle_node_event(event, &mut known),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(root = %self.root, missed, "Cache fell behind store events, reloading");
                        known.clear();
                        self.load_initial(&mut known).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                state = conn_events.recv() => match state {
                    Ok(state) => {
                        use crate::store::ConnectionState::*;
                        let kind = match state {
                            Suspended => Some(CacheEventKind::ConnectionSuspended),
                            Reconnected => Some(CacheEventKind::ConnectionReconnected),
                            Lost => Some(CacheEventKind::ConnectionLost),
                            Connected => None,
                        };
                        if let Some(kind) = kind {
                            self.deliver(CacheEvent {
                                kind,
                                path: self.root.clone(),
                                data: None,
                                stat: Stat::default(),
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Snapshot the current subtree, delivering `NodeAdded` per node and a
    /// final `Initialized`.
    async fn load_initial(&self, known: &mut std::collections::BTreeSet<String>) {
        let mut frontier = vec![(self.root.clone(), 0usize)];
        while let Some((path, level)) = frontier.pop() {
            if level > 0 {
                match self.store.get_with_stat(&path).await {
                    Ok(Some((data, stat))) => {
                        known.insert(path.clone());
                        self.deliver(CacheEvent {
                            kind: CacheEventKind::NodeAdded,
                            path: path.clone(),
                            data: Some(data),
                            stat,
                        });
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::debug!(root = %self.root, path = %path, error = %err, "Initial cache read failed");
                        continue;
                    }
                }
            }
            if level < self.depth {
                match self.store.children(&path).await {
                    Ok(children) => {
                        // Reverse keeps delivery in ascending name order for
                        // the depth-first walk.
                        for child in children.into_iter().rev() {
                            frontier.push((format!("{path}/{child}"), level + 1));
                        }
                    }
                    Err(err) => {
                        tracing::debug!(root = %self.root, path = %path, error = %err, "Initial cache list failed");
                    }
                }
            }
        }
        self.deliver(CacheEvent {
            kind: CacheEventKind::Initialized,
            path: self.root.clone(),
            data: None,
            stat: Stat::default(),
        });
    }

    fn in_scope(&self, path: &str) -> bool {
        matches!(paths::depth_below(&self.root, path), Some(depth) if depth >= 1 && depth <= self.depth)
    }

    fn handle_node_event(
        &self,
        event: NodeEvent,
        known: &mut std::collections::BTreeSet<String>,
    ) {
        if !self.in_scope(&event.path) {
            return;
        }
        let kind = match event.kind {
            NodeEventKind::Created => {
                if known.insert(event.path.clone()) {
                    CacheEventKind::NodeAdded
                } else {
                    // Seen in the initial snapshot; the create raced the load.
                    CacheEventKind::NodeUpdated
                }
            }
            NodeEventKind::Updated => {
                known.insert(event.path.clone());
                CacheEventKind::NodeUpdated
            }
            NodeEventKind::Deleted => {
                if !known.remove(&event.path) {
                    return;
                }
                CacheEventKind::NodeRemoved
            }
        };
        self.deliver(CacheEvent {
            kind,
            path: event.path,
            data: event.data,
            stat: event.stat,
        });
    }

    fn deliver(&self, event: CacheEvent) {
        let listeners = self.listeners.lock().expect("cache listener lock").clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}
