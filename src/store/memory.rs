//! In-memory coordination store.
//!
//! Implements the full [`CoordinationStore`] contract — session-scoped
//! ephemerals, per-node versions, atomic transactions, change notifications —
//! inside one process. Backs every test in this crate and embedded
//! single-process deployments; it provides no cross-process coordination.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::error::{CoordinationError, Result};
use crate::store::{
    ConnectionState, CoordinationStore, CreateMode, NodeEvent, NodeEventKind, Stat, TxnOp,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i64,
    cversion: i64,
    mtime_ms: i64,
    /// Owning session for ephemeral nodes; `None` for persistent nodes.
    ephemeral_session: Option<u64>,
}

impl Node {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            cversion: self.cversion,
            mtime_ms: self.mtime_ms,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    session: u64,
    connected: bool,
    sequence: u64,
}

/// In-memory [`CoordinationStore`] with test hooks for driving session
/// lifecycle: [`suspend`](MemoryStore::suspend),
/// [`reconnect`](MemoryStore::reconnect) and
/// [`expire_session`](MemoryStore::expire_session).
pub struct MemoryStore {
    tree: Mutex<Tree>,
    node_tx: broadcast::Sender<NodeEvent>,
    conn_tx: broadcast::Sender<ConnectionState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (node_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (conn_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tree: Mutex::new(Tree {
                nodes: BTreeMap::new(),
                session: 1,
                connected: true,
                sequence: 0,
            }),
            node_tx,
            conn_tx,
        }
    }

    /// Simulate a connection suspension: subsequent operations fail with
    /// [`CoordinationError::Disconnected`] until [`reconnect`](Self::reconnect).
    pub fn suspend(&self) {
        self.tree.lock().expect("store lock").connected = false;
        let _ = self.conn_tx.send(ConnectionState::Suspended);
    }

    /// Restore a suspended connection within the same session.
    pub fn reconnect(&self) {
        self.tree.lock().expect("store lock").connected = true;
        let _ = self.conn_tx.send(ConnectionState::Reconnected);
    }

    /// Expire the current session: all ephemeral nodes of the session are
    /// deleted (with notifications), a `Lost` transition is delivered, and a
    /// fresh session begins.
    pub fn expire_session(&self) {
        let events = {
            let mut tree = self.tree.lock().expect("store lock");
            let expired = tree.session;
            tree.session += 1;
            tree.connected = true;
            let doomed: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_session == Some(expired))
                .map(|(path, _)| path.clone())
                .collect();
            let mut events = Vec::new();
            for path in doomed {
                events.extend(tree.remove_subtree(&path));
            }
            events
        };
        let _ = self.conn_tx.send(ConnectionState::Lost);
        self.emit(events);
    }

    fn emit(&self, events: Vec<NodeEvent>) {
        for event in events {
            let _ = self.node_tx.send(event);
        }
    }
}

impl Tree {
    fn check_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(CoordinationError::Disconnected)
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn parent_of(path: &str) -> Option<&str> {
        let idx = path.rfind('/')?;
        if idx == 0 {
            None
        } else {
            Some(&path[..idx])
        }
    }

    fn validate_path(path: &str) -> Result<()> {
        if path.starts_with('/') && path.len() > 1 && !path.ends_with('/') {
            Ok(())
        } else {
            Err(CoordinationError::Store(format!("invalid path: {path}")))
        }
    }

    /// Create missing persistent ancestors of `path`, collecting events.
    fn materialize_parents(&mut self, path: &str, events: &mut Vec<NodeEvent>) {
        let mut ancestors = Vec::new();
        let mut current = path;
        while let Some(parent) = Self::parent_of(current) {
            if self.nodes.contains_key(parent) {
                break;
            }
            ancestors.push(parent.to_string());
            current = parent;
        }
        for ancestor in ancestors.into_iter().rev() {
            self.insert_node(&ancestor, Vec::new(), None, events);
        }
    }

    fn insert_node(
        &mut self,
        path: &str,
        data: Vec<u8>,
        ephemeral_session: Option<u64>,
        events: &mut Vec<NodeEvent>,
    ) {
        let node = Node {
            data: data.clone(),
            version: 0,
            cversion: 0,
            mtime_ms: Self::now_ms(),
            ephemeral_session,
        };
        let stat = node.stat();
        self.nodes.insert(path.to_string(), node);
        if let Some(parent) = Self::parent_of(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.cversion += 1;
            }
        }
        events.push(NodeEvent {
            kind: NodeEventKind::Created,
            path: path.to_string(),
            data: Some(data),
            stat,
        });
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        ephemeral_session: Option<u64>,
        events: &mut Vec<NodeEvent>,
    ) -> Result<()> {
        Self::validate_path(path)?;
        if self.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        self.materialize_parents(path, events);
        self.insert_node(path, data.to_vec(), ephemeral_session, events);
        Ok(())
    }

    fn set(&mut self, path: &str, data: &[u8], events: &mut Vec<NodeEvent>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))?;
        node.data = data.to_vec();
        node.version += 1;
        node.mtime_ms = Self::now_ms();
        let stat = node.stat();
        events.push(NodeEvent {
            kind: NodeEventKind::Updated,
            path: path.to_string(),
            data: Some(data.to_vec()),
            stat,
        });
        Ok(())
    }

    /// Remove `path` and everything below it, deepest first.
    fn remove_subtree(&mut self, path: &str) -> Vec<NodeEvent> {
        let prefix = format!("{path}/");
        let mut doomed: Vec<String> = self
            .nodes
            .range(path.to_string()..)
            .take_while(|(candidate, _)| *candidate == path || candidate.starts_with(&prefix))
            .map(|(candidate, _)| candidate.clone())
            .collect();
        doomed.sort_by(|a, b| b.cmp(a));
        let mut events = Vec::new();
        for victim in doomed {
            if let Some(node) = self.nodes.remove(&victim) {
                if let Some(parent) = Self::parent_of(&victim) {
                    if let Some(parent_node) = self.nodes.get_mut(parent) {
                        parent_node.cversion += 1;
                    }
                }
                events.push(NodeEvent {
                    kind: NodeEventKind::Deleted,
                    path: victim,
                    data: None,
                    stat: node.stat(),
                });
            }
        }
        events
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let tree = self.tree.lock().expect("store lock");
        tree.check_connected()?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let tree = self.tree.lock().expect("store lock");
        tree.check_connected()?;
        Ok(tree.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn get_with_stat(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>> {
        let tree = self.tree.lock().expect("store lock");
        tree.check_connected()?;
        Ok(tree
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat())))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.tree.lock().expect("store lock");
        tree.check_connected()?;
        let prefix = format!("{path}/");
        let children = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .filter_map(|(candidate, _)| {
                let rest = &candidate[prefix.len()..];
                if rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        Ok(children)
    }

    async fn create_persistent(&self, path: &str, value: &[u8]) -> Result<()> {
        let events = {
            let mut tree = self.tree.lock().expect("store lock");
            tree.check_connected()?;
            let mut events = Vec::new();
            tree.create(path, value, None, &mut events)?;
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<()> {
        let events = {
            let mut tree = self.tree.lock().expect("store lock");
            tree.check_connected()?;
            let session = tree.session;
            let mut events = Vec::new();
            tree.create(path, value, Some(session), &mut events)?;
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn create_ephemeral_sequential(&self, path: &str) -> Result<String> {
        let (assigned, events) = {
            let mut tree = self.tree.lock().expect("store lock");
            tree.check_connected()?;
            tree.sequence += 1;
            let assigned = format!("{path}{:010}", tree.sequence);
            let session = tree.session;
            let mut events = Vec::new();
            tree.create(&assigned, b"", Some(session), &mut events)?;
            (assigned, events)
        };
        self.emit(events);
        Ok(assigned)
    }

    async fn set(&self, path: &str, value: &[u8]) -> Result<()> {
        let events = {
            let mut tree = self.tree.lock().expect("store lock");
            tree.check_connected()?;
            let mut events = Vec::new();
            tree.set(path, value, &mut events)?;
            events
        };
        self.emit(events);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let events = {
            let mut tree = self.tree.lock().expect("store lock");
            tree.check_connected()?;
            tree.remove_subtree(path)
        };
        self.emit(events);
        Ok(())
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        let events = {
            let mut tree = self.tree.lock().expect("store lock");
            tree.check_connected()?;
            // Stage against a copy so a failing op leaves the tree untouched.
            let mut staged = Tree {
                nodes: tree.nodes.clone(),
                session: tree.session,
                connected: tree.connected,
                sequence: tree.sequence,
            };
            let mut events = Vec::new();
            for (index, op) in ops.iter().enumerate() {
                let outcome: Result<()> = match op {
                    TxnOp::Check { path, version } => match staged.nodes.get(path.as_str()) {
                        Some(node) if node.version == *version => Ok(()),
                        Some(node) => Err(CoordinationError::BadVersion {
                            path: path.clone(),
                            expected: *version,
                            actual: node.version,
                        }),
                        None => Err(CoordinationError::NoNode(path.clone())),
                    },
                    TxnOp::Create { path, value, mode } => {
                        let session = match mode {
                            CreateMode::Persistent => None,
                            CreateMode::Ephemeral | CreateMode::EphemeralSequential => {
                                Some(staged.session)
                            }
                        };
                        staged.create(path, value, session, &mut events)
                    }
                    TxnOp::Set { path, value } => staged.set(path, value, &mut events),
                    TxnOp::Delete { path } => {
                        events.extend(staged.remove_subtree(path));
                        Ok(())
                    }
                };
                if let Err(err) = outcome {
                    return Err(match err {
                        bad @ CoordinationError::BadVersion { .. } => bad,
                        other => CoordinationError::TxnAborted {
                            index,
                            reason: other.to_string(),
                        },
                    });
                }
            }
            tree.nodes = staged.nodes;
            tree.sequence = staged.sequence;
            events
        };
        self.emit(events);
        Ok(())
    }

    fn node_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.node_tx.subscribe()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionState> {
        self.conn_tx.subscribe()
    }
}
