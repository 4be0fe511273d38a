//! Coordination store seam.
//!
//! [`CoordinationStore`] is the pluggable adapter over the external
//! hierarchical metadata service: a session-scoped tree of versioned nodes
//! with ephemeral semantics and atomic multi-op transactions. The sharding
//! core only ever talks to this trait; [`memory::MemoryStore`] backs tests
//! and embedded use.

pub mod memory;
pub mod paths;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::{CoordinationError, Result};

/// Per-node metadata tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped on every set.
    pub version: i64,
    /// Child-list version, bumped when direct children change.
    pub cversion: i64,
    /// Last modification time, milliseconds since the epoch.
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    EphemeralSequential,
}

/// One operation inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Abort the transaction unless the node exists at exactly this version.
    Check { path: String, version: i64 },
    Create {
        path: String,
        value: Vec<u8>,
        mode: CreateMode,
    },
    Set { path: String, value: Vec<u8> },
    Delete { path: String },
}

/// Session connection-state transitions, delivered in observed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Suspended,
    Reconnected,
    /// Session expired; every ephemeral node of this session is forfeit.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    Updated,
    Deleted,
}

/// Raw change notification for a single node.
#[derive(Debug, Clone)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub path: String,
    /// Node data after the change; `None` for deletions.
    pub data: Option<Vec<u8>>,
    pub stat: Stat,
}

/// Adapter over the external hierarchical coordination store.
///
/// Implementations must guarantee: creates materialize missing persistent
/// parents, `delete` is recursive and succeeds on absent nodes, `children`
/// is sorted ascending, and `transaction` applies all ops or none.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn get_with_stat(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>>;

    /// Direct children names (not full paths), sorted ascending.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    async fn create_persistent(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Create a session-bound node that vanishes when the session expires.
    async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Create a session-bound node with a store-assigned monotonic suffix;
    /// returns the full assigned path.
    async fn create_ephemeral_sequential(&self, path: &str) -> Result<String>;

    /// Replace the data of an existing node.
    async fn set(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Recursive, guaranteed delete; absent nodes are not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Commit a batch atomically; any failing op rolls back the whole batch.
    async fn transaction(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Subscribe to raw node change notifications.
    fn node_events(&self) -> broadcast::Receiver<NodeEvent>;

    /// Subscribe to session connection-state transitions.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionState>;
}

/// Read a node as UTF-8, `None` if absent.
pub async fn get_string(store: &dyn CoordinationStore, path: &str) -> Result<Option<String>> {
    Ok(store
        .get(path)
        .await?
        .map(|data| String::from_utf8_lossy(&data).into_owned()))
}

/// Create-or-update: create the node if absent, otherwise replace its data.
pub async fn persist(store: &dyn CoordinationStore, path: &str, value: &[u8]) -> Result<()> {
    if store.exists(path).await? {
        store.set(path, value).await
    } else {
        match store.create_persistent(path, value).await {
            // Lost a create race; the set below observes the winner's node.
            Err(CoordinationError::NodeExists(_)) => store.set(path, value).await,
            other => other,
        }
    }
}

/// Create a persistent node if absent, ignoring a lost create race.
pub async fn ensure_persistent(store: &dyn CoordinationStore, path: &str) -> Result<()> {
    if store.exists(path).await? {
        return Ok(());
    }
    match store.create_persistent(path, b"").await {
        Err(CoordinationError::NodeExists(_)) => Ok(()),
        other => other,
    }
}
