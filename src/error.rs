use thiserror::Error;

/// Errors surfaced by the coordination store and the sharding core.
///
/// Store adapters translate transport faults into these variants; the engine
/// converts them into `Resync` events or alarms instead of letting them
/// escape a sharding turn.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("node not found: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i64,
        actual: i64,
    },

    #[error("transaction aborted at op {index}: {reason}")]
    TxnAborted { index: usize, reason: String },

    #[error("store connection unavailable")]
    Disconnected,

    #[error("coordination session lost")]
    SessionLost,

    #[error("no cache registered for ({path}, depth {depth})")]
    NoSuchCache { path: String, depth: usize },

    #[error("invalid job configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),
}

impl CoordinationError {
    /// True for errors a retry or a `Resync` turn can recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordinationError::Disconnected | CoordinationError::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
