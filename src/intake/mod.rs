//! Event intake.
//!
//! Translates raw tree-cache events into typed [`ShardingEvent`]s on a
//! bounded single-consumer queue. The cache listeners here do nothing but
//! classify and enqueue; the sharding engine is the only consumer. Identical
//! pending events coalesce, and overflow degrades to a [`ShardingEvent::Resync`]
//! that supersedes everything already queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEvent, CacheEventKind, CacheListener};
use crate::cleaner::ExecutorCleaner;
use crate::store::paths;

/// Typed events consumed by the sharding engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingEvent {
    ExecutorOnline(String),
    ExecutorOffline(String),
    JobAdded(String),
    JobRemoved(String),
    ShardingTrigger {
        reason: String,
        payload: Option<String>,
    },
    LeaderChanged(Option<String>),
    /// Force a full recomputation; supersedes all pending events.
    Resync,
}

impl ShardingEvent {
    /// Short description used as the commit marker reason.
    pub fn reason(&self) -> String {
        match self {
            ShardingEvent::ExecutorOnline(exe) => format!("executor-online-{exe}"),
            ShardingEvent::ExecutorOffline(exe) => format!("executor-offline-{exe}"),
            ShardingEvent::JobAdded(job) => format!("job-added-{job}"),
            ShardingEvent::JobRemoved(job) => format!("job-removed-{job}"),
            ShardingEvent::ShardingTrigger { reason, .. } => format!("trigger-{reason}"),
            ShardingEvent::LeaderChanged(_) => "leader-changed".to_string(),
            ShardingEvent::Resync => "resync".to_string(),
        }
    }
}

struct QueueInner {
    items: VecDeque<ShardingEvent>,
    closed: bool,
}

/// Bounded multi-producer single-consumer queue feeding the engine.
///
/// Producers are the cache listener threads; they never block. The engine
/// awaits [`pop`](EventQueue::pop) between turns.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event. Duplicates of a pending event are dropped; a
    /// `Resync` (or an overflow) clears the queue and leaves one `Resync`.
    pub fn push(&self, event: ShardingEvent) {
        {
            let mut inner = self.inner.lock().expect("event queue lock");
            if inner.closed {
                return;
            }
            if event == ShardingEvent::Resync {
                inner.items.clear();
                inner.items.push_back(ShardingEvent::Resync);
            } else if inner.items.contains(&event) {
                tracing::trace!(?event, "Coalesced duplicate sharding event");
            } else if inner.items.len() >= self.capacity {
                tracing::warn!(
                    dropped = inner.items.len(),
                    "Sharding event queue overflow, degrading to resync"
                );
                inner.items.clear();
                inner.items.push_back(ShardingEvent::Resync);
            } else {
                inner.items.push_back(event);
            }
        }
        self.notify.notify_one();
    }

    /// Wait for the next event. Returns `None` once cancelled or closed with
    /// an empty queue.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<ShardingEvent> {
        loop {
            {
                let mut inner = self.inner.lock().expect("event queue lock");
                if let Some(event) = inner.items.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Drop all pending events (leadership lost mid-stream).
    pub fn clear(&self) {
        self.inner.lock().expect("event queue lock").items.clear();
    }

    pub fn close(&self) {
        self.inner.lock().expect("event queue lock").closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("event queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn data_string(event: &CacheEvent) -> Option<String> {
    event
        .data
        .as_ref()
        .map(|data| String::from_utf8_lossy(data).into_owned())
}

/// Watches `/executors` (depth 2) for `ip` child transitions. An appearing
/// `ip` node means the executor session is live; a vanishing one means the
/// executor is gone, which also schedules a state purge with the cleaner.
pub struct ExecutorChangeListener {
    queue: Arc<EventQueue>,
    cleaner: Arc<ExecutorCleaner>,
}

impl ExecutorChangeListener {
    pub fn new(queue: Arc<EventQueue>, cleaner: Arc<ExecutorCleaner>) -> Self {
        Self { queue, cleaner }
    }
}

impl CacheListener for ExecutorChangeListener {
    fn on_event(&self, event: &CacheEvent) {
        // Only the `/executors/<exe>/ip` shape is a liveness transition.
        if paths::depth_below(paths::EXECUTORS, &event.path) != Some(2)
            || paths::last_segment(&event.path) != "ip"
        {
            return;
        }
        let Some(exe) = paths::child_of(paths::EXECUTORS, &event.path) else {
            return;
        };
        match event.kind {
            CacheEventKind::NodeAdded => {
                self.queue.push(ShardingEvent::ExecutorOnline(exe.to_string()));
            }
            CacheEventKind::NodeRemoved => {
                self.cleaner.schedule(exe.to_string());
                self.queue
                    .push(ShardingEvent::ExecutorOffline(exe.to_string()));
            }
            _ => {}
        }
    }
}

/// Watches `/jobs` (depth 1) for job registrations and removals.
pub struct JobChangeListener {
    queue: Arc<EventQueue>,
}

impl JobChangeListener {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }
}

impl CacheListener for JobChangeListener {
    fn on_event(&self, event: &CacheEvent) {
        if paths::depth_below(paths::JOBS, &event.path) != Some(1) {
            return;
        }
        let Some(job) = paths::child_of(paths::JOBS, &event.path) else {
            return;
        };
        match event.kind {
            CacheEventKind::NodeAdded => {
                self.queue.push(ShardingEvent::JobAdded(job.to_string()));
            }
            CacheEventKind::NodeRemoved => {
                self.queue.push(ShardingEvent::JobRemoved(job.to_string()));
            }
            _ => {}
        }
    }
}

/// Watches `/sharding` (depth 1) for trigger markers. The `count` node is
/// bookkeeping, not a trigger.
pub struct ShardingTriggerListener {
    queue: Arc<EventQueue>,
}

impl ShardingTriggerListener {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }
}

impl CacheListener for ShardingTriggerListener {
    fn on_event(&self, event: &CacheEvent) {
        if paths::depth_below(paths::SHARDING, &event.path) != Some(1) {
            return;
        }
        let Some(marker) = paths::child_of(paths::SHARDING, &event.path) else {
            return;
        };
        if marker == "count" {
            return;
        }
        if matches!(
            event.kind,
            CacheEventKind::NodeAdded | CacheEventKind::NodeUpdated
        ) {
            self.queue.push(ShardingEvent::ShardingTrigger {
                reason: marker.to_string(),
                payload: data_string(event).filter(|payload| !payload.is_empty()),
            });
        }
    }
}

/// Watches `/leader` (depth 1) for leadership transitions.
pub struct LeadershipListener {
    queue: Arc<EventQueue>,
}

impl LeadershipListener {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }
}

impl CacheListener for LeadershipListener {
    fn on_event(&self, event: &CacheEvent) {
        if paths::child_of(paths::LEADER, &event.path) != Some("host") {
            return;
        }
        match event.kind {
            CacheEventKind::NodeAdded | CacheEventKind::NodeUpdated => {
                self.queue
                    .push(ShardingEvent::LeaderChanged(data_string(event)));
            }
            CacheEventKind::NodeRemoved => {
                self.queue.push(ShardingEvent::LeaderChanged(None));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Stat;

    fn added(path: &str, data: &[u8]) -> CacheEvent {
        CacheEvent {
            kind: CacheEventKind::NodeAdded,
            path: path.to_string(),
            data: Some(data.to_vec()),
            stat: Stat::default(),
        }
    }

    fn removed(path: &str) -> CacheEvent {
        CacheEvent {
            kind: CacheEventKind::NodeRemoved,
            path: path.to_string(),
            data: None,
            stat: Stat::default(),
        }
    }

    #[tokio::test]
    async fn test_pop_returns_pushed_event() {
        let queue = EventQueue::new(8);
        queue.push(ShardingEvent::JobAdded("demo".into()));
        let cancel = CancellationToken::new();
        assert_eq!(
            queue.pop(&cancel).await,
            Some(ShardingEvent::JobAdded("demo".into()))
        );
    }

    #[tokio::test]
    async fn test_duplicates_coalesce() {
        let queue = EventQueue::new(8);
        queue.push(ShardingEvent::ExecutorOnline("e1".into()));
        queue.push(ShardingEvent::ExecutorOnline("e1".into()));
        queue.push(ShardingEvent::ExecutorOnline("e2".into()));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_resync_supersedes_pending() {
        let queue = EventQueue::new(8);
        queue.push(ShardingEvent::JobAdded("a".into()));
        queue.push(ShardingEvent::JobAdded("b".into()));
        queue.push(ShardingEvent::Resync);
        assert_eq!(queue.len(), 1);
        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel).await, Some(ShardingEvent::Resync));
    }

    #[tokio::test]
    async fn test_overflow_degrades_to_resync() {
        let queue = EventQueue::new(2);
        queue.push(ShardingEvent::JobAdded("a".into()));
        queue.push(ShardingEvent::JobAdded("b".into()));
        queue.push(ShardingEvent::JobAdded("c".into()));
        assert_eq!(queue.len(), 1);
        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel).await, Some(ShardingEvent::Resync));
    }

    #[tokio::test]
    async fn test_pop_cancellation() {
        let queue = EventQueue::new(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.pop(&cancel).await, None);
    }

    #[tokio::test]
    async fn test_closed_queue_drops_pushes() {
        let queue = EventQueue::new(8);
        queue.close();
        queue.push(ShardingEvent::Resync);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_job_listener_classification() {
        let queue = Arc::new(EventQueue::new(8));
        let listener = JobChangeListener::new(queue.clone());
        listener.on_event(&added("/jobs/demo", b""));
        listener.on_event(&removed("/jobs/old"));
        // Deep config paths are not job transitions.
        listener.on_event(&added("/jobs/other/config/enabled", b"true"));
        let cancel = CancellationToken::new();
        assert_eq!(
            queue.pop(&cancel).await,
            Some(ShardingEvent::JobAdded("demo".into()))
        );
        assert_eq!(
            queue.pop(&cancel).await,
            Some(ShardingEvent::JobRemoved("old".into()))
        );
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_listener_ignores_count() {
        let queue = Arc::new(EventQueue::new(8));
        let listener = ShardingTriggerListener::new(queue.clone());
        listener.on_event(&added("/sharding/count", b"3"));
        assert!(queue.is_empty());
        listener.on_event(&added("/sharding/manual", b"rebalance"));
        let cancel = CancellationToken::new();
        assert_eq!(
            queue.pop(&cancel).await,
            Some(ShardingEvent::ShardingTrigger {
                reason: "manual".into(),
                payload: Some("rebalance".into()),
            })
        );
    }

    #[tokio::test]
    async fn test_leadership_listener() {
        let queue = Arc::new(EventQueue::new(8));
        let listener = LeadershipListener::new(queue.clone());
        listener.on_event(&added("/leader/host", b"host-1"));
        listener.on_event(&removed("/leader/host"));
        let cancel = CancellationToken::new();
        assert_eq!(
            queue.pop(&cancel).await,
            Some(ShardingEvent::LeaderChanged(Some("host-1".into())))
        );
        assert_eq!(
            queue.pop(&cancel).await,
            Some(ShardingEvent::LeaderChanged(None))
        );
    }
}
