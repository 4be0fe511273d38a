//! Sharding engine.
//!
//! The leader-only decision core. One cooperative task drains the sharding
//! event queue; each event becomes a turn: snapshot the relevant store
//! subtrees, recompute assignments, commit the delta as one transaction
//! guarded by the leader node's version. Turns are strictly serial and the
//! engine is the sole writer of assignment nodes, the leader node and the
//! sharding counter.

pub mod assign;
pub mod view;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::alarm::{AlarmEvent, AlarmSink};
use crate::engine::assign::{compute_assignments, Assignment};
use crate::engine::view::{load_executors, JobView};
use crate::error::{CoordinationError, Result};
use crate::intake::{EventQueue, ShardingEvent};
use crate::store::{get_string, paths, CoordinationStore, CreateMode, TxnOp};

/// Marker node the engine rewrites after each committing turn. Trigger
/// markers with any other name are external resharding requests.
const SELF_MARKER: &str = "last";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    /// Idle except for leadership-change events.
    Following,
    /// Holder of the leader lock; processes every event.
    Leading,
    /// Shutting down; in-flight turn finishes, queue is abandoned.
    Draining,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "uninitialized"),
            EngineState::Following => write!(f, "following"),
            EngineState::Leading => write!(f, "leading"),
            EngineState::Draining => write!(f, "draining"),
        }
    }
}

pub struct ShardingEngine {
    store: Arc<dyn CoordinationStore>,
    queue: Arc<EventQueue>,
    alarm: Arc<dyn AlarmSink>,
    host_id: String,
    retry_base: Duration,
    retry_max: Duration,
    state_tx: watch::Sender<EngineState>,
    cancel: CancellationToken,
}

impl ShardingEngine {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        queue: Arc<EventQueue>,
        alarm: Arc<dyn AlarmSink>,
        host_id: String,
        retry_base: Duration,
        retry_max: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EngineState::Uninitialized);
        Arc::new(Self {
            store,
            queue,
            alarm,
            host_id,
            retry_base,
            retry_max,
            state_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch channel for observing state transitions.
    pub fn state_watch(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        let previous = *self.state_tx.borrow();
        if previous != state {
            tracing::info!(host = %self.host_id, from = %previous, to = %state, "Engine state changed");
            self.state_tx.send_replace(state);
        }
    }

    /// Try to take the leader lock. First writer wins; losing to an existing
    /// holder makes this engine a follower awaiting leadership changes.
    pub async fn elect_leader(&self) -> Result<bool> {
        match self
            .store
            .create_ephemeral(paths::LEADER_HOST, self.host_id.as_bytes())
            .await
        {
            Ok(()) => {
                tracing::info!(host = %self.host_id, "Acquired namespace leadership");
                self.set_state(EngineState::Leading);
                // A fresh leader recomputes everything once.
                self.queue.push(ShardingEvent::Resync);
                Ok(true)
            }
            Err(CoordinationError::NodeExists(_)) => {
                // A lock carrying our own id is a leftover of this session
                // (chain rebuilt after a suspension); the session still owns
                // the ephemeral, so leadership is ours.
                let holder = get_string(self.store.as_ref(), paths::LEADER_HOST).await?;
                if holder.as_deref() == Some(self.host_id.as_str()) {
                    tracing::info!(host = %self.host_id, "Reclaimed own leader lock");
                    self.set_state(EngineState::Leading);
                    self.queue.push(ShardingEvent::Resync);
                    Ok(true)
                } else {
                    tracing::info!(host = %self.host_id, "Leader lock held elsewhere, following");
                    self.set_state(EngineState::Following);
                    Ok(false)
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Engine loop: drains the queue until cancelled. Spawned exactly once
    /// per leadership chain by the controller.
    pub async fn run(self: Arc<Self>) {
        let mut failures: u32 = 0;
        loop {
            let Some(event) = self.queue.pop(&self.cancel).await else {
                break;
            };
            match self.state() {
                EngineState::Leading => {
                    if let ShardingEvent::LeaderChanged(holder) = &event {
                        self.observe_leader_change(holder.as_deref()).await;
                        continue;
                    }
                    if self.execute_turn(&event).await {
                        failures = 0;
                    } else {
                        failures = failures.saturating_add(1);
                        self.backoff(failures).await;
                    }
                }
                EngineState::Following => {
                    if event == ShardingEvent::LeaderChanged(None) {
                        if let Err(err) = self.elect_leader().await {
                            tracing::warn!(error = %err, "Leader retry failed");
                        }
                    }
                }
                EngineState::Uninitialized | EngineState::Draining => {}
            }
        }
        self.set_state(EngineState::Draining);
        self.release_leadership().await;
        self.set_state(EngineState::Uninitialized);
    }

    /// Cooperative shutdown: stop consuming, finish the in-flight turn.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn backoff(&self, failures: u32) {
        let exp = failures.min(16);
        let delay = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(exp.saturating_sub(1)))
            .min(self.retry_max);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// A leader watching its own lock: recreate on loss, demote when a
    /// different holder appears (our session must have expired).
    async fn observe_leader_change(&self, holder: Option<&str>) {
        match holder {
            Some(holder) if holder == self.host_id => {}
            Some(other) => {
                tracing::warn!(host = %self.host_id, leader = %other, "Leadership taken over, demoting");
                self.demote();
            }
            None => {
                tracing::warn!(host = %self.host_id, "Own leader node vanished, re-electing");
                self.set_state(EngineState::Following);
                if let Err(err) = self.elect_leader().await {
                    tracing::warn!(error = %err, "Re-election failed");
                }
            }
        }
    }

    fn demote(&self) {
        self.set_state(EngineState::Following);
        self.queue.clear();
    }

    async fn release_leadership(&self) {
        match get_string(self.store.as_ref(), paths::LEADER_HOST).await {
            Ok(Some(holder)) if holder == self.host_id => {
                if let Err(err) = self.store.delete(paths::LEADER_HOST).await {
                    tracing::warn!(error = %err, "Failed to release leader lock");
                } else {
                    tracing::info!(host = %self.host_id, "Released namespace leadership");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "Leader lock not checked during drain");
            }
        }
    }

    /// Run one sharding turn. Returns false when the turn failed and was
    /// requeued; every error is absorbed here — a turn never panics the
    /// engine.
    async fn execute_turn(&self, event: &ShardingEvent) -> bool {
        let reason = event.reason();
        match self.try_turn(event).await {
            Ok(committed) => {
                if committed {
                    tracing::info!(reason = %reason, "Sharding turn committed");
                } else {
                    tracing::debug!(reason = %reason, "Sharding turn produced no changes");
                }
                true
            }
            Err(
                CoordinationError::BadVersion { .. }
                | CoordinationError::SessionLost
                | CoordinationError::NoNode(_),
            ) => {
                tracing::warn!(reason = %reason, "Leadership changed mid-turn, demoting");
                self.demote();
                true
            }
            Err(err) => {
                tracing::warn!(reason = %reason, error = %err, "Sharding turn failed, resyncing");
                self.queue.push(ShardingEvent::Resync);
                false
            }
        }
    }

    async fn try_turn(&self, event: &ShardingEvent) -> Result<bool> {
        if let ShardingEvent::JobRemoved(job) = event {
            // The job subtree is gone; remaining assignments keep their
            // shards (minimum churn), so there is nothing to write.
            tracing::debug!(job = %job, "Job removed, no reassignment required");
            return Ok(false);
        }

        // Leadership must hold for the whole turn; the commit re-checks this
        // version atomically.
        let leader_version = match self.store.get_with_stat(paths::LEADER_HOST).await? {
            Some((value, stat)) if value == self.host_id.as_bytes() => stat.version,
            _ => return Err(CoordinationError::SessionLost),
        };

        let executors = load_executors(self.store.as_ref()).await?;
        let (jobs, current) = self.load_jobs_and_assignment().await?;

        let affected: BTreeSet<String> = match event {
            ShardingEvent::JobAdded(job) => {
                let mut set = BTreeSet::new();
                if jobs.contains_key(job) {
                    set.insert(job.clone());
                }
                set
            }
            _ => jobs.keys().cloned().collect(),
        };

        // Only an external trigger may release shards parked on offline
        // executors of no-failover jobs; the engine's own post-commit marker
        // does not.
        let rebalance_frozen = matches!(
            event,
            ShardingEvent::ShardingTrigger { reason, .. } if reason != SELF_MARKER
        );

        let outcome = compute_assignments(&jobs, &executors, &current, &affected, rebalance_frozen);
        for alarm in &outcome.alarms {
            self.alarm.raise(alarm.clone()).await;
        }

        let changes = current.diff(&outcome.next);
        if changes.is_empty() {
            return Ok(false);
        }

        let mut ops = vec![TxnOp::Check {
            path: paths::LEADER_HOST.to_string(),
            version: leader_version,
        }];
        for change in &changes {
            let path = paths::server_sharding(&change.job, &change.executor);
            let value = Assignment::to_csv(&change.shards).into_bytes();
            if self.store.exists(&path).await? {
                ops.push(TxnOp::Set { path, value });
            } else {
                ops.push(TxnOp::Create {
                    path,
                    value,
                    mode: CreateMode::Persistent,
                });
            }
        }
        ops.push(self.marker_op(&event.reason()).await?);
        ops.push(self.count_op().await?);

        // A shutdown racing this turn aborts before the write, not after.
        if self.cancel.is_cancelled() {
            tracing::debug!(reason = %event.reason(), "Turn abandoned, engine draining");
            return Ok(false);
        }
        self.store.transaction(ops).await?;

        tracing::info!(
            reason = %event.reason(),
            changes = changes.len(),
            "Assignment delta committed"
        );
        Ok(true)
    }

    async fn load_jobs_and_assignment(&self) -> Result<(BTreeMap<String, JobView>, Assignment)> {
        let mut jobs = BTreeMap::new();
        let mut current = Assignment::default();
        for name in self.store.children(paths::JOBS).await? {
            match JobView::load(self.store.as_ref(), &name).await {
                Ok(view) => {
                    jobs.insert(name.clone(), view);
                }
                Err(CoordinationError::Config(reason)) => {
                    self.alarm
                        .raise(AlarmEvent::JobConfigInvalid {
                            job: name.clone(),
                            reason,
                        })
                        .await;
                    continue;
                }
                Err(err) => return Err(err),
            }
            for exe in self.store.children(&paths::job_servers(&name)).await? {
                let raw = get_string(
                    self.store.as_ref(),
                    &paths::server_sharding(&name, &exe),
                )
                .await?
                .unwrap_or_default();
                current.set_shards(&name, &exe, Assignment::from_csv(&raw));
            }
        }
        Ok((jobs, current))
    }

    /// Post-commit observability marker under the sharding root.
    async fn marker_op(&self, reason: &str) -> Result<TxnOp> {
        let path = paths::SHARDING_LAST.to_string();
        let value = reason.as_bytes().to_vec();
        if self.store.exists(&path).await? {
            Ok(TxnOp::Set { path, value })
        } else {
            Ok(TxnOp::Create {
                path,
                value,
                mode: CreateMode::Persistent,
            })
        }
    }

    /// Advisory turn counter; absent reads as zero.
    async fn count_op(&self) -> Result<TxnOp> {
        let path = paths::SHARDING_COUNT.to_string();
        match get_string(self.store.as_ref(), &path).await? {
            Some(raw) => {
                let previous: u64 = raw.trim().parse().unwrap_or(0);
                Ok(TxnOp::Set {
                    path,
                    value: (previous + 1).to_string().into_bytes(),
                })
            }
            None => Ok(TxnOp::Create {
                path,
                value: b"1".to_vec(),
                mode: CreateMode::Persistent,
            }),
        }
    }
}
