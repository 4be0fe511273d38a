use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Operator-facing conditions raised by the sharding engine. Alarms never
/// abort a turn; they exist so the reporting collaborator can page someone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmEvent {
    /// An enabled job has no eligible executor; its shards are unassigned.
    NoEligibleExecutor { job: String },
    /// A job's configuration failed to parse; the job was skipped this turn.
    JobConfigInvalid { job: String, reason: String },
    /// A shard was found recorded against two executors; lowest id kept.
    ShardConflict {
        job: String,
        shard: i32,
        kept: String,
        dropped: String,
    },
    /// A no-failover job holds shards recorded against an offline executor;
    /// they stay put until an explicit resharding trigger.
    FrozenShards {
        job: String,
        executor: String,
        shards: Vec<i32>,
    },
}

/// Sink for alarm events, implemented by the reporting collaborator.
#[async_trait]
pub trait AlarmSink: Send + Sync {
    async fn raise(&self, event: AlarmEvent);
}

/// Default sink: structured log lines, nothing else.
#[derive(Debug, Default)]
pub struct LogAlarmSink;

#[async_trait]
impl AlarmSink for LogAlarmSink {
    async fn raise(&self, event: AlarmEvent) {
        match event {
            AlarmEvent::NoEligibleExecutor { job } => {
                tracing::warn!(job = %job, "No eligible executor for enabled job");
            }
            AlarmEvent::JobConfigInvalid { job, reason } => {
                tracing::warn!(job = %job, reason = %reason, "Job configuration invalid, skipped");
            }
            AlarmEvent::ShardConflict {
                job,
                shard,
                kept,
                dropped,
            } => {
                tracing::error!(
                    job = %job,
                    shard,
                    kept = %kept,
                    dropped = %dropped,
                    "Shard recorded against two executors"
                );
            }
            AlarmEvent::FrozenShards {
                job,
                executor,
                shards,
            } => {
                tracing::warn!(
                    job = %job,
                    executor = %executor,
                    shards = ?shards,
                    "Offline executor retains shards of a no-failover job"
                );
            }
        }
    }
}
