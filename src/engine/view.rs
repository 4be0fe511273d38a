//! Working-copy views of the coordination store.
//!
//! A sharding turn starts by snapshotting the relevant subtrees into these
//! structures; the assignment algorithm then runs entirely on the snapshot.

use std::collections::BTreeMap;

use chrono_tz::Tz;

use crate::error::{CoordinationError, Result};
use crate::params::{parse_time_zone, PausePeriod, ShardingItemParameters};
use crate::store::{get_string, paths, CoordinationStore};

/// Executors whose id carries this prefix are container resources; they only
/// serve jobs that prefer them.
pub const CONTAINER_PREFIX: char = '@';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorView {
    pub name: String,
    /// Liveness: the session-bound `ip` child exists.
    pub online: bool,
    /// Container resource, by id prefix.
    pub container: bool,
    /// Container task tag, when the runtime registered one.
    pub task: Option<String>,
}

/// Parsed job configuration, one per `/jobs/<job>/config` subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct JobView {
    pub name: String,
    pub enabled: bool,
    pub local_mode: bool,
    pub sharding_total_count: u32,
    pub load_level: u32,
    pub prefer_list: Vec<String>,
    pub use_disprefer_list: bool,
    pub failover: bool,
    pub job_type: String,
    pub job_degree: u8,
    pub enabled_report: bool,
    pub time_zone: Tz,
    pub pause_period: PausePeriod,
    pub item_parameters: ShardingItemParameters,
    pub timeout_alarm_seconds: u32,
    pub queue_name: Option<String>,
    pub channel_name: Option<String>,
    pub custom_context: BTreeMap<String, String>,
}

impl JobView {
    /// Load and parse a job's configuration. A malformed value anywhere is a
    /// [`CoordinationError::Config`]; the engine skips the job for the turn
    /// and raises an alarm instead of guessing.
    pub async fn load(store: &dyn CoordinationStore, name: &str) -> Result<Self> {
        let enabled = read_bool(store, name, "enabled", false).await?;
        let local_mode = read_bool(store, name, "localMode", false).await?;
        let sharding_total_count = read_u32(store, name, "shardingTotalCount", 0).await?;
        let load_level = read_u32(store, name, "loadLevel", 1).await?;
        let prefer_list = read_csv(store, name, "preferList").await?;
        let use_disprefer_list = read_bool(store, name, "useDispreferList", false).await?;
        let failover = read_bool(store, name, "failover", true).await?;
        let job_type = read_raw(store, name, "jobType").await?.unwrap_or_default();
        let job_degree = read_u32(store, name, "jobDegree", 0).await?;
        if job_degree > 5 {
            return Err(CoordinationError::Config(format!(
                "jobDegree {job_degree} out of range 0-5"
            )));
        }
        let enabled_report = read_bool(store, name, "enabledReport", true).await?;
        let time_zone =
            parse_time_zone(&read_raw(store, name, "timeZone").await?.unwrap_or_default())?;
        let pause_period = PausePeriod::parse(
            &read_raw(store, name, "pausePeriodDate").await?.unwrap_or_default(),
            &read_raw(store, name, "pausePeriodTime").await?.unwrap_or_default(),
        )?;
        let item_parameters = ShardingItemParameters::parse(
            &read_raw(store, name, "shardingItemParameters")
                .await?
                .unwrap_or_default(),
            local_mode,
        )?;
        let timeout_alarm_seconds = read_u32(store, name, "timeout4AlarmSeconds", 0).await?;
        let queue_name = read_raw(store, name, "queueName").await?;
        let channel_name = read_raw(store, name, "channelName").await?;
        let custom_context = read_custom_context(store, name).await?;

        Ok(Self {
            name: name.to_string(),
            enabled,
            local_mode,
            sharding_total_count,
            load_level,
            prefer_list,
            use_disprefer_list,
            failover,
            job_type,
            job_degree: job_degree as u8,
            enabled_report,
            time_zone,
            pause_period,
            item_parameters,
            timeout_alarm_seconds,
            queue_name,
            channel_name,
            custom_context,
        })
    }

    /// Whether the job is inside a configured pause window at `at`.
    pub fn is_paused(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
        self.pause_period.contains(at, self.time_zone)
    }
}

async fn read_raw(
    store: &dyn CoordinationStore,
    job: &str,
    key: &str,
) -> Result<Option<String>> {
    get_string(store, &paths::job_config(job, key)).await
}

async fn read_bool(
    store: &dyn CoordinationStore,
    job: &str,
    key: &str,
    default: bool,
) -> Result<bool> {
    match read_raw(store, job, key).await? {
        None => Ok(default),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(default);
            }
            match trimmed {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(CoordinationError::Config(format!(
                    "{key} must be true or false, got '{other}'"
                ))),
            }
        }
    }
}

async fn read_u32(
    store: &dyn CoordinationStore,
    job: &str,
    key: &str,
    default: u32,
) -> Result<u32> {
    match read_raw(store, job, key).await? {
        None => Ok(default),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(default);
            }
            trimmed.parse().map_err(|_| {
                CoordinationError::Config(format!("{key} must be an integer, got '{trimmed}'"))
            })
        }
    }
}

async fn read_csv(store: &dyn CoordinationStore, job: &str, key: &str) -> Result<Vec<String>> {
    Ok(read_raw(store, job, key)
        .await?
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|element| !element.is_empty())
        .map(str::to_string)
        .collect())
}

async fn read_custom_context(
    store: &dyn CoordinationStore,
    job: &str,
) -> Result<BTreeMap<String, String>> {
    match read_raw(store, job, "customContext").await? {
        None => Ok(BTreeMap::new()),
        Some(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
        Some(raw) => serde_json::from_str(&raw).map_err(|err| {
            CoordinationError::Config(format!("customContext is not a JSON string map: {err}"))
        }),
    }
}

/// Snapshot every registered executor's identity and liveness.
pub async fn load_executors(
    store: &dyn CoordinationStore,
) -> Result<BTreeMap<String, ExecutorView>> {
    let mut executors = BTreeMap::new();
    for name in store.children(paths::EXECUTORS).await? {
        let online = store.exists(&paths::executor_ip(&name)).await?;
        let task = get_string(store, &paths::executor_task(&name)).await?;
        executors.insert(
            name.clone(),
            ExecutorView {
                container: name.starts_with(CONTAINER_PREFIX),
                name,
                online,
                task,
            },
        );
    }
    Ok(executors)
}
