//! Assignment computation.
//!
//! Pure functions over snapshot views: no store access, no async. The engine
//! feeds a snapshot in and commits the resulting delta. Everything here
//! iterates ordered maps so equal inputs always produce equal outputs.

use std::collections::{BTreeMap, BTreeSet};

use crate::alarm::AlarmEvent;
use crate::engine::view::{ExecutorView, JobView};
use crate::params::LOCAL_MODE_SHARD;

pub type ShardSet = BTreeSet<i32>;

/// Full picture of which executor holds which shards of which job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    jobs: BTreeMap<String, BTreeMap<String, ShardSet>>,
}

impl Assignment {
    pub fn shards(&self, job: &str, exe: &str) -> ShardSet {
        self.jobs
            .get(job)
            .and_then(|servers| servers.get(exe))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_shards(&mut self, job: &str, exe: &str, shards: ShardSet) {
        self.jobs
            .entry(job.to_string())
            .or_default()
            .insert(exe.to_string(), shards);
    }

    pub fn servers(&self, job: &str) -> BTreeMap<String, ShardSet> {
        self.jobs.get(job).cloned().unwrap_or_default()
    }

    pub fn replace_job(&mut self, job: &str, servers: BTreeMap<String, ShardSet>) {
        self.jobs.insert(job.to_string(), servers);
    }

    pub fn remove_job(&mut self, job: &str) {
        self.jobs.remove(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// `(job, exe)` pairs whose effective shard set differs between `self`
    /// and `next`. A missing entry counts as empty, so entries flipping
    /// between absent and empty produce no change.
    pub fn diff(&self, next: &Assignment) -> Vec<AssignmentChange> {
        let mut changes = Vec::new();
        let mut pairs: BTreeSet<(&str, &str)> = BTreeSet::new();
        for (job, servers) in self.jobs.iter().chain(next.jobs.iter()) {
            for exe in servers.keys() {
                pairs.insert((job, exe));
            }
        }
        for (job, exe) in pairs {
            let before = self.shards(job, exe);
            let after = next.shards(job, exe);
            if before != after {
                changes.push(AssignmentChange {
                    job: job.to_string(),
                    executor: exe.to_string(),
                    shards: after,
                });
            }
        }
        changes
    }

    /// Serialize a shard set to the wire CSV, empty string for none.
    pub fn to_csv(shards: &ShardSet) -> String {
        shards
            .iter()
            .map(|shard| shard.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the wire CSV; malformed ids are dropped rather than trusted.
    pub fn from_csv(raw: &str) -> ShardSet {
        raw.split(',')
            .filter_map(|item| item.trim().parse().ok())
            .collect()
    }
}

/// One pending write: the new shard set for `(job, executor)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentChange {
    pub job: String,
    pub executor: String,
    pub shards: ShardSet,
}

/// Executors allowed to hold shards of `job` right now.
///
/// A non-empty prefer list restricts the job to the named executors, unless
/// `useDispreferList` opens it back up to everyone online. Prefer-list
/// entries that name no registered executor are ignored; if none of them is
/// registered the list is treated as empty. With no (effective) prefer list,
/// every online non-container executor qualifies — container resources only
/// serve jobs that name them.
pub fn eligible_executors(
    job: &JobView,
    executors: &BTreeMap<String, ExecutorView>,
) -> Vec<String> {
    if !job.enabled {
        return Vec::new();
    }
    let known_prefer: BTreeSet<&str> = job
        .prefer_list
        .iter()
        .map(String::as_str)
        .filter(|name| executors.contains_key(*name))
        .collect();
    executors
        .values()
        .filter(|exe| exe.online)
        .filter(|exe| {
            if known_prefer.is_empty() {
                !exe.container
            } else {
                known_prefer.contains(exe.name.as_str()) || job.use_disprefer_list
            }
        })
        .map(|exe| exe.name.clone())
        .collect()
}

/// Result of one turn's computation.
#[derive(Debug, Default)]
pub struct TurnOutcome {
    pub next: Assignment,
    pub alarms: Vec<AlarmEvent>,
}

/// Recompute the assignment of every job in `affected`, minimizing shard
/// movement while keeping executor loads level.
///
/// `jobs` must hold the parsed views of all known valid jobs (load balance
/// is a cross-job property), `affected` names the subset to recompute.
/// `rebalance_frozen` releases shards parked on offline executors of
/// no-failover jobs; it is set only for explicit resharding triggers.
pub fn compute_assignments(
    jobs: &BTreeMap<String, JobView>,
    executors: &BTreeMap<String, ExecutorView>,
    current: &Assignment,
    affected: &BTreeSet<String>,
    rebalance_frozen: bool,
) -> TurnOutcome {
    let mut outcome = TurnOutcome {
        next: current.clone(),
        alarms: Vec::new(),
    };

    let mut loads = initial_loads(jobs, executors, current);

    for job_name in affected {
        let Some(job) = jobs.get(job_name) else {
            // Unknown or invalid config; the caller alarmed already.
            continue;
        };
        // The ledger excludes this job while it is being recomputed; the
        // final layout is added back below, so unchanged jobs net to zero.
        subtract_job_load(&mut loads, job, executors, &outcome.next.servers(job_name));
        let servers = if job.local_mode {
            compute_local_mode(job, executors, &outcome.next.servers(job_name))
        } else {
            compute_sharded(
                job,
                executors,
                &outcome.next.servers(job_name),
                &loads,
                rebalance_frozen,
                &mut outcome.alarms,
            )
        };
        add_job_load(&mut loads, job, executors, &servers);
        outcome.next.replace_job(job_name, servers);
    }

    outcome
}

fn is_online(executors: &BTreeMap<String, ExecutorView>, exe: &str) -> bool {
    executors.get(exe).is_some_and(|view| view.online)
}

/// Weighted shard counts per online executor across every known job.
fn initial_loads(
    jobs: &BTreeMap<String, JobView>,
    executors: &BTreeMap<String, ExecutorView>,
    current: &Assignment,
) -> BTreeMap<String, u64> {
    let mut loads: BTreeMap<String, u64> = executors
        .values()
        .filter(|exe| exe.online)
        .map(|exe| (exe.name.clone(), 0))
        .collect();
    for (job_name, servers) in &current.jobs {
        let Some(job) = jobs.get(job_name) else {
            continue;
        };
        for (exe, shards) in servers {
            if let Some(load) = loads.get_mut(exe) {
                *load += u64::from(job.load_level) * shards.len() as u64;
            }
        }
    }
    loads
}

fn subtract_job_load(
    loads: &mut BTreeMap<String, u64>,
    job: &JobView,
    executors: &BTreeMap<String, ExecutorView>,
    servers: &BTreeMap<String, ShardSet>,
) {
    for (exe, shards) in servers {
        if is_online(executors, exe) {
            if let Some(load) = loads.get_mut(exe) {
                *load = load.saturating_sub(u64::from(job.load_level) * shards.len() as u64);
            }
        }
    }
}

fn add_job_load(
    loads: &mut BTreeMap<String, u64>,
    job: &JobView,
    executors: &BTreeMap<String, ExecutorView>,
    servers: &BTreeMap<String, ShardSet>,
) {
    for (exe, shards) in servers {
        if is_online(executors, exe) {
            *loads.entry(exe.clone()).or_default() +=
                u64::from(job.load_level) * shards.len() as u64;
        }
    }
}

/// Local-mode jobs: the sentinel shard goes to every eligible executor.
fn compute_local_mode(
    job: &JobView,
    executors: &BTreeMap<String, ExecutorView>,
    current: &BTreeMap<String, ShardSet>,
) -> BTreeMap<String, ShardSet> {
    let eligible: BTreeSet<String> = eligible_executors(job, executors).into_iter().collect();
    let mut servers = BTreeMap::new();
    for exe in &eligible {
        servers.insert(exe.clone(), ShardSet::from([LOCAL_MODE_SHARD]));
    }
    for exe in current.keys() {
        if !eligible.contains(exe) {
            servers.insert(exe.clone(), ShardSet::new());
        }
    }
    servers
}

fn compute_sharded(
    job: &JobView,
    executors: &BTreeMap<String, ExecutorView>,
    current: &BTreeMap<String, ShardSet>,
    loads: &BTreeMap<String, u64>,
    rebalance_frozen: bool,
    alarms: &mut Vec<AlarmEvent>,
) -> BTreeMap<String, ShardSet> {
    let total = job.sharding_total_count;
    if total == 0 {
        // Nothing to place and nothing worth alarming about.
        return current.clone();
    }
    if !job.enabled {
        return current.keys().map(|exe| (exe.clone(), ShardSet::new())).collect();
    }

    let eligible = eligible_executors(job, executors);
    let full_range: ShardSet = (0..total as i32).collect();

    if eligible.is_empty() {
        alarms.push(AlarmEvent::NoEligibleExecutor {
            job: job.name.clone(),
        });
        if job.failover || rebalance_frozen {
            return current.keys().map(|exe| (exe.clone(), ShardSet::new())).collect();
        }
        // No-failover: leave everything recorded where it is.
        return current.clone();
    }

    let eligible_set: BTreeSet<&str> = eligible.iter().map(String::as_str).collect();
    let mut servers: BTreeMap<String, ShardSet> = BTreeMap::new();
    let mut taken = ShardSet::new();
    // Working copy: retained and freshly placed shards of this job must
    // weigh in during placement, but the caller owns the cross-job ledger.
    let mut loads = loads.clone();

    // Retain shards on still-eligible holders; map order keeps conflicts
    // deterministic (lowest executor id wins).
    for (exe, shards) in current {
        if !eligible_set.contains(exe.as_str()) {
            continue;
        }
        let mut kept = ShardSet::new();
        for &shard in shards.iter().filter(|shard| full_range.contains(shard)) {
            if taken.insert(shard) {
                kept.insert(shard);
            } else {
                let holder = servers
                    .iter()
                    .find(|(_, held)| held.contains(&shard))
                    .map(|(name, _)| name.clone())
                    .unwrap_or_default();
                alarms.push(AlarmEvent::ShardConflict {
                    job: job.name.clone(),
                    shard,
                    kept: holder,
                    dropped: exe.clone(),
                });
            }
        }
        *loads.entry(exe.clone()).or_default() += u64::from(job.load_level) * kept.len() as u64;
        servers.insert(exe.clone(), kept);
    }

    // Ineligible holders: free their shards, unless the job opted out of
    // failover and the holder is merely offline.
    let mut frozen = ShardSet::new();
    for (exe, shards) in current {
        if eligible_set.contains(exe.as_str()) {
            continue;
        }
        let holder_offline = !is_online(executors, exe);
        if !job.failover && !rebalance_frozen && holder_offline && !shards.is_empty() {
            let recorded: ShardSet = shards
                .iter()
                .copied()
                .filter(|shard| full_range.contains(shard))
                .collect();
            frozen.extend(recorded.iter().copied());
            alarms.push(AlarmEvent::FrozenShards {
                job: job.name.clone(),
                executor: exe.clone(),
                shards: recorded.iter().copied().collect(),
            });
            servers.insert(exe.clone(), recorded);
        } else {
            servers.insert(exe.clone(), ShardSet::new());
        }
    }

    // Greedy placement of whatever is left, lightest executor first.
    for shard in &full_range {
        if taken.contains(shard) || frozen.contains(shard) {
            continue;
        }
        let Some(chosen) = eligible
            .iter()
            .min_by_key(|exe| (loads.get(*exe).copied().unwrap_or(0), (*exe).clone()))
        else {
            break;
        };
        let chosen = chosen.clone();
        servers.entry(chosen.clone()).or_default().insert(*shard);
        *loads.entry(chosen).or_default() += u64::from(job.load_level);
    }

    // Retention alone can leave the spread lopsided (an executor that was
    // alone now has company). Shed this job's shards from the most loaded
    // executor until the spread is within one load level; each move strictly
    // narrows it, so the loop terminates.
    let level = u64::from(job.load_level.max(1));
    loop {
        let Some(lo) = eligible
            .iter()
            .min_by_key(|exe| (loads.get(*exe).copied().unwrap_or(0), (*exe).clone()))
        else {
            break;
        };
        let Some(hi) = eligible
            .iter()
            .filter(|exe| servers.get(*exe).is_some_and(|held| !held.is_empty()))
            .max_by_key(|exe| (loads.get(*exe).copied().unwrap_or(0), (*exe).clone()))
        else {
            break;
        };
        if hi == lo {
            break;
        }
        let hi_load = loads.get(hi).copied().unwrap_or(0);
        let lo_load = loads.get(lo).copied().unwrap_or(0);
        if hi_load.saturating_sub(lo_load) <= level {
            break;
        }
        let (hi, lo) = (hi.clone(), lo.clone());
        let Some(shard) = servers.get_mut(&hi).and_then(|held| held.pop_last()) else {
            break;
        };
        servers.entry(lo.clone()).or_default().insert(shard);
        *loads.entry(hi).or_default() -= u64::from(job.load_level);
        *loads.entry(lo).or_default() += u64::from(job.load_level);
    }

    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    fn job(name: &str) -> JobView {
        JobView {
            name: name.to_string(),
            enabled: true,
            local_mode: false,
            sharding_total_count: 4,
            load_level: 1,
            prefer_list: Vec::new(),
            use_disprefer_list: false,
            failover: true,
            job_type: String::new(),
            job_degree: 0,
            enabled_report: true,
            time_zone: UTC,
            pause_period: Default::default(),
            item_parameters: Default::default(),
            timeout_alarm_seconds: 0,
            queue_name: None,
            channel_name: None,
            custom_context: Default::default(),
        }
    }

    fn executor(name: &str, online: bool) -> (String, ExecutorView) {
        (
            name.to_string(),
            ExecutorView {
                name: name.to_string(),
                online,
                container: name.starts_with('@'),
                task: None,
            },
        )
    }

    fn shards(ids: &[i32]) -> ShardSet {
        ids.iter().copied().collect()
    }

    fn single_job(view: JobView) -> BTreeMap<String, JobView> {
        BTreeMap::from([(view.name.clone(), view)])
    }

    fn affected(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_cold_start_two_executors() {
        let jobs = single_job(job("j"));
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 2]));
        assert_eq!(outcome.next.shards("j", "B"), shards(&[1, 3]));
        assert!(outcome.alarms.is_empty());
    }

    #[test]
    fn test_offline_with_failover_moves_shards() {
        let jobs = single_job(job("j"));
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 2]));
        current.set_shards("j", "B", shards(&[1, 3]));
        let executors = BTreeMap::from([executor("A", true), executor("B", false)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 1, 2, 3]));
        assert_eq!(outcome.next.shards("j", "B"), ShardSet::new());
    }

    #[test]
    fn test_offline_without_failover_freezes_shards() {
        let mut view = job("j");
        view.failover = false;
        let jobs = single_job(view);
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 2]));
        current.set_shards("j", "B", shards(&[1, 3]));
        let executors = BTreeMap::from([executor("A", true), executor("B", false)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 2]));
        assert_eq!(outcome.next.shards("j", "B"), shards(&[1, 3]));
        assert!(outcome
            .alarms
            .iter()
            .any(|alarm| matches!(alarm, AlarmEvent::FrozenShards { .. })));
        // Nothing changed, so the delta is empty.
        assert!(current.diff(&outcome.next).is_empty());
    }

    #[test]
    fn test_explicit_trigger_releases_frozen_shards() {
        let mut view = job("j");
        view.failover = false;
        let jobs = single_job(view);
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 2]));
        current.set_shards("j", "B", shards(&[1, 3]));
        let executors = BTreeMap::from([executor("A", true), executor("B", false)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), true);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 1, 2, 3]));
        assert_eq!(outcome.next.shards("j", "B"), ShardSet::new());
    }

    #[test]
    fn test_local_mode_assigns_sentinel_everywhere() {
        let mut view = job("j");
        view.local_mode = true;
        let jobs = single_job(view);
        let executors = BTreeMap::from([
            executor("A", true),
            executor("B", true),
            executor("C", true),
        ]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        for exe in ["A", "B", "C"] {
            assert_eq!(outcome.next.shards("j", exe), shards(&[-1]));
        }
    }

    #[test]
    fn test_local_mode_clears_ineligible() {
        let mut view = job("j");
        view.local_mode = true;
        let jobs = single_job(view);
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[-1]));
        current.set_shards("j", "B", shards(&[-1]));
        let executors = BTreeMap::from([executor("A", true), executor("B", false)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[-1]));
        assert_eq!(outcome.next.shards("j", "B"), ShardSet::new());
    }

    #[test]
    fn test_prefer_list_exclusive() {
        let mut view = job("j");
        view.prefer_list = vec!["B".to_string()];
        let jobs = single_job(view);
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "B"), shards(&[0, 1, 2, 3]));
        assert_eq!(outcome.next.shards("j", "A"), ShardSet::new());
    }

    #[test]
    fn test_prefer_list_with_disprefer_opens_up() {
        let mut view = job("j");
        view.prefer_list = vec!["B".to_string()];
        view.use_disprefer_list = true;
        let jobs = single_job(view);
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        let union: ShardSet = outcome
            .next
            .shards("j", "A")
            .union(&outcome.next.shards("j", "B"))
            .copied()
            .collect();
        assert_eq!(union, shards(&[0, 1, 2, 3]));
        assert_eq!(outcome.next.shards("j", "A").len(), 2);
    }

    #[test]
    fn test_unregistered_prefer_list_treated_as_empty() {
        let mut view = job("j");
        view.prefer_list = vec!["ghost".to_string()];
        let jobs = single_job(view);
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        let union: ShardSet = outcome
            .next
            .shards("j", "A")
            .union(&outcome.next.shards("j", "B"))
            .copied()
            .collect();
        assert_eq!(union, shards(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_container_excluded_without_prefer_list() {
        let jobs = single_job(job("j"));
        let executors = BTreeMap::from([executor("A", true), executor("@box", true)]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 1, 2, 3]));
        assert_eq!(outcome.next.shards("j", "@box"), ShardSet::new());
    }

    #[test]
    fn test_container_eligible_when_preferred() {
        let mut view = job("j");
        view.prefer_list = vec!["@box".to_string()];
        let jobs = single_job(view);
        let executors = BTreeMap::from([executor("A", true), executor("@box", true)]);
        let outcome =
            compute_assignments(&jobs, &executors, &Assignment::default(), &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "@box"), shards(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_no_eligible_executor_alarms_and_clears() {
        let jobs = single_job(job("j"));
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 1, 2, 3]));
        let executors = BTreeMap::from([executor("A", false)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), ShardSet::new());
        assert!(outcome
            .alarms
            .iter()
            .any(|alarm| matches!(alarm, AlarmEvent::NoEligibleExecutor { job } if job == "j")));
    }

    #[test]
    fn test_zero_shard_count_produces_no_change() {
        let mut view = job("j");
        view.sharding_total_count = 0;
        let jobs = single_job(view);
        let executors = BTreeMap::from([executor("A", true)]);
        let current = Assignment::default();
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert!(current.diff(&outcome.next).is_empty());
        assert!(outcome.alarms.is_empty());
    }

    #[test]
    fn test_disabled_job_unassigned() {
        let mut view = job("j");
        view.enabled = false;
        let jobs = single_job(view);
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 1]));
        let executors = BTreeMap::from([executor("A", true)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), ShardSet::new());
        assert!(outcome.alarms.is_empty());
    }

    #[test]
    fn test_executor_join_moves_one_shard_for_balance() {
        let jobs = single_job(job("j"));
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 2]));
        current.set_shards("j", "B", shards(&[1, 3]));
        let executors = BTreeMap::from([
            executor("A", true),
            executor("B", true),
            executor("C", true),
        ]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        // One shard moves to the newcomer; everything else stays put.
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 2]));
        assert_eq!(outcome.next.shards("j", "B"), shards(&[1]));
        assert_eq!(outcome.next.shards("j", "C"), shards(&[3]));
    }

    #[test]
    fn test_rejoin_after_takeover_levels_out() {
        let jobs = single_job(job("j"));
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 1, 2, 3]));
        current.set_shards("j", "B", ShardSet::new());
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 1]));
        assert_eq!(outcome.next.shards("j", "B"), shards(&[2, 3]));
    }

    #[test]
    fn test_shrunk_total_count_drops_out_of_range() {
        let mut view = job("j");
        view.sharding_total_count = 2;
        let jobs = single_job(view);
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 2]));
        current.set_shards("j", "B", shards(&[1, 3]));
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0]));
        assert_eq!(outcome.next.shards("j", "B"), shards(&[1]));
    }

    #[test]
    fn test_duplicate_shard_resolved_with_alarm() {
        let jobs = single_job(job("j"));
        let mut current = Assignment::default();
        current.set_shards("j", "A", shards(&[0, 1]));
        current.set_shards("j", "B", shards(&[1, 2, 3]));
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome = compute_assignments(&jobs, &executors, &current, &affected(&["j"]), false);
        assert_eq!(outcome.next.shards("j", "A"), shards(&[0, 1]));
        assert_eq!(outcome.next.shards("j", "B"), shards(&[2, 3]));
        assert!(outcome
            .alarms
            .iter()
            .any(|alarm| matches!(alarm, AlarmEvent::ShardConflict { shard: 1, .. })));
    }

    #[test]
    fn test_load_level_balances_across_jobs() {
        let mut heavy = job("heavy");
        heavy.load_level = 3;
        heavy.sharding_total_count = 1;
        let mut light = job("light");
        light.load_level = 2;
        light.sharding_total_count = 3;
        let jobs = BTreeMap::from([
            ("heavy".to_string(), heavy),
            ("light".to_string(), light),
        ]);
        let executors = BTreeMap::from([executor("A", true), executor("B", true)]);
        let outcome = compute_assignments(
            &jobs,
            &executors,
            &Assignment::default(),
            &affected(&["heavy", "light"]),
            false,
        );
        // heavy/0 lands on A (load 3); light's shards then favor B.
        assert_eq!(outcome.next.shards("heavy", "A"), shards(&[0]));
        assert_eq!(outcome.next.shards("light", "B"), shards(&[0, 1]));
        assert_eq!(outcome.next.shards("light", "A"), shards(&[2]));
    }

    #[test]
    fn test_determinism_and_replay_idempotence() {
        let jobs = single_job(job("j"));
        let executors = BTreeMap::from([
            executor("A", true),
            executor("B", true),
            executor("C", true),
        ]);
        let first = compute_assignments(
            &jobs,
            &executors,
            &Assignment::default(),
            &affected(&["j"]),
            false,
        );
        let second = compute_assignments(
            &jobs,
            &executors,
            &Assignment::default(),
            &affected(&["j"]),
            false,
        );
        assert_eq!(first.next, second.next);
        // Replaying against the produced assignment changes nothing.
        let replay = compute_assignments(&jobs, &executors, &first.next, &affected(&["j"]), false);
        assert!(first.next.diff(&replay.next).is_empty());
    }

    #[test]
    fn test_load_balance_bound() {
        let mut view = job("j");
        view.sharding_total_count = 10;
        view.load_level = 2;
        let jobs = single_job(view);
        let executors = BTreeMap::from([
            executor("A", true),
            executor("B", true),
            executor("C", true),
        ]);
        let outcome = compute_assignments(
            &jobs,
            &executors,
            &Assignment::default(),
            &affected(&["j"]),
            false,
        );
        let loads: Vec<u64> = ["A", "B", "C"]
            .iter()
            .map(|exe| outcome.next.shards("j", exe).len() as u64 * 2)
            .collect();
        let max = *loads.iter().max().unwrap();
        let min = *loads.iter().min().unwrap();
        assert!(max - min <= 2, "spread {max}-{min} exceeds one load level");
        let union: ShardSet = ["A", "B", "C"]
            .iter()
            .flat_map(|exe| outcome.next.shards("j", exe))
            .collect();
        assert_eq!(union.len(), 10);
    }

    #[test]
    fn test_csv_round_trip() {
        assert_eq!(Assignment::to_csv(&shards(&[0, 2, 7])), "0,2,7");
        assert_eq!(Assignment::from_csv("0,2,7"), shards(&[0, 2, 7]));
        assert_eq!(Assignment::from_csv(""), ShardSet::new());
        assert_eq!(Assignment::to_csv(&ShardSet::new()), "");
        assert_eq!(Assignment::from_csv("-1"), shards(&[-1]));
    }
}
