//! Coordination store layout for one tenant namespace.
//!
//! All paths are namespace-relative; the store adapter is expected to scope
//! itself to the namespace root (chroot-style), so the core never sees the
//! tenant prefix.

/// Root for leadership coordination.
pub const LEADER: &str = "/leader";

/// Ephemeral leader lock; value is the leader's host id.
pub const LEADER_HOST: &str = "/leader/host";

/// Root of executor registrations.
pub const EXECUTORS: &str = "/executors";

/// Root of job configurations and per-executor assignments.
pub const JOBS: &str = "/jobs";

/// Root of resharding triggers and bookkeeping.
pub const SHARDING: &str = "/sharding";

/// Advisory counter of completed sharding turns.
pub const SHARDING_COUNT: &str = "/sharding/count";

/// Marker the engine rewrites after each committing turn; value is the
/// reason of the completed turn.
pub const SHARDING_LAST: &str = "/sharding/last";

pub fn executor(exe: &str) -> String {
    format!("{EXECUTORS}/{exe}")
}

/// Ephemeral liveness node; present iff the executor session is alive.
pub fn executor_ip(exe: &str) -> String {
    format!("{EXECUTORS}/{exe}/ip")
}

/// Container task tag written by the container runtime.
pub fn executor_task(exe: &str) -> String {
    format!("{EXECUTORS}/{exe}/task")
}

pub fn job(job: &str) -> String {
    format!("{JOBS}/{job}")
}

pub fn job_config(job: &str, key: &str) -> String {
    format!("{JOBS}/{job}/config/{key}")
}

pub fn job_servers(job: &str) -> String {
    format!("{JOBS}/{job}/servers")
}

pub fn server(job: &str, exe: &str) -> String {
    format!("{JOBS}/{job}/servers/{exe}")
}

/// Assignment record: CSV of shard ids, empty string for none.
pub fn server_sharding(job: &str, exe: &str) -> String {
    format!("{JOBS}/{job}/servers/{exe}/sharding")
}

/// Ephemeral status node owned by the executor session.
pub fn server_status(job: &str, exe: &str) -> String {
    format!("{JOBS}/{job}/servers/{exe}/status")
}

pub fn sharding_marker(reason: &str) -> String {
    format!("{SHARDING}/{reason}")
}

/// Final path segment, e.g. the executor name in `/executors/<exe>/ip`.
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Segment directly below `root`, if `path` is inside `root`'s subtree.
///
/// `child_of("/executors", "/executors/exe-1/ip")` returns `Some("exe-1")`.
pub fn child_of<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    let child = rest.split('/').next()?;
    if child.is_empty() {
        None
    } else {
        Some(child)
    }
}

/// Depth of `path` below `root`: 0 for the root itself, `None` if outside.
pub fn depth_below(root: &str, path: &str) -> Option<usize> {
    if path == root {
        return Some(0);
    }
    let rest = path.strip_prefix(root)?.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(0);
    }
    Some(rest.split('/').count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_shapes() {
        assert_eq!(executor_ip("exe-1"), "/executors/exe-1/ip");
        assert_eq!(job_config("demo", "enabled"), "/jobs/demo/config/enabled");
        assert_eq!(
            server_sharding("demo", "exe-1"),
            "/jobs/demo/servers/exe-1/sharding"
        );
        assert_eq!(sharding_marker("manual"), "/sharding/manual");
    }

    #[test]
    fn test_child_of() {
        assert_eq!(child_of(EXECUTORS, "/executors/exe-1/ip"), Some("exe-1"));
        assert_eq!(child_of(EXECUTORS, "/executors/exe-1"), Some("exe-1"));
        assert_eq!(child_of(EXECUTORS, "/executors"), None);
        assert_eq!(child_of(EXECUTORS, "/jobs/demo"), None);
    }

    #[test]
    fn test_depth_below() {
        assert_eq!(depth_below(JOBS, "/jobs"), Some(0));
        assert_eq!(depth_below(JOBS, "/jobs/demo"), Some(1));
        assert_eq!(depth_below(JOBS, "/jobs/demo/config/enabled"), Some(3));
        assert_eq!(depth_below(JOBS, "/executors/exe-1"), None);
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("/executors/exe-1/ip"), "ip");
        assert_eq!(last_segment("/leader"), "leader");
    }
}
