//! C4: the supervisor's view of its children — the live table plus a
//! short-lived cache of start arguments used to revive crash-looping
//! endpoints (`spec.md` §3, `ChildRecord` / `CachedStartArgs`).
//!
//! Grounded on `endpoint_manager.py`'s `_cached_cmd_start_args: TTLCache`
//! and `_revive_child`; the TTL cache itself is hand-rolled (it is a dozen
//! lines over a `HashMap`, not worth a dependency).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use nix::unistd::Pid;

use crate::identity::LocalIdentity;
use crate::wire::CommandMessage;

/// Arguments needed to re-issue a `cmd_start_endpoint` for a child that
/// exited unexpectedly, kept around for `grace_period` after launch.
#[derive(Debug, Clone)]
pub struct CachedStartArgs {
    pub local_username: String,
    pub endpoint_name: String,
    pub command: CommandMessage,
}

struct CacheEntry {
    value: CachedStartArgs,
    expires_at: Instant,
}

/// A `HashMap<Pid, CachedStartArgs>` with per-entry expiry, mirroring
/// `cachetools.TTLCache(maxsize=32768, ttl=grace_period)`.
pub struct StartArgsCache {
    entries: HashMap<i32, CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

const MAX_SIZE: usize = 32_768;

impl StartArgsCache {
    pub fn new(ttl: Duration) -> Self {
        StartArgsCache {
            entries: HashMap::new(),
            ttl,
            max_size: MAX_SIZE,
        }
    }

    pub fn insert(&mut self, pid: Pid, args: CachedStartArgs) {
        self.evict_expired();
        if self.entries.len() >= self.max_size {
            // Oldest-inserted eviction is good enough: this only matters
            // under sustained churn far beyond any real deployment.
            if let Some(&oldest) = self.entries.keys().next() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            pid.as_raw(),
            CacheEntry {
                value: args,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Removes and returns the cached entry for `pid`, if present and not
    /// expired (`spec.md` §8: "revival within grace period").
    pub fn take(&mut self, pid: Pid) -> Option<CachedStartArgs> {
        self.evict_expired();
        self.entries.remove(&pid.as_raw()).map(|entry| entry.value)
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&mut self) -> usize {
        self.evict_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

/// One running (or just-reaped) child endpoint process.
///
/// `local_user_info` is `None` for the short-lived failure-notice helper
/// (`spec.md` §3 `ChildRecord`/§7 "Failure-notice path"): that helper never
/// drops privileges, so there is no user identity to restore during
/// shutdown's SIGTERM/SIGKILL dance — it is signaled directly instead.
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub pid: Pid,
    pub local_user_info: Option<LocalIdentity>,
    pub endpoint_name: String,
    pub started_at: Instant,
}

/// The live table of child processes, keyed by pid.
#[derive(Default)]
pub struct ChildRegistry {
    children: HashMap<i32, ChildRecord>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        ChildRegistry {
            children: HashMap::new(),
        }
    }

    pub fn insert(&mut self, record: ChildRecord) {
        self.children.insert(record.pid.as_raw(), record);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ChildRecord> {
        self.children.remove(&pid.as_raw())
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.children.values()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.children.values().map(|r| r.pid).collect()
    }

    /// Finds the pid of an already-running endpoint with this name, if any
    /// (`spec.md` §4.6: a start request for a running endpoint caches
    /// arguments against it instead of forking again).
    pub fn pid_for_endpoint(&self, endpoint_name: &str) -> Option<Pid> {
        self.children
            .values()
            .find(|r| r.endpoint_name == endpoint_name)
            .map(|r| r.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(name: &str) -> CachedStartArgs {
        CachedStartArgs {
            local_username: "alice".into(),
            endpoint_name: name.into(),
            command: CommandMessage {
                command: Some("cmd_start_endpoint".into()),
                args: vec![],
                kwargs: serde_json::Map::new(),
                globus_effective_identity: None,
                globus_identity_set: vec![],
                globus_username: None,
            },
        }
    }

    #[test]
    fn cached_start_args_survive_within_ttl() {
        let mut cache = StartArgsCache::new(Duration::from_secs(30));
        let pid = Pid::from_raw(4242);
        cache.insert(pid, args("ep1"));
        let found = cache.take(pid).unwrap();
        assert_eq!(found.endpoint_name, "ep1");
    }

    #[test]
    fn cached_start_args_expire_after_ttl() {
        let mut cache = StartArgsCache::new(Duration::from_millis(1));
        let pid = Pid::from_raw(4242);
        cache.insert(pid, args("ep1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.take(pid).is_none());
    }

    #[test]
    fn take_removes_entry_so_it_cannot_be_revived_twice() {
        let mut cache = StartArgsCache::new(Duration::from_secs(30));
        let pid = Pid::from_raw(99);
        cache.insert(pid, args("ep1"));
        assert!(cache.take(pid).is_some());
        assert!(cache.take(pid).is_none());
    }

    fn local_identity() -> LocalIdentity {
        LocalIdentity {
            username: "alice".into(),
            uid: 1000,
            gid: 1000,
            home_dir: "/home/alice".into(),
        }
    }

    #[test]
    fn registry_tracks_insert_and_remove() {
        let mut registry = ChildRegistry::new();
        let pid = Pid::from_raw(123);
        registry.insert(ChildRecord {
            pid,
            local_user_info: Some(local_identity()),
            endpoint_name: "ep1".into(),
            started_at: Instant::now(),
        });
        assert_eq!(registry.len(), 1);
        let removed = registry.remove(pid).unwrap();
        assert_eq!(removed.endpoint_name, "ep1");
        assert!(registry.is_empty());
    }

    #[test]
    fn pid_for_endpoint_finds_a_running_child_by_name() {
        let mut registry = ChildRegistry::new();
        let pid = Pid::from_raw(555);
        registry.insert(ChildRecord {
            pid,
            local_user_info: Some(local_identity()),
            endpoint_name: "ep1".into(),
            started_at: Instant::now(),
        });
        assert_eq!(registry.pid_for_endpoint("ep1"), Some(pid));
        assert_eq!(registry.pid_for_endpoint("ep2"), None);
    }

    #[test]
    fn failure_notice_helper_has_no_local_user_info() {
        let mut registry = ChildRegistry::new();
        let pid = Pid::from_raw(777);
        registry.insert(ChildRecord {
            pid,
            local_user_info: None,
            endpoint_name: format!("{}", pid.as_raw()),
            started_at: Instant::now(),
        });
        assert!(registry.iter().next().unwrap().local_user_info.is_none());
    }
}
