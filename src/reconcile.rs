//! Startup pruning of the persisted runtime snapshot.

use tracing::{debug, info};

use crate::error::Result;
use crate::persist::{RuntimeSnapshot, RuntimeStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: usize,
    pub pruned: usize,
}

/// Drops snapshot entries whose PID is missing or no longer alive according
/// to `is_alive`, saving the result. Surviving entries are not adopted: the
/// caller's in-memory registry stays empty.
pub fn reconcile(store: &dyn RuntimeStore, is_alive: impl Fn(u32) -> bool) -> Result<ReconcileReport> {
    let mut snapshot = store.load()?;
    let report = prune(&mut snapshot, is_alive);
    store.save(&snapshot)?;
    if report.pruned > 0 {
        info!(kept = report.kept, pruned = report.pruned, "pruned stale runtime entries");
    }
    Ok(report)
}

fn prune(snapshot: &mut RuntimeSnapshot, is_alive: impl Fn(u32) -> bool) -> ReconcileReport {
    let before = snapshot.len();
    snapshot.retain(|project_id, entry| {
        let alive = entry.pid.is_some_and(&is_alive);
        if !alive {
            debug!(project_id, command_id = %entry.command_id, pid = ?entry.pid, "dropping stale entry");
        }
        alive
    });
    let kept = snapshot.len();
    ReconcileReport {
        kept,
        pruned: before - kept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryStore, RuntimeEntry};
    use crate::process::ProcessRecord;

    fn entry(command_id: &str, pid: Option<u32>) -> RuntimeEntry {
        let mut entry = RuntimeEntry::from(&ProcessRecord::running(command_id, "p", 0));
        entry.pid = pid;
        entry
    }

    #[test]
    fn keeps_only_alive_entries() {
        let mut snap = RuntimeSnapshot::default();
        snap.upsert("p", entry("dead", Some(10)));
        snap.upsert("p", entry("alive", Some(20)));
        snap.upsert("q", entry("nopid", None));
        let store = MemoryStore::with_snapshot(snap);

        let report = reconcile(&store, |pid| pid == 20).unwrap();
        assert_eq!(report, ReconcileReport { kept: 1, pruned: 2 });

        let saved = store.load().unwrap();
        let ids: Vec<_> = saved.entries().map(|(_, e)| e.command_id.as_str()).collect();
        assert_eq!(ids, vec!["alive"]);
    }

    #[cfg(unix)]
    #[test]
    fn uses_real_liveness_probe() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let mut snap = RuntimeSnapshot::default();
        snap.upsert("p", entry("gone", Some(dead_pid)));
        snap.upsert("p", entry("me", Some(std::process::id())));
        let store = MemoryStore::with_snapshot(snap);

        reconcile(&store, crate::terminate::is_alive).unwrap();
        let saved = store.load().unwrap();
        let ids: Vec<_> = saved.entries().map(|(_, e)| e.command_id.as_str()).collect();
        assert_eq!(ids, vec!["me"]);
    }
}
