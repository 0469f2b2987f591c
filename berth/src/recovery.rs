//! Startup recovery.
//!
//! A one-shot, five-step sequence run before the daemon serves requests:
//! load (or quarantine) the snapshot, validate configuration, sweep orphans,
//! repair the singleton index, and persist the repaired state under a
//! backup. Every step is idempotent and logged; recovery completes even when
//! the snapshot is fully corrupt.

use std::collections::BTreeMap;

use crate::allocation::LockId;
use crate::audit::{AuditEvent, AuditSink};
use crate::catalog::{Catalog, InstanceBehavior};
use crate::error::Result;
use crate::process::ProcessProbe;
use crate::state::{LoadOutcome, SnapshotData, StateStore};

/// What recovery found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// A snapshot file existed and parsed cleanly.
    pub snapshot_loaded: bool,
    /// A corrupt snapshot was quarantined.
    pub snapshot_quarantined: bool,
    /// Allocations present in the loaded snapshot.
    pub allocations_before: usize,
    /// Allocations surviving all repair steps.
    pub allocations_after: usize,
    /// Allocations dropped because their process is gone.
    pub dead_process_orphans: usize,
    /// Allocations dropped because their service type is unknown.
    pub unknown_type_orphans: usize,
    /// Singleton entries dropped or rewritten during repair.
    pub singletons_repaired: usize,
    /// Duplicate singleton allocations dropped (earliest wins).
    pub duplicate_singletons_dropped: usize,
}

impl RecoveryReport {
    /// Whether recovery changed anything worth auditing.
    #[must_use]
    pub const fn repaired_anything(&self) -> bool {
        self.snapshot_quarantined
            || self.dead_process_orphans > 0
            || self.unknown_type_orphans > 0
            || self.singletons_repaired > 0
            || self.duplicate_singletons_dropped > 0
    }
}

/// Run the recovery sequence and return the repaired state.
///
/// The caller seeds the engine with the returned [`SnapshotData`].
///
/// # Errors
///
/// Returns an error only for unrecoverable I/O failures; corruption is
/// handled by quarantine, not failure.
pub fn recover(
    store: &StateStore,
    catalog: &Catalog,
    process: &dyn ProcessProbe,
    audit: &dyn AuditSink,
) -> Result<(SnapshotData, RecoveryReport)> {
    let mut report = RecoveryReport::default();

    // Step 1: load the snapshot, quarantining corruption.
    let mut data = match store.load()? {
        LoadOutcome::Missing => {
            tracing::info!("no snapshot; starting empty");
            SnapshotData::default()
        }
        LoadOutcome::Loaded(data) => {
            report.snapshot_loaded = true;
            data
        }
        LoadOutcome::Quarantined {
            quarantine_path,
            reason,
        } => {
            tracing::warn!(
                quarantine = %quarantine_path.display(),
                reason = %reason,
                "snapshot corrupt; starting empty"
            );
            report.snapshot_quarantined = true;
            SnapshotData::default()
        }
    };
    report.allocations_before = data.allocations.len();

    // Step 2: config validation happened when the catalog was built; here we
    // only surface its overlap warnings alongside the recovery log.
    for warning in catalog.warnings() {
        tracing::warn!(%warning, "catalog validation warning");
    }

    // Step 3: orphan sweep.
    data.allocations.retain(|allocation| {
        if let Some(pid) = allocation.pid {
            if !process.alive(pid) {
                tracing::info!(
                    port = %allocation.port,
                    pid,
                    "dropping orphan: process is gone"
                );
                report.dead_process_orphans += 1;
                return false;
            }
        }
        if catalog.lookup(&allocation.service_type).is_none() {
            tracing::info!(
                port = %allocation.port,
                service_type = %allocation.service_type,
                "dropping orphan: unknown service type"
            );
            report.unknown_type_orphans += 1;
            return false;
        }
        true
    });

    // Step 4: singleton repair. Recompute the index from the surviving
    // allocation table; for duplicate singleton allocations the earliest
    // allocated wins and the rest are dropped.
    let loaded_index = std::mem::take(&mut data.singletons);
    let mut rebuilt: BTreeMap<String, LockId> = BTreeMap::new();
    let mut duplicate_locks = Vec::new();

    let mut singleton_allocations: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, allocation) in data.allocations.iter().enumerate() {
        let single = catalog
            .lookup(&allocation.service_type)
            .map(|t| t.instance_behavior == InstanceBehavior::Single)
            .unwrap_or(false);
        if single {
            singleton_allocations
                .entry(allocation.service_type.clone())
                .or_default()
                .push(i);
        }
    }
    for (type_name, mut indexes) in singleton_allocations {
        indexes.sort_by_key(|&i| data.allocations[i].allocated_at);
        let winner = indexes[0];
        rebuilt.insert(type_name.clone(), data.allocations[winner].lock_id);
        for &loser in &indexes[1..] {
            tracing::info!(
                service_type = %type_name,
                port = %data.allocations[loser].port,
                "dropping duplicate singleton allocation"
            );
            duplicate_locks.push(data.allocations[loser].lock_id);
            report.duplicate_singletons_dropped += 1;
        }
    }
    data.allocations
        .retain(|allocation| !duplicate_locks.contains(&allocation.lock_id));

    // Count index entries that changed against what was loaded.
    for (type_name, lock_id) in &loaded_index {
        if rebuilt.get(type_name) != Some(lock_id) {
            report.singletons_repaired += 1;
        }
    }
    data.singletons = rebuilt;
    report.allocations_after = data.allocations.len();

    // Step 5: persist the repaired state, keeping the pre-repair snapshot
    // under a backup name.
    store.backup("repair")?;
    store.save(&data)?;

    if report.repaired_anything() {
        audit.record(AuditEvent::Recovery {
            allocations_before: report.allocations_before,
            allocations_after: report.allocations_after,
            orphans_dropped: report.dead_process_orphans + report.unknown_type_orphans,
            singletons_repaired: report.singletons_repaired
                + report.duplicate_singletons_dropped,
        });
    }
    tracing::info!(
        before = report.allocations_before,
        after = report.allocations_after,
        "recovery complete"
    );

    Ok((data, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{Allocation, AllocationState};
    use crate::audit::MemorySink;
    use crate::port::Port;
    use crate::process::ScriptedProcessProbe;

    fn active_allocation(port: u16, service_type: &str, pid: Option<u32>) -> Allocation {
        let port = Port::try_from(port).unwrap();
        let mut allocation = Allocation::builder(port, service_type, "i")
            .pid(pid)
            .build_tentative();
        allocation.state = AllocationState::Active;
        allocation
    }

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("daemon.state"))
    }

    #[test]
    fn test_recover_from_missing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        let (data, report) = recover(&store(&dir), &catalog, &process, &audit).unwrap();
        assert!(data.allocations.is_empty());
        assert!(!report.snapshot_loaded);
        assert!(!report.repaired_anything());
        assert!(audit.events().is_empty());
    }

    #[test]
    fn test_recover_drops_dead_process_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        let alive = active_allocation(3000, "dev", Some(100));
        let dead = active_allocation(3001, "dev", Some(200));
        process.mark_dead(200);
        s.save(&SnapshotData {
            allocations: vec![alive.clone(), dead],
            singletons: BTreeMap::new(),
            instances: vec![],
        })
        .unwrap();

        let (data, report) = recover(&s, &catalog, &process, &audit).unwrap();
        assert_eq!(data.allocations.len(), 1);
        assert_eq!(data.allocations[0].lock_id, alive.lock_id);
        assert_eq!(report.dead_process_orphans, 1);
        assert!(matches!(
            audit.events()[0],
            AuditEvent::Recovery {
                allocations_before: 2,
                allocations_after: 1,
                orphans_dropped: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_recover_drops_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        s.save(&SnapshotData {
            allocations: vec![active_allocation(20000, "vanished-type", None)],
            singletons: BTreeMap::new(),
            instances: vec![],
        })
        .unwrap();

        let (data, report) = recover(&s, &catalog, &process, &audit).unwrap();
        assert!(data.allocations.is_empty());
        assert_eq!(report.unknown_type_orphans, 1);
    }

    #[test]
    fn test_recover_repairs_dangling_singleton_entry() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        // Index points at a lock id with no backing allocation.
        let mut singletons = BTreeMap::new();
        singletons.insert("ai".to_string(), crate::allocation::LockId::generate());
        s.save(&SnapshotData {
            allocations: vec![],
            singletons,
            instances: vec![],
        })
        .unwrap();

        let (data, report) = recover(&s, &catalog, &process, &audit).unwrap();
        assert!(data.singletons.is_empty());
        assert_eq!(report.singletons_repaired, 1);
    }

    #[test]
    fn test_recover_keeps_earliest_duplicate_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        let mut first = active_allocation(11430, "ai", None);
        first.allocated_at = chrono::Utc::now() - chrono::Duration::seconds(60);
        let second = active_allocation(11431, "ai", None);

        s.save(&SnapshotData {
            allocations: vec![second, first.clone()],
            singletons: BTreeMap::new(),
            instances: vec![],
        })
        .unwrap();

        let (data, report) = recover(&s, &catalog, &process, &audit).unwrap();
        assert_eq!(data.allocations.len(), 1);
        assert_eq!(data.allocations[0].lock_id, first.lock_id);
        assert_eq!(data.singletons.get("ai"), Some(&first.lock_id));
        assert_eq!(report.duplicate_singletons_dropped, 1);
    }

    #[test]
    fn test_recover_from_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.state");
        std::fs::write(&path, "garbage").unwrap();
        let s = StateStore::new(path);
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        let (data, report) = recover(&s, &catalog, &process, &audit).unwrap();
        assert!(data.allocations.is_empty());
        assert!(report.snapshot_quarantined);
        assert!(report.repaired_anything());
        // The live snapshot is rewritten clean.
        assert!(matches!(s.load().unwrap(), LoadOutcome::Loaded(_)));
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let catalog = Catalog::builtin().unwrap();
        let process = ScriptedProcessProbe::new();
        let audit = MemorySink::new();

        s.save(&SnapshotData {
            allocations: vec![active_allocation(3000, "dev", None)],
            singletons: BTreeMap::new(),
            instances: vec![],
        })
        .unwrap();

        let (first, _) = recover(&s, &catalog, &process, &audit).unwrap();
        let (second, report) = recover(&s, &catalog, &process, &audit).unwrap();
        assert_eq!(first, second);
        assert!(!report.repaired_anything());
    }
}
