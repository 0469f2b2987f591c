//! Restart and recovery scenarios against a real state store on disk.

use std::sync::Arc;

use berth::audit::{AuditEvent, AuditSink, MemorySink};
use berth::catalog::Catalog;
use berth::engine::{AllocateRequest, AllocationEngine};
use berth::probe::{PortProber, ScriptedProber};
use berth::process::{ProcessProbe, ScriptedProcessProbe};
use berth::recovery::recover;
use berth::state::{SnapshotScheduler, StateStore};

/// Scheduler that persists synchronously, standing in for the daemon's
/// background writer in these tests.
struct InlineScheduler {
    store: StateStore,
}

impl SnapshotScheduler for InlineScheduler {
    fn schedule(&self, data: berth::state::SnapshotData) {
        self.store.save(&data).unwrap();
    }
}

struct World {
    store: StateStore,
    process: Arc<ScriptedProcessProbe>,
    prober: Arc<ScriptedProber>,
    audit: Arc<MemorySink>,
    _dir: tempfile::TempDir,
}

impl World {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            store: StateStore::new(dir.path().join("daemon.state")),
            process: Arc::new(ScriptedProcessProbe::new()),
            prober: Arc::new(ScriptedProber::new()),
            audit: Arc::new(MemorySink::new()),
            _dir: dir,
        }
    }

    /// Build an engine wired to this world's store, as one daemon run.
    fn boot(&self) -> AllocationEngine {
        let catalog = Catalog::builtin().unwrap();
        let (data, _report) = recover(
            &self.store,
            &catalog,
            self.process.as_ref(),
            self.audit.as_ref(),
        )
        .unwrap();

        let engine = AllocationEngine::builder(catalog)
            .prober(Arc::clone(&self.prober) as Arc<dyn PortProber>)
            .process(Arc::clone(&self.process) as Arc<dyn ProcessProbe>)
            .audit(Arc::clone(&self.audit) as Arc<dyn AuditSink>)
            .scheduler(Arc::new(InlineScheduler {
                store: self.store.clone(),
            }))
            .build();
        engine.restore(data);
        engine
    }
}

#[test]
fn test_active_lock_ids_survive_restart() {
    let world = World::new();

    let first_run = world.boot();
    let a = first_run
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("a")
                .with_pid(Some(100)),
        )
        .unwrap();
    let b = first_run
        .allocate(
            &AllocateRequest::new("api")
                .with_instance_id("b")
                .with_pid(Some(101)),
        )
        .unwrap();
    drop(first_run);

    let second_run = world.boot();
    let allocations = second_run.list_allocations();
    assert_eq!(allocations.len(), 2);
    let locks: Vec<String> = allocations
        .iter()
        .map(|allocation| allocation.lock_id.to_string())
        .collect();
    assert!(locks.contains(&a.lock_id.unwrap().to_string()));
    assert!(locks.contains(&b.lock_id.unwrap().to_string()));

    // A surviving lock id is still releasable after restart.
    assert!(second_run
        .release(&a.lock_id.unwrap().to_string())
        .is_ok());
}

#[test]
fn test_restart_drops_orphan_with_dead_pid() {
    let world = World::new();

    let first_run = world.boot();
    let keeper = first_run
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("keeper")
                .with_pid(Some(100)),
        )
        .unwrap();
    let orphan = first_run
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("orphan")
                .with_pid(Some(200)),
        )
        .unwrap();
    drop(first_run);

    // The orphan's process dies while the daemon is down.
    world.process.mark_dead(200);

    let second_run = world.boot();
    let allocations = second_run.list_allocations();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].lock_id, keeper.lock_id.unwrap());
    assert!(!allocations
        .iter()
        .any(|a| a.lock_id == orphan.lock_id.unwrap()));

    // Recovery recorded before/after counts.
    assert!(world.audit.events().iter().any(|event| matches!(
        event,
        AuditEvent::Recovery {
            allocations_before: 2,
            allocations_after: 1,
            orphans_dropped: 1,
            ..
        }
    )));
}

#[test]
fn test_singleton_index_survives_restart() {
    let world = World::new();

    let first_run = world.boot();
    let first = first_run
        .allocate(
            &AllocateRequest::new("ai")
                .with_instance_id("claude-a")
                .with_pid(Some(100)),
        )
        .unwrap();
    drop(first_run);

    let second_run = world.boot();
    let again = second_run
        .allocate(&AllocateRequest::new("ai").with_instance_id("claude-b"))
        .unwrap();
    assert!(again.existing);
    assert_eq!(again.lock_id, first.lock_id);
    assert_eq!(again.existing_instance_id.as_deref(), Some("claude-a"));
}

#[test]
fn test_corrupt_snapshot_recovers_empty() {
    let world = World::new();

    let first_run = world.boot();
    first_run
        .allocate(&AllocateRequest::new("dev").with_instance_id("a"))
        .unwrap();
    drop(first_run);

    // Corrupt the snapshot on disk.
    std::fs::write(world.store.path(), "{broken").unwrap();

    let second_run = world.boot();
    assert!(second_run.list_allocations().is_empty());

    // And the daemon is fully usable afterwards.
    assert!(second_run
        .allocate(&AllocateRequest::new("dev").with_instance_id("b"))
        .is_ok());
}

#[test]
fn test_released_allocation_stays_released_after_restart() {
    let world = World::new();

    let first_run = world.boot();
    let outcome = first_run
        .allocate(&AllocateRequest::new("dev").with_instance_id("a"))
        .unwrap();
    let lock_id = outcome.lock_id.unwrap().to_string();
    first_run.release(&lock_id).unwrap();
    drop(first_run);

    let second_run = world.boot();
    assert!(second_run.list_allocations().is_empty());
    assert!(matches!(
        second_run.release(&lock_id),
        Err(berth::Error::InvalidLockId { .. })
    ));
}
