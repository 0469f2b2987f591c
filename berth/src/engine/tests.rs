//! Engine unit tests with scripted probes.

use std::sync::Arc;

use super::*;
use crate::audit::MemorySink;
use crate::config::{ConfigFile, ServiceTypeSpec};
use crate::probe::ScriptedProber;
use crate::process::ScriptedProcessProbe;

struct Harness {
    engine: AllocationEngine,
    prober: Arc<ScriptedProber>,
    process: Arc<ScriptedProcessProbe>,
    audit: Arc<MemorySink>,
}

fn harness() -> Harness {
    harness_with(|builder| builder)
}

fn harness_with(customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Harness {
    let prober = Arc::new(ScriptedProber::new());
    let process = Arc::new(ScriptedProcessProbe::new());
    let audit = Arc::new(MemorySink::new());

    let builder = AllocationEngine::builder(Catalog::builtin().unwrap())
        .prober(Arc::clone(&prober) as Arc<dyn PortProber>)
        .process(Arc::clone(&process) as Arc<dyn ProcessProbe>)
        .audit(Arc::clone(&audit) as Arc<dyn AuditSink>);
    let engine = customize(builder).build();

    Harness {
        engine,
        prober,
        process,
        audit,
    }
}

fn port(raw: u16) -> Port {
    Port::try_from(raw).unwrap()
}

#[test]
fn test_allocate_picks_first_preferred() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();
    assert_eq!(outcome.port, port(3000));
    assert!(!outcome.existing);
    assert!(!outcome.auto_allocated);
    assert!(outcome.lock_id.is_some());
}

#[test]
fn test_conflict_retry_moves_to_next_candidate() {
    // Scenario: an external listener already holds the first preferred port.
    let h = harness();
    h.prober.occupy(port(3000));

    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();
    assert_eq!(outcome.port, port(3001));
    assert_eq!(h.engine.metrics().snapshot().port_conflicts_detected, 1);

    // Exactly one ALLOCATE audit event, for the port that won.
    let allocates: Vec<_> = h
        .audit
        .events()
        .into_iter()
        .filter(|e| matches!(e, AuditEvent::Allocate { .. }))
        .collect();
    assert_eq!(allocates.len(), 1);
    assert!(matches!(
        allocates[0],
        AuditEvent::Allocate { port: 3001, .. }
    ));
}

#[test]
fn test_port_uniqueness_across_allocations() {
    let h = harness();
    let mut seen = std::collections::HashSet::new();
    for i in 0..20 {
        let outcome = h
            .engine
            .allocate(&AllocateRequest::new("dev").with_instance_id(&format!("i{i}")))
            .unwrap();
        assert!(seen.insert(outcome.port), "duplicate port {}", outcome.port);
    }
    assert_eq!(h.engine.list_allocations().len(), 20);
}

#[test]
fn test_explicit_preferred_port_wins() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_preferred_port(Some(3055))
                .with_instance_id("i1"),
        )
        .unwrap();
    assert_eq!(outcome.port, port(3055));
}

#[test]
fn test_preferred_port_outside_range_is_skipped() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_preferred_port(Some(9999))
                .with_instance_id("i1"),
        )
        .unwrap();
    // Falls back to the type's own preferred list.
    assert_eq!(outcome.port, port(3000));
}

#[test]
fn test_privileged_preferred_port_rejected() {
    let h = harness();
    let err = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_preferred_port(Some(1023)))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPort { value: 1023, .. }));
}

#[test]
fn test_range_exhausted_bounded_by_max_retries() {
    let h = harness_with(|builder| {
        builder.recovery(RecoveryConfig {
            max_retries: 3,
            ..RecoveryConfig::default()
        })
    });
    // Every port in the dev range is externally occupied.
    for p in 3000..=3099 {
        h.prober.occupy(port(p));
    }
    let err = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap_err();
    match err {
        Error::RangeExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected RangeExhausted, got {other}"),
    }
    // No tentative rows survive a failed allocate.
    assert!(h.engine.list_allocations().is_empty());
}

#[test]
fn test_unknown_type_with_auto_allocation_disabled() {
    let h = harness_with(|builder| {
        builder.auto_allocation(AutoAllocationConfig {
            enabled: false,
            ..AutoAllocationConfig::default()
        })
    });
    let err = h
        .engine
        .allocate(&AllocateRequest::new("grafana"))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownServiceType { .. }));
}

#[test]
fn test_auto_allocation_synthesizes_and_allocates() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("grafana").with_instance_id("i1"))
        .unwrap();

    assert!(outcome.auto_allocated);
    let range = outcome.allocated_range.unwrap();
    assert_eq!(
        range.len(),
        AutoAllocationConfig::default().default_chunk_size as usize
    );
    assert!(range.contains(outcome.port));

    // The catalog now resolves the type; a second allocate reuses it.
    let second = h
        .engine
        .allocate(&AllocateRequest::new("grafana").with_instance_id("i2"))
        .unwrap();
    assert!(!second.auto_allocated);
    assert!(range.contains(second.port));

    let events = h.audit.events();
    let synth_events: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, AuditEvent::AutoAllocation { .. }))
        .collect();
    assert_eq!(synth_events.len(), 1);
}

#[test]
fn test_auto_allocation_persists_through_catalog_writer() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    let backups_dir = dir.path().join("config-backups");

    let prober = Arc::new(ScriptedProber::new());
    let audit = Arc::new(MemorySink::new());
    let engine = AllocationEngine::builder(Catalog::builtin().unwrap())
        .prober(Arc::clone(&prober) as Arc<dyn PortProber>)
        .audit(Arc::clone(&audit) as Arc<dyn AuditSink>)
        .catalog_writer(crate::writer::CatalogWriter::new(
            config_path.clone(),
            backups_dir.clone(),
        ))
        .build();

    let outcome = engine
        .allocate(&AllocateRequest::new("grafana").with_instance_id("i1"))
        .unwrap();
    let range = outcome.allocated_range.unwrap();

    // The user config now carries the synthesized entry, flagged and
    // stamped.
    let config = ConfigFile::load(&config_path).unwrap();
    let entry = config.service_types.get("grafana").unwrap();
    assert!(entry.auto_allocated);
    assert!(entry.allocated_at.is_some());
    assert_eq!(
        entry.range,
        [range.min().value(), range.max().value()]
    );

    // Undo removes the entry again and leaves a backup behind.
    engine
        .release(&outcome.lock_id.unwrap().to_string())
        .unwrap();
    engine.undo_auto_allocation("grafana").unwrap();
    let config = ConfigFile::load(&config_path).unwrap();
    assert!(!config.service_types.contains_key("grafana"));
    assert!(!crate::writer::list_backups(&backups_dir).unwrap().is_empty());
}

#[test]
fn test_singleton_fan_in_returns_existing() {
    let h = harness();
    let first = h
        .engine
        .allocate(
            &AllocateRequest::new("ai")
                .with_instance_id("claude-a")
                .with_pid(Some(101)),
        )
        .unwrap();
    assert_eq!(first.port, port(11430));
    assert!(!first.existing);

    for other in ["claude-b", "claude-c", "claude-d", "claude-e"] {
        let outcome = h
            .engine
            .allocate(&AllocateRequest::new("ai").with_instance_id(other))
            .unwrap();
        assert_eq!(outcome.port, port(11430));
        assert!(outcome.existing);
        assert_eq!(outcome.existing_instance_id.as_deref(), Some("claude-a"));
        assert_eq!(outcome.existing_pid, Some(101));
        assert_eq!(outcome.lock_id, first.lock_id);
    }

    assert_eq!(h.engine.list_allocations().len(), 1);
}

#[test]
fn test_singleton_dead_holder_is_replaced() {
    let h = harness();
    let first = h
        .engine
        .allocate(
            &AllocateRequest::new("ai")
                .with_instance_id("claude-a")
                .with_pid(Some(101)),
        )
        .unwrap();

    h.process.mark_dead(101);
    let second = h
        .engine
        .allocate(
            &AllocateRequest::new("ai")
                .with_instance_id("claude-b")
                .with_pid(Some(102)),
        )
        .unwrap();

    assert!(!second.existing);
    assert_ne!(second.lock_id, first.lock_id);
    assert_eq!(h.engine.list_allocations().len(), 1);
    assert_eq!(
        h.engine.list_allocations()[0].instance_id,
        "claude-b".to_string()
    );
}

#[test]
fn test_release_then_singleton_reallocate() {
    let h = harness();
    let first = h
        .engine
        .allocate(&AllocateRequest::new("ai").with_instance_id("claude-a"))
        .unwrap();

    let freed = h
        .engine
        .release(&first.lock_id.unwrap().to_string())
        .unwrap();
    assert_eq!(freed, port(11430));

    let second = h
        .engine
        .allocate(&AllocateRequest::new("ai").with_instance_id("claude-b"))
        .unwrap();
    assert!(!second.existing);
    assert_ne!(second.lock_id, first.lock_id);
    assert_eq!(h.engine.list_allocations().len(), 1);
}

#[test]
fn test_release_is_exactly_once() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();
    let lock_id = outcome.lock_id.unwrap().to_string();

    assert!(h.engine.release(&lock_id).is_ok());
    let err = h.engine.release(&lock_id).unwrap_err();
    assert!(matches!(err, Error::InvalidLockId { .. }));
}

#[test]
fn test_release_validates_syntax_before_lookup() {
    let h = harness();
    let err = h.engine.release("not-a-uuid").unwrap_err();
    assert!(matches!(err, Error::InvalidLockId { .. }));
}

#[test]
fn test_dry_run_changes_nothing_and_predicts() {
    let h = harness();
    let dry = h
        .engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("i1")
                .with_dry_run(true),
        )
        .unwrap();
    assert!(dry.dry_run);
    assert!(dry.lock_id.is_none());
    assert!(h.engine.list_allocations().is_empty());

    // Same inputs, wet run: same port when nothing intervened.
    let wet = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();
    assert_eq!(wet.port, dry.port);
}

#[test]
fn test_check_reflects_table_and_probe() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();

    let status = h.engine.check(outcome.port.value()).unwrap();
    assert!(!status.available);
    assert!(status.allocated_to.is_some());

    let free = h.engine.check(3050).unwrap();
    assert!(free.available);
    assert!(free.allocated_to.is_none());

    h.prober.occupy(port(3051));
    let external = h.engine.check(3051).unwrap();
    assert!(!external.available);
    assert!(external.allocated_to.is_none());
}

#[test]
fn test_check_rejects_privileged_port() {
    let h = harness();
    assert!(h.engine.check(1023).is_err());
}

#[test]
fn test_scan_reports_only_in_use() {
    let h = harness();
    h.engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_preferred_port(Some(3010))
                .with_instance_id("i1"),
        )
        .unwrap();
    h.prober.occupy(port(3012));

    let in_use = h.engine.scan(3010, 3014).unwrap();
    let ports: Vec<u16> = in_use.iter().map(|s| s.port.value()).collect();
    assert_eq!(ports, vec![3010, 3012]);
}

#[test]
fn test_cleanup_removes_dead_process_allocations() {
    let h = harness();
    h.engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("i1")
                .with_pid(Some(500)),
        )
        .unwrap();
    h.engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("i2")
                .with_pid(Some(501)),
        )
        .unwrap();

    h.process.mark_dead(500);
    let report = h.engine.cleanup(false).unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(h.engine.list_allocations().len(), 1);
    assert!(h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::Cleanup { removed: 1, .. })));
}

#[test]
fn test_cleanup_force_removes_unverifiable() {
    let h = harness();
    h.engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("ghost"))
        .unwrap();

    let gentle = h.engine.cleanup(false).unwrap();
    assert_eq!(gentle.cleaned, 0);

    let forced = h.engine.cleanup(true).unwrap();
    assert_eq!(forced.cleaned, 1);
    assert!(h.engine.list_allocations().is_empty());
}

#[test]
fn test_health_sweep_escalates_to_cleanup() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("i1")
                .with_pid(Some(700)),
        )
        .unwrap();

    // The process is alive but nothing is bound on the port: each sweep is
    // a failure, and the third removes the allocation.
    assert_eq!(h.engine.health_sweep(), 0);
    assert_eq!(h.engine.health_sweep(), 0);
    assert_eq!(h.engine.list_allocations()[0].failure_count, 2);
    assert_eq!(h.engine.health_sweep(), 1);

    assert!(h.engine.list_allocations().is_empty());
    assert!(h.audit.events().iter().any(|e| matches!(
        e,
        AuditEvent::HealthCleanup { failures: 3, .. }
    )));
    let _ = outcome;
}

#[test]
fn test_health_sweep_success_resets_counter() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("i1")
                .with_pid(Some(700)),
        )
        .unwrap();

    assert_eq!(h.engine.health_sweep(), 0);
    assert_eq!(h.engine.list_allocations()[0].failure_count, 1);

    // The service comes up: the port now probes as in use.
    h.prober.occupy(outcome.port);
    assert_eq!(h.engine.health_sweep(), 0);
    assert_eq!(h.engine.list_allocations()[0].failure_count, 0);
}

#[test]
fn test_health_sweep_skips_probe_errors() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_instance_id("i1")
                .with_pid(Some(700)),
        )
        .unwrap();

    h.prober.fail(outcome.port);
    assert_eq!(h.engine.health_sweep(), 0);
    assert_eq!(h.engine.list_allocations()[0].failure_count, 0);
}

#[test]
fn test_suggest_is_advisory() {
    let h = harness();
    let suggestions = h.engine.suggest("dev", 3).unwrap();
    assert_eq!(suggestions.len(), 3);
    assert!(h.engine.list_allocations().is_empty());

    // Reserved and externally occupied ports are filtered out.
    h.engine
        .allocate(
            &AllocateRequest::new("dev")
                .with_preferred_port(Some(3000))
                .with_instance_id("i1"),
        )
        .unwrap();
    h.prober.occupy(port(3001));
    let suggestions = h.engine.suggest("dev", 2).unwrap();
    assert!(!suggestions.contains(&port(3000)));
    assert!(!suggestions.contains(&port(3001)));
}

#[test]
fn test_suggest_never_synthesizes() {
    let h = harness();
    let err = h.engine.suggest("grafana", 3).unwrap_err();
    assert!(matches!(err, Error::UnknownServiceType { .. }));
    assert!(h.engine.catalog().lookup("grafana").is_none());
}

#[test]
fn test_instance_registration_and_heartbeat() {
    let h = harness();
    h.engine.register_instance("claude-main", Some("/work".into()));
    assert!(h.engine.heartbeat("claude-main").is_ok());
    assert!(matches!(
        h.engine.heartbeat("missing"),
        Err(Error::NotFound { .. })
    ));

    h.engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("claude-main"))
        .unwrap();
    let instances = h.engine.list_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].active_locks.len(), 1);
}

#[test]
fn test_snapshot_restore_roundtrip() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("ai").with_instance_id("claude-a"))
        .unwrap();
    h.engine.register_instance("claude-a", None);

    let data = h.engine.snapshot_data();

    let restored = harness();
    restored.engine.restore(data);
    let allocations = restored.engine.list_allocations();
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].lock_id, outcome.lock_id.unwrap());

    // The singleton index survives the roundtrip.
    let again = restored
        .engine
        .allocate(&AllocateRequest::new("ai").with_instance_id("claude-b"))
        .unwrap();
    assert!(again.existing);
}

#[test]
fn test_undo_auto_allocation() {
    let h = harness();
    let outcome = h
        .engine
        .allocate(&AllocateRequest::new("grafana").with_instance_id("i1"))
        .unwrap();

    // Refused while the allocation is live.
    assert!(h.engine.undo_auto_allocation("grafana").is_err());

    h.engine
        .release(&outcome.lock_id.unwrap().to_string())
        .unwrap();
    h.engine.undo_auto_allocation("grafana").unwrap();
    assert!(h.engine.catalog().lookup("grafana").is_none());
    assert!(h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::AutoAllocationUndo { .. })));
}

#[test]
fn test_undo_refuses_builtin_type() {
    let h = harness();
    assert!(h.engine.undo_auto_allocation("dev").is_err());
}

#[test]
fn test_stats_counts() {
    let h = harness();
    h.engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();
    h.engine
        .allocate(&AllocateRequest::new("ai").with_instance_id("i2"))
        .unwrap();
    h.engine.register_instance("i1", None);

    let stats = h.engine.stats();
    assert_eq!(stats.active_allocations, 2);
    assert_eq!(stats.singleton_types, 1);
    assert_eq!(stats.registered_instances, 1);
    assert_eq!(stats.metrics.allocations_total, 2);
}

#[test]
fn test_concurrent_allocations_unique_ports() {
    use std::thread;

    let h = harness_with(|builder| builder);
    let engine = Arc::new(h.engine);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .allocate(&AllocateRequest::new("dev").with_instance_id(&format!("i{i}")))
                    .map(|o| o.port.value())
            })
        })
        .collect();

    let mut ports = std::collections::HashSet::new();
    for handle in handles {
        let port = handle.join().unwrap().unwrap();
        assert!(ports.insert(port), "duplicate port {port}");
    }
}

#[test]
fn test_concurrent_singleton_fan_in() {
    use std::thread;

    let h = harness();
    let engine = Arc::new(h.engine);

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .allocate(&AllocateRequest::new("ai").with_instance_id(&format!("claude-{i}")))
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<AllocateOutcome> = handles.into_iter().map(|t| t.join().unwrap()).collect();
    let winners = outcomes.iter().filter(|o| !o.existing).count();
    assert_eq!(winners, 1);
    assert!(outcomes.iter().all(|o| o.port == port(11430)));
    assert_eq!(engine.list_allocations().len(), 1);
}

#[test]
fn test_user_config_type_resolution() {
    // A user override narrows dev and the engine honors it.
    let mut config = ConfigFile::default();
    config.service_types.insert(
        "dev".into(),
        ServiceTypeSpec {
            preferred_ports: vec![4500],
            range: [4500, 4509],
            instance_behavior: None,
            allocation_pattern: None,
            description: None,
            auto_allocated: false,
            allocated_at: None,
        },
    );
    let catalog = Catalog::from_config(&config).unwrap();

    let prober = Arc::new(ScriptedProber::new());
    let engine = AllocationEngine::builder(catalog)
        .prober(Arc::clone(&prober) as Arc<dyn PortProber>)
        .build();

    let outcome = engine
        .allocate(&AllocateRequest::new("dev").with_instance_id("i1"))
        .unwrap();
    assert_eq!(outcome.port.value(), 4500);
}
