//! The allocation engine.
//!
//! This is the single serialization point for all port lifecycle decisions.
//! The engine exclusively owns the allocation table, singleton index, and
//! instance registry; every mutation goes through it under the owning
//! service type's mutex. Readers take short read locks and never block an
//! allocation for more than one lock acquisition.
//!
//! Lock ordering, outermost first: per-type mutex, allocation tables,
//! singleton index. The synthesis mutex is only ever taken before any of
//! them. Violating this order anywhere is a deadlock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use crate::allocation::{Allocation, AllocationState, LockId};
use crate::audit::{AuditEvent, AuditSink, NullSink};
use crate::catalog::{Catalog, InstanceBehavior, ServiceType};
use crate::config::{AutoAllocationConfig, RecoveryConfig};
use crate::error::{Error, Result};
use crate::instance::{InstanceRecord, InstanceRegistry};
use crate::metrics::Metrics;
use crate::port::{Port, PortRange};
use crate::probe::{PortProber, ProbeOutcome, SystemProber, SystemUsage};
use crate::process::{ProcessProbe, SystemProcessProbe};
use crate::state::{NullScheduler, SnapshotData, SnapshotScheduler};
use crate::synth;
use crate::writer::CatalogWriter;

/// A request to allocate one port.
#[derive(Debug, Clone, Default)]
pub struct AllocateRequest {
    /// Service type to allocate under.
    pub service_type: String,
    /// Free-form service label.
    pub service_name: Option<String>,
    /// Specific port the caller would like, tried first.
    pub preferred_port: Option<u16>,
    /// Caller identity; derived from the pid when absent.
    pub instance_id: Option<String>,
    /// Project path for bookkeeping.
    pub project_path: Option<String>,
    /// Caller process id.
    pub pid: Option<u32>,
    /// Plan without reserving.
    pub dry_run: bool,
}

impl AllocateRequest {
    /// A request for the given service type with everything else defaulted.
    #[must_use]
    pub fn new(service_type: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            ..Self::default()
        }
    }

    /// Sets the preferred port.
    #[must_use]
    pub const fn with_preferred_port(mut self, port: Option<u16>) -> Self {
        self.preferred_port = port;
        self
    }

    /// Sets the instance id.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    /// Sets the caller pid.
    #[must_use]
    pub const fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Sets the dry-run flag.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Successful result of an allocate call.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocateOutcome {
    /// The port.
    pub port: Port,
    /// The issued lock id; absent on dry runs and `existing` responses keep
    /// the original holder's id.
    pub lock_id: Option<LockId>,
    /// True when a singleton short-circuit returned an existing allocation.
    pub existing: bool,
    /// Holder of the existing allocation, when `existing` is set.
    pub existing_instance_id: Option<String>,
    /// Pid of the existing holder, when known.
    pub existing_pid: Option<u32>,
    /// True when the service type's range was synthesized for this request.
    pub auto_allocated: bool,
    /// The synthesized range, when `auto_allocated` is set.
    pub allocated_range: Option<PortRange>,
    /// True for dry runs; no state was changed.
    pub dry_run: bool,
}

/// Combined view of one port's state.
#[derive(Debug, Clone)]
pub struct PortStatus {
    /// The port.
    pub port: Port,
    /// Free in the table and free per the OS probe.
    pub available: bool,
    /// The daemon allocation holding the port, if any.
    pub allocated_to: Option<Allocation>,
    /// What the OS reports about an external occupant, if anything.
    pub system_usage: Option<SystemUsage>,
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Number of allocations removed.
    pub cleaned: usize,
    /// The ports freed.
    pub ports: Vec<u16>,
    /// Instance registrations dropped as stale.
    pub instances_dropped: usize,
}

/// An instance with its derived active lock ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    /// The registry record.
    pub record: InstanceRecord,
    /// Lock ids of allocations held by this instance.
    pub active_locks: Vec<LockId>,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Active (non-suspect) allocations.
    pub active_allocations: usize,
    /// Allocations with at least one failed health sweep.
    pub suspect_allocations: usize,
    /// Service types known to the catalog.
    pub service_types: usize,
    /// Singleton index entries.
    pub singleton_types: usize,
    /// Registered instances.
    pub registered_instances: usize,
    /// Operation counters.
    pub metrics: crate::metrics::MetricsSnapshot,
}

#[derive(Default)]
struct Tables {
    by_lock: HashMap<LockId, Allocation>,
    by_port: HashMap<Port, LockId>,
}

impl Tables {
    fn insert(&mut self, allocation: Allocation) {
        self.by_port.insert(allocation.port, allocation.lock_id);
        self.by_lock.insert(allocation.lock_id, allocation);
    }

    fn remove(&mut self, lock_id: &LockId) -> Option<Allocation> {
        let allocation = self.by_lock.remove(lock_id)?;
        self.by_port.remove(&allocation.port);
        Some(allocation)
    }

    fn visible_for_port(&self, port: Port) -> Option<&Allocation> {
        self.by_port
            .get(&port)
            .and_then(|lock_id| self.by_lock.get(lock_id))
            .filter(|allocation| allocation.is_visible())
    }
}

/// Builder for [`AllocationEngine`].
pub struct EngineBuilder {
    catalog: Catalog,
    auto_config: AutoAllocationConfig,
    recovery_config: RecoveryConfig,
    prober: Arc<dyn PortProber>,
    process: Arc<dyn ProcessProbe>,
    audit: Arc<dyn AuditSink>,
    scheduler: Arc<dyn SnapshotScheduler>,
    writer: Option<CatalogWriter>,
    metrics: Arc<Metrics>,
}

impl EngineBuilder {
    /// Sets the auto-allocation config.
    #[must_use]
    pub fn auto_allocation(mut self, config: AutoAllocationConfig) -> Self {
        self.auto_config = config;
        self
    }

    /// Sets the recovery config.
    #[must_use]
    pub fn recovery(mut self, config: RecoveryConfig) -> Self {
        self.recovery_config = config;
        self
    }

    /// Sets the port prober.
    #[must_use]
    pub fn prober(mut self, prober: Arc<dyn PortProber>) -> Self {
        self.prober = prober;
        self
    }

    /// Sets the process probe.
    #[must_use]
    pub fn process(mut self, process: Arc<dyn ProcessProbe>) -> Self {
        self.process = process;
        self
    }

    /// Sets the audit sink.
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Sets the snapshot scheduler.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn SnapshotScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the catalog writer used to persist synthesized types.
    #[must_use]
    pub fn catalog_writer(mut self, writer: CatalogWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Sets the shared metrics counters.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the engine.
    #[must_use]
    pub fn build(self) -> AllocationEngine {
        AllocationEngine {
            catalog: RwLock::new(Arc::new(self.catalog)),
            auto_config: self.auto_config,
            recovery_config: self.recovery_config,
            prober: self.prober,
            process: self.process,
            audit: self.audit,
            scheduler: self.scheduler,
            writer: self.writer,
            metrics: self.metrics,
            tables: RwLock::new(Tables::default()),
            singletons: Mutex::new(HashMap::new()),
            instances: Mutex::new(InstanceRegistry::new()),
            type_locks: Mutex::new(HashMap::new()),
            synth_lock: Mutex::new(()),
        }
    }
}

/// The allocation engine. See the module docs for the locking discipline.
pub struct AllocationEngine {
    catalog: RwLock<Arc<Catalog>>,
    auto_config: AutoAllocationConfig,
    recovery_config: RecoveryConfig,
    prober: Arc<dyn PortProber>,
    process: Arc<dyn ProcessProbe>,
    audit: Arc<dyn AuditSink>,
    scheduler: Arc<dyn SnapshotScheduler>,
    writer: Option<CatalogWriter>,
    metrics: Arc<Metrics>,
    tables: RwLock<Tables>,
    singletons: Mutex<HashMap<String, LockId>>,
    instances: Mutex<InstanceRegistry>,
    type_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    synth_lock: Mutex<()>,
}

impl AllocationEngine {
    /// Start building an engine around a catalog.
    #[must_use]
    pub fn builder(catalog: Catalog) -> EngineBuilder {
        EngineBuilder {
            catalog,
            auto_config: AutoAllocationConfig::default(),
            recovery_config: RecoveryConfig::default(),
            prober: Arc::new(SystemProber::new()),
            process: Arc::new(SystemProcessProbe),
            audit: Arc::new(NullSink),
            scheduler: Arc::new(NullScheduler),
            writer: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// The current catalog view.
    #[must_use]
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read())
    }

    /// The shared metrics counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Seed the engine from recovered snapshot data. Called once at startup,
    /// before any requests are served.
    pub fn restore(&self, data: SnapshotData) {
        {
            let mut tables = self.tables.write();
            for allocation in data.allocations {
                tables.insert(allocation);
            }
        }
        *self.singletons.lock() = data.singletons.into_iter().collect();
        self.instances.lock().replace(data.instances);
    }

    /// The persistable tables: visible allocations, singleton index,
    /// instance registry. Tentative rows are never included.
    #[must_use]
    pub fn snapshot_data(&self) -> SnapshotData {
        let allocations = {
            let tables = self.tables.read();
            tables
                .by_lock
                .values()
                .filter(|a| a.is_visible())
                .cloned()
                .collect()
        };
        let singletons = self
            .singletons
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        let instances = self.instances.lock().to_records();
        SnapshotData {
            allocations,
            singletons,
            instances,
        }
    }

    /// Allocate a port.
    ///
    /// Implements the full algorithm: resolve (or synthesize) the service
    /// type, singleton short-circuit, candidate construction, and the atomic
    /// reserve/probe loop bounded by the configured retry limit. Dry runs
    /// perform only the allocation-table check and change nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] / [`Error::InvalidPort`] for malformed input.
    /// - [`Error::UnknownServiceType`] when the type is unknown and
    ///   auto-allocation is disabled.
    /// - [`Error::NoSpace`] when synthesis cannot place a range.
    /// - [`Error::RangeExhausted`] when every candidate failed.
    pub fn allocate(&self, request: &AllocateRequest) -> Result<AllocateOutcome> {
        if request.service_type.trim().is_empty() {
            return Err(Error::Validation {
                field: "service_type".into(),
                message: "must be non-empty".into(),
            });
        }
        let preferred = request
            .preferred_port
            .map(Port::try_from)
            .transpose()
            .map_err(Error::from)?;

        let (service_type, synthesized_range) = self.resolve_service_type(&request.service_type)?;

        let instance_id = request
            .instance_id
            .clone()
            .or_else(|| request.pid.map(|pid| format!("pid-{pid}")))
            .unwrap_or_else(|| "anonymous".to_string());

        let type_lock = self.type_lock(&service_type.name);
        let _type_guard = type_lock.lock();

        // Singleton short-circuit: an existing healthy allocation is the
        // answer; a dead one is released before continuing.
        if service_type.instance_behavior == InstanceBehavior::Single {
            if let Some(existing) = self.singleton_allocation(&service_type.name) {
                let healthy = existing.pid.map_or(true, |pid| self.process.alive(pid));
                if healthy {
                    return Ok(AllocateOutcome {
                        port: existing.port,
                        lock_id: Some(existing.lock_id),
                        existing: true,
                        existing_instance_id: Some(existing.instance_id),
                        existing_pid: existing.pid,
                        auto_allocated: synthesized_range.is_some(),
                        allocated_range: synthesized_range,
                        dry_run: request.dry_run,
                    });
                }
                self.remove_locked(&existing.lock_id, &service_type.name);
                self.audit.record(AuditEvent::Release {
                    port: existing.port.value(),
                    lock_id: existing.lock_id.to_string(),
                });
                self.schedule_snapshot();
            }
        }

        let candidates = build_candidates(&service_type, preferred);

        if request.dry_run {
            let tables = self.tables.read();
            let port = candidates
                .iter()
                .copied()
                .find(|candidate| !tables.by_port.contains_key(candidate));
            return port.map_or_else(
                || {
                    Err(Error::RangeExhausted {
                        service_type: service_type.name.clone(),
                        attempts: candidates.len(),
                    })
                },
                |port| {
                    Ok(AllocateOutcome {
                        port,
                        lock_id: None,
                        existing: false,
                        existing_instance_id: None,
                        existing_pid: None,
                        auto_allocated: synthesized_range.is_some(),
                        allocated_range: synthesized_range,
                        dry_run: true,
                    })
                },
            );
        }

        let mut attempts = 0usize;
        for candidate in candidates {
            if attempts >= self.recovery_config.max_retries {
                break;
            }

            // Atomic test-and-reserve: the tentative row claims the port in
            // the table before the table lock drops for the probe.
            let tentative = {
                let mut tables = self.tables.write();
                if tables.by_port.contains_key(&candidate) {
                    continue;
                }
                let allocation = Allocation::builder(candidate, &service_type.name, &instance_id)
                    .service_name(request.service_name.clone())
                    .pid(request.pid)
                    .process_started_at(
                        request.pid.and_then(|pid| self.process.started_at(pid)),
                    )
                    .project_path(request.project_path.clone())
                    .build_tentative();
                tables.insert(allocation.clone());
                allocation
            };
            attempts += 1;

            let probe = if self.recovery_config.os_conflict_check {
                self.prober.probe(candidate)
            } else {
                ProbeOutcome::Free
            };

            match probe {
                ProbeOutcome::Free => {
                    {
                        let mut tables = self.tables.write();
                        if let Some(allocation) = tables.by_lock.get_mut(&tentative.lock_id) {
                            allocation.state = AllocationState::Active;
                            allocation.allocated_at = Utc::now();
                        }
                    }
                    if service_type.instance_behavior == InstanceBehavior::Single {
                        self.singletons
                            .lock()
                            .insert(service_type.name.clone(), tentative.lock_id);
                    }
                    self.audit.record(AuditEvent::Allocate {
                        port: candidate.value(),
                        service_type: service_type.name.clone(),
                        lock_id: tentative.lock_id.to_string(),
                        instance_id: instance_id.clone(),
                    });
                    self.metrics.incr_allocations();
                    self.schedule_snapshot();
                    return Ok(AllocateOutcome {
                        port: candidate,
                        lock_id: Some(tentative.lock_id),
                        existing: false,
                        existing_instance_id: None,
                        existing_pid: None,
                        auto_allocated: synthesized_range.is_some(),
                        allocated_range: synthesized_range,
                        dry_run: false,
                    });
                }
                ProbeOutcome::InUse => {
                    self.tables.write().remove(&tentative.lock_id);
                    self.metrics.incr_conflicts();
                }
                ProbeOutcome::Error(kind) => {
                    self.tables.write().remove(&tentative.lock_id);
                    tracing::debug!(port = %candidate, ?kind, "probe failed; skipping candidate");
                }
            }
        }

        Err(Error::RangeExhausted {
            service_type: service_type.name,
            attempts,
        })
    }

    /// Release an allocation by lock id.
    ///
    /// Returns the freed port.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidLockId`] for a syntactically invalid id or one with
    /// no backing allocation.
    pub fn release(&self, lock_id: &str) -> Result<Port> {
        let lock_id: LockId = lock_id.parse()?;

        let type_name = {
            let tables = self.tables.read();
            tables
                .by_lock
                .get(&lock_id)
                .map(|allocation| allocation.service_type.clone())
        }
        .ok_or_else(|| Error::InvalidLockId {
            lock_id: lock_id.to_string(),
        })?;

        let type_lock = self.type_lock(&type_name);
        let _type_guard = type_lock.lock();

        let Some(removed) = self.remove_locked(&lock_id, &type_name) else {
            // Lost a race with another release of the same id.
            return Err(Error::InvalidLockId {
                lock_id: lock_id.to_string(),
            });
        };

        self.audit.record(AuditEvent::Release {
            port: removed.port.value(),
            lock_id: lock_id.to_string(),
        });
        self.metrics.incr_releases();
        self.schedule_snapshot();
        Ok(removed.port)
    }

    /// Combined table + OS view of one port.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPort`] for out-of-range ports.
    pub fn check(&self, raw_port: u16) -> Result<PortStatus> {
        let port = Port::try_from(raw_port)?;
        let allocated_to = {
            let tables = self.tables.read();
            tables.visible_for_port(port).cloned()
        };
        let probe = self.prober.probe(port);
        let system_usage = if probe == ProbeOutcome::InUse {
            self.prober.system_usage(port)
        } else {
            None
        };
        Ok(PortStatus {
            port,
            available: allocated_to.is_none() && probe == ProbeOutcome::Free,
            allocated_to,
            system_usage,
        })
    }

    /// Statuses of all in-use ports in `[start, end]`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPortRange`] for malformed bounds.
    pub fn scan(&self, start: u16, end: u16) -> Result<Vec<PortStatus>> {
        let range = PortRange::from_bounds(start, end)?;
        let mut in_use = Vec::new();
        for port in range {
            let status = self.check(port.value())?;
            if !status.available {
                in_use.push(status);
            }
        }
        Ok(in_use)
    }

    /// Remove allocations owned by dead processes or stale instances.
    ///
    /// With `force`, allocations that cannot be verified (no pid, no
    /// registered instance) are removed as well.
    ///
    /// # Errors
    ///
    /// Currently infallible in practice; the signature leaves room for
    /// persistence errors.
    pub fn cleanup(&self, force: bool) -> Result<CleanupReport> {
        let stale_instances: HashSet<String> = {
            let instances = self.instances.lock();
            instances
                .stale_ids(Duration::from_secs(self.recovery_config.instance_stale_secs))
                .into_iter()
                .collect()
        };

        let snapshot: Vec<Allocation> = {
            let tables = self.tables.read();
            tables
                .by_lock
                .values()
                .filter(|a| a.is_visible())
                .cloned()
                .collect()
        };

        let mut report = CleanupReport::default();
        for allocation in snapshot {
            let dead_process = allocation
                .pid
                .is_some_and(|pid| !self.process.alive(pid));
            let dead_instance = stale_instances.contains(&allocation.instance_id);
            let unverifiable = allocation.pid.is_none()
                && self.instances.lock().get(&allocation.instance_id).is_none();

            if !(dead_process || dead_instance || (force && unverifiable)) {
                continue;
            }

            let type_lock = self.type_lock(&allocation.service_type);
            let _type_guard = type_lock.lock();
            if self
                .remove_locked(&allocation.lock_id, &allocation.service_type)
                .is_some()
            {
                report.cleaned += 1;
                report.ports.push(allocation.port.value());
            }
        }

        {
            let mut instances = self.instances.lock();
            for instance_id in &stale_instances {
                if instances.remove(instance_id).is_some() {
                    report.instances_dropped += 1;
                }
            }
        }

        report.ports.sort_unstable();
        if report.cleaned > 0 || report.instances_dropped > 0 {
            self.audit.record(AuditEvent::Cleanup {
                removed: report.cleaned,
                forced: force,
            });
            self.schedule_snapshot();
        }
        Ok(report)
    }

    /// One health-monitor sweep over all visible allocations.
    ///
    /// Per allocation: a dead pid or a free port is a failure; probe errors
    /// are skipped rather than counted; success resets the counter. An
    /// allocation reaching the configured failure limit is cleaned up.
    ///
    /// Returns the number of allocations cleaned up.
    pub fn health_sweep(&self) -> usize {
        let snapshot: Vec<Allocation> = {
            let tables = self.tables.read();
            tables
                .by_lock
                .values()
                .filter(|a| a.is_visible())
                .cloned()
                .collect()
        };

        let mut cleaned = 0usize;
        let mut mutated = false;

        for allocation in snapshot {
            let Some(pid) = allocation.pid else {
                // Nothing to verify against; counts as success.
                mutated |= self.reset_failures(&allocation.lock_id);
                continue;
            };

            let failed = if !self.process.alive(pid) {
                true
            } else {
                match self.prober.probe(allocation.port) {
                    ProbeOutcome::Free => true,
                    ProbeOutcome::InUse => false,
                    // Probe trouble is not evidence against the allocation.
                    ProbeOutcome::Error(_) => continue,
                }
            };

            if !failed {
                mutated |= self.reset_failures(&allocation.lock_id);
                continue;
            }

            self.metrics.incr_health_failures();
            let type_lock = self.type_lock(&allocation.service_type);
            let _type_guard = type_lock.lock();

            let failures = {
                let mut tables = self.tables.write();
                match tables.by_lock.get_mut(&allocation.lock_id) {
                    Some(row) => {
                        row.failure_count += 1;
                        row.state = AllocationState::Suspect;
                        row.failure_count
                    }
                    None => continue, // released while we probed
                }
            };
            mutated = true;

            if failures >= self.recovery_config.max_consecutive_failures {
                if self
                    .remove_locked(&allocation.lock_id, &allocation.service_type)
                    .is_some()
                {
                    self.audit.record(AuditEvent::HealthCleanup {
                        port: allocation.port.value(),
                        lock_id: allocation.lock_id.to_string(),
                        failures,
                    });
                    self.metrics.incr_health_cleanups();
                    cleaned += 1;
                }
            }
        }

        if mutated {
            self.schedule_snapshot();
        }
        cleaned
    }

    /// Up to `n` ports of `service_type` that look allocatable right now.
    ///
    /// Advisory only: nothing is reserved. This is the intercept library's
    /// path.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownServiceType`] when the type is not in the catalog;
    /// suggestions never trigger synthesis.
    pub fn suggest(&self, service_type: &str, n: usize) -> Result<Vec<Port>> {
        let catalog = self.catalog();
        let Some(service_type) = catalog.lookup(service_type) else {
            return Err(Error::UnknownServiceType {
                name: service_type.to_string(),
            });
        };

        let candidates = build_candidates(service_type, None);
        let mut suggestions = Vec::with_capacity(n);
        for candidate in candidates {
            if suggestions.len() >= n {
                break;
            }
            let reserved = self.tables.read().by_port.contains_key(&candidate);
            if reserved {
                continue;
            }
            if self.prober.probe(candidate) == ProbeOutcome::Free {
                suggestions.push(candidate);
            }
        }
        Ok(suggestions)
    }

    /// Record an observed bind from the intercept library. Informational.
    pub fn observe(&self, port: u16, pid: u32, service_hint: Option<&str>) {
        self.metrics.incr_observed_binds();
        tracing::debug!(port, pid, service_hint, "observed external bind");
    }

    /// Register an instance (idempotent) and return its record.
    pub fn register_instance(
        &self,
        instance_id: &str,
        working_directory: Option<String>,
    ) -> InstanceRecord {
        let mut instances = self.instances.lock();
        let record = instances.register(instance_id, working_directory).clone();
        drop(instances);
        self.schedule_snapshot();
        record
    }

    /// Record a heartbeat for a registered instance.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for unregistered instance ids.
    pub fn heartbeat(&self, instance_id: &str) -> Result<chrono::DateTime<Utc>> {
        let beat = self.instances.lock().heartbeat(instance_id);
        beat.ok_or_else(|| Error::NotFound {
            resource: format!("instance '{instance_id}'"),
        })
    }

    /// All registered instances with their derived active lock ids.
    #[must_use]
    pub fn list_instances(&self) -> Vec<InstanceView> {
        let records = self.instances.lock().to_records();
        let tables = self.tables.read();
        records
            .into_iter()
            .map(|record| {
                let mut active_locks: Vec<LockId> = tables
                    .by_lock
                    .values()
                    .filter(|a| a.is_visible() && a.instance_id == record.instance_id)
                    .map(|a| a.lock_id)
                    .collect();
                active_locks.sort_by_key(std::string::ToString::to_string);
                InstanceView {
                    record,
                    active_locks,
                }
            })
            .collect()
    }

    /// All visible allocations, sorted by port.
    #[must_use]
    pub fn list_allocations(&self) -> Vec<Allocation> {
        let tables = self.tables.read();
        let mut allocations: Vec<Allocation> = tables
            .by_lock
            .values()
            .filter(|a| a.is_visible())
            .cloned()
            .collect();
        allocations.sort_by_key(|a| a.port);
        allocations
    }

    /// Engine statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let (active, suspect) = {
            let tables = self.tables.read();
            let active = tables
                .by_lock
                .values()
                .filter(|a| a.state == AllocationState::Active)
                .count();
            let suspect = tables
                .by_lock
                .values()
                .filter(|a| a.state == AllocationState::Suspect)
                .count();
            (active, suspect)
        };
        StatsSnapshot {
            active_allocations: active,
            suspect_allocations: suspect,
            service_types: self.catalog().len(),
            singleton_types: self.singletons.lock().len(),
            registered_instances: self.instances.lock().len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Undo an auto-allocated service type: remove it from the user config
    /// and from the catalog view.
    ///
    /// # Errors
    ///
    /// Refuses while allocations for the type exist; propagates catalog
    /// writer errors.
    pub fn undo_auto_allocation(&self, name: &str) -> Result<()> {
        let in_use = {
            let tables = self.tables.read();
            tables
                .by_lock
                .values()
                .any(|a| a.is_visible() && a.service_type == name)
        };
        if in_use {
            return Err(Error::Validation {
                field: "service_type".into(),
                message: format!("'{name}' still has active allocations; release them first"),
            });
        }

        let _synth_guard = self.synth_lock.lock();
        if let Some(writer) = &self.writer {
            writer.remove_service_type(name)?;
        } else {
            // Without a writer there is nothing persisted; still validate
            // that the entry is an auto-allocated one.
            let catalog = self.catalog();
            let known = catalog.lookup(name);
            if !known.is_some_and(|t| t.auto_allocated) {
                return Err(Error::Validation {
                    field: "service_type".into(),
                    message: format!("'{name}' was not auto-allocated"),
                });
            }
        }

        let next = self.catalog().without_type(name);
        *self.catalog.write() = Arc::new(next);
        self.audit.record(AuditEvent::AutoAllocationUndo {
            service_type: name.to_string(),
        });
        Ok(())
    }

    fn resolve_service_type(&self, name: &str) -> Result<(ServiceType, Option<PortRange>)> {
        if let Some(service_type) = self.catalog.read().lookup(name) {
            return Ok((service_type.clone(), None));
        }
        if !self.auto_config.enabled {
            return Err(Error::UnknownServiceType {
                name: name.to_string(),
            });
        }

        let _synth_guard = self.synth_lock.lock();
        // A concurrent resolver may have won the race; observe its entry
        // instead of synthesizing twice.
        if let Some(service_type) = self.catalog.read().lookup(name) {
            return Ok((service_type.clone(), None));
        }

        let catalog = self.catalog();
        let range = synth::synthesize_range(&catalog, name, &self.auto_config)?;
        let service_type = synth::synthesized_type(name, range);

        if let Some(writer) = &self.writer {
            writer.add_service_type(name, &service_type.to_spec())?;
        }

        *self.catalog.write() = Arc::new(catalog.with_type(service_type.clone()));
        self.audit.record(AuditEvent::AutoAllocation {
            service_type: name.to_string(),
            range: [range.min().value(), range.max().value()],
        });
        self.metrics.incr_auto_allocations();
        tracing::info!(service_type = name, %range, "synthesized service-type range");
        Ok((service_type, Some(range)))
    }

    fn singleton_allocation(&self, type_name: &str) -> Option<Allocation> {
        let lock_id = *self.singletons.lock().get(type_name)?;
        let tables = self.tables.read();
        tables.by_lock.get(&lock_id).cloned()
    }

    /// Remove an allocation and its singleton entry. Caller holds the
    /// owning type's lock.
    fn remove_locked(&self, lock_id: &LockId, type_name: &str) -> Option<Allocation> {
        let removed = self.tables.write().remove(lock_id)?;
        let mut singletons = self.singletons.lock();
        if singletons.get(type_name) == Some(lock_id) {
            singletons.remove(type_name);
        }
        Some(removed)
    }

    fn reset_failures(&self, lock_id: &LockId) -> bool {
        let mut tables = self.tables.write();
        match tables.by_lock.get_mut(lock_id) {
            Some(row) if row.failure_count > 0 => {
                row.failure_count = 0;
                row.state = AllocationState::Active;
                true
            }
            _ => false,
        }
    }

    fn type_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.type_locks.lock();
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn schedule_snapshot(&self) {
        self.scheduler.schedule(self.snapshot_data());
    }
}

/// Candidate ports for a service type, deduplicated, in trial order.
///
/// The explicit preferred port (when in range) comes first, then the type's
/// preferred list, then the range: ascending for `sequential`, and starting
/// from the first preferred port with wrap-around for `preferred_first`.
fn build_candidates(service_type: &ServiceType, preferred: Option<Port>) -> Vec<Port> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    let mut push = |port: Port, candidates: &mut Vec<Port>| {
        if seen.insert(port) {
            candidates.push(port);
        }
    };

    if let Some(port) = preferred {
        if service_type.range.contains(port) {
            push(port, &mut candidates);
        }
    }
    for &port in &service_type.preferred_ports {
        push(port, &mut candidates);
    }

    match service_type.allocation_pattern {
        crate::catalog::AllocationPattern::Sequential => {
            for port in service_type.range {
                push(port, &mut candidates);
            }
        }
        crate::catalog::AllocationPattern::PreferredFirst => {
            let pivot = service_type
                .preferred_ports
                .first()
                .copied()
                .unwrap_or_else(|| service_type.range.min());
            for port in service_type.range {
                if port >= pivot {
                    push(port, &mut candidates);
                }
            }
            for port in service_type.range {
                if port < pivot {
                    push(port, &mut candidates);
                }
            }
        }
    }

    candidates
}

#[cfg(test)]
mod tests;
