//! Append-only audit log.
//!
//! Every state-changing outcome emits one structured event. Events flow
//! through a bounded in-memory backlog to a dedicated writer thread so the
//! request path never blocks on disk; when the backlog overflows, the oldest
//! entries are dropped and a metrics counter records the loss.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::metrics::Metrics;

/// Default backlog capacity before old events are dropped.
pub const DEFAULT_BACKLOG: usize = 1024;

/// Default size at which the audit log rotates.
pub const DEFAULT_ROTATE_BYTES: u64 = 5 * 1024 * 1024;

/// A state-changing event worth auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    /// A port was allocated.
    Allocate {
        /// The allocated port.
        port: u16,
        /// Owning service type.
        service_type: String,
        /// The issued lock id.
        lock_id: String,
        /// Owning instance.
        instance_id: String,
    },
    /// An allocation was released.
    Release {
        /// The released port.
        port: u16,
        /// The released lock id.
        lock_id: String,
    },
    /// A range was synthesized for an unknown service type.
    AutoAllocation {
        /// The new service type.
        service_type: String,
        /// The synthesized `[low, high]` range.
        range: [u16; 2],
    },
    /// An auto-allocated service type was removed.
    AutoAllocationUndo {
        /// The removed service type.
        service_type: String,
    },
    /// Explicit cleanup removed stale allocations.
    Cleanup {
        /// How many allocations were removed.
        removed: usize,
        /// Whether the force flag was set.
        forced: bool,
    },
    /// The health monitor removed a failing allocation.
    HealthCleanup {
        /// The cleaned-up port.
        port: u16,
        /// The cleaned-up lock id.
        lock_id: String,
        /// Consecutive failures at cleanup time.
        failures: u32,
    },
    /// Startup recovery repaired persisted state.
    Recovery {
        /// Allocations loaded from the snapshot.
        allocations_before: usize,
        /// Allocations surviving recovery.
        allocations_after: usize,
        /// Orphans dropped (dead pid or unknown service type).
        orphans_dropped: usize,
        /// Singleton index entries repaired.
        singletons_repaired: usize,
    },
}

/// A timestamped audit record, one JSON object per log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Event time, UTC.
    pub timestamp: DateTime<Utc>,
    /// The event payload, flattened into the record.
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Destination for audit events.
///
/// The engine only depends on this trait; the daemon installs the file
/// writer, tests install [`MemorySink`].
pub trait AuditSink: Send + Sync {
    /// Record one event. Must not block the caller on I/O.
    fn record(&self, event: AuditEvent);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Sink that collects events in memory, for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

struct Backlog {
    queue: VecDeque<AuditRecord>,
    shutdown: bool,
}

/// File-backed audit writer with a dedicated flush thread.
pub struct AuditWriter {
    backlog: Arc<(Mutex<Backlog>, Condvar)>,
    metrics: Arc<Metrics>,
    capacity: usize,
}

impl AuditWriter {
    /// Spawn the writer thread for `path`.
    ///
    /// Returns the writer handle and the join handle for shutdown.
    #[must_use]
    pub fn spawn(
        path: PathBuf,
        metrics: Arc<Metrics>,
        capacity: usize,
        rotate_bytes: u64,
    ) -> (Arc<Self>, std::thread::JoinHandle<()>) {
        let backlog = Arc::new((
            Mutex::new(Backlog {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let writer = Arc::new(Self {
            backlog: Arc::clone(&backlog),
            metrics,
            capacity: capacity.max(1),
        });

        let handle = std::thread::Builder::new()
            .name("berth-audit".into())
            .spawn(move || flush_loop(&backlog, &path, rotate_bytes))
            .unwrap_or_else(|e| {
                // Thread spawn failing at startup is unrecoverable.
                panic!("failed to spawn audit writer thread: {e}")
            });

        (writer, handle)
    }

    /// Ask the writer thread to drain and exit.
    pub fn shutdown(&self) {
        let (lock, condvar) = &*self.backlog;
        lock.lock().shutdown = true;
        condvar.notify_all();
    }
}

impl AuditSink for AuditWriter {
    fn record(&self, event: AuditEvent) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event,
        };
        let (lock, condvar) = &*self.backlog;
        let mut backlog = lock.lock();
        if backlog.queue.len() >= self.capacity {
            backlog.queue.pop_front();
            self.metrics.incr_audit_dropped();
        }
        backlog.queue.push_back(record);
        condvar.notify_one();
    }
}

fn flush_loop(backlog: &(Mutex<Backlog>, Condvar), path: &Path, rotate_bytes: u64) {
    let (lock, condvar) = backlog;
    loop {
        let (batch, shutting_down) = {
            let mut guard = lock.lock();
            while guard.queue.is_empty() && !guard.shutdown {
                condvar.wait(&mut guard);
            }
            (
                guard.queue.drain(..).collect::<Vec<AuditRecord>>(),
                guard.shutdown,
            )
        };
        write_batch(path, &batch, rotate_bytes);
        if shutting_down {
            return;
        }
    }
}

fn write_batch(path: &Path, batch: &[AuditRecord], rotate_bytes: u64) {
    if batch.is_empty() {
        return;
    }
    rotate_if_needed(path, rotate_bytes);
    let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
        tracing::warn!(path = %path.display(), "audit log unwritable; dropping batch");
        return;
    };
    for record in batch {
        match serde_json::to_string(record) {
            Ok(line) => {
                if writeln!(file, "{line}").is_err() {
                    tracing::warn!(path = %path.display(), "audit append failed");
                    return;
                }
            }
            Err(e) => tracing::warn!(error = %e, "unserializable audit record"),
        }
    }
}

fn rotate_if_needed(path: &Path, rotate_bytes: u64) {
    let Ok(meta) = fs::metadata(path) else {
        return;
    };
    if meta.len() < rotate_bytes {
        return;
    }
    let rotated = path.with_extension("log.1");
    if fs::rename(path, &rotated).is_err() {
        tracing::warn!(path = %path.display(), "audit rotation failed");
    }
}

/// Read all records from an audit log file, skipping unparsable lines.
///
/// # Errors
///
/// Returns an error only if the file cannot be read at all.
pub fn read_log(path: &Path) -> std::io::Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocate_event(port: u16) -> AuditEvent {
        AuditEvent::Allocate {
            port,
            service_type: "dev".into(),
            lock_id: "lock".into(),
            instance_id: "i".into(),
        }
    }

    #[test]
    fn test_wire_format_uses_screaming_actions() {
        let record = AuditRecord {
            timestamp: Utc::now(),
            event: AuditEvent::AutoAllocation {
                service_type: "grafana".into(),
                range: [20000, 20009],
            },
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"action\":\"AUTO_ALLOCATION\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.record(allocate_event(3000));
        sink.record(AuditEvent::Release {
            port: 3000,
            lock_id: "lock".into(),
        });
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn test_writer_persists_and_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let metrics = Arc::new(Metrics::new());

        let (writer, handle) =
            AuditWriter::spawn(path.clone(), metrics, DEFAULT_BACKLOG, DEFAULT_ROTATE_BYTES);
        writer.record(allocate_event(3000));
        writer.record(allocate_event(3001));
        writer.shutdown();
        handle.join().unwrap();

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(
            records[0].event,
            AuditEvent::Allocate { port: 3000, .. }
        ));
    }

    #[test]
    fn test_backlog_overflow_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        // Writer with a tiny backlog; hold the flush thread off by never
        // giving it a chance matters little here since drops happen on the
        // producer side before notify.
        let writer = AuditWriter {
            backlog: Arc::new((
                Mutex::new(Backlog {
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                Condvar::new(),
            )),
            metrics: Arc::clone(&metrics),
            capacity: 2,
        };
        let _ = dir;

        writer.record(allocate_event(3000));
        writer.record(allocate_event(3001));
        writer.record(allocate_event(3002));

        assert_eq!(metrics.snapshot().audit_events_dropped, 1);
        let (lock, _) = &*writer.backlog;
        let queue: Vec<u16> = lock
            .lock()
            .queue
            .iter()
            .map(|record| match record.event {
                AuditEvent::Allocate { port, .. } => port,
                _ => 0,
            })
            .collect();
        assert_eq!(queue, vec![3001, 3002]);
    }
}
