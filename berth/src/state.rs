//! Crash-safe state snapshots.
//!
//! The state store owns `daemon.state`: a checksummed JSON snapshot of the
//! allocation table, singleton index, and instance registry. Writes go to a
//! temporary file, fsync, then an atomic rename; a snapshot that fails its
//! integrity check at load is quarantined under a timestamped name and the
//! daemon starts empty.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::allocation::{Allocation, LockId};
use crate::error::Result;
use crate::instance::InstanceRecord;

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// The mutable tables persisted in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Active allocations, sorted by port for stable serialization.
    pub allocations: Vec<Allocation>,
    /// Singleton index: service-type name to lock id.
    pub singletons: BTreeMap<String, LockId>,
    /// Registered instances.
    pub instances: Vec<InstanceRecord>,
}

impl SnapshotData {
    fn normalized(mut self) -> Self {
        self.allocations.sort_by_key(|a| a.port);
        self.instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        self
    }

    fn checksum(&self) -> Result<String> {
        let body = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&body);
        Ok(format!("{digest:x}"))
    }
}

/// On-disk snapshot envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: DateTime<Utc>,
    checksum: String,
    data: SnapshotData,
}

/// Outcome of loading the snapshot at startup.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No snapshot file exists; first run or clean slate.
    Missing,
    /// The snapshot loaded and passed its integrity checks.
    Loaded(SnapshotData),
    /// The snapshot was corrupt and has been moved aside.
    Quarantined {
        /// Where the corrupt file went.
        quarantine_path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },
}

/// Owns the on-disk snapshot file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store for the given snapshot path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The snapshot path.
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Write a snapshot atomically: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or I/O failure; the live file is
    /// untouched in that case.
    pub fn save(&self, data: &SnapshotData) -> Result<()> {
        let data = data.clone().normalized();
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            checksum: data.checksum()?,
            data,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("state.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(serde_json::to_string_pretty(&file)?.as_bytes())?;
            tmp.write_all(b"\n")?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Load and verify the snapshot.
    ///
    /// Corruption (unparsable JSON, version mismatch, checksum mismatch) is
    /// not an error: the bad file is quarantined and reported through
    /// [`LoadOutcome::Quarantined`].
    ///
    /// # Errors
    ///
    /// Returns an error only for I/O failures other than a missing file.
    pub fn load(&self) -> Result<LoadOutcome> {
        if !self.path.exists() {
            return Ok(LoadOutcome::Missing);
        }
        let raw = fs::read_to_string(&self.path)?;

        let parsed: SnapshotFile = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => return self.quarantine(format!("unparsable snapshot: {e}")),
        };
        if parsed.version != SNAPSHOT_VERSION {
            return self.quarantine(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                parsed.version
            ));
        }
        let expected = parsed.data.checksum()?;
        if expected != parsed.checksum {
            return self.quarantine(format!(
                "checksum mismatch: recorded {}, computed {expected}",
                parsed.checksum
            ));
        }
        Ok(LoadOutcome::Loaded(parsed.data))
    }

    /// Copy the live snapshot to a timestamped backup name.
    ///
    /// Used by recovery before it replaces the snapshot with repaired state.
    ///
    /// # Errors
    ///
    /// Returns an error if the copy fails.
    pub fn backup(&self, label: &str) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let backup_path = self.path.with_extension(format!("{label}-{stamp}"));
        fs::copy(&self.path, &backup_path)?;
        Ok(Some(backup_path))
    }

    fn quarantine(&self, reason: String) -> Result<LoadOutcome> {
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let quarantine_path = self.path.with_extension(format!("corrupt-{stamp}"));
        fs::rename(&self.path, &quarantine_path)?;
        tracing::warn!(
            quarantine = %quarantine_path.display(),
            reason = %reason,
            "quarantined corrupt snapshot"
        );
        Ok(LoadOutcome::Quarantined {
            quarantine_path,
            reason,
        })
    }
}

/// Seam through which the engine requests background persistence.
///
/// Request paths never wait on disk: they hand the current tables to the
/// scheduler and move on.
pub trait SnapshotScheduler: Send + Sync {
    /// Queue a snapshot of `data`.
    fn schedule(&self, data: SnapshotData);
}

/// Scheduler that drops snapshots, for tests and dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScheduler;

impl SnapshotScheduler for NullScheduler {
    fn schedule(&self, _data: SnapshotData) {}
}

/// Latest-wins scheduler backed by a watch channel.
///
/// The paired [`snapshot_writer_task`] serializes writes; queueing a new
/// snapshot while one is in flight simply replaces the pending value, so
/// snapshots are never interleaved and the newest state always wins.
#[derive(Debug, Clone)]
pub struct ChannelScheduler {
    tx: watch::Sender<Option<SnapshotData>>,
}

impl ChannelScheduler {
    /// Create the scheduler and its receiving half.
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<Option<SnapshotData>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }
}

impl SnapshotScheduler for ChannelScheduler {
    fn schedule(&self, data: SnapshotData) {
        // Fails only when the writer task is gone, i.e. during shutdown;
        // the final synchronous snapshot covers that window.
        let _ = self.tx.send(Some(data));
    }
}

/// Background task draining [`ChannelScheduler`] into a [`StateStore`].
pub async fn snapshot_writer_task(
    store: StateStore,
    mut rx: watch::Receiver<Option<SnapshotData>>,
) {
    while rx.changed().await.is_ok() {
        let pending = rx.borrow_and_update().clone();
        if let Some(data) = pending {
            if let Err(e) = store.save(&data) {
                tracing::error!(error = %e, "background snapshot failed");
            }
        }
    }
}
