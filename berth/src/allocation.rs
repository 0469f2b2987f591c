//! Allocation records and lock identifiers.
//!
//! An allocation is the daemon's reservation of one port for one instance,
//! identified by an opaque lock id. The state machine is Tentative (inside a
//! single allocate call) -> Active -> Released, with the health monitor able
//! to move Active allocations through Suspect on the way out.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::port::Port;

/// Opaque 128-bit allocation identifier.
///
/// Lock ids are UUID v4; [`LockId::from_str`] performs the syntactic
/// validation the engine requires before any table lookup.
///
/// # Examples
///
/// ```
/// use berth::allocation::LockId;
///
/// let id = LockId::generate();
/// let parsed: LockId = id.to_string().parse().unwrap();
/// assert_eq!(id, parsed);
///
/// assert!("not-a-lock-id".parse::<LockId>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(Uuid);

impl LockId {
    /// Generate a fresh lock id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl FromStr for LockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = Uuid::parse_str(s).map_err(|_| Error::InvalidLockId {
            lock_id: s.to_string(),
        })?;
        if parsed.get_version_num() != 4 {
            return Err(Error::InvalidLockId {
                lock_id: s.to_string(),
            });
        }
        Ok(Self(parsed))
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    /// Inserted during an allocate call, before the OS probe passed.
    /// Never persisted and never reported to readers.
    Tentative,
    /// Probe passed; the allocation is live.
    Active,
    /// The health monitor has seen at least one failed sweep.
    Suspect,
    /// Terminal; the record is removed from the table at this point.
    Released,
}

/// A port reservation held by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique lock id.
    pub lock_id: LockId,
    /// The reserved port; unique across all allocations.
    pub port: Port,
    /// Owning service type, by name.
    pub service_type: String,
    /// Free-form service label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Owning instance id.
    pub instance_id: String,
    /// Owning process id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Process start-time fingerprint, when known. Distinguishes a reused
    /// pid from the original process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_started_at: Option<u64>,
    /// Project path supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// When the allocation was finalized.
    pub allocated_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: AllocationState,
    /// Consecutive failed health sweeps.
    #[serde(default)]
    pub failure_count: u32,
}

impl Allocation {
    /// Start building an allocation.
    #[must_use]
    pub fn builder(port: Port, service_type: &str, instance_id: &str) -> AllocationBuilder {
        AllocationBuilder {
            port,
            service_type: service_type.to_string(),
            instance_id: instance_id.to_string(),
            service_name: None,
            pid: None,
            process_started_at: None,
            project_path: None,
        }
    }

    /// Whether readers should see this allocation.
    #[must_use]
    pub const fn is_visible(&self) -> bool {
        matches!(self.state, AllocationState::Active | AllocationState::Suspect)
    }
}

/// Builder for [`Allocation`].
#[derive(Debug, Clone)]
pub struct AllocationBuilder {
    port: Port,
    service_type: String,
    instance_id: String,
    service_name: Option<String>,
    pid: Option<u32>,
    process_started_at: Option<u64>,
    project_path: Option<String>,
}

impl AllocationBuilder {
    /// Sets the service label.
    #[must_use]
    pub fn service_name(mut self, name: Option<String>) -> Self {
        self.service_name = name;
        self
    }

    /// Sets the owning process id.
    #[must_use]
    pub const fn pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    /// Sets the process start-time fingerprint.
    #[must_use]
    pub const fn process_started_at(mut self, started_at: Option<u64>) -> Self {
        self.process_started_at = started_at;
        self
    }

    /// Sets the project path.
    #[must_use]
    pub fn project_path(mut self, path: Option<String>) -> Self {
        self.project_path = path;
        self
    }

    /// Build a tentative allocation with a fresh lock id.
    ///
    /// The engine promotes it to Active once the OS probe passes.
    #[must_use]
    pub fn build_tentative(self) -> Allocation {
        Allocation {
            lock_id: LockId::generate(),
            port: self.port,
            service_type: self.service_type,
            service_name: self.service_name,
            instance_id: self.instance_id,
            pid: self.pid,
            process_started_at: self.process_started_at,
            project_path: self.project_path,
            allocated_at: Utc::now(),
            state: AllocationState::Tentative,
            failure_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_id_roundtrip() {
        let id = LockId::generate();
        let parsed: LockId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_lock_id_rejects_garbage() {
        assert!("".parse::<LockId>().is_err());
        assert!("not-a-uuid".parse::<LockId>().is_err());
        // Valid UUID shape but wrong version (v1-style nil variant).
        assert!("00000000-0000-1000-8000-000000000000"
            .parse::<LockId>()
            .is_err());
    }

    #[test]
    fn test_lock_ids_are_unique() {
        let a = LockId::generate();
        let b = LockId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_builder_defaults() {
        let port = Port::try_from(3000).unwrap();
        let allocation = Allocation::builder(port, "dev", "instance-1").build_tentative();
        assert_eq!(allocation.state, AllocationState::Tentative);
        assert_eq!(allocation.failure_count, 0);
        assert!(!allocation.is_visible());
        assert!(allocation.pid.is_none());
    }

    #[test]
    fn test_visibility() {
        let port = Port::try_from(3000).unwrap();
        let mut allocation = Allocation::builder(port, "dev", "i").build_tentative();
        allocation.state = AllocationState::Active;
        assert!(allocation.is_visible());
        allocation.state = AllocationState::Suspect;
        assert!(allocation.is_visible());
    }

    #[test]
    fn test_serde_roundtrip() {
        let port = Port::try_from(3000).unwrap();
        let mut allocation = Allocation::builder(port, "dev", "i")
            .pid(Some(4242))
            .service_name(Some("web".into()))
            .build_tentative();
        allocation.state = AllocationState::Active;

        let json = serde_json::to_string(&allocation).unwrap();
        let back: Allocation = serde_json::from_str(&json).unwrap();
        assert_eq!(allocation, back);
    }
}
