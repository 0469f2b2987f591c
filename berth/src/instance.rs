//! Instance registry.
//!
//! An instance is an external process or session participating in
//! coordination. Instances register themselves, heartbeat periodically, and
//! are considered dead once their heartbeat goes stale; dead instances'
//! allocations become cleanup candidates.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Caller-supplied or pid-derived identifier.
    pub instance_id: String,
    /// Working directory reported at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// When the instance first registered.
    pub registered_at: DateTime<Utc>,
    /// Most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl InstanceRecord {
    /// Whether the last heartbeat is older than `threshold`.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age.to_std().map_or(false, |age| age > threshold)
    }
}

/// In-memory registry of instances, keyed by instance id.
///
/// Owned by the allocation engine; all access goes through engine locks.
/// Active lock ids are intentionally not stored here; they are derived from
/// the allocation table to keep a single source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRegistry {
    records: HashMap<String, InstanceRecord>,
}

impl InstanceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance, or refresh its registration.
    ///
    /// Returns the stored record.
    pub fn register(&mut self, instance_id: &str, working_directory: Option<String>) -> &InstanceRecord {
        let now = Utc::now();
        self.records
            .entry(instance_id.to_string())
            .and_modify(|record| {
                record.last_heartbeat = now;
                if working_directory.is_some() {
                    record.working_directory.clone_from(&working_directory);
                }
            })
            .or_insert_with(|| InstanceRecord {
                instance_id: instance_id.to_string(),
                working_directory,
                registered_at: now,
                last_heartbeat: now,
            })
    }

    /// Record a heartbeat. Returns the new heartbeat time, or `None` for an
    /// unregistered instance.
    pub fn heartbeat(&mut self, instance_id: &str) -> Option<DateTime<Utc>> {
        let record = self.records.get_mut(instance_id)?;
        record.last_heartbeat = Utc::now();
        Some(record.last_heartbeat)
    }

    /// Look up an instance.
    #[must_use]
    pub fn get(&self, instance_id: &str) -> Option<&InstanceRecord> {
        self.records.get(instance_id)
    }

    /// Remove an instance, returning its record.
    pub fn remove(&mut self, instance_id: &str) -> Option<InstanceRecord> {
        self.records.remove(instance_id)
    }

    /// Iterate all records.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records.values()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of instances whose heartbeat is older than `threshold`.
    #[must_use]
    pub fn stale_ids(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        self.records
            .values()
            .filter(|record| record.is_stale(threshold, now))
            .map(|record| record.instance_id.clone())
            .collect()
    }

    /// Replace the registry contents (snapshot restore).
    pub fn replace(&mut self, records: Vec<InstanceRecord>) {
        self.records = records
            .into_iter()
            .map(|record| (record.instance_id.clone(), record))
            .collect();
    }

    /// All records, for snapshotting.
    #[must_use]
    pub fn to_records(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<InstanceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_heartbeat() {
        let mut registry = InstanceRegistry::new();
        registry.register("claude-main", Some("/work/app".into()));
        assert_eq!(registry.len(), 1);

        let beat = registry.heartbeat("claude-main");
        assert!(beat.is_some());
        assert!(registry.heartbeat("missing").is_none());
    }

    #[test]
    fn test_reregistration_keeps_registered_at() {
        let mut registry = InstanceRegistry::new();
        let first = registry.register("i", None).registered_at;
        let second = registry.register("i", Some("/work".into())).registered_at;
        assert_eq!(first, second);
        assert_eq!(
            registry.get("i").unwrap().working_directory.as_deref(),
            Some("/work")
        );
    }

    #[test]
    fn test_staleness() {
        let mut registry = InstanceRegistry::new();
        registry.register("i", None);

        assert!(registry.stale_ids(Duration::from_secs(300)).is_empty());

        // Backdate the heartbeat.
        let record = registry.records.get_mut("i").unwrap();
        record.last_heartbeat = Utc::now() - chrono::Duration::seconds(600);
        assert_eq!(registry.stale_ids(Duration::from_secs(300)), vec!["i"]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut registry = InstanceRegistry::new();
        registry.register("a", None);
        registry.register("b", Some("/b".into()));

        let records = registry.to_records();
        let mut restored = InstanceRegistry::new();
        restored.replace(records);
        assert_eq!(restored.len(), 2);
        assert!(restored.get("b").is_some());
    }
}
