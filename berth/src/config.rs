//! Configuration for the berth daemon.
//!
//! Configuration comes from three layers, lowest precedence first: built-in
//! defaults, the user's `config.json` in the data directory, and environment
//! variables (`BERTH_DATA_DIR`, `BERTH_DAEMON_PORT`). Invalid entries fail at
//! startup, never at request time.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default loopback port the daemon listens on.
pub const DEFAULT_LISTEN_PORT: u16 = 9876;

/// Default chunk size for synthesized ranges.
pub const DEFAULT_CHUNK_SIZE: u16 = 10;

/// Default gap left between synthesized ranges and their neighbors.
pub const DEFAULT_GAP_SIZE: u16 = 10;

/// Strategy for placing a synthesized range relative to known ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStrategy {
    /// Place immediately after the current maximum used high port, plus gap.
    #[default]
    After,
    /// Place immediately before the current minimum used low port, minus gap.
    Before,
    /// Scan for the first sufficiently large gap between used ranges; fall
    /// back to `After` when none exists.
    Smart,
}

/// A glob rule mapping service-type names to a chunk-size override.
///
/// Only two glob shapes are supported: `prefix-*` and `*-suffix`. A rule
/// without a `*` matches exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    /// The glob pattern, e.g. `monitoring-*`.
    pub pattern: String,
    /// Chunk size for service types matching the pattern.
    pub chunk_size: u16,
}

impl PatternRule {
    /// Returns `true` if `name` matches this rule's pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        if let Some(prefix) = self.pattern.strip_suffix("-*") {
            name.strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('-'))
        } else if let Some(suffix) = self.pattern.strip_prefix("*-") {
            name.strip_suffix(suffix)
                .is_some_and(|rest| rest.ends_with('-'))
        } else {
            self.pattern == name
        }
    }
}

/// Resolved auto-allocation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoAllocationConfig {
    /// Whether unknown service types get a range synthesized on demand.
    pub enabled: bool,
    /// Chunk size when no pattern rule matches.
    pub default_chunk_size: u16,
    /// Placement strategy for new ranges.
    pub placement: PlacementStrategy,
    /// Lowest port synthesis may use.
    pub min_port: u16,
    /// Highest port synthesis may use.
    pub max_port: u16,
    /// Keep `gap_size` free ports between a new range and its neighbors.
    pub preserve_gaps: bool,
    /// Gap size honored when `preserve_gaps` is set.
    pub gap_size: u16,
    /// Chunk-size overrides keyed by glob pattern, checked in order.
    pub pattern_rules: Vec<PatternRule>,
}

impl Default for AutoAllocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            placement: PlacementStrategy::After,
            min_port: 10000,
            max_port: 65000,
            preserve_gaps: true,
            gap_size: DEFAULT_GAP_SIZE,
            pattern_rules: Vec::new(),
        }
    }
}

impl AutoAllocationConfig {
    /// Resolve the chunk size for a service-type name.
    ///
    /// The first matching pattern rule wins; otherwise the default applies.
    /// The result is clamped to at least 1.
    #[must_use]
    pub fn chunk_size_for(&self, name: &str) -> u16 {
        self.pattern_rules
            .iter()
            .find(|rule| rule.matches(name))
            .map_or(self.default_chunk_size, |rule| rule.chunk_size)
            .max(1)
    }
}

/// Resolved recovery and health-monitoring settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    /// Re-check candidate ports against the OS during allocation.
    pub os_conflict_check: bool,
    /// Bound on the allocate probe/retry loop.
    pub max_retries: usize,
    /// Wall-clock budget for a single probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Interval between health-monitor sweeps, in seconds.
    pub health_check_interval_secs: u64,
    /// Consecutive failed sweeps before an allocation is cleaned up.
    pub max_consecutive_failures: u32,
    /// Heartbeat age after which an instance counts as dead, in seconds.
    pub instance_stale_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            os_conflict_check: true,
            max_retries: 10,
            probe_timeout_ms: 200,
            health_check_interval_secs: 30,
            max_consecutive_failures: 3,
            instance_stale_secs: 300,
        }
    }
}

/// Serde schema for a service-type entry in `config.json`.
///
/// This is the on-disk shape; the runtime shape is
/// [`crate::catalog::ServiceType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceTypeSpec {
    /// Ordered preferred ports, tried before scanning the range.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_ports: Vec<u16>,

    /// Inclusive `[low, high]` range.
    pub range: [u16; 2],

    /// `single` or `multi`; defaults to `multi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_behavior: Option<String>,

    /// `sequential` or `preferred_first`; defaults to `sequential`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_pattern: Option<String>,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Set on entries created by range synthesis.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_allocated: bool,

    /// When the entry was synthesized (auto-allocated entries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
}

/// Serde schema for the `auto_allocation` section of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoAllocationSpec {
    /// Whether auto-allocation is enabled.
    pub enabled: Option<bool>,
    /// Default chunk size.
    pub default_chunk_size: Option<u16>,
    /// Placement strategy.
    pub placement: Option<PlacementStrategy>,
    /// Lowest synthesizable port.
    pub min_port: Option<u16>,
    /// Highest synthesizable port.
    pub max_port: Option<u16>,
    /// Whether to keep gaps between ranges.
    pub preserve_gaps: Option<bool>,
    /// Gap size.
    pub gap_size: Option<u16>,
    /// Chunk-size overrides keyed by glob pattern.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pattern_rules: BTreeMap<String, u16>,
}

/// Serde schema for the `recovery` section of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoverySpec {
    /// Re-check candidate ports against the OS during allocation.
    pub os_conflict_check: Option<bool>,
    /// Bound on the allocate probe/retry loop.
    pub max_retries: Option<usize>,
    /// Wall-clock budget for a single probe, in milliseconds.
    pub probe_timeout_ms: Option<u64>,
    /// Interval between health sweeps, in seconds.
    pub health_check_interval_secs: Option<u64>,
    /// Consecutive failures before cleanup.
    pub max_consecutive_failures: Option<u32>,
    /// Heartbeat age after which an instance counts as dead, in seconds.
    pub instance_stale_secs: Option<u64>,
}

/// Serde schema for the whole `config.json` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// User-defined or synthesized service types, keyed by name.
    ///
    /// A `BTreeMap` keeps serialization stable across rewrites.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_types: BTreeMap<String, ServiceTypeSpec>,

    /// Auto-allocation overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_allocation: Option<AutoAllocationSpec>,

    /// Recovery and health-monitor overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoverySpec>,

    /// Daemon listen port override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
}

impl ConfigFile {
    /// Load a config file, returning the default when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let parsed: Self = serde_json::from_str(&raw).map_err(|e| Error::Validation {
            field: path.display().to_string(),
            message: format!("malformed config: {e}"),
        })?;
        Ok(parsed)
    }

    /// Serialize and write the config file (non-atomically).
    ///
    /// Durable rewrites of `service_types` go through the catalog writer,
    /// which adds locking, backups, and atomic rename; this is for `config
    /// generate` and tests.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or write failure.
    pub fn store(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)?;
        Ok(())
    }
}

/// Fully resolved daemon settings.
///
/// # Examples
///
/// ```
/// use berth::config::Settings;
/// use std::path::Path;
///
/// let settings = Settings::builder()
///     .data_dir(Path::new("/tmp/berth-example"))
///     .build()
///     .unwrap();
/// assert_eq!(settings.listen_port, 9876);
/// ```
#[derive(Debug, Clone)]
pub struct Settings {
    /// Per-user data directory holding config, state, token, and logs.
    pub data_dir: PathBuf,
    /// Loopback port the HTTP surface listens on.
    pub listen_port: u16,
    /// Resolved auto-allocation settings.
    pub auto_allocation: AutoAllocationConfig,
    /// Resolved recovery settings.
    pub recovery: RecoveryConfig,
    /// The parsed user config file, kept for catalog construction.
    pub config_file: ConfigFile,
}

impl Settings {
    /// Start building settings.
    #[must_use]
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Path of the user config file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    /// Path of the state snapshot.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("daemon.state")
    }

    /// Path of the bearer-token file.
    #[must_use]
    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join("auth.token")
    }

    /// Path of the append-only audit log.
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit.log")
    }

    /// Directory holding timestamped config backups.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("config-backups")
    }

    /// Path of the daemon pidfile.
    #[must_use]
    pub fn pidfile_path(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }
}

/// Builder for [`Settings`].
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    data_dir: Option<PathBuf>,
    listen_port: Option<u16>,
}

impl SettingsBuilder {
    /// Override the data directory (default: `~/.berth`, or `BERTH_DATA_DIR`).
    #[must_use]
    pub fn data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = Some(dir.to_path_buf());
        self
    }

    /// Override the listen port (default: 9876, or `BERTH_DAEMON_PORT`).
    #[must_use]
    pub const fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Resolve settings from defaults, the config file, and the environment.
    ///
    /// Precedence, lowest first: built-in defaults, `config.json`,
    /// environment variables, programmatic overrides on this builder.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined or
    /// created, or if `config.json` exists but is invalid.
    pub fn build(self) -> Result<Settings> {
        let data_dir = match self.data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };
        fs::create_dir_all(&data_dir)?;

        let config_file = ConfigFile::load(&data_dir.join("config.json"))?;

        let auto_allocation = resolve_auto_allocation(config_file.auto_allocation.as_ref())?;
        let recovery = resolve_recovery(config_file.recovery.as_ref());

        let listen_port = self
            .listen_port
            .or_else(|| {
                std::env::var("BERTH_DAEMON_PORT")
                    .ok()
                    .and_then(|raw| raw.parse().ok())
            })
            .or(config_file.listen_port)
            .unwrap_or(DEFAULT_LISTEN_PORT);

        Ok(Settings {
            data_dir,
            listen_port,
            auto_allocation,
            recovery,
            config_file,
        })
    }
}

/// Default data directory: `$BERTH_DATA_DIR`, else `~/.berth`.
///
/// # Errors
///
/// Returns an error if no home directory can be determined.
pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("BERTH_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    home::home_dir()
        .map(|home| home.join(".berth"))
        .ok_or_else(|| Error::Validation {
            field: "data_dir".into(),
            message: "could not determine home directory; set BERTH_DATA_DIR".into(),
        })
}

fn resolve_auto_allocation(spec: Option<&AutoAllocationSpec>) -> Result<AutoAllocationConfig> {
    let defaults = AutoAllocationConfig::default();
    let Some(spec) = spec else {
        return Ok(defaults);
    };

    let min_port = spec.min_port.unwrap_or(defaults.min_port);
    let max_port = spec.max_port.unwrap_or(defaults.max_port);
    if min_port < crate::Port::MIN {
        return Err(Error::Validation {
            field: "auto_allocation.min_port".into(),
            message: format!("must be at least {}", crate::Port::MIN),
        });
    }
    if max_port < min_port {
        return Err(Error::Validation {
            field: "auto_allocation.max_port".into(),
            message: "must be greater than or equal to min_port".into(),
        });
    }

    let pattern_rules = spec
        .pattern_rules
        .iter()
        .map(|(pattern, &chunk_size)| {
            if chunk_size == 0 {
                return Err(Error::Validation {
                    field: format!("auto_allocation.pattern_rules.{pattern}"),
                    message: "chunk size must be at least 1".into(),
                });
            }
            Ok(PatternRule {
                pattern: pattern.clone(),
                chunk_size,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(AutoAllocationConfig {
        enabled: spec.enabled.unwrap_or(defaults.enabled),
        default_chunk_size: spec
            .default_chunk_size
            .unwrap_or(defaults.default_chunk_size)
            .max(1),
        placement: spec.placement.unwrap_or(defaults.placement),
        min_port,
        max_port,
        preserve_gaps: spec.preserve_gaps.unwrap_or(defaults.preserve_gaps),
        gap_size: spec.gap_size.unwrap_or(defaults.gap_size),
        pattern_rules,
    })
}

fn resolve_recovery(spec: Option<&RecoverySpec>) -> RecoveryConfig {
    let defaults = RecoveryConfig::default();
    let Some(spec) = spec else {
        return defaults;
    };
    RecoveryConfig {
        os_conflict_check: spec.os_conflict_check.unwrap_or(defaults.os_conflict_check),
        max_retries: spec.max_retries.unwrap_or(defaults.max_retries).max(1),
        probe_timeout_ms: spec.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms),
        health_check_interval_secs: spec
            .health_check_interval_secs
            .unwrap_or(defaults.health_check_interval_secs)
            .max(1),
        max_consecutive_failures: spec
            .max_consecutive_failures
            .unwrap_or(defaults.max_consecutive_failures)
            .max(1),
        instance_stale_secs: spec
            .instance_stale_secs
            .unwrap_or(defaults.instance_stale_secs),
    }
}
