//! Service-type catalog.
//!
//! The catalog is the immutable view of known service types the engine works
//! against: built-in defaults overlaid with the user's `config.json`, plus
//! entries synthesized at runtime. User entries replace same-named built-ins;
//! invalid entries fail validation at startup, not at request time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigFile, ServiceTypeSpec};
use crate::error::{Error, Result};
use crate::port::{Port, PortRange};

mod defaults;

pub use defaults::builtin_specs;

/// How many concurrent allocations a service type permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceBehavior {
    /// At most one active allocation at a time.
    Single,
    /// Any number of concurrent allocations.
    #[default]
    Multi,
}

/// Order in which candidate ports are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPattern {
    /// Scan the range from low to high.
    #[default]
    Sequential,
    /// Try the preferred list exhaustively before scanning the range.
    PreferredFirst,
}

/// A fully validated service type.
///
/// # Examples
///
/// ```
/// use berth::catalog::Catalog;
///
/// let catalog = Catalog::builtin().unwrap();
/// let dev = catalog.lookup("dev").unwrap();
/// assert!(dev.range.contains(dev.preferred_ports[0]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceType {
    /// Unique name, the catalog key.
    pub name: String,
    /// Ordered preferred ports; always a subset of `range`.
    pub preferred_ports: Vec<Port>,
    /// Inclusive allocation range.
    pub range: PortRange,
    /// Single- or multi-instance behavior.
    pub instance_behavior: InstanceBehavior,
    /// Candidate ordering.
    pub allocation_pattern: AllocationPattern,
    /// Human-readable description.
    pub description: Option<String>,
    /// Set on entries created by range synthesis.
    pub auto_allocated: bool,
    /// When the entry was synthesized.
    pub allocated_at: Option<DateTime<Utc>>,
    /// Set during validation when this type's range overlaps another's.
    pub overlapping: bool,
}

impl ServiceType {
    /// Build a runtime service type from its on-disk spec.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad ranges, preferred ports outside the
    /// range, or unrecognized behavior/pattern strings.
    pub fn from_spec(name: &str, spec: &ServiceTypeSpec) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::Validation {
                field: "service_type".into(),
                message: "name must be non-empty".into(),
            });
        }

        let range = PortRange::from_bounds(spec.range[0], spec.range[1]).map_err(|e| {
            Error::Validation {
                field: format!("service_types.{name}.range"),
                message: e.to_string(),
            }
        })?;

        let mut preferred_ports = Vec::with_capacity(spec.preferred_ports.len());
        for &raw in &spec.preferred_ports {
            let port = Port::try_from(raw).map_err(|e| Error::Validation {
                field: format!("service_types.{name}.preferred_ports"),
                message: e.to_string(),
            })?;
            if !range.contains(port) {
                return Err(Error::Validation {
                    field: format!("service_types.{name}.preferred_ports"),
                    message: format!("preferred port {port} is outside range {range}"),
                });
            }
            preferred_ports.push(port);
        }

        let instance_behavior = match spec.instance_behavior.as_deref() {
            None | Some("multi") => InstanceBehavior::Multi,
            Some("single") => InstanceBehavior::Single,
            Some(other) => {
                return Err(Error::Validation {
                    field: format!("service_types.{name}.instance_behavior"),
                    message: format!("expected 'single' or 'multi', got '{other}'"),
                })
            }
        };

        let allocation_pattern = match spec.allocation_pattern.as_deref() {
            None | Some("sequential") => AllocationPattern::Sequential,
            Some("preferred_first") => AllocationPattern::PreferredFirst,
            Some(other) => {
                return Err(Error::Validation {
                    field: format!("service_types.{name}.allocation_pattern"),
                    message: format!("expected 'sequential' or 'preferred_first', got '{other}'"),
                })
            }
        };

        Ok(Self {
            name: name.to_string(),
            preferred_ports,
            range,
            instance_behavior,
            allocation_pattern,
            description: spec.description.clone(),
            auto_allocated: spec.auto_allocated,
            allocated_at: spec.allocated_at,
            overlapping: false,
        })
    }

    /// The on-disk spec for this service type.
    #[must_use]
    pub fn to_spec(&self) -> ServiceTypeSpec {
        ServiceTypeSpec {
            preferred_ports: self.preferred_ports.iter().map(|p| p.value()).collect(),
            range: [self.range.min().value(), self.range.max().value()],
            instance_behavior: match self.instance_behavior {
                InstanceBehavior::Multi => None,
                InstanceBehavior::Single => Some("single".into()),
            },
            allocation_pattern: match self.allocation_pattern {
                AllocationPattern::Sequential => None,
                AllocationPattern::PreferredFirst => Some("preferred_first".into()),
            },
            description: self.description.clone(),
            auto_allocated: self.auto_allocated,
            allocated_at: self.allocated_at,
        }
    }
}

/// Immutable catalog of service types.
///
/// Declaration order is preserved: when ranges overlap, the first-declared
/// type wins deterministic resolution and the later one carries the
/// `overlapping` flag.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    types: Vec<ServiceType>,
    index: HashMap<String, usize>,
    warnings: Vec<String>,
}

impl Catalog {
    /// The built-in default catalog with no user overrides.
    ///
    /// # Errors
    ///
    /// Only fails if the built-in table itself is invalid, which is covered
    /// by tests.
    pub fn builtin() -> Result<Self> {
        Self::from_config(&ConfigFile::default())
    }

    /// Build the catalog from built-in defaults overlaid with a config file.
    ///
    /// User entries replace built-in entries with the same name (keeping the
    /// built-in's declaration position); new user entries are appended in
    /// name order.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found in any entry.
    pub fn from_config(config: &ConfigFile) -> Result<Self> {
        let mut types = Vec::new();
        let mut index = HashMap::new();

        for (name, spec) in builtin_specs() {
            let service_type = match config.service_types.get(name) {
                Some(user_spec) => ServiceType::from_spec(name, user_spec)?,
                None => ServiceType::from_spec(name, &spec)?,
            };
            index.insert(name.to_string(), types.len());
            types.push(service_type);
        }

        // BTreeMap iteration gives deterministic (name-sorted) append order.
        for (name, spec) in &config.service_types {
            if index.contains_key(name.as_str()) {
                continue;
            }
            let service_type = ServiceType::from_spec(name, spec)?;
            index.insert(name.clone(), types.len());
            types.push(service_type);
        }

        let mut catalog = Self {
            types,
            index,
            warnings: Vec::new(),
        };
        catalog.flag_overlaps();
        Ok(catalog)
    }

    /// Mark overlapping ranges and collect warnings.
    ///
    /// Overlap is warn-and-continue: allocation stays deterministic because
    /// lookups by port resolve to the first-declared type.
    fn flag_overlaps(&mut self) {
        let mut flagged = vec![false; self.types.len()];
        for i in 0..self.types.len() {
            for j in (i + 1)..self.types.len() {
                if self.types[i].range.overlaps(&self.types[j].range) {
                    flagged[j] = true;
                    self.warnings.push(format!(
                        "service type '{}' range {} overlaps '{}' range {}",
                        self.types[j].name,
                        self.types[j].range,
                        self.types[i].name,
                        self.types[i].range,
                    ));
                }
            }
        }
        for (service_type, is_flagged) in self.types.iter_mut().zip(flagged) {
            service_type.overlapping = is_flagged;
        }
    }

    /// Look up a service type by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ServiceType> {
        self.index.get(name).map(|&i| &self.types[i])
    }

    /// The first-declared service type whose range contains `port`.
    #[must_use]
    pub fn type_for_port(&self, port: Port) -> Option<&ServiceType> {
        self.types.iter().find(|t| t.range.contains(port))
    }

    /// Iterate service types in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceType> {
        self.types.iter()
    }

    /// Number of service types in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// All ranges currently claimed by catalog entries.
    #[must_use]
    pub fn used_ranges(&self) -> Vec<PortRange> {
        self.types.iter().map(|t| t.range).collect()
    }

    /// Validation warnings collected at load (range overlaps).
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// A new catalog without the named service type.
    ///
    /// Used by the engine when an auto-allocated entry is undone.
    #[must_use]
    pub fn without_type(&self, name: &str) -> Self {
        let mut next = Self::default();
        for service_type in self.types.iter().filter(|t| t.name != name) {
            next.index
                .insert(service_type.name.clone(), next.types.len());
            next.types.push(service_type.clone());
        }
        next.flag_overlaps();
        next
    }

    /// A new catalog with `service_type` appended.
    ///
    /// Used by the engine after range synthesis: the request-visible catalog
    /// is swapped wholesale rather than mutated in place.
    #[must_use]
    pub fn with_type(&self, service_type: ServiceType) -> Self {
        let mut next = self.clone();
        if let Some(&i) = next.index.get(service_type.name.as_str()) {
            next.types[i] = service_type;
        } else {
            next.index
                .insert(service_type.name.clone(), next.types.len());
            next.types.push(service_type);
        }
        next.warnings.clear();
        next.flag_overlaps();
        next
    }
}
