//! Range synthesis for unknown service types.
//!
//! Given a service-type name the catalog has never seen, compute a fresh
//! `[low, high]` range that does not collide with any known range, honoring
//! the configured placement strategy, chunk size, gap size, and bounds.

use chrono::Utc;

use crate::catalog::{AllocationPattern, Catalog, InstanceBehavior, ServiceType};
use crate::config::{AutoAllocationConfig, PlacementStrategy};
use crate::error::{Error, Result};
use crate::port::{Port, PortRange};

/// Synthesize a range for `name` against the current catalog.
///
/// The returned range lies fully within `[min_port, max_port]` and, when
/// `preserve_gaps` is set, keeps at least `gap_size` free ports between
/// itself and every existing range.
///
/// # Errors
///
/// Returns [`Error::NoSpace`] when no placement satisfies the constraints.
///
/// # Examples
///
/// ```
/// use berth::catalog::Catalog;
/// use berth::config::AutoAllocationConfig;
/// use berth::synth;
///
/// let catalog = Catalog::builtin().unwrap();
/// let config = AutoAllocationConfig::default();
/// let range = synth::synthesize_range(&catalog, "grafana", &config).unwrap();
/// assert_eq!(range.len(), config.default_chunk_size as usize);
/// ```
pub fn synthesize_range(
    catalog: &Catalog,
    name: &str,
    config: &AutoAllocationConfig,
) -> Result<PortRange> {
    let chunk = config.chunk_size_for(name);
    let gap = if config.preserve_gaps {
        config.gap_size
    } else {
        0
    };

    let mut used = catalog.used_ranges();
    used.sort_by_key(|r| r.min().value());

    let low = match config.placement {
        PlacementStrategy::After => place_after(&used, chunk, gap, config),
        PlacementStrategy::Before => place_before(&used, chunk, gap, config),
        PlacementStrategy::Smart => place_smart(&used, chunk, gap, config)
            .or_else(|| place_after(&used, chunk, gap, config)),
    };

    let Some(low) = low else {
        return Err(Error::NoSpace {
            chunk,
            reason: format!(
                "no {:?} placement within {}-{}",
                config.placement, config.min_port, config.max_port
            ),
        });
    };

    let range = PortRange::from_bounds(low, low + chunk - 1)?;
    debug_assert!(used.iter().all(|r| !r.overlaps(&range)));
    Ok(range)
}

/// Build the full service-type entry for a synthesized range.
#[must_use]
pub fn synthesized_type(name: &str, range: PortRange) -> ServiceType {
    ServiceType {
        name: name.to_string(),
        preferred_ports: Vec::new(),
        range,
        instance_behavior: InstanceBehavior::Multi,
        allocation_pattern: AllocationPattern::Sequential,
        description: Some(format!("auto-allocated range for '{name}'")),
        auto_allocated: true,
        allocated_at: Some(Utc::now()),
        overlapping: false,
    }
}

/// Place immediately after the maximum used high, plus gap.
fn place_after(
    used: &[PortRange],
    chunk: u16,
    gap: u16,
    config: &AutoAllocationConfig,
) -> Option<u16> {
    let low = match used.iter().map(|r| r.max().value()).max() {
        Some(high) => high
            .checked_add(gap)?
            .checked_add(1)?
            .max(config.min_port),
        None => config.min_port,
    };
    fits(low, chunk, config.max_port).then_some(low)
}

/// Place immediately before the minimum used low, minus gap.
fn place_before(
    used: &[PortRange],
    chunk: u16,
    gap: u16,
    config: &AutoAllocationConfig,
) -> Option<u16> {
    let high = match used.iter().map(|r| r.min().value()).min() {
        Some(low) => low.checked_sub(gap)?.checked_sub(1)?.min(config.max_port),
        None => config.max_port,
    };
    let low = high.checked_sub(chunk - 1)?;
    (low >= config.min_port && low >= Port::MIN).then_some(low)
}

/// First inter-range gap large enough for chunk plus a gap on both sides.
fn place_smart(
    used: &[PortRange],
    chunk: u16,
    gap: u16,
    config: &AutoAllocationConfig,
) -> Option<u16> {
    let needed = u32::from(chunk) + 2 * u32::from(gap);
    for pair in used.windows(2) {
        let hole = pair[0].gap_to(&pair[1]);
        if u32::from(hole) < needed {
            continue;
        }
        let low = pair[0].max().value() + gap + 1;
        if low >= config.min_port && fits(low, chunk, config.max_port) {
            return Some(low);
        }
    }
    None
}

fn fits(low: u16, chunk: u16, max_port: u16) -> bool {
    low.checked_add(chunk - 1)
        .is_some_and(|high| high <= max_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatternRule, ServiceTypeSpec};

    /// A catalog holding only the given ranges, no builtins.
    fn bare_catalog(ranges: &[[u16; 2]]) -> Catalog {
        let mut catalog = Catalog::default();
        for (i, bounds) in ranges.iter().enumerate() {
            let spec = ServiceTypeSpec {
                preferred_ports: vec![],
                range: *bounds,
                instance_behavior: None,
                allocation_pattern: None,
                description: None,
                auto_allocated: false,
                allocated_at: None,
            };
            let service_type = ServiceType::from_spec(&format!("svc{i}"), &spec).unwrap();
            catalog = catalog.with_type(service_type);
        }
        catalog
    }

    #[test]
    fn test_after_placement_extends_past_max_high() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = AutoAllocationConfig::default();

        let max_high = catalog
            .used_ranges()
            .iter()
            .map(|r| r.max().value())
            .max()
            .unwrap();
        let range = synthesize_range(&catalog, "grafana", &cfg).unwrap();
        assert_eq!(range.min().value(), max_high + cfg.gap_size + 1);
        assert_eq!(range.len(), cfg.default_chunk_size as usize);
    }

    #[test]
    fn test_after_placement_empty_catalog_starts_at_min() {
        let catalog = bare_catalog(&[]);
        let cfg = AutoAllocationConfig::default();
        let range = synthesize_range(&catalog, "grafana", &cfg).unwrap();
        assert_eq!(range.min().value(), cfg.min_port);
    }

    #[test]
    fn test_before_placement() {
        let catalog = bare_catalog(&[[30000, 30099]]);
        let cfg = AutoAllocationConfig {
            placement: PlacementStrategy::Before,
            min_port: 20000,
            max_port: 40000,
            ..AutoAllocationConfig::default()
        };
        let range = synthesize_range(&catalog, "grafana", &cfg).unwrap();
        assert_eq!(range.max().value(), 30000 - cfg.gap_size - 1);
        assert_eq!(range.len(), cfg.default_chunk_size as usize);
    }

    #[test]
    fn test_smart_finds_first_large_gap() {
        let catalog = bare_catalog(&[[20000, 20009], [21000, 21009]]);
        let cfg = AutoAllocationConfig {
            placement: PlacementStrategy::Smart,
            min_port: 16000,
            max_port: 65000,
            ..AutoAllocationConfig::default()
        };
        let range = synthesize_range(&catalog, "grafana", &cfg).unwrap();
        assert_eq!(range.min().value(), 20009 + cfg.gap_size + 1);
        assert!(range.max().value() < 21000 - cfg.gap_size);
    }

    #[test]
    fn test_smart_falls_back_to_after() {
        let catalog = bare_catalog(&[[20000, 20009], [20015, 20024]]);
        let cfg = AutoAllocationConfig {
            placement: PlacementStrategy::Smart,
            min_port: 20000,
            max_port: 65000,
            ..AutoAllocationConfig::default()
        };
        // The hole between the ranges is too small for chunk + 2 * gap, so
        // placement falls back to extending past the maximum high.
        let range = synthesize_range(&catalog, "grafana", &cfg).unwrap();
        assert_eq!(range.min().value(), 20024 + cfg.gap_size + 1);
    }

    #[test]
    fn test_pattern_rule_chunk_applies() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = AutoAllocationConfig {
            pattern_rules: vec![PatternRule {
                pattern: "monitoring-*".into(),
                chunk_size: 20,
            }],
            ..AutoAllocationConfig::default()
        };
        let range = synthesize_range(&catalog, "monitoring-grafana", &cfg).unwrap();
        assert_eq!(range.len(), 20);
    }

    #[test]
    fn test_no_space() {
        let catalog = bare_catalog(&[[64000, 64999]]);
        let cfg = AutoAllocationConfig {
            placement: PlacementStrategy::After,
            min_port: 64000,
            max_port: 65000,
            ..AutoAllocationConfig::default()
        };
        let err = synthesize_range(&catalog, "grafana", &cfg).unwrap_err();
        assert!(matches!(err, Error::NoSpace { .. }));
    }

    #[test]
    fn test_synthesized_range_respects_gap_against_all() {
        let catalog = Catalog::builtin().unwrap();
        let cfg = AutoAllocationConfig::default();
        let range = synthesize_range(&catalog, "grafana", &cfg).unwrap();
        for existing in catalog.used_ranges() {
            assert!(
                existing.gap_to(&range) >= cfg.gap_size,
                "gap violated against {existing}"
            );
        }
    }

    #[test]
    fn test_synthesized_type_shape() {
        let range = PortRange::from_bounds(20000, 20009).unwrap();
        let service_type = synthesized_type("grafana", range);
        assert!(service_type.auto_allocated);
        assert!(service_type.allocated_at.is_some());
        assert_eq!(service_type.range, range);
        assert!(service_type.preferred_ports.is_empty());
    }
}
