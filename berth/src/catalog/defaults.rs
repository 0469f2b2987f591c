//! Built-in default service types.
//!
//! These cover the common shapes of a development workstation. The user's
//! `config.json` may replace any of them by name.

use crate::config::ServiceTypeSpec;

fn spec(
    range: [u16; 2],
    preferred: &[u16],
    single: bool,
    preferred_first: bool,
    description: &str,
) -> ServiceTypeSpec {
    ServiceTypeSpec {
        preferred_ports: preferred.to_vec(),
        range,
        instance_behavior: single.then(|| "single".to_string()),
        allocation_pattern: preferred_first.then(|| "preferred_first".to_string()),
        description: Some(description.to_string()),
        auto_allocated: false,
        allocated_at: None,
    }
}

/// The built-in service-type table, in declaration order.
///
/// Declaration order matters: overlap resolution prefers earlier entries.
#[must_use]
pub fn builtin_specs() -> Vec<(&'static str, ServiceTypeSpec)> {
    vec![
        (
            "dev",
            spec(
                [3000, 3099],
                &[3000, 3001, 3002],
                false,
                false,
                "frontend dev servers",
            ),
        ),
        (
            "docs",
            spec([4000, 4099], &[4000], false, false, "documentation servers"),
        ),
        (
            "database",
            spec(
                [5430, 5459],
                &[5432],
                false,
                true,
                "local database instances",
            ),
        ),
        (
            "api",
            spec(
                [8000, 8099],
                &[8000, 8080],
                false,
                false,
                "backend API servers",
            ),
        ),
        (
            "proxy",
            spec([8100, 8199], &[8100], false, false, "local reverse proxies"),
        ),
        (
            "monitoring",
            spec(
                [9090, 9129],
                &[9090],
                false,
                true,
                "metrics and monitoring endpoints",
            ),
        ),
        (
            "ai",
            spec(
                [11430, 11499],
                &[11430, 11431, 11432],
                true,
                true,
                "local model servers (one per user)",
            ),
        ),
        (
            "test",
            spec(
                [15000, 15199],
                &[],
                false,
                false,
                "throwaway test listeners",
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ranges_are_disjoint() {
        let specs = builtin_specs();
        for (i, (name_a, a)) in specs.iter().enumerate() {
            for (name_b, b) in specs.iter().skip(i + 1) {
                let disjoint = a.range[1] < b.range[0] || b.range[1] < a.range[0];
                assert!(disjoint, "{name_a} overlaps {name_b}");
            }
        }
    }

    #[test]
    fn test_builtin_preferred_within_range() {
        for (name, spec) in builtin_specs() {
            for &port in &spec.preferred_ports {
                assert!(
                    port >= spec.range[0] && port <= spec.range[1],
                    "{name} preferred {port} outside range"
                );
            }
        }
    }
}
