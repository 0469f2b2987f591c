//! Property-based tests for `Port` and `PortRange`.

use super::{Port, PortRange};
use proptest::prelude::*;

const MIN_VALID: u16 = Port::MIN;
const MAX_VALID: u16 = Port::MAX;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 2000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn port_accepts_exactly_the_user_window(value in 0u16..=MAX_VALID) {
        let result = Port::try_from(value);
        prop_assert_eq!(result.is_ok(), value >= MIN_VALID);
    }

    #[test]
    fn port_serialization_roundtrip(value in MIN_VALID..=MAX_VALID) {
        let port = Port::try_from(value).unwrap();
        let json = serde_json::to_string(&port).unwrap();
        let back: Port = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(port, back);
    }

    #[test]
    fn range_len_matches_iteration(min in MIN_VALID..=MAX_VALID, span in 0u16..200) {
        let max = min.saturating_add(span).min(MAX_VALID);
        let range = PortRange::from_bounds(min, max).unwrap();
        prop_assert_eq!(range.len(), range.iter().count());
    }

    #[test]
    fn range_contains_iff_within_bounds(
        min in MIN_VALID..=MAX_VALID - 100,
        span in 0u16..100,
        candidate in MIN_VALID..=MAX_VALID,
    ) {
        let range = PortRange::from_bounds(min, min + span).unwrap();
        let port = Port::try_from(candidate).unwrap();
        let expected = candidate >= min && candidate <= min + span;
        prop_assert_eq!(range.contains(port), expected);
    }

    #[test]
    fn overlap_is_symmetric(
        a_min in MIN_VALID..=MAX_VALID - 50,
        a_span in 0u16..50,
        b_min in MIN_VALID..=MAX_VALID - 50,
        b_span in 0u16..50,
    ) {
        let a = PortRange::from_bounds(a_min, a_min + a_span).unwrap();
        let b = PortRange::from_bounds(b_min, b_min + b_span).unwrap();
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
    }

    #[test]
    fn disjoint_ranges_have_consistent_gap(
        a_min in MIN_VALID..=30000u16,
        a_span in 0u16..50,
        gap in 1u16..100,
        b_span in 0u16..50,
    ) {
        let a = PortRange::from_bounds(a_min, a_min + a_span).unwrap();
        let b_min = a_min + a_span + gap + 1;
        let b = PortRange::from_bounds(b_min, b_min + b_span).unwrap();
        prop_assert!(!a.overlaps(&b));
        prop_assert_eq!(a.gap_to(&b), gap);
    }
}
