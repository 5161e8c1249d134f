//! Correction of counter values for time multiplexing.
//!
//! When more events are requested than the PMU has counters, the kernel
//! rotates them and reports how long each was enabled and how long it was
//! actually counting. The raw value is extrapolated over the enabled time.

/// Extrapolate `value` over the enabled time; 0 if the event never ran
pub fn correct(value: u64, enabled: u64, running: u64) -> u64 {
    if running == 0 {
        return 0;
    }
    let scaled = u128::from(value) * u128::from(enabled) / u128::from(running);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Whether the event was multiplexed during the sampled interval
pub fn is_scaled(enabled: u64, running: u64) -> bool {
    enabled != running
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(200, 100, 50, 400)]
    #[case(10, 100, 50, 20)]
    #[case(7, 3, 2, 10)]
    #[case(0, 100, 50, 0)]
    #[case(1_000, 1, 1_000, 1)]
    fn test_correct(
        #[case] value: u64,
        #[case] enabled: u64,
        #[case] running: u64,
        #[case] expected: u64,
    ) {
        assert_eq!(correct(value, enabled, running), expected);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(u64::MAX)]
    fn test_never_running_is_zero(#[case] value: u64) {
        assert_eq!(correct(value, 100, 0), 0);
        assert_eq!(correct(value, 0, 0), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(1_000)]
    #[case(u64::MAX)]
    fn test_fully_running_is_identity(#[case] time: u64) {
        assert_eq!(correct(12_345, time, time), 12_345);
        assert_eq!(correct(u64::MAX, time, time), u64::MAX);
        assert!(!is_scaled(time, time));
    }

    #[test]
    fn test_large_product_does_not_overflow() {
        // value * enabled exceeds u64 but the quotient fits
        let value = 1u64 << 40;
        let enabled = 1u64 << 40;
        let running = 1u64 << 39;
        assert_eq!(correct(value, enabled, running), 1u64 << 41);
    }

    #[test]
    fn test_saturates() {
        assert_eq!(correct(u64::MAX, 4, 1), u64::MAX);
    }

    #[test]
    fn test_is_scaled() {
        assert!(is_scaled(100, 50));
        assert!(is_scaled(100, 0));
    }
}
