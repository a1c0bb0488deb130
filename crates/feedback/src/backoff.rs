//! Delay applied before pushing to a subscriber that just NACKed.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_TABLE_MS: [u64; 8] = [250, 500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000];
pub const DEFAULT_FIRST_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    table_ms: Vec<u64>,
    first_pause: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self::new(DEFAULT_TABLE_MS.to_vec(), DEFAULT_FIRST_PAUSE) }
}

impl Backoff {
    /// Entries are sorted so the expected delay never decreases with the failure count.
    pub fn new(mut table_ms: Vec<u64>, first_pause: Duration) -> Self {
        table_ms.sort_unstable();
        Self { table_ms, first_pause }
    }

    pub fn table_ms(&self) -> &[u64] { &self.table_ms }

    /// Un-jittered delay for `failures`; saturates at the last table entry.
    pub fn expected(&self, failures: u64) -> Duration {
        if failures == 0 || self.table_ms.is_empty() {
            return self.first_pause;
        }
        let idx = (failures as usize).min(self.table_ms.len() - 1);
        Duration::from_millis(self.table_ms[idx]).max(self.first_pause)
    }

    /// Jittered delay, uniform in `[0.5x, 1.5x]` of [`Backoff::expected`].
    pub fn delay(&self, failures: u64) -> Duration {
        self.delay_with(failures, &mut rand::rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, failures: u64, rng: &mut R) -> Duration {
        let base = self.expected(failures);
        if failures == 0 {
            return base;
        }
        base.mul_f64(rng.random_range(0.5..=1.5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_is_monotonic_and_saturates() {
        let b = Backoff::default();
        let mut prev = Duration::ZERO;
        for n in 0..32u64 {
            let d = b.expected(n);
            assert!(d >= prev, "backoff decreased at {}", n);
            prev = d;
        }
        assert_eq!(b.expected(7), Duration::from_millis(30_000));
        assert_eq!(b.expected(1_000), Duration::from_millis(30_000));
    }

    #[test]
    fn first_failure_gets_a_fixed_short_pause() {
        let b = Backoff::default();
        for _ in 0..10 { assert_eq!(b.delay(0), DEFAULT_FIRST_PAUSE); }
        assert!(b.expected(0) > Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_half_and_one_and_a_half() {
        let b = Backoff::default();
        let base = b.expected(3);
        for _ in 0..200 {
            let d = b.delay(3);
            assert!(d >= base.mul_f64(0.5) && d <= base.mul_f64(1.5), "{:?} outside jitter window", d);
        }
    }

    #[test]
    fn unsorted_or_empty_tables() {
        let b = Backoff::new(vec![400, 100, 200], Duration::from_millis(10));
        assert_eq!(b.table_ms(), &[100, 200, 400]);
        assert_eq!(b.expected(9), Duration::from_millis(400));
        let empty = Backoff::new(Vec::new(), Duration::from_millis(10));
        assert_eq!(empty.expected(5), Duration::from_millis(10));
    }
}
