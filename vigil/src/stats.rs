//! Lock-free per-call-site statistics.
//!
//! ## Usage
//!
//! The engine records every observed call through [`StatsStore::record`] and
//! hands an immutable [`CallStatsSnapshot`] to the classifier. Eviction of
//! quiet call sites happens only when maintenance calls
//! [`StatsStore::evict_if_needed`].
//!
//! All counters are independent atomics. A snapshot is therefore not
//! linearizable across fields, which is fine for statistical use.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::call_key::CallKey;

/// Number of recent durations kept per call site.
pub const HISTORY_LEN: usize = 64;
/// Samples used by the trend detector.
pub const TREND_WINDOW: usize = 16;

const UNSET_MIN: u64 = u64::MAX;

/// Concurrently updated aggregate for one call site.
pub struct CallStats {
    count: AtomicU64,
    total_nanos: AtomicU64,
    min_nanos: AtomicU64,
    max_nanos: AtomicU64,
    /// `f64` bits.
    ewma: AtomicU64,
    /// Welford running mean, `f64` bits.
    mean: AtomicU64,
    /// Welford sum of squared deviations, `f64` bits.
    m2: AtomicU64,
    spike_count: AtomicU64,
    error_count: AtomicU64,
    last_call_nanos: AtomicU64,
    last_spike_nanos: AtomicU64,
    history: [AtomicU64; HISTORY_LEN],
    history_cursor: AtomicUsize,
    alpha: f64,
}

impl CallStats {
    /// Creates empty statistics with EWMA factor `alpha`.
    pub fn new(alpha: f64) -> Self {
        Self {
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            min_nanos: AtomicU64::new(UNSET_MIN),
            max_nanos: AtomicU64::new(0),
            ewma: AtomicU64::new(0f64.to_bits()),
            mean: AtomicU64::new(0f64.to_bits()),
            m2: AtomicU64::new(0f64.to_bits()),
            spike_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_call_nanos: AtomicU64::new(0),
            last_spike_nanos: AtomicU64::new(0),
            history: std::array::from_fn(|_| AtomicU64::new(0)),
            history_cursor: AtomicUsize::new(0),
            alpha,
        }
    }

    /// Records one completed call of `duration_nanos` observed at `now`.
    pub fn record(&self, duration_nanos: u64, now: u64) {
        let n = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.total_nanos
            .fetch_add(duration_nanos, Ordering::AcqRel);
        self.min_nanos.fetch_min(duration_nanos, Ordering::AcqRel);
        self.max_nanos.fetch_max(duration_nanos, Ordering::AcqRel);

        let x = duration_nanos as f64;
        let alpha = self.alpha;
        update_f64(&self.ewma, |ewma| {
            if n == 1 {
                x
            } else {
                ewma + alpha * (x - ewma)
            }
        });

        // Welford: mean first, then m2 using the mean before and after.
        let (old_mean, new_mean) = update_f64(&self.mean, |mean| mean + (x - mean) / n as f64);
        update_f64(&self.m2, |m2| m2 + (x - old_mean) * (x - new_mean));

        let slot = self.history_cursor.fetch_add(1, Ordering::AcqRel) % HISTORY_LEN;
        self.history[slot].store(duration_nanos, Ordering::Release);
        self.last_call_nanos.fetch_max(now, Ordering::AcqRel);
    }

    /// Counts a spike observed at `now`.
    pub fn record_spike(&self, now: u64) {
        self.spike_count.fetch_add(1, Ordering::AcqRel);
        self.last_spike_nanos.fetch_max(now, Ordering::AcqRel);
    }

    /// Counts a failed call.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of recorded calls.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Timestamp of the most recent call.
    pub fn last_call_nanos(&self) -> u64 {
        self.last_call_nanos.load(Ordering::Acquire)
    }

    /// Least-squares slope over the last [`TREND_WINDOW`] samples exceeds
    /// `slope_ratio` times the EWMA.
    pub fn has_upward_trend(&self, slope_ratio: f64) -> bool {
        let count = self.count();
        if count < TREND_WINDOW as u64 {
            return false;
        }
        let ewma = f64::from_bits(self.ewma.load(Ordering::Acquire));
        if ewma <= 0.0 {
            return false;
        }
        let mut window = [0u64; TREND_WINDOW];
        let filled = self.copy_recent(&mut window);
        least_squares_slope(&window[..filled]) > slope_ratio * ewma
    }

    /// Copies the last `out.len()` recorded durations into `out`, oldest
    /// first. Returns how many slots were filled.
    pub fn copy_recent(&self, out: &mut [u64]) -> usize {
        let available = (self.count() as usize).min(HISTORY_LEN).min(out.len());
        let cursor = self.history_cursor.load(Ordering::Acquire);
        for (i, slot_out) in out.iter_mut().take(available).enumerate() {
            let slot = (cursor + HISTORY_LEN - available + i) % HISTORY_LEN;
            *slot_out = self.history[slot].load(Ordering::Acquire);
        }
        available
    }

    /// The last `len` recorded durations, oldest first.
    pub fn recent(&self, len: usize) -> Vec<u64> {
        let mut out = vec![0; len.min(HISTORY_LEN)];
        let filled = self.copy_recent(&mut out);
        out.truncate(filled);
        out
    }

    /// Copies the current values.
    pub fn snapshot(&self, trend_slope_ratio: f64) -> CallStatsSnapshot {
        let count = self.count();
        let min = self.min_nanos.load(Ordering::Acquire);
        let m2 = f64::from_bits(self.m2.load(Ordering::Acquire));
        CallStatsSnapshot {
            count,
            total_nanos: self.total_nanos.load(Ordering::Acquire),
            min_nanos: if min == UNSET_MIN { 0 } else { min },
            max_nanos: self.max_nanos.load(Ordering::Acquire),
            ewma_nanos: f64::from_bits(self.ewma.load(Ordering::Acquire)),
            variance_nanos2: if count > 1 {
                (m2 / (count - 1) as f64).max(0.0)
            } else {
                0.0
            },
            spike_count: self.spike_count.load(Ordering::Acquire),
            error_count: self.error_count.load(Ordering::Acquire),
            last_call_nanos: self.last_call_nanos(),
            last_spike_nanos: self.last_spike_nanos.load(Ordering::Acquire),
            upward_trend: self.has_upward_trend(trend_slope_ratio),
        }
    }
}

/// Immutable point-in-time copy of [`CallStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CallStatsSnapshot {
    /// Recorded calls.
    pub count: u64,
    /// Sum of durations.
    pub total_nanos: u64,
    /// Shortest duration, zero before the first call.
    pub min_nanos: u64,
    /// Longest duration.
    pub max_nanos: u64,
    /// Exponentially weighted moving average.
    pub ewma_nanos: f64,
    /// Sample variance.
    pub variance_nanos2: f64,
    /// Calls classified as spikes.
    pub spike_count: u64,
    /// Failed calls.
    pub error_count: u64,
    /// Timestamp of the most recent call.
    pub last_call_nanos: u64,
    /// Timestamp of the most recent spike, zero if none.
    pub last_spike_nanos: u64,
    /// Whether latency has been trending upward.
    pub upward_trend: bool,
}

impl CallStatsSnapshot {
    /// `total / count`, zero before the first call.
    pub fn mean_nanos(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_nanos as f64 / self.count as f64
        }
    }

    /// Sample standard deviation.
    pub fn stddev_nanos(&self) -> f64 {
        self.variance_nanos2.sqrt()
    }

    /// Fraction of calls that failed.
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.count as f64
        }
    }
}

/// Concurrent map of call sites to their statistics.
pub struct StatsStore {
    entries: DashMap<CallKey, Arc<CallStats>, FxBuildHasher>,
    alpha: f64,
    max_keys: usize,
    eviction_fraction: f64,
}

impl StatsStore {
    /// Creates an empty store.
    pub fn new(alpha: f64, max_keys: usize, eviction_fraction: f64) -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher),
            alpha,
            max_keys,
            eviction_fraction,
        }
    }

    /// Statistics for `key`, created on first observation.
    pub fn entry(&self, key: &CallKey) -> Arc<CallStats> {
        if let Some(stats) = self.entries.get(key) {
            return stats.clone();
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CallStats::new(self.alpha)))
            .clone()
    }

    /// Records a call and returns the statistics it was added to.
    pub fn record(&self, key: &CallKey, duration_nanos: u64, now: u64) -> Arc<CallStats> {
        let stats = self.entry(key);
        stats.record(duration_nanos, now);
        stats
    }

    /// Statistics for `key`, if it has been observed.
    pub fn get(&self, key: &CallKey) -> Option<Arc<CallStats>> {
        self.entries.get(key).map(|stats| stats.clone())
    }

    /// Snapshots every tracked call site.
    pub fn snapshot_all(&self, trend_slope_ratio: f64) -> Vec<(CallKey, CallStatsSnapshot)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot(trend_slope_ratio)))
            .collect()
    }

    /// Number of tracked call sites.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the store has reached its ceiling.
    pub fn over_capacity(&self) -> bool {
        self.entries.len() >= self.max_keys
    }

    /// Removes the lowest-traffic call sites in one batch once the store has
    /// reached its ceiling. Returns how many were removed.
    pub fn evict_if_needed(&self) -> usize {
        let len = self.entries.len();
        if len < self.max_keys {
            return 0;
        }
        let batch = (len - self.max_keys)
            + ((self.max_keys as f64 * self.eviction_fraction).ceil() as usize).max(1);
        let mut candidates: Vec<(CallKey, u64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().count()))
            .collect();
        let batch = batch.min(candidates.len());
        if batch < candidates.len() {
            candidates.select_nth_unstable_by_key(batch, |(_, count)| *count);
        }
        candidates.truncate(batch);
        for (key, _) in &candidates {
            self.entries.remove(key);
        }
        batch
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Applies `f` to an `f64` stored as bits; returns `(old, new)`.
fn update_f64(cell: &AtomicU64, mut f: impl FnMut(f64) -> f64) -> (f64, f64) {
    let mut current = cell.load(Ordering::Acquire);
    loop {
        let old = f64::from_bits(current);
        let new = f(old);
        match cell.compare_exchange_weak(current, new.to_bits(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return (old, new),
            Err(actual) => current = actual,
        }
    }
}

/// Slope of the least-squares line through `(i, samples[i])`.
pub(crate) fn least_squares_slope(samples: &[u64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = samples.iter().map(|&y| y as f64).sum::<f64>() / n_f;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, &y) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y as f64 - mean_y);
        den += dx * dx;
    }
    if den == 0.0 { 0.0 } else { num / den }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::call_key::{Backend, CallCategory};

    const KEY: CallKey = CallKey::new(Backend::Vulkan, CallCategory::Draw, "vkCmdDraw");

    #[test]
    fn mean_min_max_are_exact() {
        let stats = CallStats::new(0.1);
        let samples = [7_u64, 3, 19, 3, 250, 41, 1_000, 8];
        for (i, &sample) in samples.iter().enumerate() {
            stats.record(sample, i as u64);
        }
        let snapshot = stats.snapshot(0.1);
        let total: u64 = samples.iter().sum();
        assert_eq!(snapshot.count, samples.len() as u64);
        assert_eq!(snapshot.total_nanos, total);
        assert_eq!(snapshot.mean_nanos(), total as f64 / samples.len() as f64);
        assert_eq!(snapshot.min_nanos, 3);
        assert_eq!(snapshot.max_nanos, 1_000);
        assert_eq!(snapshot.last_call_nanos, 7);
    }

    #[test]
    fn welford_variance_matches_two_pass() {
        let stats = CallStats::new(0.1);
        let samples = [2_u64, 4, 4, 4, 5, 5, 7, 9];
        for &sample in &samples {
            stats.record(sample, 0);
        }
        let mean = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
        let expected = samples
            .iter()
            .map(|&x| (x as f64 - mean).powi(2))
            .sum::<f64>()
            / (samples.len() - 1) as f64;
        let snapshot = stats.snapshot(0.1);
        assert!((snapshot.variance_nanos2 - expected).abs() < 1e-9);
    }

    #[test]
    fn ewma_starts_at_first_sample_and_converges() {
        let stats = CallStats::new(0.5);
        stats.record(100, 0);
        assert_eq!(stats.snapshot(0.1).ewma_nanos, 100.0);
        stats.record(200, 0);
        assert_eq!(stats.snapshot(0.1).ewma_nanos, 150.0);
        for _ in 0..64 {
            stats.record(200, 0);
        }
        assert!((stats.snapshot(0.1).ewma_nanos - 200.0).abs() < 1e-6);
    }

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snapshot = CallStats::new(0.1).snapshot(0.1);
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.min_nanos, 0);
        assert_eq!(snapshot.mean_nanos(), 0.0);
        assert!(!snapshot.upward_trend);
    }

    #[test]
    fn history_wraps_and_keeps_latest() {
        let stats = CallStats::new(0.1);
        for i in 0..(HISTORY_LEN as u64 + 10) {
            stats.record(i, 0);
        }
        let recent = stats.recent(4);
        let last = HISTORY_LEN as u64 + 9;
        assert_eq!(recent, vec![last - 3, last - 2, last - 1, last]);
    }

    #[test]
    fn copy_recent_fills_a_fixed_window() {
        let stats = CallStats::new(0.1);
        let mut window = [0u64; TREND_WINDOW];
        assert_eq!(stats.copy_recent(&mut window), 0);

        for i in 1..=3 {
            stats.record(i * 10, 0);
        }
        assert_eq!(stats.copy_recent(&mut window), 3);
        assert_eq!(window[..3], [10, 20, 30]);

        for i in 4..=40 {
            stats.record(i * 10, 0);
        }
        assert_eq!(stats.copy_recent(&mut window), TREND_WINDOW);
        assert_eq!(window[0], 250);
        assert_eq!(window[TREND_WINDOW - 1], 400);
    }

    #[test]
    fn detects_upward_trend_only_when_steep() {
        let flat = CallStats::new(0.1);
        for _ in 0..32 {
            flat.record(1_000, 0);
        }
        assert!(!flat.has_upward_trend(0.1));

        // Flat, then a ramp of 2us per call.
        let rising = CallStats::new(0.1);
        for _ in 0..16 {
            rising.record(1_000, 0);
        }
        for step in 1..=16_u64 {
            rising.record(1_000 + step * 2_000, 0);
        }
        assert!(rising.has_upward_trend(0.1));
    }

    #[test]
    fn slope_of_line() {
        assert!((least_squares_slope(&[0, 2, 4, 6]) - 2.0).abs() < 1e-12);
        assert_eq!(least_squares_slope(&[5]), 0.0);
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let stats = Arc::new(CallStats::new(0.1));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for i in 0..1_000_u64 {
                        stats.record(t * 1_000 + i + 1, 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("recorder thread panicked");
        }
        let snapshot = stats.snapshot(0.1);
        assert_eq!(snapshot.count, 4_000);
        assert_eq!(snapshot.min_nanos, 1);
        assert_eq!(snapshot.max_nanos, 4_000);
        assert_eq!(snapshot.total_nanos, (1..=4_000_u64).sum::<u64>());
    }

    #[test]
    fn store_creates_lazily_and_evicts_quietest_in_batch() {
        let store = StatsStore::new(0.1, 10, 0.2);
        assert!(store.get(&KEY).is_none());
        store.record(&KEY, 5, 1);
        assert_eq!(store.get(&KEY).map(|s| s.count()), Some(1));

        for i in 0..12_u64 {
            let key = CallKey::dynamic(Backend::OpenGl, CallCategory::Other, format!("call{i}"));
            for _ in 0..(i + 2) {
                store.record(&key, 1, 0);
            }
        }
        assert_eq!(store.len(), 13);
        assert!(store.over_capacity());

        // 3 over the ceiling plus 20% of 10.
        let evicted = store.evict_if_needed();
        assert_eq!(evicted, 5);
        assert_eq!(store.len(), 8);
        // KEY had the fewest calls.
        assert!(store.get(&KEY).is_none());
        let busiest = CallKey::dynamic(Backend::OpenGl, CallCategory::Other, "call11");
        assert!(store.get(&busiest).is_some());
        assert_eq!(store.evict_if_needed(), 0);
    }
}
