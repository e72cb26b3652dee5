//! Draw-call pattern tracking and the batching trigger.
//!
//! ## Usage
//!
//! Every draw is described by a [`DrawDescriptor`]. Draws sharing primitive,
//! shader, vertex source and bindings hash to the same [`PatternHash`]. A
//! pattern seen [`DrawConfig::min_occurrences`] times without a gap longer than
//! the recency window becomes a batching candidate: [`DrawTracker::observe`]
//! returns a [`CacheRequest`] exactly once, and the engine asks the registered
//! [`DrawBatcher`](crate::DrawBatcher) to prepare an indirect path. Once that
//! succeeds, matching draws go through the batched path until it fails or the
//! pattern goes idle.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHasher};

use crate::{
    clock::{self, elapsed_since},
    config::DrawConfig,
};

const NEVER: u64 = u64::MAX;

/// Primitive topology of a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PrimitiveType {
    /// Point list.
    Points,
    /// Line list.
    Lines,
    /// Line strip.
    LineStrip,
    /// Triangle list.
    Triangles,
    /// Triangle strip.
    TriangleStrip,
    /// Triangle fan.
    TriangleFan,
    /// Tessellation patches.
    Patches,
}

/// The attributes that make two draws structurally identical.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DrawDescriptor {
    /// Topology.
    pub primitive: PrimitiveType,
    /// Bound shader or pipeline.
    pub shader_id: u64,
    /// Bound vertex buffer or vertex array.
    pub vertex_source_id: u64,
    /// Hash of the bound texture set.
    pub texture_set_hash: u64,
    /// Hash of the bound uniform set.
    pub uniform_set_hash: u64,
}

impl DrawDescriptor {
    /// Pattern this draw belongs to.
    pub fn pattern_hash(&self) -> PatternHash {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        PatternHash(hasher.finish())
    }
}

/// Identity of a draw pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PatternHash(pub u64);

impl fmt::Display for PatternHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-call counts of a draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawCall {
    /// Vertices (or indices) per instance.
    pub vertex_count: u32,
    /// Instances.
    pub instance_count: u32,
}

/// How a draw was executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawPath {
    /// Through the host's own per-call path.
    Direct,
    /// Through the batcher's indirect path.
    Batched,
}

/// One executed draw.
#[derive(Clone, Copy, Debug)]
pub struct DrawCallRecord {
    /// Completion time.
    pub timestamp_nanos: u64,
    /// Pattern of the draw.
    pub pattern: PatternHash,
    /// Vertices per instance.
    pub vertex_count: u32,
    /// Instances.
    pub instance_count: u32,
    /// Execution time.
    pub duration_nanos: u64,
    /// Whether the batched path was used.
    pub batched: bool,
}

/// Request to prepare a batched path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheRequest {
    /// Pattern to batch.
    pub pattern: PatternHash,
    /// Representative descriptor.
    pub descriptor: DrawDescriptor,
    /// Draws per batch.
    pub batch_size: u32,
}

struct PatternTracker {
    descriptor: DrawDescriptor,
    occurrences: AtomicU64,
    streak: AtomicU64,
    total_vertices: AtomicU64,
    total_instances: AtomicU64,
    total_nanos: AtomicU64,
    first_seen: u64,
    last_seen: AtomicU64,
    marked: AtomicBool,
    cached: AtomicBool,
    last_request: AtomicU64,
}

impl PatternTracker {
    fn new(descriptor: DrawDescriptor, now: u64) -> Self {
        Self {
            descriptor,
            occurrences: AtomicU64::new(0),
            streak: AtomicU64::new(0),
            total_vertices: AtomicU64::new(0),
            total_instances: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            first_seen: now,
            last_seen: AtomicU64::new(now),
            marked: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            last_request: AtomicU64::new(NEVER),
        }
    }

    fn summary(&self, pattern: PatternHash) -> PatternSummary {
        PatternSummary {
            pattern,
            descriptor: self.descriptor,
            occurrences: self.occurrences.load(Ordering::Relaxed),
            total_vertices: self.total_vertices.load(Ordering::Relaxed),
            total_instances: self.total_instances.load(Ordering::Relaxed),
            total_nanos: self.total_nanos.load(Ordering::Relaxed),
            first_seen_nanos: self.first_seen,
            last_seen_nanos: self.last_seen.load(Ordering::Relaxed),
            marked_for_batching: self.marked.load(Ordering::Relaxed),
            batching_cached: self.cached.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one pattern.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PatternSummary {
    /// Pattern identity.
    pub pattern: PatternHash,
    /// Descriptor of the first occurrence.
    pub descriptor: DrawDescriptor,
    /// Draws observed.
    pub occurrences: u64,
    /// Vertices drawn, summed over instances.
    pub total_vertices: u64,
    /// Instances drawn.
    pub total_instances: u64,
    /// Execution time.
    pub total_nanos: u64,
    /// First occurrence.
    pub first_seen_nanos: u64,
    /// Latest occurrence.
    pub last_seen_nanos: u64,
    /// A batched path was requested.
    pub marked_for_batching: bool,
    /// A batched path is ready.
    pub batching_cached: bool,
}

impl PatternSummary {
    /// Mean execution time per draw.
    pub fn mean_nanos(&self) -> f64 {
        if self.occurrences == 0 {
            0.0
        } else {
            self.total_nanos as f64 / self.occurrences as f64
        }
    }
}

/// Draw-call load of one frame relative to the configured thresholds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DrawPressure {
    /// Below every threshold.
    #[default]
    Normal,
    /// At or above the warning threshold.
    Warning,
    /// At or above the critical threshold.
    Critical,
    /// At or above the emergency threshold.
    Emergency,
}

/// Draw statistics of one finished frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DrawFrameSummary {
    /// Draws issued.
    pub draw_calls: u64,
    /// Draws that went through a batched path.
    pub batched_draws: u64,
    /// Time spent in draws.
    pub draw_nanos: u64,
    /// `draw_nanos` over the frame time.
    pub time_share: f64,
    /// Distinct patterns among the buffered records of the frame.
    pub distinct_patterns: usize,
    /// Buffered draws whose pattern occurred more than once in the frame.
    pub batchable_draws: usize,
    /// Load classification.
    pub pressure: DrawPressure,
    /// An optimization request was issued.
    pub optimization_requested: bool,
    /// Emergency batching was requested.
    pub emergency_batch: bool,
}

/// Pattern trackers plus per-frame draw counters.
pub struct DrawTracker {
    patterns: DashMap<PatternHash, PatternTracker, FxBuildHasher>,
    records: ArrayQueue<DrawCallRecord>,
    frame_draws: AtomicU64,
    frame_batched: AtomicU64,
    frame_draw_nanos: AtomicU64,
    last_optimization: AtomicU64,
    config: DrawConfig,
}

impl DrawTracker {
    /// Creates an empty tracker.
    pub fn new(config: DrawConfig) -> Self {
        Self {
            patterns: DashMap::with_hasher(FxBuildHasher),
            records: ArrayQueue::new(config.record_buffer.max(1)),
            frame_draws: AtomicU64::new(0),
            frame_batched: AtomicU64::new(0),
            frame_draw_nanos: AtomicU64::new(0),
            last_optimization: AtomicU64::new(NEVER),
            config,
        }
    }

    /// Whether draws of `pattern` should use the batched path.
    pub fn is_cached(&self, pattern: PatternHash) -> bool {
        self.patterns
            .get(&pattern)
            .is_some_and(|tracker| tracker.cached.load(Ordering::Acquire))
    }

    /// Records one executed draw. Returns a cache request the first time the
    /// pattern qualifies for batching.
    pub fn observe(
        &self,
        descriptor: &DrawDescriptor,
        call: DrawCall,
        duration_nanos: u64,
        batched: bool,
        now: u64,
    ) -> Option<CacheRequest> {
        let pattern = descriptor.pattern_hash();
        self.frame_draws.fetch_add(1, Ordering::Relaxed);
        self.frame_draw_nanos
            .fetch_add(duration_nanos, Ordering::Relaxed);
        if batched {
            self.frame_batched.fetch_add(1, Ordering::Relaxed);
        }
        self.records.force_push(DrawCallRecord {
            timestamp_nanos: now,
            pattern,
            vertex_count: call.vertex_count,
            instance_count: call.instance_count,
            duration_nanos,
            batched,
        });

        let tracker = self
            .patterns
            .entry(pattern)
            .or_insert_with(|| PatternTracker::new(*descriptor, now))
            .downgrade();
        let instances = u64::from(call.instance_count.max(1));
        let occurrences = tracker.occurrences.fetch_add(1, Ordering::Relaxed) + 1;
        tracker
            .total_vertices
            .fetch_add(u64::from(call.vertex_count) * instances, Ordering::Relaxed);
        tracker
            .total_instances
            .fetch_add(instances, Ordering::Relaxed);
        tracker
            .total_nanos
            .fetch_add(duration_nanos, Ordering::Relaxed);

        let window = clock::duration_nanos(self.config.recency_window);
        let previous = tracker.last_seen.swap(now, Ordering::Relaxed);
        let streak = if occurrences > 1 && elapsed_since(now, previous) > window {
            tracker.streak.store(1, Ordering::Relaxed);
            1
        } else {
            tracker.streak.fetch_add(1, Ordering::Relaxed) + 1
        };

        if streak < self.config.min_occurrences || tracker.marked.load(Ordering::Relaxed) {
            return None;
        }
        let last_request = tracker.last_request.load(Ordering::Relaxed);
        if last_request != NEVER && elapsed_since(now, last_request) < window {
            return None;
        }
        if tracker
            .marked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        tracker.last_request.store(now, Ordering::Relaxed);
        let batch_size = u32::try_from(streak)
            .unwrap_or(u32::MAX)
            .clamp(self.config.min_batch_size, self.config.optimal_batch_size);
        Some(CacheRequest {
            pattern,
            descriptor: tracker.descriptor,
            batch_size,
        })
    }

    /// Records the result of a cache request. A failed request makes the
    /// pattern eligible again after the recency window.
    pub fn set_cached(&self, pattern: PatternHash, cached: bool) {
        if let Some(tracker) = self.patterns.get(&pattern) {
            tracker.cached.store(cached, Ordering::Release);
            if !cached {
                tracker.marked.store(false, Ordering::Release);
            }
        }
    }

    /// Drops the batched path of `pattern` after it failed.
    pub fn invalidate(&self, pattern: PatternHash) {
        self.set_cached(pattern, false);
    }

    /// Every tracked pattern, most frequent first.
    pub fn summaries(&self) -> Vec<PatternSummary> {
        let mut summaries: Vec<_> = self
            .patterns
            .iter()
            .map(|entry| entry.value().summary(*entry.key()))
            .collect();
        summaries.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.pattern.cmp(&b.pattern))
        });
        summaries
    }

    /// Number of tracked patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether no pattern is tracked.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Evicts uncached patterns idle for longer than the pattern TTL.
    pub fn sweep(&self, now: u64) -> usize {
        let ttl = clock::duration_nanos(self.config.pattern_ttl);
        let before = self.patterns.len();
        self.patterns.retain(|_, tracker| {
            tracker.cached.load(Ordering::Acquire)
                || elapsed_since(now, tracker.last_seen.load(Ordering::Relaxed)) <= ttl
        });
        before - self.patterns.len()
    }

    /// Draws issued since the last frame reset.
    pub fn frame_draws(&self) -> u64 {
        self.frame_draws.load(Ordering::Relaxed)
    }

    /// Claims the right to send an optimization request at `now`, at most once
    /// per optimization interval.
    pub fn try_claim_optimization(&self, now: u64) -> bool {
        let interval = clock::duration_nanos(self.config.optimization_interval);
        let last = self.last_optimization.load(Ordering::Acquire);
        if last != NEVER && elapsed_since(now, last) < interval {
            return false;
        }
        self.last_optimization
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the current frame's draw count is close enough to the warning
    /// threshold to optimize ahead of time.
    pub fn near_warning(&self) -> bool {
        let threshold = self.config.warning_draws as f64 * self.config.preemptive_ratio;
        let draws = self.frame_draws();
        draws > 0 && draws as f64 >= threshold && draws < self.config.warning_draws
    }

    /// Clears the per-frame counters and buffered records.
    pub fn reset_frame_counters(&self) {
        self.frame_draws.store(0, Ordering::Relaxed);
        self.frame_batched.store(0, Ordering::Relaxed);
        self.frame_draw_nanos.store(0, Ordering::Relaxed);
        while self.records.pop().is_some() {}
    }

    /// Classifies the frame's draw load against a frame of `frame_nanos`,
    /// mines the buffered records and resets the per-frame counters.
    pub fn finalize_frame(&self, frame_nanos: u64, now: u64) -> DrawFrameSummary {
        let draw_calls = self.frame_draws.swap(0, Ordering::Relaxed);
        let batched_draws = self.frame_batched.swap(0, Ordering::Relaxed);
        let draw_nanos = self.frame_draw_nanos.swap(0, Ordering::Relaxed);

        let mut per_pattern: FxHashMap<PatternHash, usize> = FxHashMap::default();
        while let Some(record) = self.records.pop() {
            *per_pattern.entry(record.pattern).or_default() += 1;
        }
        let batchable_draws = per_pattern.values().filter(|&&n| n > 1).sum();

        let time_share = if frame_nanos == 0 {
            0.0
        } else {
            draw_nanos as f64 / frame_nanos as f64
        };
        let config = &self.config;
        let mut pressure = if draw_calls >= config.emergency_draws {
            DrawPressure::Emergency
        } else if draw_calls >= config.critical_draws {
            DrawPressure::Critical
        } else if draw_calls >= config.warning_draws {
            DrawPressure::Warning
        } else {
            DrawPressure::Normal
        };
        if pressure == DrawPressure::Normal
            && draw_calls > 0
            && time_share >= config.draw_time_share_warning
        {
            pressure = DrawPressure::Warning;
        }

        let emergency_batch = pressure == DrawPressure::Emergency;
        let optimization_requested = pressure >= DrawPressure::Warning
            && !emergency_batch
            && self.try_claim_optimization(now);

        DrawFrameSummary {
            draw_calls,
            batched_draws,
            draw_nanos,
            time_share,
            distinct_patterns: per_pattern.len(),
            batchable_draws,
            pressure,
            optimization_requested,
            emergency_batch,
        }
    }

    /// Forgets every pattern and counter.
    pub fn clear(&self) {
        self.patterns.clear();
        self.reset_frame_counters();
        self.last_optimization.store(NEVER, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const MS: u64 = 1_000_000;

    fn descriptor(shader_id: u64) -> DrawDescriptor {
        DrawDescriptor {
            primitive: PrimitiveType::Triangles,
            shader_id,
            vertex_source_id: 7,
            texture_set_hash: 0xfeed,
            uniform_set_hash: 0xbeef,
        }
    }

    const CALL: DrawCall = DrawCall {
        vertex_count: 6,
        instance_count: 1,
    };

    #[test]
    fn identical_descriptors_share_a_pattern() {
        assert_eq!(descriptor(1).pattern_hash(), descriptor(1).pattern_hash());
        assert_ne!(descriptor(1).pattern_hash(), descriptor(2).pattern_hash());
    }

    #[test]
    fn pattern_below_minimum_never_qualifies() {
        let tracker = DrawTracker::new(DrawConfig::default());
        for i in 0..7 {
            assert_eq!(tracker.observe(&descriptor(1), CALL, MS, false, i * MS), None);
        }
        assert_eq!(tracker.summaries()[0].occurrences, 7);
        assert!(!tracker.summaries()[0].marked_for_batching);
    }

    #[test]
    fn pattern_at_minimum_requests_batching_once() {
        let tracker = DrawTracker::new(DrawConfig::default());
        let mut requests = Vec::new();
        for i in 0..20 {
            if let Some(request) = tracker.observe(&descriptor(1), CALL, MS, false, i * MS) {
                requests.push(request);
            }
        }
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].batch_size, 8);
        assert_eq!(requests[0].descriptor, descriptor(1));

        let pattern = descriptor(1).pattern_hash();
        assert!(!tracker.is_cached(pattern));
        tracker.set_cached(pattern, true);
        assert!(tracker.is_cached(pattern));
        tracker.invalidate(pattern);
        assert!(!tracker.is_cached(pattern));
    }

    #[test]
    fn stale_occurrences_do_not_count() {
        let tracker = DrawTracker::new(DrawConfig {
            recency_window: Duration::from_secs(2),
            ..DrawConfig::default()
        });
        // One draw every 3s never builds a streak.
        for i in 0..20 {
            assert_eq!(
                tracker.observe(&descriptor(1), CALL, MS, false, i * 3_000 * MS),
                None
            );
        }
    }

    #[test]
    fn idle_uncached_patterns_are_swept() {
        let tracker = DrawTracker::new(DrawConfig::default());
        tracker.observe(&descriptor(1), CALL, MS, false, 0);
        tracker.observe(&descriptor(2), CALL, MS, false, 0);
        tracker.set_cached(descriptor(2).pattern_hash(), true);
        assert_eq!(tracker.sweep(11_000 * MS), 1);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_cached(descriptor(2).pattern_hash()));
    }

    #[test]
    fn frame_pressure_levels() {
        let tracker = DrawTracker::new(DrawConfig {
            warning_draws: 4,
            critical_draws: 8,
            emergency_draws: 12,
            ..DrawConfig::default()
        });
        for _ in 0..5 {
            tracker.observe(&descriptor(1), CALL, 10, false, 0);
        }
        let summary = tracker.finalize_frame(16 * MS, 0);
        assert_eq!(summary.pressure, DrawPressure::Warning);
        assert!(summary.optimization_requested);
        assert_eq!(summary.distinct_patterns, 1);
        assert_eq!(summary.batchable_draws, 5);

        for _ in 0..5 {
            tracker.observe(&descriptor(1), CALL, 10, false, 0);
        }
        // Rate limited within the optimization interval.
        let summary = tracker.finalize_frame(16 * MS, 100 * MS);
        assert!(!summary.optimization_requested);

        for _ in 0..12 {
            tracker.observe(&descriptor(1), CALL, 10, true, 0);
        }
        let summary = tracker.finalize_frame(16 * MS, 200 * MS);
        assert_eq!(summary.pressure, DrawPressure::Emergency);
        assert!(summary.emergency_batch);
        assert_eq!(summary.batched_draws, 12);
        assert_eq!(tracker.frame_draws(), 0);
    }

    #[test]
    fn draw_time_share_raises_warning() {
        let tracker = DrawTracker::new(DrawConfig::default());
        tracker.observe(&descriptor(1), CALL, 12 * MS, false, 0);
        let summary = tracker.finalize_frame(16 * MS, 0);
        assert_eq!(summary.pressure, DrawPressure::Warning);
        assert!((summary.time_share - 0.75).abs() < 1e-9);
    }
}
