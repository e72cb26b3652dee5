//! Engine configuration.
//!
//! ## Usage
//!
//! Start from [`VigilConfig::default`] and override what the host needs.
//!
//! ```
//! use std::time::Duration;
//! use vigil::{Backend, VigilConfig};
//!
//! let mut config = VigilConfig::default();
//! config.primary_backend = Backend::Metal;
//! config.breaker.cooldown = Duration::from_secs(2);
//! assert!(config.validate().is_ok());
//! ```
//!
//! All thresholds are tuning knobs rather than behavioural guarantees.

use std::time::Duration;

use crate::{call_key::Backend, error::VigilError, issue::Severity};

/// Root configuration of a [`Vigil`](crate::Vigil) engine.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VigilConfig {
    /// Backend that frame-level and monitor-level reports are attributed to,
    /// and whose manager receives frame-level corrective actions.
    pub primary_backend: Backend,
    /// Spike classification thresholds.
    pub spike: SpikeThresholds,
    /// Per-backend circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Where calls go when a backend's breaker is open.
    pub fallback: FallbackTable,
    /// Statistics store, queues and worker pool.
    pub pipeline: PipelineConfig,
    /// Recovery attempt budget.
    pub recovery: RecoveryConfig,
    /// Frame classification.
    pub frame: FrameConfig,
    /// Draw-pattern tracking and batching.
    pub draw: DrawConfig,
    /// Active monitoring thresholds.
    pub monitor: MonitorConfig,
    /// Background scheduling.
    pub scheduler: SchedulerConfig,
    /// Subscriber and watchdog settings for [`crate::logging`].
    pub logging: LoggingConfig,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            primary_backend: Backend::Vulkan,
            spike: SpikeThresholds::default(),
            breaker: BreakerConfig::default(),
            fallback: FallbackTable::default(),
            pipeline: PipelineConfig::default(),
            recovery: RecoveryConfig::default(),
            frame: FrameConfig::default(),
            draw: DrawConfig::default(),
            monitor: MonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl VigilConfig {
    /// Configuration with no background threads: jobs run inline and the
    /// host drives every cycle through [`Vigil::tick`](crate::Vigil::tick).
    pub fn deterministic() -> Self {
        let mut config = Self::default();
        config.pipeline.worker_threads = 0;
        config.scheduler.mode = SchedulerMode::Manual;
        config
    }

    /// Checks internal consistency.
    pub fn validate(&self) -> Result<(), VigilError> {
        self.spike.validate()?;
        self.fallback.validate()?;
        ensure(self.breaker.failure_threshold > 0, "breaker.failure_threshold must be > 0")?;
        ensure(
            self.pipeline.report_queue_capacity > 0
                && self.pipeline.recovery_queue_capacity > 0
                && self.pipeline.job_queue_capacity > 0,
            "pipeline queue capacities must be > 0",
        )?;
        ensure(self.pipeline.drain_batch > 0, "pipeline.drain_batch must be > 0")?;
        ensure(self.pipeline.max_tracked_keys > 0, "pipeline.max_tracked_keys must be > 0")?;
        ensure(
            in_unit_interval(self.pipeline.eviction_fraction),
            "pipeline.eviction_fraction must be in (0, 1]",
        )?;
        ensure(self.recovery.max_attempts > 0, "recovery.max_attempts must be > 0")?;
        ensure(
            in_unit_interval(self.frame.gpu_bound_ratio)
                && in_unit_interval(self.frame.cpu_bound_ratio)
                && in_unit_interval(self.frame.bandwidth_bound_ratio),
            "frame ratios must be in (0, 1]",
        )?;
        ensure(self.frame.history_len >= 2, "frame.history_len must be >= 2")?;
        ensure(self.draw.min_occurrences > 0, "draw.min_occurrences must be > 0")?;
        ensure(
            self.draw.min_batch_size > 0 && self.draw.optimal_batch_size >= self.draw.min_batch_size,
            "draw batch sizes must satisfy 0 < min <= optimal",
        )?;
        ensure(self.draw.record_buffer > 0, "draw.record_buffer must be > 0")?;
        ensure(
            self.draw.warning_draws < self.draw.critical_draws
                && self.draw.critical_draws < self.draw.emergency_draws,
            "draw thresholds must satisfy warning < critical < emergency",
        )?;
        ensure(
            in_unit_interval(self.draw.draw_time_share_warning)
                && in_unit_interval(self.draw.preemptive_ratio),
            "draw ratios must be in (0, 1]",
        )?;
        self.monitor.validate()?;
        ensure(
            !self.scheduler.tick.is_zero()
                && !self.scheduler.monitor_interval.is_zero()
                && !self.scheduler.maintenance_interval.is_zero(),
            "scheduler intervals must be non-zero",
        )?;
        ensure(
            !self.logging.default_filter.trim().is_empty()
                && !self.logging.deadlock_check_interval.is_zero(),
            "logging needs a default filter and a non-zero watchdog interval",
        )?;
        Ok(())
    }
}

/// Thresholds used by the spike classifier.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SpikeThresholds {
    /// Smallest duration reported as a micro-spike (advisory only).
    pub micro_spike: Duration,
    /// Small spike.
    pub small_spike: Duration,
    /// Medium spike.
    pub medium_spike: Duration,
    /// A spike long enough to drop a 60 Hz frame.
    pub visible_stutter: Duration,
    /// Several dropped frames.
    pub severe_stutter: Duration,
    /// A stall that always classifies at the highest severity.
    pub catastrophic_stall: Duration,
    /// EWMA smoothing factor in `(0, 1]`.
    pub ewma_alpha: f64,
    /// Samples required before the EWMA-relative test applies.
    pub ewma_min_samples: u64,
    /// `duration / ewma` above which a call is elevated.
    pub ewma_elevated_factor: f64,
    /// `duration / ewma` above which a call is a severe spike.
    pub ewma_severe_factor: f64,
    /// Samples required before the variance test applies.
    pub variance_min_samples: u64,
    /// z-score of an elevated call.
    pub variance_elevated_sigma: f64,
    /// z-score of a severe call.
    pub variance_severe_sigma: f64,
    /// Lower bound of the standard deviation as a fraction of the mean.
    pub stddev_floor_ratio: f64,
    /// Least-squares slope, as a fraction of the EWMA, that counts as a trend.
    pub trend_slope_ratio: f64,
    /// Shader compile/link override.
    pub shader: CategoryThresholds,
    /// Fence/semaphore wait override.
    pub sync_wait: CategoryThresholds,
    /// Queue submission override.
    pub queue_submit: CategoryThresholds,
    /// Pipeline creation override.
    pub pipeline_create: CategoryThresholds,
}

impl Default for SpikeThresholds {
    fn default() -> Self {
        Self {
            micro_spike: Duration::from_micros(500),
            small_spike: Duration::from_millis(2),
            medium_spike: Duration::from_millis(5),
            visible_stutter: Duration::from_nanos(16_666_667),
            severe_stutter: Duration::from_millis(50),
            catastrophic_stall: Duration::from_millis(250),
            ewma_alpha: 0.1,
            ewma_min_samples: 32,
            ewma_elevated_factor: 2.5,
            ewma_severe_factor: 5.0,
            variance_min_samples: 64,
            variance_elevated_sigma: 3.0,
            variance_severe_sigma: 6.0,
            stddev_floor_ratio: 0.05,
            trend_slope_ratio: 0.1,
            shader: CategoryThresholds::new(Duration::from_millis(50), Duration::from_millis(250)),
            sync_wait: CategoryThresholds::new(Duration::from_millis(8), Duration::from_millis(100)),
            queue_submit: CategoryThresholds::new(
                Duration::from_millis(4),
                Duration::from_millis(50),
            ),
            pipeline_create: CategoryThresholds::new(
                Duration::from_millis(30),
                Duration::from_millis(200),
            ),
        }
    }
}

impl SpikeThresholds {
    fn validate(&self) -> Result<(), VigilError> {
        let tiers = [
            self.micro_spike,
            self.small_spike,
            self.medium_spike,
            self.visible_stutter,
            self.severe_stutter,
            self.catastrophic_stall,
        ];
        ensure(
            tiers.windows(2).all(|pair| pair[0] < pair[1]),
            "spike tiers must be strictly increasing",
        )?;
        ensure(
            self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0,
            "spike.ewma_alpha must be in (0, 1]",
        )?;
        ensure(
            self.ewma_elevated_factor > 1.0 && self.ewma_severe_factor > self.ewma_elevated_factor,
            "spike EWMA factors must satisfy 1 < elevated < severe",
        )?;
        ensure(
            self.variance_elevated_sigma > 0.0
                && self.variance_severe_sigma > self.variance_elevated_sigma,
            "spike sigma tiers must satisfy 0 < elevated < severe",
        )?;
        ensure(
            self.variance_min_samples >= 2,
            "spike.variance_min_samples must be >= 2",
        )?;
        for (name, category) in [
            ("shader", &self.shader),
            ("sync_wait", &self.sync_wait),
            ("queue_submit", &self.queue_submit),
            ("pipeline_create", &self.pipeline_create),
        ] {
            if category.slow >= category.stall {
                return Err(VigilError::InvalidConfig(format!(
                    "spike.{name}: slow must be below stall"
                )));
            }
        }
        Ok(())
    }
}

/// Absolute thresholds replacing the generic tiers for one call category.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CategoryThresholds {
    /// Slower than expected.
    pub slow: Duration,
    /// Stalled.
    pub stall: Duration,
}

impl CategoryThresholds {
    /// Creates a threshold pair.
    pub const fn new(slow: Duration, stall: Duration) -> Self {
        Self { slow, stall }
    }
}

/// Circuit breaker settings shared by every backend.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Fallback backend per backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FallbackTable {
    entries: [Option<Backend>; Backend::COUNT],
}

impl FallbackTable {
    /// A table with no fallbacks at all.
    pub const fn empty() -> Self {
        Self {
            entries: [None; Backend::COUNT],
        }
    }

    /// Sets (or clears) the fallback of `from`.
    pub fn set(&mut self, from: Backend, to: Option<Backend>) -> &mut Self {
        self.entries[from.index()] = to;
        self
    }

    /// Direct fallback of `backend`.
    pub fn fallback_of(&self, backend: Backend) -> Option<Backend> {
        self.entries[backend.index()]
    }

    /// The chain of fallbacks starting after `backend`, without cycles.
    pub fn chain(&self, backend: Backend) -> impl Iterator<Item = Backend> + '_ {
        let mut visited = [false; Backend::COUNT];
        visited[backend.index()] = true;
        let mut current = backend;
        std::iter::from_fn(move || {
            let next = self.fallback_of(current)?;
            if visited[next.index()] {
                return None;
            }
            visited[next.index()] = true;
            current = next;
            Some(next)
        })
    }

    fn validate(&self) -> Result<(), VigilError> {
        for backend in Backend::ALL {
            if self.fallback_of(backend) == Some(backend) {
                return Err(VigilError::InvalidConfig(format!(
                    "fallback of {backend} points at itself"
                )));
            }
        }
        Ok(())
    }
}

impl Default for FallbackTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table
            .set(Backend::Vulkan, Some(Backend::OpenGl))
            .set(Backend::Direct3D12, Some(Backend::Direct3D11))
            .set(Backend::Direct3D11, Some(Backend::OpenGl))
            .set(Backend::WebGpu, Some(Backend::OpenGl));
        table
    }
}

/// Statistics store, queues and worker pool sizing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    /// Minimum time between two delivered reports for the same call site.
    pub dedup_window: Duration,
    /// Capacity of the hand-off queue feeding the worker pool.
    pub job_queue_capacity: usize,
    /// Capacity of the built-report queue.
    pub report_queue_capacity: usize,
    /// Capacity of the recovery task queue.
    pub recovery_queue_capacity: usize,
    /// Worker threads. `0` runs every job inline on the posting thread.
    pub worker_threads: usize,
    /// Reports (and recovery tasks) handled per drain cycle.
    pub drain_batch: usize,
    /// Reports at or above this severity raise a user-visible notification.
    pub notify_threshold: Severity,
    /// Tracked call sites before maintenance evicts the quietest ones.
    pub max_tracked_keys: usize,
    /// Fraction of `max_tracked_keys` evicted per sweep, on top of the overflow.
    pub eviction_fraction: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            job_queue_capacity: 1024,
            report_queue_capacity: 256,
            recovery_queue_capacity: 64,
            worker_threads: 2,
            drain_batch: 16,
            notify_threshold: Severity::High,
            max_tracked_keys: 4096,
            eviction_fraction: 0.1,
        }
    }
}

/// Recovery attempt budget.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RecoveryConfig {
    /// Attempts allowed per call site before the cool-down must elapse.
    pub max_attempts: u32,
    /// Time after the last attempt that restores the full budget.
    pub cooldown: Duration,
    /// Trackers idle for longer than this are discarded by maintenance.
    pub tracker_idle_ttl: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(30),
            tracker_idle_ttl: Duration::from_secs(300),
        }
    }
}

/// Frame classification thresholds.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FrameConfig {
    /// GPU share of the frame at which it is GPU-bound.
    pub gpu_bound_ratio: f64,
    /// CPU share of the frame at which it is CPU-bound.
    pub cpu_bound_ratio: f64,
    /// Sync share of the frame at which it is bandwidth-bound.
    pub bandwidth_bound_ratio: f64,
    /// Frames at least this long count as spike frames.
    pub spike_frame: Duration,
    /// Recent frame times kept for variance analysis.
    pub history_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            gpu_bound_ratio: 0.8,
            cpu_bound_ratio: 0.8,
            bandwidth_bound_ratio: 0.35,
            spike_frame: Duration::from_millis(33),
            history_len: 120,
        }
    }
}

/// Draw-pattern tracking and batching.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DrawConfig {
    /// Occurrences before a pattern becomes a batching candidate.
    pub min_occurrences: u64,
    /// A candidate must have been seen within this window.
    pub recency_window: Duration,
    /// Smallest batch requested from the batcher.
    pub min_batch_size: u32,
    /// Largest batch requested from the batcher.
    pub optimal_batch_size: u32,
    /// Draw records kept for pattern mining.
    pub record_buffer: usize,
    /// Uncached patterns idle for longer than this are evicted.
    pub pattern_ttl: Duration,
    /// Draws per frame that trigger a warning.
    pub warning_draws: u64,
    /// Draws per frame that trigger a critical report.
    pub critical_draws: u64,
    /// Draws per frame that trigger emergency batching.
    pub emergency_draws: u64,
    /// Share of the frame spent in draws that triggers a warning.
    pub draw_time_share_warning: f64,
    /// Minimum interval between two optimization requests.
    pub optimization_interval: Duration,
    /// Fraction of `warning_draws` at which the monitor asks for optimization.
    pub preemptive_ratio: f64,
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 8,
            recency_window: Duration::from_secs(2),
            min_batch_size: 4,
            optimal_batch_size: 64,
            record_buffer: 4096,
            pattern_ttl: Duration::from_secs(10),
            warning_draws: 2000,
            critical_draws: 4000,
            emergency_draws: 8000,
            draw_time_share_warning: 0.6,
            optimization_interval: Duration::from_secs(1),
            preemptive_ratio: 0.9,
        }
    }
}

/// Active monitoring thresholds. Each pair is (warning, critical).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MonitorConfig {
    /// Frames needed before frame-time variance is judged.
    pub min_frame_samples: usize,
    /// Coefficient of variation of frame times that warns.
    pub frame_cv_warning: f64,
    /// Coefficient of variation of frame times that downgrades quality.
    pub frame_cv_critical: f64,
    /// Consecutive spike frames that warn.
    pub spike_frames_warning: u32,
    /// Consecutive spike frames that trigger an emergency flush.
    pub spike_frames_critical: u32,
    /// Errors per monitor cycle that warn.
    pub errors_warning: u32,
    /// Errors per monitor cycle that enter degraded mode.
    pub errors_critical: u32,
    /// Memory usage ratio that warns.
    pub memory_warning: f64,
    /// Memory usage ratio that triggers emergency GC and eviction.
    pub memory_critical: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_frame_samples: 10,
            frame_cv_warning: 0.25,
            frame_cv_critical: 0.5,
            spike_frames_warning: 3,
            spike_frames_critical: 8,
            errors_warning: 5,
            errors_critical: 20,
            memory_warning: 0.80,
            memory_critical: 0.92,
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> Result<(), VigilError> {
        ensure(
            self.frame_cv_warning < self.frame_cv_critical,
            "monitor frame CV thresholds must satisfy warning < critical",
        )?;
        ensure(
            self.spike_frames_warning < self.spike_frames_critical,
            "monitor spike frame thresholds must satisfy warning < critical",
        )?;
        ensure(
            self.errors_warning < self.errors_critical,
            "monitor error thresholds must satisfy warning < critical",
        )?;
        ensure(
            self.memory_warning < self.memory_critical && in_unit_interval(self.memory_critical),
            "monitor memory thresholds must satisfy 0 < warning < critical <= 1",
        )?;
        Ok(())
    }
}

/// How periodic work is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SchedulerMode {
    /// A dedicated scheduler thread.
    Background,
    /// The host calls [`Vigil::tick`](crate::Vigil::tick) itself.
    Manual,
}

/// Background scheduling intervals.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SchedulerConfig {
    /// Whether a scheduler thread is spawned.
    pub mode: SchedulerMode,
    /// Queue drain period.
    pub tick: Duration,
    /// Active monitoring period.
    pub monitor_interval: Duration,
    /// Eviction and sweep period.
    pub maintenance_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Background,
            tick: Duration::from_millis(50),
            monitor_interval: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(5),
        }
    }
}

/// Settings read by [`logging::init_tracing`](crate::logging::init_tracing)
/// and [`logging::init_deadlock_detection`](crate::logging::init_deadlock_detection).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Multi-line output instead of one line per event.
    pub pretty: bool,
    /// Emit an event when a span closes, with its busy and idle time.
    pub span_close_events: bool,
    /// How often the debug-build watchdog looks for lock cycles.
    pub deadlock_check_interval: Duration,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "error,vigil=info".to_owned(),
            pretty: true,
            span_close_events: true,
            deadlock_check_interval: Duration::from_secs(10),
        }
    }
}

fn in_unit_interval(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

fn ensure(condition: bool, message: &str) -> Result<(), VigilError> {
    if condition {
        Ok(())
    } else {
        Err(VigilError::InvalidConfig(message.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(VigilConfig::default().validate().is_ok());
        assert!(VigilConfig::deterministic().validate().is_ok());
    }

    #[test]
    fn rejects_unordered_tiers() {
        let mut config = VigilConfig::default();
        config.spike.small_spike = config.spike.medium_spike;
        assert!(matches!(
            config.validate(),
            Err(VigilError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_blank_log_filter() {
        let mut config = VigilConfig::default();
        config.logging.default_filter = "  ".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_batch_sizes() {
        let mut config = VigilConfig::default();
        config.draw.optimal_batch_size = 2;
        config.draw.min_batch_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn fallback_chain_follows_links_without_cycles() {
        let table = FallbackTable::default();
        let chain: Vec<_> = table.chain(Backend::Direct3D12).collect();
        assert_eq!(chain, vec![Backend::Direct3D11, Backend::OpenGl]);

        let mut cyclic = FallbackTable::empty();
        cyclic
            .set(Backend::Vulkan, Some(Backend::OpenGl))
            .set(Backend::OpenGl, Some(Backend::Vulkan));
        let chain: Vec<_> = cyclic.chain(Backend::Vulkan).collect();
        assert_eq!(chain, vec![Backend::OpenGl]);
    }

    #[test]
    fn self_fallback_is_rejected() {
        let mut config = VigilConfig::default();
        config.fallback.set(Backend::Metal, Some(Backend::Metal));
        assert!(config.validate().is_err());
    }
}
