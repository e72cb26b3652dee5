//! Per-frame timing roll-up.
//!
//! ## Usage
//!
//! Every profiled call adds its duration to one of three buckets chosen by
//! [`CallCategory::time_bucket`]. [`FrameAccumulator::end_frame`] reads and
//! resets the buckets, classifies the frame by the share of each bucket and
//! appends the frame time to the history the monitor inspects.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    call_key::{CallCategory, TimeBucket},
    clock::duration_nanos,
    config::FrameConfig,
    issue::{IssueKind, PerformanceIssue},
};

/// Classification of one finished frame.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FrameAnalysis {
    /// Sequence number, starting at 1.
    pub index: u64,
    /// Frame duration as reported by the host.
    pub total_nanos: u64,
    /// Time spent in draw, dispatch and clear calls.
    pub gpu_nanos: u64,
    /// Time spent in everything else.
    pub cpu_nanos: u64,
    /// Time spent waiting on fences, semaphores, submission and presentation.
    pub sync_nanos: u64,
    /// Draw calls issued.
    pub draw_calls: u64,
    /// State changes issued.
    pub state_changes: u64,
    /// `gpu_nanos / total_nanos`.
    pub gpu_ratio: f64,
    /// `cpu_nanos / total_nanos`.
    pub cpu_ratio: f64,
    /// `sync_nanos / total_nanos`.
    pub sync_ratio: f64,
    /// Whether the frame exceeded the spike-frame threshold.
    pub is_spike: bool,
    /// Issues detected on profiled calls during the frame.
    pub issues: SmallVec<[IssueKind; 4]>,
    /// Bottlenecks, in GPU, CPU, bandwidth order.
    pub bottlenecks: SmallVec<[PerformanceIssue; 3]>,
}

impl FrameAnalysis {
    /// Whether GPU work dominated the frame.
    pub fn is_gpu_bound(&self) -> bool {
        self.bottlenecks.contains(&PerformanceIssue::GpuBound)
    }

    /// Whether CPU work dominated the frame.
    pub fn is_cpu_bound(&self) -> bool {
        self.bottlenecks.contains(&PerformanceIssue::CpuBound)
    }

    /// Whether synchronization dominated the frame.
    pub fn is_bandwidth_bound(&self) -> bool {
        self.bottlenecks.contains(&PerformanceIssue::BandwidthBound)
    }
}

/// Accumulator for the frame in flight plus a short frame-time history.
pub struct FrameAccumulator {
    gpu_nanos: AtomicU64,
    cpu_nanos: AtomicU64,
    sync_nanos: AtomicU64,
    draw_calls: AtomicU64,
    state_changes: AtomicU64,
    issues: Mutex<SmallVec<[IssueKind; 4]>>,
    frame_index: AtomicU64,
    consecutive_spike_frames: AtomicU32,
    history: Mutex<VecDeque<u64>>,
    last: Mutex<Option<FrameAnalysis>>,
    config: FrameConfig,
}

impl FrameAccumulator {
    /// Creates an empty accumulator.
    pub fn new(config: FrameConfig) -> Self {
        Self {
            gpu_nanos: AtomicU64::new(0),
            cpu_nanos: AtomicU64::new(0),
            sync_nanos: AtomicU64::new(0),
            draw_calls: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
            issues: Mutex::new(SmallVec::new()),
            frame_index: AtomicU64::new(0),
            consecutive_spike_frames: AtomicU32::new(0),
            history: Mutex::new(VecDeque::with_capacity(config.history_len)),
            last: Mutex::new(None),
            config,
        }
    }

    /// Discards anything accumulated since the last frame boundary.
    pub fn begin_frame(&self) {
        self.take();
    }

    /// Charges one call to the current frame.
    pub fn record_call(&self, category: CallCategory, duration_nanos: u64) {
        let bucket = match category.time_bucket() {
            TimeBucket::Gpu => &self.gpu_nanos,
            TimeBucket::Cpu => &self.cpu_nanos,
            TimeBucket::Sync => &self.sync_nanos,
        };
        bucket.fetch_add(duration_nanos, Ordering::Relaxed);
        if category.is_draw() {
            self.draw_calls.fetch_add(1, Ordering::Relaxed);
        } else if category.is_state_change() {
            self.state_changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Tags the current frame with an issue detected on one of its calls.
    pub fn tag(&self, kind: IssueKind) {
        let mut issues = self.issues.lock();
        if !issues.contains(&kind) {
            issues.push(kind);
        }
    }

    /// Draw calls issued so far in the current frame.
    pub fn draw_calls(&self) -> u64 {
        self.draw_calls.load(Ordering::Relaxed)
    }

    /// Finalizes the current frame, which took `total_nanos`, and resets the
    /// accumulator.
    pub fn end_frame(&self, total_nanos: u64) -> FrameAnalysis {
        let (gpu_nanos, cpu_nanos, sync_nanos, draw_calls, state_changes, issues) = self.take();
        let denominator = if total_nanos > 0 {
            total_nanos
        } else {
            gpu_nanos + cpu_nanos + sync_nanos
        };
        let ratio = |part: u64| {
            if denominator == 0 {
                0.0
            } else {
                part as f64 / denominator as f64
            }
        };
        let gpu_ratio = ratio(gpu_nanos);
        let cpu_ratio = ratio(cpu_nanos);
        let sync_ratio = ratio(sync_nanos);

        let mut bottlenecks = SmallVec::new();
        if gpu_ratio >= self.config.gpu_bound_ratio {
            bottlenecks.push(PerformanceIssue::GpuBound);
        }
        if cpu_ratio >= self.config.cpu_bound_ratio {
            bottlenecks.push(PerformanceIssue::CpuBound);
        }
        if sync_ratio >= self.config.bandwidth_bound_ratio {
            bottlenecks.push(PerformanceIssue::BandwidthBound);
        }

        let analysis = FrameAnalysis {
            index: self.frame_index.fetch_add(1, Ordering::Relaxed) + 1,
            total_nanos,
            gpu_nanos,
            cpu_nanos,
            sync_nanos,
            draw_calls,
            state_changes,
            gpu_ratio,
            cpu_ratio,
            sync_ratio,
            is_spike: self.record_frame_time(total_nanos),
            issues,
            bottlenecks,
        };
        *self.last.lock() = Some(analysis.clone());
        analysis
    }

    #[allow(clippy::type_complexity)]
    fn take(&self) -> (u64, u64, u64, u64, u64, SmallVec<[IssueKind; 4]>) {
        (
            self.gpu_nanos.swap(0, Ordering::Relaxed),
            self.cpu_nanos.swap(0, Ordering::Relaxed),
            self.sync_nanos.swap(0, Ordering::Relaxed),
            self.draw_calls.swap(0, Ordering::Relaxed),
            self.state_changes.swap(0, Ordering::Relaxed),
            std::mem::take(&mut *self.issues.lock()),
        )
    }

    /// Appends a frame time to the history and updates the spike-frame streak.
    /// Returns whether the frame was a spike frame.
    pub fn record_frame_time(&self, total_nanos: u64) -> bool {
        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_len.max(1) {
                history.pop_front();
            }
            history.push_back(total_nanos);
        }
        let is_spike = total_nanos >= duration_nanos(self.config.spike_frame);
        if is_spike {
            self.consecutive_spike_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.consecutive_spike_frames.store(0, Ordering::Relaxed);
        }
        is_spike
    }

    /// Spike frames in a row, ending with the most recent frame.
    pub fn consecutive_spike_frames(&self) -> u32 {
        self.consecutive_spike_frames.load(Ordering::Relaxed)
    }

    /// Coefficient of variation of the recorded frame times, once at least
    /// `min_samples` frames are known.
    pub fn frame_time_cv(&self, min_samples: usize) -> Option<f64> {
        let history = self.history.lock();
        if history.len() < min_samples.max(2) {
            return None;
        }
        let n = history.len() as f64;
        let mean = history.iter().map(|&t| t as f64).sum::<f64>() / n;
        if mean <= 0.0 {
            return None;
        }
        let variance = history
            .iter()
            .map(|&t| {
                let d = t as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        Some(variance.sqrt() / mean)
    }

    /// Number of frame times held.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// The most recently finished frame.
    pub fn last(&self) -> Option<FrameAnalysis> {
        self.last.lock().clone()
    }

    /// Forgets everything.
    pub fn clear(&self) {
        self.take();
        self.history.lock().clear();
        *self.last.lock() = None;
        self.consecutive_spike_frames.store(0, Ordering::Relaxed);
        self.frame_index.store(0, Ordering::Relaxed);
    }
}
