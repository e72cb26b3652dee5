//! Periodic health sweep.
//!
//! ## Usage
//!
//! [`run_cycle`] is called by the scheduler once per monitor interval, or by
//! the host through [`Vigil::run_monitor_cycle`](crate::Vigil::run_monitor_cycle).
//! Each check warns first and acts at a stricter threshold:
//!
//! | check | warning | critical action |
//! |---|---|---|
//! | frame-time variation | report | downgrade quality |
//! | consecutive spike frames | report | emergency flush and GC |
//! | failures per cycle | report | graceful degradation |
//! | memory usage | report | emergency GC and eviction |
//! | open circuit breakers | report | |
//! | draws near the warning threshold | optimization request | |
//!
//! A cycle never panics into its caller.

use std::sync::atomic::{AtomicU32, Ordering};

use smallvec::SmallVec;
use tracing::debug;

use crate::{
    call_key::{Backend, CallCategory, CallKey},
    collaborator::{MemoryProbe, guarded},
    engine::Core,
    issue::{HealthIssue, IssueKind, RecoveryStrategy, RoutingDecision, Severity},
    pipeline::{self, Job},
    recovery::RecoveryTask,
    report::ReportDraft,
};

/// Reads `/proc/meminfo` on Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn usage_ratio(&self) -> Option<f64> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&meminfo)
    }
}

fn parse_meminfo(meminfo: &str) -> Option<f64> {
    let field = |line: &str| -> Option<u64> { line.split_whitespace().nth(1)?.parse().ok() };
    let mut total_kb = None;
    let mut available_kb = None;
    for line in meminfo.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = field(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = field(line);
        }
    }
    let (total, available) = (total_kb?, available_kb?);
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64)
}

/// Counters the monitor reads and resets every cycle.
#[derive(Debug, Default)]
pub(crate) struct MonitorState {
    errors: AtomicU32,
}

impl MonitorState {
    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn take_errors(&self) -> u32 {
        self.errors.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// What one monitor cycle observed.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MonitorSummary {
    /// Coefficient of variation of recent frame times.
    pub frame_time_cv: Option<f64>,
    /// Spike frames in a row.
    pub consecutive_spike_frames: u32,
    /// Failures since the previous cycle.
    pub errors: u32,
    /// Memory usage ratio, if a probe is registered.
    pub memory_ratio: Option<f64>,
    /// Backends whose breaker is open.
    pub open_backends: SmallVec<[Backend; 2]>,
    /// An optimization request was sent ahead of the draw warning threshold.
    pub preemptive_optimization: bool,
    /// Reports submitted by this cycle.
    pub findings: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Warning,
    Critical,
}

/// Runs every check once.
pub(crate) fn run_cycle(core: &Core) -> MonitorSummary {
    match guarded("monitor cycle", || checks(core)) {
        Some(summary) => summary,
        None => {
            core.counters.cycle_panics();
            MonitorSummary::default()
        }
    }
}

fn checks(core: &Core) -> MonitorSummary {
    let config = &core.config.monitor;
    let backend = core.active_backend();
    let mut summary = MonitorSummary::default();

    // Frame-time variation.
    summary.frame_time_cv = core.frame.frame_time_cv(config.min_frame_samples);
    if let Some(cv) = summary.frame_time_cv {
        let level = grade(cv >= config.frame_cv_warning, cv >= config.frame_cv_critical);
        if let Some(level) = level {
            summary.findings += escalate(
                core,
                backend,
                ["frame_time", "frame_time_critical"],
                HealthIssue::FrameTimeInstability,
                level,
                format!("frame time coefficient of variation is {cv:.2}"),
                &[RecoveryStrategy::DowngradeQuality],
            );
        }
    }

    // Spike-frame streak.
    let spikes = core.frame.consecutive_spike_frames();
    summary.consecutive_spike_frames = spikes;
    if let Some(level) = grade(
        spikes >= config.spike_frames_warning,
        spikes >= config.spike_frames_critical,
    ) {
        summary.findings += escalate(
            core,
            backend,
            ["spike_frames", "spike_frames_critical"],
            HealthIssue::ConsecutiveSpikeFrames,
            level,
            format!("{spikes} spike frames in a row"),
            &[RecoveryStrategy::EmergencyFlush, RecoveryStrategy::EmergencyGc],
        );
    }

    // Failures since the previous cycle.
    let errors = core.monitor.take_errors();
    summary.errors = errors;
    if let Some(level) = grade(errors >= config.errors_warning, errors >= config.errors_critical) {
        summary.findings += escalate(
            core,
            backend,
            ["errors", "errors_critical"],
            HealthIssue::ConsecutiveErrors,
            level,
            format!("{errors} failed calls since the last check"),
            &[RecoveryStrategy::GracefulDegradation],
        );
    }

    // Memory pressure.
    summary.memory_ratio = core
        .collaborators
        .memory_probe
        .get()
        .and_then(|probe| guarded("memory probe", || probe.usage_ratio()).flatten());
    if let Some(ratio) = summary.memory_ratio {
        let level = grade(ratio >= config.memory_warning, ratio >= config.memory_critical);
        if let Some(level) = level {
            summary.findings += escalate(
                core,
                backend,
                ["memory", "memory_critical"],
                HealthIssue::MemoryPressure,
                level,
                format!("memory usage at {:.0}%", ratio * 100.0),
                &[RecoveryStrategy::EmergencyGc],
            );
        }
    }

    // Open breakers.
    let now = core.now();
    summary.open_backends = core.breakers.open_backends().collect();
    for &open in &summary.open_backends {
        let draft = ReportDraft::advisory(
            CallKey::new(open, CallCategory::Other, "circuit_breaker"),
            IssueKind::Health(HealthIssue::CircuitOpen),
            Severity::High,
            format!("circuit breaker of {open} is open"),
            now,
        )
        // Informational only: delivery must not re-trip a half-open breaker.
        .with_routing(RoutingDecision::Continue);
        if pipeline::submit(core, draft) {
            summary.findings += 1;
        }
    }

    // Draw count approaching the warning threshold.
    if core.draw.near_warning()
        && core.collaborators.draw_batcher.get().is_some()
        && core.draw.try_claim_optimization(now)
    {
        debug!(draws = core.draw.frame_draws(), "requesting draw optimization ahead of warning");
        pipeline::post_job(core, Job::Optimize(core.draw.summaries()));
        summary.preemptive_optimization = true;
    }

    summary
}

fn grade(warning: bool, critical: bool) -> Option<Level> {
    if critical {
        Some(Level::Critical)
    } else if warning {
        Some(Level::Warning)
    } else {
        None
    }
}

/// Submits a finding under `names[0]` (warning) or `names[1]` (critical), so
/// an escalation is not suppressed by a recent warning. A warning carries no
/// action; a critical finding runs `actions`, the first through the report
/// itself and the rest directly. Returns the number of submitted reports.
fn escalate(
    core: &Core,
    backend: Backend,
    names: [&'static str; 2],
    issue: HealthIssue,
    level: Level,
    reason: String,
    actions: &[RecoveryStrategy],
) -> usize {
    let now = core.now();
    let kind = IssueKind::Health(issue);
    let name = match level {
        Level::Warning => names[0],
        Level::Critical => names[1],
    };
    let key = CallKey::new(backend, CallCategory::Frame, name);
    let draft = match level {
        Level::Warning => ReportDraft::advisory(key.clone(), kind, Severity::Medium, reason, now)
            .with_strategy(RecoveryStrategy::None),
        Level::Critical => {
            let first = actions.first().copied().unwrap_or(RecoveryStrategy::None);
            ReportDraft::advisory(key.clone(), kind, Severity::Critical, reason, now)
                .with_strategy(first)
        }
    };
    if !pipeline::submit(core, draft) {
        return 0;
    }
    if level == Level::Critical {
        for &strategy in actions.iter().skip(1) {
            if !core.trackers.try_begin(&key, strategy, now) {
                core.counters.recoveries_throttled();
                continue;
            }
            let task = RecoveryTask {
                key: key.clone(),
                strategy,
                kind,
                severity: Severity::Critical,
                report_id: 0,
                queued_at_nanos: now,
            };
            pipeline::post_job(core, Job::Recover(task));
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_meminfo() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let ratio = parse_meminfo(meminfo).unwrap_or_default();
        assert!((ratio - 0.75).abs() < 1e-9);
        assert_eq!(parse_meminfo("MemTotal: 0 kB\nMemAvailable: 0 kB"), None);
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn grading_prefers_critical() {
        assert!(grade(true, true) == Some(Level::Critical));
        assert!(grade(true, false) == Some(Level::Warning));
        assert!(grade(false, false).is_none());
    }
}
