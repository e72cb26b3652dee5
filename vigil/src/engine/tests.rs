use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use super::*;
use crate::{
    clock::ManualClock,
    collaborator::{BackendManager, DrawBatcher, MemoryProbe, RecoveryOutcomeSink, ReportSink},
    draw::{PatternHash, PrimitiveType},
    error::ManagerResult,
    issue::{HealthIssue, RecoveryStrategy, TimingIssue},
    recovery::RecoveryOutcome,
    report::DiagnosticsReport,
};

const DRAW: CallKey = CallKey::new(Backend::Vulkan, CallCategory::DrawIndexed, "vkCmdDrawIndexed");
const UPLOAD: CallKey = CallKey::new(Backend::Vulkan, CallCategory::BufferUpload, "vkCmdCopyBuffer");
const MS: Duration = Duration::from_millis(1);

#[derive(Default)]
struct CountingManager {
    flushes: AtomicUsize,
    collections: AtomicUsize,
    evictions: AtomicUsize,
}

impl BackendManager for CountingManager {
    fn flush(&self) -> ManagerResult {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn collect_garbage(&self) -> ManagerResult {
        self.collections.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict_resources(&self) -> ManagerResult {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReports(Mutex<Vec<DiagnosticsReport>>);

impl ReportSink for RecordingReports {
    fn deliver(&self, report: &DiagnosticsReport) {
        self.0.lock().push(report.clone());
    }
}

#[derive(Default)]
struct RecordingOutcomes(Mutex<Vec<RecoveryOutcome>>);

impl RecoveryOutcomeSink for RecordingOutcomes {
    fn record(&self, outcome: &RecoveryOutcome) {
        self.0.lock().push(outcome.clone());
    }
}

#[derive(Default)]
struct MockBatcher {
    cached: AtomicUsize,
    executed: AtomicUsize,
    fail_execution: AtomicBool,
}

impl DrawBatcher for MockBatcher {
    fn cache_indirect(
        &self,
        _pattern: PatternHash,
        _descriptor: &DrawDescriptor,
        _batch_size: u32,
    ) -> ManagerResult {
        self.cached.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute_indirect(&self, _pattern: PatternHash, _call: &DrawCall) -> ManagerResult {
        if self.fail_execution.load(Ordering::Relaxed) {
            return Err("indirect buffer lost".into());
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct FixedMemory(f64);

impl MemoryProbe for FixedMemory {
    fn usage_ratio(&self) -> Option<f64> {
        Some(self.0)
    }
}

struct Harness {
    vigil: Vigil,
    clock: Arc<ManualClock>,
    manager: Arc<CountingManager>,
    reports: Arc<RecordingReports>,
    outcomes: Arc<RecordingOutcomes>,
}

fn harness(configure: impl FnOnce(&mut VigilConfig)) -> Harness {
    let mut config = VigilConfig::deterministic();
    configure(&mut config);
    let clock = Arc::new(ManualClock::new(1_000_000_000));
    let manager = Arc::new(CountingManager::default());
    let reports = Arc::new(RecordingReports::default());
    let outcomes = Arc::new(RecordingOutcomes::default());
    let vigil = Vigil::builder()
        .config(config)
        .clock(clock.clone())
        .backend_manager(Backend::Vulkan, manager.clone())
        .report_sink(reports.clone())
        .outcome_sink(outcomes.clone())
        .build()
        .expect("deterministic configuration is valid");
    Harness {
        vigil,
        clock,
        manager,
        reports,
        outcomes,
    }
}

#[test]
fn relative_spike_flows_through_reports_and_recovery() {
    let h = harness(|_| {});
    for _ in 0..1000 {
        let analysis = h.vigil.observe(&UPLOAD, MS, None);
        assert!(!analysis.is_spike);
    }

    let analysis = h.vigil.observe(&UPLOAD, 20 * MS, None);
    assert!(analysis.is_spike);
    assert_eq!(analysis.kind, IssueKind::Timing(TimingIssue::RelativeSpike));
    assert_eq!(analysis.severity, Severity::Severe);
    assert_eq!(h.vigil.queue_depths().reports, 1);

    assert_eq!(h.vigil.drain_reports(), 1);
    assert_eq!(h.reports.0.lock().len(), 1);
    assert_eq!(h.vigil.queue_depths().recoveries, 1);

    assert_eq!(h.vigil.drain_recoveries(), 1);
    assert_eq!(h.manager.flushes.load(Ordering::Relaxed), 1);
    let outcomes = h.outcomes.0.lock();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].strategy, RecoveryStrategy::EmergencyFlush);
    assert!(outcomes[0].succeeded());

    let stats = h.vigil.snapshot(&UPLOAD).expect("tracked");
    assert_eq!(stats.count, 1001);
    assert_eq!(stats.spike_count, 1);
}

#[test]
fn breaker_opens_and_rejects_pinned_calls() {
    let h = harness(|config| config.breaker.failure_threshold = 6);
    for _ in 0..6 {
        let result: Result<(), CallError<String>> =
            h.vigil.profile_pinned(&UPLOAD, || Err("boom".to_owned()));
        assert!(matches!(result, Err(CallError::Failed(_))));
    }
    assert_eq!(h.vigil.breaker_state(Backend::Vulkan), BreakerState::Open);

    let ran = AtomicBool::new(false);
    let result: Result<(), CallError<String>> = h.vigil.profile_pinned(&UPLOAD, || {
        ran.store(true, Ordering::Relaxed);
        Ok(())
    });
    assert!(result.is_err_and(|err| err.is_blocked()));
    assert!(!ran.load(Ordering::Relaxed));
    assert_eq!(h.vigil.counters().calls_rejected, 1);
}

#[test]
fn open_breaker_reroutes_to_fallback() {
    let h = harness(|_| {});
    for _ in 0..5 {
        let _ = h
            .vigil
            .profile(&UPLOAD, |_| -> Result<(), String> { Err("boom".to_owned()) });
    }
    assert_eq!(h.vigil.breaker_state(Backend::Vulkan), BreakerState::Open);

    let result: Result<Backend, CallError<String>> = h.vigil.profile(&UPLOAD, Ok);
    assert_eq!(result.ok(), Some(Backend::OpenGl));
    assert_eq!(h.vigil.counters().calls_rerouted, 1);
    assert!(h.vigil.snapshot(&UPLOAD.with_backend(Backend::OpenGl)).is_some());

    // Later reroutes inside the window are counted but not re-reported.
    let deduplicated = h.vigil.counters().reports_deduplicated;
    let queued = h.vigil.queue_depths().reports;
    let result: Result<Backend, CallError<String>> = h.vigil.profile(&UPLOAD, Ok);
    assert_eq!(result.ok(), Some(Backend::OpenGl));
    assert_eq!(h.vigil.counters().calls_rerouted, 2);
    assert_eq!(h.vigil.counters().reports_deduplicated, deduplicated + 1);
    assert_eq!(h.vigil.queue_depths().reports, queued);
}

#[test]
fn catastrophic_stall_is_delivered_immediately() {
    let h = harness(|_| {});
    let analysis = h.vigil.observe(&UPLOAD, 300 * MS, None);
    assert_eq!(analysis.severity, Severity::Critical);

    assert_eq!(h.vigil.queue_depths().reports, 0);
    assert_eq!(h.reports.0.lock().len(), 1);
    assert_eq!(h.manager.flushes.load(Ordering::Relaxed), 1);
    assert_eq!(h.vigil.counters().notifications, 1);
}

#[test]
fn reports_are_deduplicated_within_the_window() {
    let h = harness(|_| {});
    h.vigil.observe(&UPLOAD, 20 * MS, None);
    h.vigil.observe(&UPLOAD, 20 * MS, None);
    assert_eq!(h.vigil.queue_depths().reports, 1);
    assert_eq!(h.vigil.counters().reports_deduplicated, 1);

    h.clock.advance(Duration::from_secs(6));
    h.vigil.observe(&UPLOAD, 20 * MS, None);
    assert_eq!(h.vigil.queue_depths().reports, 2);
}

#[test]
fn gpu_heavy_frame_is_gpu_bound() {
    let h = harness(|_| {});
    h.vigil.begin_frame();
    h.vigil.observe(&DRAW, 9 * MS, None);
    h.vigil.observe(&UPLOAD, MS, None);
    let frame = h.vigil.end_frame(10 * MS);

    assert!(frame.is_gpu_bound());
    assert!((frame.gpu_ratio - 0.9).abs() < 1e-9);
    assert_eq!(frame.draw_calls, 1);
    assert_eq!(h.vigil.last_frame().map(|last| last.index), Some(frame.index));
}

#[test]
fn repeated_draws_switch_to_the_batched_path() {
    let h = harness(|_| {});
    let batcher = Arc::new(MockBatcher::default());
    h.vigil
        .set_draw_batcher(batcher.clone())
        .expect("engine is running");
    let descriptor = DrawDescriptor {
        primitive: PrimitiveType::Triangles,
        shader_id: 7,
        vertex_source_id: 3,
        texture_set_hash: 11,
        uniform_set_hash: 13,
    };
    let call = DrawCall {
        vertex_count: 36,
        instance_count: 1,
    };

    for _ in 0..8 {
        let path = h
            .vigil
            .profile_draw(&DRAW, &descriptor, call, |_| Ok::<_, String>(()));
        assert_eq!(path.ok(), Some(DrawPath::Direct));
    }
    assert_eq!(batcher.cached.load(Ordering::Relaxed), 1);

    let path = h.vigil.profile_draw(&DRAW, &descriptor, call, |_| -> Result<(), String> {
        panic!("direct path must not run")
    });
    assert_eq!(path.ok(), Some(DrawPath::Batched));
    assert_eq!(batcher.executed.load(Ordering::Relaxed), 1);

    batcher.fail_execution.store(true, Ordering::Relaxed);
    let path = h
        .vigil
        .profile_draw(&DRAW, &descriptor, call, |_| Ok::<_, String>(()));
    assert_eq!(path.ok(), Some(DrawPath::Direct));
    assert_eq!(h.vigil.counters().batched_fallbacks, 1);
    assert!(!h.vigil.core.draw.is_cached(descriptor.pattern_hash()));
}

#[test]
fn excessive_draws_raise_pressure_reports() {
    let h = harness(|config| {
        config.draw.warning_draws = 10;
        config.draw.critical_draws = 20;
        config.draw.emergency_draws = 30;
    });
    let descriptor = DrawDescriptor {
        primitive: PrimitiveType::Triangles,
        shader_id: 1,
        vertex_source_id: 1,
        texture_set_hash: 0,
        uniform_set_hash: 0,
    };
    for _ in 0..25 {
        let _ = h.vigil.profile_draw(&DRAW, &descriptor, DrawCall::default(), |_| {
            Ok::<_, String>(())
        });
    }
    let summary = h.vigil.finalize_frame_draw_analysis(16 * MS);
    assert_eq!(summary.draw_calls, 25);
    assert_eq!(summary.pressure, DrawPressure::Critical);
    assert_eq!(summary.batchable_draws, 25);
    assert_eq!(h.vigil.queue_depths().reports, 1);
}

#[test]
fn critical_memory_pressure_runs_emergency_gc() {
    let h = harness(|_| {});
    h.vigil
        .set_memory_probe(Arc::new(FixedMemory(0.95)))
        .expect("engine is running");

    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.memory_ratio, Some(0.95));
    assert_eq!(summary.findings, 1);

    let reports = h.reports.0.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].kind, IssueKind::Health(HealthIssue::MemoryPressure));
    assert_eq!(h.manager.collections.load(Ordering::Relaxed), 1);
    assert_eq!(h.manager.evictions.load(Ordering::Relaxed), 1);
}

#[test]
fn error_codes_feed_the_breaker() {
    let h = harness(|config| config.breaker.failure_threshold = 2);
    assert!(h.vigil.ingest_error_code(&UPLOAD, 123_456).is_none());
    assert_eq!(h.vigil.counters().calls_failed, 0);

    // VK_TIMEOUT
    let analysis = h.vigil.ingest_error_code(&UPLOAD, 2).expect("known code");
    assert_eq!(analysis.severity, Severity::Severe);
    h.vigil.ingest_error_code(&UPLOAD, 2);
    assert_eq!(h.vigil.breaker_state(Backend::Vulkan), BreakerState::Open);
    assert_eq!(h.vigil.snapshot(&UPLOAD).map(|stats| stats.error_count), Some(2));
}

#[test]
fn shutdown_is_idempotent_and_stops_instrumentation() {
    let h = harness(|_| {});
    h.vigil.observe(&UPLOAD, MS, None);
    h.vigil.shutdown();
    h.vigil.shutdown();
    assert!(h.vigil.is_shut_down());
    assert!(h.vigil.snapshot(&UPLOAD).is_none());

    let result: Result<u32, CallError<String>> = h.vigil.profile(&UPLOAD, |_| Ok(4));
    assert_eq!(result.ok(), Some(4));
    assert!(h.vigil.snapshot(&UPLOAD).is_none());
    assert!(matches!(
        h.vigil.set_report_sink(h.reports.clone()),
        Err(VigilError::ShutDown)
    ));
}

#[test]
fn invalid_configuration_is_rejected() {
    let mut config = VigilConfig::deterministic();
    config.breaker.failure_threshold = 0;
    assert!(matches!(
        Vigil::builder().config(config).build(),
        Err(VigilError::InvalidConfig(_))
    ));
}

struct BrokenManager;

impl BackendManager for BrokenManager {
    fn flush(&self) -> ManagerResult {
        Err("queue wedged".into())
    }
}

#[test]
fn failed_recovery_reports_a_follow_up_and_consumes_budget() {
    let h = harness(|config| config.recovery.max_attempts = 2);
    h.vigil
        .set_backend_manager(Backend::Vulkan, Arc::new(BrokenManager))
        .expect("engine is running");

    h.vigil.observe(&UPLOAD, 300 * MS, None);
    assert_eq!(h.vigil.recovery_attempts(&UPLOAD), 1);
    assert_eq!(h.vigil.counters().recoveries_failed, 1);
    // The follow-up is a queued medium report.
    assert_eq!(h.vigil.queue_depths().reports, 1);
    assert_eq!(h.vigil.drain_reports(), 1);
    let reports = h.reports.0.lock();
    assert_eq!(
        reports.last().map(|report| report.kind),
        Some(IssueKind::Recovery(RecoveryIssue::Failed))
    );
    drop(reports);

    h.clock.advance(Duration::from_secs(6));
    h.vigil.observe(&UPLOAD, 300 * MS, None);
    assert_eq!(h.vigil.recovery_attempts(&UPLOAD), 2);

    h.clock.advance(Duration::from_secs(6));
    h.vigil.observe(&UPLOAD, 300 * MS, None);
    assert_eq!(h.vigil.recovery_attempts(&UPLOAD), 2);
    assert_eq!(h.vigil.counters().recoveries_throttled, 1);
}

#[test]
fn maintenance_evicts_quiet_call_sites() {
    let h = harness(|config| {
        config.pipeline.max_tracked_keys = 4;
        config.pipeline.eviction_fraction = 0.25;
    });
    for i in 0..8u64 {
        let key = CallKey::dynamic(Backend::Metal, CallCategory::Query, format!("query_{i}"));
        for _ in 0..=i {
            h.vigil.observe(&key, MS, None);
        }
    }
    let summary = h.vigil.run_maintenance();
    assert!(summary.evicted_keys >= 4);
    assert!(h.vigil.all_snapshots().len() <= 4);
    let busiest = CallKey::dynamic(Backend::Metal, CallCategory::Query, "query_7");
    assert!(h.vigil.snapshot(&busiest).is_some());
}

#[test]
fn background_engine_delivers_without_host_driving() {
    let mut config = VigilConfig::default();
    config.scheduler.tick = Duration::from_millis(5);
    let reports = Arc::new(RecordingReports::default());
    let vigil = Vigil::builder()
        .config(config)
        .memory_probe(Arc::new(FixedMemory(0.1)))
        .report_sink(reports.clone())
        .build()
        .expect("default configuration is valid");

    vigil.observe(&UPLOAD, 300 * MS, None);
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while reports.0.lock().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!reports.0.lock().is_empty());

    vigil.shutdown();
    assert!(vigil.is_shut_down());
}

#[test]
fn escalation_passes_the_dedup_window() {
    let h = harness(|_| {});
    h.vigil.observe(&UPLOAD, 20 * MS, None);
    assert_eq!(h.vigil.queue_depths().reports, 1);
    assert!(h.reports.0.lock().is_empty());

    h.clock.advance(10 * MS);
    let analysis = h.vigil.ingest_error_code(&UPLOAD, -4).expect("known code");
    assert_eq!(analysis.severity, Severity::Critical);

    let counters = h.vigil.counters();
    assert_eq!(counters.reports_deduplicated, 0);
    assert_eq!(counters.notifications, 1);
    assert_eq!(h.reports.0.lock().len(), 1);
    assert_eq!(h.vigil.breaker_state(Backend::Vulkan), BreakerState::Open);

    // The same or a lower severity is still held back.
    h.clock.advance(10 * MS);
    h.vigil.observe(&UPLOAD, 20 * MS, None);
    assert_eq!(h.vigil.counters().reports_deduplicated, 1);
}

fn recorded_strategies(h: &Harness) -> Vec<RecoveryStrategy> {
    h.outcomes.0.lock().iter().map(|outcome| outcome.strategy).collect()
}

fn fail_calls(h: &Harness, count: usize) {
    let failure = FailureInfo::from_error(&"boom");
    for _ in 0..count {
        h.vigil.observe(&UPLOAD, MS, Some(&failure));
    }
}

#[test]
fn unstable_frame_times_warn_then_downgrade_quality() {
    let h = harness(|_| {});
    for i in 0..10 {
        h.vigil.record_frame_time(if i % 2 == 0 { 14 * MS } else { 26 * MS });
    }
    let summary = h.vigil.run_monitor_cycle();
    let cv = summary.frame_time_cv.expect("enough frames");
    assert!(cv >= 0.25 && cv < 0.5);
    assert_eq!(summary.findings, 1);
    assert_eq!(h.vigil.queue_depths().reports, 1);
    assert!(recorded_strategies(&h).is_empty());

    let h = harness(|_| {});
    for i in 0..10 {
        h.vigil.record_frame_time(if i % 2 == 0 { 5 * MS } else { 45 * MS });
    }
    let summary = h.vigil.run_monitor_cycle();
    assert!(summary.frame_time_cv.is_some_and(|cv| cv >= 0.5));
    assert_eq!(summary.findings, 1);
    assert_eq!(
        h.reports.0.lock()[0].kind,
        IssueKind::Health(HealthIssue::FrameTimeInstability)
    );
    assert_eq!(recorded_strategies(&h), vec![RecoveryStrategy::DowngradeQuality]);
}

#[test]
fn spike_frame_streak_warns_then_flushes_and_collects() {
    let h = harness(|_| {});
    for _ in 0..3 {
        h.vigil.record_frame_time(40 * MS);
    }
    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.consecutive_spike_frames, 3);
    assert_eq!(summary.findings, 1);
    assert_eq!(h.manager.flushes.load(Ordering::Relaxed), 0);

    for _ in 0..5 {
        h.vigil.record_frame_time(40 * MS);
    }
    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.consecutive_spike_frames, 8);
    assert_eq!(summary.findings, 1);
    assert_eq!(h.manager.flushes.load(Ordering::Relaxed), 1);
    assert_eq!(h.manager.collections.load(Ordering::Relaxed), 1);
    assert_eq!(
        recorded_strategies(&h),
        vec![RecoveryStrategy::EmergencyFlush, RecoveryStrategy::EmergencyGc]
    );
}

#[test]
fn failure_bursts_warn_then_degrade_and_reset_per_cycle() {
    let h = harness(|config| config.breaker.failure_threshold = 100);
    fail_calls(&h, 5);
    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.errors, 5);
    assert_eq!(summary.findings, 1);
    assert!(recorded_strategies(&h).is_empty());

    fail_calls(&h, 20);
    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.errors, 20);
    assert_eq!(summary.findings, 1);
    assert_eq!(recorded_strategies(&h), vec![RecoveryStrategy::GracefulDegradation]);

    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.findings, 0);
}

#[test]
fn open_breaker_report_does_not_retrip_half_open() {
    let h = harness(|config| {
        config.monitor.errors_warning = 100;
        config.monitor.errors_critical = 200;
    });
    fail_calls(&h, 5);
    assert_eq!(h.vigil.breaker_state(Backend::Vulkan), BreakerState::Open);

    let summary = h.vigil.run_monitor_cycle();
    assert_eq!(summary.open_backends.as_slice(), &[Backend::Vulkan]);
    assert_eq!(summary.findings, 1);

    // Deliver the report while the half-open trial call is in flight.
    h.clock.advance(Duration::from_secs(6));
    let result: Result<(), CallError<String>> = h.vigil.profile_pinned(&UPLOAD, || {
        h.vigil.drain_reports();
        Ok(())
    });
    assert!(result.is_ok());
    assert!(
        h.reports
            .0
            .lock()
            .iter()
            .any(|report| report.kind == IssueKind::Health(HealthIssue::CircuitOpen))
    );
    assert_eq!(h.vigil.breaker_state(Backend::Vulkan), BreakerState::Closed);
}

#[test]
fn nearing_the_draw_warning_requests_optimization_once() {
    let h = harness(|config| {
        config.draw.warning_draws = 10;
        config.draw.critical_draws = 20;
        config.draw.emergency_draws = 30;
        config.draw.min_occurrences = 1_000;
    });
    h.vigil
        .set_draw_batcher(Arc::new(MockBatcher::default()))
        .expect("engine is running");
    let descriptor = DrawDescriptor {
        primitive: PrimitiveType::Lines,
        shader_id: 2,
        vertex_source_id: 2,
        texture_set_hash: 0,
        uniform_set_hash: 0,
    };
    let draw = |count: usize| {
        for _ in 0..count {
            let _ = h.vigil.profile_draw(&DRAW, &descriptor, DrawCall::default(), |_| {
                Ok::<_, String>(())
            });
        }
    };

    draw(5);
    assert!(!h.vigil.run_monitor_cycle().preemptive_optimization);

    draw(4);
    assert!(h.vigil.run_monitor_cycle().preemptive_optimization);
    // Rate limited within the optimization interval.
    assert!(!h.vigil.run_monitor_cycle().preemptive_optimization);
}
