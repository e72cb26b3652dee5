//! The engine: profiling entry points, frame hooks, wiring and queries.
//!
//! ## Usage
//!
//! Build one [`Vigil`] per GPU pipeline and share it by reference.
//!
//! ```
//! use vigil::{Backend, CallCategory, CallKey, Vigil, VigilConfig};
//!
//! const SUBMIT: CallKey = CallKey::new(Backend::Vulkan, CallCategory::QueueSubmit, "vkQueueSubmit");
//!
//! let vigil = Vigil::builder()
//!     .config(VigilConfig::deterministic())
//!     .build()
//!     .expect("valid configuration");
//!
//! let submitted: Result<u32, vigil::CallError<String>> = vigil.profile(&SUBMIT, |backend| {
//!     assert_eq!(backend, Backend::Vulkan);
//!     Ok(1)
//! });
//! assert_eq!(submitted.ok(), Some(1));
//! assert_eq!(vigil.snapshot(&SUBMIT).map(|stats| stats.count), Some(1));
//! ```

use std::{
    borrow::Cow,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    breaker::{BreakerBank, BreakerSnapshot, BreakerState},
    call_key::{Backend, CallCategory, CallKey},
    classify::{
        Diagnosable, FailureInfo, SpikeAnalysis, analyze_timing, classify_error_code,
        classify_failure,
    },
    clock::{Clock, MonotonicClock, duration_nanos, elapsed_since},
    collaborator::{
        BackendManager, CapabilitySource, Collaborators, DrawBatcher, MemoryProbe,
        NotificationSink, RecoveryOutcomeSink, ReportSink, ShaderManager, call_hook, guarded,
    },
    config::{SchedulerMode, VigilConfig},
    counters::{Counters, CountersSnapshot},
    draw::{DrawCall, DrawDescriptor, DrawFrameSummary, DrawPath, DrawPressure, DrawTracker, PatternSummary},
    error::{CallError, VigilError},
    export,
    frame::{FrameAccumulator, FrameAnalysis},
    issue::{DrawIssue, IssueKind, PerformanceIssue, RecoveryIssue, Severity},
    monitor::{self, MonitorState, MonitorSummary, SystemMemoryProbe},
    pipeline::{self, Job, Pipeline, QueueDepths, worker::WorkerPool},
    recovery::RecoveryTrackers,
    report::ReportDraft,
    scheduler::{self, MaintenanceSummary, Scheduler, TickSummary},
    stats::{CallStatsSnapshot, StatsStore},
};

#[cfg(test)]
mod tests;

/// State shared by the engine handle, the workers and the scheduler.
pub(crate) struct Core {
    pub(crate) config: VigilConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) stats: StatsStore,
    pub(crate) breakers: BreakerBank,
    pub(crate) pipeline: Pipeline,
    pub(crate) trackers: RecoveryTrackers,
    pub(crate) collaborators: Collaborators,
    pub(crate) frame: FrameAccumulator,
    pub(crate) draw: DrawTracker,
    pub(crate) monitor: MonitorState,
    pub(crate) counters: Counters,
    active_backend: AtomicU8,
    shut_down: AtomicBool,
}

impl Core {
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_nanos()
    }

    /// Backend that frame-level findings are attributed to.
    pub(crate) fn active_backend(&self) -> Backend {
        Backend::ALL
            .get(usize::from(self.active_backend.load(Ordering::Relaxed)))
            .copied()
            .unwrap_or(self.config.primary_backend)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Builder for a [`Vigil`] engine.
pub struct VigilBuilder {
    config: VigilConfig,
    clock: Option<Arc<dyn Clock>>,
    collaborators: Collaborators,
    memory_probe_set: bool,
}

impl VigilBuilder {
    fn new() -> Self {
        Self {
            config: VigilConfig::default(),
            clock: None,
            collaborators: Collaborators::default(),
            memory_probe_set: false,
        }
    }

    /// Overrides the configuration.
    pub fn config(mut self, config: VigilConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Registers the recovery primitives of `backend`.
    pub fn backend_manager(self, backend: Backend, manager: Arc<dyn BackendManager>) -> Self {
        self.collaborators.manager_slot(backend).set(Some(manager));
        self
    }

    /// Registers the shader manager.
    pub fn shader_manager(self, manager: Arc<dyn ShaderManager>) -> Self {
        self.collaborators.shader_manager.set(Some(manager));
        self
    }

    /// Registers the capability source consulted when rerouting.
    pub fn capability_source(self, source: Arc<dyn CapabilitySource>) -> Self {
        self.collaborators.capability.set(Some(source));
        self
    }

    /// Registers the draw batcher.
    pub fn draw_batcher(self, batcher: Arc<dyn DrawBatcher>) -> Self {
        self.collaborators.draw_batcher.set(Some(batcher));
        self
    }

    /// Registers the memory probe. Without one, background engines probe
    /// system memory and manual engines skip the memory check.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.collaborators.memory_probe.set(Some(probe));
        self.memory_probe_set = true;
        self
    }

    /// Replaces the default report sink.
    pub fn report_sink(self, sink: Arc<dyn ReportSink>) -> Self {
        self.collaborators.report_sink.set(Some(sink));
        self
    }

    /// Replaces the default notification sink.
    pub fn notification_sink(self, sink: Arc<dyn NotificationSink>) -> Self {
        self.collaborators.notification_sink.set(Some(sink));
        self
    }

    /// Replaces the default recovery outcome sink.
    pub fn outcome_sink(self, sink: Arc<dyn RecoveryOutcomeSink>) -> Self {
        self.collaborators.outcome_sink.set(Some(sink));
        self
    }

    /// Validates the configuration and starts the engine.
    pub fn build(self) -> Result<Vigil, VigilError> {
        let Self {
            config,
            clock,
            collaborators,
            memory_probe_set,
        } = self;
        config.validate()?;

        let background = config.scheduler.mode == SchedulerMode::Background;
        if background && !memory_probe_set {
            collaborators
                .memory_probe
                .set(Some(Arc::new(SystemMemoryProbe) as Arc<dyn MemoryProbe>));
        }

        let core = Arc::new(Core {
            clock: clock.unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            stats: StatsStore::new(
                config.spike.ewma_alpha,
                config.pipeline.max_tracked_keys,
                config.pipeline.eviction_fraction,
            ),
            breakers: BreakerBank::new(&config.breaker),
            pipeline: Pipeline::new(&config.pipeline),
            trackers: RecoveryTrackers::new(config.recovery.clone()),
            collaborators,
            frame: FrameAccumulator::new(config.frame.clone()),
            draw: DrawTracker::new(config.draw.clone()),
            monitor: MonitorState::default(),
            counters: Counters::default(),
            active_backend: AtomicU8::new(config.primary_backend.index() as u8),
            shut_down: AtomicBool::new(false),
            config,
        });

        let workers = match core.config.pipeline.worker_threads {
            0 => WorkerPool::inline(),
            threads => WorkerPool::spawn(&core, threads)?,
        };
        let scheduler = if background {
            Scheduler::spawn(&core)?
        } else {
            Scheduler::manual()
        };
        debug!(
            workers = workers.len(),
            scheduler = scheduler.is_running(),
            "vigil engine started"
        );

        Ok(Vigil {
            core,
            workers: Mutex::new(workers),
            scheduler: Mutex::new(scheduler),
        })
    }
}

/// GPU call health monitor.
///
/// Cheap to share by reference across submission threads; every method takes
/// `&self`.
pub struct Vigil {
    core: Arc<Core>,
    workers: Mutex<WorkerPool>,
    scheduler: Mutex<Scheduler>,
}

impl Vigil {
    /// Starts building an engine.
    pub fn builder() -> VigilBuilder {
        VigilBuilder::new()
    }

    // Profiling ----------------------------------------------------------

    /// Runs `op` on the backend the breakers allow: the key's own backend, or
    /// a fallback when its breaker is open. The failure of `op` is returned
    /// unchanged; [`CallError::NoRecoveryPath`] means nothing ran.
    pub fn profile<T, E, F>(&self, key: &CallKey, op: F) -> Result<T, CallError<E>>
    where
        E: Diagnosable,
        F: FnOnce(Backend) -> Result<T, E>,
    {
        self.execute(key, op).map(|(value, _)| value)
    }

    /// Runs `op`, which cannot move to another backend. A call rejected by the
    /// breaker fails with [`CallError::NoRecoveryPath`].
    pub fn profile_pinned<T, E, F>(&self, key: &CallKey, op: F) -> Result<T, CallError<E>>
    where
        E: Diagnosable,
        F: FnOnce() -> Result<T, E>,
    {
        let core = &self.core;
        if core.is_shut_down() {
            return op().map_err(CallError::Failed);
        }
        let backend = key.backend();
        if !core.breakers.get(backend).should_allow(core.now()) {
            core.counters.calls_rejected();
            return Err(CallError::NoRecoveryPath {
                key: key.clone(),
                backend,
            });
        }
        self.timed(key, |_| op()).map(|(value, _)| value)
    }

    /// Runs a draw, through the batched path when one is cached for its
    /// pattern and the backend is healthy, otherwise through `op`.
    pub fn profile_draw<E, F>(
        &self,
        key: &CallKey,
        descriptor: &DrawDescriptor,
        call: DrawCall,
        op: F,
    ) -> Result<DrawPath, CallError<E>>
    where
        E: Diagnosable,
        F: FnOnce(Backend) -> Result<(), E>,
    {
        let core = &self.core;
        if core.is_shut_down() {
            return op(key.backend())
                .map(|()| DrawPath::Direct)
                .map_err(CallError::Failed);
        }

        let pattern = descriptor.pattern_hash();
        if core.draw.is_cached(pattern)
            && core.breakers.get(key.backend()).state() == BreakerState::Closed
            && let Some(batcher) = core.collaborators.draw_batcher.get()
        {
            let started = core.now();
            match call_hook("execute_indirect", || batcher.execute_indirect(pattern, &call)) {
                Ok(()) => {
                    let elapsed = elapsed_since(core.now(), started);
                    core.counters.batched_draws();
                    self.complete(key, elapsed, None);
                    self.track_draw(descriptor, call, elapsed, true);
                    return Ok(DrawPath::Batched);
                }
                Err(err) => {
                    core.counters.batched_fallbacks();
                    warn!(%pattern, "batched draw failed, falling back to direct path: {err}");
                    core.draw.invalidate(pattern);
                    guarded("draw batcher", || batcher.invalidate(pattern));
                }
            }
        }

        let ((), elapsed) = self.execute(key, op)?;
        self.track_draw(descriptor, call, elapsed, false);
        Ok(DrawPath::Direct)
    }

    /// Feeds an externally timed call into the engine.
    pub fn observe(
        &self,
        key: &CallKey,
        duration: Duration,
        failure: Option<&FailureInfo>,
    ) -> SpikeAnalysis {
        if self.core.is_shut_down() {
            return SpikeAnalysis::none();
        }
        self.complete(key, duration_nanos(duration), failure)
    }

    /// Records a backend-native error code reported for `key`. Returns the
    /// classification, or `None` for codes with no known meaning.
    pub fn ingest_error_code(&self, key: &CallKey, code: i64) -> Option<SpikeAnalysis> {
        let core = &self.core;
        if core.is_shut_down() {
            return None;
        }
        let Some(analysis) = classify_error_code(key.backend(), code) else {
            debug!(%key, code, "ignoring unknown error code");
            return None;
        };
        let now = core.now();
        let stats = core.stats.entry(key);
        let before = stats.snapshot(core.config.spike.trend_slope_ratio);
        stats.record_error();
        self.record_failure(key, now);
        if analysis.is_spike {
            core.frame.tag(analysis.kind);
            let draft = ReportDraft::from_analysis(key.clone(), &analysis, 0, before, now)
                .with_error_code(code);
            pipeline::submit(core, draft);
        }
        Some(analysis)
    }

    fn execute<T, E, F>(&self, key: &CallKey, op: F) -> Result<(T, u64), CallError<E>>
    where
        E: Diagnosable,
        F: FnOnce(Backend) -> Result<T, E>,
    {
        let core = &self.core;
        if core.is_shut_down() {
            return op(key.backend())
                .map(|value| (value, 0))
                .map_err(CallError::Failed);
        }
        let Some(backend) = self.route(key) else {
            return Err(CallError::NoRecoveryPath {
                key: key.clone(),
                backend: key.backend(),
            });
        };
        let routed: Cow<'_, CallKey> = if backend == key.backend() {
            Cow::Borrowed(key)
        } else {
            Cow::Owned(key.with_backend(backend))
        };
        self.timed(&routed, op)
    }

    fn timed<T, E, F>(&self, key: &CallKey, op: F) -> Result<(T, u64), CallError<E>>
    where
        E: Diagnosable,
        F: FnOnce(Backend) -> Result<T, E>,
    {
        let clock = &self.core.clock;
        let started = clock.now_nanos();
        let result = op(key.backend());
        let elapsed = elapsed_since(clock.now_nanos(), started);
        match result {
            Ok(value) => {
                self.complete(key, elapsed, None);
                Ok((value, elapsed))
            }
            Err(err) => {
                self.complete(key, elapsed, Some(&FailureInfo::from_error(&err)));
                Err(CallError::Failed(err))
            }
        }
    }

    /// Picks the backend for `key`, reporting reroutes.
    fn route(&self, key: &CallKey) -> Option<Backend> {
        let core = &self.core;
        let now = core.now();
        let backend = key.backend();
        let category = key.category();
        let routed = core
            .breakers
            .route(backend, &core.config.fallback, now, |candidate| {
                core.collaborators.is_usable(candidate, category)
            });
        match routed {
            Some(target) if target == backend => Some(target),
            Some(target) => {
                core.counters.calls_rerouted();
                pipeline::submit_with(core, key, Severity::Low, now, || {
                    ReportDraft::advisory(
                        key.clone(),
                        IssueKind::Recovery(RecoveryIssue::FallbackActivated),
                        Severity::Low,
                        format!("circuit open on {backend}, rerouted to {target}"),
                        now,
                    )
                    .with_metadata("target", target)
                });
                Some(target)
            }
            None => {
                core.counters.calls_rejected();
                None
            }
        }
    }

    /// Records a finished call and classifies it.
    fn complete(
        &self,
        key: &CallKey,
        elapsed_nanos: u64,
        failure: Option<&FailureInfo>,
    ) -> SpikeAnalysis {
        let core = &self.core;
        core.counters.calls_observed();
        let now = core.now();
        let stats = core.stats.entry(key);
        let before = stats.snapshot(core.config.spike.trend_slope_ratio);
        stats.record(elapsed_nanos, now);
        core.frame.record_call(key.category(), elapsed_nanos);

        let analysis = match failure {
            None => {
                core.breakers.get(key.backend()).record_success();
                analyze_timing(key, elapsed_nanos, &before, &core.config.spike)
            }
            Some(failure) => {
                stats.record_error();
                self.record_failure(key, now);
                classify_failure(key, failure)
            }
        };
        if !analysis.is_spike {
            return analysis;
        }
        if failure.is_none() {
            stats.record_spike(now);
        }
        core.frame.tag(analysis.kind);

        let mut draft = ReportDraft::from_analysis(key.clone(), &analysis, elapsed_nanos, before, now);
        if let Some(failure) = failure {
            draft = draft.with_failure(failure);
        }
        pipeline::submit(core, draft);
        analysis
    }

    fn record_failure(&self, key: &CallKey, now: u64) {
        let core = &self.core;
        core.counters.calls_failed();
        core.monitor.record_error();
        core.breakers.get(key.backend()).record_failure(now);
    }

    fn track_draw(&self, descriptor: &DrawDescriptor, call: DrawCall, elapsed: u64, batched: bool) {
        let core = &self.core;
        let Some(request) = core.draw.observe(descriptor, call, elapsed, batched, core.now()) else {
            return;
        };
        if core.collaborators.draw_batcher.get().is_none() {
            core.draw.set_cached(request.pattern, false);
            return;
        }
        pipeline::post_job(
            core,
            Job::CachePattern {
                pattern: request.pattern,
                descriptor: request.descriptor,
                batch_size: request.batch_size,
            },
        );
    }

    // Frame hooks --------------------------------------------------------

    /// Starts a frame, discarding anything accumulated since the last one.
    pub fn begin_frame(&self) {
        self.core.frame.begin_frame();
    }

    /// Finishes a frame that took `total` and classifies it.
    pub fn end_frame(&self, total: Duration) -> FrameAnalysis {
        let core = &self.core;
        let analysis = core.frame.end_frame(duration_nanos(total));
        if core.is_shut_down() {
            return analysis;
        }
        let backend = core.active_backend();
        let now = core.now();
        for &bottleneck in &analysis.bottlenecks {
            let kind = IssueKind::Performance(bottleneck);
            let share = match bottleneck {
                PerformanceIssue::GpuBound => analysis.gpu_ratio,
                PerformanceIssue::CpuBound => analysis.cpu_ratio,
                PerformanceIssue::BandwidthBound => analysis.sync_ratio,
            };
            let draft = ReportDraft::advisory(
                CallKey::new(backend, CallCategory::Frame, kind.label()),
                kind,
                Severity::Low,
                format!("frame {} spent {:.0}% of its time here", analysis.index, share * 100.0),
                now,
            )
            .with_metadata("frame", analysis.index);
            pipeline::submit(core, draft);
        }
        analysis
    }

    /// Appends a frame time without frame-level accounting. Returns whether the
    /// frame was a spike frame.
    pub fn record_frame_time(&self, total: Duration) -> bool {
        self.core.frame.record_frame_time(duration_nanos(total))
    }

    /// Clears the per-frame draw counters.
    pub fn reset_frame_draw_counters(&self) {
        self.core.draw.reset_frame_counters();
    }

    /// Classifies the draw load of the frame against `frame_time`, asks the
    /// batcher to act on it and resets the per-frame draw counters.
    pub fn finalize_frame_draw_analysis(&self, frame_time: Duration) -> DrawFrameSummary {
        let core = &self.core;
        let now = core.now();
        let summary = core.draw.finalize_frame(duration_nanos(frame_time), now);
        if core.is_shut_down() {
            return summary;
        }
        let has_batcher = core.collaborators.draw_batcher.get().is_some();
        if summary.optimization_requested && has_batcher {
            pipeline::post_job(core, Job::Optimize(core.draw.summaries()));
        }
        if summary.emergency_batch && has_batcher {
            pipeline::post_job(core, Job::EmergencyBatch);
        }

        let (name, severity) = match summary.pressure {
            DrawPressure::Normal => return summary,
            DrawPressure::Warning => ("draw_pressure_warning", Severity::Medium),
            DrawPressure::Critical => ("draw_pressure_critical", Severity::High),
            DrawPressure::Emergency => ("draw_pressure_emergency", Severity::Critical),
        };
        let draft = ReportDraft::advisory(
            CallKey::new(core.active_backend(), CallCategory::Frame, name),
            IssueKind::Draw(DrawIssue::ExcessiveDrawCalls),
            severity,
            format!(
                "{} draw calls ({} batched) took {:.0}% of the frame",
                summary.draw_calls,
                summary.batched_draws,
                summary.time_share * 100.0
            ),
            now,
        )
        .with_metadata("distinct_patterns", summary.distinct_patterns)
        .with_metadata("batchable_draws", summary.batchable_draws);
        pipeline::submit(core, draft);
        summary
    }

    // Wiring -------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), VigilError> {
        if self.core.is_shut_down() {
            Err(VigilError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Registers or replaces the manager of `backend`.
    pub fn set_backend_manager(
        &self,
        backend: Backend,
        manager: Arc<dyn BackendManager>,
    ) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.manager_slot(backend).set(Some(manager));
        Ok(())
    }

    /// Registers or replaces the shader manager.
    pub fn set_shader_manager(&self, manager: Arc<dyn ShaderManager>) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.shader_manager.set(Some(manager));
        Ok(())
    }

    /// Registers or replaces the capability source.
    pub fn set_capability_source(
        &self,
        source: Arc<dyn CapabilitySource>,
    ) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.capability.set(Some(source));
        Ok(())
    }

    /// Registers or replaces the draw batcher.
    pub fn set_draw_batcher(&self, batcher: Arc<dyn DrawBatcher>) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.draw_batcher.set(Some(batcher));
        Ok(())
    }

    /// Registers or replaces the memory probe.
    pub fn set_memory_probe(&self, probe: Arc<dyn MemoryProbe>) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.memory_probe.set(Some(probe));
        Ok(())
    }

    /// Replaces the report sink.
    pub fn set_report_sink(&self, sink: Arc<dyn ReportSink>) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.report_sink.set(Some(sink));
        Ok(())
    }

    /// Replaces the notification sink.
    pub fn set_notification_sink(&self, sink: Arc<dyn NotificationSink>) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.notification_sink.set(Some(sink));
        Ok(())
    }

    /// Replaces the recovery outcome sink.
    pub fn set_outcome_sink(&self, sink: Arc<dyn RecoveryOutcomeSink>) -> Result<(), VigilError> {
        self.ensure_running()?;
        self.core.collaborators.outcome_sink.set(Some(sink));
        Ok(())
    }

    /// Attributes frame-level findings to `backend` from now on.
    pub fn set_active_backend(&self, backend: Backend) {
        self.core
            .active_backend
            .store(backend.index() as u8, Ordering::Relaxed);
    }

    /// Direct access to the collaborator slots, e.g. to unregister one.
    pub fn collaborators(&self) -> &Collaborators {
        &self.core.collaborators
    }

    // Queries ------------------------------------------------------------

    /// Statistics of one call site.
    pub fn snapshot(&self, key: &CallKey) -> Option<CallStatsSnapshot> {
        self.core
            .stats
            .get(key)
            .map(|stats| stats.snapshot(self.core.config.spike.trend_slope_ratio))
    }

    /// Statistics of every tracked call site.
    pub fn all_snapshots(&self) -> Vec<(CallKey, CallStatsSnapshot)> {
        self.core
            .stats
            .snapshot_all(self.core.config.spike.trend_slope_ratio)
    }

    /// State of every breaker.
    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.core.breakers.snapshots()
    }

    /// State of one breaker.
    pub fn breaker_state(&self, backend: Backend) -> BreakerState {
        self.core.breakers.get(backend).state()
    }

    /// Depth of each pipeline queue.
    pub fn queue_depths(&self) -> QueueDepths {
        self.core.pipeline.depths()
    }

    /// Engine-wide counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.core.counters.snapshot()
    }

    /// Tracked draw patterns, most frequent first.
    pub fn pattern_summaries(&self) -> Vec<PatternSummary> {
        self.core.draw.summaries()
    }

    /// The most recently finished frame.
    pub fn last_frame(&self) -> Option<FrameAnalysis> {
        self.core.frame.last()
    }

    /// Recovery attempts consumed by `key` in its current window.
    pub fn recovery_attempts(&self, key: &CallKey) -> u32 {
        self.core.trackers.attempts(key)
    }

    /// Human-readable summary of the engine state.
    pub fn export_diagnostics(&self) -> String {
        export::render(&self.core)
    }

    // Driving ------------------------------------------------------------

    /// Drains one batch of reports and recovery tasks.
    pub fn tick(&self) -> TickSummary {
        scheduler::tick(&self.core)
    }

    /// Delivers one batch of queued reports.
    pub fn drain_reports(&self) -> usize {
        guarded("report drain", || pipeline::drain_reports(&self.core)).unwrap_or(0)
    }

    /// Hands one batch of queued recovery tasks to the workers, or runs them
    /// when there are none.
    pub fn drain_recoveries(&self) -> usize {
        guarded("recovery drain", || pipeline::drain_recoveries(&self.core)).unwrap_or(0)
    }

    /// Runs one maintenance pass.
    pub fn run_maintenance(&self) -> MaintenanceSummary {
        scheduler::run_maintenance(&self.core)
    }

    /// Runs one monitoring cycle.
    pub fn run_monitor_cycle(&self) -> MonitorSummary {
        monitor::run_cycle(&self.core)
    }

    // Lifecycle ----------------------------------------------------------

    /// Stops the scheduler and workers and clears every in-memory state,
    /// including registered collaborators. Idempotent. Profiling entry points
    /// keep running the wrapped operations afterwards, without instrumentation.
    pub fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.lock().stop();
        self.workers.lock().stop();

        let core = &self.core;
        core.pipeline.clear();
        core.stats.clear();
        core.trackers.clear();
        core.frame.clear();
        core.draw.clear();
        core.monitor.clear();
        core.breakers.reset_all();
        core.counters.clear();
        core.collaborators.clear();
        debug!("vigil engine shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.core.is_shut_down()
    }
}

impl Drop for Vigil {
    fn drop(&mut self) {
        self.shutdown();
    }
}
