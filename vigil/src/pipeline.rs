//! Diagnostics pipeline.
//!
//! ## Usage
//!
//! The hot path calls [`submit`] with a [`ReportDraft`]. After deduplication the
//! draft becomes a [`Job`] on the bounded job queue, where a worker formats it
//! into a [`DiagnosticsReport`]. Critical reports are delivered by the worker
//! right away and get an eager recovery attempt; everything else waits on the
//! report queue until [`drain_reports`] runs. Delivered reports that suggest an
//! actionable strategy are turned into recovery tasks, gated by the recovery
//! budget of their call site, and executed by the workers after
//! [`drain_recoveries`] hands them over.
//!
//! Every queue is bounded and every insertion is `try_send`: a full queue drops
//! the item and bumps a counter, it never blocks the caller.

pub(crate) mod worker;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use tracing::{debug, warn};

use crate::{
    breaker::BreakerState,
    call_key::{Backend, CallKey},
    clock::{duration_nanos, elapsed_since},
    collaborator::guarded,
    config::PipelineConfig,
    draw::{DrawDescriptor, PatternHash, PatternSummary},
    engine::Core,
    issue::{IssueKind, RecoveryIssue, RecoveryStrategy, RoutingDecision, Severity},
    recovery::{self, RecoveryOutcome, RecoveryTask},
    report::{DiagnosticsReport, ReportDraft},
};

/// Work executed by the worker pool.
pub(crate) enum Job {
    /// Format a draft and route the resulting report.
    BuildReport(Box<ReportDraft>),
    /// Execute a recovery task.
    Recover(RecoveryTask),
    /// Ask the draw batcher to prepare a batched path.
    CachePattern {
        pattern: PatternHash,
        descriptor: DrawDescriptor,
        batch_size: u32,
    },
    /// Ask the draw batcher to re-plan.
    Optimize(Vec<PatternSummary>),
    /// Ask the draw batcher to batch aggressively.
    EmergencyBatch,
}

/// Depth of each pipeline queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QueueDepths {
    /// Jobs waiting for a worker.
    pub jobs: usize,
    /// Reports waiting for delivery.
    pub reports: usize,
    /// Recovery tasks waiting for execution.
    pub recoveries: usize,
}

pub(crate) struct Pipeline {
    last_reported: DashMap<CallKey, (u64, Severity), FxBuildHasher>,
    dedup_window: u64,
    next_report_id: AtomicU64,
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    report_tx: Sender<DiagnosticsReport>,
    report_rx: Receiver<DiagnosticsReport>,
    recovery_tx: Sender<RecoveryTask>,
    recovery_rx: Receiver<RecoveryTask>,
    inline: bool,
    drain_batch: usize,
}

impl Pipeline {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        let (job_tx, job_rx) = channel::bounded(config.job_queue_capacity);
        let (report_tx, report_rx) = channel::bounded(config.report_queue_capacity);
        let (recovery_tx, recovery_rx) = channel::bounded(config.recovery_queue_capacity);
        Self {
            last_reported: DashMap::with_hasher(FxBuildHasher),
            dedup_window: duration_nanos(config.dedup_window),
            next_report_id: AtomicU64::new(1),
            job_tx,
            job_rx,
            report_tx,
            report_rx,
            recovery_tx,
            recovery_rx,
            inline: config.worker_threads == 0,
            drain_batch: config.drain_batch.max(1),
        }
    }

    /// Receiving end handed to workers.
    pub(crate) fn jobs(&self) -> Receiver<Job> {
        self.job_rx.clone()
    }

    pub(crate) fn depths(&self) -> QueueDepths {
        QueueDepths {
            jobs: self.job_rx.len(),
            reports: self.report_rx.len(),
            recoveries: self.recovery_rx.len(),
        }
    }

    /// Records a report for `key` at `now` unless one of equal or higher
    /// severity was admitted within the deduplication window.
    fn admit(&self, key: &CallKey, now: u64, severity: Severity) -> bool {
        if let Some(mut last) = self.last_reported.get_mut(key) {
            let (at, admitted) = *last;
            if elapsed_since(now, at) < self.dedup_window && severity <= admitted {
                return false;
            }
            *last = (now, severity);
            return true;
        }
        self.last_reported.insert(key.clone(), (now, severity));
        true
    }

    /// Forgets deduplication entries older than the window.
    pub(crate) fn sweep(&self, now: u64) {
        let window = self.dedup_window;
        self.last_reported
            .retain(|_, (at, _)| elapsed_since(now, *at) < window);
    }

    /// Drops queued work and deduplication state.
    pub(crate) fn clear(&self) {
        self.last_reported.clear();
        while self.job_rx.try_recv().is_ok() {}
        while self.report_rx.try_recv().is_ok() {}
        while self.recovery_rx.try_recv().is_ok() {}
    }

    fn next_id(&self) -> u64 {
        self.next_report_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Hands `draft` to the workers unless a report for the same call site was
/// admitted within the deduplication window. Returns whether it was accepted.
pub(crate) fn submit(core: &Core, draft: ReportDraft) -> bool {
    if !core.pipeline.admit(&draft.key, draft.timestamp_nanos, draft.severity) {
        core.counters.reports_deduplicated();
        return false;
    }
    post_job(core, Job::BuildReport(Box::new(draft)));
    true
}

/// Like [`submit`], but only builds the draft once it has passed
/// deduplication.
pub(crate) fn submit_with(
    core: &Core,
    key: &CallKey,
    severity: Severity,
    now: u64,
    draft: impl FnOnce() -> ReportDraft,
) -> bool {
    if !core.pipeline.admit(key, now, severity) {
        core.counters.reports_deduplicated();
        return false;
    }
    post_job(core, Job::BuildReport(Box::new(draft())));
    true
}

/// Like [`submit`], without deduplication. Used for follow-up events.
fn submit_follow_up(core: &Core, draft: ReportDraft) {
    post_job(core, Job::BuildReport(Box::new(draft)));
}

/// Runs `job` inline when there are no workers, otherwise queues it.
pub(crate) fn post_job(core: &Core, job: Job) {
    if core.pipeline.inline {
        worker::run_job(core, job);
        return;
    }
    match core.pipeline.job_tx.try_send(job) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            core.counters.jobs_dropped();
            debug!("job queue full, dropping job");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Formats a draft. Critical reports skip the queue.
pub(crate) fn build_report(core: &Core, draft: ReportDraft) {
    let report = DiagnosticsReport::build(core.pipeline.next_id(), draft);
    core.counters.reports_built();
    if report.is_critical() {
        deliver(core, &report);
        if report.wants_recovery()
            && let Some(task) = begin_recovery(core, &report)
        {
            post_job(core, Job::Recover(task));
        }
        return;
    }
    match core.pipeline.report_tx.try_send(report) {
        Ok(()) => {}
        Err(TrySendError::Full(report)) => {
            core.counters.reports_dropped();
            debug!(id = report.id, "report queue full, dropping report");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Delivers up to one batch of queued reports. Returns how many were delivered.
pub(crate) fn drain_reports(core: &Core) -> usize {
    let mut delivered = 0;
    while delivered < core.pipeline.drain_batch {
        let Ok(report) = core.pipeline.report_rx.try_recv() else {
            break;
        };
        deliver(core, &report);
        if report.wants_recovery() {
            enqueue_recovery(core, &report);
        }
        delivered += 1;
    }
    delivered
}

/// Hands up to one batch of queued recovery tasks to the workers.
pub(crate) fn drain_recoveries(core: &Core) -> usize {
    let mut handed = 0;
    while handed < core.pipeline.drain_batch {
        let Ok(task) = core.pipeline.recovery_rx.try_recv() else {
            break;
        };
        post_job(core, Job::Recover(task));
        handed += 1;
    }
    handed
}

/// Sends `report` to the sinks and managers and applies its routing decision.
fn deliver(core: &Core, report: &DiagnosticsReport) {
    core.counters.reports_delivered();
    let collaborators = &core.collaborators;
    let backend = report.key.backend();

    if let Some(sink) = collaborators.report_sink.get() {
        guarded("report sink", || sink.deliver(report));
    }
    if let Some(manager) = collaborators.manager(backend) {
        guarded(manager.name(), || manager.handle_diagnostics(report));
    }
    if report.kind.is_shader()
        && let Some(shaders) = collaborators.shader_manager.get()
    {
        guarded("shader manager", || shaders.handle_shader_diagnostics(report));
    }
    if report.severity >= core.config.pipeline.notify_threshold {
        core.counters.notifications();
        if let Some(sink) = collaborators.notification_sink.get() {
            guarded("notification sink", || sink.notify(report));
        }
    }

    match report.routing {
        RoutingDecision::Block | RoutingDecision::ForceFallback => {
            core.breakers.get(backend).trip(core.now());
        }
        RoutingDecision::Continue | RoutingDecision::PreferFallback => {}
    }
}

fn begin_recovery(core: &Core, report: &DiagnosticsReport) -> Option<RecoveryTask> {
    let now = core.now();
    if !core.trackers.try_begin(&report.key, report.strategy, now) {
        core.counters.recoveries_throttled();
        debug!(key = %report.key, strategy = %report.strategy, "recovery budget exhausted");
        return None;
    }
    Some(RecoveryTask {
        key: report.key.clone(),
        strategy: report.strategy,
        kind: report.kind,
        severity: report.severity,
        report_id: report.id,
        queued_at_nanos: now,
    })
}

fn enqueue_recovery(core: &Core, report: &DiagnosticsReport) {
    let Some(task) = begin_recovery(core, report) else {
        return;
    };
    match core.pipeline.recovery_tx.try_send(task) {
        Ok(()) => {}
        Err(TrySendError::Full(task)) => {
            core.counters.recoveries_dropped();
            debug!(key = %task.key, "recovery queue full, dropping task");
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// First backend in the fallback chain of `key` that is usable and not open.
fn reroute_target(core: &Core, key: &CallKey) -> Option<Backend> {
    let category = key.category();
    core.config
        .fallback
        .chain(key.backend())
        .find(|&candidate| {
            core.breakers.get(candidate).state() != BreakerState::Open
                && core.collaborators.is_usable(candidate, category)
        })
}

/// Executes one recovery task and reports its outcome.
pub(crate) fn run_recovery(core: &Core, task: RecoveryTask) {
    core.counters.recoveries_attempted();
    let started = core.now();
    let target = reroute_target(core, &task.key);
    let result = recovery::execute(&task, &core.collaborators, target);
    let elapsed = Duration::from_nanos(elapsed_since(core.now(), started));

    let outcome = RecoveryOutcome {
        key: task.key.clone(),
        strategy: task.strategy,
        report_id: task.report_id,
        started_at_nanos: started,
        elapsed,
        error: result.err().map(|err| err.to_string()),
    };

    match &outcome.error {
        None => {
            core.counters.recoveries_succeeded();
            core.trackers.reset(&task.key);
            // Moving work elsewhere says nothing about the health of the source.
            if task.strategy != RecoveryStrategy::Reroute {
                core.breakers.get(task.key.backend()).reset();
            }
        }
        Some(err) => {
            core.counters.recoveries_failed();
            warn!(key = %task.key, strategy = %task.strategy, "recovery failed: {err}");
            let draft = ReportDraft::advisory(
                task.key.clone(),
                IssueKind::Recovery(RecoveryIssue::Failed),
                Severity::Medium,
                format!("{} failed: {err}", task.strategy),
                core.now(),
            )
            .with_metadata("report", task.report_id)
            .with_metadata("triggered_by", task.kind);
            submit_follow_up(core, draft);
        }
    }

    if let Some(sink) = core.collaborators.outcome_sink.get() {
        guarded("outcome sink", || sink.record(&outcome));
    }
}
