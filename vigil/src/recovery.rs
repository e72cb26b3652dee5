//! Recovery budgets and strategy dispatch.
//!
//! ## Usage
//!
//! A [`RecoveryTracker`] is a rate limiter, not a state machine: a call site
//! gets `max_attempts` attempts, and the budget is restored once the cool-down
//! has elapsed since the last attempt or a recovery succeeds. A device reset is
//! further limited to one attempt per cool-down, and a success does not restore
//! that allowance.

use std::{error::Error, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use thiserror::Error;

use crate::{
    call_key::{Backend, CallKey},
    clock::{duration_nanos, elapsed_since},
    collaborator::{BackendManager, Collaborators, call_hook},
    config::RecoveryConfig,
    error::ManagerResult,
    issue::{IssueKind, RecoveryStrategy, Severity},
};

#[derive(Debug, Default)]
struct TrackerState {
    attempts: u32,
    device_resets: u32,
    last_attempt_nanos: u64,
    last_strategy: Option<RecoveryStrategy>,
    last_touched_nanos: u64,
}

/// Attempt budget of one call site.
#[derive(Debug, Default)]
pub struct RecoveryTracker {
    state: Mutex<TrackerState>,
}

impl RecoveryTracker {
    /// Whether `strategy` may be attempted at `now`, without consuming budget.
    pub fn can_attempt(&self, strategy: RecoveryStrategy, now: u64, config: &RecoveryConfig) -> bool {
        let mut state = self.state.lock();
        Self::refresh(&mut state, now, config);
        Self::admits(&state, strategy, config)
    }

    /// Consumes one attempt of `strategy` if the budget allows it.
    pub fn try_begin(&self, strategy: RecoveryStrategy, now: u64, config: &RecoveryConfig) -> bool {
        let mut state = self.state.lock();
        Self::refresh(&mut state, now, config);
        state.last_touched_nanos = now;
        if !Self::admits(&state, strategy, config) {
            return false;
        }
        state.attempts += 1;
        if strategy == RecoveryStrategy::DeviceReset {
            state.device_resets += 1;
        }
        state.last_attempt_nanos = now;
        state.last_strategy = Some(strategy);
        true
    }

    fn refresh(state: &mut TrackerState, now: u64, config: &RecoveryConfig) {
        if (state.attempts > 0 || state.device_resets > 0)
            && elapsed_since(now, state.last_attempt_nanos) >= duration_nanos(config.cooldown)
        {
            state.attempts = 0;
            state.device_resets = 0;
        }
    }

    fn admits(state: &TrackerState, strategy: RecoveryStrategy, config: &RecoveryConfig) -> bool {
        if state.attempts >= config.max_attempts {
            return false;
        }
        match strategy.attempt_cap() {
            Some(cap) if strategy == RecoveryStrategy::DeviceReset => state.device_resets < cap,
            Some(cap) => state.attempts < cap,
            None => true,
        }
    }

    /// Restores the budget after a successful recovery.
    pub fn reset(&self) {
        self.state.lock().attempts = 0;
    }

    /// Attempts consumed in the current window.
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Strategy of the most recent attempt.
    pub fn last_strategy(&self) -> Option<RecoveryStrategy> {
        self.state.lock().last_strategy
    }

    fn idle_for(&self, now: u64) -> u64 {
        let state = self.state.lock();
        elapsed_since(now, state.last_touched_nanos.max(state.last_attempt_nanos))
    }
}

/// Lazily created trackers keyed by call site.
pub struct RecoveryTrackers {
    trackers: DashMap<CallKey, Arc<RecoveryTracker>, FxBuildHasher>,
    config: RecoveryConfig,
}

impl RecoveryTrackers {
    /// Creates an empty set.
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            trackers: DashMap::with_hasher(FxBuildHasher),
            config,
        }
    }

    /// Consumes one attempt for `key`, creating its tracker on first use.
    pub fn try_begin(&self, key: &CallKey, strategy: RecoveryStrategy, now: u64) -> bool {
        let tracker = self
            .trackers
            .entry(key.clone())
            .or_default()
            .clone();
        tracker.try_begin(strategy, now, &self.config)
    }

    /// Whether `key` could attempt `strategy` now.
    pub fn can_attempt(&self, key: &CallKey, strategy: RecoveryStrategy, now: u64) -> bool {
        self.trackers
            .get(key)
            .is_none_or(|tracker| tracker.can_attempt(strategy, now, &self.config))
    }

    /// Restores the budget of `key`.
    pub fn reset(&self, key: &CallKey) {
        if let Some(tracker) = self.trackers.get(key) {
            tracker.reset();
        }
    }

    /// Attempts consumed by `key` in its current window.
    pub fn attempts(&self, key: &CallKey) -> u32 {
        self.trackers.get(key).map_or(0, |tracker| tracker.attempts())
    }

    /// Discards trackers idle for longer than the configured TTL.
    pub fn sweep(&self, now: u64) -> usize {
        let ttl = duration_nanos(self.config.tracker_idle_ttl);
        let before = self.trackers.len();
        self.trackers.retain(|_, tracker| tracker.idle_for(now) < ttl);
        before - self.trackers.len()
    }

    /// Number of live trackers.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Whether no tracker exists.
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Drops every tracker.
    pub fn clear(&self) {
        self.trackers.clear();
    }
}

/// A queued corrective action.
#[derive(Clone, Debug)]
pub struct RecoveryTask {
    /// Call site to recover.
    pub key: CallKey,
    /// What to do.
    pub strategy: RecoveryStrategy,
    /// Issue that triggered the task.
    pub kind: IssueKind,
    /// Severity of that issue.
    pub severity: Severity,
    /// Report that triggered the task.
    pub report_id: u64,
    /// When the task was queued.
    pub queued_at_nanos: u64,
}

/// Result of one executed recovery task.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RecoveryOutcome {
    /// Recovered call site.
    pub key: CallKey,
    /// Strategy that ran.
    pub strategy: RecoveryStrategy,
    /// Report that triggered the task.
    pub report_id: u64,
    /// When execution started.
    pub started_at_nanos: u64,
    /// Execution time.
    pub elapsed: Duration,
    /// Failure message; `None` on success.
    pub error: Option<String>,
}

impl RecoveryOutcome {
    /// Whether the strategy succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Why a strategy could not be dispatched.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// No collaborator can carry out the strategy.
    #[error("no {collaborator} registered for {backend}")]
    NotRegistered {
        /// Missing collaborator.
        collaborator: &'static str,
        /// Backend the task was for.
        backend: Backend,
    },
    /// Rerouting was requested but no fallback is usable.
    #[error("no usable fallback for {0}")]
    NoFallback(Backend),
}

/// Runs `task` against the registered collaborators. `reroute_target` is the
/// backend a reroute should move work to, if any is usable.
pub(crate) fn execute(
    task: &RecoveryTask,
    collaborators: &Collaborators,
    reroute_target: Option<Backend>,
) -> ManagerResult {
    let key = &task.key;
    let backend = key.backend();
    let what = task.strategy.name();
    match task.strategy {
        RecoveryStrategy::None => Ok(()),
        RecoveryStrategy::SimplifyShader | RecoveryStrategy::CpuFallbackShader => {
            let Some(shaders) = collaborators.shader_manager.get() else {
                return Err(not_registered("shader manager", backend));
            };
            call_hook(what, || {
                if task.strategy == RecoveryStrategy::SimplifyShader {
                    shaders.request_simplified_shader(key)
                } else {
                    shaders.request_cpu_fallback_shader(key)
                }
            })
        }
        RecoveryStrategy::Reroute => {
            let target = reroute_target.ok_or(RecoveryError::NoFallback(backend))?;
            with_manager(collaborators, backend, what, |manager| {
                manager.reroute_operation(key, target)
            })
        }
        RecoveryStrategy::Retry => with_manager(collaborators, backend, what, |manager| {
            manager.retry_last_operation(key)
        }),
        RecoveryStrategy::RebuildPipeline => with_manager(collaborators, backend, what, |manager| {
            manager.rebuild_pipeline(key)
        }),
        RecoveryStrategy::RebuildResource => with_manager(collaborators, backend, what, |manager| {
            manager.rebuild_resource(key)
        }),
        RecoveryStrategy::EvictAndRetry => with_manager(collaborators, backend, what, |manager| {
            manager.evict_resources()?;
            manager.retry_last_operation(key)
        }),
        RecoveryStrategy::Defragment => {
            with_manager(collaborators, backend, what, |manager| manager.defragment_memory())
        }
        RecoveryStrategy::DowngradeQuality => {
            with_manager(collaborators, backend, what, |manager| manager.downgrade_quality())
        }
        RecoveryStrategy::EmergencyFlush => {
            with_manager(collaborators, backend, what, |manager| manager.flush())
        }
        RecoveryStrategy::EmergencyGc => with_manager(collaborators, backend, what, |manager| {
            manager.collect_garbage()?;
            manager.evict_resources()
        }),
        RecoveryStrategy::DeviceReset => {
            with_manager(collaborators, backend, what, |manager| manager.reset_device())
        }
        RecoveryStrategy::GracefulDegradation => {
            with_manager(collaborators, backend, what, |manager| manager.enter_degraded_mode())
        }
    }
}

fn with_manager(
    collaborators: &Collaborators,
    backend: Backend,
    what: &str,
    f: impl FnOnce(&dyn BackendManager) -> ManagerResult,
) -> ManagerResult {
    let Some(manager) = collaborators.manager(backend) else {
        return Err(not_registered("backend manager", backend));
    };
    call_hook(what, || f(manager.as_ref()))
}

fn not_registered(collaborator: &'static str, backend: Backend) -> Box<dyn Error + Send + Sync> {
    Box::new(RecoveryError::NotRegistered {
        collaborator,
        backend,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{call_key::CallCategory, issue::MemoryIssue};

    const KEY: CallKey = CallKey::new(Backend::Vulkan, CallCategory::BufferUpload, "vkAllocateMemory");
    const SECOND: u64 = 1_000_000_000;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            max_attempts: 3,
            cooldown: Duration::from_secs(30),
            tracker_idle_ttl: Duration::from_secs(300),
        }
    }

    #[test]
    fn budget_exhausts_and_recovers_after_cooldown() {
        let tracker = RecoveryTracker::default();
        let config = config();
        for i in 0..3 {
            assert!(tracker.try_begin(RecoveryStrategy::Retry, i * SECOND, &config));
        }
        assert!(!tracker.try_begin(RecoveryStrategy::Retry, 10 * SECOND, &config));
        assert!(!tracker.can_attempt(RecoveryStrategy::Retry, 31 * SECOND, &config));
        // 30s after the last attempt at t=2s.
        assert!(tracker.can_attempt(RecoveryStrategy::Retry, 32 * SECOND, &config));
        assert!(tracker.try_begin(RecoveryStrategy::Retry, 32 * SECOND, &config));
        assert_eq!(tracker.attempts(), 1);
        assert_eq!(tracker.last_strategy(), Some(RecoveryStrategy::Retry));
    }

    #[test]
    fn success_restores_budget_but_not_device_reset() {
        let tracker = RecoveryTracker::default();
        let config = config();
        assert!(tracker.try_begin(RecoveryStrategy::DeviceReset, 0, &config));
        assert!(!tracker.try_begin(RecoveryStrategy::DeviceReset, SECOND, &config));
        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert!(!tracker.try_begin(RecoveryStrategy::DeviceReset, 2 * SECOND, &config));
        assert!(tracker.try_begin(RecoveryStrategy::Retry, 2 * SECOND, &config));
        assert!(tracker.try_begin(RecoveryStrategy::DeviceReset, 40 * SECOND, &config));
    }

    #[test]
    fn trackers_are_lazy_and_swept_when_idle() {
        let trackers = RecoveryTrackers::new(config());
        assert!(trackers.is_empty());
        assert!(trackers.can_attempt(&KEY, RecoveryStrategy::Retry, 0));
        assert!(trackers.try_begin(&KEY, RecoveryStrategy::Retry, 0));
        assert_eq!(trackers.attempts(&KEY), 1);
        trackers.reset(&KEY);
        assert_eq!(trackers.attempts(&KEY), 0);

        assert_eq!(trackers.sweep(100 * SECOND), 0);
        assert_eq!(trackers.sweep(300 * SECOND), 1);
        assert!(trackers.is_empty());
    }

    #[derive(Default)]
    struct Recorder {
        evicted: AtomicUsize,
        retried: AtomicUsize,
    }

    impl BackendManager for Recorder {
        fn evict_resources(&self) -> ManagerResult {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn retry_last_operation(&self, _key: &CallKey) -> ManagerResult {
            self.retried.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn reset_device(&self) -> ManagerResult {
            panic!("reset while device busy");
        }
    }

    fn task(strategy: RecoveryStrategy) -> RecoveryTask {
        RecoveryTask {
            key: KEY,
            strategy,
            kind: IssueKind::Memory(MemoryIssue::Exhaustion),
            severity: Severity::Severe,
            report_id: 1,
            queued_at_nanos: 0,
        }
    }

    #[test]
    fn dispatches_to_backend_manager() {
        let collaborators = Collaborators::default();
        let recorder = Arc::new(Recorder::default());
        collaborators
            .manager_slot(Backend::Vulkan)
            .set(Some(recorder.clone() as Arc<dyn BackendManager>));

        assert!(execute(&task(RecoveryStrategy::EvictAndRetry), &collaborators, None).is_ok());
        assert_eq!(recorder.evicted.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.retried.load(Ordering::Relaxed), 1);

        let err = execute(&task(RecoveryStrategy::Defragment), &collaborators, None).unwrap_err();
        assert_eq!(err.to_string(), "defragment_memory is not supported by this manager");

        let err = execute(&task(RecoveryStrategy::DeviceReset), &collaborators, None).unwrap_err();
        assert!(err.to_string().contains("reset while device busy"));

        let err = execute(&task(RecoveryStrategy::Reroute), &collaborators, None).unwrap_err();
        assert_eq!(err.to_string(), "no usable fallback for vulkan");
    }

    #[test]
    fn missing_collaborators_fail_cleanly() {
        let collaborators = Collaborators::default();
        let err = execute(&task(RecoveryStrategy::Retry), &collaborators, None).unwrap_err();
        assert_eq!(err.to_string(), "no backend manager registered for vulkan");
        let err =
            execute(&task(RecoveryStrategy::SimplifyShader), &collaborators, None).unwrap_err();
        assert_eq!(err.to_string(), "no shader manager registered for vulkan");
        assert!(execute(&task(RecoveryStrategy::None), &collaborators, None).is_ok());
    }
}
