//! Hooks implemented by the host.
//!
//! ## Usage
//!
//! Backend managers expose recovery primitives, the shader manager rewrites
//! failing shaders, the capability source steers rerouting and the draw batcher
//! owns indirect execution. Every hook has a default so hosts implement only
//! what their backend can actually do; an unimplemented recovery primitive
//! fails with [`Unsupported`](crate::error::Unsupported).
//!
//! ```
//! use vigil::{BackendManager, ManagerResult};
//!
//! struct GlManager;
//!
//! impl BackendManager for GlManager {
//!     fn flush(&self) -> ManagerResult {
//!         // glFlush()
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Every invocation is isolated: a panicking hook is logged and treated as a
//! failed call.

use std::{
    any::Any,
    error::Error,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    call_key::{Backend, CallCategory, CallKey},
    draw::{DrawCall, DrawDescriptor, PatternHash, PatternSummary},
    error::{ManagerResult, unsupported},
    issue::Severity,
    recovery::RecoveryOutcome,
    report::DiagnosticsReport,
};

/// Recovery primitives of one backend.
pub trait BackendManager: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Re-issues the last operation of `key`.
    fn retry_last_operation(&self, _key: &CallKey) -> ManagerResult {
        unsupported("retry_last_operation")
    }

    /// Moves future work of `key` to `target`.
    fn reroute_operation(&self, _key: &CallKey, _target: Backend) -> ManagerResult {
        unsupported("reroute_operation")
    }

    /// Recreates the pipeline used by `key`.
    fn rebuild_pipeline(&self, _key: &CallKey) -> ManagerResult {
        unsupported("rebuild_pipeline")
    }

    /// Recreates the resource used by `key`.
    fn rebuild_resource(&self, _key: &CallKey) -> ManagerResult {
        unsupported("rebuild_resource")
    }

    /// Releases cached or idle resources.
    fn evict_resources(&self) -> ManagerResult {
        unsupported("evict_resources")
    }

    /// Compacts device memory.
    fn defragment_memory(&self) -> ManagerResult {
        unsupported("defragment_memory")
    }

    /// Lowers rendering quality.
    fn downgrade_quality(&self) -> ManagerResult {
        unsupported("downgrade_quality")
    }

    /// Flushes pending work.
    fn flush(&self) -> ManagerResult {
        unsupported("flush")
    }

    /// Frees memory held by dead objects.
    fn collect_garbage(&self) -> ManagerResult {
        unsupported("collect_garbage")
    }

    /// Recreates the device.
    fn reset_device(&self) -> ManagerResult {
        unsupported("reset_device")
    }

    /// Switches to a minimal, robust rendering mode.
    fn enter_degraded_mode(&self) -> ManagerResult {
        unsupported("enter_degraded_mode")
    }

    /// Receives every delivered report about this backend.
    fn handle_diagnostics(&self, _report: &DiagnosticsReport) {}
}

/// Shader fallbacks.
pub trait ShaderManager: Send + Sync + 'static {
    /// Replaces the shader behind `key` with a simpler variant.
    fn request_simplified_shader(&self, _key: &CallKey) -> ManagerResult {
        unsupported("request_simplified_shader")
    }

    /// Replaces the shader behind `key` with a CPU implementation.
    fn request_cpu_fallback_shader(&self, _key: &CallKey) -> ManagerResult {
        unsupported("request_cpu_fallback_shader")
    }

    /// Receives every delivered shader report.
    fn handle_shader_diagnostics(&self, _report: &DiagnosticsReport) {}
}

/// Backend stability and feature queries used when rerouting.
pub trait CapabilitySource: Send + Sync + 'static {
    /// Whether `backend` is stable enough to take rerouted work.
    fn is_stable(&self, _backend: Backend) -> bool {
        true
    }

    /// Whether `backend` can execute calls of `category`.
    fn supports(&self, _backend: Backend, _category: CallCategory) -> bool {
        true
    }
}

/// Indirect execution cache keyed by draw pattern.
pub trait DrawBatcher: Send + Sync + 'static {
    /// Prepares a batched path for `pattern`.
    fn cache_indirect(
        &self,
        pattern: PatternHash,
        descriptor: &DrawDescriptor,
        batch_size: u32,
    ) -> ManagerResult;

    /// Executes `call` through the batched path of `pattern`.
    fn execute_indirect(&self, pattern: PatternHash, call: &DrawCall) -> ManagerResult;

    /// Drops the batched path of `pattern`.
    fn invalidate(&self, _pattern: PatternHash) {}

    /// Re-plans batching over the currently tracked patterns.
    fn optimize(&self, _patterns: &[PatternSummary]) -> ManagerResult {
        Ok(())
    }

    /// Batches as aggressively as possible right now.
    fn emergency_batch(&self) -> ManagerResult {
        unsupported("emergency_batch")
    }

    /// Human-readable state for the diagnostics export.
    fn pattern_report(&self) -> Option<String> {
        None
    }
}

/// Source of the memory usage ratio checked by the monitor.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Used / total, in `[0, 1]`. `None` when unknown.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Destination of every delivered report.
pub trait ReportSink: Send + Sync + 'static {
    /// Called once per delivered report.
    fn deliver(&self, report: &DiagnosticsReport);
}

/// Destination of user-visible notifications.
pub trait NotificationSink: Send + Sync + 'static {
    /// Called for reports at or above the notification threshold.
    fn notify(&self, report: &DiagnosticsReport);
}

/// Destination of recovery outcomes.
pub trait RecoveryOutcomeSink: Send + Sync + 'static {
    /// Called once per executed recovery task.
    fn record(&self, outcome: &RecoveryOutcome);
}

/// Logs reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

impl ReportSink for TracingReportSink {
    fn deliver(&self, report: &DiagnosticsReport) {
        match report.severity {
            Severity::Info | Severity::Low => debug!(id = report.id, "{}", report.message),
            Severity::Medium => info!(id = report.id, "{}", report.message),
            Severity::High | Severity::Severe => warn!(id = report.id, "{}", report.message),
            Severity::Critical => error!(id = report.id, "{}\n{}", report.message, report.analysis),
        }
    }
}

/// Logs notifications through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, report: &DiagnosticsReport) {
        warn!(
            severity = %report.severity,
            strategy = %report.strategy,
            "GPU health: {}",
            report.message
        );
    }
}

/// Logs recovery outcomes through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutcomeSink;

impl RecoveryOutcomeSink for TracingOutcomeSink {
    fn record(&self, outcome: &RecoveryOutcome) {
        match &outcome.error {
            None => info!(key = %outcome.key, strategy = %outcome.strategy, "recovery succeeded"),
            Some(err) => warn!(
                key = %outcome.key,
                strategy = %outcome.strategy,
                "recovery failed: {err}"
            ),
        }
    }
}

/// A replaceable collaborator reference, read once per use.
pub struct Slot<T: ?Sized> {
    inner: RwLock<Option<Arc<T>>>,
}

impl<T: ?Sized> Slot<T> {
    /// An empty slot.
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// A slot holding `value`.
    pub fn with(value: Arc<T>) -> Self {
        Self {
            inner: RwLock::new(Some(value)),
        }
    }

    /// The current value.
    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    /// Replaces the value.
    pub fn set(&self, value: Option<Arc<T>>) {
        *self.inner.write() = value;
    }
}

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Everything the engine calls out to.
pub struct Collaborators {
    managers: [Slot<dyn BackendManager>; Backend::COUNT],
    /// Shader fallbacks.
    pub shader_manager: Slot<dyn ShaderManager>,
    /// Stability and feature queries.
    pub capability: Slot<dyn CapabilitySource>,
    /// Indirect execution cache.
    pub draw_batcher: Slot<dyn DrawBatcher>,
    /// Memory usage probe.
    pub memory_probe: Slot<dyn MemoryProbe>,
    /// Report destination.
    pub report_sink: Slot<dyn ReportSink>,
    /// Notification destination.
    pub notification_sink: Slot<dyn NotificationSink>,
    /// Recovery outcome destination.
    pub outcome_sink: Slot<dyn RecoveryOutcomeSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            managers: std::array::from_fn(|_| Slot::empty()),
            shader_manager: Slot::empty(),
            capability: Slot::empty(),
            draw_batcher: Slot::empty(),
            memory_probe: Slot::empty(),
            report_sink: Slot::with(Arc::new(TracingReportSink) as Arc<dyn ReportSink>),
            notification_sink: Slot::with(
                Arc::new(TracingNotificationSink) as Arc<dyn NotificationSink>
            ),
            outcome_sink: Slot::with(Arc::new(TracingOutcomeSink) as Arc<dyn RecoveryOutcomeSink>),
        }
    }
}

impl Collaborators {
    /// Manager slot of `backend`.
    pub fn manager_slot(&self, backend: Backend) -> &Slot<dyn BackendManager> {
        &self.managers[backend.index()]
    }

    /// Manager of `backend`, if registered.
    pub fn manager(&self, backend: Backend) -> Option<Arc<dyn BackendManager>> {
        self.managers[backend.index()].get()
    }

    /// Whether rerouted calls of `category` may go to `backend`.
    pub fn is_usable(&self, backend: Backend, category: CallCategory) -> bool {
        match self.capability.get() {
            Some(source) => guarded("capability source", || {
                source.is_stable(backend) && source.supports(backend, category)
            })
            .unwrap_or(false),
            None => true,
        }
    }

    /// Drops every registered collaborator, including the default sinks.
    pub fn clear(&self) {
        for slot in &self.managers {
            slot.set(None);
        }
        self.shader_manager.set(None);
        self.capability.set(None);
        self.draw_batcher.set(None);
        self.memory_probe.set(None);
        self.report_sink.set(None);
        self.notification_sink.set(None);
        self.outcome_sink.set(None);
    }
}

/// Runs `f`, turning a panic into a logged `None`.
pub(crate) fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            error!("{what} panicked: {}", panic_message(payload.as_ref()));
            None
        }
    }
}

/// Runs a collaborator hook, turning a panic into an error.
pub(crate) fn call_hook(what: &str, f: impl FnOnce() -> ManagerResult) -> ManagerResult {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("{what} panicked: {message}");
            Err(Box::new(HookPanicked(message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// A collaborator hook panicked.
#[derive(Debug)]
pub struct HookPanicked(pub String);

impl fmt::Display for HookPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook panicked: {}", self.0)
    }
}

impl Error for HookPanicked {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Flushing(AtomicUsize);

    impl BackendManager for Flushing {
        fn flush(&self) -> ManagerResult {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Unstable;

    impl CapabilitySource for Unstable {
        fn is_stable(&self, backend: Backend) -> bool {
            backend != Backend::OpenGl
        }

        fn supports(&self, _backend: Backend, category: CallCategory) -> bool {
            category != CallCategory::Dispatch
        }
    }

    #[test]
    fn default_hooks_are_unsupported() {
        let manager = Flushing(AtomicUsize::new(0));
        assert!(manager.flush().is_ok());
        assert_eq!(manager.0.load(Ordering::Relaxed), 1);
        let err = manager.reset_device().unwrap_err();
        assert_eq!(err.to_string(), "reset_device is not supported by this manager");
    }

    #[test]
    fn slots_swap_at_runtime() {
        let collaborators = Collaborators::default();
        assert!(collaborators.manager(Backend::Metal).is_none());
        collaborators
            .manager_slot(Backend::Metal)
            .set(Some(Arc::new(Flushing(AtomicUsize::new(0))) as Arc<dyn BackendManager>));
        assert!(collaborators.manager(Backend::Metal).is_some());
        assert!(collaborators.report_sink.get().is_some());
        collaborators.clear();
        assert!(collaborators.manager(Backend::Metal).is_none());
        assert!(collaborators.report_sink.get().is_none());
    }

    #[test]
    fn capability_source_filters_backends() {
        let collaborators = Collaborators::default();
        assert!(collaborators.is_usable(Backend::OpenGl, CallCategory::Draw));
        collaborators
            .capability
            .set(Some(Arc::new(Unstable) as Arc<dyn CapabilitySource>));
        assert!(!collaborators.is_usable(Backend::OpenGl, CallCategory::Draw));
        assert!(!collaborators.is_usable(Backend::Vulkan, CallCategory::Dispatch));
        assert!(collaborators.is_usable(Backend::Vulkan, CallCategory::Draw));
    }

    #[test]
    fn panicking_hook_becomes_error() {
        let result = call_hook("test hook", || panic!("driver exploded"));
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "hook panicked: driver exploded");
        assert_eq!(guarded("test", || 5), Some(5));
    }
}
