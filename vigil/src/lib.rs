//! vigil watches every call a renderer makes into its GPU backends and keeps
//! the pipeline healthy when they misbehave.
//!
//! # Profiling
//!
//! Wrap each backend call in [`Vigil::profile`]. The engine times the call,
//! folds it into per-call-site statistics and classifies it; a spike or a
//! failure becomes a [`DiagnosticsReport`] that is delivered to your sinks and
//! backend managers off the hot path.
//!
//! ```
//! use vigil::{Backend, CallCategory, CallKey, Vigil, VigilConfig};
//!
//! static UPLOAD: CallKey =
//!     CallKey::new(Backend::Vulkan, CallCategory::BufferUpload, "vkCmdCopyBuffer");
//!
//! let vigil = Vigil::builder()
//!     .config(VigilConfig::deterministic())
//!     .build()
//!     .expect("valid configuration");
//!
//! let copied: Result<(), vigil::CallError<String>> = vigil.profile(&UPLOAD, |_backend| Ok(()));
//! assert!(copied.is_ok());
//! ```
//!
//! # Self-healing
//!
//! Reports carry a [`RecoveryStrategy`] and a [`RoutingDecision`]. Recovery
//! strategies run against the [`BackendManager`] registered for the failing
//! backend, within a per-call-site attempt budget. Repeated failures open the
//! backend's circuit breaker, after which [`Vigil::profile`] moves calls to the
//! configured fallback backend until a probe call succeeds.
//!
//! ```
//! use std::sync::Arc;
//!
//! use vigil::{Backend, BackendManager, ManagerResult, Vigil, VigilConfig};
//!
//! struct VulkanManager;
//!
//! impl BackendManager for VulkanManager {
//!     fn flush(&self) -> ManagerResult {
//!         // vkQueueWaitIdle()
//!         Ok(())
//!     }
//! }
//!
//! let vigil = Vigil::builder()
//!     .config(VigilConfig::deterministic())
//!     .backend_manager(Backend::Vulkan, Arc::new(VulkanManager))
//!     .build()
//!     .expect("valid configuration");
//! # drop(vigil);
//! ```
//!
//! # Frames and draws
//!
//! [`Vigil::begin_frame`] and [`Vigil::end_frame`] roll call timings up into a
//! [`FrameAnalysis`] that names the frame's bottleneck.
//! [`Vigil::profile_draw`] tracks structurally identical draws and, once a
//! pattern repeats often enough, hands it to the registered [`DrawBatcher`]
//! and routes later draws through the batched path.
//!
//! # Scheduling
//!
//! By default a background thread drains the report queues, runs the health
//! monitor and evicts stale state. Use [`VigilConfig::deterministic`] to run
//! everything inline and drive it yourself through [`Vigil::tick`],
//! [`Vigil::run_monitor_cycle`] and [`Vigil::run_maintenance`].
#![deny(missing_docs, clippy::unwrap_used)]

pub mod breaker;
pub mod call_key;
pub mod classify;
pub mod clock;
pub mod collaborator;
pub mod config;
mod counters;
pub mod draw;
mod engine;
pub mod error;
pub mod export;
pub mod frame;
pub mod issue;
pub mod logging;
mod monitor;
mod pipeline;
pub mod recovery;
pub mod report;
mod scheduler;
pub mod stats;

pub use crate::{
    breaker::{BreakerSnapshot, BreakerState},
    call_key::{Backend, CallCategory, CallKey, TimeBucket},
    classify::{Diagnosable, FailureInfo, SpikeAnalysis},
    clock::{Clock, ManualClock, MonotonicClock},
    collaborator::{
        BackendManager, CapabilitySource, Collaborators, DrawBatcher, MemoryProbe,
        NotificationSink, RecoveryOutcomeSink, ReportSink, ShaderManager, TracingNotificationSink,
        TracingOutcomeSink, TracingReportSink,
    },
    config::{
        BreakerConfig, DrawConfig, FallbackTable, FrameConfig, LoggingConfig, MonitorConfig,
        PipelineConfig, RecoveryConfig, SchedulerConfig, SchedulerMode, SpikeThresholds,
        VigilConfig,
    },
    counters::CountersSnapshot,
    draw::{
        DrawCall, DrawDescriptor, DrawFrameSummary, DrawPath, DrawPressure, PatternHash,
        PatternSummary, PrimitiveType,
    },
    engine::{Vigil, VigilBuilder},
    error::{CallError, ManagerResult, Unsupported, VigilError},
    frame::FrameAnalysis,
    issue::{IssueKind, RecoveryStrategy, RoutingDecision, Severity},
    monitor::{MonitorSummary, SystemMemoryProbe},
    pipeline::QueueDepths,
    recovery::RecoveryOutcome,
    report::DiagnosticsReport,
    scheduler::{MaintenanceSummary, TickSummary},
    stats::CallStatsSnapshot,
};

#[cfg(feature = "export")]
pub use crate::export::JsonlReportSink;

#[cfg(feature = "wgpu")]
pub use wgpu;
