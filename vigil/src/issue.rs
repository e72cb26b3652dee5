//! Issue taxonomy and the fixed tables mapping issues to corrective action.
//!
//! Every table here is an exhaustive `match`, so adding an issue kind fails to
//! compile until its strategy and routing are decided.

use std::fmt;

/// How bad an issue is, in increasing order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Severity {
    /// Informational; never counts as a spike.
    Info,
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Severe.
    Severe,
    /// Critical; bypasses the report queue.
    Critical,
}

impl Severity {
    /// Lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Severe => "severe",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timing anomalies of a single call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TimingIssue {
    /// Barely above normal.
    MicroSpike,
    /// Small spike.
    SmallSpike,
    /// Medium spike.
    MediumSpike,
    /// Long enough to drop a frame.
    VisibleStutter,
    /// Several frames dropped.
    SevereStutter,
    /// The pipeline stalled.
    CatastrophicStall,
    /// Noticeably slower than this call's moving average.
    ElevatedLatency,
    /// Several times slower than this call's moving average.
    RelativeSpike,
    /// Statistically far from this call's mean.
    VarianceSpike,
    /// Latency has been climbing.
    UpwardTrend,
}

/// Shader toolchain issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ShaderIssue {
    /// Compilation failed.
    CompileError,
    /// Linking failed.
    LinkError,
    /// Validation rejected the shader or its usage.
    ValidationError,
    /// Compile or link took longer than expected.
    SlowCompile,
    /// Compile or link stalled.
    CompileTimeout,
}

/// Memory issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MemoryIssue {
    /// A single allocation failed.
    AllocationFailure,
    /// The heap is too fragmented to satisfy allocations.
    Fragmentation,
    /// Device or host memory is exhausted.
    Exhaustion,
}

/// Synchronization issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SyncIssue {
    /// A fence or semaphore wait was slow.
    WaitStall,
    /// A fence or semaphore wait timed out.
    WaitTimeout,
    /// Queue submission was slow.
    QueueSubmitStall,
    /// Queue submission stalled badly.
    QueueSubmitTimeout,
}

/// Draw-call issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DrawIssue {
    /// Too many draw calls per frame.
    ExcessiveDrawCalls,
    /// Draw produced corrupt output or used corrupt state.
    Corruption,
    /// Instanced draw failed.
    InstancingFailure,
}

/// Pipeline, texture and framebuffer issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ResourceIssue {
    /// Pipeline creation failed.
    PipelineCreationFailure,
    /// Pipeline creation was slow.
    SlowPipelineCreation,
    /// Pipeline creation stalled.
    PipelineCreationStall,
    /// A texture could not be created or uploaded.
    TextureFailure,
    /// A framebuffer is incomplete or invalid.
    FramebufferIncomplete,
}

/// Driver issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DriverIssue {
    /// The driver crashed or hung.
    Crash,
    /// The device was lost or reset.
    DeviceLost,
    /// The installed driver is incompatible.
    VersionMismatch,
}

/// Frame-level performance patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PerformanceIssue {
    /// GPU work dominates the frame.
    GpuBound,
    /// CPU work dominates the frame.
    CpuBound,
    /// Synchronization and transfers dominate the frame.
    BandwidthBound,
}

/// Platform issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PlatformIssue {
    /// Thermal throttling.
    Thermal,
    /// Clock frequency scaling.
    FrequencyScaling,
}

/// Capability issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CapabilityIssue {
    /// A required feature or extension is missing.
    UnsupportedFeature,
    /// The backend is known to be unstable on this device.
    UnstableBackend,
}

/// Recovery lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RecoveryIssue {
    /// A recovery attempt started.
    Attempted,
    /// A recovery attempt succeeded.
    Succeeded,
    /// A recovery attempt failed.
    Failed,
    /// A call was rerouted to a fallback backend.
    FallbackActivated,
}

/// Conditions detected by the active monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HealthIssue {
    /// Frame times vary too much.
    FrameTimeInstability,
    /// Several spike frames in a row.
    ConsecutiveSpikeFrames,
    /// Many failures within one monitor cycle.
    ConsecutiveErrors,
    /// Memory usage is high.
    MemoryPressure,
    /// A backend's circuit breaker is open.
    CircuitOpen,
}

/// Every issue the engine can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "group", content = "kind", rename_all = "snake_case"))]
pub enum IssueKind {
    /// No issue.
    None,
    /// Timing.
    Timing(TimingIssue),
    /// Shader toolchain.
    Shader(ShaderIssue),
    /// Memory.
    Memory(MemoryIssue),
    /// Synchronization.
    Sync(SyncIssue),
    /// Draw calls.
    Draw(DrawIssue),
    /// Pipelines, textures, framebuffers.
    Resource(ResourceIssue),
    /// Driver.
    Driver(DriverIssue),
    /// Frame-level performance pattern.
    Performance(PerformanceIssue),
    /// Platform.
    Platform(PlatformIssue),
    /// Capability.
    Capability(CapabilityIssue),
    /// Recovery lifecycle.
    Recovery(RecoveryIssue),
    /// Active monitoring.
    Health(HealthIssue),
    /// A failure that matched no known pattern.
    Unclassified,
}

impl IssueKind {
    /// Strategy suggested for this issue.
    pub const fn suggested_strategy(self) -> RecoveryStrategy {
        use RecoveryStrategy as S;
        match self {
            IssueKind::None => S::None,
            IssueKind::Unclassified => S::Retry,
            IssueKind::Timing(timing) => match timing {
                TimingIssue::SevereStutter
                | TimingIssue::CatastrophicStall
                | TimingIssue::RelativeSpike => S::EmergencyFlush,
                TimingIssue::MicroSpike
                | TimingIssue::SmallSpike
                | TimingIssue::MediumSpike
                | TimingIssue::VisibleStutter
                | TimingIssue::ElevatedLatency
                | TimingIssue::VarianceSpike
                | TimingIssue::UpwardTrend => S::None,
            },
            IssueKind::Shader(shader) => match shader {
                ShaderIssue::CompileError | ShaderIssue::LinkError | ShaderIssue::CompileTimeout => {
                    S::SimplifyShader
                }
                ShaderIssue::ValidationError => S::CpuFallbackShader,
                ShaderIssue::SlowCompile => S::None,
            },
            IssueKind::Memory(memory) => match memory {
                MemoryIssue::AllocationFailure | MemoryIssue::Exhaustion => S::EvictAndRetry,
                MemoryIssue::Fragmentation => S::Defragment,
            },
            IssueKind::Sync(sync) => match sync {
                SyncIssue::WaitTimeout | SyncIssue::QueueSubmitTimeout => S::EmergencyFlush,
                SyncIssue::WaitStall | SyncIssue::QueueSubmitStall => S::None,
            },
            IssueKind::Draw(draw) => match draw {
                DrawIssue::ExcessiveDrawCalls => S::None,
                DrawIssue::Corruption => S::RebuildResource,
                DrawIssue::InstancingFailure => S::Retry,
            },
            IssueKind::Resource(resource) => match resource {
                ResourceIssue::PipelineCreationFailure => S::RebuildPipeline,
                ResourceIssue::TextureFailure | ResourceIssue::FramebufferIncomplete => {
                    S::RebuildResource
                }
                ResourceIssue::SlowPipelineCreation | ResourceIssue::PipelineCreationStall => S::None,
            },
            IssueKind::Driver(driver) => match driver {
                DriverIssue::Crash | DriverIssue::DeviceLost => S::DeviceReset,
                DriverIssue::VersionMismatch => S::Reroute,
            },
            IssueKind::Performance(_) => S::None,
            IssueKind::Platform(platform) => match platform {
                PlatformIssue::Thermal => S::DowngradeQuality,
                PlatformIssue::FrequencyScaling => S::None,
            },
            IssueKind::Capability(_) => S::Reroute,
            IssueKind::Recovery(_) => S::None,
            IssueKind::Health(health) => match health {
                HealthIssue::FrameTimeInstability => S::DowngradeQuality,
                HealthIssue::ConsecutiveSpikeFrames => S::EmergencyFlush,
                HealthIssue::ConsecutiveErrors => S::GracefulDegradation,
                HealthIssue::MemoryPressure => S::EmergencyGc,
                HealthIssue::CircuitOpen => S::Reroute,
            },
        }
    }

    /// Routing suggested for this issue.
    pub const fn suggested_routing(self) -> RoutingDecision {
        use RoutingDecision as R;
        match self {
            IssueKind::Driver(DriverIssue::DeviceLost) => R::Block,
            IssueKind::Driver(DriverIssue::Crash | DriverIssue::VersionMismatch)
            | IssueKind::Capability(_)
            | IssueKind::Health(HealthIssue::CircuitOpen) => R::ForceFallback,
            IssueKind::Timing(TimingIssue::CatastrophicStall)
            | IssueKind::Memory(MemoryIssue::Exhaustion)
            | IssueKind::Sync(SyncIssue::WaitTimeout | SyncIssue::QueueSubmitTimeout) => {
                R::PreferFallback
            }
            IssueKind::None
            | IssueKind::Timing(_)
            | IssueKind::Shader(_)
            | IssueKind::Memory(_)
            | IssueKind::Sync(_)
            | IssueKind::Draw(_)
            | IssueKind::Resource(_)
            | IssueKind::Performance(_)
            | IssueKind::Platform(_)
            | IssueKind::Recovery(_)
            | IssueKind::Health(_)
            | IssueKind::Unclassified => R::Continue,
        }
    }

    /// Whether the issue concerns the shader toolchain.
    pub const fn is_shader(self) -> bool {
        matches!(self, IssueKind::Shader(_))
    }

    /// Stable snake_case label used in logs and exports.
    pub const fn label(self) -> &'static str {
        match self {
            IssueKind::None => "none",
            IssueKind::Unclassified => "unclassified_failure",
            IssueKind::Timing(timing) => match timing {
                TimingIssue::MicroSpike => "micro_spike",
                TimingIssue::SmallSpike => "small_spike",
                TimingIssue::MediumSpike => "medium_spike",
                TimingIssue::VisibleStutter => "visible_stutter",
                TimingIssue::SevereStutter => "severe_stutter",
                TimingIssue::CatastrophicStall => "catastrophic_stall",
                TimingIssue::ElevatedLatency => "elevated_latency",
                TimingIssue::RelativeSpike => "relative_spike",
                TimingIssue::VarianceSpike => "variance_spike",
                TimingIssue::UpwardTrend => "upward_trend",
            },
            IssueKind::Shader(shader) => match shader {
                ShaderIssue::CompileError => "shader_compile_error",
                ShaderIssue::LinkError => "shader_link_error",
                ShaderIssue::ValidationError => "shader_validation_error",
                ShaderIssue::SlowCompile => "shader_slow_compile",
                ShaderIssue::CompileTimeout => "shader_compile_timeout",
            },
            IssueKind::Memory(memory) => match memory {
                MemoryIssue::AllocationFailure => "allocation_failure",
                MemoryIssue::Fragmentation => "memory_fragmentation",
                MemoryIssue::Exhaustion => "memory_exhaustion",
            },
            IssueKind::Sync(sync) => match sync {
                SyncIssue::WaitStall => "sync_wait_stall",
                SyncIssue::WaitTimeout => "sync_wait_timeout",
                SyncIssue::QueueSubmitStall => "queue_submit_stall",
                SyncIssue::QueueSubmitTimeout => "queue_submit_timeout",
            },
            IssueKind::Draw(draw) => match draw {
                DrawIssue::ExcessiveDrawCalls => "excessive_draw_calls",
                DrawIssue::Corruption => "draw_corruption",
                DrawIssue::InstancingFailure => "instancing_failure",
            },
            IssueKind::Resource(resource) => match resource {
                ResourceIssue::PipelineCreationFailure => "pipeline_creation_failure",
                ResourceIssue::SlowPipelineCreation => "slow_pipeline_creation",
                ResourceIssue::PipelineCreationStall => "pipeline_creation_stall",
                ResourceIssue::TextureFailure => "texture_failure",
                ResourceIssue::FramebufferIncomplete => "framebuffer_incomplete",
            },
            IssueKind::Driver(driver) => match driver {
                DriverIssue::Crash => "driver_crash",
                DriverIssue::DeviceLost => "device_lost",
                DriverIssue::VersionMismatch => "driver_version_mismatch",
            },
            IssueKind::Performance(performance) => match performance {
                PerformanceIssue::GpuBound => "gpu_bound",
                PerformanceIssue::CpuBound => "cpu_bound",
                PerformanceIssue::BandwidthBound => "bandwidth_bound",
            },
            IssueKind::Platform(platform) => match platform {
                PlatformIssue::Thermal => "thermal_throttling",
                PlatformIssue::FrequencyScaling => "frequency_scaling",
            },
            IssueKind::Capability(capability) => match capability {
                CapabilityIssue::UnsupportedFeature => "unsupported_feature",
                CapabilityIssue::UnstableBackend => "unstable_backend",
            },
            IssueKind::Recovery(recovery) => match recovery {
                RecoveryIssue::Attempted => "recovery_attempted",
                RecoveryIssue::Succeeded => "recovery_succeeded",
                RecoveryIssue::Failed => "recovery_failed",
                RecoveryIssue::FallbackActivated => "fallback_activated",
            },
            IssueKind::Health(health) => match health {
                HealthIssue::FrameTimeInstability => "frame_time_instability",
                HealthIssue::ConsecutiveSpikeFrames => "consecutive_spike_frames",
                HealthIssue::ConsecutiveErrors => "consecutive_errors",
                HealthIssue::MemoryPressure => "memory_pressure",
                HealthIssue::CircuitOpen => "circuit_open",
            },
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Corrective action requested from the external managers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RecoveryStrategy {
    /// Nothing to do.
    None,
    /// Retry the last operation.
    Retry,
    /// Move the operation to another backend.
    Reroute,
    /// Rebuild the pipeline used by the call.
    RebuildPipeline,
    /// Rebuild the resource used by the call.
    RebuildResource,
    /// Evict resources, then retry.
    EvictAndRetry,
    /// Defragment device memory.
    Defragment,
    /// Lower rendering quality.
    DowngradeQuality,
    /// Replace the shader with a simpler variant.
    SimplifyShader,
    /// Replace the shader with a CPU fallback.
    CpuFallbackShader,
    /// Flush pending work.
    EmergencyFlush,
    /// Release transient memory.
    EmergencyGc,
    /// Reset the device. Never retried automatically.
    DeviceReset,
    /// Enter a reduced-functionality mode.
    GracefulDegradation,
}

impl RecoveryStrategy {
    /// Lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            RecoveryStrategy::None => "none",
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::Reroute => "reroute",
            RecoveryStrategy::RebuildPipeline => "rebuild_pipeline",
            RecoveryStrategy::RebuildResource => "rebuild_resource",
            RecoveryStrategy::EvictAndRetry => "evict_and_retry",
            RecoveryStrategy::Defragment => "defragment",
            RecoveryStrategy::DowngradeQuality => "downgrade_quality",
            RecoveryStrategy::SimplifyShader => "simplify_shader",
            RecoveryStrategy::CpuFallbackShader => "cpu_fallback_shader",
            RecoveryStrategy::EmergencyFlush => "emergency_flush",
            RecoveryStrategy::EmergencyGc => "emergency_gc",
            RecoveryStrategy::DeviceReset => "device_reset",
            RecoveryStrategy::GracefulDegradation => "graceful_degradation",
        }
    }

    /// Whether there is anything to execute.
    pub const fn is_actionable(self) -> bool {
        !matches!(self, RecoveryStrategy::None)
    }

    /// Attempts allowed per cool-down, overriding the configured budget.
    pub const fn attempt_cap(self) -> Option<u32> {
        match self {
            RecoveryStrategy::DeviceReset => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where subsequent calls for the affected site should go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RoutingDecision {
    /// Keep using the same backend.
    Continue,
    /// Use a fallback if one is healthy.
    PreferFallback,
    /// Stop using this backend for the call site.
    ForceFallback,
    /// Stop issuing the call until the host intervenes.
    Block,
}

impl fmt::Display for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoutingDecision::Continue => "continue",
            RoutingDecision::PreferFallback => "prefer_fallback",
            RoutingDecision::ForceFallback => "force_fallback",
            RoutingDecision::Block => "block",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Severe < Severity::Critical);
        assert_eq!(
            [Severity::High, Severity::Info, Severity::Critical]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn fixed_strategy_table() {
        assert_eq!(
            IssueKind::Memory(MemoryIssue::Exhaustion).suggested_strategy(),
            RecoveryStrategy::EvictAndRetry
        );
        assert_eq!(
            IssueKind::Shader(ShaderIssue::CompileError).suggested_strategy(),
            RecoveryStrategy::SimplifyShader
        );
        assert_eq!(
            IssueKind::Sync(SyncIssue::WaitTimeout).suggested_strategy(),
            RecoveryStrategy::EmergencyFlush
        );
        assert_eq!(
            IssueKind::Driver(DriverIssue::DeviceLost).suggested_strategy(),
            RecoveryStrategy::DeviceReset
        );
        assert_eq!(
            IssueKind::Driver(DriverIssue::DeviceLost).suggested_routing(),
            RoutingDecision::Block
        );
        assert_eq!(IssueKind::None.suggested_strategy(), RecoveryStrategy::None);
        assert_eq!(IssueKind::Unclassified.suggested_strategy(), RecoveryStrategy::Retry);
    }

    #[test]
    fn device_reset_is_single_shot() {
        assert_eq!(RecoveryStrategy::DeviceReset.attempt_cap(), Some(1));
        assert_eq!(RecoveryStrategy::Retry.attempt_cap(), None);
    }

    #[test]
    fn labels_are_snake_case() {
        assert_eq!(
            IssueKind::Timing(TimingIssue::CatastrophicStall).to_string(),
            "catastrophic_stall"
        );
        assert_eq!(
            IssueKind::Recovery(RecoveryIssue::FallbackActivated).to_string(),
            "fallback_activated"
        );
    }
}
