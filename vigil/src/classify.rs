//! Spike and failure classification.
//!
//! ## Usage
//!
//! Both entry points are pure functions. [`analyze_timing`] runs a cascade of
//! independent strategies over a statistics snapshot taken *before* the sample
//! was recorded, so the sample under test never dilutes its own baseline. The
//! most severe verdict wins; on a tie the earlier strategy wins.
//!
//! [`classify_failure`] bypasses the timing strategies entirely. It prefers a
//! structured hint from the error type, then a native error code, and only then
//! falls back to keyword matching over the error's type name and message.

use std::{borrow::Cow, error::Error, fmt, io};

use crate::{
    call_key::{Backend, CallCategory, CallKey},
    config::{CategoryThresholds, SpikeThresholds},
    issue::{
        CapabilityIssue, DrawIssue, DriverIssue, IssueKind, MemoryIssue, ResourceIssue, Severity,
        ShaderIssue, SyncIssue, TimingIssue,
    },
    stats::CallStatsSnapshot,
};

/// Verdict for one call.
#[derive(Clone, Debug, PartialEq)]
pub struct SpikeAnalysis {
    /// Whether the verdict is worth a report (severity at least [`Severity::Low`]).
    pub is_spike: bool,
    /// Classified issue.
    pub kind: IssueKind,
    /// Severity of the issue.
    pub severity: Severity,
    /// How far the call was from its reference, in units of that reference.
    pub deviation_factor: f64,
    /// Short explanation.
    pub reason: Cow<'static, str>,
}

impl SpikeAnalysis {
    /// A normal call.
    pub fn none() -> Self {
        Self {
            is_spike: false,
            kind: IssueKind::None,
            severity: Severity::Info,
            deviation_factor: 0.0,
            reason: Cow::Borrowed("within normal range"),
        }
    }

    /// Creates a verdict; `is_spike` follows from `severity`.
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        deviation_factor: f64,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            is_spike: severity >= Severity::Low,
            kind,
            severity,
            deviation_factor,
            reason: reason.into(),
        }
    }

    fn more_severe(self, other: Option<SpikeAnalysis>) -> Self {
        match other {
            Some(other) if other.severity > self.severity => other,
            _ => self,
        }
    }
}

/// Classifies a completed call by its duration.
pub fn analyze_timing(
    key: &CallKey,
    duration_nanos: u64,
    snapshot: &CallStatsSnapshot,
    thresholds: &SpikeThresholds,
) -> SpikeAnalysis {
    let mut verdict = absolute(key.category(), duration_nanos, thresholds)
        .unwrap_or_else(SpikeAnalysis::none);
    verdict = verdict.more_severe(relative(duration_nanos, snapshot, thresholds));
    verdict = verdict.more_severe(variance(duration_nanos, snapshot, thresholds));
    if snapshot.upward_trend {
        verdict = verdict.more_severe(Some(SpikeAnalysis::new(
            IssueKind::Timing(TimingIssue::UpwardTrend),
            Severity::Low,
            1.0,
            "latency has been trending upward",
        )));
    }
    verdict
}

fn absolute(
    category: CallCategory,
    duration_nanos: u64,
    thresholds: &SpikeThresholds,
) -> Option<SpikeAnalysis> {
    let stall = nanos(thresholds.catastrophic_stall);
    if duration_nanos >= stall {
        return Some(SpikeAnalysis::new(
            IssueKind::Timing(TimingIssue::CatastrophicStall),
            Severity::Critical,
            ratio(duration_nanos, stall),
            "duration exceeded the catastrophic stall threshold",
        ));
    }
    if let Some(verdict) = category_override(category, duration_nanos, thresholds) {
        return verdict;
    }

    let tiers = [
        (thresholds.severe_stutter, TimingIssue::SevereStutter, Severity::Severe),
        (thresholds.visible_stutter, TimingIssue::VisibleStutter, Severity::High),
        (thresholds.medium_spike, TimingIssue::MediumSpike, Severity::Medium),
        (thresholds.small_spike, TimingIssue::SmallSpike, Severity::Low),
        (thresholds.micro_spike, TimingIssue::MicroSpike, Severity::Info),
    ];
    tiers.into_iter().find_map(|(limit, issue, severity)| {
        let limit = nanos(limit);
        (duration_nanos >= limit).then(|| {
            SpikeAnalysis::new(
                IssueKind::Timing(issue),
                severity,
                ratio(duration_nanos, limit),
                format!("{duration_nanos}ns is above the {} tier", IssueKind::Timing(issue)),
            )
        })
    })
}

/// `Some(verdict)` when `category` has its own thresholds; the inner value is
/// `None` when the call stayed under them.
fn category_override(
    category: CallCategory,
    duration_nanos: u64,
    thresholds: &SpikeThresholds,
) -> Option<Option<SpikeAnalysis>> {
    let (limits, slow, stall) = match category {
        CallCategory::ShaderCompile | CallCategory::ShaderLink => (
            thresholds.shader,
            (IssueKind::Shader(ShaderIssue::SlowCompile), Severity::Medium),
            (IssueKind::Shader(ShaderIssue::CompileTimeout), Severity::Severe),
        ),
        CallCategory::FenceWait | CallCategory::SemaphoreWait => (
            thresholds.sync_wait,
            (IssueKind::Sync(SyncIssue::WaitStall), Severity::Medium),
            (IssueKind::Sync(SyncIssue::WaitTimeout), Severity::Severe),
        ),
        CallCategory::QueueSubmit => (
            thresholds.queue_submit,
            (IssueKind::Sync(SyncIssue::QueueSubmitStall), Severity::Medium),
            (IssueKind::Sync(SyncIssue::QueueSubmitTimeout), Severity::Severe),
        ),
        CallCategory::PipelineCreate => (
            thresholds.pipeline_create,
            (IssueKind::Resource(ResourceIssue::SlowPipelineCreation), Severity::Low),
            (IssueKind::Resource(ResourceIssue::PipelineCreationStall), Severity::High),
        ),
        _ => return None,
    };
    Some(category_verdict(duration_nanos, limits, slow, stall, category))
}

fn category_verdict(
    duration_nanos: u64,
    limits: CategoryThresholds,
    slow: (IssueKind, Severity),
    stall: (IssueKind, Severity),
    category: CallCategory,
) -> Option<SpikeAnalysis> {
    let (stall_limit, slow_limit) = (nanos(limits.stall), nanos(limits.slow));
    let (limit, (kind, severity)) = if duration_nanos >= stall_limit {
        (stall_limit, stall)
    } else if duration_nanos >= slow_limit {
        (slow_limit, slow)
    } else {
        return None;
    };
    Some(SpikeAnalysis::new(
        kind,
        severity,
        ratio(duration_nanos, limit),
        format!("{category} took {duration_nanos}ns, limit {limit}ns"),
    ))
}

fn relative(
    duration_nanos: u64,
    snapshot: &CallStatsSnapshot,
    thresholds: &SpikeThresholds,
) -> Option<SpikeAnalysis> {
    if snapshot.count < thresholds.ewma_min_samples || snapshot.ewma_nanos <= 0.0 {
        return None;
    }
    let factor = duration_nanos as f64 / snapshot.ewma_nanos;
    let (issue, severity) = if factor >= thresholds.ewma_severe_factor {
        (TimingIssue::RelativeSpike, Severity::Severe)
    } else if factor >= thresholds.ewma_elevated_factor {
        (TimingIssue::ElevatedLatency, Severity::Medium)
    } else {
        return None;
    };
    Some(SpikeAnalysis::new(
        IssueKind::Timing(issue),
        severity,
        factor,
        format!("{factor:.1}x the moving average"),
    ))
}

fn variance(
    duration_nanos: u64,
    snapshot: &CallStatsSnapshot,
    thresholds: &SpikeThresholds,
) -> Option<SpikeAnalysis> {
    if snapshot.count < thresholds.variance_min_samples {
        return None;
    }
    let mean = snapshot.mean_nanos();
    let stddev = snapshot
        .stddev_nanos()
        .max(mean * thresholds.stddev_floor_ratio);
    if stddev <= 0.0 {
        return None;
    }
    let z = (duration_nanos as f64 - mean) / stddev;
    let severity = if z >= thresholds.variance_severe_sigma {
        Severity::High
    } else if z >= thresholds.variance_elevated_sigma {
        Severity::Low
    } else {
        return None;
    };
    Some(SpikeAnalysis::new(
        IssueKind::Timing(TimingIssue::VarianceSpike),
        severity,
        z,
        format!("{z:.1} standard deviations above the mean"),
    ))
}

fn nanos(duration: std::time::Duration) -> u64 {
    crate::clock::duration_nanos(duration)
}

fn ratio(value: u64, reference: u64) -> f64 {
    if reference == 0 {
        0.0
    } else {
        value as f64 / reference as f64
    }
}

/// An error type that can describe itself to the classifier.
///
/// The default methods fall back to keyword matching over the `Display`
/// output. Implement [`Self::error_code`] or [`Self::issue_hint`] when the
/// error carries structured information.
pub trait Diagnosable: fmt::Display {
    /// Native backend error code, if known.
    fn error_code(&self) -> Option<i64> {
        None
    }

    /// Classification known without inspecting the message.
    fn issue_hint(&self) -> Option<(IssueKind, Severity)> {
        None
    }
}

impl Diagnosable for String {}

impl Diagnosable for &'static str {}

impl Diagnosable for io::Error {
    fn error_code(&self) -> Option<i64> {
        self.raw_os_error().map(i64::from)
    }

    fn issue_hint(&self) -> Option<(IssueKind, Severity)> {
        match self.kind() {
            io::ErrorKind::OutOfMemory => {
                Some((IssueKind::Memory(MemoryIssue::Exhaustion), Severity::Severe))
            }
            io::ErrorKind::TimedOut => Some((IssueKind::Sync(SyncIssue::WaitTimeout), Severity::Severe)),
            io::ErrorKind::Unsupported => Some((
                IssueKind::Capability(CapabilityIssue::UnsupportedFeature),
                Severity::Medium,
            )),
            _ => None,
        }
    }
}

impl Diagnosable for Box<dyn Error + Send + Sync> {
    fn error_code(&self) -> Option<i64> {
        self.downcast_ref::<io::Error>().and_then(Diagnosable::error_code)
    }

    fn issue_hint(&self) -> Option<(IssueKind, Severity)> {
        self.downcast_ref::<io::Error>().and_then(Diagnosable::issue_hint)
    }
}

#[cfg(feature = "wgpu")]
impl Diagnosable for wgpu::Error {
    fn issue_hint(&self) -> Option<(IssueKind, Severity)> {
        match self {
            wgpu::Error::OutOfMemory { .. } => {
                Some((IssueKind::Memory(MemoryIssue::Exhaustion), Severity::Severe))
            }
            wgpu::Error::Validation { .. } => Some((
                IssueKind::Shader(ShaderIssue::ValidationError),
                Severity::High,
            )),
            _ => None,
        }
    }
}

/// What the classifier knows about a failed call. Built only on the failure
/// path.
#[derive(Clone, Debug, PartialEq)]
pub struct FailureInfo {
    /// Rust type name of the error.
    pub type_name: Cow<'static, str>,
    /// `Display` output of the error.
    pub message: String,
    /// Native error code, if any.
    pub code: Option<i64>,
    /// Structured classification, if the error provided one.
    pub hint: Option<(IssueKind, Severity)>,
}

impl FailureInfo {
    /// Captures a [`Diagnosable`] error.
    pub fn from_error<E: Diagnosable>(error: &E) -> Self {
        Self {
            type_name: Cow::Borrowed(short_type_name(std::any::type_name::<E>())),
            message: error.to_string(),
            code: error.error_code(),
            hint: error.issue_hint(),
        }
    }

    /// A failure described only by a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            type_name: Cow::Borrowed("message"),
            message: message.into(),
            code: None,
            hint: None,
        }
    }

    /// Attaches a native error code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

/// `alloc::boxed::Box<dyn Error>` becomes `Box`, so module paths never feed
/// the keyword matcher.
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Classifies a failed call.
pub fn classify_failure(key: &CallKey, failure: &FailureInfo) -> SpikeAnalysis {
    if let Some((kind, severity)) = failure.hint {
        return SpikeAnalysis::new(kind, severity, 0.0, failure.message.clone());
    }
    let code = failure
        .code
        .or_else(|| extract_error_code(&failure.message));
    if let Some(code) = code
        && let Some(verdict) = classify_error_code(key.backend(), code)
    {
        return verdict;
    }
    let (kind, severity) = classify_keywords(key.category(), &failure.type_name, &failure.message);
    SpikeAnalysis::new(kind, severity, 0.0, failure.message.clone())
}

fn classify_keywords(category: CallCategory, type_name: &str, message: &str) -> (IssueKind, Severity) {
    let text = format!("{type_name} {message}").to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if has(&["device lost", "device_lost", "devicelost", "device removed", "device reset", "device hung", "context lost"]) {
        return (IssueKind::Driver(DriverIssue::DeviceLost), Severity::Critical);
    }
    if has(&["driver crash", "crashed"]) {
        return (IssueKind::Driver(DriverIssue::Crash), Severity::Critical);
    }
    if has(&["incompatible driver", "version mismatch"]) {
        return (IssueKind::Driver(DriverIssue::VersionMismatch), Severity::High);
    }
    if has(&["fragment"]) && has(&["memory", "pool", "heap"]) {
        return (IssueKind::Memory(MemoryIssue::Fragmentation), Severity::High);
    }
    if has(&["out of memory", "out_of_memory", "outofmemory", "exhausted"]) {
        return (IssueKind::Memory(MemoryIssue::Exhaustion), Severity::Severe);
    }
    if has(&["alloc"]) {
        return (IssueKind::Memory(MemoryIssue::AllocationFailure), Severity::High);
    }
    if has(&["timeout", "timed out"]) {
        let kind = if category.is_shader() || has(&["shader", "compile"]) {
            IssueKind::Shader(ShaderIssue::CompileTimeout)
        } else if category == CallCategory::QueueSubmit {
            IssueKind::Sync(SyncIssue::QueueSubmitTimeout)
        } else {
            IssueKind::Sync(SyncIssue::WaitTimeout)
        };
        return (kind, Severity::Severe);
    }
    if has(&["validation"]) {
        return (IssueKind::Shader(ShaderIssue::ValidationError), Severity::High);
    }
    if has(&["link"]) {
        return (IssueKind::Shader(ShaderIssue::LinkError), Severity::High);
    }
    if has(&["shader", "compile"]) {
        return (IssueKind::Shader(ShaderIssue::CompileError), Severity::High);
    }
    if has(&["pipeline"]) {
        return (IssueKind::Resource(ResourceIssue::PipelineCreationFailure), Severity::High);
    }
    if has(&["framebuffer"]) {
        return (IssueKind::Resource(ResourceIssue::FramebufferIncomplete), Severity::Medium);
    }
    if has(&["texture"]) {
        return (IssueKind::Resource(ResourceIssue::TextureFailure), Severity::Medium);
    }
    if has(&["instanc"]) {
        return (IssueKind::Draw(DrawIssue::InstancingFailure), Severity::Medium);
    }
    (IssueKind::Unclassified, Severity::Medium)
}

/// Maps a backend-native error code to an issue.
pub fn classify_error_code(backend: Backend, code: i64) -> Option<SpikeAnalysis> {
    let (kind, severity, name) = match backend {
        Backend::Vulkan => vulkan_code(code)?,
        Backend::OpenGl | Backend::OpenGlEs => gl_code(code)?,
        Backend::Direct3D11 | Backend::Direct3D12 => hresult_code(code)?,
        Backend::Metal => metal_code(code)?,
        Backend::WebGpu => return None,
    };
    Some(SpikeAnalysis::new(
        kind,
        severity,
        0.0,
        format!("{backend} returned {name} ({code})"),
    ))
}

type CodeVerdict = (IssueKind, Severity, &'static str);

fn vulkan_code(code: i64) -> Option<CodeVerdict> {
    Some(match code {
        2 => (IssueKind::Sync(SyncIssue::WaitTimeout), Severity::Severe, "VK_TIMEOUT"),
        -1 => (
            IssueKind::Memory(MemoryIssue::Exhaustion),
            Severity::Severe,
            "VK_ERROR_OUT_OF_HOST_MEMORY",
        ),
        -2 => (
            IssueKind::Memory(MemoryIssue::Exhaustion),
            Severity::Severe,
            "VK_ERROR_OUT_OF_DEVICE_MEMORY",
        ),
        -3 => (
            IssueKind::Capability(CapabilityIssue::UnstableBackend),
            Severity::High,
            "VK_ERROR_INITIALIZATION_FAILED",
        ),
        -4 => (
            IssueKind::Driver(DriverIssue::DeviceLost),
            Severity::Critical,
            "VK_ERROR_DEVICE_LOST",
        ),
        -5 => (
            IssueKind::Memory(MemoryIssue::AllocationFailure),
            Severity::High,
            "VK_ERROR_MEMORY_MAP_FAILED",
        ),
        -7 | -8 => (
            IssueKind::Capability(CapabilityIssue::UnsupportedFeature),
            Severity::Medium,
            "VK_ERROR_FEATURE_NOT_PRESENT",
        ),
        -9 => (
            IssueKind::Driver(DriverIssue::VersionMismatch),
            Severity::High,
            "VK_ERROR_INCOMPATIBLE_DRIVER",
        ),
        -12 => (
            IssueKind::Memory(MemoryIssue::Fragmentation),
            Severity::High,
            "VK_ERROR_FRAGMENTED_POOL",
        ),
        -1_000_069_000 => (
            IssueKind::Memory(MemoryIssue::AllocationFailure),
            Severity::High,
            "VK_ERROR_OUT_OF_POOL_MEMORY",
        ),
        -1_000_001_004 => (
            IssueKind::Resource(ResourceIssue::FramebufferIncomplete),
            Severity::Medium,
            "VK_ERROR_OUT_OF_DATE_KHR",
        ),
        _ => return None,
    })
}

fn gl_code(code: i64) -> Option<CodeVerdict> {
    Some(match code {
        0x0505 => (
            IssueKind::Memory(MemoryIssue::Exhaustion),
            Severity::Severe,
            "GL_OUT_OF_MEMORY",
        ),
        0x0506 => (
            IssueKind::Resource(ResourceIssue::FramebufferIncomplete),
            Severity::Medium,
            "GL_INVALID_FRAMEBUFFER_OPERATION",
        ),
        0x0507 => (
            IssueKind::Driver(DriverIssue::DeviceLost),
            Severity::Critical,
            "GL_CONTEXT_LOST",
        ),
        _ => return None,
    })
}

/// HRESULTs arrive either sign-extended or as their unsigned bit pattern.
fn hresult_code(code: i64) -> Option<CodeVerdict> {
    Some(match code as u32 {
        0x887A_0005 => (
            IssueKind::Driver(DriverIssue::DeviceLost),
            Severity::Critical,
            "DXGI_ERROR_DEVICE_REMOVED",
        ),
        0x887A_0006 => (
            IssueKind::Driver(DriverIssue::DeviceLost),
            Severity::Critical,
            "DXGI_ERROR_DEVICE_HUNG",
        ),
        0x887A_0007 => (
            IssueKind::Driver(DriverIssue::DeviceLost),
            Severity::Critical,
            "DXGI_ERROR_DEVICE_RESET",
        ),
        0x887A_0020 => (
            IssueKind::Driver(DriverIssue::Crash),
            Severity::Critical,
            "DXGI_ERROR_DRIVER_INTERNAL_ERROR",
        ),
        0x8007_000E => (
            IssueKind::Memory(MemoryIssue::Exhaustion),
            Severity::Severe,
            "E_OUTOFMEMORY",
        ),
        _ => return None,
    })
}

fn metal_code(code: i64) -> Option<CodeVerdict> {
    Some(match code {
        2 => (
            IssueKind::Sync(SyncIssue::WaitTimeout),
            Severity::Severe,
            "MTLCommandBufferErrorTimeout",
        ),
        3 => (
            IssueKind::Draw(DrawIssue::Corruption),
            Severity::High,
            "MTLCommandBufferErrorPageFault",
        ),
        4 => (
            IssueKind::Capability(CapabilityIssue::UnstableBackend),
            Severity::High,
            "MTLCommandBufferErrorAccessRevoked",
        ),
        8 => (
            IssueKind::Memory(MemoryIssue::Exhaustion),
            Severity::Severe,
            "MTLCommandBufferErrorOutOfMemory",
        ),
        9 => (
            IssueKind::Resource(ResourceIssue::TextureFailure),
            Severity::Medium,
            "MTLCommandBufferErrorInvalidResource",
        ),
        11 => (
            IssueKind::Driver(DriverIssue::DeviceLost),
            Severity::Critical,
            "MTLCommandBufferErrorDeviceRemoved",
        ),
        _ => return None,
    })
}

/// Best-effort recovery of a native code from message text, used only when
/// the error carried no structured code. Recognizes a `0x`-prefixed hex word
/// or a signed integer following `code` or `error`.
pub fn extract_error_code(message: &str) -> Option<i64> {
    let lower = message.to_ascii_lowercase();
    if let Some(start) = lower.find("0x") {
        let digits: String = lower[start + 2..]
            .chars()
            .take_while(char::is_ascii_hexdigit)
            .collect();
        if !digits.is_empty()
            && let Ok(value) = u32::from_str_radix(&digits, 16)
        {
            return Some(i64::from(value));
        }
    }
    for marker in ["code", "error"] {
        let mut search = lower.as_str();
        while let Some(index) = search.find(marker) {
            let rest = search[index + marker.len()..].trim_start_matches([' ', ':', '=', '(']);
            let end = rest
                .char_indices()
                .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
                .map_or(rest.len(), |(i, _)| i);
            if let Ok(value) = rest[..end].parse::<i64>() {
                return Some(value);
            }
            search = &search[index + marker.len()..];
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::CallStats;

    const DRAW: CallKey = CallKey::new(Backend::Vulkan, CallCategory::Draw, "vkCmdDraw");
    const MS: u64 = 1_000_000;

    fn stable_history(mean: u64, count: usize) -> CallStatsSnapshot {
        let stats = CallStats::new(0.1);
        for i in 0..count {
            // +-1% jitter
            let jitter = if i % 2 == 0 { mean / 100 } else { 0 };
            stats.record(mean - mean / 200 + jitter, i as u64);
        }
        stats.snapshot(0.1)
    }

    #[test]
    fn catastrophic_stall_ignores_history() {
        let thresholds = SpikeThresholds::default();
        let stall = crate::clock::duration_nanos(thresholds.catastrophic_stall);
        for snapshot in [
            CallStatsSnapshot::default(),
            stable_history(300 * MS, 100),
        ] {
            for key in [
                DRAW,
                CallKey::new(Backend::OpenGl, CallCategory::ShaderCompile, "glCompileShader"),
                CallKey::new(Backend::Vulkan, CallCategory::FenceWait, "vkWaitForFences"),
            ] {
                let verdict = analyze_timing(&key, stall, &snapshot, &thresholds);
                assert_eq!(verdict.severity, Severity::Critical, "{key}");
                assert!(verdict.is_spike);
            }
        }
    }

    #[test]
    fn severe_relative_spike_over_stable_history() {
        let thresholds = SpikeThresholds::default();
        let snapshot = stable_history(MS, 200);
        let verdict = analyze_timing(&DRAW, 5 * MS + MS / 10, &snapshot, &thresholds);
        assert!(verdict.is_spike);
        assert!(verdict.severity >= Severity::Severe);
        assert_eq!(verdict.kind, IssueKind::Timing(TimingIssue::RelativeSpike));

        let verdict = analyze_timing(&DRAW, 20 * MS, &snapshot, &thresholds);
        assert!(verdict.severity >= Severity::Severe);
    }

    #[test]
    fn one_percent_over_mean_is_not_a_spike() {
        let thresholds = SpikeThresholds::default();
        let snapshot = stable_history(MS, 1_000);
        let verdict = analyze_timing(&DRAW, MS + MS / 100, &snapshot, &thresholds);
        assert!(!verdict.is_spike, "{verdict:?}");
    }

    #[test]
    fn relative_tests_wait_for_enough_samples() {
        let thresholds = SpikeThresholds::default();
        let snapshot = stable_history(100_000, 4);
        // 1.5ms is 15x the mean but only just above the micro tier.
        let verdict = analyze_timing(&DRAW, 1_500_000, &snapshot, &thresholds);
        assert!(!verdict.is_spike);
        assert_eq!(verdict.kind, IssueKind::Timing(TimingIssue::MicroSpike));
    }

    #[test]
    fn variance_floor_prevents_zero_sigma_blowups() {
        let thresholds = SpikeThresholds::default();
        let stats = CallStats::new(0.1);
        for _ in 0..100 {
            stats.record(100_000, 0);
        }
        let snapshot = stats.snapshot(0.1);
        // 3% above a constant history: z = 0.6 against a 5% floor.
        let verdict = analyze_timing(&DRAW, 103_000, &snapshot, &thresholds);
        assert_eq!(verdict, SpikeAnalysis::none());
    }

    #[test]
    fn trend_emits_low_advisory() {
        let thresholds = SpikeThresholds::default();
        let snapshot = CallStatsSnapshot {
            count: 40,
            upward_trend: true,
            ..CallStatsSnapshot::default()
        };
        let verdict = analyze_timing(&DRAW, 10_000, &snapshot, &thresholds);
        assert_eq!(verdict.kind, IssueKind::Timing(TimingIssue::UpwardTrend));
        assert_eq!(verdict.severity, Severity::Low);
    }

    #[test]
    fn category_overrides_replace_generic_tiers() {
        let thresholds = SpikeThresholds::default();
        let compile = CallKey::new(Backend::OpenGl, CallCategory::ShaderCompile, "glCompileShader");
        // 20ms would be a visible stutter for a draw, but is normal for a compile.
        let verdict = analyze_timing(&compile, 20 * MS, &CallStatsSnapshot::default(), &thresholds);
        assert!(!verdict.is_spike);
        let verdict = analyze_timing(&compile, 60 * MS, &CallStatsSnapshot::default(), &thresholds);
        assert_eq!(verdict.kind, IssueKind::Shader(ShaderIssue::SlowCompile));

        let fence = CallKey::new(Backend::Vulkan, CallCategory::FenceWait, "vkWaitForFences");
        let verdict = analyze_timing(&fence, 120 * MS, &CallStatsSnapshot::default(), &thresholds);
        assert_eq!(verdict.kind, IssueKind::Sync(SyncIssue::WaitTimeout));
        assert_eq!(verdict.severity, Severity::Severe);

        let draw = analyze_timing(&DRAW, 20 * MS, &CallStatsSnapshot::default(), &thresholds);
        assert_eq!(draw.kind, IssueKind::Timing(TimingIssue::VisibleStutter));
    }

    #[test]
    fn keyword_failures() {
        let cases = [
            ("VK_ERROR_DEVICE_LOST: device lost", IssueKind::Driver(DriverIssue::DeviceLost)),
            ("allocation of 4096 bytes failed", IssueKind::Memory(MemoryIssue::AllocationFailure)),
            ("out of memory", IssueKind::Memory(MemoryIssue::Exhaustion)),
            ("fence wait timed out", IssueKind::Sync(SyncIssue::WaitTimeout)),
            ("shader compile failed: unexpected token", IssueKind::Shader(ShaderIssue::CompileError)),
            ("program link failed", IssueKind::Shader(ShaderIssue::LinkError)),
            ("validation layer rejected binding", IssueKind::Shader(ShaderIssue::ValidationError)),
            ("something odd happened", IssueKind::Unclassified),
        ];
        for (message, expected) in cases {
            let verdict = classify_failure(&DRAW, &FailureInfo::message(message));
            assert_eq!(verdict.kind, expected, "{message}");
            assert!(verdict.is_spike);
        }
    }

    #[test]
    fn device_lost_is_critical_and_blocks() {
        let verdict = classify_failure(&DRAW, &FailureInfo::message("Device lost during submit"));
        assert_eq!(verdict.severity, Severity::Critical);
        assert_eq!(
            verdict.kind.suggested_strategy(),
            crate::issue::RecoveryStrategy::DeviceReset
        );
    }

    #[test]
    fn structured_information_beats_keywords() {
        let io = io::Error::new(io::ErrorKind::OutOfMemory, "shader compile failed");
        let verdict = classify_failure(&DRAW, &FailureInfo::from_error(&io));
        assert_eq!(verdict.kind, IssueKind::Memory(MemoryIssue::Exhaustion));

        let coded = FailureInfo::message("shader compile failed").with_code(-4);
        let verdict = classify_failure(&DRAW, &coded);
        assert_eq!(verdict.kind, IssueKind::Driver(DriverIssue::DeviceLost));
    }

    #[test]
    fn type_names_are_shortened() {
        let failure = FailureInfo::from_error(&String::from("boom"));
        assert_eq!(failure.type_name, "String");
        assert_eq!(classify_failure(&DRAW, &failure).kind, IssueKind::Unclassified);
    }

    #[test]
    fn native_codes() {
        let d3d = classify_error_code(Backend::Direct3D12, 0x887A_0005).map(|v| v.kind);
        assert_eq!(d3d, Some(IssueKind::Driver(DriverIssue::DeviceLost)));
        // Sign-extended HRESULT.
        let d3d = classify_error_code(Backend::Direct3D11, 0x887A_0005_u32 as i32 as i64);
        assert_eq!(d3d.map(|v| v.severity), Some(Severity::Critical));
        let gl = classify_error_code(Backend::OpenGl, 0x0505).map(|v| v.kind);
        assert_eq!(gl, Some(IssueKind::Memory(MemoryIssue::Exhaustion)));
        assert!(classify_error_code(Backend::Vulkan, 12_345).is_none());
        assert!(classify_error_code(Backend::WebGpu, -4).is_none());
    }

    #[test]
    fn extracts_codes_from_messages() {
        assert_eq!(extract_error_code("Present failed with 0x887A0005"), Some(0x887A_0005));
        assert_eq!(extract_error_code("vkQueueSubmit error: -4"), Some(-4));
        assert_eq!(extract_error_code("code=1285"), Some(1285));
        assert_eq!(extract_error_code("no numbers here"), None);
    }
}
