//! Diagnostics reports.
//!
//! The hot path only fills a [`ReportDraft`]; formatting happens when a worker
//! turns it into a [`DiagnosticsReport`].

use std::{borrow::Cow, collections::BTreeMap, fmt::Write as _};

use crate::{
    call_key::CallKey,
    classify::{FailureInfo, SpikeAnalysis},
    issue::{IssueKind, RecoveryStrategy, RoutingDecision, Severity},
    stats::CallStatsSnapshot,
};

/// Free-form key/value annotations of a report.
pub type Metadata = BTreeMap<Cow<'static, str>, String>;

/// Everything known about an anomaly at detection time.
#[derive(Clone, Debug)]
pub struct ReportDraft {
    /// Affected call site.
    pub key: CallKey,
    /// Classified issue.
    pub kind: IssueKind,
    /// Severity.
    pub severity: Severity,
    /// Duration of the offending call; zero for aggregate findings.
    pub duration_nanos: u64,
    /// Statistics the classification was based on.
    pub stats: CallStatsSnapshot,
    /// Short explanation.
    pub reason: Cow<'static, str>,
    /// Deviation from the reference, as reported by the classifier.
    pub deviation_factor: f64,
    /// `Display` output of the failure, if the call failed.
    pub cause: Option<String>,
    /// Native error code, if known.
    pub error_code: Option<i64>,
    /// Corrective action to attempt.
    pub strategy: RecoveryStrategy,
    /// Where subsequent calls should go.
    pub routing: RoutingDecision,
    /// Extra annotations.
    pub metadata: Metadata,
    /// Detection time.
    pub timestamp_nanos: u64,
}

impl ReportDraft {
    /// Draft for a classified call.
    pub fn from_analysis(
        key: CallKey,
        analysis: &SpikeAnalysis,
        duration_nanos: u64,
        stats: CallStatsSnapshot,
        now: u64,
    ) -> Self {
        Self {
            key,
            kind: analysis.kind,
            severity: analysis.severity,
            duration_nanos,
            stats,
            reason: analysis.reason.clone(),
            deviation_factor: analysis.deviation_factor,
            cause: None,
            error_code: None,
            strategy: analysis.kind.suggested_strategy(),
            routing: analysis.kind.suggested_routing(),
            metadata: Metadata::new(),
            timestamp_nanos: now,
        }
    }

    /// Draft for a finding that is not tied to a single call.
    pub fn advisory(
        key: CallKey,
        kind: IssueKind,
        severity: Severity,
        reason: impl Into<Cow<'static, str>>,
        now: u64,
    ) -> Self {
        Self {
            key,
            kind,
            severity,
            duration_nanos: 0,
            stats: CallStatsSnapshot::default(),
            reason: reason.into(),
            deviation_factor: 0.0,
            cause: None,
            error_code: None,
            strategy: kind.suggested_strategy(),
            routing: kind.suggested_routing(),
            metadata: Metadata::new(),
            timestamp_nanos: now,
        }
    }

    /// Attaches the failure that caused the report.
    pub fn with_failure(mut self, failure: &FailureInfo) -> Self {
        self.cause = Some(format!("{}: {}", failure.type_name, failure.message));
        self.error_code = failure.code;
        self
    }

    /// Attaches a native error code.
    pub fn with_error_code(mut self, code: i64) -> Self {
        self.error_code = Some(code);
        self
    }

    /// Overrides the suggested strategy.
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Overrides the suggested routing decision.
    pub fn with_routing(mut self, routing: RoutingDecision) -> Self {
        self.routing = routing;
        self
    }

    /// Adds an annotation.
    pub fn with_metadata(mut self, key: impl Into<Cow<'static, str>>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

/// Immutable report delivered to sinks and managers.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DiagnosticsReport {
    /// Engine-unique id, increasing in build order.
    pub id: u64,
    /// Detection time.
    pub timestamp_nanos: u64,
    /// Affected call site.
    pub key: CallKey,
    /// Classified issue.
    pub kind: IssueKind,
    /// Severity.
    pub severity: Severity,
    /// Duration of the offending call; zero for aggregate findings.
    pub duration_nanos: u64,
    /// Statistics at detection time.
    pub stats: CallStatsSnapshot,
    /// One-line summary.
    pub message: String,
    /// Multi-line explanation.
    pub analysis: String,
    /// Failure that caused the report.
    pub cause: Option<String>,
    /// Native error code.
    pub error_code: Option<i64>,
    /// Corrective action to attempt.
    pub strategy: RecoveryStrategy,
    /// Where subsequent calls should go.
    pub routing: RoutingDecision,
    /// Extra annotations.
    pub metadata: Metadata,
}

impl DiagnosticsReport {
    /// Formats a draft.
    pub fn build(id: u64, draft: ReportDraft) -> Self {
        let message = format!(
            "[{}] {} on {}: {}",
            draft.severity, draft.kind, draft.key, draft.reason
        );
        let analysis = render_analysis(&draft);
        Self {
            id,
            timestamp_nanos: draft.timestamp_nanos,
            key: draft.key,
            kind: draft.kind,
            severity: draft.severity,
            duration_nanos: draft.duration_nanos,
            stats: draft.stats,
            message,
            analysis,
            cause: draft.cause,
            error_code: draft.error_code,
            strategy: draft.strategy,
            routing: draft.routing,
            metadata: draft.metadata,
        }
    }

    /// Whether the report skips the queue.
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    /// Whether a recovery task should be considered.
    pub fn wants_recovery(&self) -> bool {
        self.strategy.is_actionable()
    }
}

fn render_analysis(draft: &ReportDraft) -> String {
    let stats = &draft.stats;
    let mut out = String::new();
    let _ = writeln!(out, "issue: {} ({})", draft.kind, draft.severity);
    let _ = writeln!(out, "call site: {}", draft.key);
    if draft.duration_nanos > 0 {
        let _ = writeln!(
            out,
            "duration: {:.3}ms ({:.1}x reference)",
            ms(draft.duration_nanos as f64),
            draft.deviation_factor
        );
    }
    if stats.count > 0 {
        let _ = writeln!(
            out,
            "history: {} calls, mean {:.3}ms, ewma {:.3}ms, stddev {:.3}ms, min {:.3}ms, max {:.3}ms",
            stats.count,
            ms(stats.mean_nanos()),
            ms(stats.ewma_nanos),
            ms(stats.stddev_nanos()),
            ms(stats.min_nanos as f64),
            ms(stats.max_nanos as f64),
        );
        let _ = writeln!(
            out,
            "spikes: {}, errors: {} ({:.1}%)",
            stats.spike_count,
            stats.error_count,
            stats.error_rate() * 100.0
        );
        if stats.upward_trend {
            let _ = writeln!(out, "latency is trending upward");
        }
    }
    if let Some(cause) = &draft.cause {
        let _ = writeln!(out, "cause: {cause}");
    }
    if let Some(code) = draft.error_code {
        let _ = writeln!(out, "error code: {code} ({code:#x})");
    }
    let _ = writeln!(out, "reason: {}", draft.reason);
    let _ = write!(
        out,
        "suggested strategy: {}, routing: {}",
        draft.strategy, draft.routing
    );
    for (key, value) in &draft.metadata {
        let _ = write!(out, "\n{key}: {value}");
    }
    out
}

fn ms(nanos: f64) -> f64 {
    nanos / 1_000_000.0
}
