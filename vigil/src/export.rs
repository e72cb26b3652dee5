//! Diagnostics output.
//!
//! ## Usage
//!
//! [`Vigil::export_diagnostics`](crate::Vigil::export_diagnostics) renders a
//! plain-text summary of the engine state. With the `export` feature,
//! [`JsonlReportSink`] streams every delivered report to a file for external
//! analysis.
//!
//! ## Format
//!
//! The JSONL file starts with a header line followed by one report per line:
//!
//! ```jsonl
//! {"version":1,"format":"vigil-reports","generated_at":"1767008877"}
//! {"type":"report","id":1,"timestamp_nanos":1000000000,"key":{"backend":"vulkan",...},...}
//! ```

use std::fmt::Write as _;

use crate::{call_key::CallKey, collaborator::guarded, engine::Core, stats::CallStatsSnapshot};

const TOP_SITES: usize = 10;
const TOP_PATTERNS: usize = 10;

/// Renders the plain-text diagnostics export.
pub(crate) fn render(core: &Core) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== vigil diagnostics ==");
    let _ = writeln!(out, "active backend: {}", core.active_backend());

    let _ = writeln!(out, "\n-- counters --");
    for (name, value) in core.counters.snapshot().entries() {
        let _ = writeln!(out, "{name:<24} {value}");
    }

    let _ = writeln!(out, "\n-- circuit breakers --");
    for breaker in core.breakers.snapshots() {
        let _ = writeln!(
            out,
            "{:<10} {:<9} failures={}",
            breaker.backend.to_string(),
            breaker.state.to_string(),
            breaker.consecutive_failures
        );
    }

    let depths = core.pipeline.depths();
    let _ = writeln!(out, "\n-- queues --");
    let _ = writeln!(
        out,
        "jobs={} reports={} recoveries={}",
        depths.jobs, depths.reports, depths.recoveries
    );

    let mut sites = core.stats.snapshot_all(core.config.spike.trend_slope_ratio);
    let _ = writeln!(out, "\n-- slowest call sites (ewma) --");
    sites.sort_by(|a, b| b.1.ewma_nanos.total_cmp(&a.1.ewma_nanos));
    for (key, stats) in sites.iter().take(TOP_SITES) {
        write_site(&mut out, key, stats);
    }
    let _ = writeln!(out, "\n-- spikiest call sites --");
    sites.sort_by(|a, b| b.1.spike_count.cmp(&a.1.spike_count));
    for (key, stats) in sites.iter().take_while(|(_, s)| s.spike_count > 0).take(TOP_SITES) {
        write_site(&mut out, key, stats);
    }

    let patterns = core.draw.summaries();
    let _ = writeln!(out, "\n-- draw patterns ({} tracked) --", patterns.len());
    for pattern in patterns.iter().take(TOP_PATTERNS) {
        let state = if pattern.batching_cached {
            "batched"
        } else if pattern.marked_for_batching {
            "pending"
        } else {
            "direct"
        };
        let _ = writeln!(
            out,
            "{} {:?} draws={} mean={:.3}ms {state}",
            pattern.pattern,
            pattern.descriptor.primitive,
            pattern.occurrences,
            pattern.mean_nanos() / 1e6
        );
    }

    let _ = writeln!(out, "\n-- last frame --");
    match core.frame.last() {
        Some(frame) => {
            let _ = writeln!(
                out,
                "#{} {:.3}ms gpu={:.0}% cpu={:.0}% sync={:.0}% draws={} spike={}",
                frame.index,
                frame.total_nanos as f64 / 1e6,
                frame.gpu_ratio * 100.0,
                frame.cpu_ratio * 100.0,
                frame.sync_ratio * 100.0,
                frame.draw_calls,
                frame.is_spike
            );
            for bottleneck in &frame.bottlenecks {
                let _ = writeln!(out, "bottleneck: {bottleneck:?}");
            }
        }
        None => {
            let _ = writeln!(out, "none");
        }
    }

    if let Some(batcher) = core.collaborators.draw_batcher.get()
        && let Some(report) =
            guarded("draw batcher", || batcher.pattern_report()).flatten()
    {
        let _ = writeln!(out, "\n-- draw batcher --");
        let _ = writeln!(out, "{report}");
    }
    out
}

fn write_site(out: &mut String, key: &CallKey, stats: &CallStatsSnapshot) {
    let _ = writeln!(
        out,
        "{key} calls={} ewma={:.3}ms max={:.3}ms spikes={} errors={}",
        stats.count,
        stats.ewma_nanos / 1e6,
        stats.max_nanos as f64 / 1e6,
        stats.spike_count,
        stats.error_count
    );
}

#[cfg(feature = "export")]
pub use jsonl::JsonlReportSink;

#[cfg(feature = "export")]
mod jsonl {
    use std::{
        fs::{File, OpenOptions, create_dir_all},
        io::{BufWriter, Write},
        path::Path,
        thread::{self, JoinHandle},
        time::{SystemTime, UNIX_EPOCH},
    };

    use crossbeam::channel::{self, Receiver, Sender};
    use parking_lot::Mutex;
    use serde::Serialize;
    use tracing::error;

    use crate::{collaborator::ReportSink, error::VigilError, report::DiagnosticsReport};

    #[derive(Serialize)]
    struct Header {
        version: u32,
        format: &'static str,
        generated_at: String,
    }

    impl Header {
        fn new() -> Self {
            let generated_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs().to_string())
                .unwrap_or_else(|_| String::from("unknown"));
            Self {
                version: 1,
                format: "vigil-reports",
                generated_at,
            }
        }
    }

    #[derive(Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Record {
        Report(DiagnosticsReport),
    }

    /// Writes delivered reports to a JSONL file from a dedicated thread.
    pub struct JsonlReportSink {
        sender: Mutex<Option<Sender<DiagnosticsReport>>>,
        handle: Mutex<Option<JoinHandle<()>>>,
    }

    impl JsonlReportSink {
        /// Truncates or creates `path` and starts the writer thread.
        pub fn create(path: impl AsRef<Path>) -> Result<Self, VigilError> {
            let path = path.as_ref();
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            let (sender, receiver) = channel::unbounded();
            let handle = thread::Builder::new()
                .name("vigil-jsonl".to_owned())
                .spawn(move || writer_loop(BufWriter::new(file), receiver))?;
            Ok(Self {
                sender: Mutex::new(Some(sender)),
                handle: Mutex::new(Some(handle)),
            })
        }

        /// Flushes pending reports and stops the writer thread.
        pub fn close(&self) {
            drop(self.sender.lock().take());
            if let Some(handle) = self.handle.lock().take()
                && handle.join().is_err()
            {
                error!("jsonl writer thread panicked");
            }
        }
    }

    impl ReportSink for JsonlReportSink {
        fn deliver(&self, report: &DiagnosticsReport) {
            if let Some(sender) = self.sender.lock().as_ref()
                && let Err(err) = sender.send(report.clone())
            {
                error!("jsonl report send failed: {err}");
            }
        }
    }

    impl Drop for JsonlReportSink {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn writer_loop(mut writer: BufWriter<File>, receiver: Receiver<DiagnosticsReport>) {
        if let Err(err) = write_line(&mut writer, &Header::new()) {
            error!("jsonl header write failed: {err}");
            return;
        }
        for report in receiver {
            if let Err(err) = write_line(&mut writer, &Record::Report(report)) {
                error!("jsonl report write failed: {err}");
            }
        }
        if let Err(err) = writer.flush() {
            error!("jsonl flush failed: {err}");
        }
    }

    fn write_line(writer: &mut BufWriter<File>, value: &impl Serialize) -> std::io::Result<()> {
        serde_json::to_writer(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::{
            call_key::{Backend, CallCategory, CallKey},
            issue::{IssueKind, Severity},
            report::ReportDraft,
        };

        #[test]
        fn writes_header_then_reports() {
            let path = std::env::temp_dir().join(format!("vigil-jsonl-{}.jsonl", std::process::id()));
            let sink = JsonlReportSink::create(&path).expect("temp file is writable");
            let draft = ReportDraft::advisory(
                CallKey::new(Backend::Metal, CallCategory::Present, "present"),
                IssueKind::Unclassified,
                Severity::Medium,
                "odd present",
                42,
            );
            sink.deliver(&DiagnosticsReport::build(7, draft));
            sink.close();

            let written = std::fs::read_to_string(&path).expect("file exists");
            let _ = std::fs::remove_file(&path);
            let lines: Vec<serde_json::Value> = written
                .lines()
                .map(|line| serde_json::from_str(line).expect("valid json"))
                .collect();
            assert_eq!(lines.len(), 2);
            assert_eq!(lines[0]["format"], "vigil-reports");
            assert_eq!(lines[1]["type"], "report");
            assert_eq!(lines[1]["id"], 7);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crate::{
        Vigil,
        call_key::{Backend, CallCategory, CallKey},
        clock::ManualClock,
        config::VigilConfig,
    };

    #[test]
    fn export_lists_slow_and_spiky_sites() {
        let vigil = Vigil::builder()
            .config(VigilConfig::deterministic())
            .clock(Arc::new(ManualClock::new(1)))
            .build()
            .expect("valid configuration");
        let fast = CallKey::new(Backend::OpenGl, CallCategory::Draw, "glDrawArrays");
        let slow = CallKey::new(Backend::OpenGl, CallCategory::TextureUpload, "glTexImage2D");
        vigil.observe(&fast, Duration::from_micros(100), None);
        vigil.observe(&slow, Duration::from_millis(20), None);

        let text = vigil.export_diagnostics();
        assert!(text.contains("opengl/texture_upload/glTexImage2D"));
        assert!(text.contains("calls_observed"));
        let slowest = text
            .split("-- slowest call sites (ewma) --")
            .nth(1)
            .and_then(|rest| rest.lines().nth(1))
            .unwrap_or_default();
        assert!(slowest.starts_with("opengl/texture_upload/glTexImage2D"));
    }
}
