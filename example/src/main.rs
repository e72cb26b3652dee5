//! Drives a simulated renderer through vigil and prints the diagnostics export.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::info;
use vigil::{
    Backend, BackendManager, CallCategory, CallKey, Diagnosable, DrawBatcher, DrawCall,
    DrawDescriptor, FailureInfo, ManagerResult, ManualClock, PatternHash,
    PatternSummary, PrimitiveType, RecoveryOutcome, RecoveryOutcomeSink, Vigil,
    VigilConfig,
};

static SUBMIT: CallKey = CallKey::new(Backend::Vulkan, CallCategory::QueueSubmit, "vkQueueSubmit");
static DRAW: CallKey = CallKey::new(Backend::Vulkan, CallCategory::DrawIndexed, "vkCmdDrawIndexed");
static UPLOAD: CallKey = CallKey::new(Backend::Vulkan, CallCategory::TextureUpload, "vkCmdCopyBufferToImage");
static COMPILE: CallKey = CallKey::new(Backend::Vulkan, CallCategory::ShaderCompile, "vkCreateShaderModule");

const FRAMES: u32 = 240;

/// Error type of the simulated device.
#[derive(Debug)]
enum DeviceError {
    Lost,
    OutOfMemory,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Lost => f.write_str("VK_ERROR_DEVICE_LOST"),
            DeviceError::OutOfMemory => f.write_str("VK_ERROR_OUT_OF_DEVICE_MEMORY"),
        }
    }
}

impl Diagnosable for DeviceError {
    fn error_code(&self) -> Option<i64> {
        match self {
            DeviceError::Lost => Some(-4),
            DeviceError::OutOfMemory => Some(-2),
        }
    }
}

#[derive(Default)]
struct SimulatedVulkan {
    flushes: AtomicU32,
    evictions: AtomicU32,
    resets: AtomicU32,
}

impl BackendManager for SimulatedVulkan {
    fn name(&self) -> &'static str {
        "simulated-vulkan"
    }

    fn flush(&self) -> ManagerResult {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict_resources(&self) -> ManagerResult {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn retry_last_operation(&self, _key: &CallKey) -> ManagerResult {
        Ok(())
    }

    fn reset_device(&self) -> ManagerResult {
        self.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn collect_garbage(&self) -> ManagerResult {
        Ok(())
    }
}

struct SimulatedOpenGl;

impl BackendManager for SimulatedOpenGl {
    fn name(&self) -> &'static str {
        "simulated-opengl"
    }
}

#[derive(Default)]
struct IndirectBatcher {
    cached: Mutex<Vec<(PatternHash, u32)>>,
    executed: AtomicU32,
}

impl DrawBatcher for IndirectBatcher {
    fn cache_indirect(
        &self,
        pattern: PatternHash,
        _descriptor: &DrawDescriptor,
        batch_size: u32,
    ) -> ManagerResult {
        self.cached.lock().push((pattern, batch_size));
        Ok(())
    }

    fn execute_indirect(&self, _pattern: PatternHash, _call: &DrawCall) -> ManagerResult {
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn optimize(&self, patterns: &[PatternSummary]) -> ManagerResult {
        info!(patterns = patterns.len(), "re-planning indirect batches");
        Ok(())
    }

    fn pattern_report(&self) -> Option<String> {
        let cached = self.cached.lock();
        Some(format!(
            "{} indirect paths cached, {} draws executed indirectly",
            cached.len(),
            self.executed.load(Ordering::Relaxed)
        ))
    }
}

#[derive(Default)]
struct OutcomeLog(Mutex<Vec<RecoveryOutcome>>);

impl RecoveryOutcomeSink for OutcomeLog {
    fn record(&self, outcome: &RecoveryOutcome) {
        info!(
            key = %outcome.key,
            strategy = %outcome.strategy,
            ok = outcome.succeeded(),
            "recovery finished"
        );
        self.0.lock().push(outcome.clone());
    }
}

fn main() -> Result<(), vigil::VigilError> {
    let mut config = VigilConfig::deterministic();
    config.pipeline.dedup_window = Duration::from_millis(500);
    config.logging.default_filter = "warn,vigil=info,vigil_example=info".to_owned();
    vigil::logging::init_tracing(&config.logging);
    vigil::logging::init_deadlock_detection(&config.logging);

    let clock = Arc::new(ManualClock::new(0));
    let vulkan = Arc::new(SimulatedVulkan::default());
    let batcher = Arc::new(IndirectBatcher::default());
    let outcomes = Arc::new(OutcomeLog::default());

    let vigil = Vigil::builder()
        .config(config)
        .clock(clock.clone())
        .backend_manager(Backend::Vulkan, vulkan.clone())
        .backend_manager(Backend::OpenGl, Arc::new(SimulatedOpenGl))
        .draw_batcher(batcher.clone())
        .outcome_sink(outcomes.clone())
        .build()?;

    let sprite = DrawDescriptor {
        primitive: PrimitiveType::Triangles,
        shader_id: 1,
        vertex_source_id: 10,
        texture_set_hash: 0xfeed,
        uniform_set_hash: 0xbeef,
    };
    let quad = DrawCall {
        vertex_count: 6,
        instance_count: 1,
    };

    for frame in 0..FRAMES {
        vigil.begin_frame();

        // A handful of sprite draws per frame; the pattern gets batched.
        for _ in 0..12 {
            let path = vigil.profile_draw(&DRAW, &sprite, quad, |_| {
                clock.advance(Duration::from_micros(40));
                Ok::<_, DeviceError>(())
            });
            if let Err(err) = path {
                info!("draw failed: {err}");
            }
        }

        // Texture streaming, with an occasional stall.
        let upload = if frame % 60 == 59 {
            Duration::from_millis(40)
        } else {
            Duration::from_micros(700)
        };
        vigil.observe(&UPLOAD, upload, None);
        clock.advance(upload);

        // One device loss mid-run; it is recovered with a device reset.
        let submitted = vigil.profile(&SUBMIT, |backend| {
            clock.advance(Duration::from_micros(300));
            if frame == 120 && backend == Backend::Vulkan {
                Err(DeviceError::Lost)
            } else {
                Ok(backend)
            }
        });
        match submitted {
            Ok(backend) if backend != Backend::Vulkan => {
                info!(frame, %backend, "submit rerouted");
            }
            Ok(_) => {}
            Err(err) => info!(frame, "submit failed: {err}"),
        }

        if frame == 180 {
            let failure = FailureInfo::from_error(&DeviceError::OutOfMemory);
            vigil.observe(&COMPILE, Duration::from_millis(3), Some(&failure));
        }

        let frame_time = Duration::from_millis(if frame % 60 == 59 { 48 } else { 14 });
        let analysis = vigil.end_frame(frame_time);
        let draws = vigil.finalize_frame_draw_analysis(frame_time);
        if analysis.is_spike {
            info!(
                frame = analysis.index,
                draws = draws.draw_calls,
                batched = draws.batched_draws,
                "spike frame"
            );
        }
        clock.advance(frame_time);

        vigil.tick();
        if frame % 30 == 29 {
            let summary = vigil.run_monitor_cycle();
            if summary.findings > 0 {
                info!(?summary, "monitor findings");
            }
        }
        if frame % 120 == 119 {
            vigil.run_maintenance();
        }
    }
    vigil.tick();

    info!(
        flushes = vulkan.flushes.load(Ordering::Relaxed),
        evictions = vulkan.evictions.load(Ordering::Relaxed),
        resets = vulkan.resets.load(Ordering::Relaxed),
        recoveries = outcomes.0.lock().len(),
        "simulation finished"
    );
    println!("{}", vigil.export_diagnostics());
    vigil.shutdown();
    Ok(())
}
