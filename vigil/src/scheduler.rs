//! Periodic work: queue draining, monitoring and maintenance.

use std::{
    sync::{Arc, atomic::Ordering},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::{collaborator::guarded, engine::Core, error::VigilError, monitor, pipeline};

/// What one call to [`tick`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Reports delivered.
    pub reports: usize,
    /// Recovery tasks handed to the workers.
    pub recoveries: usize,
}

/// What one maintenance pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    /// Call sites evicted from the statistics store.
    pub evicted_keys: usize,
    /// Idle recovery trackers discarded.
    pub swept_trackers: usize,
    /// Idle draw patterns discarded.
    pub swept_patterns: usize,
}

/// Drains one batch of reports and one batch of recovery tasks.
pub(crate) fn tick(core: &Core) -> TickSummary {
    guarded("queue drain", || TickSummary {
        reports: pipeline::drain_reports(core),
        recoveries: pipeline::drain_recoveries(core),
    })
    .unwrap_or_else(|| {
        core.counters.cycle_panics();
        TickSummary::default()
    })
}

/// Evicts cold call sites and sweeps idle trackers and patterns.
pub(crate) fn run_maintenance(core: &Core) -> MaintenanceSummary {
    guarded("maintenance", || {
        let now = core.now();
        let evicted_keys = core.stats.evict_if_needed();
        core.counters
            .keys_evicted
            .fetch_add(evicted_keys as u64, Ordering::Relaxed);
        core.pipeline.sweep(now);
        let summary = MaintenanceSummary {
            evicted_keys,
            swept_trackers: core.trackers.sweep(now),
            swept_patterns: core.draw.sweep(now),
        };
        debug!(?summary, "maintenance pass finished");
        summary
    })
    .unwrap_or_else(|| {
        core.counters.cycle_panics();
        MaintenanceSummary::default()
    })
}

/// Background thread driving [`tick`], the monitor and maintenance.
pub(crate) struct Scheduler {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
}

impl Scheduler {
    /// A scheduler that never runs; the host drives every cycle.
    pub(crate) fn manual() -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
        }
    }

    pub(crate) fn spawn(core: &Arc<Core>) -> Result<Self, VigilError> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let core = Arc::clone(core);
        let handle = thread::Builder::new()
            .name("vigil-scheduler".to_owned())
            .spawn(move || {
                let config = core.config.scheduler.clone();
                let period = config.tick.max(Duration::from_millis(1));
                let mut last_monitor = Instant::now();
                let mut last_maintenance = Instant::now();
                debug!("scheduler started");
                loop {
                    match shutdown_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    tick(&core);
                    if last_monitor.elapsed() >= config.monitor_interval {
                        last_monitor = Instant::now();
                        monitor::run_cycle(&core);
                    }
                    if last_maintenance.elapsed() >= config.maintenance_interval {
                        last_maintenance = Instant::now();
                        run_maintenance(&core);
                    }
                }
                debug!("scheduler exiting");
            })?;
        Ok(Self {
            handle: Some(handle),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Stops the thread and waits for it. Idempotent.
    pub(crate) fn stop(&mut self) {
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
