//! Background workers draining the job queue.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam::{
    channel::{self, Receiver, Sender},
    select,
};
use tracing::{debug, error, warn};

use super::{Job, build_report, run_recovery};
use crate::{
    collaborator::{call_hook, guarded},
    engine::Core,
    error::VigilError,
};

/// Fixed pool of named worker threads.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
}

impl WorkerPool {
    /// A pool without threads; jobs run inline.
    pub(crate) fn inline() -> Self {
        Self {
            handles: Vec::new(),
            shutdown_tx: None,
        }
    }

    /// Spawns `threads` workers over the job queue of `core`.
    pub(crate) fn spawn(core: &Arc<Core>, threads: usize) -> Result<Self, VigilError> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let mut pool = Self {
            handles: Vec::with_capacity(threads),
            shutdown_tx: Some(shutdown_tx),
        };
        for index in 0..threads {
            let core = Arc::clone(core);
            let jobs = core.pipeline.jobs();
            let shutdown = shutdown_rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("vigil-worker-{index}"))
                .spawn(move || worker_loop(&core, &jobs, &shutdown));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    pool.stop();
                    return Err(VigilError::Io(err));
                }
            }
        }
        Ok(pool)
    }

    /// Signals every worker and waits for it to exit. Idempotent.
    pub(crate) fn stop(&mut self) {
        // Dropping the sender disconnects every worker's shutdown receiver.
        drop(self.shutdown_tx.take());
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("diagnostics worker panicked during shutdown");
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(core: &Core, jobs: &Receiver<Job>, shutdown: &Receiver<()>) {
    debug!("diagnostics worker started");
    loop {
        select! {
            recv(jobs) -> job => match job {
                Ok(job) => run_job(core, job),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    debug!("diagnostics worker exiting");
}

/// Executes one job. Never panics.
pub(crate) fn run_job(core: &Core, job: Job) {
    guarded("diagnostics job", || match job {
        Job::BuildReport(draft) => build_report(core, *draft),
        Job::Recover(task) => run_recovery(core, task),
        Job::CachePattern {
            pattern,
            descriptor,
            batch_size,
        } => {
            let Some(batcher) = core.collaborators.draw_batcher.get() else {
                core.draw.set_cached(pattern, false);
                return;
            };
            let result = call_hook("cache_indirect", || {
                batcher.cache_indirect(pattern, &descriptor, batch_size)
            });
            match result {
                Ok(()) => core.draw.set_cached(pattern, true),
                Err(err) => {
                    warn!(%pattern, "caching batched path failed: {err}");
                    core.draw.set_cached(pattern, false);
                }
            }
        }
        Job::Optimize(patterns) => {
            if let Some(batcher) = core.collaborators.draw_batcher.get()
                && let Err(err) = call_hook("optimize", || batcher.optimize(&patterns))
            {
                warn!("draw batch optimization failed: {err}");
            }
        }
        Job::EmergencyBatch => {
            if let Some(batcher) = core.collaborators.draw_batcher.get()
                && let Err(err) = call_hook("emergency_batch", || batcher.emergency_batch())
            {
                warn!("emergency batching failed: {err}");
            }
        }
    });
}
