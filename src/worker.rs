//! Worker threads.
//!
//! Each worker is a named OS thread that runs the scheduling loop until the
//! scheduler is told to finish. Workers are optionally pinned to a core.

use crate::PinningStrategy;
use crate::error::SchedulerError;
use crate::job_scheduler::JobScheduler;
use core_affinity::CoreId;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A thread running [`JobScheduler::run_scheduler`].
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns "Worker Thread {id}", pinned to `core` when given.
    pub fn spawn(
        id: usize,
        scheduler: Arc<JobScheduler>,
        core: Option<CoreId>,
    ) -> Result<Self, SchedulerError> {
        let handle = thread::Builder::new()
            .name(format!("Worker Thread {}", id))
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        tracing::warn!(worker = id, core = core.id, "failed to pin worker");
                    }
                }
                scheduler.run_scheduler(id);
            })
            .map_err(|e| SchedulerError::WorkerSpawn(e.to_string()))?;

        Ok(Worker {
            id,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

/// The set of workers driving one scheduler.
pub struct WorkerPool {
    workers: Vec<Worker>,
    scheduler: Arc<JobScheduler>,
}

impl WorkerPool {
    /// Spawns `num_threads` workers with thread indices `0..num_threads`.
    ///
    /// If a spawn fails, the workers already started are stopped and joined
    /// before the error is returned.
    pub fn new(
        num_threads: usize,
        scheduler: Arc<JobScheduler>,
        pinning: PinningStrategy,
    ) -> Result<Self, SchedulerError> {
        let cores = match pinning {
            PinningStrategy::None => Vec::new(),
            _ => core_affinity::get_core_ids().unwrap_or_default(),
        };
        if pinning != PinningStrategy::None && cores.is_empty() {
            tracing::warn!(?pinning, "core ids unavailable, workers will not be pinned");
        }

        let mut pool = WorkerPool {
            workers: Vec::with_capacity(num_threads),
            scheduler: Arc::clone(&scheduler),
        };

        for id in 0..num_threads {
            let core = core_for_worker(pinning, id, &cores);
            match Worker::spawn(id, Arc::clone(&scheduler), core) {
                Ok(worker) => pool.workers.push(worker),
                Err(err) => {
                    if let Err(shutdown_err) = pool.shutdown() {
                        tracing::error!(%shutdown_err, "failed to stop workers after spawn error");
                    }
                    return Err(err);
                }
            }
        }

        tracing::info!(workers = num_threads, ?pinning, "worker threads started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stops the scheduling loops and joins every worker.
    pub fn shutdown(self) -> Result<(), SchedulerError> {
        self.scheduler.finish_tasks();

        let mut panicked = 0;
        for worker in self.workers {
            let id = worker.id();
            if worker.join().is_err() {
                tracing::error!(worker = id, "worker thread panicked");
                panicked += 1;
            }
        }

        tracing::info!("worker threads stopped");
        if panicked > 0 {
            Err(SchedulerError::WorkerPanicked { count: panicked })
        } else {
            Ok(())
        }
    }
}

/// Core a worker should be pinned to under `strategy`.
fn core_for_worker(strategy: PinningStrategy, id: usize, cores: &[CoreId]) -> Option<CoreId> {
    if cores.is_empty() {
        return None;
    }
    match strategy {
        PinningStrategy::None => None,
        PinningStrategy::Linear => cores.get(id % cores.len()).copied(),
        // Even logical processors are the first hardware thread of each core.
        PinningStrategy::AvoidSMT => {
            let physical = cores.len().div_ceil(2);
            cores.get((id % physical) * 2).copied()
        }
    }
}
