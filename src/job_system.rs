//! Host-side wrapper.
//!
//! [`JobSystem`] builds the allocator and scheduler, spawns the workers, and
//! gives the host thread its own [`JobContext`] so it can submit work and
//! wait on it from outside any fiber.

use crate::PinningStrategy;
use crate::allocator::{AllocatorConfig, ThreadedLabeledBlockAllocator};
use crate::context::JobContext;
use crate::error::SchedulerError;
use crate::fiber::{CorosenseiPlatform, FiberPlatform};
use crate::job::{Job, JobBody};
use crate::job_scheduler::{JobScheduler, MAX_SCHEDULER_THREADS, SchedulerConfig};
use crate::profiler::{NullProfiler, Profiler};
use crate::worker::WorkerPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Most workers a job system can run; the host thread takes the last index.
pub const MAX_WORKERS: usize = MAX_SCHEDULER_THREADS - 1;

/// Everything needed to start a [`JobSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSystemConfig {
    /// Worker threads; `None` uses one per logical CPU minus the host thread.
    pub num_threads: Option<usize>,
    pub pinning: PinningStrategy,
    pub scheduler: SchedulerConfig,
    pub allocator: AllocatorConfig,
}

impl JobSystemConfig {
    /// Config with an explicit worker count and defaults elsewhere.
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
            ..Self::default()
        }
    }

    /// Number of workers this config starts.
    pub fn worker_count(&self) -> usize {
        self.num_threads
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1))
            .clamp(1, MAX_WORKERS)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(n) = self.num_threads {
            if n == 0 || n > MAX_WORKERS {
                return Err(SchedulerError::InvalidConfig(format!(
                    "num_threads must be in 1..={}, got {}",
                    MAX_WORKERS, n
                )));
            }
        }
        self.scheduler.validate()?;
        self.allocator.validate()?;
        Ok(())
    }
}

/// A running scheduler plus its worker threads.
pub struct JobSystem {
    scheduler: Arc<JobScheduler>,
    workers: Option<WorkerPool>,
    num_workers: usize,
}

impl JobSystem {
    /// Starts a job system with corosensei fibers and no profiler.
    pub fn new(config: JobSystemConfig) -> Result<Self, SchedulerError> {
        Self::with_profiler(config, Arc::new(NullProfiler))
    }

    pub fn with_profiler(
        config: JobSystemConfig,
        profiler: Arc<dyn Profiler>,
    ) -> Result<Self, SchedulerError> {
        Self::with_platform(config, &CorosenseiPlatform, profiler)
    }

    /// Starts a job system whose fibers come from `platform`.
    pub fn with_platform(
        config: JobSystemConfig,
        platform: &dyn FiberPlatform,
        profiler: Arc<dyn Profiler>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let num_workers = config.worker_count();

        // Every worker plus the host thread gets its own arenas.
        let allocator = ThreadedLabeledBlockAllocator::new(AllocatorConfig {
            max_threads: config.allocator.max_threads.max(num_workers + 1),
            ..config.allocator
        })?;

        let scheduler = Arc::new(JobScheduler::new(
            config.scheduler,
            platform,
            profiler,
            Arc::new(allocator),
        )?);
        let workers = WorkerPool::new(num_workers, Arc::clone(&scheduler), config.pinning)?;

        tracing::info!(workers = num_workers, "job system started");
        Ok(JobSystem {
            scheduler,
            workers: Some(workers),
            num_workers,
        })
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn allocator(&self) -> &ThreadedLabeledBlockAllocator {
        self.scheduler.allocator()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Context for the host thread. Its thread index is the worker count.
    pub fn main_context(&self) -> JobContext<'_> {
        self.scheduler.thread_context(self.num_workers)
    }

    /// Submits `job` from the host thread and waits for it.
    pub fn do_and_wait<B: JobBody>(&self, job: &Job<B>) -> Result<(), SchedulerError> {
        let context = self.main_context();
        self.scheduler.do_and_wait(job, &context)
    }

    /// Stops the workers after their current tasks and joins them.
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        match self.workers.take() {
            Some(workers) => workers.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.take() {
            if let Err(err) = workers.shutdown() {
                tracing::error!(%err, "job system shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_defaults() {
        let config = JobSystemConfig::default();
        assert!(config.worker_count() >= 1);
        assert!(config.worker_count() <= MAX_WORKERS);
        assert_eq!(JobSystemConfig::with_threads(3).worker_count(), 3);
    }

    #[test]
    fn test_rejects_too_many_threads() {
        assert!(JobSystemConfig::with_threads(0).validate().is_err());
        assert!(JobSystemConfig::with_threads(MAX_WORKERS + 1).validate().is_err());
        assert!(JobSystemConfig::with_threads(MAX_WORKERS).validate().is_ok());
    }

    #[test]
    fn test_start_and_shutdown() {
        let system = JobSystem::new(JobSystemConfig {
            allocator: AllocatorConfig {
                block_size: 4096,
                num_blocks: 4,
                max_threads: 1,
            },
            ..JobSystemConfig::with_threads(2)
        })
        .unwrap();
        assert_eq!(system.num_workers(), 2);
        assert_eq!(system.main_context().thread_index(), 2);
        assert_eq!(system.allocator().max_threads(), 3);
        system.shutdown().unwrap();
    }
}
