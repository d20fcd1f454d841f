//! # jobfiber - Fiber-Based Priority Job Scheduler
//!
//! A job system for per-frame simulation work. Jobs are split into tasks that
//! run on stackful fibers multiplexed onto a fixed pool of worker threads. A
//! task that waits on another job suspends its fiber instead of blocking the
//! thread, so workers keep draining the queues.
//!
//! ## Architecture
//!
//! - **Jobs**: a name, a priority, a stack class and `num_tasks` invocations
//!   of one body. The submitter owns the job and waits on it.
//! - **Queues**: one bounded lock-free queue per priority. A full queue makes
//!   the submitter yield until there is room.
//! - **Fibers**: created up front in a small and a large stack class.
//! - **Workers**: OS threads running the scheduling loop, parking when idle.
//! - **Allocator**: labeled blocks from one region with a bump arena per
//!   (thread, label), freed in bulk by label.
//!
//! ## Example
//!
//! ```no_run
//! use jobfiber::{Job, JobSystem, JobSystemConfig};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let system = JobSystem::new(JobSystemConfig::with_threads(4)).unwrap();
//!
//! let results: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
//! let job = Job::new("square", results.len(), |i, _ctx| {
//!     results[i].store(i * i, Ordering::Relaxed);
//! });
//! system.do_and_wait(&job).unwrap();
//!
//! system.shutdown().unwrap();
//! ```

pub mod allocator;
pub mod chrome_trace;
pub mod context;
pub mod error;
pub mod fiber;
mod fiber_pool;
pub mod job;
pub mod job_scheduler;
pub mod job_system;
pub mod profiler;
pub mod queue;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Strategy for pinning worker threads to CPU cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinningStrategy {
    /// No pinning (standard OS scheduling).
    #[default]
    None,
    /// Worker i runs on logical processor i.
    Linear,
    /// Pin to even-numbered logical processors only, one worker per physical core.
    AvoidSMT,
}

pub use allocator::{AllocatorConfig, Label, LabelGuard, MemoryBlock, ThreadedLabeledBlockAllocator};
pub use chrome_trace::TraceProfiler;
pub use context::JobContext;
pub use error::{AllocError, SchedulerError};
pub use fiber::{CorosenseiPlatform, FiberPlatform};
pub use job::{Job, JobBody, Priority};
pub use job_scheduler::{JobScheduler, SchedulerConfig};
pub use job_system::{JobSystem, JobSystemConfig};
pub use profiler::{MarkGuard, MarkerType, NullProfiler, ProfileMark, Profiler};
