//! The fiber scheduler.
//!
//! Worker threads call [`JobScheduler::run_scheduler`] and loop: take a task
//! from the highest non-empty priority queue, switch into a free fiber to run
//! it, and when no task can start, resume a suspended fiber whose wait is over.
//! With nothing runnable a thread parks until another thread notifies it.
//!
//! A task that waits on another job does not block its thread. Its fiber
//! switches back to the thread's root context and is parked until the job
//! finishes; meanwhile the thread keeps running other tasks.

use crate::allocator::ThreadedLabeledBlockAllocator;
use crate::context::JobContext;
use crate::error::SchedulerError;
use crate::fiber::{self, CurrentFiber, CurrentGuard, FiberEntry, FiberPlatform, RootSwitch, SwitchReason};
use crate::fiber_pool::{FiberPool, FiberSlot};
use crate::job::{Job, JobBody, JobHeader, JobQueue, JobRef, Priority, TaskRef};
use crate::profiler::{MarkerType, ProfileMark, Profiler};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Thread indices that can take part in the idle notification mask.
pub const MAX_SCHEDULER_THREADS: usize = 64;

const THREAD_WAIT_MIN: Duration = Duration::from_micros(1);
const THREAD_WAIT_MAX: Duration = Duration::from_millis(1);

/// Fiber pool and queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fibers with the small stack class.
    pub small_fibers: usize,
    /// Fibers with the large stack class, used by jobs that ask for them.
    pub large_fibers: usize,
    pub small_stack_size: usize,
    pub large_stack_size: usize,
    /// Slots per priority queue.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            small_fibers: 128,
            large_fibers: 32,
            small_stack_size: 64 * 1024,
            large_stack_size: 512 * 1024,
            queue_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.large_fibers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "large_fibers must be > 0 so large-stack jobs can run".into(),
            ));
        }
        if self.small_stack_size == 0 || self.large_stack_size == 0 {
            return Err(SchedulerError::InvalidConfig("stack sizes must be > 0".into()));
        }
        if self.large_stack_size < self.small_stack_size {
            return Err(SchedulerError::InvalidConfig(format!(
                "large_stack_size ({}) is smaller than small_stack_size ({})",
                self.large_stack_size, self.small_stack_size
            )));
        }
        if self.queue_capacity == 0 {
            return Err(SchedulerError::InvalidConfig("queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Idle-thread parking. A thread about to park first checks its bit in
/// `notify_mask`; notifiers set every bit before checking `num_idle`, so a
/// notification racing with a park is never lost.
struct IdleState {
    lock: Mutex<()>,
    condvar: Condvar,
    num_idle: AtomicUsize,
    notify_mask: AtomicU64,
}

pub struct JobScheduler {
    config: SchedulerConfig,
    queues: [JobQueue; 3],
    fibers: FiberPool,
    run_tasks: AtomicBool,
    idle: IdleState,
    profiler: Arc<dyn Profiler>,
    allocator: Arc<ThreadedLabeledBlockAllocator>,
}

impl JobScheduler {
    /// Creates every fiber through `platform` and empty priority queues.
    pub fn new(
        config: SchedulerConfig,
        platform: &dyn FiberPlatform,
        profiler: Arc<dyn Profiler>,
        allocator: Arc<ThreadedLabeledBlockAllocator>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;

        let fibers = FiberPool::new(&config, platform, |index| -> FiberEntry {
            Box::new(move |root: &dyn RootSwitch| fiber_main(index, root))
        })?;

        tracing::info!(
            small_fibers = config.small_fibers,
            large_fibers = config.large_fibers,
            queue_capacity = config.queue_capacity,
            "job scheduler initialized"
        );

        Ok(JobScheduler {
            config,
            queues: [
                JobQueue::new(config.queue_capacity),
                JobQueue::new(config.queue_capacity),
                JobQueue::new(config.queue_capacity),
            ],
            fibers,
            run_tasks: AtomicBool::new(true),
            idle: IdleState {
                lock: Mutex::new(()),
                condvar: Condvar::new(),
                num_idle: AtomicUsize::new(0),
                notify_mask: AtomicU64::new(0),
            },
            profiler,
            allocator,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn profiler(&self) -> &dyn Profiler {
        self.profiler.as_ref()
    }

    pub fn allocator(&self) -> &ThreadedLabeledBlockAllocator {
        &self.allocator
    }

    /// `false` once `finish_tasks` has been called.
    pub fn is_running(&self) -> bool {
        self.run_tasks.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the queue of `priority`.
    pub fn queued_tasks(&self, priority: Priority) -> usize {
        self.queues[priority.index()].len()
    }

    pub fn free_fibers(&self) -> usize {
        self.fibers.free_len()
    }

    pub fn suspended_fibers(&self) -> usize {
        self.fibers.suspended_len()
    }

    /// Context for a plain thread, such as the host thread that drives a frame.
    pub fn thread_context(&self, thread_index: usize) -> JobContext<'_> {
        JobContext::for_thread(self, thread_index)
    }

    /// Submits every task of `job` and returns without waiting.
    ///
    /// When the job's queue is full the caller gives up its thread (or its
    /// fiber yields back to the scheduling loop) until there is room.
    ///
    /// # Safety
    /// `job` must outlive all of its tasks: the caller has to wait for it
    /// before it is dropped or moved.
    pub unsafe fn do_job<B: JobBody>(
        &self,
        job: &Job<B>,
        context: &JobContext<'_>,
    ) -> Result<(), SchedulerError> {
        let header = job.header();
        header.mark_submitted()?;

        let total = header.num_tasks();
        if total == 0 {
            return Ok(());
        }

        // SAFETY: forwarded from the caller.
        let job_ref = unsafe { JobRef::new(job) };
        let queue = &self.queues[header.priority().index()];

        self.notify_waiting_threads();
        let mut next = 0;
        loop {
            next = queue.add_job(job_ref, next, total);
            self.notify_waiting_threads();
            if next == total {
                return Ok(());
            }

            tracing::debug!(job = header.name(), enqueued = next, total, "queue full, yielding");
            self.mark(MarkerType::PauseWaitForQueueSpace, header, job_ref.id(), context.thread_index());
            if !context.suspend(None, SwitchReason::Yielded) {
                std::thread::yield_now();
            }
            self.mark(MarkerType::ResumeFromPause, header, job_ref.id(), context.thread_index());
        }
    }

    /// Returns once every task of `job` has finished.
    ///
    /// On a fiber the task is suspended and its thread keeps scheduling. On a
    /// plain thread this sleeps with exponential backoff.
    pub fn wait<B: JobBody>(&self, job: &Job<B>, context: &JobContext<'_>) -> Result<(), SchedulerError> {
        let header = job.header();
        if header.has_finished() {
            return Ok(());
        }
        if !header.is_submitted() {
            return Err(SchedulerError::JobNotSubmitted { name: header.name() });
        }

        // SAFETY: the borrow of `job` outlives this call, and the reference is
        // cleared from the fiber state before the call returns.
        let job_ref = unsafe { JobRef::new(job) };
        self.mark(MarkerType::PauseWaitForJob, header, job_ref.id(), context.thread_index());

        if context.is_fiber() {
            while !header.has_finished() {
                context.suspend(Some(job_ref), SwitchReason::Waiting);
            }
        } else {
            let mut delay = THREAD_WAIT_MIN;
            while !header.has_finished() {
                std::thread::sleep(delay);
                delay = (delay * 2).min(THREAD_WAIT_MAX);
            }
        }

        self.mark(MarkerType::ResumeFromPause, header, job_ref.id(), context.thread_index());
        Ok(())
    }

    /// Submits `job` and waits for it. A job with a single task runs inline on
    /// the caller without queueing or switching fibers.
    pub fn do_and_wait<B: JobBody>(&self, job: &Job<B>, context: &JobContext<'_>) -> Result<(), SchedulerError> {
        if job.num_tasks() == 1 && job.pending_tasks() == 1 {
            job.header().mark_submitted()?;
            // SAFETY: the task runs to completion before this call returns.
            let task = TaskRef {
                job: unsafe { JobRef::new(job) },
                index: 0,
            };
            self.run_task(task, context);
            return Ok(());
        }

        // SAFETY: we wait for the job before returning.
        unsafe { self.do_job(job, context)? };
        self.wait(job, context)
    }

    /// Runs the scheduling loop on the calling thread until `finish_tasks`.
    ///
    /// `thread_index` identifies the thread to the profiler, the allocator
    /// and the idle mask; every thread must use a distinct index below
    /// [`MAX_SCHEDULER_THREADS`].
    pub fn run_scheduler(&self, thread_index: usize) {
        assert!(
            thread_index < MAX_SCHEDULER_THREADS,
            "thread index {} out of range, must be below {}",
            thread_index,
            MAX_SCHEDULER_THREADS
        );
        tracing::info!(thread_index, "scheduler loop started");

        // Tasks that found no free fiber and no room to go back to their queue.
        let mut deferred: Vec<TaskRef> = Vec::new();
        while self.is_running() {
            let pick = self.start_next_task(thread_index, &mut deferred);
            if pick == Pick::Started {
                continue;
            }

            if self.resume_suspended(thread_index) {
                continue;
            }

            if pick == Pick::Blocked {
                std::thread::yield_now();
            } else {
                self.wait_for_notification(thread_index);
            }
        }

        for task in deferred {
            if !self.requeue(task) {
                tracing::warn!(thread_index, "dropping deferred task at shutdown");
            }
        }

        tracing::info!(thread_index, "scheduler loop stopped");
    }

    /// Stops every scheduling loop after its current task. Nothing is cancelled.
    pub fn finish_tasks(&self) {
        self.run_tasks.store(false, Ordering::SeqCst);
        self.notify_waiting_threads();
    }

    /// Wakes every parked thread, and makes threads about to park skip it.
    pub fn notify_waiting_threads(&self) {
        self.idle.notify_mask.store(u64::MAX, Ordering::SeqCst);
        if self.idle.num_idle.load(Ordering::SeqCst) > 0 {
            let _lock = self.idle.lock.lock();
            self.idle.condvar.notify_all();
        }
    }

    fn wait_for_notification(&self, thread_index: usize) {
        let bit = 1u64 << thread_index;
        let mut lock = self.idle.lock.lock();
        self.idle.num_idle.fetch_add(1, Ordering::SeqCst);

        if self.idle.notify_mask.load(Ordering::SeqCst) & bit == 0 && self.is_running() {
            self.mark_idle(MarkerType::BeginIdle, thread_index);
            self.idle.condvar.wait(&mut lock);
            self.mark_idle(MarkerType::EndIdle, thread_index);
        }

        self.idle.notify_mask.fetch_and(!bit, Ordering::SeqCst);
        self.idle.num_idle.fetch_sub(1, Ordering::SeqCst);
    }

    /// Starts the first task, by priority, that can get a fiber of its class.
    ///
    /// A task whose class has no free fiber goes back to the tail of its
    /// queue, so tasks behind it still get a chance to run in this pass.
    fn start_next_task(&self, thread_index: usize, deferred: &mut Vec<TaskRef>) -> Pick {
        let ready = deferred.iter().enumerate().find_map(|(pos, task)| {
            self.fibers
                .acquire(needs_large_stack(task))
                .map(|index| (pos, index))
        });
        if let Some((pos, index)) = ready {
            let task = deferred.remove(pos);
            self.start_task(index, task, thread_index);
            return Pick::Started;
        }
        let mut blocked = !deferred.is_empty();

        for priority in Priority::ALL {
            let queue = &self.queues[priority.index()];
            for _ in 0..queue.len() {
                let Some(task) = queue.pending_task() else {
                    break;
                };
                match self.fibers.acquire(needs_large_stack(&task)) {
                    Some(index) => {
                        self.start_task(index, task, thread_index);
                        return Pick::Started;
                    }
                    None => {
                        blocked = true;
                        if !self.requeue(task) {
                            deferred.push(task);
                        }
                    }
                }
            }
        }

        if blocked { Pick::Blocked } else { Pick::Empty }
    }

    /// Puts a popped task back at the tail of its priority queue.
    fn requeue(&self, task: TaskRef) -> bool {
        // SAFETY: a queued task keeps its job alive.
        let priority = unsafe { task.job.get() }.header().priority();
        self.queues[priority.index()].add_job(task.job, task.index, task.index + 1) != task.index
    }

    fn start_task(&self, index: usize, task: TaskRef, thread_index: usize) {
        let slot = self.fibers.slot(index);
        // SAFETY: we just took the slot from the free queue.
        unsafe {
            let state = slot.state();
            state.task = Some(task);
            state.waiting_on = None;
        }
        self.switch_into(slot, thread_index);
    }

    /// Resumes at most one suspended fiber that is ready to continue.
    fn resume_suspended(&self, thread_index: usize) -> bool {
        for _ in 0..self.fibers.suspended_len() {
            let Some(index) = self.fibers.take_suspended() else {
                break;
            };
            let slot = self.fibers.slot(index);
            // SAFETY: we own the slot until it is pushed back. A waited-on job
            // is kept alive by the suspended `wait` call borrowing it.
            let ready = match unsafe { slot.state() }.waiting_on {
                None => true,
                Some(job) => unsafe { job.get() }.header().has_finished(),
            };
            if ready {
                unsafe { slot.state().waiting_on = None };
                self.switch_into(slot, thread_index);
                return true;
            }
            self.fibers.suspend(index);
        }
        false
    }

    fn switch_into(&self, slot: &FiberSlot, thread_index: usize) {
        let reason = {
            let _current = CurrentGuard::enter(CurrentFiber {
                scheduler: NonNull::from(self),
                fiber_index: slot.index(),
            });
            // SAFETY: the caller owns the slot.
            unsafe { slot.switch_in(thread_index) }
        };

        match reason {
            SwitchReason::TaskComplete => self.fibers.release(slot.index()),
            SwitchReason::Waiting | SwitchReason::Yielded => self.fibers.suspend(slot.index()),
        }
    }

    /// Runs the task assigned to fiber `index`. Called on that fiber's stack.
    fn run_fiber_task(&self, index: usize, root: &dyn RootSwitch) {
        let slot = self.fibers.slot(index);
        // SAFETY: the running fiber owns its slot.
        let Some(task) = (unsafe { slot.state() }).task else {
            return;
        };
        let context = JobContext::for_fiber(self, slot, root);
        self.run_task(task, &context);
        unsafe { slot.state().task = None };
    }

    /// Runs one task body and records its completion, even if it panics.
    fn run_task(&self, task: TaskRef, context: &JobContext<'_>) {
        // SAFETY: the job is alive until its last task reports completion below.
        let job = unsafe { task.job.get() };
        let header = job.header();

        self.mark(MarkerType::Begin, header, task.job.id(), context.thread_index());
        let result = catch_unwind(AssertUnwindSafe(|| job.run_task(task.index, context)));
        if let Err(payload) = result {
            tracing::error!(
                job = header.name(),
                task = task.index,
                panic = panic_message(payload.as_ref()),
                "task panicked"
            );
        }
        self.mark(MarkerType::End, header, task.job.id(), context.thread_index());

        // The job may be gone as soon as this returns true.
        if header.task_finished() && self.fibers.suspended_len() > 0 {
            self.notify_waiting_threads();
        }
    }

    fn mark(&self, marker: MarkerType, header: &JobHeader, identifier: usize, thread_index: usize) {
        self.profiler.add_profile_mark(ProfileMark {
            marker,
            identifier,
            name: Some(header.name()),
            thread_index,
            system_id: header.system_id(),
        });
    }

    fn mark_idle(&self, marker: MarkerType, thread_index: usize) {
        self.profiler.add_profile_mark(ProfileMark {
            marker,
            identifier: thread_index,
            name: None,
            thread_index,
            system_id: -1,
        });
    }
}

/// Outcome of one attempt to start a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pick {
    Started,
    /// Tasks are waiting, but no fiber of their class is free.
    Blocked,
    Empty,
}

fn needs_large_stack(task: &TaskRef) -> bool {
    // SAFETY: a queued task keeps its job alive.
    unsafe { task.job.get() }.header().needs_large_stack()
}

/// Body of every fiber: run the assigned task, report completion, repeat.
fn fiber_main(index: usize, root: &dyn RootSwitch) {
    loop {
        if let Some(current) = fiber::current() {
            debug_assert_eq!(current.fiber_index, index);
            // SAFETY: the scheduler installs itself as current for exactly as
            // long as it has this fiber switched in.
            let scheduler = unsafe { current.scheduler.as_ref() };
            scheduler.run_fiber_task(index, root);
        }
        root.switch_to_root(SwitchReason::TaskComplete);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
