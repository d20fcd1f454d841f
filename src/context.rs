//! Per-task view of the scheduler.
//!
//! A [`JobContext`] is handed to every task body. It knows which thread and
//! fiber the task runs on and gives access to submission, profiling and the
//! labeled allocator without any global state.

use crate::allocator::{Label, LabelGuard, MemoryBlock, ThreadedLabeledBlockAllocator};
use crate::error::{AllocError, SchedulerError};
use crate::fiber::{RootSwitch, SwitchReason};
use crate::fiber_pool::FiberSlot;
use crate::job::{Job, JobBody, JobRef};
use crate::job_scheduler::JobScheduler;
use crate::profiler::{MarkGuard, MarkerType, ProfileMark, Profiler};
use std::fmt;

#[derive(Clone, Copy)]
struct FiberLink<'a> {
    slot: &'a FiberSlot,
    root: &'a dyn RootSwitch,
}

/// Capabilities available to a running task (or to a plain thread driving
/// the scheduler from outside).
pub struct JobContext<'a> {
    scheduler: &'a JobScheduler,
    thread_index: usize,
    fiber: Option<FiberLink<'a>>,
}

impl<'a> JobContext<'a> {
    /// Context for code running directly on an OS thread, outside any fiber.
    pub(crate) fn for_thread(scheduler: &'a JobScheduler, thread_index: usize) -> Self {
        JobContext {
            scheduler,
            thread_index,
            fiber: None,
        }
    }

    pub(crate) fn for_fiber(
        scheduler: &'a JobScheduler,
        slot: &'a FiberSlot,
        root: &'a dyn RootSwitch,
    ) -> Self {
        JobContext {
            scheduler,
            thread_index: slot.thread_index(),
            fiber: Some(FiberLink { slot, root }),
        }
    }

    /// Index of the thread the task is running on right now.
    ///
    /// A task that waited may resume on a different worker, so read this
    /// again after every `wait` instead of caching it.
    pub fn thread_index(&self) -> usize {
        match &self.fiber {
            Some(link) => link.slot.thread_index(),
            None => self.thread_index,
        }
    }

    /// Fiber running the task, or `None` on a plain thread.
    pub fn fiber_index(&self) -> Option<usize> {
        self.fiber.as_ref().map(|link| link.slot.index())
    }

    pub fn is_fiber(&self) -> bool {
        self.fiber.is_some()
    }

    pub fn scheduler(&self) -> &'a JobScheduler {
        self.scheduler
    }

    pub fn profiler(&self) -> &'a dyn Profiler {
        self.scheduler.profiler()
    }

    pub fn allocator(&self) -> &'a ThreadedLabeledBlockAllocator {
        self.scheduler.allocator()
    }

    /// Submits every task of `job` without waiting.
    ///
    /// # Safety
    /// `job` must stay alive until it has finished; wait on it before it goes
    /// out of scope.
    pub unsafe fn do_job<B: JobBody>(&self, job: &Job<B>) -> Result<(), SchedulerError> {
        unsafe { self.scheduler.do_job(job, self) }
    }

    /// Blocks (or suspends this fiber) until `job` has finished.
    pub fn wait<B: JobBody>(&self, job: &Job<B>) -> Result<(), SchedulerError> {
        self.scheduler.wait(job, self)
    }

    /// Submits `job` and waits for it.
    pub fn do_and_wait<B: JobBody>(&self, job: &Job<B>) -> Result<(), SchedulerError> {
        self.scheduler.do_and_wait(job, self)
    }

    /// Hands control back to the thread's root context.
    ///
    /// Returns `false` without doing anything on a plain thread.
    pub(crate) fn suspend(&self, waiting_on: Option<JobRef>, reason: SwitchReason) -> bool {
        let Some(link) = &self.fiber else {
            return false;
        };
        // SAFETY: the running fiber owns its slot; the state borrow ends
        // before the switch.
        unsafe {
            link.slot.state().waiting_on = waiting_on;
        }
        link.root.switch_to_root(reason);
        true
    }

    /// Emits `BeginFunction` now and `EndFunction` when the guard drops.
    pub fn create_profile_mark_guard(&self, function_name: &'static str, system_id: i32) -> MarkGuard<'a> {
        MarkGuard::new(self.profiler(), function_name, self.thread_index(), system_id)
    }

    pub fn add_profile_mark(
        &self,
        marker: MarkerType,
        name: Option<&'static str>,
        identifier: usize,
        system_id: i32,
    ) {
        self.profiler().add_profile_mark(ProfileMark {
            marker,
            identifier,
            name,
            thread_index: self.thread_index(),
            system_id,
        });
    }

    /// Allocates from this thread's arena for `label`.
    pub fn alloc<T>(&self, label: Label, n: usize) -> Result<MemoryBlock<T>, AllocError> {
        self.allocator().alloc(label, self.thread_index(), n)
    }

    pub fn realloc_array<T: Copy>(
        &self,
        label: Label,
        old: MemoryBlock<T>,
        n: usize,
    ) -> Result<MemoryBlock<T>, AllocError> {
        self.allocator().realloc_array(label, self.thread_index(), old, n)
    }

    pub fn free(&self, label: Label) -> Result<usize, AllocError> {
        self.allocator().free(label)
    }

    pub fn get_unused_label(&self, name: &'static str) -> Label {
        self.allocator().get_unused_label(name)
    }

    pub fn return_label(&self, label: Label) -> Result<(), AllocError> {
        self.allocator().return_label(label)
    }

    pub fn get_unused_label_with_guard(&self, name: &'static str) -> LabelGuard<'a> {
        self.allocator().get_unused_label_with_guard(name)
    }

    /// Logs `message` at debug level, tagged with the thread and fiber.
    pub fn print_debug(&self, message: impl fmt::Display) {
        tracing::debug!(
            thread = self.thread_index(),
            fiber = ?self.fiber_index(),
            "{}",
            message
        );
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("thread_index", &self.thread_index())
            .field("fiber_index", &self.fiber_index())
            .finish()
    }
}
