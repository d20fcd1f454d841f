//! Job definitions and the per-priority task queues.
//!
//! A job is a unit of parallel work split into `num_tasks` independently
//! schedulable tasks. The submitter owns the job (usually on its stack) and
//! must keep it alive until every task has finished; the queues only ever
//! hold a borrowed reference plus the task index.

use crate::context::JobContext;
use crate::error::SchedulerError;
use crate::queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Scheduling priority. Workers always drain `High` before `Medium` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All priorities, in the order workers poll them.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The work performed by each task of a job.
pub trait JobBody: Sync {
    fn do_task(&self, task_index: usize, context: &JobContext<'_>);
}

/// Adapts a closure into a [`JobBody`].
pub struct FnBody<F>(F);

impl<F> JobBody for FnBody<F>
where
    F: Fn(usize, &JobContext<'_>) + Sync,
{
    fn do_task(&self, task_index: usize, context: &JobContext<'_>) {
        (self.0)(task_index, context)
    }
}

/// Runs the item body over a contiguous batch of items per task.
pub struct Batched<F> {
    batch_size: usize,
    total_items: usize,
    body: F,
}

impl<F> JobBody for Batched<F>
where
    F: Fn(usize, &JobContext<'_>) + Sync,
{
    fn do_task(&self, task_index: usize, context: &JobContext<'_>) {
        let start = task_index * self.batch_size;
        let end = (start + self.batch_size).min(self.total_items);
        for item in start..end {
            (self.body)(item, context);
        }
    }
}

/// Metadata and completion state shared by every job regardless of its body.
pub struct JobHeader {
    name: &'static str,
    priority: Priority,
    needs_large_stack: bool,
    system_id: i32,
    num_tasks: usize,
    pending_tasks: AtomicUsize,
    submitted: AtomicBool,
}

impl JobHeader {
    fn new(name: &'static str, num_tasks: usize) -> Self {
        JobHeader {
            name,
            priority: Priority::Medium,
            needs_large_stack: false,
            system_id: -1,
            num_tasks,
            pending_tasks: AtomicUsize::new(num_tasks),
            submitted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn needs_large_stack(&self) -> bool {
        self.needs_large_stack
    }

    pub fn system_id(&self) -> i32 {
        self.system_id
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    pub fn has_finished(&self) -> bool {
        self.pending_tasks() == 0
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Records the completion of one task.
    ///
    /// Returns `true` for the call that brings the pending count to zero. The
    /// job may be dropped by its owner as soon as that happens, so callers must
    /// not touch it afterwards.
    pub fn task_finished(&self) -> bool {
        let previous = self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "job `{}` finished more tasks than it has", self.name);
        previous == 1
    }

    pub(crate) fn mark_submitted(&self) -> Result<(), SchedulerError> {
        if self.submitted.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::JobAlreadySubmitted { name: self.name });
        }
        Ok(())
    }
}

/// A unit of work made of `num_tasks` tasks sharing one body.
pub struct Job<B> {
    header: JobHeader,
    body: B,
}

impl<F> Job<FnBody<F>>
where
    F: Fn(usize, &JobContext<'_>) + Sync,
{
    /// Creates a job that calls `work(task_index, context)` once per task.
    pub fn new(name: &'static str, num_tasks: usize, work: F) -> Self {
        Job::with_body(name, num_tasks, FnBody(work))
    }
}

impl<F> Job<Batched<F>>
where
    F: Fn(usize, &JobContext<'_>) + Sync,
{
    /// Creates a job over `total_items` items grouped into batches.
    ///
    /// Each task processes `batch_size` consecutive items (the last one may
    /// process fewer), calling `work(item_index, context)` for each.
    pub fn batched(name: &'static str, batch_size: usize, total_items: usize, work: F) -> Self {
        let batch_size = batch_size.max(1);
        let num_tasks = total_items.div_ceil(batch_size);
        Job::with_body(
            name,
            num_tasks,
            Batched {
                batch_size,
                total_items,
                body: work,
            },
        )
    }
}

impl<B: JobBody> Job<B> {
    /// Creates a job from any [`JobBody`] implementation.
    pub fn with_body(name: &'static str, num_tasks: usize, body: B) -> Self {
        Job {
            header: JobHeader::new(name, num_tasks),
            body,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.priority = priority;
        self
    }

    /// Requests the large fiber stack class for every task of this job.
    pub fn with_large_stack(mut self) -> Self {
        self.header.needs_large_stack = true;
        self
    }

    pub fn with_system_id(mut self, system_id: i32) -> Self {
        self.header.system_id = system_id;
        self
    }

    pub fn header(&self) -> &JobHeader {
        &self.header
    }

    pub fn name(&self) -> &'static str {
        self.header.name
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn num_tasks(&self) -> usize {
        self.header.num_tasks
    }

    pub fn pending_tasks(&self) -> usize {
        self.header.pending_tasks()
    }

    pub fn has_finished(&self) -> bool {
        self.header.has_finished()
    }

    /// Re-arms a finished job so it can be submitted again.
    ///
    /// The exclusive borrow guarantees no queue still references the job.
    pub fn reset(&mut self) {
        *self.header.pending_tasks.get_mut() = self.header.num_tasks;
        *self.header.submitted.get_mut() = false;
    }
}

/// Object-safe view of a job used by the queues and fibers.
pub(crate) trait RunnableJob: Sync {
    fn header(&self) -> &JobHeader;
    fn run_task(&self, task_index: usize, context: &JobContext<'_>);
}

impl<B: JobBody> RunnableJob for Job<B> {
    fn header(&self) -> &JobHeader {
        &self.header
    }

    fn run_task(&self, task_index: usize, context: &JobContext<'_>) {
        self.body.do_task(task_index, context);
    }
}

/// Lifetime-erased pointer to a submitted job.
#[derive(Clone, Copy)]
pub(crate) struct JobRef(NonNull<dyn RunnableJob>);

// SAFETY: `RunnableJob: Sync`, and a JobRef is only dereferenced while the
// submitter keeps the job alive.
unsafe impl Send for JobRef {}
unsafe impl Sync for JobRef {}

impl JobRef {
    /// # Safety
    /// The job must stay alive until every task referencing it has finished
    /// and the reference is no longer used by any fiber.
    pub(crate) unsafe fn new<'a>(job: &'a (dyn RunnableJob + 'a)) -> Self {
        let ptr: NonNull<dyn RunnableJob + 'a> = NonNull::from(job);
        // SAFETY: only the lifetime is erased; the caller upholds it.
        JobRef(unsafe {
            std::mem::transmute::<NonNull<dyn RunnableJob + 'a>, NonNull<dyn RunnableJob + 'static>>(
                ptr,
            )
        })
    }

    /// # Safety
    /// The job must still be alive (see [`JobRef::new`]).
    pub(crate) unsafe fn get<'a>(&self) -> &'a dyn RunnableJob {
        unsafe { &*self.0.as_ptr() }
    }

    /// Stable identifier used for profiler marks.
    pub(crate) fn id(&self) -> usize {
        self.0.as_ptr() as *const () as usize
    }
}

/// One task: a job plus the index of the task within it.
#[derive(Clone, Copy)]
pub(crate) struct TaskRef {
    pub(crate) job: JobRef,
    pub(crate) index: usize,
}

/// A bounded queue of tasks for one priority level.
pub(crate) struct JobQueue {
    tasks: BoundedQueue<TaskRef>,
}

impl JobQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        JobQueue {
            tasks: BoundedQueue::new(capacity),
        }
    }

    /// Enqueues tasks `begin..end` of `job`.
    ///
    /// Stops at the first task that does not fit and returns its index, so the
    /// caller can retry the remainder later. Returns `end` when everything fitted.
    pub(crate) fn add_job(&self, job: JobRef, begin: usize, end: usize) -> usize {
        for index in begin..end {
            if self.tasks.push(TaskRef { job, index }).is_err() {
                return index;
            }
        }
        end
    }

    pub(crate) fn pending_task(&self) -> Option<TaskRef> {
        self.tasks.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize, _: &JobContext<'_>) {}

    #[test]
    fn test_job_defaults() {
        let job = Job::new("defaults", 3, noop);
        assert_eq!(job.name(), "defaults");
        assert_eq!(job.priority(), Priority::Medium);
        assert!(!job.header().needs_large_stack());
        assert_eq!(job.header().system_id(), -1);
        assert_eq!(job.pending_tasks(), 3);
        assert!(!job.has_finished());
    }

    #[test]
    fn test_builder_flags() {
        let job = Job::new("flags", 1, noop)
            .with_priority(Priority::High)
            .with_large_stack()
            .with_system_id(7);
        assert_eq!(job.priority(), Priority::High);
        assert!(job.header().needs_large_stack());
        assert_eq!(job.header().system_id(), 7);
    }

    #[test]
    fn test_task_finished_reports_last() {
        let job = Job::new("count", 3, noop);
        assert!(!job.header().task_finished());
        assert!(!job.header().task_finished());
        assert!(job.header().task_finished());
        assert!(job.has_finished());
    }

    #[test]
    fn test_zero_tasks_is_finished() {
        let job = Job::new("empty", 0, noop);
        assert!(job.has_finished());
    }

    #[test]
    fn test_double_submit_rejected() {
        let job = Job::new("twice", 1, noop);
        assert!(job.header().mark_submitted().is_ok());
        assert!(matches!(
            job.header().mark_submitted(),
            Err(SchedulerError::JobAlreadySubmitted { name: "twice" })
        ));
    }

    #[test]
    fn test_reset_rearms() {
        let mut job = Job::new("again", 2, noop);
        job.header().mark_submitted().unwrap();
        job.header().task_finished();
        job.header().task_finished();
        assert!(job.has_finished());

        job.reset();
        assert_eq!(job.pending_tasks(), 2);
        assert!(!job.header().is_submitted());
    }

    #[test]
    fn test_batched_task_count() {
        let job = Job::batched("batched", 64, 1000, noop);
        assert_eq!(job.num_tasks(), 16);
        let exact = Job::batched("exact", 10, 100, noop);
        assert_eq!(exact.num_tasks(), 10);
    }

    #[test]
    fn test_add_job_stops_when_full() {
        let job = Job::new("overflow", 10, noop);
        let job_ref = unsafe { JobRef::new(&job) };
        let queue = JobQueue::new(4);

        let next = queue.add_job(job_ref, 0, 10);
        assert_eq!(next, 4);
        assert_eq!(queue.len(), 4);

        let mut indices = Vec::new();
        while let Some(task) = queue.pending_task() {
            indices.push(task.index);
        }
        assert_eq!(indices, vec![0, 1, 2, 3]);

        assert_eq!(queue.add_job(job_ref, next, 10), 8);
    }
}
