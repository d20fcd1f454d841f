//! Fixed pool of fibers in two stack classes.
//!
//! Every fiber is created up front. Free fibers of each class wait in a
//! lock-free queue; fibers suspended in the middle of a task wait in a third
//! queue until their thread's scheduling loop can resume them. Whoever pops
//! an index from one of these queues owns that slot until it pushes it back.

use crate::error::SchedulerError;
use crate::fiber::{FiberEntry, FiberPlatform, PlatformFiber, SwitchReason};
use crate::job::{JobRef, TaskRef};
use crate::job_scheduler::SchedulerConfig;
use crate::queue::BoundedQueue;
use std::cell::UnsafeCell;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Scheduler-private state of one fiber.
#[derive(Default)]
pub(crate) struct FiberState {
    /// Task the fiber is running or about to run.
    pub(crate) task: Option<TaskRef>,
    /// Job the suspended task waits on; `None` while running or when it
    /// yielded for queue space.
    pub(crate) waiting_on: Option<JobRef>,
}

pub(crate) struct FiberSlot {
    index: usize,
    large: bool,
    fiber: UnsafeCell<ManuallyDrop<Box<dyn PlatformFiber>>>,
    state: UnsafeCell<FiberState>,
    thread_index: AtomicUsize,
}

// SAFETY: `fiber` and `state` are only touched by the thread that currently
// owns the slot (popped it from a pool queue), or by the fiber itself while
// that thread has switched into it. Ownership moves through the queues, which
// order the accesses with Release/Acquire.
unsafe impl Sync for FiberSlot {}

impl FiberSlot {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[cfg(test)]
    pub(crate) fn is_large(&self) -> bool {
        self.large
    }

    /// Worker thread the fiber was last switched in on.
    pub(crate) fn thread_index(&self) -> usize {
        self.thread_index.load(Ordering::Relaxed)
    }

    /// # Safety
    /// The caller must own the slot, and must not hold the returned reference
    /// across a switch into or out of the fiber.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state(&self) -> &mut FiberState {
        unsafe { &mut *self.state.get() }
    }

    /// Switches into the fiber on `thread_index` until it switches back.
    ///
    /// # Safety
    /// The caller must own the slot.
    pub(crate) unsafe fn switch_in(&self, thread_index: usize) -> SwitchReason {
        self.thread_index.store(thread_index, Ordering::Relaxed);
        unsafe { (*self.fiber.get()).switch_in() }
    }
}

impl Drop for FiberSlot {
    fn drop(&mut self) {
        // SAFETY: the fiber is taken exactly once, here.
        let fiber = unsafe { ManuallyDrop::take(self.fiber.get_mut()) };
        if self.state.get_mut().task.is_some() {
            // Unwinding a stack that is parked inside a task would run the
            // task's destructors against a job that may no longer exist.
            tracing::warn!(fiber = self.index, "leaking fiber suspended in the middle of a task");
            std::mem::forget(fiber);
        } else {
            drop(fiber);
        }
    }
}

pub(crate) struct FiberPool {
    slots: Box<[FiberSlot]>,
    free_small: BoundedQueue<usize>,
    free_large: BoundedQueue<usize>,
    suspended: BoundedQueue<usize>,
}

impl FiberPool {
    /// Creates `small_fibers + large_fibers` fibers. Slot `i` runs `entry(i)`.
    pub(crate) fn new(
        config: &SchedulerConfig,
        platform: &dyn FiberPlatform,
        entry: impl Fn(usize) -> FiberEntry,
    ) -> Result<Self, SchedulerError> {
        let total = config.small_fibers + config.large_fibers;
        let mut slots = Vec::with_capacity(total);

        for index in 0..total {
            let large = index >= config.small_fibers;
            let stack_size = if large {
                config.large_stack_size
            } else {
                config.small_stack_size
            };
            let fiber = platform.create_fiber(stack_size, entry(index))?;
            slots.push(FiberSlot {
                index,
                large,
                fiber: UnsafeCell::new(ManuallyDrop::new(fiber)),
                state: UnsafeCell::new(FiberState::default()),
                thread_index: AtomicUsize::new(0),
            });
        }

        let pool = FiberPool {
            slots: slots.into_boxed_slice(),
            free_small: BoundedQueue::new(config.small_fibers),
            free_large: BoundedQueue::new(config.large_fibers),
            suspended: BoundedQueue::new(total),
        };
        for index in 0..total {
            pool.release(index);
        }

        tracing::debug!(
            small = config.small_fibers,
            large = config.large_fibers,
            "fiber pool created"
        );
        Ok(pool)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, index: usize) -> &FiberSlot {
        &self.slots[index]
    }

    /// Takes a free fiber. Tasks that do not need a large stack fall back to a
    /// large fiber when no small one is free.
    pub(crate) fn acquire(&self, needs_large_stack: bool) -> Option<usize> {
        if needs_large_stack {
            self.free_large.pop()
        } else {
            self.free_small.pop().or_else(|| self.free_large.pop())
        }
    }

    /// Returns a fiber that finished its task to the free queue of its class.
    pub(crate) fn release(&self, index: usize) {
        let queue = if self.slots[index].large {
            &self.free_large
        } else {
            &self.free_small
        };
        if queue.push(index).is_err() {
            tracing::error!(fiber = index, "free fiber queue overflow");
        }
    }

    /// Parks a fiber that switched out in the middle of its task.
    pub(crate) fn suspend(&self, index: usize) {
        if self.suspended.push(index).is_err() {
            tracing::error!(fiber = index, "suspended fiber queue overflow");
        }
    }

    pub(crate) fn take_suspended(&self) -> Option<usize> {
        self.suspended.pop()
    }

    pub(crate) fn suspended_len(&self) -> usize {
        self.suspended.len()
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free_small.len() + self.free_large.len()
    }
}
