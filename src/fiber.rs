//! Stackful execution contexts.
//!
//! The scheduler only needs four things from a fiber implementation: create a
//! fiber with a given stack size, switch into it from a thread's root context,
//! switch from the running fiber back to root, and find out which scheduler
//! and fiber are current. The first three sit behind [`FiberPlatform`] so the
//! scheduler can be driven by any coroutine backend; [`CorosenseiPlatform`] is
//! the default. The fourth is a thread-local set by the root around every
//! switch.

use crate::error::SchedulerError;
use crate::job_scheduler::JobScheduler;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::Cell;
use std::ptr::NonNull;

/// Why a fiber handed control back to its thread's root context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// The fiber finished its task and is ready for another.
    TaskComplete,
    /// The task is waiting for another job to finish.
    Waiting,
    /// The task is waiting for room in a full queue.
    Yielded,
}

/// Switches from the running fiber back to the root context of its thread.
pub trait RootSwitch {
    fn switch_to_root(&self, reason: SwitchReason);
}

/// Body of a fiber. Called once, on the fiber's own stack, the first time the
/// fiber is switched in. It is expected never to return.
pub type FiberEntry = Box<dyn FnOnce(&dyn RootSwitch) + Send + 'static>;

/// A fiber created by a [`FiberPlatform`].
pub trait PlatformFiber: Send {
    /// Runs the fiber on the calling thread until it switches back to root.
    fn switch_in(&mut self) -> SwitchReason;
}

/// Creates fibers.
pub trait FiberPlatform: Send + Sync {
    fn create_fiber(
        &self,
        stack_size: usize,
        entry: FiberEntry,
    ) -> Result<Box<dyn PlatformFiber>, SchedulerError>;
}

/// Fibers backed by `corosensei` coroutines.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorosenseiPlatform;

impl FiberPlatform for CorosenseiPlatform {
    fn create_fiber(
        &self,
        stack_size: usize,
        entry: FiberEntry,
    ) -> Result<Box<dyn PlatformFiber>, SchedulerError> {
        let stack = DefaultStack::new(stack_size).map_err(|e| SchedulerError::FiberCreation {
            stack_size,
            reason: e.to_string(),
        })?;

        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<(), SwitchReason>, ()| {
            entry(&YielderRoot(yielder));
        });

        Ok(Box::new(CorosenseiFiber {
            coroutine,
            returned: false,
        }))
    }
}

struct YielderRoot<'a>(&'a Yielder<(), SwitchReason>);

impl RootSwitch for YielderRoot<'_> {
    fn switch_to_root(&self, reason: SwitchReason) {
        self.0.suspend(reason);
    }
}

struct CorosenseiFiber {
    coroutine: Coroutine<(), SwitchReason, (), DefaultStack>,
    returned: bool,
}

// SAFETY: a fiber is only ever resumed by one thread at a time; the scheduler
// hands it between threads through its queues.
unsafe impl Send for CorosenseiFiber {}

impl PlatformFiber for CorosenseiFiber {
    fn switch_in(&mut self) -> SwitchReason {
        if self.returned {
            return SwitchReason::TaskComplete;
        }
        match self.coroutine.resume(()) {
            CoroutineResult::Yield(reason) => reason,
            CoroutineResult::Return(()) => {
                self.returned = true;
                SwitchReason::TaskComplete
            }
        }
    }
}

/// Data of the fiber currently running on this thread.
#[derive(Clone, Copy)]
pub(crate) struct CurrentFiber {
    pub(crate) scheduler: NonNull<JobScheduler>,
    pub(crate) fiber_index: usize,
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<CurrentFiber>> = const { Cell::new(None) };
}

/// Returns the fiber currently switched in on this thread, if any.
pub(crate) fn current() -> Option<CurrentFiber> {
    CURRENT_FIBER.get()
}

/// Marks `current` as running for the lifetime of the guard.
pub(crate) struct CurrentGuard {
    previous: Option<CurrentFiber>,
}

impl CurrentGuard {
    pub(crate) fn enter(current: CurrentFiber) -> Self {
        CurrentGuard {
            previous: CURRENT_FIBER.replace(Some(current)),
        }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_FIBER.set(self.previous);
    }
}
