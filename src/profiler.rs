//! Instrumentation boundary.
//!
//! The scheduler reports what each worker thread is doing through the
//! [`Profiler`] trait. Calls are fire-and-forget: nothing in the core reads
//! profiler state back. Pair every `Begin*` with an `End*` and every `Pause*`
//! with a `ResumeFromPause`; function marks nest inside begin/end.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Kind of event recorded by a profile mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerType {
    /// A task starts running on a thread.
    Begin,
    /// A task finished running.
    End,
    /// A task suspended until another job finishes.
    PauseWaitForJob,
    /// A task suspended until a full queue has room.
    PauseWaitForQueueSpace,
    /// A suspended task resumed.
    ResumeFromPause,
    BeginIdle,
    EndIdle,
    BeginFunction,
    EndFunction,
}

impl MarkerType {
    pub fn is_begin(self) -> bool {
        matches!(
            self,
            MarkerType::Begin | MarkerType::ResumeFromPause | MarkerType::BeginIdle
        )
    }

    pub fn is_end(self) -> bool {
        matches!(
            self,
            MarkerType::End
                | MarkerType::PauseWaitForJob
                | MarkerType::PauseWaitForQueueSpace
                | MarkerType::EndIdle
        )
    }

    pub fn is_idle(self) -> bool {
        matches!(self, MarkerType::BeginIdle | MarkerType::EndIdle)
    }

    pub fn is_function(self) -> bool {
        matches!(self, MarkerType::BeginFunction | MarkerType::EndFunction)
    }
}

/// A single profile event.
#[derive(Debug, Clone, Copy)]
pub struct ProfileMark {
    pub marker: MarkerType,
    /// Ties begin/end pairs together (job address, guard sequence number...).
    pub identifier: usize,
    pub name: Option<&'static str>,
    pub thread_index: usize,
    pub system_id: i32,
}

/// Receiver of scheduler and task instrumentation.
pub trait Profiler: Send + Sync {
    fn add_profile_mark(&self, mark: ProfileMark);

    /// Emits `BeginFunction` now and `EndFunction` when the guard drops.
    fn create_profile_mark_guard(
        &self,
        function_name: &'static str,
        thread_index: usize,
        system_id: i32,
    ) -> MarkGuard<'_>
    where
        Self: Sized,
    {
        MarkGuard::new(self, function_name, thread_index, system_id)
    }
}

/// Profiler that drops every mark.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProfiler;

impl Profiler for NullProfiler {
    fn add_profile_mark(&self, _mark: ProfileMark) {}
}

static GUARD_SEQUENCE: AtomicUsize = AtomicUsize::new(1);

/// Scoped function mark: `BeginFunction` on creation, `EndFunction` on drop.
#[must_use = "the function mark ends when the guard is dropped"]
pub struct MarkGuard<'a> {
    profiler: &'a dyn Profiler,
    identifier: usize,
    thread_index: usize,
    system_id: i32,
}

impl<'a> MarkGuard<'a> {
    pub fn new(
        profiler: &'a dyn Profiler,
        function_name: &'static str,
        thread_index: usize,
        system_id: i32,
    ) -> Self {
        let identifier = GUARD_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        profiler.add_profile_mark(ProfileMark {
            marker: MarkerType::BeginFunction,
            identifier,
            name: Some(function_name),
            thread_index,
            system_id,
        });
        MarkGuard {
            profiler,
            identifier,
            thread_index,
            system_id,
        }
    }
}

impl Drop for MarkGuard<'_> {
    fn drop(&mut self) {
        self.profiler.add_profile_mark(ProfileMark {
            marker: MarkerType::EndFunction,
            identifier: self.identifier,
            name: None,
            thread_index: self.thread_index,
            system_id: self.system_id,
        });
    }
}
