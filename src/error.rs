//! Error types for the scheduler and the allocator.
//!
//! Queue-full is deliberately absent: it is handled inside the scheduler by
//! yielding and retrying, and never reaches the caller.

use crate::allocator::Label;
use thiserror::Error;

/// Failures reported by the job scheduler and its host wrapper.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The fiber platform could not create an execution context.
    #[error("failed to create fiber with {stack_size} byte stack: {reason}")]
    FiberCreation { stack_size: usize, reason: String },

    /// A job was handed to `do_job` twice without being reset.
    #[error("job `{name}` was already submitted")]
    JobAlreadySubmitted { name: &'static str },

    /// `wait` was called on a job that was never submitted and would never finish.
    #[error("job `{name}` was never submitted; waiting on it would never return")]
    JobNotSubmitted { name: &'static str },

    /// Configuration rejected by `validate`.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    /// One or more worker threads panicked before joining.
    #[error("{count} worker thread(s) panicked")]
    WorkerPanicked { count: usize },

    /// Allocator failure surfaced through the job system.
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

/// Failures reported by the labeled block allocator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// The block pool has no free run of the requested length.
    #[error("block pool exhausted (needed {blocks} block(s))")]
    Exhausted { blocks: usize },

    /// The thread index is outside the range the allocator was built for.
    #[error("thread index {thread} out of range (allocator supports {max} threads)")]
    ThreadOutOfRange { thread: usize, max: usize },

    /// The reserved internal label was used by a caller.
    #[error("the internal data label cannot be used by callers")]
    InternalLabel,

    /// The label is not currently checked out.
    #[error("label {0} is not in use")]
    UnknownLabel(Label),

    /// The label is being freed by another thread.
    #[error("label {0} is being released")]
    LabelReleasing(Label),

    /// The label still owns blocks and cannot be returned.
    #[error("label {label} still owns {blocks} block(s); free it before returning it")]
    LabelInUse { label: Label, blocks: usize },

    /// The block belongs to an earlier generation of its label.
    #[error("block of label {0} was freed")]
    StaleBlock(Label),

    /// Configuration rejected by `validate`.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
}
