//! Scratch memory for running tasks.
//!
//! A single region is cut into fixed-size blocks ([`LabeledBlockAllocator`]).
//! Blocks are checked out under a [`Label`] and reclaimed in bulk by label.
//! [`ThreadedLabeledBlockAllocator`] gives every (thread, label) pair its own
//! bump arena ([`StackAllocator`]) backed by those blocks, so the common path
//! never touches the shared lock.

pub mod block;
pub mod label_map;
pub mod stack;
pub mod threaded;

use std::fmt;

pub use block::{BlockId, BlockRun, LabeledBlockAllocator};
pub use label_map::LabelMap;
pub use stack::{LabelTag, MemoryBlock, StackAllocator, StackGuard};
pub use threaded::{AllocatorConfig, LabelGuard, ThreadedLabeledBlockAllocator};

/// Identifies the owner of a group of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u64);

impl Label {
    /// Reserved for allocator bookkeeping; never handed out to callers.
    pub const INTERNAL: Label = Label(0);

    pub const fn new(raw: u64) -> Self {
        Label(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
