use super::block::{LabeledBlockAllocator, REGION_ALIGN};
use super::label_map::LabelMap;
use super::stack::{MemoryBlock, StackAllocator};
use super::Label;
use crate::error::AllocError;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::mem::{align_of, size_of};

/// Sizing of the shared block pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Bytes per block. Must be a power of two.
    pub block_size: usize,
    /// Blocks in the region.
    pub num_blocks: usize,
    /// Number of distinct thread indices that may allocate.
    pub max_threads: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            block_size: 2 * 1024 * 1024,
            num_blocks: 128,
            max_threads: 64,
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<(), AllocError> {
        if !self.block_size.is_power_of_two() || self.block_size < 64 {
            return Err(AllocError::InvalidConfig(format!(
                "block_size must be a power of two >= 64, got {}",
                self.block_size
            )));
        }
        if self.num_blocks == 0 {
            return Err(AllocError::InvalidConfig("num_blocks must be > 0".into()));
        }
        if self.max_threads == 0 {
            return Err(AllocError::InvalidConfig("max_threads must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelState {
    Free,
    Active,
    Releasing,
}

struct LabelRecord {
    name: &'static str,
    state: LabelState,
    generation: u32,
    blocks: usize,
}

struct Shared {
    pool: LabeledBlockAllocator,
    labels: Vec<LabelRecord>,
    free_labels: Vec<Label>,
}

impl Shared {
    fn record(&mut self, label: Label) -> Result<&mut LabelRecord, AllocError> {
        let index = (label.raw() as usize)
            .checked_sub(1)
            .ok_or(AllocError::InternalLabel)?;
        self.labels
            .get_mut(index)
            .ok_or(AllocError::UnknownLabel(label))
    }

    fn active_record(&mut self, label: Label) -> Result<&mut LabelRecord, AllocError> {
        let record = self.record(label)?;
        match record.state {
            LabelState::Active => Ok(record),
            LabelState::Releasing => Err(AllocError::LabelReleasing(label)),
            LabelState::Free => Err(AllocError::UnknownLabel(label)),
        }
    }
}

/// One thread's bump arena for one label.
struct Arena {
    stack: StackAllocator<'static>,
    generation: u32,
}

impl Arena {
    fn empty() -> Self {
        Arena {
            stack: StackAllocator::empty(),
            generation: 0,
        }
    }
}

/// Labeled block allocator with a bump arena per (thread, label).
///
/// Small requests are served from the calling thread's arena without touching
/// the shared lock. The shared lock is taken to refill an arena, for requests
/// of a block or more, and for label bookkeeping. Lock order is always the
/// per-thread lock before the shared one.
pub struct ThreadedLabeledBlockAllocator {
    config: AllocatorConfig,
    shared: Mutex<Shared>,
    threads: Box<[CachePadded<Mutex<LabelMap<Arena>>>]>,
}

impl ThreadedLabeledBlockAllocator {
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocError> {
        config.validate()?;
        let pool = LabeledBlockAllocator::new(config.num_blocks, config.block_size)?;

        tracing::info!(
            blocks = config.num_blocks,
            block_size = config.block_size,
            threads = config.max_threads,
            "block allocator ready"
        );

        Ok(ThreadedLabeledBlockAllocator {
            config,
            shared: Mutex::new(Shared {
                pool,
                labels: Vec::new(),
                free_labels: Vec::new(),
            }),
            threads: (0..config.max_threads)
                .map(|_| CachePadded::new(Mutex::new(LabelMap::new())))
                .collect(),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn max_threads(&self) -> usize {
        self.config.max_threads
    }

    pub fn free_blocks(&self) -> usize {
        self.shared.lock().pool.free_blocks()
    }

    /// Number of label records ever created (checked out or pooled).
    pub fn label_pool_len(&self) -> usize {
        self.shared.lock().labels.len()
    }

    /// Name the label was checked out under, if it is checked out.
    pub fn label_name(&self, label: Label) -> Option<&'static str> {
        let mut shared = self.shared.lock();
        shared.active_record(label).ok().map(|r| r.name)
    }

    /// Blocks currently owned by `label`.
    pub fn label_blocks(&self, label: Label) -> usize {
        let mut shared = self.shared.lock();
        shared.record(label).map(|r| r.blocks).unwrap_or(0)
    }

    fn check_args(&self, label: Label, thread: usize) -> Result<(), AllocError> {
        if label == Label::INTERNAL {
            return Err(AllocError::InternalLabel);
        }
        if thread >= self.threads.len() {
            return Err(AllocError::ThreadOutOfRange {
                thread,
                max: self.threads.len(),
            });
        }
        Ok(())
    }

    /// Allocates `n` elements of `T` for `label` from `thread`'s arena.
    pub fn alloc<T>(
        &self,
        label: Label,
        thread: usize,
        n: usize,
    ) -> Result<MemoryBlock<T>, AllocError> {
        self.check_args(label, thread)?;
        debug_assert!(align_of::<T>() <= REGION_ALIGN);

        let bytes = size_of::<T>()
            .checked_mul(n)
            .ok_or(AllocError::Exhausted { blocks: usize::MAX })?;
        if bytes < self.config.block_size {
            self.arena_alloc(label, thread, |stack| stack.alloc::<T>(n))
        } else {
            self.large_alloc(label, n)
        }
    }

    /// Resizes `old` to `n` elements, copying the overlapping prefix when the
    /// memory has to move.
    pub fn realloc_array<T: Copy>(
        &self,
        label: Label,
        thread: usize,
        old: MemoryBlock<T>,
        n: usize,
    ) -> Result<MemoryBlock<T>, AllocError> {
        self.check_args(label, thread)?;
        if let Some(tag) = old.tag() {
            if !self.is_live(&old) {
                return Err(AllocError::StaleBlock(tag.label));
            }
        }

        let block_size = self.config.block_size;
        let bytes = size_of::<T>()
            .checked_mul(n)
            .ok_or(AllocError::Exhausted { blocks: usize::MAX })?;

        if bytes < block_size {
            // SAFETY: `old` is live, so its memory is still inside the region.
            return self.arena_alloc(label, thread, |stack| unsafe { stack.realloc_array(old, n) });
        }

        let old_blocks = old.size_bytes().div_ceil(block_size);
        if old.size_bytes() >= block_size && old_blocks == bytes.div_ceil(block_size) {
            return Ok(old.resized(n));
        }

        let new = self.large_alloc::<T>(label, n)?;
        // SAFETY: `old` is live and `new` is a fresh run that cannot overlap it.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old.len().min(n));
        }
        Ok(new)
    }

    fn arena_alloc<T>(
        &self,
        label: Label,
        thread: usize,
        attempt: impl Fn(&mut StackAllocator<'static>) -> Option<MemoryBlock<T>>,
    ) -> Result<MemoryBlock<T>, AllocError> {
        let mut arenas = self.threads[thread].lock();
        let arena = arenas.get_or_insert_with(label, Arena::empty);

        if let Some(block) = attempt(&mut arena.stack) {
            return Ok(block.with_tag(label, arena.generation));
        }

        if let Err(err) = self.refill(arena, label, thread) {
            if arena.stack.capacity() == 0 {
                arenas.remove(label);
            }
            return Err(err);
        }

        attempt(&mut arena.stack)
            .map(|block| block.with_tag(label, arena.generation))
            .ok_or(AllocError::Exhausted { blocks: 1 })
    }

    /// Points `arena` at a fresh block. Called with the thread's lock held.
    fn refill(&self, arena: &mut Arena, label: Label, thread: usize) -> Result<(), AllocError> {
        let mut shared = self.shared.lock();
        let generation = shared.active_record(label)?.generation;

        let block = shared
            .pool
            .get_block(label)
            .ok_or(AllocError::Exhausted { blocks: 1 })?;
        let ptr = shared
            .pool
            .block_ptr(block)
            .ok_or(AllocError::Exhausted { blocks: 1 })?;
        shared.active_record(label)?.blocks += 1;

        // SAFETY: the block belongs to `label` until `free(label)`, which
        // removes this arena before reclaiming it.
        arena.stack = unsafe { StackAllocator::from_raw_parts(ptr, self.config.block_size) };
        arena.generation = generation;

        tracing::debug!(%label, thread, block = block.index(), "arena refilled");
        Ok(())
    }

    fn large_alloc<T>(&self, label: Label, n: usize) -> Result<MemoryBlock<T>, AllocError> {
        let bytes = size_of::<T>() * n;
        let count = bytes.div_ceil(self.config.block_size);

        let mut shared = self.shared.lock();
        let generation = shared.active_record(label)?.generation;
        let run = shared
            .pool
            .get_consecutive_blocks(label, count)
            .ok_or(AllocError::Exhausted { blocks: count })?;
        let ptr = shared
            .pool
            .block_ptr(run.first)
            .ok_or(AllocError::Exhausted { blocks: count })?;
        shared.active_record(label)?.blocks += count;

        tracing::debug!(%label, blocks = count, "large allocation");
        Ok(MemoryBlock::from_raw(ptr.cast::<T>(), n).with_tag(label, generation))
    }

    /// Reclaims every block owned by `label` and returns how many were freed.
    ///
    /// Handles allocated before the call become stale; the label itself stays
    /// checked out and can allocate again.
    pub fn free(&self, label: Label) -> Result<usize, AllocError> {
        if label == Label::INTERNAL {
            return Err(AllocError::InternalLabel);
        }

        self.shared.lock().active_record(label)?.state = LabelState::Releasing;

        for thread in self.threads.iter() {
            thread.lock().remove(label);
        }

        let mut shared = self.shared.lock();
        let freed = shared.pool.free(label);
        let record = shared.record(label)?;
        record.state = LabelState::Active;
        record.generation = record.generation.wrapping_add(1);
        record.blocks = 0;

        tracing::debug!(%label, blocks = freed, "label freed");
        Ok(freed)
    }

    /// Checks out a label, reusing a pooled one when available.
    pub fn get_unused_label(&self, name: &'static str) -> Label {
        let mut shared = self.shared.lock();
        if let Some(label) = shared.free_labels.pop() {
            if let Ok(record) = shared.record(label) {
                record.name = name;
                record.state = LabelState::Active;
                return label;
            }
        }

        shared.labels.push(LabelRecord {
            name,
            state: LabelState::Active,
            generation: 0,
            blocks: 0,
        });
        Label::new(shared.labels.len() as u64)
    }

    /// Returns a label to the pool. The label must not own any blocks.
    pub fn return_label(&self, label: Label) -> Result<(), AllocError> {
        let mut shared = self.shared.lock();
        let record = shared.active_record(label)?;
        if record.blocks > 0 {
            tracing::warn!(%label, name = record.name, blocks = record.blocks, "label returned while owning blocks");
            return Err(AllocError::LabelInUse {
                label,
                blocks: record.blocks,
            });
        }
        record.state = LabelState::Free;
        record.generation = record.generation.wrapping_add(1);
        shared.free_labels.push(label);
        Ok(())
    }

    /// Checks out a label that is freed and returned when the guard drops.
    pub fn get_unused_label_with_guard(&self, name: &'static str) -> LabelGuard<'_> {
        LabelGuard {
            label: self.get_unused_label(name),
            allocator: self,
        }
    }

    /// Whether `block` was allocated under the current generation of its label.
    ///
    /// Untagged blocks (from a standalone [`StackAllocator`]) are always live.
    pub fn is_live<T>(&self, block: &MemoryBlock<T>) -> bool {
        let Some(tag) = block.tag() else {
            return true;
        };
        let mut shared = self.shared.lock();
        match shared.record(tag.label) {
            Ok(record) => record.state == LabelState::Active && record.generation == tag.generation,
            Err(_) => false,
        }
    }
}

/// A checked-out label that frees its blocks and returns itself on drop.
pub struct LabelGuard<'a> {
    label: Label,
    allocator: &'a ThreadedLabeledBlockAllocator,
}

impl LabelGuard<'_> {
    pub fn label(&self) -> Label {
        self.label
    }
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        let released = self
            .allocator
            .free(self.label)
            .and_then(|_| self.allocator.return_label(self.label));
        if let Err(err) = released {
            tracing::warn!(label = %self.label, %err, "label guard failed to release");
        }
    }
}
