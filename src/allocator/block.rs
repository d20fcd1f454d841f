use super::Label;
use crate::error::AllocError;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Upper bound on the region alignment; element types needing more are not supported.
pub const REGION_ALIGN: usize = 4096;

/// Index of a block inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A run of adjacent blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub first: BlockId,
    pub count: usize,
}

#[derive(Debug, Clone, Copy)]
struct ControlBlock {
    label: Label,
    next: Option<usize>,
}

/// Hands out fixed-size blocks of one contiguous region, each tagged with a label.
///
/// Not synchronized; wrap it in a lock to share it.
pub struct LabeledBlockAllocator {
    region: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    controls: Vec<ControlBlock>,
    first_free: Option<usize>,
    first_used: Option<usize>,
    free_blocks: usize,
}

// SAFETY: the allocator exclusively owns its region.
unsafe impl Send for LabeledBlockAllocator {}

impl LabeledBlockAllocator {
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self, AllocError> {
        if num_blocks == 0 {
            return Err(AllocError::InvalidConfig("num_blocks must be > 0".into()));
        }
        if !block_size.is_power_of_two() || block_size < 64 {
            return Err(AllocError::InvalidConfig(format!(
                "block_size must be a power of two >= 64, got {}",
                block_size
            )));
        }
        let total = num_blocks
            .checked_mul(block_size)
            .ok_or_else(|| AllocError::InvalidConfig("region size overflows usize".into()))?;
        let layout = Layout::from_size_align(total, block_size.min(REGION_ALIGN))
            .map_err(|e| AllocError::InvalidConfig(e.to_string()))?;

        // SAFETY: layout has a non-zero size.
        let region = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(AllocError::Exhausted { blocks: num_blocks })?;

        let controls = (0..num_blocks)
            .map(|i| ControlBlock {
                label: Label::INTERNAL,
                next: if i + 1 < num_blocks { Some(i + 1) } else { None },
            })
            .collect();

        Ok(LabeledBlockAllocator {
            region,
            layout,
            block_size,
            controls,
            first_free: Some(0),
            first_used: None,
            free_blocks: num_blocks,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.controls.len()
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Label currently owning `block`, or `None` if the block is free.
    pub fn owner(&self, block: BlockId) -> Option<Label> {
        let mut cursor = self.first_free;
        while let Some(index) = cursor {
            if index == block.0 {
                return None;
            }
            cursor = self.controls[index].next;
        }
        self.controls.get(block.0).map(|c| c.label)
    }

    /// Start address of `block`.
    pub fn block_ptr(&self, block: BlockId) -> Option<NonNull<u8>> {
        if block.0 >= self.controls.len() {
            return None;
        }
        // SAFETY: the offset lies inside the region.
        Some(unsafe { self.region.add(block.0 * self.block_size) })
    }

    /// Takes one free block for `label`.
    pub fn get_block(&mut self, label: Label) -> Option<BlockId> {
        let index = self.first_free?;
        self.first_free = self.controls[index].next;
        self.controls[index] = ControlBlock {
            label,
            next: self.first_used,
        };
        self.first_used = Some(index);
        self.free_blocks -= 1;
        Some(BlockId(index))
    }

    /// Takes `count` adjacent blocks for `label`.
    ///
    /// Starting from a free block, the run is grown with free neighbours on
    /// either side. Runs that cannot grow are parked and a new one is started
    /// from the next free block. On failure every parked block goes back to
    /// the free list.
    pub fn get_consecutive_blocks(&mut self, label: Label, count: usize) -> Option<BlockRun> {
        if count == 0 || count > self.free_blocks {
            return None;
        }

        let mut failed: Option<(usize, usize)> = None;
        let mut run = self.pop_free()?;
        let (mut chain_first, mut chain_last) = (run, run);
        let (mut low, mut high) = (run, run);

        while high + 1 - low < count {
            match self.take_neighbour(low, high) {
                Some(block) if Some(block) == low.checked_sub(1) => {
                    self.controls[block].next = Some(chain_first);
                    chain_first = block;
                    low = block;
                }
                Some(block) => {
                    self.controls[chain_last].next = Some(block);
                    self.controls[block].next = None;
                    chain_last = block;
                    high = block;
                }
                None => {
                    // Park the run and start over from the next free block.
                    self.controls[chain_last].next = failed.map(|(first, _)| first);
                    failed = Some(match failed {
                        Some((_, last)) => (chain_first, last),
                        None => (chain_first, chain_last),
                    });

                    match self.pop_free() {
                        Some(next) => {
                            run = next;
                            chain_first = run;
                            chain_last = run;
                            low = run;
                            high = run;
                        }
                        None => {
                            self.restore_free(failed);
                            return None;
                        }
                    }
                }
            }
        }

        self.restore_free(failed);

        let mut cursor = Some(chain_first);
        while let Some(index) = cursor {
            self.controls[index].label = label;
            cursor = if index == chain_last {
                None
            } else {
                self.controls[index].next
            };
        }
        self.controls[chain_last].next = self.first_used;
        self.first_used = Some(chain_first);
        self.free_blocks -= count;

        Some(BlockRun {
            first: BlockId(low),
            count,
        })
    }

    /// Returns every block owned by `label` to the free list.
    pub fn free(&mut self, label: Label) -> usize {
        let mut freed = 0;
        let mut prev: Option<usize> = None;
        let mut cursor = self.first_used;

        while let Some(index) = cursor {
            let next = self.controls[index].next;
            if self.controls[index].label == label {
                match prev {
                    Some(p) => self.controls[p].next = next,
                    None => self.first_used = next,
                }
                self.controls[index] = ControlBlock {
                    label: Label::INTERNAL,
                    next: self.first_free,
                };
                self.first_free = Some(index);
                freed += 1;
            } else {
                prev = Some(index);
            }
            cursor = next;
        }

        self.free_blocks += freed;
        freed
    }

    fn pop_free(&mut self) -> Option<usize> {
        let index = self.first_free?;
        self.first_free = self.controls[index].next;
        self.controls[index].next = None;
        Some(index)
    }

    /// Unlinks a free block adjacent to `low..=high`.
    fn take_neighbour(&mut self, low: usize, high: usize) -> Option<usize> {
        let below = low.checked_sub(1);
        let above = high + 1;
        let mut prev: Option<usize> = None;
        let mut cursor = self.first_free;

        while let Some(index) = cursor {
            let next = self.controls[index].next;
            if Some(index) == below || index == above {
                match prev {
                    Some(p) => self.controls[p].next = next,
                    None => self.first_free = next,
                }
                return Some(index);
            }
            prev = Some(index);
            cursor = next;
        }
        None
    }

    fn restore_free(&mut self, failed: Option<(usize, usize)>) {
        if let Some((first, last)) = failed {
            self.controls[last].next = self.first_free;
            self.first_free = Some(first);
        }
    }
}

impl Drop for LabeledBlockAllocator {
    fn drop(&mut self) {
        // SAFETY: region was allocated with this layout in `new`.
        unsafe { dealloc(self.region.as_ptr(), self.layout) }
    }
}
