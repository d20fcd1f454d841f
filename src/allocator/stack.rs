use super::Label;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Label and generation a block was allocated under.
///
/// The generation changes every time the label is freed, so a stale handle
/// can be detected with [`ThreadedLabeledBlockAllocator::is_live`].
///
/// [`ThreadedLabeledBlockAllocator::is_live`]: super::ThreadedLabeledBlockAllocator::is_live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelTag {
    pub label: Label,
    pub generation: u32,
}

/// A typed run of `len` elements handed out by an allocator.
///
/// This is a plain handle: it does not own the memory and does not keep it
/// alive. Memory stays valid until its arena is popped, reset, or its label
/// is freed.
pub struct MemoryBlock<T> {
    ptr: NonNull<T>,
    len: usize,
    tag: Option<LabelTag>,
}

impl<T> Clone for MemoryBlock<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MemoryBlock<T> {}

impl<T> std::fmt::Debug for MemoryBlock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("tag", &self.tag)
            .finish()
    }
}

// SAFETY: the handle is an address plus a length; sharing it is as safe as
// sharing the elements themselves.
unsafe impl<T: Send> Send for MemoryBlock<T> {}
unsafe impl<T: Sync> Sync for MemoryBlock<T> {}

impl<T> MemoryBlock<T> {
    pub(crate) fn from_raw(ptr: NonNull<T>, len: usize) -> Self {
        MemoryBlock {
            ptr,
            len,
            tag: None,
        }
    }

    pub(crate) fn with_tag(mut self, label: Label, generation: u32) -> Self {
        self.tag = Some(LabelTag { label, generation });
        self
    }

    /// Same address and tag, new length.
    pub(crate) fn resized(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * size_of::<T>()
    }

    pub fn tag(&self) -> Option<LabelTag> {
        self.tag
    }

    /// Writes `value` at `index`.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    ///
    /// # Safety
    /// The block must still be live and no other reference to that element may exist.
    pub unsafe fn write(&self, index: usize, value: T) {
        assert!(index < self.len, "index {} out of bounds for block of {}", index, self.len);
        unsafe { self.ptr.as_ptr().add(index).write(value) }
    }

    /// Reads the element at `index`.
    ///
    /// # Panics
    /// Panics if `index >= len`.
    ///
    /// # Safety
    /// The block must still be live and the element initialized.
    pub unsafe fn read(&self, index: usize) -> T
    where
        T: Copy,
    {
        assert!(index < self.len, "index {} out of bounds for block of {}", index, self.len);
        unsafe { self.ptr.as_ptr().add(index).read() }
    }

    /// # Safety
    /// The block must still be live and no other reference into it may exist
    /// for `'a`.
    pub unsafe fn as_uninit_mut<'a>(&self) -> &'a mut [MaybeUninit<T>] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), self.len) }
    }

    /// # Safety
    /// As [`MemoryBlock::as_uninit_mut`], and every element must be initialized.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// The block must still be live, every element initialized, and no
    /// mutable reference into it may exist for `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Linear bump allocator with nested checkpoints.
///
/// `push` stores the previous checkpoint offset inside the buffer itself, so
/// checkpoints cost no memory outside the arena.
pub struct StackAllocator<'buf> {
    buffer: NonNull<u8>,
    size: usize,
    current_offset: usize,
    last_offset: usize,
    last_alloc: Option<usize>,
    depth: usize,
    _buffer: PhantomData<&'buf mut [u8]>,
}

// SAFETY: the allocator behaves like the `&'buf mut [u8]` it was built from.
unsafe impl Send for StackAllocator<'_> {}

impl<'buf> StackAllocator<'buf> {
    /// Creates an allocator over `buffer`.
    pub fn new(buffer: &'buf mut [u8]) -> Self {
        let size = buffer.len();
        // SAFETY: the borrow keeps `buffer` alive and exclusive for 'buf.
        unsafe { Self::from_raw_parts(NonNull::from(buffer).cast(), size) }
    }

    /// An allocator with no memory; every allocation fails.
    pub fn empty() -> Self {
        // SAFETY: a zero-sized buffer is never dereferenced.
        unsafe { Self::from_raw_parts(NonNull::dangling(), 0) }
    }

    /// # Safety
    /// `buffer..buffer + size` must be valid for reads and writes and not be
    /// accessed through any other path for `'buf`.
    pub unsafe fn from_raw_parts(buffer: NonNull<u8>, size: usize) -> Self {
        StackAllocator {
            buffer,
            size,
            current_offset: 0,
            last_offset: 0,
            last_alloc: None,
            depth: 0,
            _buffer: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.current_offset
    }

    pub fn remaining(&self) -> usize {
        self.size - self.current_offset
    }

    /// Number of outstanding `push` checkpoints.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Offset of the first address at or after `offset` aligned to `align`.
    fn align_offset(&self, offset: usize, align: usize) -> Option<usize> {
        let address = (self.buffer.as_ptr() as usize).checked_add(offset)?;
        let aligned = address.checked_add(align - 1)? & !(align - 1);
        Some(aligned - self.buffer.as_ptr() as usize)
    }

    /// Bump-allocates `n` elements of `T`, or returns `None` if they do not fit.
    pub fn alloc<T>(&mut self, n: usize) -> Option<MemoryBlock<T>> {
        if size_of::<T>() == 0 {
            return Some(MemoryBlock::from_raw(NonNull::dangling(), n));
        }

        let bytes = size_of::<T>().checked_mul(n)?;
        let start = self.align_offset(self.current_offset, align_of::<T>())?;
        let end = start.checked_add(bytes)?;
        if end > self.size {
            return None;
        }

        self.current_offset = end;
        self.last_alloc = Some(start);
        // SAFETY: start..end lies inside the buffer.
        let ptr = unsafe { self.buffer.add(start) }.cast::<T>();
        Some(MemoryBlock::from_raw(ptr, n))
    }

    /// Resizes `old` to `n` elements.
    ///
    /// When `old` is the most recent allocation it grows or shrinks in place;
    /// otherwise a new block is allocated and the overlapping prefix copied.
    /// Returns `None` if the new size does not fit.
    ///
    /// # Safety
    /// `old` must point to memory that is still allocated (from this or any
    /// other allocator) and not being written concurrently.
    pub unsafe fn realloc_array<T: Copy>(
        &mut self,
        old: MemoryBlock<T>,
        n: usize,
    ) -> Option<MemoryBlock<T>> {
        if size_of::<T>() == 0 {
            return Some(MemoryBlock::from_raw(NonNull::dangling(), n));
        }

        let base = self.buffer.as_ptr() as usize;
        let old_offset = (old.as_ptr() as usize).checked_sub(base);
        if old_offset.is_some() && old_offset == self.last_alloc {
            let start = old_offset?;
            let end = start.checked_add(size_of::<T>().checked_mul(n)?)?;
            if end > self.size {
                return None;
            }
            self.current_offset = end;
            return Some(old.resized(n));
        }

        let new = self.alloc::<T>(n)?;
        let count = old.len().min(n);
        // SAFETY: the caller guarantees `old` is readable; `new` is fresh and
        // cannot overlap it.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), count);
        }
        Some(new)
    }

    /// Opens a checkpoint. Returns `false` (and changes nothing) if there is no
    /// room left for the checkpoint header.
    #[must_use]
    pub fn push(&mut self) -> bool {
        let saved_offset = self.current_offset;
        let Some(header) = self.alloc::<usize>(1) else {
            return false;
        };
        // SAFETY: the header slot was just allocated and is aligned for usize.
        unsafe {
            header.as_ptr().write(self.last_offset);
        }
        self.last_offset = saved_offset;
        self.last_alloc = None;
        self.depth += 1;
        true
    }

    /// Rewinds to the most recent checkpoint. Returns `false` if there is none.
    pub fn pop(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }

        let saved_offset = self.last_offset;
        let header = self
            .align_offset(saved_offset, align_of::<usize>())
            .unwrap_or(saved_offset);
        // SAFETY: `push` wrote the previous offset at exactly this position.
        self.last_offset = unsafe { self.buffer.add(header).cast::<usize>().read() };
        self.current_offset = saved_offset;
        self.last_alloc = None;
        self.depth -= 1;
        true
    }

    /// Opens a checkpoint that is popped when the returned guard drops.
    pub fn guard(&mut self) -> Option<StackGuard<'_, 'buf>> {
        if self.push() {
            Some(StackGuard { allocator: self })
        } else {
            None
        }
    }

    /// Discards every allocation and checkpoint.
    pub fn reset(&mut self) {
        self.current_offset = 0;
        self.last_offset = 0;
        self.last_alloc = None;
        self.depth = 0;
    }
}

/// Scoped checkpoint: pops its allocator on drop, whatever the exit path.
pub struct StackGuard<'a, 'buf> {
    allocator: &'a mut StackAllocator<'buf>,
}

impl<'buf> Deref for StackGuard<'_, 'buf> {
    type Target = StackAllocator<'buf>;

    fn deref(&self) -> &Self::Target {
        self.allocator
    }
}

impl DerefMut for StackGuard<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.allocator
    }
}

impl Drop for StackGuard<'_, '_> {
    fn drop(&mut self) {
        self.allocator.pop();
    }
}
