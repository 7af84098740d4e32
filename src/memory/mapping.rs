//! Host access to memory blocks
//!
//! A memory object can only have one range mapped at a time. Persistent mappings map a whole block once and keep it
//! mapped until the block is destroyed. Transient mappings map only what they need and unmap when they go out of scope.
//! Both hand out views that take care of flushing and invalidating non-coherent memory.

#![allow(unsafe_code)]

use crate::core::allocators::{align, align_down};
use crate::memory::block::{AllocationId, BlockId, MemoryBlock, TransientState};
use crate::memory::pool::{BlockAllocator, MemoryPool, PoolState, SubAllocation};
use crate::rhi::{Device, MapContention, MappedMemoryRange, MappingError, MemoryPropertyFlags};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::MutexGuard;

/// A pointer to mapped device memory
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct HostPtr(NonNull<u8>);

// The pointer is only dereferenced through mapping views, which borrow the sub-allocation they point into
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        HostPtr(ptr)
    }

    /// The pointer `bytes` past this one. `bytes` must stay inside the mapped range.
    fn add(self, bytes: u64) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(bytes as usize)) }
    }
}

/// How long a mapping should last.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MapMode {
    /// Map the whole block and keep it mapped until the block is destroyed.
    Persistent,

    /// Map the sub-allocation for as long as the returned guard lives.
    Transient,
}

/// Arbitrates host mappings of the blocks of a [`BlockAllocator`]
pub struct MappingManager<'a, D: Device> {
    allocator: &'a BlockAllocator<D>,
    contention: MapContention,
}

impl<'a, D: Device> MappingManager<'a, D> {
    /// Creates a mapping manager that follows `contention` when a block is already mapped.
    pub fn new(allocator: &'a BlockAllocator<D>, contention: MapContention) -> Self {
        MappingManager { allocator, contention }
    }

    /// Maps `allocation` in the given mode, covering the whole sub-allocation.
    pub fn map_for<'s>(&self, allocation: &'s SubAllocation, mode: MapMode) -> Result<HostMapping<'s, D>, MappingError>
    where
        'a: 's,
    {
        match mode {
            MapMode::Persistent => self.map_persistent(allocation).map(HostMapping::Persistent),
            MapMode::Transient => self
                .map_transient(allocation, 0..allocation.size())
                .map(HostMapping::Transient),
        }
    }

    /// Maps the block `allocation` lives in for the rest of the block's life, and returns a view of `allocation`.
    ///
    /// The first persistent mapping of a block maps all of it. Later ones reuse the same pointer. A sub-allocation
    /// can only have one live view at a time.
    pub fn map_persistent<'s>(&self, allocation: &'s SubAllocation) -> Result<PersistentMapping<'s, D>, MappingError>
    where
        'a: 's,
    {
        let pool = self.host_visible_pool(allocation)?;
        let mut state = pool.lock();

        loop {
            let block = block_of(&mut state, allocation.block())?;
            let viewed = block.mapping.views.contains(&allocation.id());
            if !viewed && block.mapping.persistent.is_some() {
                break;
            }

            if !viewed && block.mapping.transient.is_none() {
                let ptr = self.allocator.device().map_memory(block.memory, 0, block.size)?;
                block.mapping.persistent = Some(HostPtr::new(ptr));
                log::debug!("Persistently mapped {}", block.id);
                break;
            }

            if self.contention == MapContention::Fail {
                return Err(MappingError::AlreadyMapped);
            }
            state = pool.wait_for_unmap(state);
        }

        let block = block_of(&mut state, allocation.block())?;
        let base = block.mapping.persistent.ok_or(MappingError::MappingFailed)?;
        block.mapping.views.insert(allocation.id());
        let view = MappedView::new(self.allocator, pool, block, allocation, base.add(allocation.offset()), allocation.offset(), allocation.size());

        Ok(PersistentMapping { view })
    }

    /// Maps `range` of `allocation` until the returned guard is dropped.
    ///
    /// If the block is persistently mapped, the guard borrows that mapping instead of mapping again. Either way, only
    /// one transient guard can be alive per block, and not while `allocation` has a persistent view.
    pub fn map_transient<'s>(
        &self,
        allocation: &'s SubAllocation,
        range: Range<u64>,
    ) -> Result<TransientMapping<'s, D>, MappingError>
    where
        'a: 's,
    {
        if range.start >= range.end || range.end > allocation.size() {
            return Err(MappingError::OutOfRange {
                start: range.start,
                end: range.end,
            });
        }

        let pool = self.host_visible_pool(allocation)?;
        let atom = self.allocator.catalog().non_coherent_atom_size();
        let coherent = pool.flags.contains(MemoryPropertyFlags::HOST_COHERENT);
        let mut state = pool.lock();

        loop {
            let block = block_of(&mut state, allocation.block())?;
            if block.mapping.transient.is_none() && !block.mapping.views.contains(&allocation.id()) {
                break;
            }

            if self.contention == MapContention::Fail {
                return Err(MappingError::AlreadyMapped);
            }
            state = pool.wait_for_unmap(state);
        }

        let block = block_of(&mut state, allocation.block())?;
        let start = allocation.offset() + range.start;
        let end = allocation.offset() + range.end;

        let ptr = match block.mapping.persistent {
            Some(base) => {
                block.mapping.transient = Some(TransientState { owns_map: false });
                base.add(start)
            }
            None => {
                // Keep the whole atom-aligned range mapped so flushes of it stay inside the mapping
                let (map_start, map_end) = if coherent {
                    (start, end)
                } else {
                    (align_down(start, atom), align(end, atom).min(block.size))
                };

                let ptr = self
                    .allocator
                    .device()
                    .map_memory(block.memory, map_start, map_end - map_start)?;
                block.mapping.transient = Some(TransientState { owns_map: true });
                HostPtr::new(ptr).add(start - map_start)
            }
        };

        block.mapping.views.insert(allocation.id());
        let view = MappedView::new(self.allocator, pool, block, allocation, ptr, start, range.end - range.start);

        Ok(TransientMapping { view })
    }

    fn host_visible_pool(&self, allocation: &SubAllocation) -> Result<&'a MemoryPool<D::Memory>, MappingError> {
        let pool = self.allocator.pool(allocation.memory_type());
        if pool.flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            Ok(pool)
        } else {
            Err(MappingError::NotHostVisible)
        }
    }
}

fn block_of<'g, M>(state: &'g mut MutexGuard<'_, PoolState<M>>, block: BlockId) -> Result<&'g mut MemoryBlock<M>, MappingError> {
    state.blocks.get_mut(&block).ok_or(MappingError::MappingFailed)
}

/// Host-visible bytes of a sub-allocation, with coherency handled for you
struct MappedView<'a, D: Device> {
    allocator: &'a BlockAllocator<D>,
    pool: &'a MemoryPool<D::Memory>,
    block: BlockId,
    allocation: AllocationId,
    memory: D::Memory,
    ptr: NonNull<u8>,

    /// Offset of the view from the start of its block.
    block_offset: u64,
    size: u64,
    block_size: u64,

    coherent: bool,
    atom: u64,

    /// Range relative to the view that was written but not flushed yet.
    dirty: Option<Range<u64>>,
}

impl<'a, D: Device> MappedView<'a, D> {
    fn new(
        allocator: &'a BlockAllocator<D>,
        pool: &'a MemoryPool<D::Memory>,
        block: &MemoryBlock<D::Memory>,
        allocation: &SubAllocation,
        ptr: NonNull<u8>,
        block_offset: u64,
        size: u64,
    ) -> Self {
        MappedView {
            allocator,
            pool,
            block: block.id,
            allocation: allocation.id(),
            memory: block.memory,
            ptr,
            block_offset,
            size,
            block_size: block.size,
            coherent: pool.flags.contains(MemoryPropertyFlags::HOST_COHERENT),
            atom: allocator.catalog().non_coherent_atom_size(),
            dirty: None,
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), MappingError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MappingError::OutOfRange {
                start: offset,
                end: offset.saturating_add(len),
            }),
        }
    }

    fn check_subrange(&self, range: &Range<u64>) -> Result<(), MappingError> {
        if range.start > range.end {
            return Err(MappingError::OutOfRange {
                start: range.start,
                end: range.end,
            });
        }

        self.check_range(range.start, range.end - range.start)
    }

    /// Range of the block covering `range` of the view, grown to whole atoms and clamped to the block
    fn device_range(&self, range: Range<u64>) -> MappedMemoryRange<D::Memory> {
        let start = align_down(self.block_offset + range.start, self.atom);
        let end = align(self.block_offset + range.end, self.atom).min(self.block_size);

        MappedMemoryRange {
            memory: self.memory,
            offset: start,
            size: end - start,
        }
    }

    fn mark_dirty(&mut self, range: Range<u64>) {
        if self.coherent {
            return;
        }

        self.dirty = Some(match self.dirty.take() {
            Some(dirty) => dirty.start.min(range.start)..dirty.end.max(range.end),
            None => range,
        });
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MappingError> {
        self.check_range(offset, data.len() as u64)?;

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset as usize), data.len());
        }

        self.mark_dirty(offset..offset + data.len() as u64);
        Ok(())
    }

    fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<(), MappingError> {
        self.check_range(offset, out.len() as u64)?;

        if !out.is_empty() {
            self.invalidate(offset..offset + out.len() as u64)?;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), MappingError> {
        match self.dirty.take() {
            Some(dirty) => {
                let range = self.device_range(dirty);
                self.allocator.device().flush_ranges(&[range])
            }
            None => Ok(()),
        }
    }

    fn invalidate(&self, range: Range<u64>) -> Result<(), MappingError> {
        if self.coherent || range.start >= range.end {
            return Ok(());
        }

        let range = self.device_range(range);
        self.allocator.device().invalidate_ranges(&[range])
    }

    /// Flushes what's left and forgets the view. Returns the block's state so the caller can finish tearing down the
    /// mapping before the lock is released.
    fn release(&mut self) -> MutexGuard<'a, PoolState<D::Memory>> {
        if let Err(err) = self.flush() {
            log::error!("Could not flush mapped memory of {}: {}", self.block, err);
        }

        let mut state = self.pool.lock();
        match state.blocks.get_mut(&self.block) {
            Some(block) => {
                block.mapping.views.remove(&self.allocation);
            }
            None => log::error!("{} was destroyed while it was mapped", self.block),
        }

        state
    }
}

/// A view of a sub-allocation inside a persistently mapped block
///
/// Writes to non-coherent memory are flushed right away. Anything written through [`PersistentMapping::as_mut_ptr`]
/// is flushed when the view is dropped. Dropping the view never unmaps the block.
pub struct PersistentMapping<'a, D: Device> {
    view: MappedView<'a, D>,
}

impl<'a, D: Device> PersistentMapping<'a, D> {
    /// Size of the view, in bytes.
    pub fn size(&self) -> u64 {
        self.view.size
    }

    /// Copies `data` into the view at `offset`, and flushes it if the memory isn't coherent.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MappingError> {
        self.view.write_bytes(offset, data)?;
        self.view.flush()
    }

    /// Copies bytes starting at `offset` into `out`, invalidating them first if the memory isn't coherent.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<(), MappingError> {
        self.view.read_bytes(offset, out)
    }

    /// Flushes everything written through raw pointers so far.
    pub fn flush(&mut self) -> Result<(), MappingError> {
        self.view.flush()
    }

    /// Makes device writes to `range` visible to the host.
    pub fn invalidate(&self, range: Range<u64>) -> Result<(), MappingError> {
        self.view.check_subrange(&range)?;
        self.view.invalidate(range)
    }

    /// Pointer to the start of the view, for reading.
    pub fn as_ptr(&self) -> *const u8 {
        self.view.ptr.as_ptr()
    }

    /// Pointer to the start of the view. The whole view is flushed when the mapping is dropped.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.view.mark_dirty(0..self.view.size);
        self.view.ptr.as_ptr()
    }
}

impl<'a, D: Device> Drop for PersistentMapping<'a, D> {
    fn drop(&mut self) {
        drop(self.view.release());

        self.view.pool.notify_unmapped();
    }
}

/// A scoped mapping of part of a sub-allocation
///
/// Writes to non-coherent memory are flushed on [`TransientMapping::flush`] or when the guard is dropped, and then the
/// range is unmapped.
pub struct TransientMapping<'a, D: Device> {
    view: MappedView<'a, D>,
}

impl<'a, D: Device> TransientMapping<'a, D> {
    /// Size of the mapped range, in bytes.
    pub fn size(&self) -> u64 {
        self.view.size
    }

    /// Copies `data` into the mapped range at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MappingError> {
        self.view.write_bytes(offset, data)
    }

    /// Copies bytes starting at `offset` into `out`, invalidating them first if the memory isn't coherent.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<(), MappingError> {
        self.view.read_bytes(offset, out)
    }

    /// Flushes everything written so far.
    pub fn flush(&mut self) -> Result<(), MappingError> {
        self.view.flush()
    }

    /// Makes device writes to `range` visible to the host.
    pub fn invalidate(&self, range: Range<u64>) -> Result<(), MappingError> {
        self.view.check_subrange(&range)?;
        self.view.invalidate(range)
    }

    /// Pointer to the start of the mapped range, for reading.
    pub fn as_ptr(&self) -> *const u8 {
        self.view.ptr.as_ptr()
    }

    /// Pointer to the start of the mapped range. The whole range is flushed when the guard is dropped.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.view.mark_dirty(0..self.view.size);
        self.view.ptr.as_ptr()
    }
}

impl<'a, D: Device> Drop for TransientMapping<'a, D> {
    fn drop(&mut self) {
        let mut state = self.view.release();
        if let Some(block) = state.blocks.get_mut(&self.view.block) {
            if let Some(transient) = block.mapping.transient.take() {
                if transient.owns_map {
                    self.view.allocator.device().unmap_memory(block.memory);
                }
            }
        }
        drop(state);

        self.view.pool.notify_unmapped();
    }
}

/// Either kind of mapping, as returned by [`MappingManager::map_for`]
pub enum HostMapping<'a, D: Device> {
    /// A view into a persistently mapped block.
    Persistent(PersistentMapping<'a, D>),

    /// A scoped mapping that unmaps when dropped.
    Transient(TransientMapping<'a, D>),
}

impl<'a, D: Device> HostMapping<'a, D> {
    /// Size of the mapping, in bytes.
    pub fn size(&self) -> u64 {
        match self {
            HostMapping::Persistent(mapping) => mapping.size(),
            HostMapping::Transient(mapping) => mapping.size(),
        }
    }

    /// Copies `data` into the mapping at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<(), MappingError> {
        match self {
            HostMapping::Persistent(mapping) => mapping.write_bytes(offset, data),
            HostMapping::Transient(mapping) => mapping.write_bytes(offset, data),
        }
    }

    /// Copies bytes starting at `offset` into `out`.
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) -> Result<(), MappingError> {
        match self {
            HostMapping::Persistent(mapping) => mapping.read_bytes(offset, out),
            HostMapping::Transient(mapping) => mapping.read_bytes(offset, out),
        }
    }

    /// Flushes everything written so far.
    pub fn flush(&mut self) -> Result<(), MappingError> {
        match self {
            HostMapping::Persistent(mapping) => mapping.flush(),
            HostMapping::Transient(mapping) => mapping.flush(),
        }
    }

    /// Pointer to the start of the mapping, for reading.
    pub fn as_ptr(&self) -> *const u8 {
        match self {
            HostMapping::Persistent(mapping) => mapping.as_ptr(),
            HostMapping::Transient(mapping) => mapping.as_ptr(),
        }
    }

    /// Pointer to the start of the mapping. The whole mapping counts as written.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            HostMapping::Persistent(mapping) => mapping.as_mut_ptr(),
            HostMapping::Transient(mapping) => mapping.as_mut_ptr(),
        }
    }
}
