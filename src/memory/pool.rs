use crate::core::allocators::{align, StrategyKind};
use crate::memory::block::{AllocationId, BlockId, MemoryBlock, Region, RegionMember};
use crate::memory::catalog::MemoryTypeCatalog;
use crate::rhi::{
    AllocationError, BudgetStatus, Device, MemoryAllocationInfo, MemoryPropertyFlags, MemoryRequirements,
};
use crate::settings::AllocatorSettings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// How many times a pooled block may be halved when its heap can't fit a full-sized one.
const MAX_BLOCK_SIZE_HALVINGS: u32 = 3;

/// A byte range inside a memory block, owned by one resource
///
/// Sub-allocations aren't `Clone`: whoever holds one is responsible for handing it back to the allocator. They only
/// know which block they live in, never the memory object itself.
#[derive(Debug, PartialEq, Eq)]
pub struct SubAllocation {
    id: AllocationId,
    memory_type: u32,
    block: BlockId,
    region_offset: u64,
    offset: u64,
    size: u64,
    dedicated: bool,
    strategy: StrategyKind,
    budget: BudgetStatus,
}

impl SubAllocation {
    /// Unique id of this sub-allocation.
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Index of the memory type the sub-allocation was made from.
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// The block the sub-allocation lives in.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Offset, in bytes, from the start of the block.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size, in bytes, as requested.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the sub-allocation has a memory object of its own.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// The strategy of the block the sub-allocation lives in.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Whether the memory type was selected within its heap's budget.
    pub fn budget_status(&self) -> BudgetStatus {
        self.budget
    }

    /// Whether this sub-allocation shares any bytes with `other`.
    pub fn overlaps(&self, other: &SubAllocation) -> bool {
        self.memory_type == other.memory_type
            && self.block == other.block
            && self.offset < other.offset + other.size
            && other.offset < self.offset + self.size
    }
}

pub(crate) struct PoolState<M> {
    /// Keyed by id, so iteration visits the oldest blocks first.
    pub blocks: BTreeMap<BlockId, MemoryBlock<M>>,
}

/// All blocks of one memory type
///
/// Every memory type has its own lock, so allocations from unrelated types never wait on each other.
pub(crate) struct MemoryPool<M> {
    pub memory_type: u32,
    pub heap: u32,
    pub flags: MemoryPropertyFlags,

    state: Mutex<PoolState<M>>,

    /// Signalled whenever a transient mapping scope on one of this pool's blocks ends.
    map_released: Condvar,
}

impl<M> MemoryPool<M> {
    fn new(memory_type: u32, heap: u32, flags: MemoryPropertyFlags) -> Self {
        MemoryPool {
            memory_type,
            heap,
            flags,
            state: Mutex::new(PoolState {
                blocks: BTreeMap::new(),
            }),
            map_released: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PoolState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_for_unmap<'a>(&self, guard: MutexGuard<'a, PoolState<M>>) -> MutexGuard<'a, PoolState<M>> {
        self.map_released.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify_unmapped(&self) {
        self.map_released.notify_all();
    }
}

/// Usage of one memory type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTypeStatistics {
    /// Index of the memory type.
    pub memory_type: u32,

    /// Properties of the memory type.
    pub property_flags: MemoryPropertyFlags,

    /// Number of blocks, dedicated ones included.
    pub block_count: usize,

    /// Number of dedicated blocks.
    pub dedicated_block_count: usize,

    /// Number of blocks with nothing in them.
    pub empty_block_count: usize,

    /// Number of live regions.
    pub allocation_count: usize,

    /// Bytes of memory objects of this type.
    pub committed_bytes: u64,

    /// Bytes handed out to regions.
    pub used_bytes: u64,

    /// Bytes the blocks' strategies can still hand out.
    pub free_bytes: u64,

    /// Largest range a single block can still hand out.
    pub largest_free_range: u64,

    /// `1 - largest free range / free bytes`. Zero when all free space is in one range.
    pub fragmentation: f64,
}

/// Usage of all memory types.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorStatistics {
    /// One entry per memory type, in type order.
    pub memory_types: Vec<MemoryTypeStatistics>,

    /// Number of memory objects alive right now.
    pub live_memory_objects: u32,
}

impl AllocatorStatistics {
    /// Renders the statistics as JSON, for debugging.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| format!("{{\"error\": \"{}\"}}", err))
    }
}

/// Owns the memory blocks of every memory type and suballocates from them
///
/// Small requests are carved out of shared blocks. Requests above the dedicated allocation threshold get a block of
/// their own, sized exactly to the request. Blocks are created on demand and destroyed once empty, except for one
/// cached empty block per memory type and strategy.
pub struct BlockAllocator<D: Device> {
    device: Arc<D>,
    catalog: Arc<MemoryTypeCatalog>,
    settings: AllocatorSettings,

    pools: Vec<MemoryPool<D::Memory>>,

    live_objects: AtomicU32,
    max_objects: u32,

    next_block_id: AtomicU64,
    next_allocation_id: AtomicU64,
}

impl<D: Device> BlockAllocator<D> {
    /// Creates a block allocator with one empty pool per memory type in `catalog`.
    pub fn new(device: Arc<D>, catalog: Arc<MemoryTypeCatalog>, settings: AllocatorSettings) -> Self {
        let pools = (0..catalog.type_count())
            .map(|index| {
                let memory_type = catalog.memory_type(index);
                MemoryPool::new(index, memory_type.heap_index, memory_type.property_flags)
            })
            .collect();

        let max_objects = settings
            .max_memory_objects
            .unwrap_or_else(|| catalog.max_memory_allocation_count());

        BlockAllocator {
            device,
            catalog,
            settings,
            pools,
            live_objects: AtomicU32::new(0),
            max_objects,
            next_block_id: AtomicU64::new(0),
            next_allocation_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    pub(crate) fn catalog(&self) -> &MemoryTypeCatalog {
        &self.catalog
    }

    pub(crate) fn pool(&self, memory_type: u32) -> &MemoryPool<D::Memory> {
        &self.pools[memory_type as usize]
    }

    /// Number of memory objects alive right now.
    pub fn live_memory_objects(&self) -> u32 {
        self.live_objects.load(Ordering::Acquire)
    }

    /// Size of a new pooled block of `memory_type`.
    pub fn block_size_for_type(&self, memory_type: u32) -> u64 {
        let heap = self.catalog.memory_type(memory_type).heap_index;
        self.settings.block_size_for_heap(self.catalog.heap(heap).size)
    }

    /// Suballocates `size` bytes aligned to `alignment` from a block of `memory_type`.
    ///
    /// # Parameters
    ///
    /// * `memory_type` - Index of the memory type to allocate from.
    /// * `size` - How many bytes to allocate.
    /// * `alignment` - Alignment of the allocation's offset, in bytes.
    /// * `strategy` - Which kind of block to allocate from.
    /// * `budget` - Budget status of the selection that picked `memory_type`, passed on to the sub-allocation.
    pub fn allocate(
        &self,
        memory_type: u32,
        size: u64,
        alignment: u64,
        strategy: StrategyKind,
        budget: BudgetStatus,
    ) -> Result<SubAllocation, AllocationError> {
        if size == 0 {
            return Err(AllocationError::ZeroSized);
        }

        let pool = self.pool(memory_type);
        let block_size = self.block_size_for_type(memory_type);
        let mut state = pool.lock();

        if size > self.settings.dedicated_allocation_threshold || size > block_size {
            let block = self.create_block(pool, size, true, StrategyKind::FreeList)?;
            return self.insert_and_carve(&mut state, block, size, alignment, budget);
        }

        let existing = state
            .blocks
            .values_mut()
            .filter(|block| !block.dedicated && block.strategy.kind() == strategy)
            .find_map(|block| {
                let info = block.strategy.allocate(size, alignment)?;
                Some(self.add_region(block, info, size, budget))
            });

        if let Some(allocation) = existing {
            return Ok(allocation);
        }

        let block = self.create_pooled_block(pool, block_size, size, strategy)?;
        self.insert_and_carve(&mut state, block, size, alignment, budget)
    }

    /// Releases a sub-allocation. The range is reusable once no other sub-allocation overlapping it is alive.
    pub fn free(&self, allocation: SubAllocation) {
        let pool = self.pool(allocation.memory_type);
        let mut state = pool.lock();

        let block = match state.blocks.get_mut(&allocation.block) {
            Some(block) => block,
            None => {
                log::error!("Freed {} from {}, which doesn't exist", allocation.id, allocation.block);
                return;
            }
        };

        let region_empty = match block.regions.get_mut(&allocation.region_offset) {
            Some(region) => {
                region.members.retain(|member| member.id != allocation.id);
                region.members.is_empty()
            }
            None => {
                log::error!(
                    "Freed {} from {} at offset {}, but nothing lives there",
                    allocation.id,
                    allocation.block,
                    allocation.region_offset
                );
                return;
            }
        };

        if region_empty {
            if let Some(region) = block.regions.remove(&allocation.region_offset) {
                block.strategy.free(&region.info);
                log::trace!("Returned {} bytes at offset {} to {}", region.info.size, region.info.offset, block.id);
            }
        }

        if !block.is_empty() {
            return;
        }

        let keep = !block.dedicated && self.settings.retain_empty_blocks && {
            let kind = block.strategy.kind();
            let id = block.id;
            !state
                .blocks
                .values()
                .any(|other| other.id != id && !other.dedicated && other.strategy.kind() == kind && other.is_empty())
        };

        if !keep {
            if let Some(block) = state.blocks.remove(&allocation.block) {
                self.destroy_block(pool, block);
            }
        }
    }

    /// Creates a sub-allocation inside the range of `base`, without reserving new space.
    ///
    /// The new sub-allocation can only be bound once it's been declared as an alias of every sub-allocation it
    /// overlaps.
    pub fn allocate_overlapping(
        &self,
        base: &SubAllocation,
        requirements: &MemoryRequirements,
    ) -> Result<SubAllocation, AllocationError> {
        if requirements.size == 0 {
            return Err(AllocationError::ZeroSized);
        }
        if requirements.memory_type_bits & (1 << base.memory_type) == 0 {
            return Err(AllocationError::NoSuitableType);
        }

        let pool = self.pool(base.memory_type);
        let mut state = pool.lock();
        let block = state
            .blocks
            .get_mut(&base.block)
            .ok_or(AllocationError::AliasDoesNotFit)?;
        let region = block
            .regions
            .get_mut(&base.region_offset)
            .ok_or(AllocationError::AliasDoesNotFit)?;

        let offset = align(base.offset, requirements.alignment);
        if offset + requirements.size > region.info.end() {
            return Err(AllocationError::AliasDoesNotFit);
        }

        let id = self.next_allocation_id();
        region.members.push(RegionMember {
            id,
            offset,
            size: requirements.size,
            bound: false,
        });

        log::trace!("Placed {} over {} in {}", id, base.id, base.block);

        Ok(SubAllocation {
            id,
            memory_type: base.memory_type,
            block: base.block,
            region_offset: base.region_offset,
            offset,
            size: requirements.size,
            dedicated: base.dedicated,
            strategy: base.strategy,
            budget: base.budget,
        })
    }

    /// Binds a resource to a sub-allocation.
    ///
    /// Each sub-allocation may only be bound once. If it overlaps other live sub-allocations, `is_declared_alias` must
    /// say that each of them is in the same alias group.
    pub fn bind<F>(&self, allocation: &SubAllocation, resource: &D::Resource, is_declared_alias: F) -> Result<(), AllocationError>
    where
        F: Fn(AllocationId, AllocationId) -> bool,
    {
        let unknown = || {
            log::error!(
                "Tried to bind {}, but {} has no such allocation at offset {}",
                allocation.id,
                allocation.block,
                allocation.region_offset
            );
            AllocationError::UnknownAllocation
        };

        let pool = self.pool(allocation.memory_type);
        let mut state = pool.lock();
        let block = state.blocks.get_mut(&allocation.block).ok_or_else(unknown)?;
        let memory = block.memory;
        let region = block
            .regions
            .get_mut(&allocation.region_offset)
            .ok_or_else(unknown)?;

        let member = *region
            .members
            .iter()
            .find(|member| member.id == allocation.id)
            .ok_or_else(unknown)?;
        if member.bound {
            return Err(AllocationError::AlreadyBound);
        }

        let undeclared = region
            .members
            .iter()
            .filter(|other| other.id != member.id && other.overlaps(&member))
            .any(|other| !is_declared_alias(member.id, other.id));
        if undeclared {
            return Err(AllocationError::UndeclaredAlias);
        }

        self.device.bind_memory(resource, memory, allocation.offset)?;

        for other in region.members.iter_mut() {
            if other.id == member.id {
                other.bound = true;
            }
        }

        Ok(())
    }

    /// Destroys every empty block.
    pub fn trim(&self) {
        for pool in &self.pools {
            let mut state = pool.lock();
            let empty: Vec<BlockId> = state
                .blocks
                .values()
                .filter(|block| block.is_empty())
                .map(|block| block.id)
                .collect();

            for id in empty {
                if let Some(block) = state.blocks.remove(&id) {
                    self.destroy_block(pool, block);
                }
            }
        }
    }

    /// Current usage of every memory type.
    pub fn statistics(&self) -> AllocatorStatistics {
        let memory_types = self
            .pools
            .iter()
            .map(|pool| {
                let state = pool.lock();
                let mut stats = MemoryTypeStatistics {
                    memory_type: pool.memory_type,
                    property_flags: pool.flags,
                    block_count: state.blocks.len(),
                    dedicated_block_count: 0,
                    empty_block_count: 0,
                    allocation_count: 0,
                    committed_bytes: 0,
                    used_bytes: 0,
                    free_bytes: 0,
                    largest_free_range: 0,
                    fragmentation: 0.0,
                };

                for block in state.blocks.values() {
                    if block.dedicated {
                        stats.dedicated_block_count += 1;
                    }
                    if block.is_empty() {
                        stats.empty_block_count += 1;
                    }
                    stats.allocation_count += block.regions.len();
                    stats.committed_bytes += block.size;
                    stats.used_bytes += block.used_bytes();
                    stats.free_bytes += block.strategy.free_bytes();
                    stats.largest_free_range = stats.largest_free_range.max(block.strategy.largest_free_range());
                }

                if stats.free_bytes > 0 {
                    stats.fragmentation = 1.0 - stats.largest_free_range as f64 / stats.free_bytes as f64;
                }

                stats
            })
            .collect();

        AllocatorStatistics {
            memory_types,
            live_memory_objects: self.live_memory_objects(),
        }
    }

    fn next_allocation_id(&self) -> AllocationId {
        AllocationId(self.next_allocation_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Puts a fresh block into the pool and carves the request out of it
    fn insert_and_carve(
        &self,
        state: &mut PoolState<D::Memory>,
        block: MemoryBlock<D::Memory>,
        size: u64,
        alignment: u64,
        budget: BudgetStatus,
    ) -> Result<SubAllocation, AllocationError> {
        let id = block.id;
        let block = state.blocks.entry(id).or_insert(block);

        // A fresh block is at least as large as the request and its first range starts at offset zero
        let info = block
            .strategy
            .allocate(size, alignment)
            .ok_or(AllocationError::OutOfDeviceMemory)?;

        Ok(self.add_region(block, info, size, budget))
    }

    fn add_region(
        &self,
        block: &mut MemoryBlock<D::Memory>,
        info: MemoryAllocationInfo,
        size: u64,
        budget: BudgetStatus,
    ) -> SubAllocation {
        let id = self.next_allocation_id();
        block.regions.insert(
            info.offset,
            Region {
                info,
                members: vec![RegionMember {
                    id,
                    offset: info.offset,
                    size,
                    bound: false,
                }],
            },
        );

        log::trace!("{}", block.strategy.describe_allocation(&info));

        SubAllocation {
            id,
            memory_type: block.memory_type,
            block: block.id,
            region_offset: info.offset,
            offset: info.offset,
            size,
            dedicated: block.dedicated,
            strategy: block.strategy.kind(),
            budget,
        }
    }

    /// Creates a pooled block, shrinking it if the heap can't fit a full-sized one
    fn create_pooled_block(
        &self,
        pool: &MemoryPool<D::Memory>,
        block_size: u64,
        min_size: u64,
        strategy: StrategyKind,
    ) -> Result<MemoryBlock<D::Memory>, AllocationError> {
        let mut size = block_size;
        let mut halvings = 0;

        loop {
            match self.create_block(pool, size, false, strategy) {
                Ok(block) => return Ok(block),
                Err(err @ AllocationError::HeapExhausted { .. }) | Err(err @ AllocationError::OutOfDeviceMemory) => {
                    if halvings == MAX_BLOCK_SIZE_HALVINGS || size / 2 < min_size {
                        return Err(err);
                    }

                    halvings += 1;
                    size /= 2;
                    log::debug!(
                        "Could not create a {} byte block of memory type {}, trying {} bytes",
                        size * 2,
                        pool.memory_type,
                        size
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Creates a memory object and the block that owns it
    ///
    /// Reserves a memory object slot and commits the heap bytes before asking the device, and gives both back if the
    /// device fails.
    fn create_block(
        &self,
        pool: &MemoryPool<D::Memory>,
        size: u64,
        dedicated: bool,
        strategy: StrategyKind,
    ) -> Result<MemoryBlock<D::Memory>, AllocationError> {
        let max_objects = self.max_objects;
        self.live_objects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live < max_objects {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .map_err(|_| AllocationError::AllocationLimitExceeded { limit: max_objects })?;

        if let Err(err) = self.catalog.try_commit(pool.heap, size) {
            self.live_objects.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }

        let memory = match self.device.create_memory_object(pool.memory_type, size) {
            Ok(memory) => memory,
            Err(err) => {
                self.catalog.decommit(pool.heap, size);
                self.live_objects.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };

        let id = BlockId(self.next_block_id.fetch_add(1, Ordering::Relaxed));
        log::debug!(
            "Created {}{} of memory type {} with {} bytes",
            if dedicated { "dedicated " } else { "" },
            id,
            pool.memory_type,
            size
        );

        Ok(MemoryBlock::new(
            id,
            memory,
            pool.memory_type,
            size,
            dedicated,
            strategy.create(size),
        ))
    }

    fn destroy_block(&self, pool: &MemoryPool<D::Memory>, block: MemoryBlock<D::Memory>) {
        if block.mapping.is_mapped() {
            self.device.unmap_memory(block.memory);
        }

        self.device.destroy_memory_object(block.memory);
        self.catalog.decommit(pool.heap, block.size);
        self.live_objects.fetch_sub(1, Ordering::AcqRel);

        log::debug!("Destroyed {} of memory type {}", block.id, pool.memory_type);
    }
}

impl<D: Device> Drop for BlockAllocator<D> {
    fn drop(&mut self) {
        for pool in &self.pools {
            let mut state = pool.lock();
            let blocks = std::mem::take(&mut state.blocks);

            for (_, block) in blocks {
                if !block.is_empty() {
                    log::warn!(
                        "{} of memory type {} still has {} live allocations at teardown",
                        block.id,
                        pool.memory_type,
                        block.regions.len()
                    );
                }

                self.destroy_block(pool, block);
            }
        }
    }
}
