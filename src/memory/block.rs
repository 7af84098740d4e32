use crate::core::allocators::AllocationStrategy;
use crate::memory::mapping::HostPtr;
use crate::rhi::MemoryAllocationInfo;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identifies a memory block. Ids are never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct BlockId(pub(crate) u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Identifies a sub-allocation. Ids are never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct AllocationId(pub(crate) u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation#{}", self.0)
    }
}

/// A sub-allocation that references a region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionMember {
    pub id: AllocationId,
    pub offset: u64,
    pub size: u64,
    pub bound: bool,
}

impl RegionMember {
    pub fn overlaps(&self, other: &RegionMember) -> bool {
        self.offset < other.offset + other.size && other.offset < self.offset + self.size
    }
}

/// A range handed out by a block's strategy, and every sub-allocation that lives in it.
///
/// Normally a region has exactly one member. Overlapping sub-allocations add more. The range goes back to the strategy
/// when the last member is released.
pub(crate) struct Region {
    pub info: MemoryAllocationInfo,
    pub members: Vec<RegionMember>,
}

/// Map state of a block. At most one range of the block is mapped at a time.
#[derive(Default)]
pub(crate) struct BlockMapping {
    /// Base of the whole block, mapped until the block is destroyed.
    pub persistent: Option<HostPtr>,

    /// Set while a transient scope is open on the block.
    pub transient: Option<TransientState>,

    /// Sub-allocations with a live view. Each sub-allocation gets at most one.
    pub views: HashSet<AllocationId>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TransientState {
    /// Whether the scope made its own map call, as opposed to borrowing the persistent mapping.
    pub owns_map: bool,
}

impl BlockMapping {
    pub fn is_mapped(&self) -> bool {
        self.persistent.is_some() || self.transient.map_or(false, |state| state.owns_map)
    }
}

/// One memory object, and the bookkeeping for the ranges carved out of it
///
/// The block is the only owner of the memory object handle. Sub-allocations refer to blocks by id.
pub(crate) struct MemoryBlock<M> {
    pub id: BlockId,
    pub memory: M,
    pub memory_type: u32,
    pub size: u64,
    pub dedicated: bool,

    pub strategy: Box<dyn AllocationStrategy>,

    /// Keyed by the region's offset.
    pub regions: HashMap<u64, Region>,

    pub mapping: BlockMapping,
}

impl<M> MemoryBlock<M> {
    pub fn new(id: BlockId, memory: M, memory_type: u32, size: u64, dedicated: bool, strategy: Box<dyn AllocationStrategy>) -> Self {
        MemoryBlock {
            id,
            memory,
            memory_type,
            size,
            dedicated,
            strategy,
            regions: HashMap::new(),
            mapping: BlockMapping::default(),
        }
    }

    /// Whether nothing lives in the block anymore.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Bytes handed out to regions.
    pub fn used_bytes(&self) -> u64 {
        self.regions.values().map(|region| region.info.size).sum()
    }
}
