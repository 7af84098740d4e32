//! Strategies for carving ranges out of a fixed amount of memory.
//!
//! A strategy only does bookkeeping. It never touches the memory it manages, so the same strategies work for device
//! memory, host memory, or anything else with offsets.

mod block_allocator;
mod linear_allocator;

use crate::rhi::MemoryAllocationInfo;
use serde::{Deserialize, Serialize};

pub use block_allocator::BlockAllocationStrategy;
pub use linear_allocator::LinearAllocationStrategy;

/// Bookkeeping for the ranges handed out from a fixed amount of memory.
///
/// Strategies must be externally synchronized.
pub trait AllocationStrategy: Send {
    /// Reserves `size` bytes aligned to `alignment`, or returns `None` if there's no space for them.
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<MemoryAllocationInfo>;

    /// Returns a range previously handed out by [`AllocationStrategy::allocate`].
    fn free(&mut self, info: &MemoryAllocationInfo);

    /// Total number of bytes this strategy manages.
    fn total_size(&self) -> u64;

    /// Number of bytes that can still be handed out.
    fn free_bytes(&self) -> u64;

    /// Size of the largest range that could be handed out with no alignment padding.
    fn largest_free_range(&self) -> u64;

    /// Number of allocations that haven't been freed yet.
    fn live_allocations(&self) -> usize;

    /// Which kind of strategy this is.
    fn kind(&self) -> StrategyKind;

    /// Human-readable description of an allocation, for logs.
    fn describe_allocation(&self, info: &MemoryAllocationInfo) -> String;
}

/// The allocation strategies a memory block can use.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyKind {
    /// Best-fit free list. Supports freeing in any order.
    FreeList,

    /// Monotonic cursor. Space is only reclaimed once every allocation is freed. Meant for per-frame resources.
    Linear,
}

impl StrategyKind {
    /// Creates a strategy of this kind managing `total_size` bytes.
    pub fn create(self, total_size: u64) -> Box<dyn AllocationStrategy> {
        match self {
            StrategyKind::FreeList => Box::new(BlockAllocationStrategy::new(total_size, 1)),
            StrategyKind::Linear => Box::new(LinearAllocationStrategy::new(total_size)),
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two. An alignment of zero or one
/// leaves `value` unchanged.
pub fn align(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }

    (value + (alignment - 1)) & !(alignment - 1)
}

/// Rounds `value` down to the previous multiple of `alignment`, which must be a power of two.
pub fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }

    value & !(alignment - 1)
}
