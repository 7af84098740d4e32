use super::rhi_enums::*;
use serde::Serialize;

/// The minimum number of live memory objects every conforming device supports.
pub const MIN_MEMORY_ALLOCATION_COUNT: u32 = 2048;

/// A physical pool of memory with a fixed capacity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct MemoryHeap {
    /// Total capacity of the heap, in bytes.
    pub size: u64,

    /// Attributes of the heap.
    pub flags: MemoryHeapFlags,
}

/// A combination of memory properties backed by exactly one heap.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct MemoryType {
    /// Properties of memory allocated from this type.
    pub property_flags: MemoryPropertyFlags,

    /// Index of the heap this type allocates from.
    pub heap_index: u32,
}

/// Information about the memory of a physical device.
///
/// This information can come from multiple API calls, but it's merged together here.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceMemoryProperties {
    /// All heaps of the device, in API order.
    pub memory_heaps: Vec<MemoryHeap>,

    /// All memory types of the device, in API order. A type's index is its position in this list.
    pub memory_types: Vec<MemoryType>,

    /// How many memory objects may be alive at the same time.
    pub max_memory_allocation_count: u32,

    /// Size and alignment, in bytes, of flush and invalidate ranges on non-coherent memory.
    pub non_coherent_atom_size: u64,
}

/// What a resource needs from the memory it's bound to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryRequirements {
    /// Size of the resource, in bytes.
    pub size: u64,

    /// Required alignment of the resource's offset, in bytes.
    pub alignment: u64,

    /// Bit `i` is set if memory type `i` can hold the resource.
    pub memory_type_bits: u32,
}

/// A range carved out of a memory block by an allocation strategy.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct MemoryAllocationInfo {
    /// Offset, in bytes, from the start of the block.
    pub offset: u64,

    /// Number of bytes reserved for the allocation. May be larger than what was asked for.
    pub size: u64,
}

impl MemoryAllocationInfo {
    /// One past the last byte of the allocation.
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A range of a memory object to flush or invalidate.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MappedMemoryRange<M> {
    /// The memory object.
    pub memory: M,

    /// Offset, in bytes, from the start of the memory object.
    pub offset: u64,

    /// Size of the range, in bytes.
    pub size: u64,
}
