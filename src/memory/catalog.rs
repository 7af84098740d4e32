use crate::rhi::{
    AllocationError, CatalogError, DeviceMemoryProperties, MemoryHeap, MemoryPropertyFlags, MemoryType,
    MIN_MEMORY_ALLOCATION_COUNT,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Vulkan-class APIs describe memory types with a 32-bit mask, so there can't be more than this many.
const MAX_MEMORY_TYPES: usize = 32;

/// How much of a heap is in use.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HeapBudget {
    /// Total capacity of the heap, in bytes.
    pub capacity: u64,

    /// Bytes committed to memory objects on this heap.
    pub committed: u64,
}

impl HeapBudget {
    /// Bytes that can still be committed.
    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.committed)
    }
}

#[derive(Debug)]
struct HeapState {
    heap: MemoryHeap,
    committed: AtomicU64,
}

/// Snapshot of the heaps and memory types of one physical device
///
/// Everything but the committed byte counters is read-only after loading. The counters are shared by every allocator
/// that allocates from the same physical device, and are only changed through [`MemoryTypeCatalog::try_commit`] and
/// [`MemoryTypeCatalog::decommit`], which never let a heap go over its capacity.
#[derive(Debug)]
pub struct MemoryTypeCatalog {
    heaps: Vec<HeapState>,
    types: Vec<MemoryType>,

    max_memory_allocation_count: u32,
    non_coherent_atom_size: u64,
}

impl MemoryTypeCatalog {
    /// Builds a catalog from a device's memory properties
    ///
    /// Fails if the device reports no heaps or no types, if there's no device-local or no host-visible type, if a
    /// type points at a heap that doesn't exist, or if a host-visible type is also lazily allocated or protected.
    pub fn load(properties: &DeviceMemoryProperties) -> Result<Self, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidDevice { reason };

        if properties.memory_heaps.is_empty() {
            return Err(invalid("device reports no memory heaps".into()));
        }
        if properties.memory_types.is_empty() {
            return Err(invalid("device reports no memory types".into()));
        }
        if properties.memory_types.len() > MAX_MEMORY_TYPES {
            return Err(invalid(format!(
                "device reports {} memory types, but at most {} are supported",
                properties.memory_types.len(),
                MAX_MEMORY_TYPES
            )));
        }

        for (index, memory_type) in properties.memory_types.iter().enumerate() {
            if memory_type.heap_index as usize >= properties.memory_heaps.len() {
                return Err(invalid(format!(
                    "memory type {} uses heap {}, which doesn't exist",
                    index, memory_type.heap_index
                )));
            }

            let flags = memory_type.property_flags;
            if flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
                && flags.intersects(MemoryPropertyFlags::LAZILY_ALLOCATED | MemoryPropertyFlags::PROTECTED)
            {
                return Err(invalid(format!(
                    "memory type {} is host-visible but also {:?}",
                    index,
                    flags & (MemoryPropertyFlags::LAZILY_ALLOCATED | MemoryPropertyFlags::PROTECTED)
                )));
            }
        }

        let has_type_with = |flag: MemoryPropertyFlags| {
            properties
                .memory_types
                .iter()
                .any(|memory_type| memory_type.property_flags.contains(flag))
        };
        if !has_type_with(MemoryPropertyFlags::DEVICE_LOCAL) {
            return Err(invalid("device has no device-local memory type".into()));
        }
        if !has_type_with(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(invalid("device has no host-visible memory type".into()));
        }

        let max_memory_allocation_count = if properties.max_memory_allocation_count < MIN_MEMORY_ALLOCATION_COUNT {
            log::warn!(
                "Device claims to support only {} memory objects, assuming the guaranteed minimum of {}",
                properties.max_memory_allocation_count,
                MIN_MEMORY_ALLOCATION_COUNT
            );
            MIN_MEMORY_ALLOCATION_COUNT
        } else {
            properties.max_memory_allocation_count
        };

        log::info!(
            "Loaded {} memory heaps and {} memory types",
            properties.memory_heaps.len(),
            properties.memory_types.len()
        );
        for (index, heap) in properties.memory_heaps.iter().enumerate() {
            log::info!("Heap {}: {} bytes, {:?}", index, heap.size, heap.flags);
        }
        for (index, memory_type) in properties.memory_types.iter().enumerate() {
            log::info!(
                "Memory type {}: heap {}, {:?}",
                index,
                memory_type.heap_index,
                memory_type.property_flags
            );
        }

        Ok(MemoryTypeCatalog {
            heaps: properties
                .memory_heaps
                .iter()
                .map(|heap| HeapState {
                    heap: *heap,
                    committed: AtomicU64::new(0),
                })
                .collect(),
            types: properties.memory_types.clone(),
            max_memory_allocation_count,
            non_coherent_atom_size: properties.non_coherent_atom_size.max(1),
        })
    }

    /// Number of memory types.
    pub fn type_count(&self) -> u32 {
        self.types.len() as u32
    }

    /// Number of heaps.
    pub fn heap_count(&self) -> u32 {
        self.heaps.len() as u32
    }

    /// The memory type at `index`.
    pub fn memory_type(&self, index: u32) -> &MemoryType {
        &self.types[index as usize]
    }

    /// The heap at `index`.
    pub fn heap(&self, index: u32) -> &MemoryHeap {
        &self.heaps[index as usize].heap
    }

    /// All memory types whose bit is set in `memory_type_bits`, along with their indices.
    pub fn types_supporting(&self, memory_type_bits: u32) -> impl Iterator<Item = (u32, &MemoryType)> + '_ {
        self.types
            .iter()
            .enumerate()
            .map(|(index, memory_type)| (index as u32, memory_type))
            .filter(move |&(index, _)| memory_type_bits & (1u32 << index) != 0)
    }

    /// Capacity and committed bytes of a heap.
    pub fn heap_budget(&self, heap: u32) -> HeapBudget {
        let state = &self.heaps[heap as usize];
        HeapBudget {
            capacity: state.heap.size,
            committed: state.committed.load(Ordering::Acquire),
        }
    }

    /// Capacity and committed bytes of the heap backing a memory type.
    pub fn type_budget(&self, memory_type: u32) -> HeapBudget {
        self.heap_budget(self.memory_type(memory_type).heap_index)
    }

    /// Records `bytes` more as committed on `heap`, unless that would go over the heap's capacity.
    pub fn try_commit(&self, heap: u32, bytes: u64) -> Result<(), AllocationError> {
        let state = &self.heaps[heap as usize];
        let capacity = state.heap.size;

        state
            .committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                committed.checked_add(bytes).filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|_| AllocationError::HeapExhausted { heap, requested: bytes })
    }

    /// Records that `bytes` are no longer committed on `heap`.
    pub fn decommit(&self, heap: u32, bytes: u64) {
        let previous = self.heaps[heap as usize].committed.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "heap {} decommitted more than it committed", heap);
    }

    /// How many memory objects may be alive at the same time.
    pub fn max_memory_allocation_count(&self) -> u32 {
        self.max_memory_allocation_count
    }

    /// Alignment, in bytes, of flush and invalidate ranges.
    pub fn non_coherent_atom_size(&self) -> u64 {
        self.non_coherent_atom_size
    }
}
