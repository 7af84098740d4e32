use crate::core::allocators::{align, AllocationStrategy, StrategyKind};
use crate::rhi::MemoryAllocationInfo;

/// Linear allocator
///
/// Hands out memory by bumping a cursor. Freeing an allocation doesn't make its space reusable; the cursor only goes
/// back to the start once every allocation has been freed. That makes it a good fit for resources which all die at
/// the end of a frame, and a bad fit for anything else
pub struct LinearAllocationStrategy {
    memory_size: u64,
    cursor: u64,

    live_allocations: usize,
    live_bytes: u64,
}

impl LinearAllocationStrategy {
    /// Creates a new linear allocator which allocates out of `total_size` bytes
    pub fn new(total_size: u64) -> Self {
        LinearAllocationStrategy {
            memory_size: total_size,
            cursor: 0,
            live_allocations: 0,
            live_bytes: 0,
        }
    }

    /// Where the next allocation would start, before alignment
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl AllocationStrategy for LinearAllocationStrategy {
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<MemoryAllocationInfo> {
        if size == 0 {
            return None;
        }

        let offset = align(self.cursor, alignment);
        let end = offset.checked_add(size)?;
        if end > self.memory_size {
            return None;
        }

        self.cursor = end;
        self.live_allocations += 1;
        self.live_bytes += size;

        Some(MemoryAllocationInfo { offset, size })
    }

    fn free(&mut self, info: &MemoryAllocationInfo) {
        if self.live_allocations == 0 || info.end() > self.cursor {
            log::warn!(
                "Tried to free {} bytes at offset {} from a linear allocator that never handed them out",
                info.size,
                info.offset
            );
            return;
        }

        self.live_allocations -= 1;
        self.live_bytes -= info.size;

        if self.live_allocations == 0 {
            self.cursor = 0;
        }
    }

    fn total_size(&self) -> u64 {
        self.memory_size
    }

    fn free_bytes(&self) -> u64 {
        self.memory_size - self.cursor
    }

    fn largest_free_range(&self) -> u64 {
        self.memory_size - self.cursor
    }

    fn live_allocations(&self) -> usize {
        self.live_allocations
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Linear
    }

    fn describe_allocation(&self, info: &MemoryAllocationInfo) -> String {
        format!(
            "Linear allocation at offset {} with size {} (cursor at {}, {} live)",
            info.offset, info.size, self.cursor, self.live_allocations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_only_resets_when_everything_is_freed() {
        let mut allocator = LinearAllocationStrategy::new(1024);
        let a = allocator.allocate(100, 1).unwrap();
        let b = allocator.allocate(100, 64).unwrap();
        assert_eq!(b.offset, 128);

        allocator.free(&a);
        assert_eq!(allocator.cursor(), 228);
        assert_eq!(allocator.free_bytes(), 796);

        allocator.free(&b);
        assert_eq!(allocator.cursor(), 0);
        assert_eq!(allocator.free_bytes(), 1024);
    }

    #[test]
    fn refuses_allocations_past_the_end() {
        let mut allocator = LinearAllocationStrategy::new(256);
        assert!(allocator.allocate(200, 1).is_some());
        assert!(allocator.allocate(100, 1).is_none());
        assert_eq!(allocator.live_allocations(), 1);
    }
}
