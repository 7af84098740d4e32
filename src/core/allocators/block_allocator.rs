use crate::core::allocators::{align, AllocationStrategy, StrategyKind};
use crate::rhi::MemoryAllocationInfo;

/// Simple block allocator
///
/// A block allocator keeps an internal list of regions of memory, also called "blocks", which together cover the
/// whole managed space. When you allocate with a block allocator, the allocator finds the smallest free block that your
/// allocation will fit into (the one with the lowest offset if several are equally small), splits it into the part
/// where your allocation will reside and the remaining free space, and returns the allocation
///
/// Block allocators support freeing allocations in any order. Freeing merges the freed block with its free
/// neighbors, so the free space of an empty allocator is always a single block
///
/// This block allocator doesn't compact allocations, because that requires moving everything around which entails that
/// I support that in the first place
///
/// This block allocator must be externally synchronized
pub struct BlockAllocationStrategy {
    /// Sorted by offset. Adjacent blocks are never both free
    blocks: Vec<Block>,

    memory_size: u64,
    alignment: u64,

    allocated: u64,

    next_block_id: u64,
}

impl BlockAllocationStrategy {
    /// Creates a new block allocator which allocates out of `total_size` bytes, ensuring that every allocation size is
    /// a multiple of `alignment`
    ///
    /// # Parameters
    ///
    /// * `total_size` - The total number of bytes that this block allocator can allocate from
    /// * `alignment` - Granularity, in bytes, of all allocations from this block allocator. If this is zero or 1,
    /// allocations are only as aligned as each request asks for
    pub fn new(total_size: u64, alignment: u64) -> Self {
        let mut allocator = BlockAllocationStrategy {
            blocks: Vec::new(),
            memory_size: total_size,
            alignment,
            allocated: 0,
            next_block_id: 0,
        };

        let head = allocator.make_new_block(0, total_size, true);
        allocator.blocks.push(head);

        allocator
    }

    /// All free ranges, in offset order
    pub fn free_ranges(&self) -> Vec<MemoryAllocationInfo> {
        self.blocks
            .iter()
            .filter(|block| block.free)
            .map(|block| MemoryAllocationInfo {
                offset: block.offset,
                size: block.size,
            })
            .collect()
    }

    /// Create a block with the provided offset and size
    ///
    /// # Parameters
    ///
    /// * `offset` - Offset from the start of the managed space to where this Block resides
    /// * `size` - How many bytes this Block speaks for
    /// * `free` - Whether the Block is free space
    fn make_new_block(&mut self, offset: u64, size: u64, free: bool) -> Block {
        let block = Block {
            id: self.next_block_id,
            size,
            offset,
            free,
        };

        self.next_block_id += 1;

        block
    }

    /// Finds the free block that wastes the least space for an allocation, along with the aligned offset the
    /// allocation would have inside it
    fn find_best_fit(&self, size: u64, alignment: u64) -> Option<(usize, u64)> {
        let mut best_fit: Option<(usize, u64)> = None;

        for (index, block) in self.blocks.iter().enumerate() {
            if !block.free || block.size < size {
                continue;
            }

            let aligned_offset = align(block.offset, alignment);
            let padding = aligned_offset - block.offset;
            if padding + size > block.size {
                continue;
            }

            match best_fit {
                Some((best_index, _)) if self.blocks[best_index].size <= block.size => {}
                _ => best_fit = Some((index, aligned_offset)),
            }
        }

        best_fit
    }

    /// Merges the free block at `index` with its next neighbor, if that neighbor is free too
    fn merge_with_next(&mut self, index: usize) {
        if index + 1 >= self.blocks.len() {
            return;
        }

        if self.blocks[index].free && self.blocks[index + 1].free {
            let next = self.blocks.remove(index + 1);
            self.blocks[index].size += next.size;
        }
    }
}

impl AllocationStrategy for BlockAllocationStrategy {
    fn allocate(&mut self, size: u64, alignment: u64) -> Option<MemoryAllocationInfo> {
        if size == 0 {
            return None;
        }

        let size = align(size, self.alignment);

        let free_size = self.memory_size - self.allocated;
        if free_size < size {
            return None;
        }

        let (index, aligned_offset) = self.find_best_fit(size, alignment)?;
        let chosen = self.blocks[index];
        let padding = aligned_offset - chosen.offset;
        let remainder = chosen.size - padding - size;

        let mut pieces = Vec::with_capacity(3);
        if padding > 0 {
            pieces.push(self.make_new_block(chosen.offset, padding, true));
        }
        pieces.push(self.make_new_block(aligned_offset, size, false));
        if remainder > 0 {
            pieces.push(self.make_new_block(aligned_offset + size, remainder, true));
        }
        self.blocks.splice(index..=index, pieces);

        self.allocated += size;

        Some(MemoryAllocationInfo {
            offset: aligned_offset,
            size,
        })
    }

    fn free(&mut self, info: &MemoryAllocationInfo) {
        let index = match self.blocks.binary_search_by_key(&info.offset, |block| block.offset) {
            Ok(index) if !self.blocks[index].free && self.blocks[index].size == info.size => index,
            _ => {
                log::warn!(
                    "Tried to free {} bytes at offset {}, but that isn't a live allocation",
                    info.size,
                    info.offset
                );
                return;
            }
        };

        self.blocks[index].free = true;
        self.allocated -= info.size;

        self.merge_with_next(index);
        if index > 0 {
            self.merge_with_next(index - 1);
        }
    }

    fn total_size(&self) -> u64 {
        self.memory_size
    }

    fn free_bytes(&self) -> u64 {
        self.memory_size - self.allocated
    }

    fn largest_free_range(&self) -> u64 {
        self.blocks
            .iter()
            .filter(|block| block.free)
            .map(|block| block.size)
            .max()
            .unwrap_or(0)
    }

    fn live_allocations(&self) -> usize {
        self.blocks.iter().filter(|block| !block.free).count()
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::FreeList
    }

    fn describe_allocation(&self, info: &MemoryAllocationInfo) -> String {
        match self.blocks.binary_search_by_key(&info.offset, |block| block.offset) {
            Ok(index) => {
                let block = &self.blocks[index];
                format!(
                    "Block {} at offset {} with size {} ({})",
                    block.id,
                    block.offset,
                    block.size,
                    if block.free { "free" } else { "allocated" }
                )
            }
            Err(_) => format!("Unknown allocation at offset {} with size {}", info.offset, info.size),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Block {
    pub id: u64,
    pub size: u64,
    pub offset: u64,
    pub free: bool,
}
