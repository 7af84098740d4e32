use bitflags::bitflags;
use failure::Fail;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Properties of a memory type.
    ///
    /// Bit values match [VkMemoryPropertyFlagBits](https://www.khronos.org/registry/vulkan/specs/1.1-extensions/man/html/VkMemoryPropertyFlagBits.html)
    /// so backends can convert with `from_bits_truncate`.
    #[derive(Default, Serialize, Deserialize)]
    pub struct MemoryPropertyFlags: u32 {
        /// Memory is most efficient for device access.
        const DEVICE_LOCAL = 0x0000_0001;

        /// Memory can be mapped for host access.
        const HOST_VISIBLE = 0x0000_0002;

        /// Host writes are visible to the device, and device writes to the host, without explicit flushes or
        /// invalidations.
        const HOST_COHERENT = 0x0000_0004;

        /// Memory is cached on the host. Host reads are faster, but the memory may not be coherent.
        const HOST_CACHED = 0x0000_0008;

        /// Memory may be committed lazily by the implementation. Only usable for transient attachments.
        const LAZILY_ALLOCATED = 0x0000_0010;

        /// Memory only the device may access, for protected content.
        const PROTECTED = 0x0000_0020;
    }
}

bitflags! {
    /// Attributes of a memory heap.
    #[derive(Default, Serialize, Deserialize)]
    pub struct MemoryHeapFlags: u32 {
        /// The heap lives in device-local memory.
        const DEVICE_LOCAL = 0x0000_0001;

        /// The heap is replicated for each physical device in a device group.
        const MULTI_INSTANCE = 0x0000_0002;
    }
}

/// How a piece of memory will be used.
///
/// Each usage maps to a fixed table of required, desired, and avoided memory properties. See
/// [`crate::memory::UsageWeights`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryUsage {
    /// The memory will only be used by the device.
    ///
    /// Useful for vertex buffers, textures, and render targets.
    Data,

    /// The memory will be written by the CPU and read by the GPU, typically once.
    ///
    /// Useful for staging buffers.
    Upload,

    /// The memory will be written by the GPU and read back by the CPU.
    Download,

    /// The memory will be written by the CPU every frame and read by the GPU.
    ///
    /// Useful for uniform buffers and per-frame data.
    Dynamic,
}

/// What to do when a block is already mapped by someone else.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MapContention {
    /// Fail immediately with [`MappingError::AlreadyMapped`].
    Fail,

    /// Wait until the other mapping scope ends.
    Block,
}

/// Whether the heap budget is taken into account when selecting a memory type.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BudgetMode {
    /// Types whose heap can't hold the request are skipped, unless nothing else fits.
    Enforced,

    /// Heap budget is ignored during selection. Block creation still never overcommits a heap.
    Ignored,
}

/// Whether a memory type was selected within its heap's budget.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BudgetStatus {
    /// The selected heap had enough remaining budget for the request.
    WithinBudget,

    /// No type had enough remaining budget, so the budget filter was relaxed to find one.
    Oversubscribed,
}

/// Failure type for loading a device's memory properties.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum CatalogError {
    /// The device doesn't meet the platform's minimum memory guarantees.
    #[fail(display = "Device can't be used for allocation: {}", reason)]
    InvalidDevice {
        /// What's wrong with the device.
        reason: String,
    },
}

/// Failure type for errors you get when allocating memory.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum AllocationError {
    /// No memory type matches the support mask and the required properties.
    #[fail(display = "No memory type matching the requirements found.")]
    NoSuitableType,

    /// The heap doesn't have enough remaining capacity.
    #[fail(display = "Heap {} can't fit another {} bytes.", heap, requested)]
    HeapExhausted {
        /// Index of the heap.
        heap: u32,

        /// How many bytes the allocator tried to commit.
        requested: u64,
    },

    /// Creating another memory object would go over the platform limit.
    #[fail(display = "Can't create more than {} memory objects.", limit)]
    AllocationLimitExceeded {
        /// The maximum number of live memory objects.
        limit: u32,
    },

    /// There's not enough host memory to make the requested allocation.
    #[fail(display = "There's not enough host memory to make the requested allocation.")]
    OutOfHostMemory,

    /// There's not enough device memory to make the requested allocation.
    #[fail(display = "There's not enough device memory to make the requested allocation.")]
    OutOfDeviceMemory,

    /// The sub-allocation already has a resource bound to it.
    #[fail(display = "The allocation already has a resource bound to it.")]
    AlreadyBound,

    /// The sub-allocation overlaps another live sub-allocation that isn't in its alias group.
    #[fail(display = "The allocation overlaps memory that hasn't been declared as an alias.")]
    UndeclaredAlias,

    /// An overlapping allocation doesn't fit inside the range it overlaps.
    #[fail(display = "The aliasing allocation doesn't fit inside its base allocation.")]
    AliasDoesNotFit,

    /// Zero-sized allocations aren't allowed.
    #[fail(display = "Can't allocate zero bytes.")]
    ZeroSized,

    /// The sub-allocation doesn't belong to this allocator, or its memory has been given back already.
    #[fail(display = "The allocation isn't known to this allocator.")]
    UnknownAllocation,
}

/// Failure type for mapping memory.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum MappingError {
    /// The memory isn't host-visible and therefore can't be mapped.
    #[fail(display = "Memory isn't host-visible.")]
    NotHostVisible,

    /// The block is already mapped by another scope.
    #[fail(display = "Memory is already mapped.")]
    AlreadyMapped,

    /// The requested range isn't inside the allocation.
    #[fail(display = "Range {}..{} is outside of the allocation.", start, end)]
    OutOfRange {
        /// Start of the requested range, relative to the allocation.
        start: u64,

        /// End of the requested range, relative to the allocation.
        end: u64,
    },

    /// Mapping failed for a generic reason.
    #[fail(display = "Mapping failed for an unknown reason.")]
    MappingFailed,
}

/// Failure type for declaring aliases.
#[derive(Fail, Debug, Clone, Eq, PartialEq)]
pub enum AliasingError {
    /// The allocations overlap but no proof that their lifetimes are disjoint was given.
    #[fail(display = "Allocations overlap without a proof of disjoint lifetimes.")]
    OverlapWithoutDisjointLifetimeProof,

    /// The allocations live in different memory blocks.
    #[fail(display = "Allocations live in different memory blocks.")]
    DifferentBlocks,

    /// The allocations don't share any bytes.
    #[fail(display = "Allocations don't overlap.")]
    NoOverlap,
}
