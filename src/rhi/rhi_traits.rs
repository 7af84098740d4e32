//! Nova's Render Hardware Interface, as seen by the memory allocator
//!
//! The allocator doesn't create resources or record commands. It only needs to know what memory a device has, how to
//! create and destroy memory objects, how to bind resources to them, and how to map them. Everything else the graphics
//! API does is someone else's problem.

use super::{rhi_enums::*, rhi_structs::*};
use std::fmt::Debug;
use std::ptr::NonNull;

/// The memory-related half of a device.
///
/// This will probably be a physical GPU, but a software implementation is possible. The allocator calls these
/// methods from multiple threads at once, so implementations must be internally synchronized.
pub trait Device: Send + Sync {
    /// Opaque handle to a memory object.
    ///
    /// Handles are owned by the allocator's memory blocks. Nothing else holds on to them.
    type Memory: Copy + Debug + Eq + Send + Sync;

    /// A buffer or image that memory can be bound to.
    type Resource;

    /// Gets the heaps, memory types, and memory limits of the physical device.
    fn get_memory_properties(&self) -> DeviceMemoryProperties;

    /// Gets the size, alignment, and allowed memory types of a resource.
    fn get_memory_requirements(&self, resource: &Self::Resource) -> MemoryRequirements;

    /// Creates a new memory object.
    ///
    /// # Parameters
    ///
    /// * `memory_type` - Index of the memory type to allocate from.
    /// * `size` - The size, in bytes, of the memory object.
    fn create_memory_object(&self, memory_type: u32, size: u64) -> Result<Self::Memory, AllocationError>;

    /// Destroys a memory object. It must not be mapped or in use by the GPU.
    fn destroy_memory_object(&self, memory: Self::Memory);

    /// Binds a resource to a range of a memory object.
    ///
    /// # Parameters
    ///
    /// * `resource` - The resource to bind.
    /// * `memory` - The memory object to bind it to.
    /// * `offset` - Offset, in bytes, from the start of the memory object.
    fn bind_memory(&self, resource: &Self::Resource, memory: Self::Memory, offset: u64) -> Result<(), AllocationError>;

    /// Maps a range of a memory object into host address space.
    ///
    /// A memory object may only have one mapped range at a time.
    fn map_memory(&self, memory: Self::Memory, offset: u64, size: u64) -> Result<NonNull<u8>, MappingError>;

    /// Unmaps a memory object.
    fn unmap_memory(&self, memory: Self::Memory);

    /// Makes host writes to the given ranges visible to the device.
    fn flush_ranges(&self, ranges: &[MappedMemoryRange<Self::Memory>]) -> Result<(), MappingError>;

    /// Makes device writes to the given ranges visible to the host.
    fn invalidate_ranges(&self, ranges: &[MappedMemoryRange<Self::Memory>]) -> Result<(), MappingError>;
}
