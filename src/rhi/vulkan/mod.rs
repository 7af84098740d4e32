//! Vulkan backend, built on [ash](https://github.com/MaikKlein/ash)

mod vulkan_device;

pub use vulkan_device::VulkanDevice;

use ash::vk;

/// Something Vulkan memory can be bound to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VulkanResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}
