#![allow(unsafe_code)]

use crate::rhi::vulkan::VulkanResource;
use crate::rhi::*;

use ash::vk;
use std::ptr::NonNull;

/// The memory half of a Vulkan device
///
/// The device doesn't own the Vulkan instance or device. Whoever created them must keep them alive for as long as any
/// allocator uses this device, and destroy them afterwards.
pub struct VulkanDevice {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
}

impl VulkanDevice {
    pub fn new(instance: ash::Instance, physical_device: vk::PhysicalDevice, device: ash::Device) -> Self {
        VulkanDevice {
            instance,
            physical_device,
            device,
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }
}

fn allocation_error(result: vk::Result) -> AllocationError {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => AllocationError::OutOfHostMemory,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => AllocationError::OutOfDeviceMemory,
        result => {
            log::error!("Unexpected Vulkan result: {:?}", result);
            AllocationError::OutOfDeviceMemory
        }
    }
}

fn mapping_error(result: vk::Result) -> MappingError {
    if result != vk::Result::ERROR_MEMORY_MAP_FAILED {
        log::error!("Could not map memory: {:?}", result);
    }

    MappingError::MappingFailed
}

fn vk_ranges(ranges: &[MappedMemoryRange<vk::DeviceMemory>]) -> Vec<vk::MappedMemoryRange> {
    ranges
        .iter()
        .map(|range| {
            vk::MappedMemoryRange::builder()
                .memory(range.memory)
                .offset(range.offset)
                .size(range.size)
                .build()
        })
        .collect()
}

impl Device for VulkanDevice {
    type Memory = vk::DeviceMemory;
    type Resource = VulkanResource;

    fn get_memory_properties(&self) -> DeviceMemoryProperties {
        let (memory_properties, limits) = unsafe {
            (
                self.instance.get_physical_device_memory_properties(self.physical_device),
                self.instance.get_physical_device_properties(self.physical_device).limits,
            )
        };

        let memory_heaps = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
            .iter()
            .map(|heap| MemoryHeap {
                size: heap.size,
                flags: MemoryHeapFlags::from_bits_truncate(heap.flags.as_raw()),
            })
            .collect();

        let memory_types = memory_properties.memory_types[..memory_properties.memory_type_count as usize]
            .iter()
            .map(|memory_type| MemoryType {
                property_flags: MemoryPropertyFlags::from_bits_truncate(memory_type.property_flags.as_raw()),
                heap_index: memory_type.heap_index,
            })
            .collect();

        DeviceMemoryProperties {
            memory_heaps,
            memory_types,
            max_memory_allocation_count: limits.max_memory_allocation_count,
            non_coherent_atom_size: limits.non_coherent_atom_size,
        }
    }

    fn get_memory_requirements(&self, resource: &VulkanResource) -> MemoryRequirements {
        let requirements = unsafe {
            match *resource {
                VulkanResource::Buffer(buffer) => self.device.get_buffer_memory_requirements(buffer),
                VulkanResource::Image(image) => self.device.get_image_memory_requirements(image),
            }
        };

        MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn create_memory_object(&self, memory_type: u32, size: u64) -> Result<vk::DeviceMemory, AllocationError> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);

        unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(allocation_error)
    }

    fn destroy_memory_object(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_memory(&self, resource: &VulkanResource, memory: vk::DeviceMemory, offset: u64) -> Result<(), AllocationError> {
        unsafe {
            match *resource {
                VulkanResource::Buffer(buffer) => self.device.bind_buffer_memory(buffer, memory, offset),
                VulkanResource::Image(image) => self.device.bind_image_memory(image, memory, offset),
            }
        }
        .map_err(allocation_error)
    }

    fn map_memory(&self, memory: vk::DeviceMemory, offset: u64, size: u64) -> Result<NonNull<u8>, MappingError> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
                .map_err(mapping_error)?
        };

        NonNull::new(ptr as *mut u8).ok_or(MappingError::MappingFailed)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn flush_ranges(&self, ranges: &[MappedMemoryRange<vk::DeviceMemory>]) -> Result<(), MappingError> {
        unsafe { self.device.flush_mapped_memory_ranges(&vk_ranges(ranges)) }.map_err(mapping_error)
    }

    fn invalidate_ranges(&self, ranges: &[MappedMemoryRange<vk::DeviceMemory>]) -> Result<(), MappingError> {
        unsafe { self.device.invalidate_mapped_memory_ranges(&vk_ranges(ranges)) }.map_err(mapping_error)
    }
}
