//! A device with no GPU behind it
//!
//! Memory objects are plain host memory, allocated the first time they're mapped. Every call the allocator makes is
//! recorded, and anything a real driver would reject is logged and kept in a list of violations, so tests can check
//! the allocator never does anything a validation layer would complain about.

use crate::rhi::{
    AllocationError, Device, DeviceMemoryProperties, MappedMemoryRange, MappingError, MemoryHeap, MemoryHeapFlags,
    MemoryPropertyFlags, MemoryRequirements, MemoryType,
};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Handle to a simulated memory object.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct HeadlessMemory(u64);

/// A simulated buffer or image. It's nothing but its memory requirements.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HeadlessResource {
    pub id: u64,
    pub requirements: MemoryRequirements,
}

/// A resource bound to memory.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Binding {
    pub resource: u64,
    pub memory: HeadlessMemory,
    pub offset: u64,
}

struct MemoryObject {
    memory_type: u32,
    size: u64,

    /// Empty until the object is first mapped.
    bytes: Vec<u8>,

    /// Currently mapped range, if any.
    mapped: Option<(u64, u64)>,
}

impl MemoryObject {
    fn bytes(&mut self) -> &mut [u8] {
        if self.bytes.is_empty() {
            self.bytes = vec![0; self.size as usize];
        }

        &mut self.bytes
    }
}

#[derive(Default)]
struct DeviceState {
    objects: HashMap<u64, MemoryObject>,
    next_memory: u64,

    /// Bit `i` is set if creating memory objects of type `i` fails.
    failing_types: u32,

    bindings: Vec<Binding>,
    flushes: Vec<MappedMemoryRange<HeadlessMemory>>,
    invalidations: Vec<MappedMemoryRange<HeadlessMemory>>,
    map_calls: usize,
    unmap_calls: usize,
    violations: Vec<String>,
}

impl DeviceState {
    fn violation(&mut self, message: String) {
        log::error!("{}", message);
        self.violations.push(message);
    }

    /// Checks that a flush or invalidate range is inside the mapped range and aligned to whole atoms
    fn check_range(&mut self, range: &MappedMemoryRange<HeadlessMemory>, atom: u64, what: &str) -> Result<(), MappingError> {
        let problem = match self.objects.get(&range.memory.0) {
            None => Some(format!("{} of {:?}, which doesn't exist", what, range.memory)),
            Some(object) => match object.mapped {
                None => Some(format!("{} of {:?}, which isn't mapped", what, range.memory)),
                Some((start, end)) if range.offset < start || range.offset + range.size > end => Some(format!(
                    "{} of {}..{} of {:?}, outside of mapped range {}..{}",
                    what,
                    range.offset,
                    range.offset + range.size,
                    range.memory,
                    start,
                    end
                )),
                Some(_) if range.offset % atom != 0 => Some(format!(
                    "{} at offset {} of {:?} isn't aligned to {} bytes",
                    what, range.offset, range.memory, atom
                )),
                Some(_) if range.size % atom != 0 && range.offset + range.size != object.size => Some(format!(
                    "{} of {} bytes of {:?} isn't a multiple of {} bytes and doesn't end at the end of the object",
                    what, range.size, range.memory, atom
                )),
                Some(_) => None,
            },
        };

        match problem {
            Some(problem) => {
                self.violation(problem);
                Err(MappingError::MappingFailed)
            }
            None => Ok(()),
        }
    }
}

/// A [`Device`] that simulates memory objects in host memory
pub struct HeadlessDevice {
    properties: DeviceMemoryProperties,
    state: Mutex<DeviceState>,
    next_resource: AtomicU64,
}

impl HeadlessDevice {
    /// Creates a device with the given memory properties.
    pub fn new(properties: DeviceMemoryProperties) -> Self {
        HeadlessDevice {
            properties,
            state: Mutex::new(DeviceState::default()),
            next_resource: AtomicU64::new(0),
        }
    }

    /// A device laid out like a typical discrete GPU
    ///
    /// * Heap 0: 8 GiB of VRAM
    /// * Heap 1: 16 GiB of system memory
    /// * Heap 2: 256 MiB of host-visible VRAM
    ///
    /// * Type 0: device-local, on heap 0
    /// * Type 1: host-visible and coherent, on heap 1
    /// * Type 2: host-visible, coherent, and cached, on heap 1
    /// * Type 3: device-local, host-visible, and coherent, on heap 2
    pub fn discrete() -> Self {
        Self::new(DeviceMemoryProperties {
            memory_heaps: vec![
                MemoryHeap {
                    size: 8 * GIB,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: 16 * GIB,
                    flags: MemoryHeapFlags::empty(),
                },
                MemoryHeap {
                    size: 256 * MIB,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
            ],
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 2,
                },
            ],
            max_memory_allocation_count: 4096,
            non_coherent_atom_size: 64,
        })
    }

    /// A device laid out like a typical integrated GPU, with one shared heap
    ///
    /// * Heap 0: 4 GiB of shared memory
    ///
    /// * Type 0: device-local
    /// * Type 1: device-local, host-visible, and coherent
    /// * Type 2: device-local, host-visible, and cached, but not coherent
    pub fn integrated() -> Self {
        Self::new(DeviceMemoryProperties {
            memory_heaps: vec![MemoryHeap {
                size: 4 * GIB,
                flags: MemoryHeapFlags::DEVICE_LOCAL,
            }],
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 0,
                },
            ],
            max_memory_allocation_count: 4096,
            non_coherent_atom_size: 256,
        })
    }

    /// Creates a resource with the given requirements.
    pub fn create_resource(&self, size: u64, alignment: u64, memory_type_bits: u32) -> HeadlessResource {
        HeadlessResource {
            id: self.next_resource.fetch_add(1, Ordering::Relaxed),
            requirements: MemoryRequirements {
                size,
                alignment,
                memory_type_bits,
            },
        }
    }

    /// Makes every future memory object creation of `memory_type` fail with out of device memory.
    pub fn fail_memory_type(&self, memory_type: u32) {
        self.lock().failing_types |= 1 << memory_type;
    }

    /// Number of memory objects that haven't been destroyed.
    pub fn live_memory_objects(&self) -> usize {
        self.lock().objects.len()
    }

    /// Sizes of all live memory objects of `memory_type`, smallest first.
    pub fn memory_object_sizes(&self, memory_type: u32) -> Vec<u64> {
        let mut sizes: Vec<u64> = self
            .lock()
            .objects
            .values()
            .filter(|object| object.memory_type == memory_type)
            .map(|object| object.size)
            .collect();
        sizes.sort_unstable();
        sizes
    }

    /// Every binding made so far.
    pub fn bindings(&self) -> Vec<Binding> {
        self.lock().bindings.clone()
    }

    /// The binding of `resource`, if it's bound.
    pub fn binding_of(&self, resource: &HeadlessResource) -> Option<Binding> {
        self.lock()
            .bindings
            .iter()
            .find(|binding| binding.resource == resource.id)
            .copied()
    }

    /// Every range flushed so far.
    pub fn flushed_ranges(&self) -> Vec<MappedMemoryRange<HeadlessMemory>> {
        self.lock().flushes.clone()
    }

    /// Every range invalidated so far.
    pub fn invalidated_ranges(&self) -> Vec<MappedMemoryRange<HeadlessMemory>> {
        self.lock().invalidations.clone()
    }

    /// Number of times memory was mapped.
    pub fn map_calls(&self) -> usize {
        self.lock().map_calls
    }

    /// Number of times memory was unmapped.
    pub fn unmap_calls(&self) -> usize {
        self.lock().unmap_calls
    }

    /// Everything a driver would have rejected.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    /// Whether any range of `memory` is mapped.
    pub fn is_mapped(&self, memory: HeadlessMemory) -> bool {
        self.lock()
            .objects
            .get(&memory.0)
            .map_or(false, |object| object.mapped.is_some())
    }

    /// Copies bytes out of a memory object, the way the device would see them.
    pub fn read_memory(&self, memory: HeadlessMemory, offset: u64, len: usize) -> Vec<u8> {
        let mut state = self.lock();
        match state.objects.get_mut(&memory.0) {
            Some(object) => {
                let start = offset as usize;
                object.bytes()[start..start + len].to_vec()
            }
            None => vec![],
        }
    }

    /// Writes bytes into a memory object, the way the device would.
    pub fn write_memory(&self, memory: HeadlessMemory, offset: u64, data: &[u8]) {
        let mut state = self.lock();
        if let Some(object) = state.objects.get_mut(&memory.0) {
            let start = offset as usize;
            object.bytes()[start..start + data.len()].copy_from_slice(data);
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Device for HeadlessDevice {
    type Memory = HeadlessMemory;
    type Resource = HeadlessResource;

    fn get_memory_properties(&self) -> DeviceMemoryProperties {
        self.properties.clone()
    }

    fn get_memory_requirements(&self, resource: &HeadlessResource) -> MemoryRequirements {
        resource.requirements
    }

    fn create_memory_object(&self, memory_type: u32, size: u64) -> Result<HeadlessMemory, AllocationError> {
        let mut state = self.lock();
        if state.failing_types & (1 << memory_type) != 0 {
            return Err(AllocationError::OutOfDeviceMemory);
        }

        let handle = state.next_memory;
        state.next_memory += 1;
        state.objects.insert(
            handle,
            MemoryObject {
                memory_type,
                size,
                bytes: vec![],
                mapped: None,
            },
        );

        Ok(HeadlessMemory(handle))
    }

    fn destroy_memory_object(&self, memory: HeadlessMemory) {
        let mut state = self.lock();
        match state.objects.remove(&memory.0) {
            Some(object) if object.mapped.is_some() => {
                state.violation(format!("Destroyed {:?} while it was mapped", memory));
            }
            Some(_) => {}
            None => state.violation(format!("Destroyed {:?}, which doesn't exist", memory)),
        }
    }

    fn bind_memory(&self, resource: &HeadlessResource, memory: HeadlessMemory, offset: u64) -> Result<(), AllocationError> {
        let mut state = self.lock();
        let requirements = resource.requirements;

        let problem = match state.objects.get(&memory.0) {
            None => Some(format!("Bound resource {} to {:?}, which doesn't exist", resource.id, memory)),
            Some(object) if requirements.memory_type_bits & (1 << object.memory_type) == 0 => Some(format!(
                "Bound resource {} to memory type {}, which it doesn't support",
                resource.id, object.memory_type
            )),
            Some(_) if requirements.alignment > 1 && offset % requirements.alignment != 0 => Some(format!(
                "Bound resource {} at offset {}, which isn't aligned to {}",
                resource.id, offset, requirements.alignment
            )),
            Some(object) if offset + requirements.size > object.size => Some(format!(
                "Bound resource {} at {}..{}, past the end of {:?}",
                resource.id,
                offset,
                offset + requirements.size,
                memory
            )),
            Some(_) => None,
        };

        if let Some(problem) = problem {
            state.violation(problem);
            return Err(AllocationError::OutOfDeviceMemory);
        }

        state.bindings.push(Binding {
            resource: resource.id,
            memory,
            offset,
        });

        Ok(())
    }

    fn map_memory(&self, memory: HeadlessMemory, offset: u64, size: u64) -> Result<NonNull<u8>, MappingError> {
        let mut state = self.lock();
        state.map_calls += 1;

        let problem = match state.objects.get(&memory.0) {
            None => Some(format!("Mapped {:?}, which doesn't exist", memory)),
            Some(object) if object.mapped.is_some() => Some(format!("Mapped {:?}, which is already mapped", memory)),
            Some(object) if size == 0 || offset + size > object.size => Some(format!(
                "Mapped {}..{} of {:?}, which is {} bytes",
                offset,
                offset + size,
                memory,
                object.size
            )),
            Some(_) => None,
        };

        if let Some(problem) = problem {
            state.violation(problem);
            return Err(MappingError::MappingFailed);
        }

        let object = state.objects.get_mut(&memory.0).ok_or(MappingError::MappingFailed)?;
        object.mapped = Some((offset, offset + size));
        NonNull::new(object.bytes()[offset as usize..].as_mut_ptr()).ok_or(MappingError::MappingFailed)
    }

    fn unmap_memory(&self, memory: HeadlessMemory) {
        let mut state = self.lock();
        state.unmap_calls += 1;

        let was_mapped = state
            .objects
            .get_mut(&memory.0)
            .map_or(false, |object| object.mapped.take().is_some());
        if !was_mapped {
            state.violation(format!("Unmapped {:?}, which isn't mapped", memory));
        }
    }

    fn flush_ranges(&self, ranges: &[MappedMemoryRange<HeadlessMemory>]) -> Result<(), MappingError> {
        let atom = self.properties.non_coherent_atom_size.max(1);
        let mut state = self.lock();

        for range in ranges {
            state.check_range(range, atom, "Flush")?;
            state.flushes.push(*range);
        }

        Ok(())
    }

    fn invalidate_ranges(&self, ranges: &[MappedMemoryRange<HeadlessMemory>]) -> Result<(), MappingError> {
        let atom = self.properties.non_coherent_atom_size.max(1);
        let mut state = self.lock();

        for range in ranges {
            state.check_range(range, atom, "Invalidate")?;
            state.invalidations.push(*range);
        }

        Ok(())
    }
}
