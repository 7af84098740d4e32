use matches::assert_matches;
use nova_memory::core::allocators::StrategyKind;
use nova_memory::memory::{Allocator, MemoryRequest, MemoryTypeCatalog, SubAllocation};
use nova_memory::rhi::headless::HeadlessDevice;
use nova_memory::rhi::*;
use nova_memory::settings::AllocatorSettings;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn requirements(size: u64) -> MemoryRequirements {
    MemoryRequirements {
        size,
        alignment: 256,
        memory_type_bits: !0,
    }
}

fn discrete() -> (Arc<HeadlessDevice>, Allocator<HeadlessDevice>) {
    let device = Arc::new(HeadlessDevice::discrete());
    let allocator = Allocator::new(Arc::clone(&device), AllocatorSettings::default()).unwrap();
    (device, allocator)
}

/// One 1 GiB device-local heap, and a host-visible heap
fn small_heap_properties() -> DeviceMemoryProperties {
    DeviceMemoryProperties {
        memory_heaps: vec![
            MemoryHeap {
                size: GIB,
                flags: MemoryHeapFlags::DEVICE_LOCAL,
            },
            MemoryHeap {
                size: GIB,
                flags: MemoryHeapFlags::empty(),
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
        ],
        max_memory_allocation_count: 4096,
        non_coherent_atom_size: 64,
    }
}

fn assert_conserved(allocator: &Allocator<HeadlessDevice>) {
    for stats in allocator.statistics().memory_types {
        assert_eq!(
            stats.used_bytes + stats.free_bytes,
            stats.committed_bytes,
            "memory type {} doesn't add up",
            stats.memory_type
        );
    }
}

#[test]
fn large_request_gets_dedicated_block_of_exact_size() {
    let (device, allocator) = discrete();

    let texture = allocator.request_memory(&requirements(40 * MIB), MemoryUsage::Data).unwrap();
    assert!(texture.is_dedicated());
    assert_eq!(texture.offset(), 0);
    assert_eq!(device.memory_object_sizes(0), vec![40 * MIB]);
    assert_eq!(allocator.catalog().heap_budget(0).committed, 40 * MIB);

    allocator.release(texture);
    assert_eq!(device.live_memory_objects(), 0);
    assert_eq!(allocator.catalog().heap_budget(0).committed, 0);
}

#[test]
fn small_requests_share_a_default_sized_block() {
    let (device, allocator) = discrete();

    let a = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    let b = allocator.request_memory(&requirements(3 * MIB), MemoryUsage::Data).unwrap();

    assert!(!a.is_dedicated());
    assert_eq!(a.block(), b.block());
    assert!(!a.overlaps(&b));
    assert_eq!(b.offset() % 256, 0);
    assert_eq!(device.memory_object_sizes(0), vec![256 * MIB]);
    assert_conserved(&allocator);

    allocator.release(a);
    allocator.release(b);
}

#[test]
fn small_heaps_use_an_eighth_of_their_capacity_per_block() {
    let device = Arc::new(HeadlessDevice::new(small_heap_properties()));
    let allocator = Allocator::new(Arc::clone(&device), AllocatorSettings::default()).unwrap();

    let a = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_eq!(device.memory_object_sizes(0), vec![128 * MIB]);

    allocator.release(a);
}

#[test]
fn block_size_is_halved_when_heap_is_nearly_full() {
    let device = Arc::new(HeadlessDevice::new(small_heap_properties()));
    let catalog = Arc::new(MemoryTypeCatalog::load(&device.get_memory_properties()).unwrap());
    catalog.try_commit(0, GIB - 40 * MIB).unwrap();

    let allocator = Allocator::with_catalog(Arc::clone(&device), Arc::clone(&catalog), AllocatorSettings::default());

    let request = MemoryRequest::new(
        MemoryRequirements {
            memory_type_bits: 0b01,
            ..requirements(MIB)
        },
        MemoryUsage::Data,
    )
    .with_budget(BudgetMode::Ignored);

    // 128 MiB and 64 MiB don't fit, 32 MiB does
    let a = allocator.request(&request).unwrap();
    assert_eq!(device.memory_object_sizes(0), vec![32 * MIB]);
    assert!(catalog.heap_budget(0).committed <= GIB);

    allocator.release(a);
}

#[test]
fn block_size_is_halved_at_most_three_times() {
    let device = Arc::new(HeadlessDevice::new(small_heap_properties()));
    let catalog = Arc::new(MemoryTypeCatalog::load(&device.get_memory_properties()).unwrap());
    catalog.try_commit(0, GIB - 10 * MIB).unwrap();

    let allocator = Allocator::with_catalog(Arc::clone(&device), Arc::clone(&catalog), AllocatorSettings::default());

    let request = MemoryRequest::new(
        MemoryRequirements {
            memory_type_bits: 0b01,
            ..requirements(MIB)
        },
        MemoryUsage::Data,
    );

    assert_matches!(allocator.request(&request), Err(AllocationError::HeapExhausted { heap: 0, .. }));
    assert_eq!(device.live_memory_objects(), 0);
    assert_eq!(catalog.heap_budget(0).committed, GIB - 10 * MIB);
}

#[test]
fn heap_commitment_never_exceeds_capacity() {
    let device = Arc::new(HeadlessDevice::new(small_heap_properties()));
    let allocator = Allocator::new(Arc::clone(&device), AllocatorSettings::default()).unwrap();
    let mut live = vec![];

    loop {
        match allocator.request_memory(&requirements(100 * MIB), MemoryUsage::Data) {
            Ok(allocation) => live.push(allocation),
            Err(err) => {
                assert_matches!(err, AllocationError::HeapExhausted { .. });
                break;
            }
        }

        for heap in 0..allocator.catalog().heap_count() {
            let budget = allocator.catalog().heap_budget(heap);
            assert!(budget.committed <= budget.capacity);
        }
    }

    // 100 MiB requests are dedicated, and only ten of them fit on the one device-local heap
    assert_eq!(live.len(), 10);

    for allocation in live {
        allocator.release(allocation);
    }
    assert_eq!(device.live_memory_objects(), 0);
}

#[test]
fn memory_object_limit_is_enforced() {
    let device = Arc::new(HeadlessDevice::discrete());
    let settings = AllocatorSettings {
        max_memory_objects: Some(2),
        ..AllocatorSettings::default()
    };
    let allocator = Allocator::new(Arc::clone(&device), settings).unwrap();

    let a = allocator.request_memory(&requirements(40 * MIB), MemoryUsage::Data).unwrap();
    let b = allocator.request_memory(&requirements(40 * MIB), MemoryUsage::Data).unwrap();
    assert_matches!(
        allocator.request_memory(&requirements(40 * MIB), MemoryUsage::Data),
        Err(AllocationError::AllocationLimitExceeded { limit: 2 })
    );
    assert_eq!(allocator.live_memory_objects(), 2);

    allocator.release(a);
    let c = allocator.request_memory(&requirements(40 * MIB), MemoryUsage::Data).unwrap();

    allocator.release(b);
    allocator.release(c);
}

#[test]
fn falls_back_to_another_type_when_device_runs_out() {
    let (device, allocator) = discrete();
    device.fail_memory_type(0);

    let allocation = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_eq!(allocation.memory_type(), 3);
    assert_eq!(allocator.catalog().heap_budget(0).committed, 0);

    allocator.release(allocation);
}

#[test]
fn zero_sized_requests_are_rejected() {
    let (_, allocator) = discrete();
    assert_matches!(
        allocator.request_memory(&requirements(0), MemoryUsage::Data),
        Err(AllocationError::ZeroSized)
    );
}

#[test]
fn released_ranges_coalesce_back_into_one() {
    let (_, allocator) = discrete();

    let allocations: Vec<SubAllocation> = (0..8)
        .map(|_| allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap())
        .collect();
    assert_conserved(&allocator);

    // Free every other one first, so the free list has to merge on both sides later
    let (even, odd): (Vec<_>, Vec<_>) = allocations.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
    for (_, allocation) in even {
        allocator.release(allocation);
    }
    assert_conserved(&allocator);
    for (_, allocation) in odd {
        allocator.release(allocation);
    }

    let stats = &allocator.statistics().memory_types[0];
    assert_eq!(stats.block_count, 1);
    assert_eq!(stats.empty_block_count, 1);
    assert_eq!(stats.free_bytes, 256 * MIB);
    assert_eq!(stats.largest_free_range, 256 * MIB);
    assert!(stats.fragmentation.abs() < f64::EPSILON);
}

#[test]
fn one_empty_block_is_retained_until_trimmed() {
    let (device, allocator) = discrete();

    // Too big to share a 256 MiB block, too small to be dedicated
    let a = allocator.request_memory(&requirements(30 * MIB), MemoryUsage::Data).unwrap();
    let big: Vec<SubAllocation> = (0..9)
        .map(|_| allocator.request_memory(&requirements(30 * MIB), MemoryUsage::Data).unwrap())
        .collect();
    assert_eq!(device.memory_object_sizes(0), vec![256 * MIB, 256 * MIB]);

    allocator.release(a);
    for allocation in big {
        allocator.release(allocation);
    }

    // Both blocks are empty, but only one is kept
    assert_eq!(device.memory_object_sizes(0), vec![256 * MIB]);
    assert_eq!(allocator.statistics().memory_types[0].empty_block_count, 1);

    // The cached block is reused
    let again = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_eq!(device.live_memory_objects(), 1);
    allocator.release(again);

    allocator.trim();
    assert_eq!(device.live_memory_objects(), 0);
    assert_eq!(allocator.catalog().heap_budget(0).committed, 0);
}

#[test]
fn empty_blocks_are_destroyed_when_not_retained() {
    let device = Arc::new(HeadlessDevice::discrete());
    let settings = AllocatorSettings {
        retain_empty_blocks: false,
        ..AllocatorSettings::default()
    };
    let allocator = Allocator::new(Arc::clone(&device), settings).unwrap();

    let a = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_eq!(device.live_memory_objects(), 1);

    allocator.release(a);
    assert_eq!(device.live_memory_objects(), 0);
}

#[test]
fn linear_blocks_reset_when_emptied() {
    let (_, allocator) = discrete();
    let request = MemoryRequest::new(requirements(MIB), MemoryUsage::Data).with_strategy(StrategyKind::Linear);

    let a = allocator.request(&request).unwrap();
    let b = allocator.request(&request).unwrap();
    assert_eq!(a.strategy(), StrategyKind::Linear);
    assert_eq!(a.block(), b.block());
    assert!(b.offset() > a.offset());

    // Free-list requests never land in a linear block
    let c = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_ne!(c.block(), a.block());

    let block = a.block();
    let first_offset = a.offset();
    allocator.release(b);
    allocator.release(a);

    let d = allocator.request(&request).unwrap();
    assert_eq!(d.block(), block);
    assert_eq!(d.offset(), first_offset);

    allocator.release(c);
    allocator.release(d);
}

#[test]
fn allocate_for_binds_at_an_aligned_offset() {
    let (device, allocator) = discrete();

    let padding = allocator.request_memory(&requirements(100), MemoryUsage::Data).unwrap();
    let buffer = device.create_resource(4096, 4096, !0);
    let allocation = allocator.allocate_for(&buffer, MemoryUsage::Data).unwrap();

    let binding = device.binding_of(&buffer).unwrap();
    assert_eq!(binding.offset, allocation.offset());
    assert_eq!(binding.offset % 4096, 0);
    assert!(device.violations().is_empty());

    assert_matches!(allocator.bind(&allocation, &buffer), Err(AllocationError::AlreadyBound));

    allocator.release(padding);
    allocator.release(allocation);
}

#[test]
fn concurrent_allocation_keeps_books_balanced() {
    let (device, allocator) = discrete();

    crossbeam::scope(|scope| {
        for thread in 0..8u64 {
            let allocator = &allocator;
            scope.spawn(move |_| {
                let usage = if thread % 2 == 0 { MemoryUsage::Data } else { MemoryUsage::Upload };
                let mut live = vec![];

                for i in 0..50u64 {
                    let size = (i % 7 + 1) * 64 * 1024;
                    live.push(allocator.request_memory(&requirements(size), usage).unwrap());

                    if i % 3 == 0 {
                        let allocation = live.swap_remove(0);
                        allocator.release(allocation);
                    }
                }

                for allocation in live {
                    allocator.release(allocation);
                }
            });
        }
    })
    .unwrap();

    for stats in allocator.statistics().memory_types {
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.used_bytes, 0);
    }
    assert_conserved(&allocator);
    assert!(device.violations().is_empty());
}

#[test]
fn statistics_serialize_to_json() {
    let (_, allocator) = discrete();
    let a = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();

    let json = allocator.statistics().to_json();
    assert!(json.contains("\"memoryTypes\""));
    assert!(json.contains("\"committedBytes\""));

    allocator.release(a);
}

#[test]
fn binding_an_allocation_from_another_allocator_fails() {
    let (device, allocator) = discrete();
    let other = Allocator::new(Arc::clone(&device), AllocatorSettings::default()).unwrap();
    let buffer = device.create_resource(MIB, 256, !0);

    let allocation = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_matches!(other.bind(&allocation, &buffer), Err(AllocationError::UnknownAllocation));
    assert!(device.binding_of(&buffer).is_none());

    allocator.bind(&allocation, &buffer).unwrap();
    allocator.release(allocation);
}
