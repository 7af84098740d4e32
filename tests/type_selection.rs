use maplit::btreemap;
use matches::assert_matches;
use nova_memory::memory::{Allocator, MemoryRequest, MemoryTypeCatalog, TypeSelector, UsageWeights};
use nova_memory::rhi::headless::HeadlessDevice;
use nova_memory::rhi::*;
use nova_memory::settings::AllocatorSettings;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn properties(heaps: &[(u64, MemoryHeapFlags)], types: &[(MemoryPropertyFlags, u32)]) -> DeviceMemoryProperties {
    DeviceMemoryProperties {
        memory_heaps: heaps.iter().map(|&(size, flags)| MemoryHeap { size, flags }).collect(),
        memory_types: types
            .iter()
            .map(|&(property_flags, heap_index)| MemoryType {
                property_flags,
                heap_index,
            })
            .collect(),
        max_memory_allocation_count: 4096,
        non_coherent_atom_size: 64,
    }
}

fn requirements(size: u64) -> MemoryRequirements {
    MemoryRequirements {
        size,
        alignment: 256,
        memory_type_bits: !0,
    }
}

fn discrete_catalog() -> MemoryTypeCatalog {
    MemoryTypeCatalog::load(&HeadlessDevice::discrete().get_memory_properties()).unwrap()
}

#[test]
fn upload_prefers_host_visible_heap_over_device_local() {
    let device = Arc::new(HeadlessDevice::new(properties(
        &[(256 * MIB, MemoryHeapFlags::DEVICE_LOCAL), (512 * MIB, MemoryHeapFlags::empty())],
        &[
            (MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT, 1),
        ],
    )));
    let allocator = Allocator::new(device, AllocatorSettings::default()).unwrap();

    let staging = allocator.request_memory(&requirements(MIB), MemoryUsage::Upload).unwrap();
    assert_eq!(staging.memory_type(), 1);
    assert_eq!(staging.budget_status(), BudgetStatus::WithinBudget);

    allocator.release(staging);
}

#[test]
fn usages_pick_expected_types_on_discrete_gpu() {
    let catalog = discrete_catalog();
    let selector = TypeSelector::new(&catalog);

    let select = |usage: MemoryUsage| {
        selector
            .select(!0, &usage.into(), MIB, BudgetMode::Enforced)
            .unwrap()
            .memory_type
    };

    assert_eq!(select(MemoryUsage::Data), 0);
    assert_eq!(select(MemoryUsage::Upload), 1);
    assert_eq!(select(MemoryUsage::Download), 2);
    assert_eq!(select(MemoryUsage::Dynamic), 3);
}

#[test]
fn selected_type_always_has_required_flags() {
    let catalog = discrete_catalog();
    let selector = TypeSelector::new(&catalog);
    let usages = [
        MemoryUsage::Data,
        MemoryUsage::Upload,
        MemoryUsage::Download,
        MemoryUsage::Dynamic,
    ];

    for mask in 0..16u32 {
        for &usage in &usages {
            let required = UsageWeights::for_usage(usage).required;

            match selector.select(mask, &usage.into(), MIB, BudgetMode::Enforced) {
                Ok(selection) => {
                    assert_ne!(mask & (1 << selection.memory_type), 0);
                    assert!(catalog
                        .memory_type(selection.memory_type)
                        .property_flags
                        .contains(required));
                }
                Err(err) => {
                    assert_eq!(err, AllocationError::NoSuitableType);
                    assert!(catalog
                        .types_supporting(mask)
                        .all(|(_, memory_type)| !memory_type.property_flags.contains(required)));
                }
            }
        }
    }
}

#[test]
fn no_suitable_type_when_mask_excludes_required_flags() {
    let catalog = discrete_catalog();
    let selector = TypeSelector::new(&catalog);

    // Only the host-visible, non-device-local types
    let result = selector.select(0b0110, &MemoryUsage::Data.into(), MIB, BudgetMode::Enforced);
    assert_matches!(result, Err(AllocationError::NoSuitableType));
}

#[test]
fn ties_go_to_most_remaining_budget_then_lowest_index() {
    let catalog = MemoryTypeCatalog::load(&properties(
        &[
            (GIB, MemoryHeapFlags::DEVICE_LOCAL),
            (GIB, MemoryHeapFlags::DEVICE_LOCAL),
            (GIB, MemoryHeapFlags::empty()),
        ],
        &[
            (MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (MemoryPropertyFlags::DEVICE_LOCAL, 1),
            (MemoryPropertyFlags::HOST_VISIBLE, 2),
        ],
    ))
    .unwrap();

    let data = MemoryUsage::Data.into();
    let selector = TypeSelector::new(&catalog);
    assert_eq!(selector.select(!0, &data, MIB, BudgetMode::Enforced).unwrap().memory_type, 0);

    catalog.try_commit(0, 512 * MIB).unwrap();
    assert_eq!(selector.select(!0, &data, MIB, BudgetMode::Enforced).unwrap().memory_type, 1);
}

#[test]
fn budget_filter_skips_heaps_that_cannot_fit_the_request() {
    let catalog = MemoryTypeCatalog::load(&properties(
        &[(256 * MIB, MemoryHeapFlags::DEVICE_LOCAL), (GIB, MemoryHeapFlags::DEVICE_LOCAL)],
        &[
            (MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE, 1),
        ],
    ))
    .unwrap();
    let selector = TypeSelector::new(&catalog);
    let data = MemoryUsage::Data.into();

    let selection = selector.select(!0, &data, 512 * MIB, BudgetMode::Enforced).unwrap();
    assert_eq!(selection.memory_type, 1);
    assert_eq!(selection.budget, BudgetStatus::WithinBudget);

    // Ignoring the budget, the type without the avoided flag wins
    let selection = selector.select(!0, &data, 512 * MIB, BudgetMode::Ignored).unwrap();
    assert_eq!(selection.memory_type, 0);
    assert_eq!(selection.budget, BudgetStatus::Oversubscribed);
}

#[test]
fn relaxed_selection_reports_oversubscription() {
    let catalog = MemoryTypeCatalog::load(&properties(
        &[(256 * MIB, MemoryHeapFlags::DEVICE_LOCAL), (GIB, MemoryHeapFlags::DEVICE_LOCAL)],
        &[
            (MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE, 1),
        ],
    ))
    .unwrap();
    let selector = TypeSelector::new(&catalog);

    let selection = selector
        .select(!0, &MemoryUsage::Data.into(), 2 * GIB, BudgetMode::Enforced)
        .unwrap();
    assert_eq!(selection.memory_type, 0);
    assert_eq!(selection.budget, BudgetStatus::Oversubscribed);
}

#[test]
fn oversubscribed_request_still_never_overcommits_a_heap() {
    let device = Arc::new(HeadlessDevice::new(properties(
        &[(256 * MIB, MemoryHeapFlags::DEVICE_LOCAL), (GIB, MemoryHeapFlags::DEVICE_LOCAL)],
        &[
            (MemoryPropertyFlags::DEVICE_LOCAL, 0),
            (MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE, 1),
        ],
    )));
    let allocator = Allocator::new(Arc::clone(&device), AllocatorSettings::default()).unwrap();

    let result = allocator.request_memory(&requirements(2 * GIB), MemoryUsage::Data);
    assert_matches!(result, Err(AllocationError::HeapExhausted { .. }));

    assert_eq!(allocator.catalog().heap_budget(0).committed, 0);
    assert_eq!(allocator.catalog().heap_budget(1).committed, 0);
    assert_eq!(device.live_memory_objects(), 0);
}

#[test]
fn custom_weights_override_presets() {
    let catalog = discrete_catalog();
    let selector = TypeSelector::new(&catalog);

    let readback = UsageWeights {
        required: MemoryPropertyFlags::HOST_VISIBLE,
        desired: btreemap! {
            MemoryPropertyFlags::HOST_CACHED => 5,
        },
        avoided: btreemap! {
            MemoryPropertyFlags::DEVICE_LOCAL => -10,
        },
    };
    assert_eq!(
        selector
            .select(!0, &readback.into(), MIB, BudgetMode::Enforced)
            .unwrap()
            .memory_type,
        2
    );

    // A weight keyed by two flags only counts when a type has both
    let host_local = UsageWeights {
        required: MemoryPropertyFlags::HOST_VISIBLE,
        desired: btreemap! {
            MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_COHERENT => 4,
        },
        avoided: btreemap! {},
    };
    assert_eq!(
        selector
            .select(!0, &host_local.into(), MIB, BudgetMode::Enforced)
            .unwrap()
            .memory_type,
        3
    );
}

#[test]
fn full_request_form_honors_budget_mode() {
    let device = Arc::new(HeadlessDevice::discrete());
    let allocator = Allocator::new(device, AllocatorSettings::default()).unwrap();

    let request = MemoryRequest::new(requirements(MIB), MemoryUsage::Dynamic).with_budget(BudgetMode::Ignored);
    let allocation = allocator.request(&request).unwrap();
    assert_eq!(allocation.memory_type(), 3);

    allocator.release(allocation);
}
