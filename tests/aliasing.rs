use matches::assert_matches;
use nova_memory::memory::{Allocator, DisjointLifetime};
use nova_memory::rhi::headless::HeadlessDevice;
use nova_memory::rhi::*;
use nova_memory::settings::AllocatorSettings;
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

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

#[test]
fn alias_requires_a_disjoint_lifetime_proof() {
    let (_, allocator) = discrete();
    let shadow_map = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    let bloom = allocator.allocate_overlapping(&shadow_map, &requirements(MIB)).unwrap();
    assert_eq!(bloom.offset(), shadow_map.offset());
    assert_eq!(bloom.size(), shadow_map.size());

    assert_matches!(
        allocator.declare_transient_alias(&shadow_map, &bloom, None),
        Err(AliasingError::OverlapWithoutDisjointLifetimeProof)
    );

    // Last access after the first write proves nothing
    assert_matches!(
        allocator.declare_transient_alias(&shadow_map, &bloom, Some(DisjointLifetime::new(5, 5))),
        Err(AliasingError::OverlapWithoutDisjointLifetimeProof)
    );

    let group = allocator
        .declare_transient_alias(&shadow_map, &bloom, Some(DisjointLifetime::new(2, 5)))
        .unwrap();
    let recorded = allocator.alias_group_of(&bloom).unwrap();
    assert_eq!(recorded.id, group);
    assert_eq!(recorded.members.len(), 2);
    assert_eq!(recorded.attestations.len(), 1);
    assert_eq!(recorded.attestations[0].proof.next_first_write, 5);

    // Each one can be released on its own, and the memory comes back once both are gone
    allocator.release(shadow_map);
    assert_eq!(allocator.statistics().memory_types[0].allocation_count, 1);
    assert!(allocator.alias_group_of(&bloom).is_none());

    allocator.release(bloom);
    let stats = &allocator.statistics().memory_types[0];
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.used_bytes, 0);
}

#[test]
fn overlapping_allocations_bind_only_after_declaring_an_alias() {
    let (device, allocator) = discrete();
    let first = device.create_resource(MIB, 256, !0);
    let second = device.create_resource(MIB / 2, 256, !0);

    let base = allocator.allocate_for(&first, MemoryUsage::Data).unwrap();
    let overlapping = allocator
        .allocate_overlapping(&base, &device.get_memory_requirements(&second))
        .unwrap();

    assert_matches!(allocator.bind(&overlapping, &second), Err(AllocationError::UndeclaredAlias));

    allocator
        .declare_transient_alias(&base, &overlapping, Some(DisjointLifetime::new(0, 1)))
        .unwrap();
    allocator.bind(&overlapping, &second).unwrap();

    let a = device.binding_of(&first).unwrap();
    let b = device.binding_of(&second).unwrap();
    assert_eq!(a.memory, b.memory);
    assert_eq!(a.offset, b.offset);
    assert!(device.violations().is_empty());

    allocator.release(base);
    allocator.release(overlapping);
}

#[test]
fn overlapping_allocation_must_fit_inside_its_base() {
    let (_, allocator) = discrete();
    let base = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();

    assert_matches!(
        allocator.allocate_overlapping(&base, &requirements(2 * MIB)),
        Err(AllocationError::AliasDoesNotFit)
    );
    assert_matches!(
        allocator.allocate_overlapping(&base, &MemoryRequirements {
            memory_type_bits: 0b10,
            ..requirements(MIB)
        }),
        Err(AllocationError::NoSuitableType)
    );

    allocator.release(base);
}

#[test]
fn aliases_must_share_a_block_and_overlap() {
    let (_, allocator) = discrete();
    let proof = Some(DisjointLifetime::new(1, 2));

    let a = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    let b = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_matches!(
        allocator.declare_transient_alias(&a, &b, proof),
        Err(AliasingError::NoOverlap)
    );

    let dedicated = allocator.request_memory(&requirements(40 * MIB), MemoryUsage::Data).unwrap();
    assert_matches!(
        allocator.declare_transient_alias(&a, &dedicated, proof),
        Err(AliasingError::DifferentBlocks)
    );

    assert!(allocator.alias_groups().is_empty());

    allocator.release(a);
    allocator.release(b);
    allocator.release(dedicated);
}

#[test]
fn declaring_across_groups_merges_them() {
    let (_, allocator) = discrete();
    let a = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    let b = allocator.allocate_overlapping(&a, &requirements(MIB)).unwrap();
    let c = allocator.allocate_overlapping(&a, &requirements(MIB)).unwrap();
    let d = allocator.allocate_overlapping(&a, &requirements(MIB)).unwrap();

    let first = allocator
        .declare_transient_alias(&a, &b, Some(DisjointLifetime::new(0, 1)))
        .unwrap();
    let second = allocator
        .declare_transient_alias(&c, &d, Some(DisjointLifetime::new(2, 3)))
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(allocator.alias_groups().len(), 2);

    let merged = allocator
        .declare_transient_alias(&b, &c, Some(DisjointLifetime::new(1, 2)))
        .unwrap();
    let groups = allocator.alias_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, merged);
    assert_eq!(groups[0].members.len(), 4);
    assert_eq!(groups[0].attestations.len(), 3);

    // Losing a member leaves the rest of the group intact
    let released = d.id();
    allocator.release(d);
    let group = allocator.alias_group_of(&a).unwrap();
    assert_eq!(group.members.len(), 3);
    assert!(!group.contains(released));
    assert!(group.contains(c.id()));

    allocator.release(a);
    allocator.release(b);
    assert!(allocator.alias_group_of(&c).is_none());
    allocator.release(c);
}

#[test]
fn aliased_range_is_reused_once_every_member_is_released() {
    let (_, allocator) = discrete();
    let base = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    let alias = allocator.allocate_overlapping(&base, &requirements(MIB)).unwrap();
    allocator
        .declare_transient_alias(&base, &alias, Some(DisjointLifetime::new(0, 1)))
        .unwrap();
    let offset = base.offset();

    allocator.release(alias);
    let blocked = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_ne!(blocked.offset(), offset);

    allocator.release(base);
    let reused = allocator.request_memory(&requirements(MIB), MemoryUsage::Data).unwrap();
    assert_eq!(reused.offset(), offset);

    allocator.release(blocked);
    allocator.release(reused);
}
