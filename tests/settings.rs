use matches::assert_matches;
use nova_memory::core::allocators::StrategyKind;
use nova_memory::rhi::MapContention;
use nova_memory::settings::{AllocatorSettings, SettingsError};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[test]
fn defaults() {
    let settings = AllocatorSettings::default();

    assert_eq!(settings.dedicated_allocation_threshold, 32 * MIB);
    assert_eq!(settings.preferred_block_size, 256 * MIB);
    assert_eq!(settings.max_memory_objects, None);
    assert!(settings.track_heap_budget);
    assert!(settings.retain_empty_blocks);
    assert_eq!(settings.map_contention, MapContention::Fail);
}

#[test]
fn empty_document_gives_defaults() {
    assert_eq!(AllocatorSettings::from_json("{}").unwrap(), AllocatorSettings::default());
}

#[test]
fn partial_document_overrides_only_what_it_mentions() {
    let settings = AllocatorSettings::from_json(
        r#"{
            "dedicatedAllocationThreshold": 1048576,
            "maxMemoryObjects": 64,
            "mapContention": "block"
        }"#,
    )
    .unwrap();

    assert_eq!(settings.dedicated_allocation_threshold, MIB);
    assert_eq!(settings.max_memory_objects, Some(64));
    assert_eq!(settings.map_contention, MapContention::Block);
    assert_eq!(settings.preferred_block_size, 256 * MIB);
}

#[test]
fn malformed_document_is_an_error() {
    assert_matches!(AllocatorSettings::from_json("{ nope"), Err(SettingsError::Json(_)));
    assert_matches!(
        AllocatorSettings::from_json(r#"{ "mapContention": "sometimes" }"#),
        Err(SettingsError::Json(_))
    );

    let err = AllocatorSettings::from_json(r#"{ "preferredBlockSize": "big" }"#).unwrap_err();
    assert!(err.to_string().starts_with("Could not parse allocator settings"));
}

#[test]
fn block_size_depends_on_heap_size() {
    let settings = AllocatorSettings::default();

    assert_eq!(settings.block_size_for_heap(8 * GIB), 256 * MIB);
    assert_eq!(settings.block_size_for_heap(2 * GIB), 256 * MIB);
    assert_eq!(settings.block_size_for_heap(GIB), 128 * MIB);
    assert_eq!(settings.block_size_for_heap(256 * MIB), 32 * MIB);
}

#[test]
fn strategy_kinds_use_camel_case_names() {
    assert_eq!(serde_json::to_string(&StrategyKind::FreeList).unwrap(), r#""freeList""#);
    assert_eq!(serde_json::from_str::<StrategyKind>(r#""linear""#).unwrap(), StrategyKind::Linear);
}
