//! Settings for the memory allocator
//!
//! Settings can be built in code or loaded from JSON. Every field has a default, so a JSON document only needs to
//! mention what it changes.

use crate::rhi::MapContention;
use failure::Fail;
use serde::Deserialize;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Knobs that control how the allocator sizes blocks and arbitrates mappings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatorSettings {
    /// Requests larger than this many bytes get a memory object of their own.
    pub dedicated_allocation_threshold: u64,

    /// Size, in bytes, of new pooled blocks on large heaps.
    pub preferred_block_size: u64,

    /// Heaps smaller than this many bytes use a fraction of their capacity as their block size.
    pub small_heap_threshold: u64,

    /// On small heaps, the block size is the heap capacity divided by this.
    pub small_heap_block_divisor: u64,

    /// Maximum number of live memory objects. Uses the device's limit when not set.
    pub max_memory_objects: Option<u32>,

    /// Whether type selection looks at how much of each heap is already committed.
    pub track_heap_budget: bool,

    /// What happens when two scopes try to map the same block at once.
    pub map_contention: MapContention,

    /// Whether one empty block per memory type is kept around for reuse instead of being destroyed.
    pub retain_empty_blocks: bool,
}

impl AllocatorSettings {
    /// Parses settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(json).map_err(SettingsError::Json)
    }

    /// Size of a pooled block for a heap with the given capacity.
    pub fn block_size_for_heap(&self, heap_capacity: u64) -> u64 {
        if heap_capacity < self.small_heap_threshold {
            heap_capacity / self.small_heap_block_divisor.max(1)
        } else {
            self.preferred_block_size
        }
    }
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        AllocatorSettings {
            dedicated_allocation_threshold: 32 * MIB,
            preferred_block_size: 256 * MIB,
            small_heap_threshold: 2 * GIB,
            small_heap_block_divisor: 8,
            max_memory_objects: None,
            track_heap_budget: true,
            map_contention: MapContention::Fail,
            retain_empty_blocks: true,
        }
    }
}

/// Failure type for loading settings.
#[derive(Debug, Fail)]
pub enum SettingsError {
    /// The settings document isn't valid JSON, or has fields of the wrong type.
    #[fail(display = "Could not parse allocator settings: {}", _0)]
    Json(#[fail(cause)] serde_json::Error),
}
