//! Device memory allocation
//!
//! [`Allocator`] is the entry point. Underneath it:
//!
//! * [`MemoryTypeCatalog`] knows the heaps and memory types of a device, and how much of each heap is committed
//! * [`TypeSelector`] picks a memory type for a request, scoring types by [`UsageWeights`]
//! * [`BlockAllocator`] creates memory blocks and carves sub-allocations out of them
//! * [`MappingManager`] hands out host mappings, one per block at a time
//! * [`AliasingTracker`] records which sub-allocations may share memory

mod aliasing;
mod allocator;
mod block;
mod catalog;
mod mapping;
mod pool;
mod selector;
mod usage;

pub use aliasing::{AliasAttestation, AliasGroup, AliasGroupId, AliasMember, AliasingTracker, DisjointLifetime};
pub use allocator::{Allocator, MemoryRequest};
pub use block::{AllocationId, BlockId};
pub use catalog::{HeapBudget, MemoryTypeCatalog};
pub use mapping::{HostMapping, MapMode, MappingManager, PersistentMapping, TransientMapping};
pub use pool::{AllocatorStatistics, BlockAllocator, MemoryTypeStatistics, SubAllocation};
pub use selector::{Selection, TypeSelector};
pub use usage::{UsagePreference, UsageWeights};
