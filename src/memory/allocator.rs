use crate::core::allocators::StrategyKind;
use crate::memory::aliasing::{AliasGroup, AliasGroupId, AliasingTracker, DisjointLifetime};
use crate::memory::catalog::MemoryTypeCatalog;
use crate::memory::mapping::{HostMapping, MapMode, MappingManager, PersistentMapping, TransientMapping};
use crate::memory::pool::{AllocatorStatistics, BlockAllocator, SubAllocation};
use crate::memory::selector::TypeSelector;
use crate::memory::usage::UsagePreference;
use crate::rhi::{
    AliasingError, AllocationError, BudgetMode, CatalogError, Device, MappingError, MemoryRequirements,
};
use crate::settings::AllocatorSettings;
use std::ops::Range;
use std::sync::Arc;

/// Everything the allocator needs to know about a request for memory.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRequest {
    /// Size, alignment, and allowed memory types of the memory.
    pub requirements: MemoryRequirements,

    /// How the memory will be used.
    pub usage: UsagePreference,

    /// What kind of block to allocate from. Ignored for dedicated allocations.
    pub strategy: StrategyKind,

    /// Whether to take heap budgets into account. Falls back to the allocator's settings when not set.
    pub budget: Option<BudgetMode>,
}

impl MemoryRequest {
    pub fn new(requirements: MemoryRequirements, usage: impl Into<UsagePreference>) -> Self {
        MemoryRequest {
            requirements,
            usage: usage.into(),
            strategy: StrategyKind::FreeList,
            budget: None,
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_budget(mut self, budget: BudgetMode) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Device memory allocator
///
/// Picks memory types, suballocates blocks, arbitrates host mappings, and tracks which sub-allocations may share
/// memory. Every method takes `&self`, so one allocator can be shared between threads.
///
/// # Example
///
/// ```
/// use nova_memory::memory::Allocator;
/// use nova_memory::rhi::headless::HeadlessDevice;
/// use nova_memory::rhi::{MemoryRequirements, MemoryUsage};
/// use nova_memory::settings::AllocatorSettings;
/// use std::sync::Arc;
///
/// let device = Arc::new(HeadlessDevice::discrete());
/// let allocator = Allocator::new(device, AllocatorSettings::default()).unwrap();
///
/// let requirements = MemoryRequirements { size: 1024, alignment: 256, memory_type_bits: !0 };
/// let staging = allocator.request_memory(&requirements, MemoryUsage::Upload).unwrap();
///
/// let mut mapping = allocator.map_transient(&staging, 0..1024).unwrap();
/// mapping.write_bytes(0, &[1, 2, 3, 4]).unwrap();
/// drop(mapping);
///
/// allocator.release(staging);
/// ```
pub struct Allocator<D: Device> {
    device: Arc<D>,
    catalog: Arc<MemoryTypeCatalog>,
    settings: AllocatorSettings,

    blocks: BlockAllocator<D>,
    aliases: AliasingTracker,
}

impl<D: Device> Allocator<D> {
    /// Creates an allocator for `device`, loading its memory properties.
    ///
    /// Fails with [`CatalogError::InvalidDevice`] if the device doesn't meet the minimum memory guarantees.
    pub fn new(device: Arc<D>, settings: AllocatorSettings) -> Result<Self, CatalogError> {
        let catalog = MemoryTypeCatalog::load(&device.get_memory_properties())?;
        Ok(Self::with_catalog(device, Arc::new(catalog), settings))
    }

    /// Creates an allocator with an already loaded catalog.
    ///
    /// Allocators that share a catalog share its heap budgets.
    pub fn with_catalog(device: Arc<D>, catalog: Arc<MemoryTypeCatalog>, settings: AllocatorSettings) -> Self {
        let blocks = BlockAllocator::new(Arc::clone(&device), Arc::clone(&catalog), settings.clone());

        Allocator {
            device,
            catalog,
            settings,
            blocks,
            aliases: AliasingTracker::new(),
        }
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn catalog(&self) -> &MemoryTypeCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &AllocatorSettings {
        &self.settings
    }

    /// Allocates memory for a request.
    ///
    /// If the selected memory type's heap runs out, that type is ruled out and selection runs again with the types
    /// that are left.
    pub fn request(&self, request: &MemoryRequest) -> Result<SubAllocation, AllocationError> {
        let requirements = &request.requirements;
        if requirements.size == 0 {
            return Err(AllocationError::ZeroSized);
        }

        let budget = request.budget.unwrap_or(if self.settings.track_heap_budget {
            BudgetMode::Enforced
        } else {
            BudgetMode::Ignored
        });

        let selector = TypeSelector::new(&self.catalog);
        let mut memory_type_bits = requirements.memory_type_bits;
        let mut last_error = None;

        loop {
            let selection = match selector.select(memory_type_bits, &request.usage, requirements.size, budget) {
                Ok(selection) => selection,
                Err(err) => return Err(last_error.unwrap_or(err)),
            };

            let result = self.blocks.allocate(
                selection.memory_type,
                requirements.size,
                requirements.alignment,
                request.strategy,
                selection.budget,
            );

            match result {
                Ok(allocation) => return Ok(allocation),
                Err(err @ AllocationError::HeapExhausted { .. }) | Err(err @ AllocationError::OutOfDeviceMemory) => {
                    log::warn!(
                        "Could not allocate {} bytes from memory type {} ({}), trying another type",
                        requirements.size,
                        selection.memory_type,
                        err
                    );

                    memory_type_bits &= !(1 << selection.memory_type);
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Allocates memory with the given requirements for a usage.
    pub fn request_memory(
        &self,
        requirements: &MemoryRequirements,
        usage: impl Into<UsagePreference>,
    ) -> Result<SubAllocation, AllocationError> {
        self.request(&MemoryRequest::new(*requirements, usage))
    }

    /// Allocates memory for a resource and binds it.
    pub fn allocate_for(
        &self,
        resource: &D::Resource,
        usage: impl Into<UsagePreference>,
    ) -> Result<SubAllocation, AllocationError> {
        let requirements = self.device.get_memory_requirements(resource);
        let allocation = self.request_memory(&requirements, usage)?;

        match self.bind(&allocation, resource) {
            Ok(()) => Ok(allocation),
            Err(err) => {
                self.release(allocation);
                Err(err)
            }
        }
    }

    /// Binds `resource` to `allocation`.
    ///
    /// Fails with [`AllocationError::AlreadyBound`] if something's already bound to `allocation`, and with
    /// [`AllocationError::UndeclaredAlias`] if `allocation` overlaps a live sub-allocation outside its alias group.
    pub fn bind(&self, allocation: &SubAllocation, resource: &D::Resource) -> Result<(), AllocationError> {
        let aliases = &self.aliases;
        self.blocks
            .bind(allocation, resource, |a, b| aliases.same_group(a, b))
    }

    /// Gives memory back to the allocator.
    ///
    /// Aliased memory is only reused once every sub-allocation sharing it is released.
    pub fn release(&self, allocation: SubAllocation) {
        self.aliases.remove_member(allocation.id());
        self.blocks.free(allocation);
    }

    /// Creates a sub-allocation over memory `base` already owns. See [`BlockAllocator::allocate_overlapping`].
    pub fn allocate_overlapping(
        &self,
        base: &SubAllocation,
        requirements: &MemoryRequirements,
    ) -> Result<SubAllocation, AllocationError> {
        self.blocks.allocate_overlapping(base, requirements)
    }

    /// Declares that `next` may reuse the memory of `previous`, because their lifetimes don't overlap.
    pub fn declare_transient_alias(
        &self,
        previous: &SubAllocation,
        next: &SubAllocation,
        proof: Option<DisjointLifetime>,
    ) -> Result<AliasGroupId, AliasingError> {
        self.aliases.register_alias(previous, next, proof)
    }

    /// The alias group `allocation` belongs to, if any.
    pub fn alias_group_of(&self, allocation: &SubAllocation) -> Option<AliasGroup> {
        self.aliases.group_of(allocation.id())
    }

    /// Every live alias group.
    pub fn alias_groups(&self) -> Vec<AliasGroup> {
        self.aliases.groups()
    }

    /// Maps `allocation` for host access.
    pub fn map_for<'s>(&'s self, allocation: &'s SubAllocation, mode: MapMode) -> Result<HostMapping<'s, D>, MappingError> {
        self.mappings().map_for(allocation, mode)
    }

    /// Maps the block `allocation` lives in until the block is destroyed.
    pub fn map_persistent<'s>(&'s self, allocation: &'s SubAllocation) -> Result<PersistentMapping<'s, D>, MappingError> {
        self.mappings().map_persistent(allocation)
    }

    /// Maps `range` of `allocation` until the returned guard is dropped.
    pub fn map_transient<'s>(
        &'s self,
        allocation: &'s SubAllocation,
        range: Range<u64>,
    ) -> Result<TransientMapping<'s, D>, MappingError> {
        self.mappings().map_transient(allocation, range)
    }

    /// Current usage of every memory type.
    pub fn statistics(&self) -> AllocatorStatistics {
        self.blocks.statistics()
    }

    /// Destroys every empty block.
    pub fn trim(&self) {
        self.blocks.trim();
    }

    /// Number of memory objects alive right now.
    pub fn live_memory_objects(&self) -> u32 {
        self.blocks.live_memory_objects()
    }

    fn mappings(&self) -> MappingManager<'_, D> {
        MappingManager::new(&self.blocks, self.settings.map_contention)
    }
}
