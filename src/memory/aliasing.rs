use crate::memory::block::{AllocationId, BlockId};
use crate::memory::pool::SubAllocation;
use crate::rhi::AliasingError;
use crossbeam::sync::ShardedLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Proof that two resources sharing memory are never in use at the same time
///
/// Positions are points on whatever timeline the caller schedules work on, such as pass indices in a frame graph. The
/// allocator records the proof but doesn't enforce it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisjointLifetime {
    /// Last point where the previous occupant of the memory is accessed.
    pub previous_last_access: u64,

    /// First point where the next occupant writes to the memory.
    pub next_first_write: u64,
}

impl DisjointLifetime {
    pub fn new(previous_last_access: u64, next_first_write: u64) -> Self {
        DisjointLifetime {
            previous_last_access,
            next_first_write,
        }
    }

    /// Whether the previous occupant is done before the next one starts.
    pub fn is_consistent(&self) -> bool {
        self.previous_last_access < self.next_first_write
    }
}

/// Identifies an alias group. Ids are never reused.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct AliasGroupId(u64);

impl fmt::Display for AliasGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alias-group#{}", self.0)
    }
}

/// A sub-allocation that's part of an alias group.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasMember {
    pub allocation: AllocationId,
    pub block: BlockId,
    pub offset: u64,
    pub size: u64,
}

impl<'a> From<&'a SubAllocation> for AliasMember {
    fn from(allocation: &'a SubAllocation) -> Self {
        AliasMember {
            allocation: allocation.id(),
            block: allocation.block(),
            offset: allocation.offset(),
            size: allocation.size(),
        }
    }
}

/// A declared alias, as it was declared.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasAttestation {
    pub previous: AllocationId,
    pub next: AllocationId,
    pub proof: DisjointLifetime,
}

/// Sub-allocations that are allowed to share memory
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasGroup {
    pub id: AliasGroupId,
    pub members: Vec<AliasMember>,
    pub attestations: Vec<AliasAttestation>,
}

impl AliasGroup {
    pub fn contains(&self, allocation: AllocationId) -> bool {
        self.members.iter().any(|member| member.allocation == allocation)
    }
}

#[derive(Default)]
struct Registry {
    groups: HashMap<AliasGroupId, AliasGroup>,
    membership: HashMap<AllocationId, AliasGroupId>,
    next_group: u64,
}

impl Registry {
    fn new_group(&mut self) -> AliasGroupId {
        let id = AliasGroupId(self.next_group);
        self.next_group += 1;
        self.groups.insert(
            id,
            AliasGroup {
                id,
                members: vec![],
                attestations: vec![],
            },
        );

        id
    }

    fn add_member(&mut self, group: AliasGroupId, member: AliasMember) {
        if let Some(entry) = self.groups.get_mut(&group) {
            entry.members.push(member);
            self.membership.insert(member.allocation, group);
        }
    }

    /// Moves everything in `from` to `into`
    fn merge(&mut self, into: AliasGroupId, from: AliasGroupId) {
        let from = match self.groups.remove(&from) {
            Some(group) => group,
            None => return,
        };

        for member in &from.members {
            self.membership.insert(member.allocation, into);
        }

        if let Some(into) = self.groups.get_mut(&into) {
            into.members.extend(from.members);
            into.attestations.extend(from.attestations);
        }
    }
}

/// Records which sub-allocations may overlap
///
/// Overlapping sub-allocations can only be bound once they're in the same alias group, and they only get there with a
/// self-consistent [`DisjointLifetime`]. The registry is read on every bind and written only when aliases are declared
/// or released.
#[derive(Default)]
pub struct AliasingTracker {
    registry: ShardedLock<Registry>,
}

impl AliasingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `next` may reuse memory of `previous`.
    ///
    /// Both must overlap inside the same block, and `proof` must show that `previous` is done before `next` starts. If
    /// either is already in a group, the other joins it. If both are in different groups, the groups merge.
    pub fn register_alias(
        &self,
        previous: &SubAllocation,
        next: &SubAllocation,
        proof: Option<DisjointLifetime>,
    ) -> Result<AliasGroupId, AliasingError> {
        if previous.memory_type() != next.memory_type() || previous.block() != next.block() {
            return Err(AliasingError::DifferentBlocks);
        }
        if previous.id() == next.id() || !previous.overlaps(next) {
            return Err(AliasingError::NoOverlap);
        }

        let proof = match proof {
            Some(proof) if proof.is_consistent() => proof,
            _ => return Err(AliasingError::OverlapWithoutDisjointLifetimeProof),
        };

        let mut registry = self.write();
        let group = match (
            registry.membership.get(&previous.id()).copied(),
            registry.membership.get(&next.id()).copied(),
        ) {
            (Some(a), Some(b)) if a == b => a,
            (Some(a), Some(b)) => {
                registry.merge(a, b);
                a
            }
            (Some(group), None) => {
                registry.add_member(group, next.into());
                group
            }
            (None, Some(group)) => {
                registry.add_member(group, previous.into());
                group
            }
            (None, None) => {
                let group = registry.new_group();
                registry.add_member(group, previous.into());
                registry.add_member(group, next.into());
                group
            }
        };

        if let Some(entry) = registry.groups.get_mut(&group) {
            entry.attestations.push(AliasAttestation {
                previous: previous.id(),
                next: next.id(),
                proof,
            });
        }

        log::debug!(
            "{} aliases {} in {} ({} is done at {}, {} starts at {})",
            next.id(),
            previous.id(),
            group,
            previous.id(),
            proof.previous_last_access,
            next.id(),
            proof.next_first_write
        );

        Ok(group)
    }

    /// Takes a sub-allocation out of its group. A group with fewer than two members left is dissolved.
    pub fn remove_member(&self, allocation: AllocationId) {
        let mut registry = self.write();
        let group = match registry.membership.remove(&allocation) {
            Some(group) => group,
            None => return,
        };

        let dissolve = match registry.groups.get_mut(&group) {
            Some(entry) => {
                entry.members.retain(|member| member.allocation != allocation);
                entry.members.len() < 2
            }
            None => false,
        };

        if dissolve {
            if let Some(entry) = registry.groups.remove(&group) {
                for member in &entry.members {
                    registry.membership.remove(&member.allocation);
                }
                log::debug!("Dissolved {}", group);
            }
        }
    }

    /// Whether two sub-allocations are in the same alias group.
    pub fn same_group(&self, a: AllocationId, b: AllocationId) -> bool {
        let registry = self.read();
        match (registry.membership.get(&a), registry.membership.get(&b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// The group `allocation` belongs to, if any.
    pub fn group_of(&self, allocation: AllocationId) -> Option<AliasGroup> {
        let registry = self.read();
        registry
            .membership
            .get(&allocation)
            .and_then(|group| registry.groups.get(group))
            .cloned()
    }

    /// Every live alias group, in the order they were created.
    pub fn groups(&self) -> Vec<AliasGroup> {
        let mut groups: Vec<AliasGroup> = self.read().groups.values().cloned().collect();
        groups.sort_by_key(|group| group.id);
        groups
    }

    fn read(&self) -> crossbeam::sync::ShardedLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> crossbeam::sync::ShardedLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
