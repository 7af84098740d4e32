use crate::rhi::{MemoryPropertyFlags, MemoryUsage};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// How much a usage wants or doesn't want each memory property
///
/// `required` flags are hard constraints: a memory type without all of them is never selected. `desired` and `avoided`
/// flags only affect the score of types that pass the hard constraints. Desired weights are positive, avoided weights
/// are negative.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct UsageWeights {
    /// Properties the memory type must have.
    pub required: MemoryPropertyFlags,

    /// Properties that make a memory type better, with their positive weight.
    pub desired: BTreeMap<MemoryPropertyFlags, i32>,

    /// Properties that make a memory type worse, with their negative weight.
    pub avoided: BTreeMap<MemoryPropertyFlags, i32>,
}

impl UsageWeights {
    /// The preset weights for a usage.
    pub fn for_usage(usage: MemoryUsage) -> Self {
        let mut weights = UsageWeights::default();

        match usage {
            MemoryUsage::Data => {
                weights.required = MemoryPropertyFlags::DEVICE_LOCAL;
                weights.avoided.insert(MemoryPropertyFlags::HOST_VISIBLE, -1);
            }
            MemoryUsage::Upload => {
                weights.required = MemoryPropertyFlags::HOST_VISIBLE;
                weights.avoided.insert(MemoryPropertyFlags::DEVICE_LOCAL, -1);
                weights.avoided.insert(MemoryPropertyFlags::HOST_CACHED, -1);
                weights.desired.insert(MemoryPropertyFlags::HOST_COHERENT, 1);
            }
            MemoryUsage::Download => {
                weights.required = MemoryPropertyFlags::HOST_VISIBLE;
                weights.desired.insert(MemoryPropertyFlags::HOST_CACHED, 2);
                weights.desired.insert(MemoryPropertyFlags::HOST_COHERENT, 1);
            }
            MemoryUsage::Dynamic => {
                weights.required = MemoryPropertyFlags::HOST_VISIBLE;
                weights.desired.insert(MemoryPropertyFlags::DEVICE_LOCAL, 3);
            }
        }

        weights
    }

    /// Whether a memory type with the given properties passes the hard constraints.
    pub fn accepts(&self, flags: MemoryPropertyFlags) -> bool {
        flags.contains(self.required)
    }

    /// Sum of the weights of every desired and avoided property `flags` has.
    ///
    /// A weight keyed by several flags only counts when the type has all of them.
    pub fn score(&self, flags: MemoryPropertyFlags) -> i32 {
        self.desired
            .iter()
            .chain(self.avoided.iter())
            .filter(|(flag, _)| flags.contains(**flag))
            .map(|(_, weight)| *weight)
            .sum()
    }
}

/// What a caller wants from memory: either a usage preset, or custom weights
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UsagePreference {
    /// Use the preset weights of a usage.
    Category(MemoryUsage),

    /// Use these weights instead of a preset.
    Custom(UsageWeights),
}

impl UsagePreference {
    /// The weights to score memory types with.
    pub fn weights(&self) -> Cow<'_, UsageWeights> {
        match self {
            UsagePreference::Category(usage) => Cow::Owned(UsageWeights::for_usage(*usage)),
            UsagePreference::Custom(weights) => Cow::Borrowed(weights),
        }
    }
}

impl From<MemoryUsage> for UsagePreference {
    fn from(usage: MemoryUsage) -> Self {
        UsagePreference::Category(usage)
    }
}

impl From<UsageWeights> for UsagePreference {
    fn from(weights: UsageWeights) -> Self {
        UsagePreference::Custom(weights)
    }
}
