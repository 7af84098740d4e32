use crate::memory::catalog::MemoryTypeCatalog;
use crate::memory::usage::{UsagePreference, UsageWeights};
use crate::rhi::{AllocationError, BudgetMode, BudgetStatus};
use std::cmp::Reverse;

/// The memory type picked for a request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Selection {
    /// Index of the memory type.
    pub memory_type: u32,

    /// Whether the type's heap had room for the request when it was selected.
    pub budget: BudgetStatus,
}

/// Picks a memory type for a request
///
/// Selection is deterministic:
///
/// 1. Only types in the request's memory type mask are considered.
/// 2. Types whose heap can't fit the request are dropped, unless budget tracking is off.
/// 3. Types missing a required property are dropped.
/// 4. The remaining types are scored by their desired and avoided properties. Ties go to the type whose heap has the
/// most remaining budget, then to the lowest type index.
/// 5. If nothing is left, the budget filter is relaxed once before giving up.
pub struct TypeSelector<'a> {
    catalog: &'a MemoryTypeCatalog,
}

impl<'a> TypeSelector<'a> {
    /// Creates a selector over the types in `catalog`.
    pub fn new(catalog: &'a MemoryTypeCatalog) -> Self {
        TypeSelector { catalog }
    }

    /// Selects the best memory type for a request.
    ///
    /// # Parameters
    ///
    /// * `memory_type_bits` - Bit `i` is set if type `i` may be used.
    /// * `preference` - The usage preset or custom weights to score types with.
    /// * `size` - Size of the request, in bytes, for the budget filter.
    /// * `budget` - Whether to filter by heap budget.
    pub fn select(
        &self,
        memory_type_bits: u32,
        preference: &UsagePreference,
        size: u64,
        budget: BudgetMode,
    ) -> Result<Selection, AllocationError> {
        let weights = preference.weights();

        if budget == BudgetMode::Enforced {
            if let Some(memory_type) = self.best_candidate(memory_type_bits, &weights, Some(size)) {
                return Ok(Selection {
                    memory_type,
                    budget: BudgetStatus::WithinBudget,
                });
            }
        }

        let memory_type = self
            .best_candidate(memory_type_bits, &weights, None)
            .ok_or(AllocationError::NoSuitableType)?;

        let status = if self.catalog.type_budget(memory_type).remaining() >= size {
            BudgetStatus::WithinBudget
        } else {
            BudgetStatus::Oversubscribed
        };

        if budget == BudgetMode::Enforced {
            log::warn!(
                "No memory type has {} bytes of budget left, oversubscribing memory type {}",
                size,
                memory_type
            );
        }

        Ok(Selection {
            memory_type,
            budget: status,
        })
    }

    /// Highest-scoring type that passes the filters. `size` is only checked against heap budgets if it's set.
    fn best_candidate(&self, memory_type_bits: u32, weights: &UsageWeights, size: Option<u64>) -> Option<u32> {
        self.catalog
            .types_supporting(memory_type_bits)
            .filter_map(|(index, memory_type)| {
                let remaining = self.catalog.heap_budget(memory_type.heap_index).remaining();

                if let Some(size) = size {
                    if size > remaining {
                        return None;
                    }
                }

                if !weights.accepts(memory_type.property_flags) {
                    return None;
                }

                Some((index, weights.score(memory_type.property_flags), remaining))
            })
            .max_by_key(|&(index, score, remaining)| (score, remaining, Reverse(index)))
            .map(|(index, _, _)| index)
    }
}
