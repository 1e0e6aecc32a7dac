use serde::{Deserialize, Serialize};
use super::slot::CacheSlot;

/// Decides which in-use slots are reclaimed first when the pool is full.
///
/// The manager hands over every eviction candidate and takes victims from
/// the front of the reordered slice until the request fits. Implementations
/// only reorder; they never mutate slots.
///
/// # Example
///
/// ```rust
/// use robata::kv_cache::{CacheSlot, EvictionPolicy};
///
/// /// Reclaim the largest slots first.
/// struct LargestFirst;
///
/// impl EvictionPolicy for LargestFirst {
///     fn name(&self) -> &'static str {
///         "largest-first"
///     }
///
///     fn order(&self, candidates: &mut [&CacheSlot]) {
///         candidates.sort_by_key(|slot| std::cmp::Reverse(slot.token_count()));
///     }
/// }
/// ```
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sort `candidates` so that the first element is evicted first.
    fn order(&self, candidates: &mut [&CacheSlot]);
}

/// Least recently accessed first.
#[derive(Debug, Default, Clone, Copy)]
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn order(&self, candidates: &mut [&CacheSlot]) {
        candidates.sort_by_key(|slot| slot.access_tick());
    }
}

/// Oldest allocation first, regardless of later access.
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn order(&self, candidates: &mut [&CacheSlot]) {
        candidates.sort_by_key(|slot| slot.allocated_tick());
    }
}

/// Lowest owner priority first, least recently accessed within a priority.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityPolicy;

impl EvictionPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn order(&self, candidates: &mut [&CacheSlot]) {
        candidates.sort_by_key(|slot| (slot.owner_priority(), slot.access_tick()));
    }
}

/// Built-in policies selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    #[default]
    Lru,
    Fifo,
    Priority,
}

impl EvictionPolicyKind {
    pub fn build(self) -> Box<dyn EvictionPolicy> {
        match self {
            EvictionPolicyKind::Lru => Box::new(LruPolicy),
            EvictionPolicyKind::Fifo => Box::new(FifoPolicy),
            EvictionPolicyKind::Priority => Box::new(PriorityPolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::SlotId;
    use crate::sequence::SequenceId;

    fn slot(id: usize, priority: u32, allocated: u64, accessed: u64) -> CacheSlot {
        let mut slot = CacheSlot::new(SlotId(id));
        slot.assign(SequenceId::new(), priority, 10, allocated);
        slot.touch(accessed);
        slot
    }

    fn ordered(policy: &dyn EvictionPolicy, slots: &[CacheSlot]) -> Vec<usize> {
        let mut candidates: Vec<&CacheSlot> = slots.iter().collect();
        policy.order(&mut candidates);
        candidates.iter().map(|slot| slot.id().0).collect()
    }

    #[test]
    fn test_lru_orders_by_last_access() {
        let slots = [slot(0, 0, 1, 9), slot(1, 0, 2, 4), slot(2, 0, 3, 6)];
        assert_eq!(ordered(&LruPolicy, &slots), vec![1, 2, 0]);
    }

    #[test]
    fn test_fifo_orders_by_allocation() {
        let slots = [slot(0, 0, 5, 6), slot(1, 0, 2, 9), slot(2, 0, 3, 4)];
        assert_eq!(ordered(&FifoPolicy, &slots), vec![1, 2, 0]);
    }

    #[test]
    fn test_priority_orders_lowest_first_then_lru() {
        let slots = [slot(0, 3, 1, 1), slot(1, 1, 2, 8), slot(2, 1, 3, 5)];
        assert_eq!(ordered(&PriorityPolicy, &slots), vec![2, 1, 0]);
    }

    #[test]
    fn test_kind_builds_matching_policy() {
        assert_eq!(EvictionPolicyKind::Lru.build().name(), "lru");
        assert_eq!(EvictionPolicyKind::Fifo.build().name(), "fifo");
        assert_eq!(EvictionPolicyKind::Priority.build().name(), "priority");
        assert_eq!(EvictionPolicyKind::default(), EvictionPolicyKind::Lru);
    }
}
