use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use crate::error::AllocationError;
use crate::sequence::SequenceId;
use super::policy::{EvictionPolicy, EvictionPolicyKind};
use super::slot::{CacheSlot, SlotId};

/// A slot reclaimed from its owner to make room for another request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedSlot {
    pub slot: SlotId,
    pub owner: SequenceId,
    pub tokens: usize,
}

/// A granted allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub slot: SlotId,
    /// Slots reclaimed to make this allocation fit, in eviction order
    pub evicted: Vec<EvictedSlot>,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub used: usize,
    pub total: usize,
    pub slots_in_use: usize,
    pub slot_count: usize,
}

struct SlotTable {
    slots: Vec<CacheSlot>,
    used_tokens: usize,
    /// Logical clock for access ordering
    clock: u64,
}

impl SlotTable {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.in_use())
    }

    fn owned(&self, slot: SlotId, owner: SequenceId) -> Option<usize> {
        self.slots.get(slot.0)
            .filter(|candidate| candidate.owner() == Some(owner))
            .map(|_| slot.0)
    }
}

/// Fixed-capacity pool of KV cache slots.
pub struct KvCacheManager {
    table: Mutex<SlotTable>,
    max_tokens: usize,
    policy: Box<dyn EvictionPolicy>,
}

impl KvCacheManager {
    pub fn new(max_tokens: usize, slot_count: usize, policy: EvictionPolicyKind) -> Self {
        Self::with_policy(max_tokens, slot_count, policy.build())
    }

    /// Build a pool that evicts according to a custom policy.
    pub fn with_policy(max_tokens: usize, slot_count: usize, policy: Box<dyn EvictionPolicy>) -> Self {
        let slots = (0..slot_count).map(|id| CacheSlot::new(SlotId(id))).collect();
        Self {
            table: Mutex::new(SlotTable {
                slots,
                used_tokens: 0,
                clock: 0,
            }),
            max_tokens,
            policy,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Allocate a slot holding `token_count` tokens for `sequence_id`.
    pub async fn allocate(&self, sequence_id: SequenceId, token_count: usize) -> Result<Allocation, AllocationError> {
        self.allocate_with_priority(sequence_id, token_count, 0).await
    }

    /// Allocate, recording the owner's priority for priority-aware eviction.
    pub async fn allocate_with_priority(
        &self,
        sequence_id: SequenceId,
        token_count: usize,
        priority: u32,
    ) -> Result<Allocation, AllocationError> {
        if token_count > self.max_tokens {
            return Err(AllocationError::ExceedsCapacity {
                requested: token_count,
                capacity: self.max_tokens,
            });
        }

        let mut table = self.table.lock().await;
        let fits = table.used_tokens + token_count <= self.max_tokens;
        let evicted = match (fits, table.free_slot()) {
            (true, Some(_)) => vec![],
            (_, free) => {
                let plan = self.stage_evictions(&table, token_count, free.is_none(), None)?;
                self.commit_evictions(&mut table, &plan)
            }
        };

        let index = table.free_slot().ok_or(AllocationError::NoFreeSlot)?;
        let tick = table.tick();
        table.slots[index].assign(sequence_id, priority, token_count, tick);
        table.used_tokens += token_count;

        debug!(
            sequence = %sequence_id,
            slot = index,
            tokens = token_count,
            used = table.used_tokens,
            evicted = evicted.len(),
            "allocated kv slot"
        );
        Ok(Allocation {
            slot: SlotId(index),
            evicted,
        })
    }

    /// Free a slot. Releasing a slot that is already free does nothing.
    pub async fn release(&self, slot: SlotId) -> bool {
        let mut table = self.table.lock().await;
        let Some(entry) = table.slots.get_mut(slot.0) else {
            return false;
        };
        if !entry.in_use() {
            return false;
        }
        let freed = entry.clear();
        table.used_tokens -= freed;
        debug!(%slot, tokens = freed, used = table.used_tokens, "released kv slot");
        true
    }

    /// Free whichever slot `sequence_id` currently owns, if any.
    ///
    /// Owner-checked, so it is safe to call after the slot was evicted and
    /// handed to another sequence.
    pub async fn release_owned_by(&self, sequence_id: SequenceId) -> Option<SlotId> {
        let mut table = self.table.lock().await;
        let index = table.slots.iter().position(|slot| slot.owner() == Some(sequence_id))?;
        let freed = table.slots[index].clear();
        table.used_tokens -= freed;
        debug!(sequence = %sequence_id, slot = index, tokens = freed, used = table.used_tokens, "released kv slot");
        Some(SlotId(index))
    }

    /// Set the token count held by `slot` and refresh its access time.
    ///
    /// Growth that does not fit evicts other slots under the same
    /// all-or-nothing rule as allocation. Returns the slots evicted to make room.
    pub async fn update(
        &self,
        slot: SlotId,
        sequence_id: SequenceId,
        new_token_count: usize,
    ) -> Result<Vec<EvictedSlot>, AllocationError> {
        if new_token_count > self.max_tokens {
            return Err(AllocationError::ExceedsCapacity {
                requested: new_token_count,
                capacity: self.max_tokens,
            });
        }

        let mut table = self.table.lock().await;
        let index = table.owned(slot, sequence_id).ok_or(AllocationError::SlotLost(slot))?;
        let current = table.slots[index].token_count();

        let mut evicted = vec![];
        if new_token_count > current {
            let growth = new_token_count - current;
            if table.used_tokens + growth > self.max_tokens {
                let plan = self.stage_evictions(&table, growth, false, Some(slot))?;
                evicted = self.commit_evictions(&mut table, &plan);
            }
        }

        let tick = table.tick();
        let entry = &mut table.slots[index];
        entry.token_count = new_token_count;
        entry.touch(tick);
        table.used_tokens = table.used_tokens + new_token_count - current;
        Ok(evicted)
    }

    /// Whether `slot` is currently held by `sequence_id`.
    pub async fn owns(&self, slot: SlotId, sequence_id: SequenceId) -> bool {
        self.table.lock().await.owned(slot, sequence_id).is_some()
    }

    pub async fn stats(&self) -> CacheStats {
        let table = self.table.lock().await;
        CacheStats {
            used: table.used_tokens,
            total: self.max_tokens,
            slots_in_use: table.slots.iter().filter(|slot| slot.in_use()).count(),
            slot_count: table.slots.len(),
        }
    }

    /// Copy of every slot, for inspection.
    pub async fn snapshot(&self) -> Vec<CacheSlot> {
        self.table.lock().await.slots.clone()
    }

    /// Pick victims so that `needed` more tokens fit (and, when `need_slot`,
    /// a slot becomes free). Nothing is mutated here.
    fn stage_evictions(
        &self,
        table: &SlotTable,
        needed: usize,
        need_slot: bool,
        protected: Option<SlotId>,
    ) -> Result<Vec<usize>, AllocationError> {
        let headroom = self.max_tokens - table.used_tokens;
        let mut candidates: Vec<&CacheSlot> = table.slots.iter()
            .filter(|slot| slot.in_use() && Some(slot.id()) != protected)
            .collect();
        self.policy.order(&mut candidates);

        let satisfied = |freed: usize, victims: usize| {
            headroom + freed >= needed && (!need_slot || victims > 0)
        };

        let mut plan = vec![];
        let mut freed = 0;
        for candidate in &candidates {
            if satisfied(freed, plan.len()) {
                break;
            }
            freed += candidate.token_count();
            plan.push(candidate.id().0);
        }

        if satisfied(freed, plan.len()) {
            return Ok(plan);
        }
        if headroom + freed < needed {
            Err(AllocationError::InsufficientCapacity {
                needed: needed - headroom,
                freeable: freed,
            })
        } else {
            Err(AllocationError::NoFreeSlot)
        }
    }

    fn commit_evictions(&self, table: &mut SlotTable, plan: &[usize]) -> Vec<EvictedSlot> {
        plan.iter().filter_map(|&index| {
            let slot = &mut table.slots[index];
            let owner = slot.owner()?;
            let tokens = slot.clear();
            table.used_tokens -= tokens;
            warn!(
                slot = index,
                sequence = %owner,
                tokens,
                policy = self.policy.name(),
                "evicted kv slot"
            );
            Some(EvictedSlot {
                slot: SlotId(index),
                owner,
                tokens,
            })
        }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tokio::test;

    fn lru(max_tokens: usize, slots: usize) -> KvCacheManager {
        KvCacheManager::new(max_tokens, slots, EvictionPolicyKind::Lru)
    }

    async fn assert_capacity_invariant(manager: &KvCacheManager) {
        let snapshot = manager.snapshot().await;
        let held: usize = snapshot.iter().filter(|slot| slot.in_use()).map(|slot| slot.token_count()).sum();
        let stats = manager.stats().await;
        assert_eq!(held, stats.used, "used_tokens must match the slots");
        assert!(stats.used <= stats.total, "capacity exceeded: {} > {}", stats.used, stats.total);

        let owners: Vec<_> = snapshot.iter().filter_map(|slot| slot.owner()).collect();
        let unique: HashSet<_> = owners.iter().collect();
        assert_eq!(owners.len(), unique.len(), "a sequence holds two slots");
    }

    #[test]
    async fn test_allocate_within_capacity() {
        let manager = lru(100, 4);
        let first = manager.allocate(SequenceId::new(), 40).await.unwrap();
        let second = manager.allocate(SequenceId::new(), 60).await.unwrap();

        assert_ne!(first.slot, second.slot);
        assert!(first.evicted.is_empty() && second.evicted.is_empty());
        assert_eq!(
            manager.stats().await,
            CacheStats { used: 100, total: 100, slots_in_use: 2, slot_count: 4 }
        );
        assert_capacity_invariant(&manager).await;
    }

    #[test]
    async fn test_eviction_takes_least_recently_used() {
        let manager = lru(100, 4);
        let older = SequenceId::new();
        let newer = SequenceId::new();
        let old_slot = manager.allocate(older, 60).await.unwrap().slot;
        manager.allocate(newer, 30).await.unwrap();

        let allocation = manager.allocate(SequenceId::new(), 50).await.unwrap();

        assert_eq!(allocation.evicted, vec![EvictedSlot { slot: old_slot, owner: older, tokens: 60 }]);
        assert!(allocation.evicted.iter().map(|e| e.tokens).sum::<usize>() >= 50);
        assert_eq!(manager.stats().await.used, 80);
        assert_capacity_invariant(&manager).await;
    }

    #[test]
    async fn test_update_refreshes_lru_order() {
        let manager = lru(100, 4);
        let first = SequenceId::new();
        let second = SequenceId::new();
        let first_slot = manager.allocate(first, 60).await.unwrap().slot;
        let second_slot = manager.allocate(second, 30).await.unwrap().slot;

        // touching the older slot makes the 30-token slot the LRU victim
        manager.update(first_slot, first, 61).await.unwrap();
        let allocation = manager.allocate(SequenceId::new(), 20).await.unwrap();

        assert_eq!(allocation.evicted.len(), 1);
        assert_eq!(allocation.evicted[0].slot, second_slot);
        assert_eq!(allocation.evicted[0].owner, second);
        assert!(manager.owns(first_slot, first).await);
        assert_capacity_invariant(&manager).await;
    }

    #[test]
    async fn test_eviction_spans_multiple_slots() {
        let manager = lru(100, 4);
        let a = manager.allocate(SequenceId::new(), 30).await.unwrap().slot;
        let b = manager.allocate(SequenceId::new(), 30).await.unwrap().slot;
        manager.allocate(SequenceId::new(), 40).await.unwrap();

        let allocation = manager.allocate(SequenceId::new(), 55).await.unwrap();
        let victims: Vec<_> = allocation.evicted.iter().map(|e| e.slot).collect();
        assert_eq!(victims, vec![a, b]);
        assert_eq!(manager.stats().await.used, 95);
        assert_capacity_invariant(&manager).await;
    }

    #[test]
    async fn test_failed_eviction_leaves_pool_untouched() {
        let manager = lru(100, 4);
        manager.allocate(SequenceId::new(), 60).await.unwrap();
        manager.allocate(SequenceId::new(), 30).await.unwrap();
        let before = manager.snapshot().await;

        let err = manager.allocate(SequenceId::new(), 150).await.unwrap_err();
        assert_eq!(err, AllocationError::ExceedsCapacity { requested: 150, capacity: 100 });
        assert_eq!(manager.snapshot().await, before);
        assert_eq!(manager.stats().await.used, 90);
    }

    #[test]
    async fn test_update_growth_evicts_other_slots() {
        let manager = lru(100, 4);
        let idle = SequenceId::new();
        let grower = SequenceId::new();
        let idle_slot = manager.allocate(idle, 50).await.unwrap().slot;
        let grower_slot = manager.allocate(grower, 40).await.unwrap().slot;

        let evicted = manager.update(grower_slot, grower, 95).await.unwrap();

        assert_eq!(evicted, vec![EvictedSlot { slot: idle_slot, owner: idle, tokens: 50 }]);
        assert!(manager.owns(grower_slot, grower).await);
        assert_eq!(manager.stats().await.used, 95);
        assert_capacity_invariant(&manager).await;
    }

    #[test]
    async fn test_update_beyond_capacity_is_rejected() {
        let manager = lru(100, 4);
        let owner = SequenceId::new();
        let slot = manager.allocate(owner, 40).await.unwrap().slot;
        manager.allocate(SequenceId::new(), 50).await.unwrap();
        let before = manager.snapshot().await;

        let err = manager.update(slot, owner, 101).await.unwrap_err();
        assert_eq!(err, AllocationError::ExceedsCapacity { requested: 101, capacity: 100 });
        assert_eq!(manager.snapshot().await, before);
    }

    #[test]
    async fn test_no_free_slot_evicts_one() {
        let manager = lru(1000, 2);
        let a = SequenceId::new();
        manager.allocate(a, 10).await.unwrap();
        manager.allocate(SequenceId::new(), 10).await.unwrap();

        let allocation = manager.allocate(SequenceId::new(), 10).await.unwrap();
        assert_eq!(allocation.evicted.len(), 1);
        assert_eq!(allocation.evicted[0].owner, a);
        assert_eq!(manager.stats().await.slots_in_use, 2);
    }

    #[test]
    async fn test_no_slots_at_all() {
        let manager = lru(100, 0);
        assert_eq!(manager.allocate(SequenceId::new(), 10).await, Err(AllocationError::NoFreeSlot));
    }

    #[test]
    async fn test_release_is_idempotent() {
        let manager = lru(100, 2);
        let owner = SequenceId::new();
        let slot = manager.allocate(owner, 40).await.unwrap().slot;

        assert!(manager.release(slot).await);
        assert!(!manager.release(slot).await);
        assert!(manager.release_owned_by(owner).await.is_none());
        assert!(!manager.release(SlotId(99)).await);
        assert_eq!(manager.stats().await.used, 0);
    }

    #[test]
    async fn test_release_owned_by_respects_new_owner() {
        let manager = lru(100, 1);
        let evicted = SequenceId::new();
        let current = SequenceId::new();
        manager.allocate(evicted, 60).await.unwrap();
        let slot = manager.allocate(current, 60).await.unwrap().slot;

        assert!(manager.release_owned_by(evicted).await.is_none());
        assert!(manager.owns(slot, current).await);
        assert_eq!(manager.release_owned_by(current).await, Some(slot));
    }

    #[test]
    async fn test_update_after_eviction_reports_lost_slot() {
        let manager = lru(100, 1);
        let first = SequenceId::new();
        let slot = manager.allocate(first, 60).await.unwrap().slot;
        manager.allocate(SequenceId::new(), 60).await.unwrap();

        assert_eq!(manager.update(slot, first, 61).await, Err(AllocationError::SlotLost(slot)));
        assert_capacity_invariant(&manager).await;
    }

    #[test]
    async fn test_update_shrinks_and_grows_accounting() {
        let manager = lru(100, 2);
        let owner = SequenceId::new();
        let slot = manager.allocate(owner, 10).await.unwrap().slot;

        manager.update(slot, owner, 11).await.unwrap();
        assert_eq!(manager.stats().await.used, 11);
        manager.update(slot, owner, 5).await.unwrap();
        assert_eq!(manager.stats().await.used, 5);
    }

    #[test]
    async fn test_priority_policy_spares_high_priority() {
        let manager = KvCacheManager::new(100, 4, EvictionPolicyKind::Priority);
        let important = SequenceId::new();
        let background = SequenceId::new();
        manager.allocate_with_priority(important, 50, 5).await.unwrap();
        manager.allocate_with_priority(background, 50, 1).await.unwrap();

        let allocation = manager.allocate_with_priority(SequenceId::new(), 30, 3).await.unwrap();
        assert_eq!(allocation.evicted[0].owner, background);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_keeps_invariants() {
        let manager = Arc::new(lru(500, 8));
        let handles: Vec<_> = (0..64).map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let owner = SequenceId::new();
                if let Ok(allocation) = manager.allocate(owner, 20 + (i % 5) * 20).await {
                    let _ = manager.update(allocation.slot, owner, 30 + (i % 5) * 20).await;
                    if i % 3 == 0 {
                        manager.release_owned_by(owner).await;
                    }
                }
                let stats = manager.stats().await;
                assert!(stats.used <= stats.total);
            })
        }).collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_capacity_invariant(&manager).await;
    }
}
