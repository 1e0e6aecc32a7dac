use std::fmt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use crate::sequence::SequenceId;

/// Identifier of a slot; slot ids are `0..slot_count` and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// One unit of the cache pool.
///
/// Access order is tracked with a logical clock owned by the manager rather
/// than wall time, so two touches in the same instant still order strictly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    pub(crate) id: SlotId,
    pub(crate) owner: Option<SequenceId>,
    pub(crate) owner_priority: u32,
    pub(crate) token_count: usize,
    pub(crate) last_access: Option<Instant>,
    pub(crate) access_tick: u64,
    pub(crate) allocated_tick: u64,
}

impl CacheSlot {
    pub(crate) fn new(id: SlotId) -> Self {
        Self {
            id,
            owner: None,
            owner_priority: 0,
            token_count: 0,
            last_access: None,
            access_tick: 0,
            allocated_tick: 0,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn owner(&self) -> Option<SequenceId> {
        self.owner
    }

    pub fn owner_priority(&self) -> u32 {
        self.owner_priority
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn last_access(&self) -> Option<Instant> {
        self.last_access
    }

    pub fn access_tick(&self) -> u64 {
        self.access_tick
    }

    pub fn allocated_tick(&self) -> u64 {
        self.allocated_tick
    }

    pub fn in_use(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn assign(&mut self, owner: SequenceId, priority: u32, tokens: usize, tick: u64) {
        self.owner = Some(owner);
        self.owner_priority = priority;
        self.token_count = tokens;
        self.allocated_tick = tick;
        self.touch(tick);
    }

    pub(crate) fn touch(&mut self, tick: u64) {
        self.access_tick = tick;
        self.last_access = Some(Instant::now());
    }

    /// Free the slot, returning the tokens it held.
    pub(crate) fn clear(&mut self) -> usize {
        let tokens = self.token_count;
        self.owner = None;
        self.owner_priority = 0;
        self.token_count = 0;
        tokens
    }
}
