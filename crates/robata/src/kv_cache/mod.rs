//! # KV Cache Manager
//!
//! A fixed pool of cache slots shared by every running sequence.
//!
//! The pool holds at most `max_cache_tokens` tokens across `N` slots. Slots
//! are created once at construction; allocation hands a free slot to a
//! sequence, decode steps grow it, and completion or eviction frees it.
//!
//! When a request does not fit, the manager stages evictions in the order
//! chosen by its [`EvictionPolicy`] and commits them only if the request can
//! then be granted. A failed attempt leaves the pool exactly as it was.
//!
//! All four operations (allocate, release, update, stats) go through a single
//! mutex over the slot table.

mod slot;
mod policy;
mod manager;

pub use slot::{CacheSlot, SlotId};
pub use policy::{EvictionPolicy, EvictionPolicyKind, FifoPolicy, LruPolicy, PriorityPolicy};
pub use manager::{Allocation, CacheStats, EvictedSlot, KvCacheManager};
