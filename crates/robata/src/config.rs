//! Scheduler configuration.
//!
//! All settings are static: they are read once when the
//! [`ContinuousBatcher`](crate::ContinuousBatcher) is constructed.

use std::collections::BTreeMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::ConfigError;
use crate::kv_cache::EvictionPolicyKind;

/// What `submit` does when the submission channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait for room in the channel.
    #[default]
    Block,
    /// Return [`SubmissionError::ChannelFull`](crate::SubmissionError::ChannelFull) immediately.
    FailFast,
}

/// Batching, admission and cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on sequences in any batch, applied on top of the per-phase limits.
    pub max_batch_size: usize,
    /// Maximum total tokens per batch; also the per-sequence token ceiling.
    pub max_tokens_per_batch: usize,
    /// Longest a pending sequence waits for `min_batch_size` to be reached.
    #[serde(with = "duration_ms", rename = "max_wait_time_ms")]
    pub max_wait_time: Duration,
    /// Pending sequences required before a prefill batch forms early.
    pub min_batch_size: usize,
    pub prefill_batch_size: usize,
    pub decode_batch_size: usize,

    /// When disabled every sequence has the same priority and admission is FIFO.
    pub enable_priority: bool,
    /// Maps a submitted priority class to its effective priority.
    /// Classes without an entry use their own value.
    pub priority_weights: BTreeMap<u32, u32>,

    pub max_cache_tokens: usize,
    /// Number of KV slots; defaults to twice `max_batch_size`.
    pub cache_slot_count: Option<usize>,
    pub eviction_policy: EvictionPolicyKind,

    pub submission_capacity: usize,
    pub dispatch_capacity: usize,
    pub submit_mode: SubmitMode,
    /// Failed allocations tolerated per sequence before it is cancelled.
    /// `None` retries forever.
    pub max_allocation_retries: Option<u32>,
    /// Times a sequence may lose its slot to eviction before it is cancelled.
    /// `None` requeues it forever.
    pub max_evictions: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            max_tokens_per_batch: 8192,
            max_wait_time: Duration::from_millis(50),
            min_batch_size: 1,
            prefill_batch_size: 32,
            decode_batch_size: 64,
            enable_priority: true,
            priority_weights: BTreeMap::new(),
            max_cache_tokens: 32768,
            cache_slot_count: None,
            eviction_policy: EvictionPolicyKind::Lru,
            submission_capacity: 1000,
            dispatch_capacity: 100,
            submit_mode: SubmitMode::Block,
            max_allocation_retries: None,
            max_evictions: None,
        }
    }
}

impl SchedulerConfig {
    /// Check the settings for values the control loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_batch_size", self.max_batch_size),
            ("max_tokens_per_batch", self.max_tokens_per_batch),
            ("min_batch_size", self.min_batch_size),
            ("prefill_batch_size", self.prefill_batch_size),
            ("decode_batch_size", self.decode_batch_size),
            ("max_cache_tokens", self.max_cache_tokens),
            ("cache_slot_count", self.slot_count()),
            ("submission_capacity", self.submission_capacity),
            ("dispatch_capacity", self.dispatch_capacity),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.max_wait_time.is_zero() {
            return Err(ConfigError::Zero("max_wait_time"));
        }
        if self.min_batch_size > self.prefill_limit() {
            return Err(ConfigError::MinBatchTooLarge {
                min: self.min_batch_size,
                limit: self.prefill_limit(),
            });
        }
        Ok(())
    }

    /// Member limit for prefill batches.
    pub fn prefill_limit(&self) -> usize {
        self.prefill_batch_size.min(self.max_batch_size)
    }

    /// Member limit for decode batches.
    pub fn decode_limit(&self) -> usize {
        self.decode_batch_size.min(self.max_batch_size)
    }

    pub fn slot_count(&self) -> usize {
        self.cache_slot_count.unwrap_or(self.max_batch_size * 2)
    }

    /// Largest `prompt + max_new_tokens` a single sequence may need.
    pub fn sequence_token_ceiling(&self) -> usize {
        self.max_tokens_per_batch.min(self.max_cache_tokens)
    }

    /// Period of the formation timer: half the maximum wait.
    pub fn tick_interval(&self) -> Duration {
        (self.max_wait_time / 2).max(Duration::from_millis(1))
    }

    /// Effective priority for a submitted priority class.
    pub fn effective_priority(&self, class: u32) -> u32 {
        if !self.enable_priority {
            return 0;
        }
        self.priority_weights.get(&class).copied().unwrap_or(class)
    }
}

mod duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde::ser::Error;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis())
            .map_err(|_| S::Error::custom(format!("duration {value:?} does not fit in u64 milliseconds")))?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
