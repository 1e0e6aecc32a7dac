//! Error types for the scheduler.
//!
//! Each failure class is surfaced on a different path: submission failures go
//! straight back to the submitter, allocation failures are retried by the
//! control loop, and executor/cancellation failures end up on the affected
//! sequence's stream as part of its [`Completion`](crate::Completion).

use thiserror::Error;
use crate::kv_cache::SlotId;
use crate::sequence::SequenceState;

/// The scheduler is not accepting the submitted work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// `start` has not been called, or `stop` already ran.
    #[error("scheduler not running")]
    NotRunning,

    /// The submission channel is full and the scheduler is configured to fail fast.
    #[error("submission channel full")]
    ChannelFull,

    /// The sequence could never fit within the per-sequence token ceiling.
    #[error("sequence needs {requested} tokens, ceiling is {ceiling}")]
    ExceedsTokenBudget {
        requested: usize,
        ceiling: usize,
    },

    /// A sequence without prompt tokens has nothing to prefill.
    #[error("prompt is empty")]
    EmptyPrompt,
}

/// KV capacity could not be granted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// The request is larger than the whole cache.
    #[error("request for {requested} tokens exceeds cache capacity {capacity}")]
    ExceedsCapacity {
        requested: usize,
        capacity: usize,
    },

    /// Even evicting every candidate would not free enough tokens.
    #[error("could not free enough space: needed {needed}, freeable {freeable}")]
    InsufficientCapacity {
        needed: usize,
        freeable: usize,
    },

    /// Every slot is taken and none may be evicted.
    #[error("no free KV cache slots")]
    NoFreeSlot,

    /// The slot no longer belongs to the caller (it was evicted).
    #[error("slot {0} is no longer owned by the sequence")]
    SlotLost(SlotId),
}

/// Opaque failure reported by the model executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("executor error: {0}")]
pub struct ExecutorError(pub String);

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Terminal error attached to a cancelled sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// Explicit caller cancellation, or scheduler shutdown.
    #[error("sequence cancelled")]
    Cancelled,

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Allocation kept failing past the configured retry bound.
    #[error("allocation retries exhausted: {0}")]
    Allocation(#[from] AllocationError),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SequenceState,
        to: SequenceState,
    },
}

/// Scheduler-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler stopped")]
    Stopped,

    #[error("scheduler already running")]
    AlreadyRunning,
}

/// Rejected configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("min_batch_size {min} exceeds prefill batch limit {limit}")]
    MinBatchTooLarge {
        min: usize,
        limit: usize,
    },
}
