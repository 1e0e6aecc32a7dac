//! # Robata
//!
//! A continuous-batching scheduler for LLM inference: it decides which
//! generation requests run together in each model step, keeps the KV cache
//! within budget, and streams generated tokens back to each requester.
//!
//! ## Overview
//!
//! Requests ("sequences") arrive at arbitrary times and have arbitrary
//! lengths. Instead of waiting for a fixed group to finish, the scheduler
//! re-forms batches at every step, so a sequence that finishes early frees its
//! place immediately and new sequences join as soon as capacity allows.
//!
//! Every sequence goes through two kinds of steps:
//!
//! - **prefill** - the whole prompt is processed in one pass and the sequence
//!   receives a KV cache slot
//! - **decode** - one token is generated per step until `max_new_tokens` is
//!   reached or the model emits a stop token
//!
//! ## Architecture
//!
//! ### Admission
//!
//! [`ContinuousBatcher::submit`] validates a [`SequenceSpec`] and places the
//! sequence in the prefill queue. Queues are ordered by priority, then
//! arrival, then admission order.
//!
//! ### Control Loop
//!
//! A background task wakes on submissions, on a periodic tick and on explicit
//! notifications. Each wake-up forms at most one prefill batch (respecting
//! the batch size, the token budget and `min_batch_size`, which is waived
//! once the oldest pending sequence has waited `max_wait_time`) and at most
//! one decode batch, then hands them to the workers without blocking.
//!
//! ### KV Cache
//!
//! [`kv_cache::KvCacheManager`] tracks a fixed pool of slots against a token
//! budget. When the pool is full it evicts slots chosen by a pluggable
//! [`kv_cache::EvictionPolicy`] (LRU by default). A sequence whose slot was
//! evicted goes back to prefill and keeps what it already generated.
//!
//! ### Batch Processing
//!
//! [`processor::BatchProcessor`] runs batches through a user-supplied
//! [`processor::ModelExecutor`], streams tokens, and completes or requeues
//! each member independently.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use robata::{Batch, BatchPhase, ContinuousBatcher, ExecutorError, SchedulerConfig, SequenceSpec};
//! use robata::processor::{BatchProcessor, ModelExecutor, StepOutput};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ModelExecutor for Echo {
//!     async fn execute(&self, batch: &Batch) -> Result<Vec<StepOutput>, ExecutorError> {
//!         Ok(batch.sequences().iter().map(|sequence| match batch.phase() {
//!             BatchPhase::Prefill => StepOutput::Prefilled,
//!             BatchPhase::Decode => StepOutput::Token {
//!                 token_id: sequence.token_count() as u32,
//!                 stop: false,
//!             },
//!         }).collect())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let batcher = Arc::new(ContinuousBatcher::new(SchedulerConfig::default()).unwrap());
//! batcher.start().await.unwrap();
//! let workers = BatchProcessor::new(batcher.clone(), Echo).spawn_workers(2).await;
//!
//! let handle = batcher.submit(SequenceSpec::new(vec![1, 2, 3], 4)).await.unwrap();
//! let (tokens, completion) = handle.into_stream().collect_all().await;
//! assert_eq!(tokens.len(), 4);
//! assert!(completion.unwrap().is_success());
//!
//! batcher.stop().await;
//! workers.shutdown().await;
//! # }
//! ```

mod batch;
mod batcher;
mod communication;
mod core;
mod error;
mod queue;
mod sequence;

pub mod config;
pub mod kv_cache;
pub mod processor;
pub mod sync;

pub use batch::{Batch, BatchId, BatchPhase};
pub use batcher::{ContinuousBatcher, SchedulerStats};
pub use communication::{Completion, SequenceEvent, SequenceStream, Token};
pub use config::{SchedulerConfig, SubmitMode};
pub use error::{
    AllocationError,
    ConfigError,
    ExecutorError,
    SchedulerError,
    SequenceError,
    SubmissionError,
};
pub use queue::AdmissionQueue;
pub use sequence::{Sequence, SequenceHandle, SequenceId, SequenceSpec, SequenceState};

#[cfg(test)]
pub(crate) mod testing;
