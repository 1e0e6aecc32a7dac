//! # Batch Processing
//!
//! Runs formed batches through a [`ModelExecutor`] and feeds the results back
//! into the scheduler: prefilled sequences move on to decode, decoded tokens
//! are streamed to their submitters, and finished sequences are completed.
//!
//! Any number of workers may pull batches concurrently, see
//! [`BatchProcessor::spawn_workers`].

mod core_trait;
mod handler;

pub use core_trait::*;
pub use handler::{BatchProcessor, WorkerPool};
