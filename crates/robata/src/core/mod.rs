//! # Scheduler Core
//!
//! * [`worker`] - Background task handles used for the control loop and the
//!   batch workers: spawn, notify, and shut down gracefully.
//! * `batch` - The control loop itself, plus prefill/decode batch formation
//!   and non-blocking dispatch.
//! * `state` - State shared between the batcher, the loop and the workers:
//!   admission queues, the KV cache, and the registry of active sequences.
pub mod worker;
pub(crate) mod batch;
pub(crate) mod state;
