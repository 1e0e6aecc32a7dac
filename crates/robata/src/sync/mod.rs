//! Synchronization helpers.

mod rendezvous;

pub use rendezvous::Rendezvous;
