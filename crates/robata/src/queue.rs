//! # Admission Queues
//!
//! Priority queues deciding which sequence enters the next batch first.
//!
//! Ordering is strict: higher priority first, then earlier arrival, then
//! earlier admission number. The admission number is unique per sequence, so
//! the order is total and stays stable across any number of push/pop cycles.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use crate::sequence::Sequence;

/// Heap entry; the "greatest" entry is the one to admit next.
struct Ranked(Sequence);

impl Ranked {
    fn key(&self) -> (u32, Instant, u64) {
        (self.0.priority(), self.0.arrival(), self.0.admission())
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        let (priority, arrival, admission) = self.key();
        let (other_priority, other_arrival, other_admission) = other.key();
        priority.cmp(&other_priority)
            .then_with(|| other_arrival.cmp(&arrival))
            .then_with(|| other_admission.cmp(&admission))
    }
}

/// A priority-ordered pool of sequences.
///
/// Any number of tasks may `push`; the control loop is the only caller of
/// `pop_best`, which keeps formation bookkeeping race-free.
#[derive(Default)]
pub struct AdmissionQueue {
    heap: Mutex<BinaryHeap<Ranked>>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, sequence: Sequence) {
        self.heap.lock().await.push(Ranked(sequence));
    }

    /// Push several sequences under one lock acquisition.
    pub async fn extend(&self, sequences: impl IntoIterator<Item = Sequence>) {
        let mut heap = self.heap.lock().await;
        heap.extend(sequences.into_iter().map(Ranked));
    }

    pub async fn pop_best(&self) -> Option<Sequence> {
        self.heap.lock().await.pop().map(|ranked| ranked.0)
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }

    /// Arrival time of the longest-waiting sequence, regardless of priority.
    pub async fn oldest_arrival(&self) -> Option<Instant> {
        self.heap.lock().await.iter().map(|ranked| ranked.0.arrival()).min()
    }

    /// Remove everything, best first.
    pub async fn drain(&self) -> Vec<Sequence> {
        let mut heap = self.heap.lock().await;
        let mut drained = Vec::with_capacity(heap.len());
        while let Some(ranked) = heap.pop() {
            drained.push(ranked.0);
        }
        drained
    }
}
