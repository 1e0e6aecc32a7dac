use std::fmt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use crate::sequence::{Sequence, SequenceId, SequenceState};

/// Identifier of a formed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Which step a batch executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    /// Process the whole prompt of each member in one pass
    Prefill,
    /// Advance each member by exactly one token
    Decode,
}

impl BatchPhase {
    /// Lifecycle state every member must be in.
    pub fn member_state(self) -> SequenceState {
        match self {
            BatchPhase::Prefill => SequenceState::Prefill,
            BatchPhase::Decode => SequenceState::Decode,
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPhase::Prefill => write!(f, "prefill"),
            BatchPhase::Decode => write!(f, "decode"),
        }
    }
}

/// # Batch
///
/// A transient group of sequences executed together in one step.
///
/// A batch owns its members while it is in flight; the batch processor takes
/// them back out with [`Batch::into_sequences`] once the executor returns.
/// Empty batches are never dispatched.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    phase: BatchPhase,
    sequences: Vec<Sequence>,
    total_tokens: usize,
    created_at: Instant,
}

impl Batch {
    pub fn new(id: BatchId, phase: BatchPhase) -> Self {
        Self {
            id,
            phase,
            sequences: vec![],
            total_tokens: 0,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Sum of `token_count` over the members.
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn push(&mut self, sequence: Sequence) {
        debug_assert_eq!(sequence.state(), self.phase.member_state());
        self.total_tokens += sequence.token_count();
        self.sequences.push(sequence);
    }

    /// Take a member back out, e.g. when its slot was evicted mid-formation.
    pub(crate) fn remove(&mut self, id: SequenceId) -> Option<Sequence> {
        let index = self.sequences.iter().position(|sequence| sequence.id() == id)?;
        let sequence = self.sequences.remove(index);
        self.total_tokens -= sequence.token_count();
        Some(sequence)
    }

    pub fn into_sequences(self) -> Vec<Sequence> {
        self.sequences
    }
}
