use crate::error::SequenceError;
use crate::sequence::{SequenceId, SequenceState};

/// A single generated token, as seen by the stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token id produced by the executor
    pub id: u32,

    /// Zero-based index among the sequence's generated tokens
    pub index: usize,

    /// Absolute position in the sequence (prompt included)
    pub position: usize,

    /// Set on the last token the sequence will produce
    pub is_final: bool,
}

/// Terminal report for a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub sequence_id: SequenceId,

    /// Either [`SequenceState::Complete`] or [`SequenceState::Cancelled`]
    pub state: SequenceState,

    /// Number of tokens generated before the sequence ended
    pub generated_tokens: usize,

    /// Present whenever `state` is `Cancelled`
    pub error: Option<SequenceError>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a [`SequenceStream`](super::SequenceStream) yields.
///
/// Tokens arrive strictly in generation order, followed by exactly one
/// `Finished` event, after which the stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceEvent {
    Token(Token),
    Finished(Completion),
}
