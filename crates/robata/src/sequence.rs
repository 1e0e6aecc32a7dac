//! # Sequences
//!
//! A [`Sequence`] is the unit of work moving through the scheduler: one
//! generation request with its prompt, the tokens generated so far and its
//! lifecycle state.
//!
//! Sequences are owned values. At any moment a sequence lives in exactly one
//! place (an admission queue, a batch, or a worker processing that batch),
//! which is what guarantees exactly-once batch membership. The small piece of
//! state that must be reachable from outside (the cancel flag and the event
//! channel) sits in a shared control block.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;
use crate::communication::{Completion, SequenceEvent, SequenceStream, Token};
use crate::error::SequenceError;
use crate::kv_cache::SlotId;

/// Unique identifier assigned to a sequence at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(Uuid);

impl SequenceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SequenceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Lifecycle of a sequence.
///
/// ```text
/// Pending -> Prefill -> Decode -> Complete
///    ^          |         |  ^
///    +----------+---------+  | (one step per token)
///                         +--+
/// any non-terminal state -> Cancelled
/// ```
///
/// The edges back to `Pending` are taken when a sequence loses its cache
/// slot (eviction, dispatch backpressure) and has to be prefilled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceState {
    Pending,
    Prefill,
    Decode,
    Complete,
    Cancelled,
}

impl SequenceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SequenceState::Complete | SequenceState::Cancelled)
    }

    pub fn can_transition_to(self, next: SequenceState) -> bool {
        use SequenceState::*;
        match (self, next) {
            (Complete | Cancelled, _) => false,
            (_, Cancelled) => true,
            (Pending, Prefill) => true,
            (Prefill, Decode | Pending | Complete) => true,
            (Decode, Decode | Pending | Complete) => true,
            _ => false,
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub prompt_tokens: Vec<u32>,
    pub max_new_tokens: usize,
    /// Priority class; mapped through `priority_weights` at submission.
    pub priority: u32,
}

impl SequenceSpec {
    pub fn new(prompt_tokens: Vec<u32>, max_new_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            max_new_tokens,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Largest token count the sequence can reach.
    pub fn token_ceiling(&self) -> usize {
        self.prompt_tokens.len() + self.max_new_tokens
    }
}

/// State shared between a sequence, its handle and the active registry.
#[derive(Debug)]
pub(crate) struct SequenceControl {
    cancelled: AtomicBool,
    generated: AtomicUsize,
    events: mpsc::UnboundedSender<SequenceEvent>,
}

impl SequenceControl {
    pub(crate) fn new(events: mpsc::UnboundedSender<SequenceEvent>) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            generated: AtomicUsize::new(0),
            events,
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    /// Deliver an event; a consumer that went away is not an error.
    pub(crate) fn emit(&self, event: SequenceEvent) {
        if self.events.send(event).is_err() {
            debug!("sequence stream receiver dropped; discarding event");
        }
    }
}

/// Caller-side handle returned by `submit`.
pub struct SequenceHandle {
    id: SequenceId,
    stream: Option<SequenceStream>,
    control: Arc<SequenceControl>,
    notifier: Arc<Notify>,
}

impl SequenceHandle {
    pub(crate) fn new(
        id: SequenceId,
        stream: SequenceStream,
        control: Arc<SequenceControl>,
        notifier: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            stream: Some(stream),
            control,
            notifier,
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Request cancellation. It takes effect the next time the scheduler
    /// touches the sequence; a batch already executing is not interrupted.
    pub fn cancel(&self) {
        self.control.cancel();
        self.notifier.notify_one();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Take the event stream. Returns `None` if it was already taken.
    pub fn take_stream(&mut self) -> Option<SequenceStream> {
        self.stream.take()
    }

    /// Consume the handle, keeping only the event stream.
    pub fn into_stream(mut self) -> SequenceStream {
        match self.stream.take() {
            Some(stream) => stream,
            // the only way to lose the stream is take_stream, so hand back a closed one
            None => SequenceStream::new(mpsc::unbounded_channel().1),
        }
    }
}

/// A generation request inside the scheduler.
#[derive(Debug)]
pub struct Sequence {
    id: SequenceId,
    /// Admission order, the last ordering tie-break
    admission: u64,
    prompt_tokens: Vec<u32>,
    max_new_tokens: usize,
    priority: u32,
    arrival: Instant,

    state: SequenceState,
    generated: Vec<u32>,
    slot: Option<SlotId>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<SequenceError>,

    allocation_retries: u32,
    evictions: u32,

    control: Arc<SequenceControl>,
}

impl Sequence {
    pub(crate) fn new(
        spec: SequenceSpec,
        priority: u32,
        admission: u64,
        control: Arc<SequenceControl>,
    ) -> Self {
        Self {
            id: SequenceId::new(),
            admission,
            prompt_tokens: spec.prompt_tokens,
            max_new_tokens: spec.max_new_tokens,
            priority,
            arrival: Instant::now(),
            state: SequenceState::Pending,
            generated: vec![],
            slot: None,
            started_at: None,
            finished_at: None,
            error: None,
            allocation_retries: 0,
            evictions: 0,
            control,
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn admission(&self) -> u64 {
        self.admission
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn prompt_tokens(&self) -> &[u32] {
        &self.prompt_tokens
    }

    pub fn generated_tokens(&self) -> &[u32] {
        &self.generated
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Prompt plus generated tokens.
    pub fn token_count(&self) -> usize {
        self.prompt_tokens.len() + self.generated.len()
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn error(&self) -> Option<&SequenceError> {
        self.error.as_ref()
    }

    pub fn allocation_retries(&self) -> u32 {
        self.allocation_retries
    }

    /// How many times the sequence lost its slot and went back to `Pending`.
    pub fn evictions(&self) -> u32 {
        self.evictions
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn has_reached_limit(&self) -> bool {
        self.generated.len() >= self.max_new_tokens
    }

    pub(crate) fn control(&self) -> &Arc<SequenceControl> {
        &self.control
    }

    fn transition(&mut self, next: SequenceState) -> Result<(), SequenceError> {
        if !self.state.can_transition_to(next) {
            return Err(SequenceError::InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }

    /// `Pending -> Prefill` once a slot has been granted.
    pub(crate) fn begin_prefill(&mut self, slot: SlotId) -> Result<(), SequenceError> {
        self.transition(SequenceState::Prefill)?;
        self.slot = Some(slot);
        self.allocation_retries = 0;
        self.started_at.get_or_insert_with(Instant::now);
        Ok(())
    }

    /// `Prefill -> Decode` after the executor processed the prompt.
    pub(crate) fn finish_prefill(&mut self) -> Result<(), SequenceError> {
        self.transition(SequenceState::Decode)
    }

    /// Back to `Pending` without a slot. `evicted` counts towards the
    /// starvation counter; dispatch backpressure does not.
    pub(crate) fn reset_to_pending(&mut self, evicted: bool) -> Result<(), SequenceError> {
        self.transition(SequenceState::Pending)?;
        self.slot = None;
        if evicted {
            self.evictions += 1;
        }
        Ok(())
    }

    pub(crate) fn record_allocation_failure(&mut self) -> u32 {
        self.allocation_retries += 1;
        self.allocation_retries
    }

    /// Append a generated token and emit it. `stop` marks a model-level stop.
    pub(crate) fn push_token(&mut self, token_id: u32, stop: bool) -> Result<Token, SequenceError> {
        self.transition(SequenceState::Decode)?;
        self.generated.push(token_id);
        self.control.generated.store(self.generated.len(), Ordering::SeqCst);
        let token = Token {
            id: token_id,
            index: self.generated.len() - 1,
            position: self.token_count() - 1,
            is_final: stop || self.has_reached_limit(),
        };
        self.control.emit(SequenceEvent::Token(token.clone()));
        Ok(token)
    }

    /// Record the terminal state locally. Reporting to the caller is done by
    /// the batcher's `complete`.
    pub(crate) fn finish(&mut self, error: Option<SequenceError>) -> Result<(), SequenceError> {
        let next = match error {
            None => SequenceState::Complete,
            Some(_) => SequenceState::Cancelled,
        };
        self.transition(next)?;
        self.error = error;
        self.finished_at = Some(Instant::now());
        Ok(())
    }
}

/// Build the terminal report from the shared control block.
pub(crate) fn completion_for(
    id: SequenceId,
    control: &SequenceControl,
    error: Option<SequenceError>,
) -> Completion {
    Completion {
        sequence_id: id,
        state: if error.is_some() { SequenceState::Cancelled } else { SequenceState::Complete },
        generated_tokens: control.generated(),
        error,
    }
}

#[cfg(test)]
pub(crate) fn test_sequence(prompt_len: usize, max_new_tokens: usize, priority: u32, admission: u64) -> Sequence {
    let (tx, _rx) = mpsc::unbounded_channel();
    test_sequence_with_events(prompt_len, max_new_tokens, priority, admission, tx)
}

#[cfg(test)]
pub(crate) fn test_sequence_with_events(
    prompt_len: usize,
    max_new_tokens: usize,
    priority: u32,
    admission: u64,
    events: mpsc::UnboundedSender<SequenceEvent>,
) -> Sequence {
    let spec = SequenceSpec::new((0..prompt_len as u32).collect(), max_new_tokens);
    Sequence::new(spec, priority, admission, Arc::new(SequenceControl::new(events)))
}
