use async_trait::async_trait;
use crate::batch::Batch;
use crate::error::ExecutorError;

/// Per-sequence result of one executor step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// The prompt of a prefill member was processed.
    Prefilled,

    /// A decode member produced its next token. `stop` is set when the model
    /// itself decided the sequence is done (an end-of-sequence token).
    Token {
        token_id: u32,
        stop: bool,
    },

    /// This member failed; the rest of the batch is unaffected.
    Failed(ExecutorError),
}

/// # ModelExecutor
///
/// The seam between the scheduler and whatever actually runs the model.
///
/// ```rust
/// use async_trait::async_trait;
/// use robata::{Batch, BatchPhase, ExecutorError};
/// use robata::processor::{ModelExecutor, StepOutput};
///
/// /// Always emits token 42.
/// struct Constant;
///
/// #[async_trait]
/// impl ModelExecutor for Constant {
///     async fn execute(&self, batch: &Batch) -> Result<Vec<StepOutput>, ExecutorError> {
///         Ok(batch.sequences().iter().map(|_| match batch.phase() {
///             BatchPhase::Prefill => StepOutput::Prefilled,
///             BatchPhase::Decode => StepOutput::Token { token_id: 42, stop: false },
///         }).collect())
///     }
/// }
/// ```
///
/// ## Contract
///
/// * The returned vector is aligned with `batch.sequences()`: one output per
///   member, in order. Members without an output are treated as failed.
/// * Prefill members should get [`StepOutput::Prefilled`], decode members
///   [`StepOutput::Token`]. Anything else fails that member.
/// * Returning `Err` fails every member of the batch.
///
/// The executor only reads the batch; state transitions, token streaming and
/// cache bookkeeping are done by the [`BatchProcessor`](super::BatchProcessor).
#[async_trait]
pub trait ModelExecutor: Send + Sync + 'static {
    async fn execute(&self, batch: &Batch) -> Result<Vec<StepOutput>, ExecutorError>;
}
