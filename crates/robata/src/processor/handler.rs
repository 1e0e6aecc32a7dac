use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};
use crate::batch::{Batch, BatchPhase};
use crate::batcher::ContinuousBatcher;
use crate::core::worker::WorkerHandle;
use crate::error::{AllocationError, ExecutorError, SequenceError};
use crate::sequence::Sequence;
use crate::sync::Rendezvous;
use super::core_trait::{ModelExecutor, StepOutput};

/// # BatchProcessor
///
/// Executes batches pulled from a [`ContinuousBatcher`] and applies the
/// outcome to each member independently:
///
/// * prefill: the member moves to `Decode` and waits for its first token
///   (or completes right away when it may not generate anything)
/// * decode: the token is appended and streamed, the cache slot grows by one,
///   and the member either completes or goes back for another step
/// * failure or cancellation of one member never affects the others
pub struct BatchProcessor<E> {
    batcher: Arc<ContinuousBatcher>,
    executor: Arc<E>,
}

impl<E> Clone for BatchProcessor<E> {
    fn clone(&self) -> Self {
        Self {
            batcher: self.batcher.clone(),
            executor: self.executor.clone(),
        }
    }
}

/// Running batch workers. Dropping the pool shuts the workers down.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker and wait for in-flight batches to finish.
    pub async fn shutdown(mut self) {
        for worker in &mut self.workers {
            worker.stop().await;
        }
    }
}

impl<E: ModelExecutor> BatchProcessor<E> {
    pub fn new(batcher: Arc<ContinuousBatcher>, executor: E) -> Self {
        Self {
            batcher,
            executor: Arc::new(executor),
        }
    }

    pub fn batcher(&self) -> &Arc<ContinuousBatcher> {
        &self.batcher
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Execute one batch and settle every member.
    pub async fn process(&self, batch: Batch) {
        let (id, phase, size) = (batch.id(), batch.phase(), batch.len());
        let outputs = match self.executor.execute(&batch).await {
            Ok(outputs) => {
                if outputs.len() != size {
                    warn!(batch = %id, expected = size, got = outputs.len(), "executor output count mismatch");
                }
                outputs
            }
            Err(err) => {
                warn!(batch = %id, %phase, error = %err, "executor failed the whole batch");
                vec![StepOutput::Failed(err); size]
            }
        };
        debug!(batch = %id, %phase, size, "executed batch");

        let mut outputs = outputs.into_iter();
        for sequence in batch.into_sequences() {
            let output = outputs.next().unwrap_or_else(|| {
                StepOutput::Failed(ExecutorError::new("no output for sequence"))
            });
            self.settle(phase, sequence, output).await;
        }
    }

    /// Pull and process batches until the batcher stops.
    pub async fn run(&self) {
        while let Ok(batch) = self.batcher.next_batch().await {
            self.process(batch).await;
        }
    }

    /// Spawn `workers` concurrent batch workers.
    ///
    /// Returns once every worker is up and about to pull its first batch.
    pub async fn spawn_workers(&self, workers: usize) -> WorkerPool {
        let ready = Arc::new(Rendezvous::new(workers + 1));
        let handles = (0..workers).map(|index| {
            let processor = self.clone();
            let ready = ready.clone();
            WorkerHandle::new(move |running, notifier| {
                tokio::spawn(async move {
                    ready.arrive().await;
                    debug!(worker = index, "batch worker started");
                    while running.load(Ordering::SeqCst) {
                        tokio::select! {
                            next = processor.batcher.next_batch() => match next {
                                Ok(batch) => processor.process(batch).await,
                                Err(_) => break,
                            },
                            _ = notifier.notified() => {},
                        }
                    }
                    debug!(worker = index, "batch worker stopped");
                })
            })
        }).collect();
        ready.arrive().await;
        WorkerPool { workers: handles }
    }

    async fn settle(&self, phase: BatchPhase, mut sequence: Sequence, output: StepOutput) {
        let state = self.batcher.state();
        if sequence.is_cancelled() {
            state.finish(sequence, Some(SequenceError::Cancelled)).await;
            return;
        }

        match (phase, output) {
            (_, StepOutput::Failed(err)) => {
                warn!(sequence = %sequence.id(), error = %err, "sequence failed");
                state.finish(sequence, Some(SequenceError::Executor(err))).await;
            }
            (BatchPhase::Prefill, StepOutput::Prefilled) => {
                if !self.holds_slot(&sequence).await {
                    state.requeue_pending(sequence, true).await;
                    return;
                }
                if let Err(err) = sequence.finish_prefill() {
                    state.finish(sequence, Some(err)).await;
                    return;
                }
                if sequence.has_reached_limit() {
                    state.finish(sequence, None).await;
                } else {
                    state.requeue_decode(sequence).await;
                }
            }
            (BatchPhase::Decode, StepOutput::Token { token_id, stop }) => {
                let token = match sequence.push_token(token_id, stop) {
                    Ok(token) => token,
                    Err(err) => {
                        state.finish(sequence, Some(err)).await;
                        return;
                    }
                };
                if token.is_final {
                    state.finish(sequence, None).await;
                    return;
                }
                self.grow_slot(sequence).await;
            }
            (phase, output) => {
                let err = ExecutorError::new(format!("unexpected {output:?} for a {phase} step"));
                state.finish(sequence, Some(SequenceError::Executor(err))).await;
            }
        }
    }

    /// Account for the token just generated, then queue the next step.
    async fn grow_slot(&self, sequence: Sequence) {
        let state = self.batcher.state();
        let Some(slot) = sequence.slot() else {
            state.requeue_pending(sequence, true).await;
            return;
        };
        match state.kv_cache.update(slot, sequence.id(), sequence.token_count()).await {
            Ok(evicted) => {
                if !evicted.is_empty() {
                    debug!(sequence = %sequence.id(), evicted = evicted.len(), "slot growth evicted other sequences");
                }
                state.requeue_decode(sequence).await;
            }
            Err(AllocationError::SlotLost(_)) => state.requeue_pending(sequence, true).await,
            Err(err) => {
                debug!(sequence = %sequence.id(), error = %err, "slot cannot grow; back to prefill");
                state.requeue_pending(sequence, false).await;
            }
        }
    }

    async fn holds_slot(&self, sequence: &Sequence) -> bool {
        match sequence.slot() {
            Some(slot) => self.batcher.kv_cache().owns(slot, sequence.id()).await,
            None => false,
        }
    }
}
