use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use crate::batch::Batch;
use crate::communication::SequenceStream;
use crate::config::{SchedulerConfig, SubmitMode};
use crate::core::batch::scheduling_loop;
use crate::core::state::SchedulerState;
use crate::core::worker::WorkerHandle;
use crate::error::{ConfigError, SchedulerError, SequenceError, SubmissionError};
use crate::kv_cache::KvCacheManager;
use crate::sequence::{Sequence, SequenceControl, SequenceHandle, SequenceId, SequenceSpec};

/// Point-in-time counters, cheap enough to poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Batches handed to the dispatch channel
    pub batch_count: u64,
    /// Sequences accepted by `submit`
    pub sequence_count: u64,
    pub prefill_queue_len: usize,
    pub decode_queue_len: usize,
    /// Accepted sequences that have not reached a terminal state
    pub active_sequences: usize,
    pub cache_used: usize,
    pub cache_total: usize,
    pub cache_slots_in_use: usize,
}

/// Channel ends the control loop takes ownership of on `start`.
struct LoopChannels {
    submissions: mpsc::Receiver<Sequence>,
    dispatch: mpsc::Sender<Batch>,
}

/// # ContinuousBatcher
///
/// Accepts generation requests and turns them into a stream of prefill and
/// decode batches for one or more batch workers.
///
/// Submitters get a [`SequenceHandle`] whose stream yields the generated
/// tokens and finally a [`Completion`](crate::Completion). Workers pull
/// batches with [`ContinuousBatcher::next_batch`]; the
/// [`BatchProcessor`](crate::processor::BatchProcessor) does this for you.
///
/// ```rust
/// use robata::{ContinuousBatcher, SchedulerConfig, SequenceSpec};
///
/// # #[tokio::main]
/// # async fn main() {
/// let batcher = ContinuousBatcher::new(SchedulerConfig::default()).unwrap();
/// batcher.start().await.unwrap();
///
/// let handle = batcher.submit(SequenceSpec::new(vec![1, 2, 3], 8)).await.unwrap();
/// let batch = batcher.next_batch().await.unwrap();
/// assert_eq!(batch.sequences()[0].id(), handle.id());
///
/// batcher.stop().await;
/// # }
/// ```
pub struct ContinuousBatcher {
    state: Arc<SchedulerState>,
    submit_tx: mpsc::Sender<Sequence>,
    channels: Mutex<Option<LoopChannels>>,
    batches: Mutex<mpsc::Receiver<Batch>>,
    control_loop: Mutex<Option<WorkerHandle>>,
}

impl ContinuousBatcher {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (submit_tx, submissions) = mpsc::channel(config.submission_capacity);
        let (dispatch, batches) = mpsc::channel(config.dispatch_capacity);
        Ok(Self {
            state: Arc::new(SchedulerState::new(config)),
            submit_tx,
            channels: Mutex::new(Some(LoopChannels { submissions, dispatch })),
            batches: Mutex::new(batches),
            control_loop: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.state.config
    }

    pub fn kv_cache(&self) -> &KvCacheManager {
        &self.state.kv_cache
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub(crate) fn state(&self) -> &Arc<SchedulerState> {
        &self.state
    }

    /// Spawn the control loop. A batcher runs at most once: starting it a
    /// second time, even after `stop`, fails.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut control_loop = self.control_loop.lock().await;
        if control_loop.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let Some(LoopChannels { submissions, dispatch }) = self.channels.lock().await.take() else {
            return Err(SchedulerError::Stopped);
        };

        let state = self.state.clone();
        *control_loop = Some(WorkerHandle::with_signals(
            self.state.running.clone(),
            self.state.notifier.clone(),
            move |running, notifier| {
                tokio::spawn(scheduling_loop(state, running, notifier, submissions, dispatch))
            },
        ));
        info!(
            max_batch_size = self.state.config.max_batch_size,
            max_tokens_per_batch = self.state.config.max_tokens_per_batch,
            cache_slots = self.state.config.slot_count(),
            policy = self.state.kv_cache.policy_name(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the control loop and cancel every sequence that has not finished.
    ///
    /// Blocked `next_batch` callers return [`SchedulerError::Stopped`].
    /// Calling `stop` more than once is harmless, and a stopped batcher
    /// cannot be started again.
    pub async fn stop(&self) {
        let Some(mut control_loop) = self.control_loop.lock().await.take() else {
            return;
        };
        // once the loop has exited, the dispatch sender is gone and the
        // submission receiver is closed
        control_loop.stop().await;

        let cancelled = self.state.cancel_all().await;
        if let Ok(mut batches) = self.batches.try_lock() {
            // batches nobody will pick up any more
            while batches.try_recv().is_ok() {}
        }
        info!(cancelled, "scheduler stopped");
    }

    /// Enqueue a sequence for prefill.
    ///
    /// In [`SubmitMode::Block`] this waits while the submission channel is
    /// full; in [`SubmitMode::FailFast`] it returns
    /// [`SubmissionError::ChannelFull`] instead.
    pub async fn submit(&self, spec: SequenceSpec) -> Result<SequenceHandle, SubmissionError> {
        if !self.state.is_running() {
            return Err(SubmissionError::NotRunning);
        }
        if spec.prompt_tokens.is_empty() {
            return Err(SubmissionError::EmptyPrompt);
        }
        let ceiling = self.state.config.sequence_token_ceiling();
        if spec.token_ceiling() > ceiling {
            return Err(SubmissionError::ExceedsTokenBudget {
                requested: spec.token_ceiling(),
                ceiling,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let control = Arc::new(SequenceControl::new(tx));
        let priority = self.state.config.effective_priority(spec.priority);
        let sequence = Sequence::new(spec, priority, self.state.next_admission(), control.clone());
        let id = sequence.id();
        self.state.register(id, control.clone()).await;

        let sent = match self.state.config.submit_mode {
            SubmitMode::Block => self.submit_tx.send(sequence).await
                .map_err(|_| SubmissionError::NotRunning),
            SubmitMode::FailFast => self.submit_tx.try_send(sequence).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SubmissionError::ChannelFull,
                mpsc::error::TrySendError::Closed(_) => SubmissionError::NotRunning,
            }),
        };
        if let Err(err) = sent {
            self.state.unregister(id).await;
            warn!(sequence = %id, error = %err, "submission rejected");
            return Err(err);
        }

        self.state.record_submission();
        Ok(SequenceHandle::new(id, SequenceStream::new(rx), control, self.state.notifier.clone()))
    }

    /// Wait for the next formed batch.
    ///
    /// Returns [`SchedulerError::Stopped`] before `start`, and once `stop`
    /// has shut the control loop down.
    pub async fn next_batch(&self) -> Result<Batch, SchedulerError> {
        if !self.state.is_running() {
            return Err(SchedulerError::Stopped);
        }
        self.batches.lock().await.recv().await.ok_or(SchedulerError::Stopped)
    }

    /// Report the terminal outcome of a sequence and release its slot.
    ///
    /// Returns false if the sequence was already completed (or is unknown);
    /// repeated calls never release anything twice.
    pub async fn complete(&self, id: SequenceId, error: Option<SequenceError>) -> bool {
        self.state.complete(id, error).await
    }

    /// Request cancellation of a queued or running sequence.
    pub async fn cancel(&self, id: SequenceId) -> bool {
        self.state.cancel(id).await
    }

    /// Return a sequence that still holds its slot for another decode step.
    pub async fn requeue_decode(&self, sequence: Sequence) {
        self.state.requeue_decode(sequence).await;
    }

    /// Return a sequence to prefill, giving up whatever slot it holds.
    pub async fn requeue_prefill(&self, sequence: Sequence) {
        self.state.requeue_pending(sequence, false).await;
    }

    pub async fn stats(&self) -> SchedulerStats {
        let cache = self.state.kv_cache.stats().await;
        SchedulerStats {
            batch_count: self.state.batch_count(),
            sequence_count: self.state.sequence_count(),
            prefill_queue_len: self.state.prefill_queue.len().await,
            decode_queue_len: self.state.decode_queue.len().await,
            active_sequences: self.state.active_count().await,
            cache_used: cache.used,
            cache_total: cache.total,
            cache_slots_in_use: cache.slots_in_use,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::test;
    use tokio::time::{timeout, Instant};
    use crate::batch::BatchPhase;
    use crate::communication::SequenceEvent;
    use crate::processor::BatchProcessor;
    use crate::sequence::SequenceState;
    use crate::testing::ScriptedExecutor;

    async fn started(config: SchedulerConfig) -> ContinuousBatcher {
        let batcher = ContinuousBatcher::new(config).unwrap();
        batcher.start().await.unwrap();
        batcher
    }

    fn spec(prompt_len: u32, max_new_tokens: usize) -> SequenceSpec {
        SequenceSpec::new((0..prompt_len).collect(), max_new_tokens)
    }

    #[test]
    async fn test_new_rejects_invalid_config() {
        let config = SchedulerConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(ContinuousBatcher::new(config).is_err());
    }

    #[test]
    async fn test_lifecycle_errors() {
        let batcher = ContinuousBatcher::new(SchedulerConfig::default()).unwrap();
        assert_eq!(batcher.submit(spec(4, 1)).await.err(), Some(SubmissionError::NotRunning));
        assert_eq!(batcher.next_batch().await.err(), Some(SchedulerError::Stopped));

        batcher.start().await.unwrap();
        assert!(batcher.is_running());
        assert_eq!(batcher.start().await, Err(SchedulerError::AlreadyRunning));

        batcher.stop().await;
        assert!(!batcher.is_running());
        assert_eq!(batcher.start().await, Err(SchedulerError::Stopped));
        // second stop is a no-op
        batcher.stop().await;
    }

    #[test]
    async fn test_submit_validation() {
        let batcher = started(SchedulerConfig {
            max_tokens_per_batch: 64,
            ..Default::default()
        }).await;

        assert_eq!(batcher.submit(spec(0, 4)).await.err(), Some(SubmissionError::EmptyPrompt));
        assert_eq!(
            batcher.submit(spec(60, 5)).await.err(),
            Some(SubmissionError::ExceedsTokenBudget { requested: 65, ceiling: 64 })
        );
        assert!(batcher.submit(spec(60, 4)).await.is_ok());
        assert_eq!(batcher.stats().await.sequence_count, 1);
        batcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_wait_time_forces_prefill() {
        let batcher = started(SchedulerConfig {
            min_batch_size: 3,
            max_wait_time: Duration::from_millis(50),
            ..Default::default()
        }).await;

        let submitted = Instant::now();
        let handle = batcher.submit(spec(8, 2)).await.unwrap();
        let batch = batcher.next_batch().await.unwrap();
        let waited = submitted.elapsed();

        assert_eq!(batch.phase(), BatchPhase::Prefill);
        assert_eq!(batch.sequences()[0].id(), handle.id());
        assert!(waited >= Duration::from_millis(50), "formed after {waited:?}");
        assert!(waited <= Duration::from_millis(75), "formed after {waited:?}");
        batcher.stop().await;
    }

    #[test]
    async fn test_high_priority_enters_first_batch() {
        let batcher = started(SchedulerConfig {
            min_batch_size: 6,
            prefill_batch_size: 6,
            max_wait_time: Duration::from_secs(60),
            ..Default::default()
        }).await;

        for _ in 0..5 {
            batcher.submit(spec(4, 1).with_priority(1)).await.unwrap();
        }
        let urgent = batcher.submit(spec(4, 1).with_priority(3)).await.unwrap();

        let batch = timeout(Duration::from_secs(1), batcher.next_batch()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 6);
        assert_eq!(batch.sequences()[0].id(), urgent.id());
        batcher.stop().await;
    }

    #[test]
    async fn test_fifo_within_priority() {
        let batcher = started(SchedulerConfig {
            min_batch_size: 2,
            prefill_batch_size: 2,
            max_wait_time: Duration::from_secs(60),
            ..Default::default()
        }).await;

        let first = batcher.submit(spec(4, 1).with_priority(3)).await.unwrap();
        let second = batcher.submit(spec(4, 1).with_priority(3)).await.unwrap();

        let batch = timeout(Duration::from_secs(1), batcher.next_batch()).await.unwrap().unwrap();
        let members: Vec<_> = batch.sequences().iter().map(|seq| seq.id()).collect();
        assert_eq!(members, vec![first.id(), second.id()]);
        batcher.stop().await;
    }

    #[test]
    async fn test_prefill_token_budget() {
        let batcher = started(SchedulerConfig {
            max_tokens_per_batch: 100,
            min_batch_size: 3,
            max_wait_time: Duration::from_secs(60),
            ..Default::default()
        }).await;

        for _ in 0..3 {
            batcher.submit(spec(40, 10)).await.unwrap();
        }
        let batch = timeout(Duration::from_secs(1), batcher.next_batch()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.total_tokens() <= 100);
        assert_eq!(batcher.stats().await.prefill_queue_len, 1);
        batcher.stop().await;
    }

    #[test]
    async fn test_fail_fast_submission() {
        let batcher = started(SchedulerConfig {
            submission_capacity: 1,
            submit_mode: SubmitMode::FailFast,
            ..Default::default()
        }).await;

        // the control loop has not been polled yet, so the channel stays full
        batcher.submit(spec(4, 1)).await.unwrap();
        assert_eq!(batcher.submit(spec(4, 1)).await.err(), Some(SubmissionError::ChannelFull));
        assert_eq!(batcher.stats().await.active_sequences, 1);
        batcher.stop().await;
    }

    #[test]
    async fn test_dispatch_backpressure_loses_nothing() {
        let batcher = started(SchedulerConfig {
            prefill_batch_size: 1,
            dispatch_capacity: 1,
            max_wait_time: Duration::from_millis(10),
            ..Default::default()
        }).await;

        let mut expected = vec![];
        for _ in 0..4 {
            expected.push(batcher.submit(spec(4, 2)).await.unwrap().id());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = batcher.stats().await;
        assert_eq!(stats.batch_count, 1);
        assert_eq!(stats.prefill_queue_len, 3);
        // only the dispatched member holds a slot
        assert_eq!(stats.cache_slots_in_use, 1);

        let mut seen = vec![];
        while seen.len() < 4 {
            let batch = timeout(Duration::from_secs(1), batcher.next_batch()).await.unwrap().unwrap();
            assert_eq!(batch.phase(), BatchPhase::Prefill);
            seen.extend(batch.sequences().iter().map(|seq| seq.id()));
        }
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
        batcher.stop().await;
    }

    #[test]
    async fn test_complete_is_idempotent() {
        let batcher = started(SchedulerConfig::default()).await;
        let handle = batcher.submit(spec(10, 3)).await.unwrap();
        let batch = batcher.next_batch().await.unwrap();
        assert_eq!(batcher.stats().await.cache_used, 10);

        assert!(batcher.complete(handle.id(), None).await);
        assert!(!batcher.complete(handle.id(), None).await);
        assert!(!batcher.complete(handle.id(), Some(SequenceError::Cancelled)).await);

        let stats = batcher.stats().await;
        assert_eq!(stats.cache_used, 0);
        assert_eq!(stats.active_sequences, 0);

        let (_, completion) = handle.into_stream().collect_all().await;
        let completion = completion.unwrap();
        assert_eq!(completion.state, SequenceState::Complete);
        assert!(completion.is_success());
        drop(batch);
        batcher.stop().await;
    }

    #[test]
    async fn test_complete_while_batch_in_flight() {
        let batcher = Arc::new(started(SchedulerConfig::default()).await);
        let processor = BatchProcessor::new(batcher.clone(), ScriptedExecutor::default());
        let handle = batcher.submit(spec(10, 3)).await.unwrap();
        let id = handle.id();
        let batch = batcher.next_batch().await.unwrap();

        assert!(batcher.complete(id, None).await);
        assert!(!batcher.complete(id, Some(SequenceError::Cancelled)).await);
        processor.process(batch).await;

        let stats = batcher.stats().await;
        assert_eq!(stats.cache_slots_in_use, 0);
        assert_eq!(stats.cache_used, 0);
        assert_eq!(stats.prefill_queue_len, 0);
        assert_eq!(stats.decode_queue_len, 0);
        assert!(timeout(Duration::from_millis(60), batcher.next_batch()).await.is_err());

        let mut stream = handle.into_stream();
        match timeout(Duration::from_secs(1), futures::StreamExt::next(&mut stream)).await.unwrap() {
            Some(SequenceEvent::Finished(completion)) => assert!(completion.is_success()),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(timeout(Duration::from_secs(1), futures::StreamExt::next(&mut stream)).await.unwrap(), None);
        batcher.stop().await;
    }

    #[test]
    async fn test_cancel_before_formation() {
        let batcher = started(SchedulerConfig {
            min_batch_size: 2,
            max_wait_time: Duration::from_millis(40),
            ..Default::default()
        }).await;

        let doomed = batcher.submit(spec(4, 2)).await.unwrap();
        let doomed_id = doomed.id();
        doomed.cancel();
        assert!(doomed.is_cancel_requested());
        let survivor = batcher.submit(spec(4, 2)).await.unwrap();

        let batch = timeout(Duration::from_secs(1), batcher.next_batch()).await.unwrap().unwrap();
        let members: Vec<_> = batch.sequences().iter().map(|seq| seq.id()).collect();
        assert_eq!(members, vec![survivor.id()]);

        let (tokens, completion) = doomed.into_stream().collect_all().await;
        assert!(tokens.is_empty());
        assert_eq!(completion.unwrap().error, Some(SequenceError::Cancelled));
        assert!(!batcher.cancel(doomed_id).await);
        assert!(batcher.cancel(survivor.id()).await);
        batcher.stop().await;
    }

    #[test]
    async fn test_stop_cancels_tracked_sequences() {
        let batcher = started(SchedulerConfig {
            min_batch_size: 3,
            max_wait_time: Duration::from_secs(60),
            ..Default::default()
        }).await;
        let queued = batcher.submit(spec(4, 2)).await.unwrap();
        let also_queued = batcher.submit(spec(4, 2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        batcher.stop().await;

        for handle in [queued, also_queued] {
            let mut stream = handle.into_stream();
            match futures::StreamExt::next(&mut stream).await {
                Some(SequenceEvent::Finished(completion)) => {
                    assert_eq!(completion.state, SequenceState::Cancelled);
                    assert_eq!(completion.error, Some(SequenceError::Cancelled));
                }
                other => panic!("expected cancellation, got {other:?}"),
            }
        }
        assert_eq!(batcher.stats().await.active_sequences, 0);
        assert_eq!(batcher.submit(spec(4, 1)).await.err(), Some(SubmissionError::NotRunning));
        assert_eq!(batcher.next_batch().await.err(), Some(SchedulerError::Stopped));
    }

    #[test]
    async fn test_stop_wakes_waiting_consumer() {
        let batcher = std::sync::Arc::new(started(SchedulerConfig::default()).await);
        let waiter = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.next_batch().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        batcher.stop().await;
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result.err(), Some(SchedulerError::Stopped));
    }

    #[test]
    async fn test_stats_serialize() {
        let batcher = started(SchedulerConfig::default()).await;
        let stats = batcher.stats().await;
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["cache_total"], 32768);
        assert_eq!(json["batch_count"], 0);
        batcher.stop().await;
    }
}
