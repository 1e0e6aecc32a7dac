use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use crate::batch::BatchId;
use crate::communication::SequenceEvent;
use crate::config::SchedulerConfig;
use crate::error::{AllocationError, SequenceError};
use crate::kv_cache::KvCacheManager;
use crate::queue::AdmissionQueue;
use crate::sequence::{completion_for, Sequence, SequenceControl, SequenceId};

/// State shared by the public batcher, the control loop and the batch workers.
pub(crate) struct SchedulerState {
    pub(crate) config: SchedulerConfig,
    pub(crate) prefill_queue: AdmissionQueue,
    pub(crate) decode_queue: AdmissionQueue,
    pub(crate) kv_cache: KvCacheManager,

    /// Every sequence that was accepted and has not reached a terminal state
    active: Mutex<HashMap<SequenceId, Arc<SequenceControl>>>,

    pub(crate) running: Arc<AtomicBool>,
    pub(crate) notifier: Arc<Notify>,

    admissions: AtomicU64,
    next_batch_id: AtomicU64,
    batch_count: AtomicU64,
    sequence_count: AtomicU64,
}

impl SchedulerState {
    pub(crate) fn new(config: SchedulerConfig) -> Self {
        let kv_cache = KvCacheManager::new(
            config.max_cache_tokens,
            config.slot_count(),
            config.eviction_policy,
        );
        Self {
            prefill_queue: AdmissionQueue::new(),
            decode_queue: AdmissionQueue::new(),
            kv_cache,
            active: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            notifier: Arc::new(Notify::new()),
            admissions: AtomicU64::new(0),
            next_batch_id: AtomicU64::new(0),
            batch_count: AtomicU64::new(0),
            sequence_count: AtomicU64::new(0),
            config,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn wake(&self) {
        self.notifier.notify_one();
    }

    pub(crate) fn next_admission(&self) -> u64 {
        self.admissions.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_batch_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn record_dispatch(&self) {
        self.batch_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_submission(&self) {
        self.sequence_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn batch_count(&self) -> u64 {
        self.batch_count.load(Ordering::SeqCst)
    }

    pub(crate) fn sequence_count(&self) -> u64 {
        self.sequence_count.load(Ordering::SeqCst)
    }

    pub(crate) async fn register(&self, id: SequenceId, control: Arc<SequenceControl>) {
        self.active.lock().await.insert(id, control);
    }

    /// Forget a sequence that never made it into the scheduler.
    pub(crate) async fn unregister(&self, id: SequenceId) {
        self.active.lock().await.remove(&id);
    }

    pub(crate) async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Flag a sequence for cancellation. Returns false for unknown or
    /// already finished sequences.
    pub(crate) async fn cancel(&self, id: SequenceId) -> bool {
        let active = self.active.lock().await;
        match active.get(&id) {
            Some(control) => {
                control.cancel();
                self.wake();
                true
            }
            None => false,
        }
    }

    /// Report a terminal outcome and free the sequence's slot.
    ///
    /// Only the first call for a given sequence has any effect, which makes
    /// every completion path safe to race with every other. A sequence still
    /// owned by a queue or batch is flagged so that its next touch drops it.
    pub(crate) async fn complete(&self, id: SequenceId, error: Option<SequenceError>) -> bool {
        let Some(control) = self.active.lock().await.remove(&id) else {
            return false;
        };
        control.cancel();
        let released = self.kv_cache.release_owned_by(id).await;
        match &error {
            None => debug!(sequence = %id, generated = control.generated(), "sequence complete"),
            Some(err) => info!(sequence = %id, error = %err, "sequence cancelled"),
        }
        if let Some(slot) = released {
            debug!(sequence = %id, %slot, "released cache slot");
        }
        control.emit(SequenceEvent::Finished(completion_for(id, &control, error)));
        true
    }

    /// Move an owned sequence to its terminal state and report it.
    ///
    /// The slot is released even when the sequence was already reported, so
    /// a slot taken after an external `complete` cannot leak.
    pub(crate) async fn finish(&self, mut sequence: Sequence, error: Option<SequenceError>) {
        if let Err(err) = sequence.finish(error.clone()) {
            warn!(sequence = %sequence.id(), error = %err, "finishing sequence from unexpected state");
        }
        let id = sequence.id();
        if !self.complete(id, error).await {
            if let Some(slot) = self.kv_cache.release_owned_by(id).await {
                debug!(sequence = %id, %slot, "released slot of an already completed sequence");
            }
        }
    }

    /// Send a sequence that lost (or gave up) its slot back to prefill and
    /// wake the control loop.
    pub(crate) async fn requeue_pending(&self, sequence: Sequence, evicted: bool) {
        if self.park_pending(sequence, evicted).await {
            self.wake();
        }
    }

    /// Like `requeue_pending`, without waking the loop. Used by the loop
    /// itself; returns whether the sequence was queued.
    pub(crate) async fn park_pending(&self, mut sequence: Sequence, evicted: bool) -> bool {
        let slot = sequence.slot();
        if slot.is_some() {
            self.kv_cache.release_owned_by(sequence.id()).await;
        }
        if let Err(err) = sequence.reset_to_pending(evicted) {
            self.finish(sequence, Some(err)).await;
            return false;
        }
        if !self.is_running() || sequence.is_cancelled() {
            self.finish(sequence, Some(SequenceError::Cancelled)).await;
            return false;
        }
        if evicted {
            let evictions = sequence.evictions();
            let starved = self.config.max_evictions.is_some_and(|max| evictions > max);
            if let Some(slot) = slot.filter(|_| starved) {
                warn!(sequence = %sequence.id(), evictions, "sequence evicted too often");
                let lost = SequenceError::Allocation(AllocationError::SlotLost(slot));
                self.finish(sequence, Some(lost)).await;
                return false;
            }
            debug!(sequence = %sequence.id(), evictions, "sequence evicted; awaiting prefill");
        }
        self.prefill_queue.push(sequence).await;
        true
    }

    /// Hand a sequence that still holds its slot back for the next decode step.
    pub(crate) async fn requeue_decode(&self, sequence: Sequence) {
        if !self.is_running() || sequence.is_cancelled() {
            self.finish(sequence, Some(SequenceError::Cancelled)).await;
            return;
        }
        self.decode_queue.push(sequence).await;
        self.wake();
    }

    /// Cancel everything still known to the scheduler.
    pub(crate) async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for queue in [&self.prefill_queue, &self.decode_queue] {
            for sequence in queue.drain().await {
                self.finish(sequence, Some(SequenceError::Cancelled)).await;
                cancelled += 1;
            }
        }
        // in flight or still in the submission channel
        let remaining: Vec<_> = self.active.lock().await.keys().copied().collect();
        for id in remaining {
            if let Some(control) = self.active.lock().await.get(&id) {
                control.cancel();
            }
            if self.complete(id, Some(SequenceError::Cancelled)).await {
                cancelled += 1;
            }
        }
        cancelled
    }
}
