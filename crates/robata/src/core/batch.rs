use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Notify};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};
use crate::batch::{Batch, BatchPhase};
use crate::error::SequenceError;
use crate::sequence::Sequence;
use super::state::SchedulerState;

/// The scheduler's control loop.
///
/// Wakes on a submission, on the periodic tick (half of `max_wait_time`), or
/// on the notifier (cancellations, requeues from batch workers, shutdown).
/// Every wake-up forms at most one prefill batch and then at most one decode
/// batch. The loop is the only task that pops from the admission queues.
pub(crate) async fn scheduling_loop(
    state: Arc<SchedulerState>,
    running: Arc<AtomicBool>,
    notifier: Arc<Notify>,
    mut submissions: mpsc::Receiver<Sequence>,
    dispatch: mpsc::Sender<Batch>,
) {
    let mut ticker = tokio::time::interval(state.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(tick = ?state.config.tick_interval(), "control loop started");

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            submitted = submissions.recv() => match submitted {
                Some(sequence) => {
                    admit(&state, sequence).await;
                    // take the whole burst before forming
                    while let Ok(sequence) = submissions.try_recv() {
                        admit(&state, sequence).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => trace!("tick"),
            _ = notifier.notified() => {},
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if let Some(batch) = form_prefill_batch(&state).await {
            dispatch_batch(&state, &dispatch, batch).await;
        }
        if let Some(batch) = form_decode_batch(&state).await {
            dispatch_batch(&state, &dispatch, batch).await;
        }
    }
    info!("control loop stopped");
}

async fn admit(state: &SchedulerState, sequence: Sequence) {
    if sequence.is_cancelled() {
        state.finish(sequence, Some(SequenceError::Cancelled)).await;
        return;
    }
    trace!(sequence = %sequence.id(), priority = sequence.priority(), "admitted");
    state.prefill_queue.push(sequence).await;
}

/// Whether enough work is pending, or the oldest sequence waited long enough,
/// to form a prefill batch now.
async fn prefill_ready(state: &SchedulerState) -> bool {
    let pending = state.prefill_queue.len().await;
    if pending == 0 {
        return false;
    }
    if pending >= state.config.min_batch_size {
        return true;
    }
    state.prefill_queue.oldest_arrival().await
        .is_some_and(|arrival| arrival.elapsed() >= state.config.max_wait_time)
}

/// Pop pending sequences best first and grant each a cache slot.
///
/// Formation stops at the first sequence that would overflow the token
/// budget, or at the first allocation failure; that sequence goes back to
/// the queue, preserving its position. Members of this very batch whose slot
/// got evicted by a later allocation are taken out and requeued once
/// formation is over, so a batch never carries a member without a slot.
pub(crate) async fn form_prefill_batch(state: &SchedulerState) -> Option<Batch> {
    if !prefill_ready(state).await {
        return None;
    }
    let config = &state.config;
    let limit = config.prefill_limit();
    let mut batch = Batch::new(state.next_batch_id(), BatchPhase::Prefill);
    let mut displaced = vec![];

    while batch.len() < limit {
        let Some(mut candidate) = state.prefill_queue.pop_best().await else {
            break;
        };
        if candidate.is_cancelled() {
            state.finish(candidate, Some(SequenceError::Cancelled)).await;
            continue;
        }

        let needed = candidate.token_count();
        if batch.total_tokens() + needed > config.max_tokens_per_batch {
            state.prefill_queue.push(candidate).await;
            break;
        }

        match state.kv_cache.allocate_with_priority(candidate.id(), needed, candidate.priority()).await {
            Ok(allocation) => {
                for evicted in allocation.evicted {
                    if let Some(member) = batch.remove(evicted.owner) {
                        displaced.push(member);
                    }
                }
                match candidate.begin_prefill(allocation.slot) {
                    Ok(()) => batch.push(candidate),
                    Err(err) => state.finish(candidate, Some(err)).await,
                }
            }
            Err(err) => {
                let attempts = candidate.record_allocation_failure();
                debug!(sequence = %candidate.id(), attempts, error = %err, "allocation failed");
                match config.max_allocation_retries {
                    Some(max) if attempts > max => {
                        warn!(sequence = %candidate.id(), attempts, "giving up on allocation");
                        state.finish(candidate, Some(SequenceError::Allocation(err))).await;
                    }
                    _ => state.prefill_queue.push(candidate).await,
                }
                break;
            }
        }
    }

    for member in displaced {
        state.park_pending(member, true).await;
    }

    if batch.is_empty() {
        None
    } else {
        Some(batch)
    }
}

/// Collect sequences waiting for their next token.
///
/// A sequence found without its slot was evicted while it waited; it goes
/// back to prefill instead of joining the batch.
pub(crate) async fn form_decode_batch(state: &SchedulerState) -> Option<Batch> {
    if state.decode_queue.is_empty().await {
        return None;
    }
    let config = &state.config;
    let limit = config.decode_limit();
    let mut batch = Batch::new(state.next_batch_id(), BatchPhase::Decode);

    while batch.len() < limit {
        let Some(candidate) = state.decode_queue.pop_best().await else {
            break;
        };
        if candidate.is_cancelled() {
            state.finish(candidate, Some(SequenceError::Cancelled)).await;
            continue;
        }
        let holds_slot = match candidate.slot() {
            Some(slot) => state.kv_cache.owns(slot, candidate.id()).await,
            None => false,
        };
        if !holds_slot {
            state.park_pending(candidate, true).await;
            continue;
        }
        if batch.total_tokens() + candidate.token_count() > config.max_tokens_per_batch {
            state.decode_queue.push(candidate).await;
            break;
        }
        batch.push(candidate);
    }

    if batch.is_empty() {
        None
    } else {
        Some(batch)
    }
}

/// Hand a batch to the workers without blocking the loop.
///
/// When the dispatch channel is full the batch is taken apart again: decode
/// members return to the decode queue with their slots, prefill members give
/// their slots back and return to pending.
pub(crate) async fn dispatch_batch(state: &SchedulerState, dispatch: &mpsc::Sender<Batch>, batch: Batch) {
    let (id, phase, size, tokens) = (batch.id(), batch.phase(), batch.len(), batch.total_tokens());
    match dispatch.try_send(batch) {
        Ok(()) => {
            state.record_dispatch();
            debug!(batch = %id, %phase, size, tokens, "dispatched batch");
        }
        Err(TrySendError::Full(batch)) | Err(TrySendError::Closed(batch)) => {
            warn!(batch = %id, %phase, size, "dispatch channel unavailable; requeueing members");
            requeue_members(state, batch).await;
        }
    }
}

async fn requeue_members(state: &SchedulerState, batch: Batch) {
    match batch.phase() {
        BatchPhase::Prefill => {
            for sequence in batch.into_sequences() {
                state.park_pending(sequence, false).await;
            }
        }
        BatchPhase::Decode => state.decode_queue.extend(batch.into_sequences()).await,
    }
}
