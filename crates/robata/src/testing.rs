//! Test executors.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use crate::batch::{Batch, BatchId, BatchPhase};
use crate::error::ExecutorError;
use crate::processor::{ModelExecutor, StepOutput};
use crate::sequence::SequenceId;

/// Emits `token_count` as the token id and records every batch it sees.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    pub(crate) calls: AtomicUsize,
    pub(crate) seen: Mutex<Vec<(BatchId, BatchPhase, Vec<SequenceId>)>>,
    pub(crate) failing: Mutex<HashSet<SequenceId>>,
    pub(crate) fail_batches: bool,
    pub(crate) stop_token: Option<u32>,
    pub(crate) latency: Option<Duration>,
}

impl ScriptedExecutor {
    pub(crate) fn fail_sequence(&self, id: SequenceId) {
        self.failing.lock().unwrap().insert(id);
    }

    pub(crate) fn phases(&self) -> Vec<BatchPhase> {
        self.seen.lock().unwrap().iter().map(|(_, phase, _)| *phase).collect()
    }
}

#[async_trait]
impl ModelExecutor for ScriptedExecutor {
    async fn execute(&self, batch: &Batch) -> Result<Vec<StepOutput>, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((
            batch.id(),
            batch.phase(),
            batch.sequences().iter().map(|sequence| sequence.id()).collect(),
        ));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_batches {
            return Err(ExecutorError::new("device lost"));
        }

        let failing = self.failing.lock().unwrap().clone();
        Ok(batch.sequences().iter().map(|sequence| {
            if failing.contains(&sequence.id()) {
                return StepOutput::Failed(ExecutorError::new("bad input"));
            }
            match batch.phase() {
                BatchPhase::Prefill => StepOutput::Prefilled,
                BatchPhase::Decode => {
                    let token_id = sequence.token_count() as u32;
                    StepOutput::Token {
                        token_id,
                        stop: self.stop_token == Some(token_id),
                    }
                }
            }
        }).collect())
    }
}
