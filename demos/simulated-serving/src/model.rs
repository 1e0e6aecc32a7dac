use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use robata::{Batch, BatchPhase, ExecutorError};
use robata::processor::{ModelExecutor, StepOutput};

pub const END_OF_SEQUENCE: u32 = 2;

/// Pretends to run a model: latency grows with the batch's token count and
/// tokens are drawn at random, with the odd end-of-sequence token.
pub struct SimulatedModel {
    rng: Mutex<StdRng>,
    per_token: Duration,
    failure_rate: f64,
}

impl SimulatedModel {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            per_token: Duration::from_micros(20),
            failure_rate: 0.01,
        }
    }
}

#[async_trait]
impl ModelExecutor for SimulatedModel {
    async fn execute(&self, batch: &Batch) -> Result<Vec<StepOutput>, ExecutorError> {
        let work = match batch.phase() {
            BatchPhase::Prefill => batch.total_tokens(),
            BatchPhase::Decode => batch.len(),
        };
        tokio::time::sleep(self.per_token * work as u32).await;

        let mut rng = self.rng.lock().map_err(|_| ExecutorError::new("rng poisoned"))?;
        Ok(batch.sequences().iter().map(|_| {
            if rng.gen_bool(self.failure_rate) {
                return StepOutput::Failed(ExecutorError::new("simulated fault"));
            }
            match batch.phase() {
                BatchPhase::Prefill => StepOutput::Prefilled,
                BatchPhase::Decode => {
                    let token_id = rng.gen_range(0..32_000);
                    StepOutput::Token {
                        token_id,
                        stop: token_id == END_OF_SEQUENCE,
                    }
                }
            }
        }).collect())
    }
}
