mod model;

use std::sync::Arc;
use futures::StreamExt;
use rand::Rng;
use robata::{ContinuousBatcher, SchedulerConfig, SequenceEvent, SequenceSpec};
use robata::processor::BatchProcessor;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use crate::model::SimulatedModel;

/// Usage: `simulated-serving [config.json]`
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).expect("reads config file");
            serde_json::from_str::<SchedulerConfig>(&raw).expect("parses config file")
        }
        None => SchedulerConfig {
            max_cache_tokens: 4096,
            cache_slot_count: Some(24),
            ..Default::default()
        },
    };

    let batcher = Arc::new(ContinuousBatcher::new(config).expect("valid configuration"));
    batcher.start().await.expect("starts scheduler");
    let processor = BatchProcessor::new(batcher.clone(), SimulatedModel::new(7));
    let workers = processor.spawn_workers(4).await;

    let handles = (0..50).map(|index| {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            let (prompt_len, max_new_tokens, priority) = {
                let mut rng = rand::thread_rng();
                (rng.gen_range(8..256), rng.gen_range(4..64), rng.gen_range(0..3))
            };
            let spec = SequenceSpec::new((0..prompt_len).collect(), max_new_tokens).with_priority(priority);
            let handle = match batcher.submit(spec).await {
                Ok(handle) => handle,
                Err(err) => {
                    error!(index, error = %err, "submission rejected");
                    return;
                }
            };

            let mut stream = handle.into_stream();
            let mut count = 0;
            while let Some(event) = stream.next().await {
                match event {
                    SequenceEvent::Token(_) => count += 1,
                    SequenceEvent::Finished(completion) => {
                        match completion.error {
                            None => info!(index, priority, tokens = count, "sequence finished"),
                            Some(err) => info!(index, priority, tokens = count, error = %err, "sequence cancelled"),
                        }
                        break;
                    }
                }
            }
        })
    }).collect::<Vec<_>>();

    for handle in futures::future::join_all(handles).await {
        if let Err(err) = handle {
            error!(error = ?err, "client task failed");
        }
    }

    let stats = batcher.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats).expect("serializes stats"));

    batcher.stop().await;
    workers.shutdown().await;
}
