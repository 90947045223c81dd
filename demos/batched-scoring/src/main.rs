mod model;

use std::error::Error;
use std::sync::Arc;

use futures::StreamExt;
use pipewright::config::BatchConfig;
use pipewright::pipelines::BatchedPipeline;
use pipewright::result_channel;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::model::{FEATURES, Scorer, engine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BatchConfig {
        max_batch: 8,
        pad_to_full: true,
        ..BatchConfig::default()
    };
    let (callback, mut results) = result_channel::<u32, f32>();
    let pipeline = Arc::new(BatchedPipeline::new(Scorer, engine(4)?, config, callback)?);

    for id in 0..50u32 {
        let features: [f32; FEATURES] = std::array::from_fn(|i| ((id as usize + i) % 7) as f32);
        pipeline.feed(id, features)?;
    }
    info!(buffered = pipeline.buffered(), "all items fed");

    // `finish` blocks until every batch is done; the stream ends right after.
    let finishing = tokio::task::spawn_blocking({
        let pipeline = Arc::clone(&pipeline);
        move || pipeline.finish()
    });

    let mut best: Option<(u32, f32)> = None;
    let mut scored = 0usize;
    while let Some((id, result)) = results.next().await {
        match result {
            Ok(score) => {
                scored += 1;
                if best.is_none_or(|(_, top)| score > top) {
                    best = Some((id, score));
                }
            }
            Err(err) => error!(id, %err, "item failed"),
        }
    }
    finishing.await??;

    let stats = pipeline.stats();
    info!(scored, batches = stats.admitted, best = ?best, "scoring finished");
    Ok(())
}
