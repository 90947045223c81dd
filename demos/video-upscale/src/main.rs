mod model;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use pipewright::config::PipelineConfig;
use pipewright::pipelines::{ClipId, VideoPipeline};
use pipewright::{Reorder, SampleError, Tensor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::model::{Upscaler, engines};

const WIDTH: usize = 16;

fn synthetic_clip(frames: usize, phase: f32) -> Vec<Tensor> {
    (0..frames)
        .map(|t| {
            let row: Vec<f32> = (0..WIDTH)
                .map(|x| ((x as f32 * 0.4) + (t as f32 * 0.3) + phase).sin())
                .collect();
            Tensor::vector(&row)
        })
        .collect()
}

type Frames = Reorder<(usize, Result<Tensor, SampleError>)>;

/// Parks a frame result and logs every result now in frame order. Failed
/// frames take their place in the order too, so they never hold back the
/// frames behind them.
fn release(reorder: &mut Frames, clip: impl fmt::Display, index: usize, result: Result<Tensor, SampleError>) -> usize {
    let ready = reorder.push(index, (index, result));
    for (index, result) in &ready {
        match result {
            Ok(frame) => info!(%clip, index, width = frame.element_count(), "frame ready"),
            Err(err) => error!(%clip, index, %err, "frame failed"),
        }
    }
    ready.len()
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Results arrive from whichever pump finishes a frame; print them per clip
    // in frame order.
    let ordered: Arc<Mutex<HashMap<ClipId, Frames>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&ordered);
    let pipeline = VideoPipeline::new(Upscaler, engines(4)?, PipelineConfig::named("upscale"), move |key, result| {
        let mut ordered = sink.lock();
        release(ordered.entry(key.clip).or_default(), key.clip, key.index, result);
    })?;

    let clips: Vec<ClipId> = (0..3)
        .map(|c| pipeline.put_clip(synthetic_clip(12, c as f32)))
        .collect::<Result<_, _>>()?;
    info!(clips = clips.len(), "clips queued");

    pipeline.join()?;
    let stats = pipeline.stats();
    info!(completed = stats.completed, failed = stats.failed, "upscaling finished");
    for clip in clips {
        let next = ordered.lock().get(&clip).map(Reorder::next_index).unwrap_or_default();
        info!(%clip, frames = next, "clip delivered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright::router::Direction;

    #[test]
    fn test_failed_frame_does_not_stall_the_clip() {
        let clip = "clip-0";
        let mut reorder = Frames::default();
        let broken = SampleError::ChainBroken {
            direction: Direction::Forward,
            origin: 1,
        };
        assert_eq!(release(&mut reorder, clip, 2, Ok(Tensor::vector(&[2.0f32]))), 0);
        assert_eq!(release(&mut reorder, clip, 0, Ok(Tensor::vector(&[0.0f32]))), 1);
        assert_eq!(release(&mut reorder, clip, 1, Err(broken)), 2);
        assert_eq!(reorder.next_index(), 3);
        assert_eq!(reorder.parked(), 0);
    }
}
