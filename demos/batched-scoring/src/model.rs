use pipewright::engine::LocalEngine;
use pipewright::pipelines::BatchModel;
use pipewright::{EngineError, Tensor, TransformError};

pub const FEATURES: usize = 4;

const WEIGHTS: [f32; FEATURES] = [0.5, -1.0, 2.0, 0.25];

/// Linear scorer: one feature row per item, one score per row.
pub struct Scorer;

impl BatchModel for Scorer {
    type Item = [f32; FEATURES];
    type Output = f32;

    fn batch_inputs(&self, items: &[[f32; FEATURES]], capacity: usize) -> Result<Vec<Tensor>, TransformError> {
        let flat: Vec<f32> = items.iter().flatten().copied().collect();
        let batch = Tensor::from_slice(&[items.len() as u32, FEATURES as u32], &flat)?;
        Ok(vec![batch.pad_outer(capacity)?])
    }

    fn split_outputs(&self, outputs: Vec<Tensor>, rows: usize) -> Result<Vec<f32>, TransformError> {
        let scores = outputs
            .first()
            .ok_or_else(|| TransformError::new("engine returned no scores"))?;
        Ok(scores.narrow_outer(0, rows)?.to_vec::<f32>()?)
    }
}

pub fn engine(workers: usize) -> Result<LocalEngine, EngineError> {
    LocalEngine::with_workers("scorer", workers, |inputs| {
        let batch = &inputs[0];
        let rows = batch.split_outer().map_err(|e| e.to_string())?;
        let mut scores = Vec::with_capacity(rows.len());
        for row in rows {
            let features = row.to_vec::<f32>().map_err(|e| e.to_string())?;
            scores.push(features.iter().zip(WEIGHTS).map(|(x, w)| x * w).sum::<f32>());
        }
        Ok(vec![Tensor::vector(&scores)])
    })
}
