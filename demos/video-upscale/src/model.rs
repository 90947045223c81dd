use pipewright::engine::{Engine, LocalEngine};
use pipewright::pipelines::{RecurrentVideoModel, VideoEngines};
use pipewright::router::Direction;
use pipewright::{EngineError, Tensor, TransformError};

/// Toy 2x upscaler. Frames are 1-D rows of luminance.
pub struct Upscaler;

impl RecurrentVideoModel for Upscaler {
    fn residual_inputs(
        &self,
        _: Direction,
        frame: &Tensor,
        flow: Option<&Tensor>,
        hidden: Option<&Tensor>,
    ) -> Result<Vec<Tensor>, TransformError> {
        let zeros = Tensor::zeros(frame.shape(), frame.kind())?;
        Ok(vec![
            frame.clone(),
            flow.cloned().unwrap_or_else(|| zeros.clone()),
            hidden.cloned().unwrap_or(zeros),
        ])
    }
}

fn columns(inputs: &[Tensor]) -> Result<Vec<Vec<f32>>, String> {
    inputs
        .iter()
        .map(|t| t.to_vec::<f32>().map_err(|e| e.to_string()))
        .collect()
}

fn flow(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let c = columns(inputs)?;
    let motion: Vec<f32> = c[0].iter().zip(&c[1]).map(|(f, n)| f - n).collect();
    Ok(vec![Tensor::vector(&motion)])
}

fn residual(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let c = columns(inputs)?;
    let hidden: Vec<f32> = (0..c[0].len())
        .map(|i| 0.5 * c[2][i] + 0.5 * c[0][i] + 0.1 * c[1][i])
        .collect();
    Ok(vec![Tensor::vector(&hidden)])
}

/// Averages both directions into the frame, then doubles the width.
fn fusion(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let c = columns(inputs)?;
    let upscaled: Vec<f32> = (0..c[2].len())
        .flat_map(|i| {
            let v = c[2][i] + 0.25 * (c[0][i] + c[1][i]);
            [v, v]
        })
        .collect();
    Ok(vec![Tensor::vector(&upscaled)])
}

pub fn engines(workers: usize) -> Result<VideoEngines, EngineError> {
    let boxed = |name: &str, f: fn(&[Tensor]) -> Result<Vec<Tensor>, String>| -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(LocalEngine::with_workers(name, workers, f)?))
    };
    Ok(VideoEngines {
        flow: boxed("flow", flow)?,
        backward: boxed("backward", residual)?,
        forward: boxed("forward", residual)?,
        fusion: boxed("fusion", fusion)?,
    })
}
