//! Ready-made pipelines for common model shapes.
//!
//! Each wraps a [`Pipeline`](crate::Pipeline) and exposes a keyed API in the
//! terms of its model family.

pub mod batched;
pub mod classifier;
pub mod decoder;
pub mod video;

use crate::error::TransformError;
use crate::tensor::Tensor;

pub use batched::{BatchModel, BatchedPipeline};
pub use classifier::{ClassifierPipeline, Classify, classify_once};
pub use decoder::{
    BatchProgress, Decoded, DecoderEngines, DecoderPipeline, Seq2Seq, SpeechEngines, SpeechPipeline, Step, StopGate, Vocode,
};
pub use video::{ClipId, FrameKey, RecurrentVideoModel, VideoEngines, VideoPipeline};

/// The first engine output, for models that only produce one.
pub(crate) fn first(outputs: Vec<Tensor>) -> Result<Tensor, TransformError> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| TransformError::new("engine returned no outputs"))
}
