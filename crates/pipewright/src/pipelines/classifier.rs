//! Single-stage classification: encode, infer once, decode.

use std::sync::Arc;

use crate::config::StageConfig;
use crate::engine::{Engine, EngineAdapter};
use crate::error::{PipelineError, SampleError, StageError, TransformError};
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineStats};
use crate::stage::{Stage, StageOutcome, StepContext};
use crate::tensor::Tensor;

/// Pre- and post-processing for a classifier model.
pub trait Classify: Send + Sync + 'static {
    type Input: Send + 'static;
    type Label: Send + 'static;

    fn encode(&self, input: &Self::Input) -> Result<Vec<Tensor>, TransformError>;

    fn decode(&self, outputs: Vec<Tensor>) -> Result<Self::Label, TransformError>;
}

struct ClassifyStage<C> {
    model: Arc<C>,
}

impl<K, C> Stage<K, C::Input, C::Label> for ClassifyStage<C>
where
    K: Send + 'static,
    C: Classify,
{
    fn prepare(&self, _: &StepContext<'_, K>, input: &C::Input) -> Result<Vec<Tensor>, StageError> {
        Ok(self.model.encode(input)?)
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, K>,
        outputs: Vec<Tensor>,
        _: C::Input,
    ) -> Result<StageOutcome<C::Input, C::Label>, StageError> {
        Ok(StageOutcome::Finalize(self.model.decode(outputs)?))
    }
}

/// Streams inputs through one classifier engine, reporting each label by key.
pub struct ClassifierPipeline<C: Classify, K> {
    inner: Pipeline<K, C::Input, C::Label>,
}

impl<C, K> ClassifierPipeline<C, K>
where
    C: Classify,
    K: Send + 'static,
{
    pub fn new<F>(model: C, engine: impl Engine, config: StageConfig, callback: F) -> Result<Self, PipelineError>
    where
        F: Fn(K, Result<C::Label, SampleError>) + Send + Sync + 'static,
    {
        let stage = ClassifyStage { model: Arc::new(model) };
        let inner = PipelineBuilder::new("classifier")
            .stage_with("classify", engine, stage, config)
            .on_result(callback)
            .build()?;
        Ok(Self { inner })
    }

    pub fn put(&self, key: K, input: C::Input) -> Result<(), PipelineError> {
        self.inner.put(key, input)
    }

    pub fn join(&self) -> Result<(), PipelineError> {
        self.inner.join()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }
}

/// Classifies one input synchronously on an adapter no pump is draining.
///
/// Blocks until the engine answers. It does not panic inside an async
/// runtime, but it does hold the runtime thread for the whole request.
pub fn classify_once<C: Classify>(model: &C, adapter: &EngineAdapter, input: &C::Input) -> Result<C::Label, SampleError> {
    let transform = |err: TransformError| SampleError::Transform {
        stage: adapter.name().to_string(),
        reason: err.to_string(),
    };
    let inputs = model.encode(input).map_err(transform)?;
    let outputs = adapter.infer(inputs).map_err(|err| SampleError::Submit {
        stage: adapter.name().to_string(),
        reason: err.to_string(),
    })?;
    model.decode(outputs).map_err(transform)
}
