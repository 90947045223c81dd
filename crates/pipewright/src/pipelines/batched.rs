//! Batched inference: per-key items are grouped into engine batches and the
//! batch outputs split back out per key.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::BatchConfig;
use crate::engine::Engine;
use crate::error::{PipelineError, SampleError, StageError, TransformError};
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineStats};
use crate::stage::{Stage, StageOutcome, StepContext};
use crate::tensor::Tensor;

/// How a model packs items into a batch and unpacks its outputs.
pub trait BatchModel: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    /// Builds engine inputs for `items`, padded out to `capacity` rows.
    fn batch_inputs(&self, items: &[Self::Item], capacity: usize) -> Result<Vec<Tensor>, TransformError>;

    /// Splits engine outputs into one value per real row; padding rows are
    /// dropped.
    fn split_outputs(&self, outputs: Vec<Tensor>, rows: usize) -> Result<Vec<Self::Output>, TransformError>;
}

struct BatchStage<B> {
    model: Arc<B>,
    max_batch: usize,
    pad_to_full: bool,
}

impl<K, B> Stage<Vec<K>, Vec<B::Item>, Vec<B::Output>> for BatchStage<B>
where
    K: Send + 'static,
    B: BatchModel,
{
    fn prepare(&self, _: &StepContext<'_, Vec<K>>, items: &Vec<B::Item>) -> Result<Vec<Tensor>, StageError> {
        let capacity = if self.pad_to_full { self.max_batch } else { items.len() };
        Ok(self.model.batch_inputs(items, capacity)?)
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, Vec<K>>,
        outputs: Vec<Tensor>,
        items: Vec<B::Item>,
    ) -> Result<StageOutcome<Vec<B::Item>, Vec<B::Output>>, StageError> {
        Ok(StageOutcome::Finalize(self.model.split_outputs(outputs, items.len())?))
    }
}

struct Pending<K, I> {
    keys: Vec<K>,
    items: Vec<I>,
}

impl<K, I> Default for Pending<K, I> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            items: Vec::new(),
        }
    }
}

type KeyCallback<K, O> = Arc<dyn Fn(K, Result<O, SampleError>) + Send + Sync>;

/// Accumulates keyed items into batches of `max_batch` and reports one result
/// per key.
pub struct BatchedPipeline<B: BatchModel, K> {
    inner: Pipeline<Vec<K>, Vec<B::Item>, Vec<B::Output>>,
    max_batch: usize,
    pending: Mutex<Pending<K, B::Item>>,
    callback: KeyCallback<K, B::Output>,
}

impl<B, K> BatchedPipeline<B, K>
where
    B: BatchModel,
    K: Send + 'static,
{
    pub fn new<F>(model: B, engine: impl Engine, config: BatchConfig, callback: F) -> Result<Self, PipelineError>
    where
        F: Fn(K, Result<B::Output, SampleError>) + Send + Sync + 'static,
    {
        config.validate()?;
        let stage = BatchStage {
            model: Arc::new(model),
            max_batch: config.max_batch,
            pad_to_full: config.pad_to_full,
        };
        let callback: KeyCallback<K, B::Output> = Arc::new(callback);
        let per_key = Arc::clone(&callback);
        let inner = PipelineBuilder::new("batched")
            .stage_with("batch", engine, stage, config.stage.clone())
            .on_result(move |keys: Vec<K>, result: Result<Vec<B::Output>, SampleError>| {
                scatter(&*per_key, keys, result)
            })
            .build()?;
        Ok(Self {
            inner,
            max_batch: config.max_batch,
            pending: Mutex::new(Pending::default()),
            callback,
        })
    }

    /// Queues one item, submitting a batch once `max_batch` items are waiting.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Closed`] once input has ended; the item is not queued.
    pub fn feed(&self, key: K, item: B::Item) -> Result<(), PipelineError> {
        if !self.inner.accepts_input() {
            return Err(PipelineError::Closed);
        }
        let full = {
            let mut pending = self.pending.lock();
            pending.keys.push(key);
            pending.items.push(item);
            if pending.keys.len() < self.max_batch {
                return Ok(());
            }
            mem::take(&mut *pending)
        };
        self.submit(full)
    }

    /// Submits whatever is waiting as a short batch.
    pub fn flush(&self) -> Result<(), PipelineError> {
        let partial = mem::take(&mut *self.pending.lock());
        if partial.keys.is_empty() {
            return Ok(());
        }
        self.submit(partial)
    }

    /// Flushes, then waits for every batch to finish.
    pub fn finish(&self) -> Result<(), PipelineError> {
        let flushed = self.flush();
        let joined = self.inner.join();
        flushed.and(joined)
    }

    /// Items waiting for a batch to fill.
    pub fn buffered(&self) -> usize {
        self.pending.lock().keys.len()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }

    // A batch the pipeline refuses still reports every one of its keys.
    fn submit(&self, batch: Pending<K, B::Item>) -> Result<(), PipelineError> {
        debug!(rows = batch.keys.len(), "submitting batch");
        if let Err(err) = self.inner.admit(1) {
            let refused = SampleError::Submit {
                stage: "batch".into(),
                reason: err.to_string(),
            };
            for key in batch.keys {
                (self.callback)(key, Err(refused.clone()));
            }
            return Err(err);
        }
        self.inner.enter(batch.keys, batch.items)
    }
}

fn scatter<K, O, F>(callback: &F, keys: Vec<K>, result: Result<Vec<O>, SampleError>)
where
    F: Fn(K, Result<O, SampleError>) + ?Sized,
{
    match result {
        Ok(outputs) if outputs.len() == keys.len() => {
            for (key, output) in keys.into_iter().zip(outputs) {
                callback(key, Ok(output));
            }
        }
        Ok(outputs) => {
            let err = SampleError::Transform {
                stage: "batch".into(),
                reason: format!("{} outputs for a batch of {}", outputs.len(), keys.len()),
            };
            for key in keys {
                callback(key, Err(err.clone()));
            }
        }
        Err(err) => {
            for key in keys {
                callback(key, Err(err.clone()));
            }
        }
    }
}
