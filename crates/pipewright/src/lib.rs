//! # Pipewright
//!
//! Multi-stage inference pipelines over asynchronous engines, with every
//! request correlated back to the sample that issued it.
//!
//! ## Overview
//!
//! An inference engine accepts a request, hands back a task id, and later
//! reports a completion for that id on its own schedule. Pipewright builds
//! pipelines out of such engines: each sample flows through a sequence of
//! stages, each stage submits to its own engine, and completions are matched
//! to samples through per-stage correlation tables, whatever order they come
//! back in.
//!
//! Key components include:
//!
//! - [`Tensor`], an owned, backend-neutral tensor value
//! - the [`Engine`](engine::Engine) trait and [`EngineAdapter`](engine::EngineAdapter)
//! - [`Stage`], the pair of transforms around one inference call
//! - [`Pipeline`], which runs one completion pump thread per stage
//! - [`router`], for stages that join two partial results or recur along a
//!   sequence
//! - [`result_channel`], an async [`Stream`](futures::Stream) over results
//!
//! ## Architecture
//!
//! ### Samples and outcomes
//!
//! A sample is a key (`M`) plus state (`S`). A stage's `prepare` turns the
//! state into engine inputs; its `on_complete` turns the outputs into a
//! [`StageOutcome`]: `Continue` resubmits to the same stage, `Advance` hands
//! the state downstream, `Finalize` produces the result (`R`).
//!
//! ### Errors
//!
//! Failures that concern one sample ([`SampleError`]) go to the result
//! callback and the pipeline carries on. Structural failures
//! ([`PipelineError`]) abort the pipeline and are returned from
//! [`Pipeline::join`].
//!
//! ### Shutdown
//!
//! After end of input, once every admitted sample has settled, a sentinel is
//! submitted to the first stage's engine. Each pump exits when its engine
//! reports drained and forwards the sentinel to the next stage.
//!
//! ## Features
//!
//! - **candle** - Conversions between [`Tensor`] and `candle_core::Tensor`
//!

mod error;
mod ledger;
mod ordered;
mod pipeline;
mod pump;
mod stage;
mod stream;

pub mod config;
pub mod correlation;
pub mod engine;
pub mod pipelines;
pub mod router;
pub mod tensor;

pub use error::{
    ConfigError, CorrelationViolation, EngineError, PipelineError, Result, SampleError, StageError, TensorError,
    TransformError,
};
pub use ledger::{Lifecycle, ResultCallback, Settlement};
pub use ordered::Reorder;
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStats};
pub use stage::{Downstream, Stage, StageHandle, StageOutcome, StageStats, StepContext, Submission, WeakStageHandle};
pub use stream::{ResultStream, StreamItem, result_channel};
pub use tensor::{ElementKind, Tensor};
