//! Error types for every layer of the crate.
//!
//! Errors are split by blast radius. [`SampleError`] fails a single logical
//! sample and is delivered through the result callback while the pipeline keeps
//! running. [`PipelineError`] is structural: it stops the pipeline and surfaces
//! from [`Pipeline::join`](crate::Pipeline::join).

use thiserror::Error;

use crate::engine::TaskId;
use crate::router::Direction;
use crate::tensor::{ElementKind, MAX_DIMS};

/// Result alias defaulting to [`PipelineError`].
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Malformed tensor construction or an invalid tensor operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("tensor rank {0} exceeds the maximum of {MAX_DIMS}")]
    TooManyDims(usize),

    #[error("shape {shape:?} of {kind} needs {expected} bytes, got {got}")]
    ByteLength {
        shape: Vec<u32>,
        kind: ElementKind,
        expected: usize,
        got: usize,
    },

    #[error("unknown element kind code {0}")]
    UnknownKind(u32),

    #[error("tensor holds {actual} elements, {requested} requested")]
    KindMismatch {
        actual: ElementKind,
        requested: ElementKind,
    },

    #[error("operation needs an outer dimension, tensor is a scalar")]
    Scalar,

    #[error("range {start}..{end} is out of bounds for an outer dimension of {len}")]
    OutOfBounds { start: usize, end: usize, len: usize },

    #[error("incompatible tensors: {0}")]
    Incompatible(String),

    #[error("backend conversion failed: {0}")]
    Backend(String),
}

/// Configuration that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("stage `{0}` is declared more than once")]
    DuplicateStage(String),

    #[error("a pipeline needs at least one stage")]
    NoStages,
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure reported by an [`Engine`](crate::engine::Engine) or its adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("engine no longer accepts submissions")]
    Closed,

    #[error("expected {expected} input tensors, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("malformed input: {0}")]
    Malformed(#[from] TensorError),

    #[error("engine answered task {got} while task {expected} was outstanding")]
    Mismatched { expected: TaskId, got: TaskId },

    #[error("engine drained before answering")]
    Drained,

    #[error("inference for task {0} was reported invalid")]
    Invalid(TaskId),

    #[error("failed to start engine worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A pure pre- or post-processing step could not handle its input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<TensorError> for TransformError {
    fn from(err: TensorError) -> Self {
        Self(err.to_string())
    }
}

/// Error returned by a [`Stage`](crate::Stage) transform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Fails only the sample being processed.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The state handed to the stage lacks something an earlier stage should
    /// have produced. Fatal for the pipeline.
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),
}

impl From<TensorError> for StageError {
    fn from(err: TensorError) -> Self {
        Self::Transform(err.into())
    }
}

/// Per-sample failure delivered through the result callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleError {
    #[error("stage `{stage}` could not submit: {reason}")]
    Submit { stage: String, reason: String },

    #[error("stage `{stage}` received an invalid result for task {task}")]
    InferenceInvalid { stage: String, task: TaskId },

    #[error("stage `{stage}` transform failed: {reason}")]
    Transform { stage: String, reason: String },

    #[error("{direction} chain broke at index {origin}")]
    ChainBroken { direction: Direction, origin: usize },
}

/// Breach of the one-entry-per-task contract between an engine and a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationViolation {
    #[error("table `{table}` already holds an entry for task {task}")]
    Duplicate { table: String, task: TaskId },

    #[error("table `{table}` has no entry for task {task}")]
    Unregistered { table: String, task: TaskId },
}

/// Structural failure. Stops the pipeline and is reported by `join`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Correlation(#[from] CorrelationViolation),

    #[error("invariant violated in `{stage}`: {detail}")]
    Invariant { stage: String, detail: String },

    #[error("completion pump for `{stage}` panicked")]
    PumpPanicked { stage: String },

    #[error("stage `{stage}` stopped with {count} unresolved entries")]
    Orphaned { stage: String, count: usize },

    #[error("could not spawn the pump for `{stage}`: {reason}")]
    Spawn { stage: String, reason: String },

    #[error("pipeline is not accepting input")]
    Closed,

    #[error("no result callback was set before start")]
    MissingCallback,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{} fatal errors, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Multiple(Vec<PipelineError>),
}

impl PipelineError {
    pub(crate) fn invariant(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Invariant {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Folds a list of fatal errors into a single outcome.
    pub(crate) fn aggregate(mut errors: Vec<PipelineError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(PipelineError::Multiple(errors)),
        }
    }
}
