//! Stages: a named processing step bound to one engine adapter.
//!
//! A [`Stage`] supplies the two pure transforms around an inference call:
//! `prepare` turns per-sample state into engine inputs, and `on_complete`
//! turns engine outputs into a [`StageOutcome`]. The crate-private
//! [`StageNode`] owns the adapter, the correlation table, and the reaction to
//! each outcome. [`StageHandle`] is the public face used for wiring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::StageConfig;
use crate::correlation::{CorrelationTable, RegisterError};
use crate::engine::{AdapterStats, Completion, EngineAdapter, TaskId};
use crate::error::{PipelineError, SampleError, StageError};
use crate::ledger::Ledger;
use crate::tensor::Tensor;

/// What a stage wants done with a sample after a completion.
#[derive(Debug)]
pub enum StageOutcome<S, R> {
    /// Submit the updated state to this stage again.
    Continue(S),
    /// Hand the state to the successor.
    Advance(S),
    /// The sample is done.
    Finalize(R),
}

/// Per-call context handed to stage transforms.
#[derive(Debug)]
pub struct StepContext<'a, M> {
    pub meta: &'a M,
    pub stage: &'a str,
    /// Completions this sample has already had in this stage.
    pub iteration: u32,
    pub cap: Option<u32>,
}

impl<M> StepContext<'_, M> {
    /// `true` when this is the last submission the iteration cap allows, so a
    /// `Continue` returned now will be forced to advance.
    pub fn at_cap(&self) -> bool {
        matches!(self.cap, Some(cap) if self.iteration + 1 >= cap)
    }
}

/// The transforms of one stage.
///
/// Both methods are pure with respect to the pipeline: they run on whichever
/// thread submits or completes, and must not block on other samples.
pub trait Stage<M, S, R>: Send + Sync + 'static {
    fn prepare(&self, ctx: &StepContext<'_, M>, state: &S) -> Result<Vec<Tensor>, StageError>;

    fn on_complete(&self, ctx: &StepContext<'_, M>, outputs: Vec<Tensor>, state: S)
    -> Result<StageOutcome<S, R>, StageError>;
}

/// Receives samples a stage advanced or gave up on.
///
/// Implemented by [`StageHandle`] for linear wiring and by routers that join
/// or sequence several stages.
pub trait Downstream<M, S, R>: Send + Sync {
    fn deliver(&self, meta: M, state: S) -> Result<(), PipelineError>;

    fn abandon(&self, meta: M, error: SampleError) -> Result<(), PipelineError>;
}

/// Result of offering a sample to a stage.
#[derive(Debug)]
pub enum Submission<M> {
    Accepted(TaskId),
    /// Not submitted. The caller decides how to settle the sample.
    Rejected { meta: M, error: SampleError },
    /// Dropped because the pipeline is aborting.
    Skipped,
}

/// Counters for one stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub engine: AdapterStats,
    pub continued: u64,
    pub advanced: u64,
    pub finalized: u64,
    pub capped: u64,
    pub abandoned: u64,
    pub pending_entries: usize,
}

struct Entry<M, S> {
    meta: M,
    state: S,
    iteration: u32,
}

#[derive(Default)]
struct StageCounters {
    continued: AtomicU64,
    advanced: AtomicU64,
    finalized: AtomicU64,
    capped: AtomicU64,
    abandoned: AtomicU64,
}

pub(crate) struct StageNode<M, S, R> {
    name: String,
    stage: Box<dyn Stage<M, S, R>>,
    adapter: Arc<EngineAdapter>,
    table: CorrelationTable<Entry<M, S>>,
    config: StageConfig,
    next: OnceLock<Arc<dyn Downstream<M, S, R>>>,
    ledger: Arc<Ledger<M, R>>,
    counters: StageCounters,
}

impl<M, S, R> StageNode<M, S, R> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn adapter(&self) -> &EngineAdapter {
        &self.adapter
    }

    pub(crate) fn config(&self) -> &StageConfig {
        &self.config
    }

    pub(crate) fn pending_entries(&self) -> usize {
        self.table.len()
    }
}

impl<M, S, R> StageNode<M, S, R>
where
    M: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(
        name: String,
        stage: Box<dyn Stage<M, S, R>>,
        adapter: Arc<EngineAdapter>,
        config: StageConfig,
        ledger: Arc<Ledger<M, R>>,
    ) -> Self {
        Self {
            table: CorrelationTable::new(name.clone()),
            name,
            stage,
            adapter,
            config,
            next: OnceLock::new(),
            ledger,
            counters: StageCounters::default(),
        }
    }

    fn submit_entry(&self, meta: M, state: S, iteration: u32) -> Result<Submission<M>, PipelineError> {
        if self.ledger.is_aborting() {
            return Ok(Submission::Skipped);
        }
        let prepared = {
            let ctx = StepContext {
                meta: &meta,
                stage: &self.name,
                iteration,
                cap: self.config.iteration_cap,
            };
            self.stage.prepare(&ctx, &state)
        };
        let inputs = match prepared {
            Ok(inputs) => inputs,
            Err(StageError::Transform(err)) => {
                return Ok(Submission::Rejected {
                    meta,
                    error: SampleError::Transform {
                        stage: self.name.clone(),
                        reason: err.to_string(),
                    },
                });
            }
            Err(StageError::MissingPrerequisite(detail)) => {
                return Err(PipelineError::invariant(&self.name, detail));
            }
        };

        let entry = Entry { meta, state, iteration };
        match self.table.submit_and_register(entry, || self.adapter.submit(inputs)) {
            Ok(task) => {
                debug!(stage = %self.name, task = %task, iteration, "sample submitted");
                Ok(Submission::Accepted(task))
            }
            Err(RegisterError::Rejected { entry, source }) => {
                warn!(stage = %self.name, error = %source, "submission rejected");
                Ok(Submission::Rejected {
                    meta: entry.meta,
                    error: SampleError::Submit {
                        stage: self.name.clone(),
                        reason: source.to_string(),
                    },
                })
            }
            Err(RegisterError::Duplicate(violation)) => Err(violation.into()),
        }
    }

    fn settle_submission(&self, submission: Submission<M>) -> Result<(), PipelineError> {
        match submission {
            Submission::Accepted(_) | Submission::Skipped => Ok(()),
            Submission::Rejected { meta, error } => self.abandon(meta, error),
        }
    }

    /// Handles one completion from this stage's engine.
    pub(crate) fn complete(&self, completion: Completion) -> Result<(), PipelineError> {
        let Completion {
            task_id,
            outputs,
            valid,
        } = completion;
        let Entry { meta, state, iteration } = self.table.resolve(task_id)?;
        if self.ledger.is_aborting() {
            debug!(stage = %self.name, task = %task_id, "completion discarded while aborting");
            return Ok(());
        }
        if !valid {
            warn!(stage = %self.name, task = %task_id, "engine reported an invalid result");
            return self.abandon(
                meta,
                SampleError::InferenceInvalid {
                    stage: self.name.clone(),
                    task: task_id,
                },
            );
        }

        let (outcome, at_cap) = {
            let ctx = StepContext {
                meta: &meta,
                stage: &self.name,
                iteration,
                cap: self.config.iteration_cap,
            };
            (self.stage.on_complete(&ctx, outputs, state), ctx.at_cap())
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(StageError::Transform(err)) => {
                return self.abandon(
                    meta,
                    SampleError::Transform {
                        stage: self.name.clone(),
                        reason: err.to_string(),
                    },
                );
            }
            Err(StageError::MissingPrerequisite(detail)) => {
                return Err(PipelineError::invariant(&self.name, detail));
            }
        };

        match outcome {
            StageOutcome::Continue(state) if at_cap => {
                warn!(stage = %self.name, iterations = iteration + 1, "iteration cap reached, forcing advance");
                self.counters.capped.fetch_add(1, Ordering::Relaxed);
                self.advance(meta, state)
            }
            StageOutcome::Continue(state) => {
                self.counters.continued.fetch_add(1, Ordering::Relaxed);
                let submission = self.submit_entry(meta, state, iteration + 1)?;
                self.settle_submission(submission)
            }
            StageOutcome::Advance(state) => self.advance(meta, state),
            StageOutcome::Finalize(result) => {
                self.counters.finalized.fetch_add(1, Ordering::Relaxed);
                self.ledger.complete(meta, result);
                Ok(())
            }
        }
    }

    fn advance(&self, meta: M, state: S) -> Result<(), PipelineError> {
        self.counters.advanced.fetch_add(1, Ordering::Relaxed);
        match self.next.get() {
            Some(next) => next.deliver(meta, state),
            None => Err(PipelineError::invariant(
                &self.name,
                "sample advanced past a stage with no successor",
            )),
        }
    }

    fn abandon(&self, meta: M, error: SampleError) -> Result<(), PipelineError> {
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        match self.next.get() {
            Some(next) => next.abandon(meta, error),
            None => {
                self.ledger.fail(meta, error);
                Ok(())
            }
        }
    }

    pub(crate) fn stats(&self) -> StageStats {
        StageStats {
            engine: self.adapter.stats(),
            continued: self.counters.continued.load(Ordering::Relaxed),
            advanced: self.counters.advanced.load(Ordering::Relaxed),
            finalized: self.counters.finalized.load(Ordering::Relaxed),
            capped: self.counters.capped.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            pending_entries: self.table.len(),
        }
    }
}

/// Public handle on a stage, used to wire topologies and to submit into it.
pub struct StageHandle<M, S, R> {
    node: Arc<StageNode<M, S, R>>,
}

impl<M, S, R> Clone for StageHandle<M, S, R> {
    fn clone(&self) -> Self {
        Self {
            node: Arc::clone(&self.node),
        }
    }
}

impl<M, S, R> StageHandle<M, S, R>
where
    M: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(node: Arc<StageNode<M, S, R>>) -> Self {
        Self { node }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Sets where advanced and abandoned samples go. May be called once.
    pub fn connect(&self, next: Arc<dyn Downstream<M, S, R>>) -> Result<(), PipelineError> {
        self.node
            .next
            .set(next)
            .map_err(|_| PipelineError::invariant(self.name(), "stage is already connected"))
    }

    /// Submits a sample, leaving a rejection for the caller to settle.
    pub fn try_submit(&self, meta: M, state: S) -> Result<Submission<M>, PipelineError> {
        self.node.submit_entry(meta, state, 0)
    }

    /// Submits a sample. A rejection is passed on like a failed completion.
    pub fn submit(&self, meta: M, state: S) -> Result<(), PipelineError> {
        let submission = self.node.submit_entry(meta, state, 0)?;
        self.node.settle_submission(submission)
    }

    /// Requests this stage has submitted and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.node.pending_entries()
    }

    /// A handle that does not keep the stage alive.
    ///
    /// Routers connected downstream of a stage hold these when they submit
    /// back into it, so the wiring does not form a reference cycle.
    pub fn downgrade(&self) -> WeakStageHandle<M, S, R> {
        WeakStageHandle {
            node: Arc::downgrade(&self.node),
        }
    }
}

/// Non-owning [`StageHandle`].
pub struct WeakStageHandle<M, S, R> {
    node: Weak<StageNode<M, S, R>>,
}

impl<M, S, R> Clone for WeakStageHandle<M, S, R> {
    fn clone(&self) -> Self {
        Self {
            node: Weak::clone(&self.node),
        }
    }
}

impl<M, S, R> WeakStageHandle<M, S, R> {
    /// `None` once the pipeline owning the stage has been dropped.
    pub fn upgrade(&self) -> Option<StageHandle<M, S, R>> {
        self.node.upgrade().map(|node| StageHandle { node })
    }
}

impl<M, S, R> Downstream<M, S, R> for StageHandle<M, S, R>
where
    M: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    fn deliver(&self, meta: M, state: S) -> Result<(), PipelineError> {
        self.submit(meta, state)
    }

    fn abandon(&self, meta: M, error: SampleError) -> Result<(), PipelineError> {
        self.node.ledger.fail(meta, error);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_cap() {
        let meta = ();
        let ctx = |iteration, cap| StepContext {
            meta: &meta,
            stage: "s",
            iteration,
            cap,
        };
        assert!(!ctx(0, None).at_cap());
        assert!(ctx(0, Some(1)).at_cap());
        assert!(!ctx(1, Some(3)).at_cap());
        assert!(ctx(2, Some(3)).at_cap());
    }
}
