use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use super::{Completion, Engine, Receipt, RunnerLease, TaskId, EngineRuntime};
use crate::error::EngineError;
use crate::tensor::Tensor;

/// What a poll of the adapter produced.
#[derive(Debug)]
pub enum Polled {
    Completed(Completion),
    /// The engine observed the sentinel and returned everything it accepted.
    Drained,
}

/// Counter snapshot for one adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub name: String,
    pub runner: usize,
    pub submitted: u64,
    pub completed: u64,
    pub invalid: u64,
}

/// Wraps one engine instance for use by a stage.
///
/// The adapter owns no pipeline semantics. It guards the sentinel protocol
/// (an empty submission is never forwarded, nothing is forwarded after the
/// sentinel) and counts traffic.
pub struct EngineAdapter {
    name: String,
    engine: Box<dyn Engine>,
    lease: RunnerLease,
    sentinel_submitted: AtomicBool,
    sentinel_observed: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    invalid: AtomicU64,
}

impl EngineAdapter {
    /// Wraps `engine`, leasing a runner id from the shared [`EngineRuntime`].
    pub fn new(name: impl Into<String>, engine: impl Engine) -> Self {
        let lease = EngineRuntime::acquire().lease();
        Self {
            name: name.into(),
            engine: Box::new(engine),
            lease,
            sentinel_submitted: AtomicBool::new(false),
            sentinel_observed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runner_id(&self) -> usize {
        self.lease.id()
    }

    /// Submits one request.
    ///
    /// # Errors
    ///
    /// * [`EngineError::Rejected`] for an empty input list
    /// * [`EngineError::Closed`] once the sentinel has been submitted
    /// * anything the engine itself reports
    pub fn submit(&self, inputs: Vec<Tensor>) -> Result<TaskId, EngineError> {
        if inputs.is_empty() {
            return Err(EngineError::Rejected(
                "an empty input list is reserved for the shutdown sentinel".into(),
            ));
        }
        if self.sentinel_submitted.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        let task = self.engine.submit(inputs)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(engine = %self.name, task = %task, "submitted");
        Ok(task)
    }

    /// Returns a completion if one is ready, without blocking.
    pub fn try_poll(&self) -> Option<Polled> {
        match self.engine.try_receive() {
            Receipt::Ready(completion) => Some(self.record(completion)),
            Receipt::Pending => None,
            Receipt::Drained => Some(self.observe_drain()),
        }
    }

    /// Blocks until a completion arrives or the engine drains.
    pub fn blocking_poll(&self) -> Polled {
        loop {
            match self.engine.receive() {
                Receipt::Ready(completion) => return self.record(completion),
                Receipt::Drained => return self.observe_drain(),
                Receipt::Pending => continue,
            }
        }
    }

    /// Sends the shutdown sentinel. Repeated calls are no-ops.
    pub fn submit_sentinel(&self) {
        if !self.sentinel_submitted.swap(true, Ordering::AcqRel) {
            debug!(engine = %self.name, "sentinel submitted");
            self.engine.submit_sentinel();
        }
    }

    pub fn sentinel_submitted(&self) -> bool {
        self.sentinel_submitted.load(Ordering::Acquire)
    }

    /// `true` once the sentinel went in, came back out, and nothing is in flight.
    pub fn is_drained(&self) -> bool {
        self.sentinel_submitted.load(Ordering::Acquire)
            && self.sentinel_observed.load(Ordering::Acquire)
            && self.engine.is_idle()
    }

    /// Runs one request to completion on an adapter that no pump is draining.
    ///
    /// This is the single-request pattern: submit, wait for the answer, and
    /// check that the answer belongs to the request. Blocks the calling
    /// thread, so async callers should run it under `spawn_blocking`.
    pub fn infer(&self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>, EngineError> {
        let task = self.submit(inputs)?;
        match self.blocking_poll() {
            Polled::Completed(completion) if completion.task_id != task => Err(EngineError::Mismatched {
                expected: task,
                got: completion.task_id,
            }),
            Polled::Completed(completion) if !completion.valid => Err(EngineError::Invalid(task)),
            Polled::Completed(completion) => Ok(completion.outputs),
            Polled::Drained => Err(EngineError::Drained),
        }
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            name: self.name.clone(),
            runner: self.runner_id(),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }

    fn record(&self, completion: Completion) -> Polled {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !completion.valid {
            self.invalid.fetch_add(1, Ordering::Relaxed);
        }
        debug!(engine = %self.name, task = %completion.task_id, valid = completion.valid, "completed");
        Polled::Completed(completion)
    }

    fn observe_drain(&self) -> Polled {
        if !self.sentinel_submitted.load(Ordering::Acquire) {
            warn!(engine = %self.name, "engine drained without a sentinel");
        }
        self.sentinel_observed.store(true, Ordering::Release);
        Polled::Drained
    }
}
