//! The boundary to an opaque asynchronous inference engine.
//!
//! An [`Engine`] accepts tensor lists, hands back a [`TaskId`], and later
//! returns a [`Completion`] for that id in whatever order it likes. Stages never
//! talk to an engine directly; they go through an [`EngineAdapter`], which adds
//! the sentinel protocol, counters, and runner bookkeeping.

mod adapter;
mod local;
mod runtime;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::num::NonZeroU32;

use serde::Serialize;

use crate::error::EngineError;
use crate::tensor::Tensor;

pub use adapter::{AdapterStats, EngineAdapter, Polled};
pub use local::{LocalEngine, LocalFn};
pub use runtime::{EngineRuntime, RunnerLease};

/// Engine-assigned identifier for one in-flight request.
///
/// Zero is reserved by engines to mean "no task", so it is unrepresentable here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(NonZeroU32);

impl TaskId {
    /// Returns `None` for the reserved value zero.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A finished request as reported by the engine.
#[derive(Clone, Debug)]
pub struct Completion {
    pub task_id: TaskId,
    pub outputs: Vec<Tensor>,
    /// `false` when the engine could not produce a usable result.
    pub valid: bool,
}

/// Outcome of asking an engine for its next completion.
#[derive(Debug)]
pub enum Receipt {
    Ready(Completion),
    /// Nothing finished yet.
    Pending,
    /// The sentinel was observed and every accepted task has been returned.
    Drained,
}

/// An asynchronous inference engine.
///
/// Submissions may come from many threads while a single consumer receives.
pub trait Engine: Send + Sync + 'static {
    /// Queues one request. An empty `inputs` list is never passed here; it is
    /// reserved for [`submit_sentinel`](Engine::submit_sentinel).
    fn submit(&self, inputs: Vec<Tensor>) -> Result<TaskId, EngineError>;

    /// Signals that no further submissions will arrive.
    fn submit_sentinel(&self);

    /// Non-blocking receive.
    fn try_receive(&self) -> Receipt;

    /// Blocks until a completion is available or the engine has drained.
    fn receive(&self) -> Receipt;

    /// `true` when nothing is queued or running.
    fn is_idle(&self) -> bool;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn submit(&self, inputs: Vec<Tensor>) -> Result<TaskId, EngineError> {
        (**self).submit(inputs)
    }

    fn submit_sentinel(&self) {
        (**self).submit_sentinel()
    }

    fn try_receive(&self) -> Receipt {
        (**self).try_receive()
    }

    fn receive(&self) -> Receipt {
        (**self).receive()
    }

    fn is_idle(&self) -> bool {
        (**self).is_idle()
    }
}
