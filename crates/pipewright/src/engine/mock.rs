//! Scripted engine for tests: controls completion order, validity, and stray ids.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{Completion, Engine, Receipt, TaskId};
use crate::error::EngineError;
use crate::tensor::Tensor;

type Respond = dyn Fn(&[Tensor]) -> Vec<Tensor> + Send + Sync;
type Validity = dyn Fn(&[Tensor]) -> bool + Send + Sync;

/// When completions become visible to receivers.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Release {
    Immediate,
    /// Holds completions until this many are waiting, then releases them
    /// newest first. The sentinel flushes whatever is held.
    Hold(usize),
}

struct MockState {
    next_id: u32,
    held: Vec<Completion>,
    ready: VecDeque<Completion>,
    closed: bool,
    sentinels: usize,
    injected: Option<TaskId>,
    submissions: Vec<(TaskId, Vec<Tensor>)>,
}

struct MockShared {
    state: Mutex<MockState>,
    available: Condvar,
    respond: Box<Respond>,
    validity: Box<Validity>,
    release: Release,
}

#[derive(Clone)]
pub(crate) struct MockEngine {
    shared: Arc<MockShared>,
}

impl MockEngine {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(&[Tensor]) -> Vec<Tensor> + Send + Sync + 'static,
    {
        Self::assemble(Box::new(respond), Box::new(|_| true), Release::Immediate, None)
    }

    /// Returns the inputs unchanged.
    pub(crate) fn echo() -> Self {
        Self::new(|inputs| inputs.to_vec())
    }

    pub(crate) fn with_release(self, release: Release) -> Self {
        let shared = self.into_parts();
        Self::assemble(shared.respond, shared.validity, release, shared.state.into_inner().injected)
    }

    pub(crate) fn with_validity<F>(self, validity: F) -> Self
    where
        F: Fn(&[Tensor]) -> bool + Send + Sync + 'static,
    {
        let shared = self.into_parts();
        Self::assemble(shared.respond, Box::new(validity), shared.release, shared.state.into_inner().injected)
    }

    /// Makes the first submission also produce a completion for `task`, which
    /// nothing submitted.
    pub(crate) fn with_injected(self, task: TaskId) -> Self {
        let shared = self.into_parts();
        Self::assemble(shared.respond, shared.validity, shared.release, Some(task))
    }

    pub(crate) fn submissions(&self) -> Vec<(TaskId, Vec<Tensor>)> {
        self.shared.state.lock().submissions.clone()
    }

    pub(crate) fn submission_count(&self) -> usize {
        self.shared.state.lock().submissions.len()
    }

    pub(crate) fn sentinels(&self) -> usize {
        self.shared.state.lock().sentinels
    }

    fn assemble(respond: Box<Respond>, validity: Box<Validity>, release: Release, injected: Option<TaskId>) -> Self {
        Self {
            shared: Arc::new(MockShared {
                state: Mutex::new(MockState {
                    next_id: 0,
                    held: Vec::new(),
                    ready: VecDeque::new(),
                    closed: false,
                    sentinels: 0,
                    injected,
                    submissions: Vec::new(),
                }),
                available: Condvar::new(),
                respond,
                validity,
                release,
            }),
        }
    }

    fn into_parts(self) -> MockShared {
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared,
            Err(_) => panic!("configure the mock engine before cloning it"),
        }
    }
}

fn flush_reversed(state: &mut MockState) {
    while let Some(completion) = state.held.pop() {
        state.ready.push_back(completion);
    }
}

impl Engine for MockEngine {
    fn submit(&self, inputs: Vec<Tensor>) -> Result<TaskId, EngineError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.next_id = state.next_id.wrapping_add(1).max(1);
        let task_id = TaskId::new(state.next_id).ok_or(EngineError::Closed)?;

        if let Some(stray) = state.injected.take() {
            state.ready.push_back(Completion {
                task_id: stray,
                outputs: Vec::new(),
                valid: true,
            });
        }

        let completion = Completion {
            task_id,
            outputs: (shared.respond)(&inputs),
            valid: (shared.validity)(&inputs),
        };
        state.submissions.push((task_id, inputs));
        match shared.release {
            Release::Immediate => state.ready.push_back(completion),
            Release::Hold(count) => {
                state.held.push(completion);
                if state.held.len() >= count {
                    flush_reversed(&mut state);
                }
            }
        }
        shared.available.notify_all();
        Ok(task_id)
    }

    fn submit_sentinel(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.sentinels += 1;
        flush_reversed(&mut state);
        self.shared.available.notify_all();
    }

    fn try_receive(&self) -> Receipt {
        let mut state = self.shared.state.lock();
        match state.ready.pop_front() {
            Some(completion) => Receipt::Ready(completion),
            None if state.closed && state.held.is_empty() => Receipt::Drained,
            None => Receipt::Pending,
        }
    }

    fn receive(&self) -> Receipt {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(completion) = state.ready.pop_front() {
                return Receipt::Ready(completion);
            }
            if state.closed && state.held.is_empty() {
                return Receipt::Drained;
            }
            self.shared.available.wait(&mut state);
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.ready.is_empty() && state.held.is_empty()
    }
}
