//! Dependency routing between stages.
//!
//! [`JoinRouter`] fires a dependent submission for a sample index once both
//! directional partials for it have arrived. [`Chain`] enforces strict
//! sequential recurrence along one direction: position `p` is submitted only
//! once its own input and the carry from position `p - 1` both exist.
//!
//! Both run their submit closure while holding their lock, so readiness is
//! decided and acted on atomically. Anything that settles samples through the
//! ledger is returned to the caller to do after the lock is released.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, SampleError};

/// Which way a recurrence runs over sample indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Index `i` depends on `i - 1`.
    Forward,
    /// Index `i` depends on `i + 1`.
    Backward,
}

impl Direction {
    fn slot(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Backward => 1,
        }
    }

    /// The index whose carry `index` depends on, if any.
    pub fn predecessor(self, index: usize, len: usize) -> Option<usize> {
        match self {
            Direction::Forward => index.checked_sub(1),
            Direction::Backward => (index + 1 < len).then_some(index + 1),
        }
    }

    /// The index that starts a chain of `len` samples.
    pub fn origin(self, len: usize) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Backward => len.saturating_sub(1),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// Result of depositing a partial into a [`JoinRouter`].
#[derive(Debug, PartialEq, Eq)]
pub enum Deposit<T> {
    /// The other direction has not arrived yet.
    Waiting,
    /// Both partials were present and the fire closure ran.
    Fired(T),
    /// The index was already settled; the partial was dropped.
    Discarded,
}

struct JoinState<P> {
    pending: BTreeMap<usize, [Option<P>; 2]>,
    settled: BTreeSet<usize>,
}

/// Joins one forward and one backward partial per index.
pub struct JoinRouter<P> {
    name: String,
    state: Mutex<JoinState<P>>,
}

impl<P> JoinRouter<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(JoinState {
                pending: BTreeMap::new(),
                settled: BTreeSet::new(),
            }),
        }
    }

    /// Stores `partial` for `index`; when both directions are present, removes
    /// them and runs `fire(index, forward, backward)` under the lock.
    ///
    /// An index fires at most once. A second partial from the same direction
    /// for an unsettled index is an invariant violation.
    pub fn deposit<T, F>(&self, index: usize, direction: Direction, partial: P, fire: F) -> Result<Deposit<T>, PipelineError>
    where
        F: FnOnce(usize, P, P) -> Result<T, PipelineError>,
    {
        let mut state = self.state.lock();
        if state.settled.contains(&index) {
            debug!(router = %self.name, index, %direction, "late partial discarded");
            return Ok(Deposit::Discarded);
        }
        let ready = {
            let slots = state.pending.entry(index).or_insert_with(|| [None, None]);
            let slot = &mut slots[direction.slot()];
            if slot.is_some() {
                return Err(PipelineError::invariant(
                    &self.name,
                    format!("duplicate {direction} partial for index {index}"),
                ));
            }
            *slot = Some(partial);
            slots.iter().all(Option::is_some)
        };
        if !ready {
            return Ok(Deposit::Waiting);
        }

        state.settled.insert(index);
        match state.pending.remove(&index) {
            Some([Some(forward), Some(backward)]) => fire(index, forward, backward).map(Deposit::Fired),
            _ => Err(PipelineError::invariant(&self.name, format!("partials for index {index} vanished"))),
        }
    }

    /// Settles `index` without firing. Returns `true` if it was not settled before.
    pub fn fail(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        state.pending.remove(&index);
        state.settled.insert(index)
    }

    pub fn is_settled(&self, index: usize) -> bool {
        self.state.lock().settled.contains(&index)
    }

    /// Indices holding exactly one partial.
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

/// What a chain operation broke, for the caller to settle outside the lock.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChainProgress {
    /// Indices that became unreachable, in chain order.
    pub broken: Vec<usize>,
    /// Set when a submission was rejected: the rejected index's error.
    pub cause: Option<SampleError>,
}

struct ChainState<I, H> {
    /// Position of the step awaiting submission or completion.
    cursor: usize,
    in_flight: bool,
    /// Positions at or past this are unreachable.
    horizon: usize,
    inputs: BTreeMap<usize, I>,
    carry: Option<H>,
}

/// Strictly sequential recurrence over `len` indices in one direction.
///
/// Inputs may arrive in any order and are parked until their turn. Each step
/// consumes the input for its position and the carry produced by the previous
/// step; the seed carry feeds the origin.
pub struct Chain<I, H> {
    direction: Direction,
    len: usize,
    state: Mutex<ChainState<I, H>>,
}

impl<I, H> Chain<I, H> {
    pub fn new(direction: Direction, len: usize, seed: H) -> Self {
        Self {
            direction,
            len,
            state: Mutex::new(ChainState {
                cursor: 0,
                in_flight: false,
                horizon: len,
                inputs: BTreeMap::new(),
                carry: Some(seed),
            }),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn position(&self, index: usize) -> Result<usize, PipelineError> {
        if index >= self.len {
            return Err(PipelineError::invariant(
                self.direction.to_string(),
                format!("index {index} is outside a chain of {}", self.len),
            ));
        }
        Ok(match self.direction {
            Direction::Forward => index,
            Direction::Backward => self.len - 1 - index,
        })
    }

    fn index(&self, position: usize) -> usize {
        match self.direction {
            Direction::Forward => position,
            Direction::Backward => self.len - 1 - position,
        }
    }

    /// Parks the input for `index` and submits whatever became ready.
    ///
    /// `submit(index, input, carry)` returns `Ok(None)` when accepted and
    /// `Ok(Some(error))` when rejected, which breaks the chain at that index.
    pub fn offer_input<F>(&self, index: usize, input: I, submit: F) -> Result<ChainProgress, PipelineError>
    where
        F: FnMut(usize, I, H) -> Result<Option<SampleError>, PipelineError>,
    {
        let position = self.position(index)?;
        let mut state = self.state.lock();
        if position >= state.horizon {
            debug!(direction = %self.direction, index, "input past a broken chain discarded");
            return Ok(ChainProgress::default());
        }
        let consumed = position < state.cursor || (position == state.cursor && state.in_flight);
        if consumed || state.inputs.contains_key(&position) {
            return Err(PipelineError::invariant(
                self.direction.to_string(),
                format!("duplicate input for index {index}"),
            ));
        }
        state.inputs.insert(position, input);
        self.drain(&mut state, submit)
    }

    /// Records the carry produced by the step at `index` and submits the next
    /// step if its input is waiting.
    pub fn offer_carry<F>(&self, index: usize, carry: H, submit: F) -> Result<ChainProgress, PipelineError>
    where
        F: FnMut(usize, I, H) -> Result<Option<SampleError>, PipelineError>,
    {
        let position = self.position(index)?;
        let mut state = self.state.lock();
        if position >= state.horizon {
            debug!(direction = %self.direction, index, "carry past a broken chain discarded");
            return Ok(ChainProgress::default());
        }
        if position != state.cursor || !state.in_flight {
            return Err(PipelineError::invariant(
                self.direction.to_string(),
                format!("carry for index {index} arrived out of sequence"),
            ));
        }
        state.cursor += 1;
        state.in_flight = false;
        if state.cursor < state.horizon {
            state.carry = Some(carry);
        }
        self.drain(&mut state, submit)
    }

    /// Marks `index` and every later index unreachable.
    pub fn break_at(&self, index: usize) -> Result<Vec<usize>, PipelineError> {
        let position = self.position(index)?;
        let mut state = self.state.lock();
        Ok(self.break_locked(&mut state, position))
    }

    /// `true` once every reachable step has completed.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.cursor >= state.horizon
    }

    fn drain<F>(&self, state: &mut ChainState<I, H>, mut submit: F) -> Result<ChainProgress, PipelineError>
    where
        F: FnMut(usize, I, H) -> Result<Option<SampleError>, PipelineError>,
    {
        while state.cursor < state.horizon && !state.in_flight {
            let cursor = state.cursor;
            if state.carry.is_none() || !state.inputs.contains_key(&cursor) {
                break;
            }
            let (Some(input), Some(carry)) = (state.inputs.remove(&cursor), state.carry.take()) else {
                break;
            };
            let index = self.index(cursor);
            match submit(index, input, carry)? {
                None => state.in_flight = true,
                Some(cause) => {
                    let broken = self.break_locked(state, cursor);
                    return Ok(ChainProgress {
                        broken,
                        cause: Some(cause),
                    });
                }
            }
        }
        Ok(ChainProgress::default())
    }

    fn break_locked(&self, state: &mut ChainState<I, H>, position: usize) -> Vec<usize> {
        if position >= state.horizon {
            return Vec::new();
        }
        let broken = (position..state.horizon).map(|p| self.index(p)).collect();
        state.horizon = position;
        state.inputs.retain(|&p, _| p < position);
        if state.cursor >= position {
            state.in_flight = false;
            state.carry = None;
        }
        debug!(direction = %self.direction, from = self.index(position), "chain broken");
        broken
    }
}
