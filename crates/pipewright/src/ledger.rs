//! Sample accounting and lifecycle for one pipeline.
//!
//! The ledger counts admitted samples until each is settled exactly once
//! (completed or failed), invokes the result callback, and drives the shutdown
//! sentinel: once input has ended and nothing is outstanding the first adapter
//! gets the sentinel, and each pump that exits hands it to the next adapter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::engine::EngineAdapter;
use crate::error::{PipelineError, SampleError};

/// Receives each sample's terminal result. May run on any pump thread.
pub type ResultCallback<M, R> = Arc<dyn Fn(M, Result<R, SampleError>) + Send + Sync>;

/// Where a pipeline is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Built, pumps not running.
    Idle,
    Running,
    /// Input has ended; the sentinel is working its way through the stages.
    Draining,
    /// Every pump has exited.
    Stopped,
}

struct LedgerState {
    lifecycle: Lifecycle,
    outstanding: usize,
    pumps_live: usize,
    sentinel_sent: bool,
    errors: Vec<PipelineError>,
}

pub(crate) struct Ledger<M, R> {
    pipeline: String,
    callback: RwLock<Option<ResultCallback<M, R>>>,
    state: Mutex<LedgerState>,
    stopped: Condvar,
    aborting: AtomicBool,
    adapters: Vec<Arc<EngineAdapter>>,
    admitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<M, R> Ledger<M, R> {
    pub(crate) fn new(pipeline: impl Into<String>, adapters: Vec<Arc<EngineAdapter>>) -> Self {
        Self {
            pipeline: pipeline.into(),
            callback: RwLock::new(None),
            state: Mutex::new(LedgerState {
                lifecycle: Lifecycle::Idle,
                outstanding: 0,
                pumps_live: 0,
                sentinel_sent: false,
                errors: Vec::new(),
            }),
            stopped: Condvar::new(),
            aborting: AtomicBool::new(false),
            adapters,
            admitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_callback(&self, callback: ResultCallback<M, R>) {
        if self.lifecycle() == Lifecycle::Stopped {
            warn!(pipeline = %self.pipeline, "result callback set after stop, ignored");
            return;
        }
        *self.callback.write() = Some(callback);
    }

    /// Moves `Idle -> Running` with `pumps` pumps about to be spawned.
    ///
    /// Returns `Ok(false)` when the pipeline was already started.
    pub(crate) fn try_start(&self, pumps: usize) -> Result<bool, PipelineError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Idle {
            return Ok(false);
        }
        if self.callback.read().is_none() {
            return Err(PipelineError::MissingCallback);
        }
        state.lifecycle = Lifecycle::Running;
        state.pumps_live = pumps;
        Ok(true)
    }

    /// Counts `count` new samples in. Fails unless the pipeline is running.
    pub(crate) fn admit(&self, count: usize) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        if state.lifecycle != Lifecycle::Running || self.is_aborting() {
            return Err(PipelineError::Closed);
        }
        state.outstanding += count;
        self.admitted.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn complete(&self, meta: M, result: R) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.deliver(meta, Ok(result));
    }

    pub(crate) fn fail(&self, meta: M, err: SampleError) {
        warn!(pipeline = %self.pipeline, error = %err, "sample failed");
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.deliver(meta, Err(err));
    }

    // The callback runs before the sample stops counting as outstanding, so a
    // returning `join` has seen every callback.
    fn deliver(&self, meta: M, result: Result<R, SampleError>) {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(meta, result),
            None => warn!(pipeline = %self.pipeline, "result dropped, no callback installed"),
        }
        self.settle();
    }

    fn settle(&self) {
        let (send, overdrawn) = {
            let mut state = self.state.lock();
            match state.outstanding.checked_sub(1) {
                Some(left) => {
                    state.outstanding = left;
                    (Self::take_sentinel(&mut state), false)
                }
                None => (false, true),
            }
        };
        if overdrawn {
            // More settlements than admissions: some sample was reported twice.
            self.abort(PipelineError::invariant(
                self.pipeline.as_str(),
                "sample settled with nothing outstanding",
            ));
            return;
        }
        if send {
            self.send_first_sentinel();
        }
    }

    fn take_sentinel(state: &mut LedgerState) -> bool {
        if state.lifecycle == Lifecycle::Draining && state.outstanding == 0 && !state.sentinel_sent {
            state.sentinel_sent = true;
            return true;
        }
        false
    }

    fn send_first_sentinel(&self) {
        info!(pipeline = %self.pipeline, "all samples settled, draining stages");
        if let Some(first) = self.adapters.first() {
            first.submit_sentinel();
        }
    }

    /// Marks the end of input. Idempotent.
    pub(crate) fn begin_drain(&self) {
        let send = {
            let mut state = self.state.lock();
            if state.lifecycle == Lifecycle::Running {
                state.lifecycle = Lifecycle::Draining;
                info!(pipeline = %self.pipeline, outstanding = state.outstanding, "end of input");
            }
            Self::take_sentinel(&mut state)
        };
        if send {
            self.send_first_sentinel();
        }
    }

    /// Records a fatal error and shuts every stage down.
    pub(crate) fn abort(&self, err: PipelineError) {
        error!(pipeline = %self.pipeline, error = %err, "pipeline aborting");
        self.aborting.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            state.errors.push(err);
            if state.lifecycle == Lifecycle::Running {
                state.lifecycle = Lifecycle::Draining;
            }
            state.sentinel_sent = true;
        }
        for adapter in &self.adapters {
            adapter.submit_sentinel();
        }
    }

    pub(crate) fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::Acquire)
    }

    /// Called by the pump for stage `index` as it exits.
    pub(crate) fn pump_exited(&self, index: usize) {
        if let Some(next) = self.adapters.get(index + 1) {
            next.submit_sentinel();
        }
        let stopped = {
            let mut state = self.state.lock();
            state.pumps_live = state.pumps_live.saturating_sub(1);
            if state.pumps_live == 0 && state.lifecycle != Lifecycle::Stopped {
                state.lifecycle = Lifecycle::Stopped;
                true
            } else {
                false
            }
        };
        if stopped {
            // Dropping the callback closes any result stream fed by it.
            let callback = self.callback.write().take();
            drop(callback);
            info!(pipeline = %self.pipeline, "pipeline stopped");
            self.stopped.notify_all();
        }
    }

    pub(crate) fn wait_stopped(&self) {
        let mut state = self.state.lock();
        while state.lifecycle != Lifecycle::Stopped {
            self.stopped.wait(&mut state);
        }
    }

    pub(crate) fn outcome(&self) -> Result<(), PipelineError> {
        PipelineError::aggregate(self.state.lock().errors.clone())
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub(crate) fn counts(&self) -> (u64, u64, u64) {
        (
            self.admitted.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }
}

/// Lets custom routing code settle samples it decided the fate of.
pub struct Settlement<M, R> {
    ledger: Arc<Ledger<M, R>>,
}

impl<M, R> Clone for Settlement<M, R> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
        }
    }
}

impl<M, R> Settlement<M, R> {
    pub(crate) fn new(ledger: Arc<Ledger<M, R>>) -> Self {
        Self { ledger }
    }

    pub fn complete(&self, meta: M, result: R) {
        self.ledger.complete(meta, result);
    }

    pub fn fail(&self, meta: M, err: SampleError) {
        self.ledger.fail(meta, err);
    }

    /// `true` once a fatal error has been recorded.
    pub fn is_aborting(&self) -> bool {
        self.ledger.is_aborting()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use parking_lot::Mutex as PlMutex;

    fn ledger_with(adapters: usize) -> (Arc<Ledger<u32, u32>>, Vec<MockEngine>) {
        let engines: Vec<MockEngine> = (0..adapters).map(|_| MockEngine::echo()).collect();
        let adapters = engines
            .iter()
            .enumerate()
            .map(|(i, e)| Arc::new(EngineAdapter::new(format!("s{i}"), e.clone())))
            .collect();
        (Arc::new(Ledger::new("test", adapters)), engines)
    }

    #[test]
    fn test_start_requires_callback() {
        let (ledger, _) = ledger_with(1);
        assert_eq!(ledger.try_start(1), Err(PipelineError::MissingCallback));
        ledger.set_callback(Arc::new(|_, _| {}));
        assert_eq!(ledger.try_start(1), Ok(true));
        assert_eq!(ledger.try_start(1), Ok(false));
    }

    #[test]
    fn test_admit_only_while_running() {
        let (ledger, _) = ledger_with(1);
        assert_eq!(ledger.admit(1), Err(PipelineError::Closed));
        ledger.set_callback(Arc::new(|_, _| {}));
        ledger.try_start(1).unwrap();
        ledger.admit(2).unwrap();
        ledger.begin_drain();
        assert_eq!(ledger.admit(1), Err(PipelineError::Closed));
        assert_eq!(ledger.outstanding(), 2);
    }

    #[test]
    fn test_sentinel_waits_for_last_settlement() {
        let (ledger, engines) = ledger_with(2);
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ledger.set_callback(Arc::new(move |meta, result| sink.lock().push((meta, result))));
        ledger.try_start(2).unwrap();
        ledger.admit(2).unwrap();

        ledger.begin_drain();
        assert_eq!(engines[0].sentinels(), 0);
        ledger.complete(1, 10);
        assert_eq!(engines[0].sentinels(), 0);
        ledger.fail(2, SampleError::ChainBroken {
            direction: crate::router::Direction::Forward,
            origin: 0,
        });
        assert_eq!(engines[0].sentinels(), 1);
        assert_eq!(engines[1].sentinels(), 0);
        assert_eq!(seen.lock().len(), 2);

        ledger.pump_exited(0);
        assert_eq!(engines[1].sentinels(), 1);
        assert_eq!(ledger.lifecycle(), Lifecycle::Draining);
        ledger.pump_exited(1);
        assert_eq!(ledger.lifecycle(), Lifecycle::Stopped);
        ledger.wait_stopped();
        assert_eq!(ledger.outcome(), Ok(()));
    }

    #[test]
    fn test_abort_sentinels_every_adapter() {
        let (ledger, engines) = ledger_with(3);
        ledger.set_callback(Arc::new(|_, _| {}));
        ledger.try_start(3).unwrap();
        ledger.abort(PipelineError::Closed);
        assert!(ledger.is_aborting());
        assert!(engines.iter().all(|e| e.sentinels() == 1));
        assert_eq!(ledger.outcome(), Err(PipelineError::Closed));
    }

    #[test]
    fn test_settling_twice_is_invariant() {
        let (ledger, engines) = ledger_with(1);
        ledger.set_callback(Arc::new(|_, _| {}));
        ledger.try_start(1).unwrap();
        ledger.admit(1).unwrap();
        ledger.complete(4, 40);
        assert_eq!(ledger.outstanding(), 0);
        assert!(!ledger.is_aborting());

        ledger.complete(4, 40);
        assert_eq!(ledger.outstanding(), 0);
        assert!(ledger.is_aborting());
        assert_eq!(engines[0].sentinels(), 1);
        assert!(matches!(ledger.outcome(), Err(PipelineError::Invariant { .. })));
    }
}
