//! One completion pump per stage, each on its own OS thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::ReceiveMode;
use crate::engine::Polled;
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::stage::StageNode;

/// Drains one stage's engine and applies each completion to the stage.
pub(crate) struct Pump<M, S, R> {
    index: usize,
    node: Arc<StageNode<M, S, R>>,
    ledger: Arc<Ledger<M, R>>,
}

impl<M, S, R> Pump<M, S, R>
where
    M: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(index: usize, node: Arc<StageNode<M, S, R>>, ledger: Arc<Ledger<M, R>>) -> Self {
        Self { index, node, ledger }
    }

    /// Runs until the engine drains.
    ///
    /// A fatal error aborts the pipeline, after which the pump keeps draining
    /// (discarding completions) so the engine can wind down.
    pub(crate) fn run(self) {
        let _guard = PumpGuard {
            index: self.index,
            node: Arc::clone(&self.node),
            ledger: Arc::clone(&self.ledger),
        };
        info!(stage = %self.node.name(), "completion pump started");

        loop {
            let polled = match self.node.config().receive {
                ReceiveMode::Blocking => self.node.adapter().blocking_poll(),
                ReceiveMode::Polling { interval_us } => match self.node.adapter().try_poll() {
                    Some(polled) => polled,
                    None => {
                        thread::sleep(Duration::from_micros(interval_us));
                        continue;
                    }
                },
            };
            match polled {
                Polled::Completed(completion) => {
                    if let Err(err) = self.node.complete(completion) {
                        self.ledger.abort(err);
                    }
                }
                Polled::Drained => {
                    debug!(stage = %self.node.name(), "engine drained");
                    break;
                }
            }
        }
    }
}

/// Runs the pump's exit bookkeeping on every path out of [`Pump::run`],
/// including unwinding.
///
/// A panic aborts the pipeline so `join` is not left waiting on a pump that
/// will never hand the sentinel on.
struct PumpGuard<M, S, R> {
    index: usize,
    node: Arc<StageNode<M, S, R>>,
    ledger: Arc<Ledger<M, R>>,
}

impl<M, S, R> Drop for PumpGuard<M, S, R> {
    fn drop(&mut self) {
        let stage = self.node.name().to_string();
        if thread::panicking() {
            error!(stage = %stage, "completion pump panicked");
            self.ledger.abort(PipelineError::PumpPanicked { stage });
        } else if !self.ledger.is_aborting() {
            let count = self.node.pending_entries();
            if count > 0 {
                self.ledger.abort(PipelineError::Orphaned { stage, count });
            }
        }
        info!(stage = %self.node.name(), "completion pump exited");
        self.ledger.pump_exited(self.index);
    }
}
