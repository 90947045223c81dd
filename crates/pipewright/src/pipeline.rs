use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, StageConfig};
use crate::engine::{Engine, EngineAdapter};
use crate::error::{ConfigError, PipelineError, SampleError};
use crate::ledger::{Ledger, Lifecycle, ResultCallback, Settlement};
use crate::pump::Pump;
use crate::stage::{Downstream, Stage, StageHandle, StageNode, StageStats};

/// Snapshot of a pipeline's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub id: Uuid,
    pub name: String,
    pub lifecycle: Lifecycle,
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: usize,
    pub stages: Vec<StageStats>,
}

impl PipelineStats {
    /// Stages that forced at least one sample past their iteration cap.
    pub fn capped(&self) -> u64 {
        self.stages.iter().map(|s| s.capped).sum()
    }
}

/// Stages, their completion pumps, and the sample ledger, run as one unit.
///
/// ## Lifecycle
///
/// A pipeline is built `Idle`. The first [`put`](Pipeline::put) (or an
/// explicit [`start`](Pipeline::start)) spawns one pump thread per stage and
/// moves it to `Running`. [`signal_end_of_input`](Pipeline::signal_end_of_input)
/// moves it to `Draining`; once every admitted sample has settled the sentinel
/// is sent to the first stage and handed down stage by stage as each pump
/// exits. When the last pump exits the pipeline is `Stopped` and
/// [`join`](Pipeline::join) returns.
///
/// ## Errors
///
/// Per-sample failures go to the result callback. Structural failures abort the
/// pipeline and are returned from `join`.
pub struct Pipeline<M, S, R> {
    id: Uuid,
    name: String,
    nodes: Vec<Arc<StageNode<M, S, R>>>,
    entry: Arc<dyn Downstream<M, S, R>>,
    ledger: Arc<Ledger<M, R>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl<M, S, R> Pipeline<M, S, R>
where
    M: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the callback that receives each sample's result.
    ///
    /// Must happen before the pipeline starts. The callback may run on any
    /// pump thread, and on the caller's thread when a submission is rejected
    /// synchronously.
    pub fn set_result_callback<F>(&self, callback: F)
    where
        F: Fn(M, Result<R, SampleError>) + Send + Sync + 'static,
    {
        self.ledger.set_callback(Arc::new(callback));
    }

    /// Spawns the completion pumps. Idempotent.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut pumps = self.pumps.lock();
        if !self.ledger.try_start(self.nodes.len())? {
            return Ok(());
        }
        for (index, node) in self.nodes.iter().enumerate() {
            let pump = Pump::new(index, Arc::clone(node), Arc::clone(&self.ledger));
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.name, node.name()))
                .spawn(move || pump.run());
            match spawned {
                Ok(handle) => pumps.push(handle),
                Err(err) => {
                    let err = PipelineError::Spawn {
                        stage: node.name().to_string(),
                        reason: err.to_string(),
                    };
                    self.ledger.abort(err.clone());
                    for unspawned in index..self.nodes.len() {
                        self.ledger.pump_exited(unspawned);
                    }
                    return Err(err);
                }
            }
        }
        info!(pipeline = %self.id, name = %self.name, stages = self.nodes.len(), "pipeline started");
        Ok(())
    }

    /// Admits one sample and submits it to the entry stage.
    ///
    /// Never waits for inference. Starts the pipeline if it is idle.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Closed`] after end of input or an abort
    /// * a structural error from the entry stage, which also aborts the pipeline
    pub fn put(&self, meta: M, state: S) -> Result<(), PipelineError> {
        self.admit(1)?;
        self.enter(meta, state)
    }

    /// Hands an already admitted sample to the entry stage.
    pub(crate) fn enter(&self, meta: M, state: S) -> Result<(), PipelineError> {
        if let Err(err) = self.entry.deliver(meta, state) {
            self.ledger.abort(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Starts if needed, then counts `count` samples in.
    pub(crate) fn admit(&self, count: usize) -> Result<(), PipelineError> {
        if self.ledger.lifecycle() == Lifecycle::Idle {
            self.start()?;
        }
        self.ledger.admit(count)
    }

    pub(crate) fn abort(&self, err: PipelineError) {
        self.ledger.abort(err);
    }

    /// Marks the end of input. Idempotent.
    pub fn signal_end_of_input(&self) -> Result<(), PipelineError> {
        if self.ledger.lifecycle() == Lifecycle::Idle {
            self.start()?;
        }
        self.ledger.begin_drain();
        Ok(())
    }

    /// Ends input, waits for every pump to exit, and reports fatal errors.
    ///
    /// Calling it again returns the same outcome without re-running anything.
    pub fn join(&self) -> Result<(), PipelineError> {
        if let Err(err) = self.signal_end_of_input() {
            if self.ledger.lifecycle() == Lifecycle::Idle {
                return Err(err);
            }
        }
        self.ledger.wait_stopped();
        let handles: Vec<JoinHandle<()>> = self.pumps.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(pipeline = %self.id, "pump thread ended by panic");
            }
        }
        self.ledger.outcome()
    }

    /// `true` while `put` can still admit samples.
    pub fn accepts_input(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Idle | Lifecycle::Running) && !self.ledger.is_aborting()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.ledger.lifecycle()
    }

    /// Samples admitted and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.ledger.outstanding()
    }

    pub fn stats(&self) -> PipelineStats {
        let (admitted, completed, failed) = self.ledger.counts();
        PipelineStats {
            id: self.id,
            name: self.name.clone(),
            lifecycle: self.ledger.lifecycle(),
            admitted,
            completed,
            failed,
            in_flight: self.ledger.outstanding(),
            stages: self.nodes.iter().map(|node| node.stats()).collect(),
        }
    }

    /// Logs the current stats.
    pub fn show(&self) {
        let stats = self.stats();
        info!(
            pipeline = %stats.id,
            name = %stats.name,
            lifecycle = ?stats.lifecycle,
            admitted = stats.admitted,
            completed = stats.completed,
            failed = stats.failed,
            in_flight = stats.in_flight,
            "pipeline stats"
        );
        for stage in &stats.stages {
            info!(
                pipeline = %stats.id,
                stage = %stage.engine.name,
                runner = stage.engine.runner,
                submitted = stage.engine.submitted,
                completed = stage.engine.completed,
                invalid = stage.engine.invalid,
                continued = stage.continued,
                capped = stage.capped,
                pending = stage.pending_entries,
                "stage stats"
            );
        }
    }
}

impl<M, S, R> Drop for Pipeline<M, S, R> {
    fn drop(&mut self) {
        match self.ledger.lifecycle() {
            Lifecycle::Idle | Lifecycle::Stopped => {}
            Lifecycle::Running | Lifecycle::Draining => {
                warn!(pipeline = %self.id, name = %self.name, "pipeline dropped before join, aborting");
                self.ledger.abort(PipelineError::Closed);
            }
        }
    }
}

struct PendingStage<M, S, R> {
    name: String,
    stage: Box<dyn Stage<M, S, R>>,
    adapter: EngineAdapter,
    config: Option<StageConfig>,
}

/// Assembles a [`Pipeline`] from stages in topological order.
///
/// # Example
///
/// ```ignore
/// let pipeline = PipelineBuilder::new("classify")
///     .stage("model", engine, ClassifyStage)
///     .on_result(|key, result| println!("{key}: {result:?}"))
///     .build()?;
/// pipeline.put(0, input)?;
/// pipeline.join()?;
/// ```
pub struct PipelineBuilder<M, S, R> {
    config: PipelineConfig,
    stages: Vec<PendingStage<M, S, R>>,
    callback: Option<ResultCallback<M, R>>,
}

impl<M, S, R> PipelineBuilder<M, S, R>
where
    M: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(PipelineConfig::named(name))
    }

    /// Starts from a deserialized config; stage settings are looked up by name.
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            callback: None,
        }
    }

    /// Appends a stage using the configured settings for `name`.
    pub fn stage(self, name: impl Into<String>, engine: impl Engine, stage: impl Stage<M, S, R>) -> Self {
        self.push(name.into(), engine, Box::new(stage), None)
    }

    /// Appends a stage with explicit settings.
    pub fn stage_with(
        self,
        name: impl Into<String>,
        engine: impl Engine,
        stage: impl Stage<M, S, R>,
        config: StageConfig,
    ) -> Self {
        self.push(name.into(), engine, Box::new(stage), Some(config))
    }

    fn push(
        mut self,
        name: String,
        engine: impl Engine,
        stage: Box<dyn Stage<M, S, R>>,
        config: Option<StageConfig>,
    ) -> Self {
        let adapter = EngineAdapter::new(name.clone(), engine);
        self.stages.push(PendingStage {
            name,
            stage,
            adapter,
            config,
        });
        self
    }

    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(M, Result<R, SampleError>) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Wires each stage to the next; the last stage must finalize.
    pub fn build(self) -> Result<Pipeline<M, S, R>, PipelineError> {
        self.build_wired(|stages, _| {
            for pair in stages.windows(2) {
                pair[0].connect(Arc::new(pair[1].clone()))?;
            }
            match stages.first() {
                Some(first) => Ok(Arc::new(first.clone()) as Arc<dyn Downstream<M, S, R>>),
                None => Err(ConfigError::NoStages.into()),
            }
        })
    }

    /// Builds the stages and lets `wire` connect them.
    ///
    /// `wire` receives the stage handles in declaration order and a
    /// [`Settlement`] for routers that settle samples themselves. It returns
    /// the downstream that [`Pipeline::put`] delivers into.
    pub fn build_wired<W>(self, wire: W) -> Result<Pipeline<M, S, R>, PipelineError>
    where
        W: FnOnce(&[StageHandle<M, S, R>], &Settlement<M, R>) -> Result<Arc<dyn Downstream<M, S, R>>, PipelineError>,
    {
        self.config.validate()?;
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages.into());
        }
        let mut seen = HashSet::new();
        for pending in &self.stages {
            if !seen.insert(pending.name.as_str()) {
                return Err(ConfigError::DuplicateStage(pending.name.clone()).into());
            }
            if let Some(config) = &pending.config {
                config.validate()?;
            }
        }

        let name = self.config.name.clone();
        let mut adapters = Vec::with_capacity(self.stages.len());
        let mut parts = Vec::with_capacity(self.stages.len());
        for pending in self.stages {
            let adapter = Arc::new(pending.adapter);
            let config = pending.config.unwrap_or_else(|| self.config.stage(&pending.name));
            adapters.push(Arc::clone(&adapter));
            parts.push((pending.name, pending.stage, adapter, config));
        }

        let ledger = Arc::new(Ledger::new(name.clone(), adapters));
        if let Some(callback) = self.callback {
            ledger.set_callback(callback);
        }
        let nodes: Vec<Arc<StageNode<M, S, R>>> = parts
            .into_iter()
            .map(|(stage_name, stage, adapter, config)| {
                Arc::new(StageNode::new(stage_name, stage, adapter, config, Arc::clone(&ledger)))
            })
            .collect();
        let handles: Vec<StageHandle<M, S, R>> = nodes.iter().map(|n| StageHandle::new(Arc::clone(n))).collect();
        let entry = wire(&handles, &Settlement::new(Arc::clone(&ledger)))?;

        Ok(Pipeline {
            id: Uuid::new_v4(),
            name,
            nodes,
            entry,
            ledger,
            pumps: Mutex::new(Vec::new()),
        })
    }
}
