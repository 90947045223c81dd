//! Bidirectional recurrent video pipeline.
//!
//! Every frame of a clip runs through four stages:
//!
//! 1. `flow` estimates motion against the previous frame (forward direction)
//!    and against the next frame (backward direction). Flows for all frames
//!    are submitted up front and complete in any order.
//! 2. `backward` and `forward` run a residual block per frame, strictly in
//!    sequence along their direction: frame `i` needs its own flow and the
//!    hidden state produced for its predecessor.
//! 3. `fusion` combines both hidden states for a frame once both exist.
//!
//! Sequencing is done by one [`Chain`] per direction per clip; the join is a
//! per-clip [`JoinRouter`]. Frames are keyed by `(clip, index)`.
//!
//! When a frame fails in one direction every later frame of that direction is
//! unreachable. The failing frame reports its own error and the rest report
//! [`SampleError::ChainBroken`]; each frame is reported exactly once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::engine::Engine;
use crate::error::{PipelineError, SampleError, StageError, TransformError};
use crate::ledger::Settlement;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineStats};
use crate::router::{Chain, ChainProgress, Deposit, Direction, JoinRouter};
use crate::stage::{Downstream, Stage, StageHandle, StageOutcome, StepContext, Submission, WeakStageHandle};
use crate::tensor::Tensor;

use super::first;

const FLOW: &str = "flow";
const BACKWARD: &str = "backward";
const FORWARD: &str = "forward";
const FUSION: &str = "fusion";

/// The tensor plumbing of a bidirectional recurrent model.
///
/// Defaults pass tensors straight through and take the first output of each
/// engine; a model only has to say how a residual step is fed.
pub trait RecurrentVideoModel: Send + Sync + 'static {
    fn flow_inputs(&self, frame: &Tensor, neighbor: &Tensor) -> Result<Vec<Tensor>, TransformError> {
        Ok(vec![frame.clone(), neighbor.clone()])
    }

    fn flow(&self, outputs: Vec<Tensor>) -> Result<Tensor, TransformError> {
        first(outputs)
    }

    /// Inputs for one residual step. `flow` is `None` for the first frame of
    /// the direction, and so is `hidden`.
    fn residual_inputs(
        &self,
        direction: Direction,
        frame: &Tensor,
        flow: Option<&Tensor>,
        hidden: Option<&Tensor>,
    ) -> Result<Vec<Tensor>, TransformError>;

    fn hidden(&self, outputs: Vec<Tensor>) -> Result<Tensor, TransformError> {
        first(outputs)
    }

    fn fusion_inputs(&self, frame: &Tensor, forward: &Tensor, backward: &Tensor) -> Result<Vec<Tensor>, TransformError> {
        Ok(vec![backward.clone(), forward.clone(), frame.clone()])
    }

    fn output(&self, outputs: Vec<Tensor>) -> Result<Tensor, TransformError> {
        first(outputs)
    }
}

/// Identifies one clip submitted to a [`VideoPipeline`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClipId(u64);

impl ClipId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clip-{}", self.0)
    }
}

/// The key a frame's result is reported under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameKey {
    pub clip: ClipId,
    pub index: usize,
}

struct ClipContext {
    id: ClipId,
    frames: Vec<Tensor>,
    forward: Chain<Option<Tensor>, Option<Tensor>>,
    backward: Chain<Option<Tensor>, Option<Tensor>>,
    join: JoinRouter<Tensor>,
}

impl ClipContext {
    fn new(id: ClipId, frames: Vec<Tensor>) -> Self {
        let len = frames.len();
        Self {
            id,
            frames,
            forward: Chain::new(Direction::Forward, len, None),
            backward: Chain::new(Direction::Backward, len, None),
            join: JoinRouter::new(format!("{id}-fusion")),
        }
    }

    fn chain(&self, direction: Direction) -> &Chain<Option<Tensor>, Option<Tensor>> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }
}

struct FrameTag {
    key: FrameKey,
    /// `None` for fusion requests.
    direction: Option<Direction>,
    clip: Arc<ClipContext>,
}

impl FrameTag {
    fn new(clip: &Arc<ClipContext>, index: usize, direction: Option<Direction>) -> Self {
        Self {
            key: FrameKey { clip: clip.id, index },
            direction,
            clip: Arc::clone(clip),
        }
    }

    fn frame(&self) -> Result<&Tensor, StageError> {
        self.clip
            .frames
            .get(self.key.index)
            .ok_or_else(|| StageError::MissingPrerequisite(format!("{} has no frame {}", self.key.clip, self.key.index)))
    }

    fn direction(&self) -> Result<Direction, PipelineError> {
        self.direction
            .ok_or_else(|| PipelineError::invariant("recurrence", "frame request carries no direction"))
    }
}

enum FrameState {
    Flow { neighbor: usize },
    Flowed(Tensor),
    Residual { flow: Option<Tensor>, hidden: Option<Tensor> },
    Hidden(Tensor),
    Fusion { forward: Tensor, backward: Tensor },
}

impl FrameState {
    fn unexpected(&self, stage: &str) -> StageError {
        let state = match self {
            FrameState::Flow { .. } => "flow request",
            FrameState::Flowed(_) => "flow",
            FrameState::Residual { .. } => "residual request",
            FrameState::Hidden(_) => "hidden state",
            FrameState::Fusion { .. } => "fusion request",
        };
        StageError::MissingPrerequisite(format!("{stage} stage was handed a {state}"))
    }
}

struct FlowStage<V> {
    model: Arc<V>,
}

impl<V: RecurrentVideoModel> Stage<FrameTag, FrameState, Tensor> for FlowStage<V> {
    fn prepare(&self, ctx: &StepContext<'_, FrameTag>, state: &FrameState) -> Result<Vec<Tensor>, StageError> {
        let FrameState::Flow { neighbor } = state else {
            return Err(state.unexpected(FLOW));
        };
        let neighbor = ctx
            .meta
            .clip
            .frames
            .get(*neighbor)
            .ok_or_else(|| StageError::MissingPrerequisite(format!("no neighbor frame {neighbor}")))?;
        Ok(self.model.flow_inputs(ctx.meta.frame()?, neighbor)?)
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, FrameTag>,
        outputs: Vec<Tensor>,
        _: FrameState,
    ) -> Result<StageOutcome<FrameState, Tensor>, StageError> {
        Ok(StageOutcome::Advance(FrameState::Flowed(self.model.flow(outputs)?)))
    }
}

struct ResidualStage<V> {
    model: Arc<V>,
    direction: Direction,
}

impl<V: RecurrentVideoModel> Stage<FrameTag, FrameState, Tensor> for ResidualStage<V> {
    fn prepare(&self, ctx: &StepContext<'_, FrameTag>, state: &FrameState) -> Result<Vec<Tensor>, StageError> {
        let FrameState::Residual { flow, hidden } = state else {
            return Err(state.unexpected(ctx.stage));
        };
        Ok(self
            .model
            .residual_inputs(self.direction, ctx.meta.frame()?, flow.as_ref(), hidden.as_ref())?)
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, FrameTag>,
        outputs: Vec<Tensor>,
        _: FrameState,
    ) -> Result<StageOutcome<FrameState, Tensor>, StageError> {
        Ok(StageOutcome::Advance(FrameState::Hidden(self.model.hidden(outputs)?)))
    }
}

struct FusionStage<V> {
    model: Arc<V>,
}

impl<V: RecurrentVideoModel> Stage<FrameTag, FrameState, Tensor> for FusionStage<V> {
    fn prepare(&self, ctx: &StepContext<'_, FrameTag>, state: &FrameState) -> Result<Vec<Tensor>, StageError> {
        let FrameState::Fusion { forward, backward } = state else {
            return Err(state.unexpected(FUSION));
        };
        Ok(self.model.fusion_inputs(ctx.meta.frame()?, forward, backward)?)
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, FrameTag>,
        outputs: Vec<Tensor>,
        _: FrameState,
    ) -> Result<StageOutcome<FrameState, Tensor>, StageError> {
        Ok(StageOutcome::Finalize(self.model.output(outputs)?))
    }
}

/// What the routers need to move frames between stages.
struct Recurrence {
    backward: WeakStageHandle<FrameTag, FrameState, Tensor>,
    forward: WeakStageHandle<FrameTag, FrameState, Tensor>,
    fusion: WeakStageHandle<FrameTag, FrameState, Tensor>,
    settlement: Settlement<FrameTag, Tensor>,
}

impl Recurrence {
    fn stage(&self, weak: &WeakStageHandle<FrameTag, FrameState, Tensor>) -> Result<StageHandle<FrameTag, FrameState, Tensor>, PipelineError> {
        weak.upgrade().ok_or(PipelineError::Closed)
    }

    /// Submits one residual step; a rejection comes back as the error that
    /// breaks the chain.
    fn submit_residual(
        &self,
        clip: &Arc<ClipContext>,
        direction: Direction,
        index: usize,
        flow: Option<Tensor>,
        hidden: Option<Tensor>,
    ) -> Result<Option<SampleError>, PipelineError> {
        let stage = match direction {
            Direction::Forward => self.stage(&self.forward)?,
            Direction::Backward => self.stage(&self.backward)?,
        };
        let tag = FrameTag::new(clip, index, Some(direction));
        match stage.try_submit(tag, FrameState::Residual { flow, hidden })? {
            Submission::Accepted(_) | Submission::Skipped => Ok(None),
            Submission::Rejected { error, .. } => Ok(Some(error)),
        }
    }

    fn offer_input(&self, clip: &Arc<ClipContext>, direction: Direction, index: usize, flow: Option<Tensor>) -> Result<(), PipelineError> {
        let progress = clip.chain(direction).offer_input(index, flow, |index, flow, hidden| {
            self.submit_residual(clip, direction, index, flow, hidden)
        })?;
        self.settle_broken(clip, direction, progress);
        Ok(())
    }

    /// Fails every frame a broken chain can no longer reach.
    fn settle_broken(&self, clip: &Arc<ClipContext>, direction: Direction, progress: ChainProgress) {
        let ChainProgress { broken, cause } = progress;
        let Some(&origin) = broken.first() else {
            return;
        };
        warn!(clip = %clip.id, %direction, origin, frames = broken.len(), "recurrence broken");
        for index in broken {
            if !clip.join.fail(index) {
                continue;
            }
            let err = match &cause {
                Some(cause) if index == origin => cause.clone(),
                _ => SampleError::ChainBroken { direction, origin },
            };
            self.settlement.fail(FrameTag::new(clip, index, None), err);
        }
    }

    fn break_chain(&self, tag: FrameTag, error: SampleError) -> Result<(), PipelineError> {
        let Some(direction) = tag.direction else {
            self.settlement.fail(tag, error);
            return Ok(());
        };
        let broken = tag.clip.chain(direction).break_at(tag.key.index)?;
        self.settle_broken(
            &tag.clip,
            direction,
            ChainProgress {
                broken,
                cause: Some(error),
            },
        );
        Ok(())
    }
}

/// Sits behind `flow`: parks each flow in its direction's chain.
struct FlowRoute(Arc<Recurrence>);

impl Downstream<FrameTag, FrameState, Tensor> for FlowRoute {
    fn deliver(&self, tag: FrameTag, state: FrameState) -> Result<(), PipelineError> {
        let FrameState::Flowed(flow) = state else {
            return Err(PipelineError::invariant(FLOW, "flow stage advanced something other than a flow"));
        };
        let direction = tag.direction()?;
        self.0.offer_input(&tag.clip, direction, tag.key.index, Some(flow))
    }

    fn abandon(&self, tag: FrameTag, error: SampleError) -> Result<(), PipelineError> {
        self.0.break_chain(tag, error)
    }
}

/// Sits behind both residual stages: moves the chain on and feeds the join.
struct ResidualRoute(Arc<Recurrence>);

impl Downstream<FrameTag, FrameState, Tensor> for ResidualRoute {
    fn deliver(&self, tag: FrameTag, state: FrameState) -> Result<(), PipelineError> {
        let FrameState::Hidden(hidden) = state else {
            return Err(PipelineError::invariant("recurrence", "residual stage advanced something other than a hidden state"));
        };
        let direction = tag.direction()?;
        let FrameTag { key, clip, .. } = tag;
        let recurrence = &self.0;

        let progress = clip.chain(direction).offer_carry(key.index, Some(hidden.clone()), |index, flow, hidden| {
            recurrence.submit_residual(&clip, direction, index, flow, hidden)
        })?;
        recurrence.settle_broken(&clip, direction, progress);

        let fusion = recurrence.stage(&recurrence.fusion)?;
        let deposit = clip.join.deposit(key.index, direction, hidden, |index, forward, backward| {
            fusion.try_submit(FrameTag::new(&clip, index, None), FrameState::Fusion { forward, backward })
        })?;
        if let Deposit::Fired(Submission::Rejected { meta, error }) = deposit {
            recurrence.settlement.fail(meta, error);
        }
        Ok(())
    }

    fn abandon(&self, tag: FrameTag, error: SampleError) -> Result<(), PipelineError> {
        self.0.break_chain(tag, error)
    }
}

/// Engines for the four stages of a [`VideoPipeline`].
pub struct VideoEngines {
    pub flow: Box<dyn Engine>,
    pub backward: Box<dyn Engine>,
    pub forward: Box<dyn Engine>,
    pub fusion: Box<dyn Engine>,
}

/// Runs whole clips through a bidirectional recurrent model, reporting one
/// result per frame.
pub struct VideoPipeline {
    inner: Pipeline<FrameTag, FrameState, Tensor>,
    recurrence: Arc<Recurrence>,
    flow: StageHandle<FrameTag, FrameState, Tensor>,
    next_clip: AtomicU64,
}

impl VideoPipeline {
    pub fn new<V, F>(model: V, engines: VideoEngines, config: PipelineConfig, callback: F) -> Result<Self, PipelineError>
    where
        V: RecurrentVideoModel,
        F: Fn(FrameKey, Result<Tensor, SampleError>) + Send + Sync + 'static,
    {
        let model = Arc::new(model);
        let mut wired = None;
        let inner = PipelineBuilder::with_config(config)
            .stage(FLOW, engines.flow, FlowStage { model: Arc::clone(&model) })
            .stage(
                BACKWARD,
                engines.backward,
                ResidualStage {
                    model: Arc::clone(&model),
                    direction: Direction::Backward,
                },
            )
            .stage(
                FORWARD,
                engines.forward,
                ResidualStage {
                    model: Arc::clone(&model),
                    direction: Direction::Forward,
                },
            )
            .stage(FUSION, engines.fusion, FusionStage { model })
            .on_result(move |tag: FrameTag, result| callback(tag.key, result))
            .build_wired(|stages, settlement| {
                let [flow, backward, forward, fusion] = stages else {
                    return Err(PipelineError::invariant("video", "expected exactly four stages"));
                };
                let recurrence = Arc::new(Recurrence {
                    backward: backward.downgrade(),
                    forward: forward.downgrade(),
                    fusion: fusion.downgrade(),
                    settlement: settlement.clone(),
                });
                flow.connect(Arc::new(FlowRoute(Arc::clone(&recurrence))))?;
                let residual: Arc<dyn Downstream<FrameTag, FrameState, Tensor>> =
                    Arc::new(ResidualRoute(Arc::clone(&recurrence)));
                backward.connect(Arc::clone(&residual))?;
                forward.connect(residual)?;
                wired = Some((recurrence, flow.clone()));
                Ok(Arc::new(flow.clone()) as Arc<dyn Downstream<FrameTag, FrameState, Tensor>>)
            })?;
        let (recurrence, flow) = wired.ok_or_else(|| PipelineError::invariant("video", "stages were not wired"))?;
        Ok(Self {
            inner,
            recurrence,
            flow,
            next_clip: AtomicU64::new(0),
        })
    }

    /// Admits every frame of a clip and starts both recurrences.
    ///
    /// Returns as soon as the work is queued. An empty clip is accepted and
    /// produces no results.
    pub fn put_clip(&self, frames: Vec<Tensor>) -> Result<ClipId, PipelineError> {
        let id = ClipId(self.next_clip.fetch_add(1, Ordering::Relaxed));
        if frames.is_empty() {
            debug!(clip = %id, "empty clip ignored");
            return Ok(id);
        }
        let clip = Arc::new(ClipContext::new(id, frames));
        self.inner.admit(clip.frames.len())?;
        debug!(clip = %id, frames = clip.frames.len(), "clip admitted");
        if let Err(err) = self.launch(&clip) {
            self.inner.abort(err.clone());
            return Err(err);
        }
        Ok(id)
    }

    fn launch(&self, clip: &Arc<ClipContext>) -> Result<(), PipelineError> {
        let len = clip.frames.len();
        for direction in [Direction::Forward, Direction::Backward] {
            self.recurrence.offer_input(clip, direction, direction.origin(len), None)?;
        }
        for index in 0..len {
            for direction in [Direction::Forward, Direction::Backward] {
                if let Some(neighbor) = direction.predecessor(index, len) {
                    self.flow
                        .submit(FrameTag::new(clip, index, Some(direction)), FrameState::Flow { neighbor })?;
                }
            }
        }
        Ok(())
    }

    /// Ends input and waits for every admitted frame.
    pub fn join(&self) -> Result<(), PipelineError> {
        self.inner.join()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::engine::mock::{MockEngine, Release};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    const WIDTH: usize = 4;

    /// Flow is `frame - neighbor`, a residual step is
    /// `hidden * 0.5 + frame + flow`, fusion is `backward + forward + frame`.
    struct Toy;

    impl RecurrentVideoModel for Toy {
        fn residual_inputs(
            &self,
            _: Direction,
            frame: &Tensor,
            flow: Option<&Tensor>,
            hidden: Option<&Tensor>,
        ) -> Result<Vec<Tensor>, TransformError> {
            let zeros = Tensor::zeros(frame.shape(), frame.kind())?;
            Ok(vec![
                frame.clone(),
                flow.cloned().unwrap_or_else(|| zeros.clone()),
                hidden.cloned().unwrap_or(zeros),
            ])
        }
    }

    fn elementwise(inputs: &[Tensor], f: impl Fn(&[f32]) -> f32) -> Result<Vec<Tensor>, String> {
        let columns = inputs
            .iter()
            .map(|t| t.to_vec::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        let out: Vec<f32> = (0..columns[0].len())
            .map(|i| f(&columns.iter().map(|c| c[i]).collect::<Vec<_>>()))
            .collect();
        Ok(vec![Tensor::vector(&out)])
    }

    fn engine(name: &str, f: fn(&[f32]) -> f32) -> Box<dyn Engine> {
        Box::new(LocalEngine::with_workers(name, 3, move |inputs| elementwise(inputs, f)).unwrap())
    }

    fn flow(row: &[f32]) -> f32 {
        row[0] - row[1]
    }

    fn residual(row: &[f32]) -> f32 {
        row[2] * 0.5 + row[0] + row[1]
    }

    fn fusion(row: &[f32]) -> f32 {
        row[0] + row[1] + row[2]
    }

    fn engines() -> VideoEngines {
        VideoEngines {
            flow: engine("flow", flow),
            backward: engine("backward", residual),
            forward: engine("forward", residual),
            fusion: engine("fusion", fusion),
        }
    }

    fn clip(len: usize, scale: f32) -> Vec<Vec<f32>> {
        (0..len)
            .map(|i| (0..WIDTH).map(|j| (i * WIDTH + j) as f32 * scale).collect())
            .collect()
    }

    /// The same recurrence computed one frame at a time.
    fn reference(frames: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let len = frames.len();
        let step = |frame: &[f32], neighbor: Option<&Vec<f32>>, hidden: Option<&Vec<f32>>| -> Vec<f32> {
            (0..WIDTH)
                .map(|j| {
                    let motion = neighbor.map_or(0.0, |n| flow(&[frame[j], n[j]]));
                    residual(&[frame[j], motion, hidden.map_or(0.0, |h| h[j])])
                })
                .collect()
        };
        let mut forward: Vec<Vec<f32>> = Vec::with_capacity(len);
        for i in 0..len {
            let h = step(&frames[i], i.checked_sub(1).map(|p| &frames[p]), forward.last());
            forward.push(h);
        }
        let mut backward: Vec<Vec<f32>> = vec![Vec::new(); len];
        for i in (0..len).rev() {
            let next = (i + 1 < len).then(|| i + 1);
            backward[i] = step(&frames[i], next.map(|n| &frames[n]), next.map(|n| &backward[n]));
        }
        (0..len)
            .map(|i| (0..WIDTH).map(|j| fusion(&[backward[i][j], forward[i][j], frames[i][j]])).collect())
            .collect()
    }

    type Results = Arc<Mutex<BTreeMap<FrameKey, Result<Tensor, SampleError>>>>;

    fn collect() -> (Results, impl Fn(FrameKey, Result<Tensor, SampleError>) + Send + Sync + 'static) {
        let results: Results = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = Arc::clone(&results);
        (results, move |key, result| {
            assert!(sink.lock().insert(key, result).is_none(), "{key:?} reported twice");
        })
    }

    fn tensors(frames: &[Vec<f32>]) -> Vec<Tensor> {
        frames.iter().map(|f| Tensor::vector(f)).collect()
    }

    #[test]
    fn test_matches_sequential_reference() {
        let (results, callback) = collect();
        let pipeline = VideoPipeline::new(Toy, engines(), PipelineConfig::named("video"), callback).unwrap();

        let long = clip(6, 0.25);
        let short = clip(1, 1.5);
        let a = pipeline.put_clip(tensors(&long)).unwrap();
        let b = pipeline.put_clip(tensors(&short)).unwrap();
        let empty = pipeline.put_clip(Vec::new()).unwrap();
        pipeline.join().unwrap();

        let results = results.lock();
        assert_eq!(results.len(), 7);
        assert!(results.keys().all(|k| k.clip != empty));
        for (id, frames) in [(a, &long), (b, &short)] {
            for (index, expected) in reference(frames).into_iter().enumerate() {
                let got = results[&FrameKey { clip: id, index }].as_ref().unwrap();
                assert_eq!(got.to_vec::<f32>().unwrap(), expected, "{id} frame {index}");
            }
        }
        let stats = pipeline.stats();
        assert_eq!((stats.admitted, stats.completed, stats.failed), (7, 7, 0));
        assert!(stats.stages.iter().all(|s| s.pending_entries == 0));
    }

    #[test]
    fn test_broken_forward_chain_reports_each_frame_once() {
        let (results, callback) = collect();
        let engines = VideoEngines {
            forward: failing_residual("forward", 20.0),
            ..engines()
        };
        let pipeline = VideoPipeline::new(Toy, engines, PipelineConfig::named("video"), callback).unwrap();

        // Frame i holds i * 10 + j, so frame 2 is the one that fails.
        let id = pipeline.put_clip(tensors(&tens_clip(5))).unwrap();
        pipeline.join().unwrap();

        let results = results.lock();
        assert_eq!(results.len(), 5);
        let at = |index| &results[&FrameKey { clip: id, index }];
        assert!(at(0).is_ok());
        assert!(at(1).is_ok());
        assert!(matches!(at(2), Err(SampleError::InferenceInvalid { stage, .. }) if stage == "forward"));
        for index in [3, 4] {
            assert_eq!(
                at(index),
                &Err(SampleError::ChainBroken {
                    direction: Direction::Forward,
                    origin: 2
                })
            );
        }
        assert_eq!(pipeline.stats().failed, 3);
    }

    /// A residual engine that fails the step whose frame starts with `poison`.
    fn failing_residual(name: &str, poison: f32) -> Box<dyn Engine> {
        let engine = LocalEngine::with_workers(name, 2, move |inputs| {
            if inputs[0].to_vec::<f32>().map_err(|e| e.to_string())?[0] == poison {
                return Err("residual diverged".into());
            }
            elementwise(inputs, residual)
        })
        .unwrap();
        Box::new(engine)
    }

    fn tens_clip(len: usize) -> Vec<Vec<f32>> {
        (0..len).map(|i| (0..WIDTH).map(|j| (i * 10 + j) as f32).collect()).collect()
    }

    #[test]
    fn test_backward_origin_failure_breaks_every_frame() {
        let (results, callback) = collect();
        let engines = VideoEngines {
            backward: failing_residual("backward", 40.0),
            ..engines()
        };
        let pipeline = VideoPipeline::new(Toy, engines, PipelineConfig::named("video"), callback).unwrap();
        let id = pipeline.put_clip(tensors(&tens_clip(5))).unwrap();
        pipeline.join().unwrap();

        let results = results.lock();
        assert_eq!(results.len(), 5);
        let at = |index| &results[&FrameKey { clip: id, index }];
        assert!(matches!(at(4), Err(SampleError::InferenceInvalid { stage, .. }) if stage == "backward"));
        for index in 0..4 {
            assert_eq!(
                at(index),
                &Err(SampleError::ChainBroken {
                    direction: Direction::Backward,
                    origin: 4
                })
            );
        }
        let stats = pipeline.stats();
        assert_eq!((stats.completed, stats.failed), (0, 5));
    }

    #[test]
    fn test_breaks_in_both_directions_report_each_frame_once() {
        let (results, callback) = collect();
        let engines = VideoEngines {
            forward: failing_residual("forward", 20.0),
            backward: failing_residual("backward", 40.0),
            ..engines()
        };
        let pipeline = VideoPipeline::new(Toy, engines, PipelineConfig::named("video"), callback).unwrap();
        let id = pipeline.put_clip(tensors(&tens_clip(5))).unwrap();
        pipeline.join().unwrap();

        let results = results.lock();
        assert_eq!(results.len(), 5);
        assert!(results.values().all(Result::is_err));
        // Only the backward break reaches frames 0 and 1.
        for index in [0, 1] {
            assert_eq!(
                results[&FrameKey { clip: id, index }],
                Err(SampleError::ChainBroken {
                    direction: Direction::Backward,
                    origin: 4
                })
            );
        }
        assert_eq!(pipeline.stats().failed, 5);
    }

    #[test]
    fn test_reversed_flow_completions_match_reference() {
        let (results, callback) = collect();
        let flows = MockEngine::new(|inputs| elementwise(inputs, flow).unwrap()).with_release(Release::Hold(5));
        let engines = VideoEngines {
            flow: Box::new(flows.clone()),
            ..engines()
        };
        let pipeline = VideoPipeline::new(Toy, engines, PipelineConfig::named("video"), callback).unwrap();
        let frames = clip(6, 0.5);
        let id = pipeline.put_clip(tensors(&frames)).unwrap();
        pipeline.join().unwrap();

        // Two flows per interior frame, one per end frame.
        assert_eq!(flows.submission_count(), 10);
        let results = results.lock();
        assert_eq!(results.len(), 6);
        for (index, expected) in reference(&frames).into_iter().enumerate() {
            let got = results[&FrameKey { clip: id, index }].as_ref().unwrap();
            assert_eq!(got.to_vec::<f32>().unwrap(), expected, "frame {index}");
        }
        let stats = pipeline.stats();
        assert_eq!((stats.completed, stats.failed), (6, 0));
    }

    #[test]
    fn test_clip_ids_are_distinct() {
        let (_, callback) = collect();
        let pipeline = VideoPipeline::new(Toy, engines(), PipelineConfig::default(), callback).unwrap();
        let first = pipeline.put_clip(Vec::new()).unwrap();
        let second = pipeline.put_clip(Vec::new()).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.get(), first.get() + 1);
        pipeline.join().unwrap();
    }
}
