//! Encoder, autoregressive decoder, postnet, and an optional chunked vocoder.
//!
//! The decoder stage resubmits each sample until the model reports it
//! finished or the configured iteration cap forces it on to the postnet.
//! [`StopGate`] and [`BatchProgress`] implement the usual early-stop rule for
//! batched decoders: a row is done once the sigmoid of its gate logit passes
//! the threshold, and the batch is done once no row is still running.
//!
//! [`SpeechPipeline`] adds a vocoder after the postnet. Each sample is split
//! into chunks that are vocoded as independent requests, then put back
//! together in chunk order before the sample's one result is reported. A
//! failed chunk fails the whole sample.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DecoderConfig;
use crate::engine::Engine;
use crate::error::{PipelineError, SampleError, StageError, TransformError};
use crate::ledger::Settlement;
use crate::ordered::Reorder;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineStats};
use crate::stage::{Downstream, Stage, StageHandle, StageOutcome, StepContext, Submission};
use crate::tensor::Tensor;

use super::first;

const ENCODER: &str = "encoder";
const DECODER: &str = "decoder";
const POSTNET: &str = "postnet";
const VOCODER: &str = "vocoder";

/// Verdict of one decoder step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Finished,
}

/// A sequence-to-sequence model split over three engines.
pub trait Seq2Seq: Send + Sync + 'static {
    type Input: Send + 'static;
    /// Everything the decoder loop carries between steps.
    type Carry: Send + 'static;
    type Output: Send + 'static;

    fn encoder_inputs(&self, input: &Self::Input) -> Result<Vec<Tensor>, TransformError>;

    /// Builds the initial decoder carry from the encoder outputs.
    fn start(&self, input: Self::Input, encoded: Vec<Tensor>) -> Result<Self::Carry, TransformError>;

    fn decoder_inputs(&self, carry: &Self::Carry) -> Result<Vec<Tensor>, TransformError>;

    /// Folds one decoder step into the carry.
    fn step(&self, carry: &mut Self::Carry, outputs: Vec<Tensor>) -> Result<Step, TransformError>;

    fn postnet_inputs(&self, carry: &Self::Carry) -> Result<Vec<Tensor>, TransformError>;

    fn finish(&self, carry: Self::Carry, outputs: Vec<Tensor>) -> Result<Self::Output, TransformError>;
}

/// Final result of a [`DecoderPipeline`] sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded<O> {
    pub output: O,
    /// Decoder steps taken.
    pub steps: u32,
    /// `true` when the iteration cap ended decoding.
    pub capped: bool,
}

/// Turns a decoded output into audio, one engine request per chunk.
pub trait Vocode<O>: Send + Sync + 'static {
    type Audio: Send + 'static;

    /// Engine inputs for each chunk, in playback order.
    fn chunks(&self, decoded: &O) -> Result<Vec<Vec<Tensor>>, TransformError>;

    fn chunk_audio(&self, outputs: Vec<Tensor>) -> Result<Tensor, TransformError> {
        first(outputs)
    }

    /// Joins the chunk audio, handed over in playback order.
    fn assemble(&self, decoded: O, chunks: Vec<Tensor>) -> Result<Self::Audio, TransformError>;
}

enum DecodeState<I, C, O> {
    Encoding(I),
    Decoding { carry: C, steps: u32, capped: bool },
    /// Postnet done, on its way to the vocoder.
    Spoken(Decoded<O>),
    Chunk(Vec<Tensor>),
    Voiced(Tensor),
}

impl<I, C, O> DecodeState<I, C, O> {
    fn decoding(&self, stage: &str) -> Result<&C, StageError> {
        match self {
            DecodeState::Decoding { carry, .. } => Ok(carry),
            _ => Err(StageError::MissingPrerequisite(format!(
                "{stage} stage was handed a sample that is not decoding"
            ))),
        }
    }
}

type State<Q> = DecodeState<<Q as Seq2Seq>::Input, <Q as Seq2Seq>::Carry, <Q as Seq2Seq>::Output>;
type Outcome<Q, R> = StageOutcome<State<Q>, R>;

struct EncoderStage<Q> {
    model: Arc<Q>,
}

impl<K: Send + 'static, R: Send + 'static, Q: Seq2Seq> Stage<K, State<Q>, R> for EncoderStage<Q> {
    fn prepare(&self, _: &StepContext<'_, K>, state: &State<Q>) -> Result<Vec<Tensor>, StageError> {
        match state {
            DecodeState::Encoding(input) => Ok(self.model.encoder_inputs(input)?),
            _ => Err(StageError::MissingPrerequisite(
                "encoder stage was handed a sample that is already past encoding".into(),
            )),
        }
    }

    fn on_complete(&self, _: &StepContext<'_, K>, outputs: Vec<Tensor>, state: State<Q>) -> Result<Outcome<Q, R>, StageError> {
        let DecodeState::Encoding(input) = state else {
            return Err(StageError::MissingPrerequisite("encoder completed a sample it never encoded".into()));
        };
        let carry = self.model.start(input, outputs)?;
        Ok(StageOutcome::Advance(DecodeState::Decoding {
            carry,
            steps: 0,
            capped: false,
        }))
    }
}

struct DecoderStage<Q> {
    model: Arc<Q>,
}

impl<K: Send + 'static, R: Send + 'static, Q: Seq2Seq> Stage<K, State<Q>, R> for DecoderStage<Q> {
    fn prepare(&self, _: &StepContext<'_, K>, state: &State<Q>) -> Result<Vec<Tensor>, StageError> {
        Ok(self.model.decoder_inputs(state.decoding(DECODER)?)?)
    }

    fn on_complete(&self, ctx: &StepContext<'_, K>, outputs: Vec<Tensor>, state: State<Q>) -> Result<Outcome<Q, R>, StageError> {
        let DecodeState::Decoding { mut carry, steps, .. } = state else {
            return Err(StageError::MissingPrerequisite("decoder completed a sample it never started".into()));
        };
        let steps = steps + 1;
        match self.model.step(&mut carry, outputs)? {
            Step::Finished => Ok(StageOutcome::Advance(DecodeState::Decoding {
                carry,
                steps,
                capped: false,
            })),
            Step::Continue => {
                // At the cap the pipeline advances the sample instead of
                // resubmitting it.
                let capped = ctx.at_cap();
                Ok(StageOutcome::Continue(DecodeState::Decoding { carry, steps, capped }))
            }
        }
    }
}

struct PostnetStage<Q> {
    model: Arc<Q>,
}

impl<Q: Seq2Seq> PostnetStage<Q> {
    fn inputs(&self, state: &State<Q>) -> Result<Vec<Tensor>, StageError> {
        Ok(self.model.postnet_inputs(state.decoding(POSTNET)?)?)
    }

    fn decoded(&self, outputs: Vec<Tensor>, state: State<Q>) -> Result<Decoded<Q::Output>, StageError> {
        let DecodeState::Decoding { carry, steps, capped } = state else {
            return Err(StageError::MissingPrerequisite("postnet completed a sample that was never decoded".into()));
        };
        debug!(steps, capped, "decoding finished");
        Ok(Decoded {
            output: self.model.finish(carry, outputs)?,
            steps,
            capped,
        })
    }
}

impl<K: Send + 'static, Q: Seq2Seq> Stage<K, State<Q>, Decoded<Q::Output>> for PostnetStage<Q> {
    fn prepare(&self, _: &StepContext<'_, K>, state: &State<Q>) -> Result<Vec<Tensor>, StageError> {
        self.inputs(state)
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, K>,
        outputs: Vec<Tensor>,
        state: State<Q>,
    ) -> Result<Outcome<Q, Decoded<Q::Output>>, StageError> {
        Ok(StageOutcome::Finalize(self.decoded(outputs, state)?))
    }
}

/// The postnet of a [`SpeechPipeline`]: hands the decoded sample on instead
/// of finishing it.
struct HandOffPostnet<Q>(PostnetStage<Q>);

impl<K: Send + 'static, R: Send + 'static, Q: Seq2Seq> Stage<K, State<Q>, R> for HandOffPostnet<Q> {
    fn prepare(&self, _: &StepContext<'_, K>, state: &State<Q>) -> Result<Vec<Tensor>, StageError> {
        self.0.inputs(state)
    }

    fn on_complete(&self, _: &StepContext<'_, K>, outputs: Vec<Tensor>, state: State<Q>) -> Result<Outcome<Q, R>, StageError> {
        Ok(StageOutcome::Advance(DecodeState::Spoken(self.0.decoded(outputs, state)?)))
    }
}

struct VocoderStage<W> {
    vocoder: Arc<W>,
}

impl<M, I, C, O, R, W> Stage<M, DecodeState<I, C, O>, R> for VocoderStage<W>
where
    M: Send + 'static,
    I: Send + 'static,
    C: Send + 'static,
    O: Send + 'static,
    R: Send + 'static,
    W: Vocode<O>,
{
    fn prepare(&self, _: &StepContext<'_, M>, state: &DecodeState<I, C, O>) -> Result<Vec<Tensor>, StageError> {
        match state {
            DecodeState::Chunk(inputs) => Ok(inputs.clone()),
            _ => Err(StageError::MissingPrerequisite("vocoder stage was handed something other than a chunk".into())),
        }
    }

    fn on_complete(
        &self,
        _: &StepContext<'_, M>,
        outputs: Vec<Tensor>,
        _: DecodeState<I, C, O>,
    ) -> Result<StageOutcome<DecodeState<I, C, O>, R>, StageError> {
        Ok(StageOutcome::Advance(DecodeState::Voiced(self.vocoder.chunk_audio(outputs)?)))
    }
}

/// Engines for the three stages of a [`DecoderPipeline`].
pub struct DecoderEngines {
    pub encoder: Box<dyn Engine>,
    pub decoder: Box<dyn Engine>,
    pub postnet: Box<dyn Engine>,
}

/// Runs keyed inputs through encoder, decoder loop and postnet.
pub struct DecoderPipeline<Q: Seq2Seq, K> {
    inner: Pipeline<K, State<Q>, Decoded<Q::Output>>,
}

impl<Q, K> DecoderPipeline<Q, K>
where
    Q: Seq2Seq,
    K: Send + 'static,
{
    pub fn new<F>(model: Q, engines: DecoderEngines, config: DecoderConfig, callback: F) -> Result<Self, PipelineError>
    where
        F: Fn(K, Result<Decoded<Q::Output>, SampleError>) + Send + Sync + 'static,
    {
        config.validate()?;
        let model = Arc::new(model);
        let inner = PipelineBuilder::<K, State<Q>, Decoded<Q::Output>>::new("decoder")
            .stage_with(
                ENCODER,
                engines.encoder,
                EncoderStage {
                    model: Arc::clone(&model),
                },
                config.plain_stage(),
            )
            .stage_with(
                DECODER,
                engines.decoder,
                DecoderStage {
                    model: Arc::clone(&model),
                },
                config.decoder_stage(),
            )
            .stage_with(POSTNET, engines.postnet, PostnetStage { model }, config.plain_stage())
            .on_result(callback)
            .build()?;
        Ok(Self { inner })
    }

    pub fn put(&self, key: K, input: Q::Input) -> Result<(), PipelineError> {
        self.inner.put(key, DecodeState::Encoding(input))
    }

    pub fn join(&self) -> Result<(), PipelineError> {
        self.inner.join()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }
}

/// Chunk reassembly state of one [`SpeechPipeline`] sample.
struct Assembly<O> {
    decoded: Option<Decoded<O>>,
    expected: usize,
    order: Reorder<Tensor>,
    audio: Vec<Tensor>,
    settled: bool,
}

impl<O> Assembly<O> {
    /// Marks the sample settled. `false` if it already was.
    fn settle(&mut self) -> bool {
        !mem::replace(&mut self.settled, true)
    }

    /// Files one chunk's audio. Returns everything needed to finish the
    /// sample once the last chunk is in.
    fn add(&mut self, chunk: usize, audio: Tensor) -> Option<(Decoded<O>, Vec<Tensor>)> {
        if self.settled {
            return None;
        }
        let released = self.order.push(chunk, audio);
        self.audio.extend(released);
        if self.audio.len() < self.expected {
            return None;
        }
        self.settled = true;
        let decoded = self.decoded.take()?;
        Some((decoded, mem::take(&mut self.audio)))
    }
}

/// One sample of a [`SpeechPipeline`], shared by all of its chunks.
struct Utterance<K, O> {
    key: Mutex<Option<K>>,
    assembly: Mutex<Assembly<O>>,
}

struct UtteranceTag<K, O> {
    utterance: Arc<Utterance<K, O>>,
    chunk: usize,
}

impl<K, O> UtteranceTag<K, O> {
    fn new(key: K) -> Self {
        Self {
            utterance: Arc::new(Utterance {
                key: Mutex::new(Some(key)),
                assembly: Mutex::new(Assembly {
                    decoded: None,
                    expected: 0,
                    order: Reorder::new(),
                    audio: Vec::new(),
                    settled: false,
                }),
            }),
            chunk: 0,
        }
    }

    fn for_chunk(&self, chunk: usize) -> Self {
        Self {
            utterance: Arc::clone(&self.utterance),
            chunk,
        }
    }
}

type Audio<Q, W> = <W as Vocode<<Q as Seq2Seq>::Output>>::Audio;
type Tag<K, Q> = UtteranceTag<K, <Q as Seq2Seq>::Output>;
type Spoken<Q, W> = Decoded<Audio<Q, W>>;

/// Settles samples for both routers behind the postnet.
struct Voicing<K, Q: Seq2Seq, W: Vocode<Q::Output>> {
    vocoder: Arc<W>,
    settlement: Settlement<Tag<K, Q>, Spoken<Q, W>>,
}

impl<K, Q: Seq2Seq, W: Vocode<Q::Output>> Voicing<K, Q, W> {
    fn finish(&self, tag: Tag<K, Q>, decoded: Decoded<Q::Output>, chunks: Vec<Tensor>) {
        let Decoded { output, steps, capped } = decoded;
        match self.vocoder.assemble(output, chunks) {
            Ok(audio) => self.settlement.complete(
                tag,
                Decoded {
                    output: audio,
                    steps,
                    capped,
                },
            ),
            Err(err) => self.settlement.fail(
                tag,
                SampleError::Transform {
                    stage: VOCODER.into(),
                    reason: err.to_string(),
                },
            ),
        }
    }

    fn fail_once(&self, tag: Tag<K, Q>, error: SampleError) {
        let first = tag.utterance.assembly.lock().settle();
        if first {
            self.settlement.fail(tag, error);
        } else {
            debug!(chunk = tag.chunk, error = %error, "sample already settled, chunk failure dropped");
        }
    }
}

/// Sits behind the postnet: splits each sample into vocoder chunks.
struct ChunkFanOut<K, Q: Seq2Seq, W: Vocode<Q::Output>> {
    voicing: Arc<Voicing<K, Q, W>>,
    vocoder: StageHandle<Tag<K, Q>, State<Q>, Spoken<Q, W>>,
}

impl<K, Q, W> Downstream<Tag<K, Q>, State<Q>, Spoken<Q, W>> for ChunkFanOut<K, Q, W>
where
    K: Send + 'static,
    Q: Seq2Seq,
    W: Vocode<Q::Output>,
{
    fn deliver(&self, tag: Tag<K, Q>, state: State<Q>) -> Result<(), PipelineError> {
        let DecodeState::Spoken(decoded) = state else {
            return Err(PipelineError::invariant(POSTNET, "postnet advanced a sample it never finished"));
        };
        let chunks = match self.voicing.vocoder.chunks(&decoded.output) {
            Ok(chunks) => chunks,
            Err(err) => {
                let error = SampleError::Transform {
                    stage: VOCODER.into(),
                    reason: err.to_string(),
                };
                self.voicing.fail_once(tag, error);
                return Ok(());
            }
        };
        if chunks.is_empty() {
            if tag.utterance.assembly.lock().settle() {
                self.voicing.finish(tag, decoded, Vec::new());
            }
            return Ok(());
        }

        // Set up before the first submission so no chunk can finish early.
        {
            let mut assembly = tag.utterance.assembly.lock();
            assembly.expected = chunks.len();
            assembly.decoded = Some(decoded);
        }
        debug!(chunks = chunks.len(), "vocoding");
        for (index, inputs) in chunks.into_iter().enumerate() {
            if let Submission::Rejected { meta, error } = self.vocoder.try_submit(tag.for_chunk(index), DecodeState::Chunk(inputs))? {
                self.voicing.fail_once(meta, error);
                break;
            }
        }
        Ok(())
    }

    fn abandon(&self, tag: Tag<K, Q>, error: SampleError) -> Result<(), PipelineError> {
        self.voicing.fail_once(tag, error);
        Ok(())
    }
}

/// Sits behind the vocoder: puts chunks back in order and settles the sample
/// once all are in.
struct ChunkAssembler<K, Q: Seq2Seq, W: Vocode<Q::Output>> {
    voicing: Arc<Voicing<K, Q, W>>,
}

impl<K, Q, W> Downstream<Tag<K, Q>, State<Q>, Spoken<Q, W>> for ChunkAssembler<K, Q, W>
where
    K: Send + 'static,
    Q: Seq2Seq,
    W: Vocode<Q::Output>,
{
    fn deliver(&self, tag: Tag<K, Q>, state: State<Q>) -> Result<(), PipelineError> {
        let DecodeState::Voiced(audio) = state else {
            return Err(PipelineError::invariant(VOCODER, "vocoder advanced something other than audio"));
        };
        let finished = tag.utterance.assembly.lock().add(tag.chunk, audio);
        match finished {
            Some((decoded, chunks)) => self.voicing.finish(tag, decoded, chunks),
            None => debug!(chunk = tag.chunk, "chunk filed"),
        }
        Ok(())
    }

    fn abandon(&self, tag: Tag<K, Q>, error: SampleError) -> Result<(), PipelineError> {
        warn!(chunk = tag.chunk, error = %error, "vocoder chunk failed");
        self.voicing.fail_once(tag, error);
        Ok(())
    }
}

/// Engines for the four stages of a [`SpeechPipeline`].
pub struct SpeechEngines {
    pub encoder: Box<dyn Engine>,
    pub decoder: Box<dyn Engine>,
    pub postnet: Box<dyn Engine>,
    pub vocoder: Box<dyn Engine>,
}

/// A [`DecoderPipeline`] followed by a chunked vocoder.
pub struct SpeechPipeline<Q: Seq2Seq, W: Vocode<Q::Output>, K> {
    inner: Pipeline<Tag<K, Q>, State<Q>, Spoken<Q, W>>,
}

impl<Q, W, K> SpeechPipeline<Q, W, K>
where
    Q: Seq2Seq,
    W: Vocode<Q::Output>,
    K: Send + 'static,
{
    pub fn new<F>(model: Q, vocoder: W, engines: SpeechEngines, config: DecoderConfig, callback: F) -> Result<Self, PipelineError>
    where
        F: Fn(K, Result<Spoken<Q, W>, SampleError>) + Send + Sync + 'static,
    {
        config.validate()?;
        let model = Arc::new(model);
        let vocoder = Arc::new(vocoder);
        let inner = PipelineBuilder::<Tag<K, Q>, State<Q>, Spoken<Q, W>>::new("speech")
            .stage_with(
                ENCODER,
                engines.encoder,
                EncoderStage {
                    model: Arc::clone(&model),
                },
                config.plain_stage(),
            )
            .stage_with(
                DECODER,
                engines.decoder,
                DecoderStage {
                    model: Arc::clone(&model),
                },
                config.decoder_stage(),
            )
            .stage_with(POSTNET, engines.postnet, HandOffPostnet(PostnetStage { model }), config.plain_stage())
            .stage_with(
                VOCODER,
                engines.vocoder,
                VocoderStage {
                    vocoder: Arc::clone(&vocoder),
                },
                config.plain_stage(),
            )
            .on_result(move |tag: Tag<K, Q>, result| {
                let key = tag.utterance.key.lock().take();
                match key {
                    Some(key) => callback(key, result),
                    None => warn!(chunk = tag.chunk, "sample reported twice, result dropped"),
                }
            })
            .build_wired(|stages, settlement| {
                let [encoder, decoder, postnet, vocoder_stage] = stages else {
                    return Err(PipelineError::invariant("speech", "expected exactly four stages"));
                };
                let voicing = Arc::new(Voicing::<K, Q, W> {
                    vocoder,
                    settlement: settlement.clone(),
                });
                encoder.connect(Arc::new(decoder.clone()))?;
                decoder.connect(Arc::new(postnet.clone()))?;
                postnet.connect(Arc::new(ChunkFanOut {
                    voicing: Arc::clone(&voicing),
                    vocoder: vocoder_stage.clone(),
                }))?;
                vocoder_stage.connect(Arc::new(ChunkAssembler { voicing }))?;
                Ok(Arc::new(encoder.clone()) as Arc<dyn Downstream<Tag<K, Q>, State<Q>, Spoken<Q, W>>>)
            })?;
        Ok(Self { inner })
    }

    pub fn put(&self, key: K, input: Q::Input) -> Result<(), PipelineError> {
        self.inner.put(UtteranceTag::new(key), DecodeState::Encoding(input))
    }

    pub fn join(&self) -> Result<(), PipelineError> {
        self.inner.join()
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats()
    }
}

/// Decides from gate logits whether each row has finished.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StopGate {
    threshold: f32,
}

impl StopGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn from_config(config: &DecoderConfig) -> Self {
        Self::new(config.gate_threshold)
    }

    pub fn is_finished(&self, logit: f32) -> bool {
        sigmoid(logit) > self.threshold
    }

    /// One flag per logit, `true` where the row has finished.
    pub fn evaluate(&self, logits: &[f32]) -> Vec<bool> {
        logits.iter().map(|&l| self.is_finished(l)).collect()
    }
}

impl Default for StopGate {
    fn default() -> Self {
        Self::from_config(&DecoderConfig::default())
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Per-row output lengths of a batched decoder.
///
/// Each step adds one frame to every row still running. The batch is done
/// when the latest step left no row running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    lengths: Vec<u32>,
    running: Vec<bool>,
    steps: u32,
}

impl BatchProgress {
    pub fn new(rows: usize) -> Self {
        Self {
            lengths: vec![0; rows],
            running: vec![true; rows],
            steps: 0,
        }
    }

    /// Folds in one step's finished flags.
    pub fn record(&mut self, finished: &[bool]) -> Result<(), TransformError> {
        if finished.len() != self.lengths.len() {
            return Err(TransformError::new(format!(
                "{} gate flags for a batch of {}",
                finished.len(),
                self.lengths.len()
            )));
        }
        for ((length, running), &done) in self.lengths.iter_mut().zip(&mut self.running).zip(finished) {
            *running = !done;
            if !done {
                *length += 1;
            }
        }
        self.steps += 1;
        Ok(())
    }

    pub fn any_unfinished(&self) -> bool {
        self.running.iter().any(|&r| r)
    }

    pub fn all_finished(&self) -> bool {
        !self.any_unfinished()
    }

    pub fn lengths(&self) -> &[u32] {
        &self.lengths
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReceiveMode;
    use crate::engine::mock::{MockEngine, Release};
    use std::collections::BTreeMap;

    /// Decodes a sentence of `n` tokens into frames `1..=n`, then the postnet
    /// doubles every frame.
    struct Counter;

    struct CounterCarry {
        target: usize,
        frames: Vec<f32>,
        gate: StopGate,
        progress: BatchProgress,
    }

    impl Seq2Seq for Counter {
        type Input = Vec<f32>;
        type Carry = CounterCarry;
        type Output = (Vec<f32>, u32);

        fn encoder_inputs(&self, input: &Vec<f32>) -> Result<Vec<Tensor>, TransformError> {
            Ok(vec![Tensor::vector(input)])
        }

        fn start(&self, _: Vec<f32>, encoded: Vec<Tensor>) -> Result<CounterCarry, TransformError> {
            let target = encoded.first().map(Tensor::element_count).unwrap_or_default();
            Ok(CounterCarry {
                target,
                frames: Vec::new(),
                gate: StopGate::default(),
                progress: BatchProgress::new(1),
            })
        }

        fn decoder_inputs(&self, carry: &CounterCarry) -> Result<Vec<Tensor>, TransformError> {
            Ok(vec![Tensor::vector(&[carry.frames.len() as f32, carry.target as f32])])
        }

        fn step(&self, carry: &mut CounterCarry, outputs: Vec<Tensor>) -> Result<Step, TransformError> {
            carry.frames.push(outputs[0].to_vec::<f32>()?[0]);
            let finished = carry.gate.evaluate(&outputs[1].to_vec::<f32>()?);
            carry.progress.record(&finished)?;
            Ok(if carry.progress.all_finished() {
                Step::Finished
            } else {
                Step::Continue
            })
        }

        fn postnet_inputs(&self, carry: &CounterCarry) -> Result<Vec<Tensor>, TransformError> {
            Ok(vec![Tensor::vector(&carry.frames)])
        }

        fn finish(&self, carry: CounterCarry, outputs: Vec<Tensor>) -> Result<(Vec<f32>, u32), TransformError> {
            Ok((outputs[0].to_vec::<f32>()?, carry.progress.lengths()[0]))
        }
    }

    /// Emits the next frame and a gate logit that fires on the last token.
    fn decoder_engine() -> MockEngine {
        MockEngine::new(|inputs| {
            let values = inputs[0].to_vec::<f32>().unwrap();
            let (done, target) = (values[0] + 1.0, values[1]);
            let logit = if done >= target { 8.0 } else { -8.0 };
            vec![Tensor::vector(&[done]), Tensor::vector(&[logit])]
        })
    }

    fn doubler() -> MockEngine {
        MockEngine::new(|inputs| {
            let values: Vec<f32> = inputs[0].to_vec::<f32>().unwrap().iter().map(|v| v * 2.0).collect();
            vec![Tensor::vector(&values)]
        })
    }

    type Results = Arc<Mutex<BTreeMap<u32, Result<Decoded<(Vec<f32>, u32)>, SampleError>>>>;

    fn run(config: DecoderConfig, inputs: &[(u32, usize)]) -> (Results, PipelineStats, MockEngine) {
        let results: Results = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = Arc::clone(&results);
        let decoder = decoder_engine();
        let engines = DecoderEngines {
            encoder: Box::new(MockEngine::echo()),
            decoder: Box::new(decoder.clone()),
            postnet: Box::new(doubler()),
        };
        let pipeline = DecoderPipeline::new(Counter, engines, config, move |key, result| {
            sink.lock().insert(key, result);
        })
        .unwrap();
        for &(key, tokens) in inputs {
            pipeline.put(key, vec![0.0; tokens]).unwrap();
        }
        pipeline.join().unwrap();
        let stats = pipeline.stats();
        (results, stats, decoder)
    }

    #[test]
    fn test_decodes_until_gate_fires() {
        let (results, stats, decoder) = run(DecoderConfig::default(), &[(0, 3), (1, 5)]);
        let results = results.lock();
        assert_eq!(
            results[&0],
            Ok(Decoded {
                output: (vec![2.0, 4.0, 6.0], 2),
                steps: 3,
                capped: false,
            })
        );
        let long = results[&1].as_ref().unwrap();
        assert_eq!(long.output.0, vec![2.0, 4.0, 6.0, 8.0, 10.0]);
        assert_eq!(long.steps, 5);
        assert_eq!(decoder.submission_count(), 8);
        assert_eq!(stats.capped(), 0);
    }

    #[test]
    fn test_iteration_cap_ends_decoding() {
        let config = DecoderConfig {
            iteration_cap: 4,
            receive: ReceiveMode::Polling { interval_us: 50 },
            ..DecoderConfig::default()
        };
        let (results, stats, decoder) = run(config, &[(7, 10)]);
        let decoded = results.lock()[&7].clone().unwrap();
        assert_eq!(decoded.steps, 4);
        assert!(decoded.capped);
        assert_eq!(decoded.output.0, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(decoder.submission_count(), 4);
        assert_eq!(stats.capped(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let engines = DecoderEngines {
            encoder: Box::new(MockEngine::echo()),
            decoder: Box::new(MockEngine::echo()),
            postnet: Box::new(MockEngine::echo()),
        };
        let config = DecoderConfig {
            gate_threshold: 1.5,
            ..DecoderConfig::default()
        };
        let built = DecoderPipeline::new(Counter, engines, config, |_: u32, _| {});
        assert!(matches!(built, Err(PipelineError::Config(_))));
    }

    /// Vocodes two frames per request; the audio is the chunks back to back.
    struct Pairs;

    impl Vocode<(Vec<f32>, u32)> for Pairs {
        type Audio = Vec<f32>;

        fn chunks(&self, decoded: &(Vec<f32>, u32)) -> Result<Vec<Vec<Tensor>>, TransformError> {
            Ok(decoded.0.chunks(2).map(|pair| vec![Tensor::vector(pair)]).collect())
        }

        fn assemble(&self, _: (Vec<f32>, u32), chunks: Vec<Tensor>) -> Result<Vec<f32>, TransformError> {
            let mut audio = Vec::new();
            for chunk in chunks {
                audio.extend(chunk.to_vec::<f32>()?);
            }
            Ok(audio)
        }
    }

    fn tenfold() -> MockEngine {
        MockEngine::new(|inputs| {
            let values: Vec<f32> = inputs[0].to_vec::<f32>().unwrap().iter().map(|v| v * 10.0).collect();
            vec![Tensor::vector(&values)]
        })
    }

    type Voices = Arc<Mutex<BTreeMap<u32, Result<Decoded<Vec<f32>>, SampleError>>>>;

    fn speak(vocoder: MockEngine, inputs: &[(u32, usize)]) -> (Voices, PipelineStats) {
        let results: Voices = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = Arc::clone(&results);
        let engines = SpeechEngines {
            encoder: Box::new(MockEngine::echo()),
            decoder: Box::new(decoder_engine()),
            postnet: Box::new(doubler()),
            vocoder: Box::new(vocoder),
        };
        let pipeline = SpeechPipeline::new(Counter, Pairs, engines, DecoderConfig::default(), move |key: u32, result| {
            assert!(sink.lock().insert(key, result).is_none(), "key {key} reported twice");
        })
        .unwrap();
        for &(key, tokens) in inputs {
            pipeline.put(key, vec![0.0; tokens]).unwrap();
        }
        pipeline.join().unwrap();
        let stats = pipeline.stats();
        (results, stats)
    }

    #[test]
    fn test_vocoder_chunks_reassemble_in_order() {
        // Each sample's four chunks complete last to first.
        let vocoder = tenfold().with_release(Release::Hold(4));
        let (results, stats) = speak(vocoder.clone(), &[(0, 8), (1, 8)]);

        let leading: Vec<f32> = vocoder
            .submissions()
            .iter()
            .map(|(_, inputs)| inputs[0].to_vec::<f32>().unwrap()[0])
            .collect();
        assert_eq!(leading, vec![2.0, 6.0, 10.0, 14.0, 2.0, 6.0, 10.0, 14.0]);

        let expected: Vec<f32> = (1..=8).map(|frame| frame as f32 * 20.0).collect();
        let results = results.lock();
        for key in [0, 1] {
            assert_eq!(
                results[&key],
                Ok(Decoded {
                    output: expected.clone(),
                    steps: 8,
                    capped: false,
                })
            );
        }
        assert_eq!((stats.completed, stats.failed), (2, 0));
        assert!(stats.stages.iter().all(|s| s.pending_entries == 0));
    }

    #[test]
    fn test_invalid_chunk_fails_its_sample_once() {
        let vocoder = tenfold().with_validity(|inputs| inputs[0].to_vec::<f32>().unwrap()[0] != 10.0);
        let (results, stats) = speak(vocoder, &[(0, 3), (1, 6)]);

        let results = results.lock();
        assert_eq!(results[&0].as_ref().map(|d| d.output.clone()), Ok(vec![20.0, 40.0, 60.0]));
        assert!(matches!(&results[&1], Err(SampleError::InferenceInvalid { stage, .. }) if stage == "vocoder"));
        assert_eq!((stats.completed, stats.failed), (1, 1));
    }

    #[test]
    fn test_stop_gate() {
        let gate = StopGate::new(0.5);
        assert_eq!(gate.evaluate(&[-3.0, 0.0, 0.1, 6.0]), vec![false, false, true, true]);
        assert!(!StopGate::new(0.99).is_finished(2.0));
    }

    #[test]
    fn test_batch_progress_counts_running_rows() {
        let mut progress = BatchProgress::new(3);
        progress.record(&[false, false, false]).unwrap();
        progress.record(&[true, false, false]).unwrap();
        progress.record(&[true, false, true]).unwrap();
        assert_eq!(progress.lengths(), &[1, 3, 2]);
        assert!(progress.any_unfinished());
        progress.record(&[true, true, true]).unwrap();
        assert!(progress.all_finished());
        assert_eq!(progress.steps(), 4);
        assert!(progress.record(&[true]).is_err());
    }
}
