use pipewright::engine::{Engine, LocalEngine};
use pipewright::pipelines::{BatchProgress, Seq2Seq, SpeechEngines, Step, StopGate, Vocode};
use pipewright::{EngineError, Tensor, TransformError};

/// Mel frames per input character, roughly.
const FRAMES_PER_CHAR: f32 = 3.0;
/// Mel frames per vocoder request.
const MEL_STEP: usize = 16;
/// Audio samples per mel frame.
const HOP: usize = 4;

/// Toy text-to-spectrogram model: one mel value per frame, decoding stops
/// once about three frames per character have been produced.
pub struct Speaker {
    gate: StopGate,
}

impl Speaker {
    pub fn new(gate: StopGate) -> Self {
        Self { gate }
    }
}

pub struct Carry {
    encoded: Tensor,
    mel: Vec<f32>,
    progress: BatchProgress,
}

pub struct Spoken {
    pub mel: Vec<f32>,
    pub frames: u32,
}

impl Seq2Seq for Speaker {
    type Input = String;
    type Carry = Carry;
    type Output = Spoken;

    fn encoder_inputs(&self, text: &String) -> Result<Vec<Tensor>, TransformError> {
        if text.is_empty() {
            return Err(TransformError::new("nothing to say"));
        }
        let codes: Vec<u8> = text.bytes().collect();
        Ok(vec![Tensor::vector(&codes)])
    }

    fn start(&self, _: String, encoded: Vec<Tensor>) -> Result<Carry, TransformError> {
        let encoded = encoded
            .into_iter()
            .next()
            .ok_or_else(|| TransformError::new("encoder returned nothing"))?;
        Ok(Carry {
            encoded,
            mel: Vec::new(),
            progress: BatchProgress::new(1),
        })
    }

    fn decoder_inputs(&self, carry: &Carry) -> Result<Vec<Tensor>, TransformError> {
        Ok(vec![carry.encoded.clone(), Tensor::scalar(carry.mel.len() as f32)])
    }

    fn step(&self, carry: &mut Carry, outputs: Vec<Tensor>) -> Result<Step, TransformError> {
        let [frame, gate] = outputs.as_slice() else {
            return Err(TransformError::new("decoder expects a frame and a gate logit"));
        };
        carry.mel.extend(frame.to_vec::<f32>()?);
        carry.progress.record(&self.gate.evaluate(&gate.to_vec::<f32>()?))?;
        Ok(if carry.progress.all_finished() {
            Step::Finished
        } else {
            Step::Continue
        })
    }

    fn postnet_inputs(&self, carry: &Carry) -> Result<Vec<Tensor>, TransformError> {
        Ok(vec![Tensor::vector(&carry.mel)])
    }

    fn finish(&self, carry: Carry, outputs: Vec<Tensor>) -> Result<Spoken, TransformError> {
        let mel = outputs
            .first()
            .ok_or_else(|| TransformError::new("postnet returned nothing"))?
            .to_vec::<f32>()?;
        let frames = carry.progress.lengths().first().copied().unwrap_or_default();
        Ok(Spoken { mel, frames })
    }
}

/// Toy vocoder: every mel frame becomes `HOP` samples of a tone whose
/// amplitude follows the frame. Requests cover `MEL_STEP` frames each.
pub struct Vocoder;

pub struct Audio {
    pub samples: Vec<f32>,
    pub frames: u32,
}

impl Vocode<Spoken> for Vocoder {
    type Audio = Audio;

    fn chunks(&self, spoken: &Spoken) -> Result<Vec<Vec<Tensor>>, TransformError> {
        Ok(spoken
            .mel
            .chunks(MEL_STEP)
            .enumerate()
            .map(|(i, mel)| vec![Tensor::vector(mel), Tensor::scalar((i * MEL_STEP) as f32)])
            .collect())
    }

    fn assemble(&self, spoken: Spoken, chunks: Vec<Tensor>) -> Result<Audio, TransformError> {
        let mut samples = Vec::with_capacity(spoken.mel.len() * HOP);
        for chunk in &chunks {
            samples.extend(chunk.to_vec::<f32>()?);
        }
        Ok(Audio {
            samples,
            frames: spoken.frames,
        })
    }
}

/// Character codes scaled into [0, 1].
fn encoder(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let codes = inputs[0].to_vec::<u8>().map_err(|e| e.to_string())?;
    let embedded: Vec<f32> = codes.iter().map(|&c| f32::from(c) / 255.0).collect();
    Ok(vec![Tensor::vector(&embedded)])
}

fn decoder(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let encoded = inputs[0].to_vec::<f32>().map_err(|e| e.to_string())?;
    let step = inputs[1].to_vec::<f32>().map_err(|e| e.to_string())?[0];
    let position = (step / FRAMES_PER_CHAR) as usize;
    let value = encoded.get(position).copied().unwrap_or_default() + 0.01 * step;
    let logit = step + 1.0 - FRAMES_PER_CHAR * encoded.len() as f32;
    Ok(vec![Tensor::vector(&[value]), Tensor::vector(&[logit])])
}

/// Three-tap moving average.
fn postnet(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let mel = inputs[0].to_vec::<f32>().map_err(|e| e.to_string())?;
    let smoothed: Vec<f32> = (0..mel.len())
        .map(|i| {
            let window = &mel[i.saturating_sub(1)..(i + 2).min(mel.len())];
            window.iter().sum::<f32>() / window.len() as f32
        })
        .collect();
    Ok(vec![Tensor::vector(&smoothed)])
}

/// Inputs: a run of mel frames and the index of its first frame.
fn vocoder(inputs: &[Tensor]) -> Result<Vec<Tensor>, String> {
    let mel = inputs[0].to_vec::<f32>().map_err(|e| e.to_string())?;
    let offset = inputs[1].to_vec::<f32>().map_err(|e| e.to_string())?[0] as usize;
    let samples: Vec<f32> = mel
        .iter()
        .enumerate()
        .flat_map(|(i, &amplitude)| {
            (0..HOP).map(move |h| {
                let t = ((offset + i) * HOP + h) as f32;
                amplitude * (t * 0.3).sin()
            })
        })
        .collect();
    Ok(vec![Tensor::vector(&samples)])
}

pub fn engines() -> Result<SpeechEngines, EngineError> {
    let boxed = |name: &str, f: fn(&[Tensor]) -> Result<Vec<Tensor>, String>| -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(LocalEngine::with_workers(name, 2, f)?))
    };
    Ok(SpeechEngines {
        encoder: boxed("encoder", encoder)?,
        decoder: boxed("decoder", decoder)?,
        postnet: boxed("postnet", postnet)?,
        vocoder: boxed("vocoder", vocoder)?,
    })
}
