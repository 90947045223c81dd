mod model;

use std::error::Error;

use pipewright::config::DecoderConfig;
use pipewright::pipelines::{SpeechPipeline, StopGate};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::model::{Speaker, Vocoder, engines};

const LINES: [&str; 5] = [
    "hello",
    "pipelines keep every engine busy",
    "",
    "a",
    "this sentence is long enough that the decoder will run into its iteration cap",
];

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DecoderConfig {
        iteration_cap: 128,
        ..DecoderConfig::default()
    };
    let speaker = Speaker::new(StopGate::from_config(&config));
    let pipeline = SpeechPipeline::new(speaker, Vocoder, engines()?, config, |line: usize, result| match result {
        Ok(decoded) => info!(
            line,
            steps = decoded.steps,
            frames = decoded.output.frames,
            samples = decoded.output.samples.len(),
            capped = decoded.capped,
            "line spoken"
        ),
        Err(err) => error!(line, %err, "line failed"),
    })?;

    for (line, text) in LINES.iter().enumerate() {
        pipeline.put(line, text.to_string())?;
    }
    pipeline.join()?;

    let stats = pipeline.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        capped = stats.capped(),
        "decoding finished"
    );
    Ok(())
}
