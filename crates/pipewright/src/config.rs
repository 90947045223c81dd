//! Serde-deserializable settings for pipelines, stages, and the bundled engines.
//!
//! Every struct defaults sensibly, so a caller can embed these in a larger
//! configuration file and only spell out what differs. Call `validate` after
//! deserializing; builders call it again before use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How a completion pump waits on its engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReceiveMode {
    /// Block in the engine's receive call.
    #[default]
    Blocking,
    /// Poll with `try_receive`, sleeping between empty polls. For engines
    /// that only offer non-blocking retrieval.
    Polling { interval_us: u64 },
}

/// Per-stage settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub receive: ReceiveMode,
    /// Maximum submissions per sample in this stage before a `Continue` is
    /// forced to advance.
    pub iteration_cap: Option<u32>,
}

impl StageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ReceiveMode::Polling { interval_us: 0 } = self.receive {
            return Err(ConfigError::invalid("receive.interval_us", "polling interval must be positive"));
        }
        if self.iteration_cap == Some(0) {
            return Err(ConfigError::invalid("iteration_cap", "cap must allow at least one submission"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    /// Applied to every stage without its own entry in `stages`.
    pub stage_defaults: StageConfig,
    pub stages: BTreeMap<String, StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            stage_defaults: StageConfig::default(),
            stages: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The effective settings for stage `name`.
    pub fn stage(&self, name: &str) -> StageConfig {
        self.stages.get(name).cloned().unwrap_or_else(|| self.stage_defaults.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "pipeline name must not be empty"));
        }
        self.stage_defaults.validate()?;
        for stage in self.stages.values() {
            stage.validate()?;
        }
        Ok(())
    }
}

/// Settings for [`LocalEngine`](crate::engine::LocalEngine).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEngineConfig {
    pub workers: usize,
    /// When set, submissions with a different number of tensors are rejected.
    pub input_arity: Option<usize>,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            input_arity: None,
        }
    }
}

impl LocalEngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "at least one worker is required"));
        }
        if self.input_arity == Some(0) {
            return Err(ConfigError::invalid("input_arity", "an empty input list is reserved for the sentinel"));
        }
        Ok(())
    }
}

/// Settings for [`BatchedPipeline`](crate::pipelines::batched::BatchedPipeline).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch: usize,
    /// Zero-pad a short final batch up to `max_batch` rows.
    pub pad_to_full: bool,
    pub stage: StageConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch: 8,
            pad_to_full: false,
            stage: StageConfig::default(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch == 0 {
            return Err(ConfigError::invalid("max_batch", "batches need at least one row"));
        }
        self.stage.validate()
    }
}

/// Settings for [`DecoderPipeline`](crate::pipelines::decoder::DecoderPipeline).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Hard limit on decoder steps per sample.
    pub iteration_cap: u32,
    /// Sigmoid probability above which a gate logit marks a row finished.
    pub gate_threshold: f32,
    pub receive: ReceiveMode,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            iteration_cap: 1664,
            gate_threshold: 0.5,
            receive: ReceiveMode::Blocking,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iteration_cap == 0 {
            return Err(ConfigError::invalid("iteration_cap", "decoder needs at least one step"));
        }
        if !(0.0..1.0).contains(&self.gate_threshold) {
            return Err(ConfigError::invalid("gate_threshold", "threshold must lie in [0, 1)"));
        }
        Ok(())
    }

    pub(crate) fn decoder_stage(&self) -> StageConfig {
        StageConfig {
            receive: self.receive,
            iteration_cap: Some(self.iteration_cap),
        }
    }

    pub(crate) fn plain_stage(&self) -> StageConfig {
        StageConfig {
            receive: self.receive,
            iteration_cap: None,
        }
    }
}
