//! Decoding parameters shared by the config file, the queue worker and the decoder.

use serde::{Deserialize, Serialize};

use crate::{GenqueueError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub num_beams: usize,
    pub max_new_tokens: usize,
    /// Sample from the warped distribution instead of ranking by log-prob.
    pub do_sample: bool,
    pub length_penalty: f32,
    pub early_stopping: bool,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.75,
            top_k: 40,
            num_beams: 4,
            max_new_tokens: 128,
            do_sample: false,
            length_penalty: 1.0,
            early_stopping: false,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingStrategy {
    Greedy,
    Sample,
    BeamSearch { num_beams: usize },
    BeamSample { num_beams: usize },
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(GenqueueError::InvalidGeneration(format!(
                "temperature must be a positive number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(GenqueueError::InvalidGeneration(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.num_beams == 0 {
            return Err(GenqueueError::InvalidGeneration("num_beams must be at least 1".into()));
        }
        if self.max_new_tokens == 0 {
            return Err(GenqueueError::InvalidGeneration("max_new_tokens must be at least 1".into()));
        }
        if !self.length_penalty.is_finite() {
            return Err(GenqueueError::InvalidGeneration("length_penalty must be finite".into()));
        }
        Ok(())
    }

    pub fn strategy(&self) -> DecodingStrategy {
        match (self.num_beams, self.do_sample) {
            (0 | 1, false) => DecodingStrategy::Greedy,
            (0 | 1, true) => DecodingStrategy::Sample,
            (n, false) => DecodingStrategy::BeamSearch { num_beams: n },
            (n, true) => DecodingStrategy::BeamSample { num_beams: n },
        }
    }
}
