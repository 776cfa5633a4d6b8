//! Decoding strategies and the parameters shared by both searches.

pub mod sampling;

pub use sampling::*;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DecoderError;

/// How greedy decoding turns logits into the next token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMethod {
    /// Highest-scoring token; the lowest index wins ties.
    #[default]
    Argmax,
    /// Draw from the softmax distribution.
    Sample,
}

impl FromStr for SamplingMethod {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "argmax" => Ok(SamplingMethod::Argmax),
            "sample" => Ok(SamplingMethod::Sample),
            other => Err(DecoderError::config(format!(
                "unsupported sampling_method '{}', expected 'argmax' or 'sample'",
                other
            ))),
        }
    }
}

/// Parameters for beam search decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct BeamSearchParams {
    pub num_beams: usize,
    /// Length penalty exponent; `0.0` disables normalisation.
    pub alpha: f32,
}

impl Default for BeamSearchParams {
    fn default() -> Self {
        Self {
            num_beams: 4,
            alpha: 0.0,
        }
    }
}

/// The decoding algorithm and its specific parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodingStrategy {
    /// One hypothesis per row, choosing tokens with a [`SamplingMethod`].
    Greedy(SamplingMethod),
    /// `num_beams` hypotheses per row ranked by length-penalised score.
    BeamSearch(BeamSearchParams),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationConfig {
    pub eos_token_id: u32,
    /// Upper bound on generated tokens, BOS excluded.
    pub max_length: usize,
    /// Keep adding log-probabilities of tokens emitted after a row's EOS.
    pub accumulate_after_eos: bool,
    pub strategy: DecodingStrategy,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            eos_token_id: 2,
            max_length: 10,
            accumulate_after_eos: true,
            strategy: DecodingStrategy::Greedy(SamplingMethod::Argmax),
        }
    }
}
