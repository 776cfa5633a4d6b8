use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::common::{BeamSearchParams, DecodingStrategy, GenerationConfig, SamplingMethod};
use crate::error::{DecoderError, DecoderResult};
use crate::position::PositionEncoderConfig;

fn default_num_blocks() -> usize {
    6
}
fn default_num_heads() -> usize {
    8
}
fn default_num_units() -> usize {
    512
}
fn default_dropout() -> f32 {
    0.1
}
fn default_true() -> bool {
    true
}
fn default_max_seq_length() -> usize {
    10
}
fn default_beam_width() -> usize {
    1
}
fn default_eos_idx() -> u32 {
    2
}
fn default_bos_idx() -> u32 {
    1
}
fn default_layer_norm_eps() -> f32 {
    1e-6
}
fn default_init_scale() -> f32 {
    0.1
}
fn default_hidden_units() -> usize {
    2048
}

/// How decoder input embeddings are scaled before the position signal is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingScale {
    #[default]
    SqrtDepth,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardConfig {
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            hidden_units: default_hidden_units(),
            activation: Activation::Relu,
            dropout: default_dropout(),
        }
    }
}

/// Hyperparameters of the template decoder.
///
/// Every field has a default, so `{}` is a valid configuration once
/// `vocab_size` or an embedding table is supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_num_blocks")]
    pub num_blocks: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default = "default_num_units")]
    pub num_units: usize,
    /// Required when no embedding table is passed to the decoder.
    #[serde(default)]
    pub vocab_size: Option<usize>,

    #[serde(default)]
    pub poswise_feedforward: FeedForwardConfig,
    #[serde(default)]
    pub position_embedder: PositionEncoderConfig,

    #[serde(default = "default_dropout")]
    pub embedding_dropout: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout: f32,
    #[serde(default = "default_dropout")]
    pub residual_dropout: f32,

    #[serde(default)]
    pub sampling_method: SamplingMethod,
    #[serde(default)]
    pub multiply_embedding_mode: EmbeddingScale,
    #[serde(default = "default_true")]
    pub share_embed_and_transform: bool,
    #[serde(default = "default_true")]
    pub transform_with_bias: bool,
    #[serde(default)]
    pub zero_pad: bool,

    /// Longest sequence the decoder serves; bounds `maximum_decode_length`.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_max_seq_length")]
    pub maximum_decode_length: usize,
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
    #[serde(default)]
    pub alpha: f32,
    #[serde(default = "default_eos_idx")]
    pub eos_idx: u32,
    #[serde(default = "default_bos_idx")]
    pub bos_idx: u32,
    #[serde(default = "default_true")]
    pub accumulate_after_eos: bool,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
    #[serde(default)]
    pub seed: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            num_blocks: default_num_blocks(),
            num_heads: default_num_heads(),
            num_units: default_num_units(),
            vocab_size: None,
            poswise_feedforward: FeedForwardConfig::default(),
            position_embedder: PositionEncoderConfig::default(),
            embedding_dropout: default_dropout(),
            attention_dropout: default_dropout(),
            residual_dropout: default_dropout(),
            sampling_method: SamplingMethod::Argmax,
            multiply_embedding_mode: EmbeddingScale::SqrtDepth,
            share_embed_and_transform: true,
            transform_with_bias: true,
            zero_pad: false,
            max_seq_length: default_max_seq_length(),
            maximum_decode_length: default_max_seq_length(),
            beam_width: default_beam_width(),
            alpha: 0.0,
            eos_idx: default_eos_idx(),
            bos_idx: default_bos_idx(),
            accumulate_after_eos: true,
            layer_norm_eps: default_layer_norm_eps(),
            init_scale: default_init_scale(),
            seed: 0,
        }
    }
}

impl DecoderConfig {
    pub fn from_json(json: &str) -> DecoderResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DecoderError::config(format!("invalid decoder config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DecoderResult<()> {
        if self.num_units == 0 || self.num_heads == 0 {
            return Err(DecoderError::config(
                "num_units and num_heads must be positive",
            ));
        }
        if self.num_units % self.num_heads != 0 {
            return Err(DecoderError::config(format!(
                "num_units {} is not divisible by num_heads {}",
                self.num_units, self.num_heads
            )));
        }
        if self.maximum_decode_length > self.max_seq_length {
            return Err(DecoderError::config(format!(
                "maximum_decode_length {} exceeds max_seq_length {}",
                self.maximum_decode_length, self.max_seq_length
            )));
        }
        if self.beam_width < 1 {
            return Err(DecoderError::config("beam_width must be at least 1"));
        }
        if self.vocab_size == Some(0) {
            return Err(DecoderError::config("vocab_size must be positive"));
        }
        for (name, rate) in [
            ("embedding_dropout", self.embedding_dropout),
            ("attention_dropout", self.attention_dropout),
            ("residual_dropout", self.residual_dropout),
            ("poswise_feedforward.dropout", self.poswise_feedforward.dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(DecoderError::config(format!(
                    "{} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }
        if !(self.alpha >= 0.0) {
            return Err(DecoderError::config(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        if self.position_embedder.min_timescale <= 0.0
            || self.position_embedder.max_timescale < self.position_embedder.min_timescale
        {
            return Err(DecoderError::config(
                "position timescales must satisfy 0 < min_timescale <= max_timescale",
            ));
        }
        Ok(())
    }

    pub fn embedding_scale(&self) -> f32 {
        match self.multiply_embedding_mode {
            EmbeddingScale::SqrtDepth => (self.num_units as f32).sqrt(),
            EmbeddingScale::None => 1.0,
        }
    }

    /// Generation settings for `dynamic_decode`: greedy when `beam_width <= 1`.
    pub fn generation_config(&self) -> GenerationConfig {
        let strategy = if self.beam_width <= 1 {
            DecodingStrategy::Greedy(self.sampling_method)
        } else {
            DecodingStrategy::BeamSearch(BeamSearchParams {
                num_beams: self.beam_width,
                alpha: self.alpha,
            })
        };
        GenerationConfig {
            eos_token_id: self.eos_idx,
            max_length: self.maximum_decode_length,
            accumulate_after_eos: self.accumulate_after_eos,
            strategy,
        }
    }
}
