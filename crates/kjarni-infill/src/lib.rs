//! Template-conditioned transformer decoder for text infilling.
//!
//! The decoder attends to an encoded template and generates the blank
//! contents one token at a time. It provides greedy and beam search over an
//! incremental key/value cache, teacher-forced cross-entropy, and the
//! policy-gradient loss used to fine-tune a generator against an external
//! reward.

pub mod activations;
pub mod attention;
pub mod cache;
pub mod common;
pub mod data;
pub mod decoder;
pub mod dropout;
pub mod embeddings;
pub mod error;
pub mod feedforward;
pub mod linear_layer;
pub mod lm_head;
pub mod normalization;
pub mod position;
pub mod search;
pub mod traits;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use crate::{
    attention::MultiHeadAttention,
    cache::{IncrementalCache, LayerCache},
    common::{BeamSearchParams, DecodingStrategy, GenerationConfig, SamplingMethod},
    data::{SequenceBatch, transform_input_with_is_missing_token},
    decoder::{DecodeInputs, DecoderConfig, Predictions, TemplateTransformerDecoder},
    embeddings::EmbeddingTable,
    error::{DecoderError, DecoderResult},
    lm_head::OutputProjection,
    position::{PositionEncoderConfig, SegmentalPositionEncoder},
    search::{BeamSearch, DecodeStep, GreedySearch},
    traits::Parameterized,
    training::{PolicyLoss, RewardTrainer, RewardTrainerConfig},
};

#[cfg(test)]
pub mod tests;
