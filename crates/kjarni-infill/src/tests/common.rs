// Shared by the cross-component tests only.
#![allow(dead_code)]

use anyhow::Result;
use ndarray::{Array, Array2, Dimension};

use crate::activations::Activation;
use crate::data::SequenceBatch;
use crate::decoder::{DecoderConfig, FeedForwardConfig, TemplateTransformerDecoder};

pub const VOCAB: usize = 9;
pub const BOS: u32 = 1;
pub const EOS: u32 = 2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn small_config() -> DecoderConfig {
    DecoderConfig {
        num_blocks: 2,
        num_heads: 2,
        num_units: 12,
        vocab_size: Some(VOCAB),
        poswise_feedforward: FeedForwardConfig {
            hidden_units: 24,
            activation: Activation::Gelu,
            dropout: 0.1,
        },
        init_scale: 0.5,
        maximum_decode_length: 6,
        max_seq_length: 6,
        seed: 42,
        ..Default::default()
    }
}

pub fn small_decoder(config: DecoderConfig) -> Result<TemplateTransformerDecoder> {
    Ok(TemplateTransformerDecoder::new(config, None)?)
}

/// Rows of ids in segment 1 with offsets `0..len`.
pub fn segment_batch(rows: Vec<Vec<u32>>) -> Result<SequenceBatch> {
    let batch = rows.len();
    let len = rows.first().map_or(0, |r| r.len());
    let ids = Array2::from_shape_vec((batch, len), rows.concat())?;
    let segment_ids = Array2::from_elem((batch, len), 1);
    let offsets = Array2::from_shape_fn((batch, len), |(_, t)| t as u32);
    Ok(SequenceBatch::new(ids, segment_ids, offsets)?)
}

pub fn assert_all_close<D: Dimension>(a: &Array<f32, D>, b: &Array<f32, D>, tol: f32, label: &str) {
    assert_eq!(a.shape(), b.shape(), "{}: shape mismatch", label);
    let max_diff = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max);
    assert!(
        max_diff <= tol,
        "{}: max difference {} exceeds {}",
        label,
        max_diff,
        tol
    );
}
