//! Scripted step backend for exercising the search loops without a model.

use ndarray::Array2;

use super::DecodeStep;
use crate::error::{DecoderError, DecoderResult};

#[derive(Debug, Default)]
pub struct MockCache {
    pub step: usize,
    pub rows: usize,
    pub reorders: Vec<Vec<usize>>,
}

impl MockCache {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }
}

/// `script(row, last_token, step)` returns the log-probabilities of the next
/// token; they are passed straight through as logits.
pub struct MockStepBackend<F: Fn(usize, u32, usize) -> Vec<f32>> {
    pub vocab_size: usize,
    pub script: F,
}

impl<F: Fn(usize, u32, usize) -> Vec<f32>> MockStepBackend<F> {
    pub fn new(vocab_size: usize, script: F) -> Self {
        Self { vocab_size, script }
    }
}

impl<F: Fn(usize, u32, usize) -> Vec<f32>> DecodeStep for MockStepBackend<F> {
    type Cache = MockCache;

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn decode_step(
        &self,
        token_ids: &[u32],
        step: usize,
        cache: &mut MockCache,
    ) -> DecoderResult<Array2<f32>> {
        if step != cache.step {
            return Err(DecoderError::CacheDesync {
                expected: step,
                actual: cache.step,
            });
        }
        let mut logits = Array2::zeros((token_ids.len(), self.vocab_size));
        for (row, &token) in token_ids.iter().enumerate() {
            let values = (self.script)(row, token, step);
            for (v, value) in values.into_iter().enumerate() {
                logits[[row, v]] = value;
            }
        }
        cache.step += 1;
        Ok(logits)
    }

    fn reorder_cache(&self, cache: &mut MockCache, parent_rows: &[usize]) -> DecoderResult<()> {
        cache.reorders.push(parent_rows.to_vec());
        Ok(())
    }
}

/// Natural logs of a probability row.
pub fn ln(probs: &[f32]) -> Vec<f32> {
    probs.iter().map(|p| p.ln()).collect()
}
