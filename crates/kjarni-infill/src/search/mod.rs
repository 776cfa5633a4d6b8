//! Incremental decoding loops.
//!
//! Both searches drive a model only through [`DecodeStep`]: feed the latest
//! token of every row, get next-token logits back, and let the model extend
//! its cache in place.

pub mod beams;
pub mod greedy;

#[cfg(test)]
pub(crate) mod mock;

pub use beams::{BeamHypothesis, BeamOutput, BeamSearch, BeamState, length_penalty};
pub use greedy::{DecodeState, GreedyOutput, GreedySearch};

use ndarray::Array2;

use crate::error::{DecoderError, DecoderResult};

/// One step of an autoregressive model.
pub trait DecodeStep {
    type Cache;

    fn vocab_size(&self) -> usize;

    /// Logits `[rows, vocab]` for the token after `token_ids[row]`.
    ///
    /// `step` must equal the number of steps the cache already holds.
    fn decode_step(
        &self,
        token_ids: &[u32],
        step: usize,
        cache: &mut Self::Cache,
    ) -> DecoderResult<Array2<f32>>;

    /// Row `i` of the cache becomes row `parent_rows[i]`.
    fn reorder_cache(&self, cache: &mut Self::Cache, parent_rows: &[usize]) -> DecoderResult<()>;
}

pub(crate) fn check_logits(logits: &Array2<f32>, rows: usize, step: usize) -> DecoderResult<()> {
    if logits.nrows() != rows || logits.ncols() == 0 {
        return Err(DecoderError::shape(
            "decode step",
            format!(
                "step {} returned logits {:?}, expected {} rows",
                step,
                logits.shape(),
                rows
            ),
        ));
    }
    Ok(())
}
