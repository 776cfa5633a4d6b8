use ndarray::{Array1, ArrayView1};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::activations::softmax_inplace;
use crate::error::{DecoderError, DecoderResult};

/// Index of the largest logit; the first index wins ties.
pub fn argmax(logits: &ArrayView1<f32>) -> u32 {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &value) in logits.iter().enumerate() {
        if value > best {
            best = value;
            best_idx = idx;
        }
    }
    best_idx as u32
}

/// Draws one token from `softmax(logits)`.
pub fn sample_from_logits(logits: &ArrayView1<f32>, rng: &mut StdRng) -> DecoderResult<u32> {
    let mut probs = logits.to_vec();
    softmax_inplace(&mut probs);
    let dist = WeightedIndex::new(&probs)
        .map_err(|e| DecoderError::shape("categorical sampling", e.to_string()))?;
    Ok(dist.sample(rng) as u32)
}

/// The `k` best `(token, log_prob)` pairs, best first. Equal log-probs keep
/// the lower token id first.
pub fn get_top_k_from_log_probs(log_probs: &Array1<f32>, k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(usize, f32)> = log_probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
        .into_iter()
        .map(|(i, lp)| (i as u32, lp))
        .collect()
}

pub fn log_softmax_1d(logits: &ArrayView1<f32>) -> Array1<f32> {
    let max_val = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let scaled_logits = logits - max_val;
    let exp_sum = scaled_logits.mapv(f32::exp).sum();
    scaled_logits - exp_sum.ln()
}
