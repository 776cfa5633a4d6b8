//! Token-level losses over decoder logits.

use ndarray::{Array2, Array3, ArrayView1, s};

use crate::common::log_softmax_1d;
use crate::error::{DecoderError, DecoderResult};

/// Probabilities are clipped to `[PROB_EPSILON, 1]` before every logarithm.
pub const PROB_EPSILON: f32 = 1e-20;

/// `log(clip(softmax(logits)[token], ε, 1))`, and whether the clip was hit.
pub fn clipped_log_prob(logits: &ArrayView1<f32>, token: u32) -> (f32, bool) {
    let log_p = log_softmax_1d(logits)[token as usize];
    let floor = PROB_EPSILON.ln();
    if log_p < floor {
        (floor, true)
    } else {
        (log_p.min(0.0), false)
    }
}

pub(crate) fn check_token_logits(
    context: &str,
    ids: &Array2<u32>,
    logits: &Array3<f32>,
) -> DecoderResult<()> {
    let (batch, steps, vocab) = logits.dim();
    if ids.nrows() != batch || ids.ncols() != steps {
        return Err(DecoderError::shape(
            context,
            format!("ids {:?} vs logits {:?}", ids.shape(), logits.shape()),
        ));
    }
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= vocab) {
        return Err(DecoderError::shape(
            context,
            format!("token id {} out of range for vocab size {}", bad, vocab),
        ));
    }
    Ok(())
}

/// Cross-entropy averaged over the valid tokens of every row.
///
/// Row `b` contributes steps `0..min(lengths[b], steps)`; an empty selection
/// gives a zero loss.
pub fn sequence_cross_entropy(
    logits: &Array3<f32>,
    targets: &Array2<u32>,
    lengths: &[usize],
) -> DecoderResult<f32> {
    check_token_logits("sequence cross-entropy", targets, logits)?;
    let (batch, steps, _) = logits.dim();
    if lengths.len() != batch {
        return Err(DecoderError::shape(
            "sequence cross-entropy",
            format!("{} lengths for batch {}", lengths.len(), batch),
        ));
    }

    let mut total = 0.0f32;
    let mut count = 0usize;
    for (b, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(steps) {
            let (log_p, _) = clipped_log_prob(&logits.slice(s![b, t, ..]), targets[[b, t]]);
            total -= log_p;
            count += 1;
        }
    }
    if count == 0 {
        log::warn!("Cross-entropy over an empty selection, returning 0");
        return Ok(0.0);
    }
    Ok(total / count as f32)
}
