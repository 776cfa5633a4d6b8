//! Additive attention biases.
//!
//! A bias is a 4-D tensor broadcastable to `[batch, heads, query_len, key_len]`
//! holding `0.0` where attention is allowed and [`MASK_VALUE`] where it is not.

use ndarray::{Array, Array2, Array4, Axis, RemoveAxis, Zip};

use crate::error::{DecoderError, DecoderResult};

pub const MASK_VALUE: f32 = -1e9;

/// Causal bias of shape `[1, 1, len, len]`; query `i` may see keys `0..=i`.
pub fn attention_bias_lower_triangle(len: usize) -> Array4<f32> {
    Array4::from_shape_fn((1, 1, len, len), |(_, _, i, j)| {
        if j > i { MASK_VALUE } else { 0.0 }
    })
}

/// Padding bias of shape `[batch, 1, 1, len]` from a mask where `1.0` marks
/// real tokens and `0.0` marks padding.
pub fn attention_bias_ignore_padding(mask: &Array2<f32>) -> Array4<f32> {
    mask.mapv(|m| if m == 0.0 { MASK_VALUE } else { 0.0 })
        .insert_axis(Axis(1))
        .insert_axis(Axis(1))
}

/// Padding bias of shape `[batch, 1, 1, max_len]` from per-row lengths.
pub fn attention_bias_from_lengths(lengths: &[usize], max_len: usize) -> Array4<f32> {
    let mask = Array2::from_shape_fn((lengths.len(), max_len), |(b, t)| {
        if t < lengths[b] { 1.0 } else { 0.0 }
    });
    attention_bias_ignore_padding(&mask)
}

/// Adds `bias` to `scores` in place, broadcasting size-1 axes.
pub fn add_attention_bias(scores: &mut Array4<f32>, bias: &Array4<f32>) -> DecoderResult<()> {
    let target = scores.dim();
    let broadcast = bias.broadcast(target).ok_or_else(|| {
        DecoderError::shape(
            "attention bias",
            format!(
                "bias {:?} is not broadcastable to scores {:?}",
                bias.shape(),
                scores.shape()
            ),
        )
    })?;
    Zip::from(scores).and(&broadcast).for_each(|s, &b| *s += b);
    Ok(())
}

/// Repeats every row along axis 0 `times` times, keeping copies adjacent:
/// row `b` becomes rows `b * times .. (b + 1) * times`.
pub fn tile_rows<A: Clone, D: RemoveAxis>(x: &Array<A, D>, times: usize) -> Array<A, D> {
    let indices: Vec<usize> = (0..x.len_of(Axis(0)))
        .flat_map(|b| std::iter::repeat(b).take(times))
        .collect();
    x.select(Axis(0), &indices)
}
