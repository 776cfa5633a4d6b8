//! Token batches handed to the decoder.

use ndarray::{Array2, s};

use crate::error::{DecoderError, DecoderResult};

/// Token ids with their template segment and offset, all `[batch, len]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBatch {
    pub ids: Array2<u32>,
    pub segment_ids: Array2<u32>,
    pub offsets: Array2<u32>,
}

impl SequenceBatch {
    pub fn new(
        ids: Array2<u32>,
        segment_ids: Array2<u32>,
        offsets: Array2<u32>,
    ) -> DecoderResult<Self> {
        if ids.dim() != segment_ids.dim() || ids.dim() != offsets.dim() {
            return Err(DecoderError::shape(
                "sequence batch",
                format!(
                    "ids {:?}, segment_ids {:?}, offsets {:?}",
                    ids.shape(),
                    segment_ids.shape(),
                    offsets.shape()
                ),
            ));
        }
        Ok(Self {
            ids,
            segment_ids,
            offsets,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.ids.nrows()
    }

    pub fn len(&self) -> usize {
        self.ids.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Columns `start..end` of all three arrays.
    pub fn slice_steps(&self, start: usize, end: usize) -> DecoderResult<Self> {
        if start > end || end > self.len() {
            return Err(DecoderError::shape(
                "sequence batch",
                format!("cannot take steps {}..{} of {}", start, end, self.len()),
            ));
        }
        let cols = s![.., start..end];
        Ok(Self {
            ids: self.ids.slice(cols).to_owned(),
            segment_ids: self.segment_ids.slice(cols).to_owned(),
            offsets: self.offsets.slice(cols).to_owned(),
        })
    }
}

/// Replaces input `t` with `mask_id` when target `t - 1` is absent.
///
/// Inputs are the targets shifted right by one, so an input is only known
/// when the target before it was given. The first input is always kept.
///
/// ```text
/// inputs          = [a, b, c, d]
/// targets_present = [1, 0, 1, 0]
/// result          = [a, b, <mask>, d]
/// ```
pub fn transform_input_with_is_missing_token(
    inputs: &Array2<u32>,
    targets_present: &Array2<bool>,
    mask_id: u32,
) -> DecoderResult<Array2<u32>> {
    if inputs.dim() != targets_present.dim() {
        return Err(DecoderError::shape(
            "missing-token transform",
            format!(
                "inputs {:?} vs targets_present {:?}",
                inputs.shape(),
                targets_present.shape()
            ),
        ));
    }
    Ok(Array2::from_shape_fn(inputs.dim(), |(b, t)| {
        if t == 0 || targets_present[[b, t - 1]] {
            inputs[[b, t]]
        } else {
            mask_id
        }
    }))
}
