//! Segment-aware sinusoidal position signal.
//!
//! Each token carries a `(segment_id, offset)` pair: the segment it belongs to
//! in the template and its offset inside that segment. The signal is the
//! usual sin/cos timing signal evaluated at `base * segment_id + offset`, so
//! tokens in different blanks never share a position.

use ndarray::{Array1, Array2, Array3, ArrayView1, s};
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, DecoderResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionEncoderConfig {
    pub min_timescale: f32,
    pub max_timescale: f32,
    /// Positions reserved per segment.
    pub base: u32,
}

impl Default for PositionEncoderConfig {
    fn default() -> Self {
        Self {
            min_timescale: 1.0,
            max_timescale: 1.0e4,
            base: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentalPositionEncoder {
    channels: usize,
    base: u32,
    inv_timescales: Array1<f32>,
}

impl SegmentalPositionEncoder {
    pub fn new(channels: usize, config: PositionEncoderConfig) -> Self {
        let num_timescales = channels / 2;
        let log_increment = (config.max_timescale / config.min_timescale).ln()
            / (num_timescales.saturating_sub(1).max(1)) as f32;
        let inv_timescales = Array1::from_shape_fn(num_timescales, |i| {
            config.min_timescale * (-(i as f32) * log_increment).exp()
        });
        Self {
            channels,
            base: config.base,
            inv_timescales,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn position(&self, segment_id: u32, offset: u32) -> f32 {
        (self.base as f32) * (segment_id as f32) + offset as f32
    }

    fn write_signal(&self, position: f32, mut out: ndarray::ArrayViewMut1<f32>) {
        let half = self.inv_timescales.len();
        for (i, &inv) in self.inv_timescales.iter().enumerate() {
            let scaled = position * inv;
            out[i] = scaled.sin();
            out[half + i] = scaled.cos();
        }
        // odd channel counts keep a trailing zero
    }

    /// Single step: `[rows] x [rows] -> [rows, channels]`
    pub fn encode_step(
        &self,
        segment_ids: ArrayView1<u32>,
        offsets: ArrayView1<u32>,
    ) -> DecoderResult<Array2<f32>> {
        if segment_ids.len() != offsets.len() {
            return Err(DecoderError::shape(
                "position step",
                format!(
                    "{} segment ids but {} offsets",
                    segment_ids.len(),
                    offsets.len()
                ),
            ));
        }
        let mut signal = Array2::zeros((segment_ids.len(), self.channels));
        for (row, (&seg, &off)) in segment_ids.iter().zip(offsets.iter()).enumerate() {
            self.write_signal(self.position(seg, off), signal.slice_mut(s![row, ..]));
        }
        Ok(signal)
    }

    /// Full block: `[batch, len] x [batch, len] -> [batch, len, channels]`
    pub fn encode(
        &self,
        segment_ids: &Array2<u32>,
        offsets: &Array2<u32>,
    ) -> DecoderResult<Array3<f32>> {
        if segment_ids.dim() != offsets.dim() {
            return Err(DecoderError::shape(
                "position block",
                format!(
                    "segment ids {:?} vs offsets {:?}",
                    segment_ids.shape(),
                    offsets.shape()
                ),
            ));
        }
        let (batch, len) = segment_ids.dim();
        let mut signal = Array3::zeros((batch, len, self.channels));
        for b in 0..batch {
            for t in 0..len {
                let position = self.position(segment_ids[[b, t]], offsets[[b, t]]);
                self.write_signal(position, signal.slice_mut(s![b, t, ..]));
            }
        }
        Ok(signal)
    }
}
