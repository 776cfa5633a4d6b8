//! Incremental decoding cache.
//!
//! One [`LayerCache`] per decoder layer holds the self-attention keys/values
//! of every step decoded so far, preallocated to the decode capacity, and the
//! memory keys/values projected once from the template. [`IncrementalCache`]
//! groups the layers with the memory bias and the per-step position signal,
//! and tracks how many steps have been decoded.

use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis, s};
use rayon::prelude::*;

use crate::error::{DecoderError, DecoderResult};


#[derive(Debug, Clone)]
pub struct LayerCache {
    self_keys: Array3<f32>,
    self_values: Array3<f32>,
    len: usize,
    memory_kv: Option<(Array3<f32>, Array3<f32>)>,
}

impl LayerCache {
    pub fn new(
        rows: usize,
        capacity: usize,
        hidden_size: usize,
        memory_kv: Option<(Array3<f32>, Array3<f32>)>,
    ) -> Self {
        Self {
            self_keys: Array3::zeros((rows, capacity, hidden_size)),
            self_values: Array3::zeros((rows, capacity, hidden_size)),
            len: 0,
            memory_kv,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.self_keys.shape()[1]
    }

    pub fn rows(&self) -> usize {
        self.self_keys.shape()[0]
    }

    /// Appends `[rows, n, hidden]` keys/values after the cached steps.
    pub fn append(&mut self, new_k: &Array3<f32>, new_v: &Array3<f32>) -> DecoderResult<()> {
        if new_k.dim() != new_v.dim() {
            return Err(DecoderError::shape(
                "layer cache",
                format!("keys {:?} vs values {:?}", new_k.shape(), new_v.shape()),
            ));
        }
        let (rows, new_tokens, hidden) = new_k.dim();
        if rows != self.rows() || hidden != self.self_keys.shape()[2] {
            return Err(DecoderError::shape(
                "layer cache",
                format!(
                    "cannot append {:?} to cache of {:?}",
                    new_k.shape(),
                    self.self_keys.shape()
                ),
            ));
        }
        let end = self.len + new_tokens;
        if end > self.capacity() {
            return Err(DecoderError::shape(
                "layer cache",
                format!(
                    "overflow: len={}, new_tokens={}, capacity={}",
                    self.len,
                    new_tokens,
                    self.capacity()
                ),
            ));
        }

        let target = s![.., self.len..end, ..];
        self.self_keys.slice_mut(target).assign(new_k);
        self.self_values.slice_mut(target).assign(new_v);
        self.len = end;
        Ok(())
    }

    /// Active self-attention keys/values, `[rows, len, hidden]`.
    pub fn self_kv(&self) -> (ArrayView3<'_, f32>, ArrayView3<'_, f32>) {
        let active = s![.., 0..self.len, ..];
        (self.self_keys.slice(active), self.self_values.slice(active))
    }

    pub fn memory_kv(&self) -> Option<(&Array3<f32>, &Array3<f32>)> {
        self.memory_kv.as_ref().map(|(k, v)| (k, v))
    }

    /// Row `i` of the result is row `indices[i]` of the current cache.
    pub fn reorder(&mut self, indices: &[usize]) {
        self.self_keys = self.self_keys.select(Axis(0), indices);
        self.self_values = self.self_values.select(Axis(0), indices);
        if let Some((k, v)) = &mut self.memory_kv {
            *k = k.select(Axis(0), indices);
            *v = v.select(Axis(0), indices);
        }
    }
}

/// Per-call decoding state shared by every layer.
#[derive(Debug, Clone)]
pub struct IncrementalCache {
    layers: Vec<LayerCache>,
    memory_bias: Option<Array4<f32>>,
    position_signal: Array3<f32>,
    step_count: usize,
}

impl IncrementalCache {
    /// `position_signal` is `[rows, capacity, hidden]`: the signal to add to
    /// the input embedding at each step.
    pub fn new(
        layers: Vec<LayerCache>,
        memory_bias: Option<Array4<f32>>,
        position_signal: Array3<f32>,
    ) -> DecoderResult<Self> {
        let rows = position_signal.shape()[0];
        let capacity = position_signal.shape()[1];
        for (i, layer) in layers.iter().enumerate() {
            if layer.rows() != rows || layer.capacity() != capacity || !layer.is_empty() {
                return Err(DecoderError::shape(
                    "incremental cache",
                    format!(
                        "layer {} has {} rows / capacity {} / len {}, expected {} / {} / 0",
                        i,
                        layer.rows(),
                        layer.capacity(),
                        layer.len(),
                        rows,
                        capacity
                    ),
                ));
            }
        }
        if let Some(bias) = &memory_bias {
            let bias_rows = bias.shape()[0];
            if bias_rows != 1 && bias_rows != rows {
                return Err(DecoderError::shape(
                    "incremental cache",
                    format!("memory bias has {} rows, cache has {}", bias_rows, rows),
                ));
            }
        }
        Ok(Self {
            layers,
            memory_bias,
            position_signal,
            step_count: 0,
        })
    }

    pub fn rows(&self) -> usize {
        self.position_signal.shape()[0]
    }

    pub fn capacity(&self) -> usize {
        self.position_signal.shape()[1]
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn memory_bias(&self) -> Option<&Array4<f32>> {
        self.memory_bias.as_ref()
    }

    /// Fails unless `step` is exactly the next step this cache can take.
    pub fn check_step(&self, step: usize) -> DecoderResult<()> {
        if step != self.step_count {
            return Err(DecoderError::CacheDesync {
                expected: step,
                actual: self.step_count,
            });
        }
        if step >= self.capacity() {
            return Err(DecoderError::shape(
                "incremental cache",
                format!("step {} exceeds capacity {}", step, self.capacity()),
            ));
        }
        Ok(())
    }

    /// Position signal for one step, `[rows, hidden]`.
    pub fn position_at(&self, step: usize) -> ArrayView2<'_, f32> {
        self.position_signal.index_axis(Axis(1), step)
    }

    pub fn layers_mut(&mut self) -> (&mut [LayerCache], Option<&Array4<f32>>) {
        (&mut self.layers, self.memory_bias.as_ref())
    }

    /// Marks the current step as done once every layer has appended it.
    pub fn advance(&mut self) -> DecoderResult<()> {
        let expected = self.step_count + 1;
        if let Some(layer) = self.layers.iter().find(|l| l.len() != expected) {
            return Err(DecoderError::CacheDesync {
                expected,
                actual: layer.len(),
            });
        }
        self.step_count = expected;
        Ok(())
    }

    /// Gathers rows by parent index, used by beam search after each step.
    pub fn reorder(&mut self, indices: &[usize]) -> DecoderResult<()> {
        let rows = self.rows();
        if indices.len() != rows || indices.iter().any(|&i| i >= rows) {
            return Err(DecoderError::shape(
                "cache reorder",
                format!("{} indices for {} rows: {:?}", indices.len(), rows, indices),
            ));
        }

        self.layers
            .par_iter_mut()
            .for_each(|layer| layer.reorder(indices));

        if let Some(bias) = &mut self.memory_bias {
            if bias.shape()[0] == rows {
                *bias = bias.select(Axis(0), indices);
            }
        }
        self.position_signal = self.position_signal.select(Axis(0), indices);
        Ok(())
    }
}
