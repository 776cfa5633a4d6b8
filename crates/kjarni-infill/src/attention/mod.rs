//! Multi-head scaled dot-product attention with additive bias and
//! incremental (cached) decoding.

use ndarray::{Array3, Array4, ArrayView3, ArrayViewD};
use rand::rngs::StdRng;

use crate::activations::softmax_last_axis_inplace;
use crate::cache::LayerCache;
use crate::dropout::Dropout;
use crate::error::{DecoderError, DecoderResult};
use crate::linear_layer::LinearLayer;
use crate::traits::Parameterized;
use crate::utils::linear_algebra::matmul_4d;
use crate::utils::masks::{MASK_VALUE, add_attention_bias};


/// Multi-head attention. Weights are stored as `[out_features, in_features]`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub q_proj: LinearLayer,
    pub k_proj: LinearLayer,
    pub v_proj: LinearLayer,
    pub out_proj: LinearLayer,

    pub num_heads: usize,
    pub head_dim: usize,
    pub scale_factor: f32,
    pub dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        q_proj: impl Into<LinearLayer>,
        k_proj: impl Into<LinearLayer>,
        v_proj: impl Into<LinearLayer>,
        out_proj: impl Into<LinearLayer>,
        num_heads: usize,
        dropout: Dropout,
    ) -> DecoderResult<Self> {
        let q_proj = q_proj.into();
        let hidden_size = q_proj.out_features();
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(DecoderError::config(format!(
                "attention width {} is not divisible by {} heads",
                hidden_size, num_heads
            )));
        }
        let head_dim = hidden_size / num_heads;

        Ok(Self {
            q_proj,
            k_proj: k_proj.into(),
            v_proj: v_proj.into(),
            out_proj: out_proj.into(),
            num_heads,
            head_dim,
            scale_factor: 1.0 / (head_dim as f32).sqrt(),
            dropout,
        })
    }

    /// Bias-free projections initialised uniformly in `[-scale, scale)`.
    pub fn random(
        hidden_size: usize,
        num_heads: usize,
        dropout: Dropout,
        scale: f32,
        rng: &mut StdRng,
    ) -> DecoderResult<Self> {
        let q = LinearLayer::random(hidden_size, hidden_size, false, scale, rng);
        let k = LinearLayer::random(hidden_size, hidden_size, false, scale, rng);
        let v = LinearLayer::random(hidden_size, hidden_size, false, scale, rng);
        let o = LinearLayer::random(hidden_size, hidden_size, false, scale, rng);
        Self::new(q, k, v, o, num_heads, dropout)
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn project_kv(&self, key_value_source: &Array3<f32>) -> DecoderResult<(Array3<f32>, Array3<f32>)> {
        let k = self.k_proj.forward(key_value_source)?;
        let v = self.v_proj.forward(key_value_source)?;
        Ok((k, v))
    }

    /// `[batch, len, hidden] -> [batch, heads, len, head_dim]`
    fn split_heads(&self, x: ArrayView3<f32>) -> DecoderResult<Array4<f32>> {
        let (batch, len, hidden) = x.dim();
        if hidden != self.hidden_size() {
            return Err(DecoderError::shape(
                "attention heads",
                format!("expected width {}, got {}", self.hidden_size(), hidden),
            ));
        }
        Ok(x.as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, len, self.num_heads, self.head_dim))?
            .permuted_axes([0, 2, 1, 3]))
    }

    /// Attends already-projected queries over keys/values, merges heads and
    /// applies the output projection.
    ///
    /// `bias` must broadcast to `[batch, heads, q_len, kv_len]`.
    pub fn attend(
        &self,
        q: &Array3<f32>,
        k: ArrayView3<f32>,
        v: ArrayView3<f32>,
        bias: Option<&Array4<f32>>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<Array3<f32>> {
        let (batch_size, q_len, _) = q.dim();
        if k.dim() != v.dim() {
            return Err(DecoderError::shape(
                "attention",
                format!("keys {:?} vs values {:?}", k.shape(), v.shape()),
            ));
        }
        if k.shape()[0] != batch_size {
            return Err(DecoderError::shape(
                "attention",
                format!(
                    "query batch {} vs key batch {}",
                    batch_size,
                    k.shape()[0]
                ),
            ));
        }

        let q_heads = self.split_heads(q.view())? * self.scale_factor;
        let k_transposed = self.split_heads(k)?.permuted_axes([0, 1, 3, 2]);
        let v_heads = self.split_heads(v)?;

        let mut scores = matmul_4d(&q_heads, &k_transposed)?;
        if let Some(bias) = bias {
            add_attention_bias(&mut scores, bias)?;
        }
        softmax_last_axis_inplace(&mut scores);
        self.dropout.apply(&mut scores, rng);

        let context = matmul_4d(&scores, &v_heads)?;
        let merged = context
            .permuted_axes([0, 2, 1, 3])
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch_size, q_len, self.hidden_size()))?;

        self.out_proj.forward(&merged)
    }

    /// Full-sequence attention. Self-attention when `memory` is `None`.
    pub fn forward(
        &self,
        queries: &Array3<f32>,
        memory: Option<&Array3<f32>>,
        bias: Option<&Array4<f32>>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<Array3<f32>> {
        let q = self.q_proj.forward(queries)?;
        let (k, v) = self.project_kv(memory.unwrap_or(queries))?;
        self.attend(&q, k.view(), v.view(), bias, rng)
    }

    /// Incremental self-attention: appends this step's keys/values to the
    /// layer cache, then attends over everything cached so far.
    pub fn forward_cached_self(
        &self,
        queries: &Array3<f32>,
        cache: &mut LayerCache,
    ) -> DecoderResult<Array3<f32>> {
        let new_tokens = queries.shape()[1];
        let past = cache.len();

        let q = self.q_proj.forward(queries)?;
        let (new_k, new_v) = self.project_kv(queries)?;
        cache.append(&new_k, &new_v)?;

        let bias = (new_tokens > 1).then(|| causal_bias_with_offset(new_tokens, past));
        let (k, v) = cache.self_kv();
        self.attend(&q, k, v, bias.as_ref(), None)
    }

    /// Incremental cross-attention over the memory keys/values projected once
    /// when the cache was built.
    pub fn forward_cached_memory(
        &self,
        queries: &Array3<f32>,
        cache: &LayerCache,
        bias: Option<&Array4<f32>>,
    ) -> DecoderResult<Array3<f32>> {
        let (k, v) = cache.memory_kv().ok_or_else(|| {
            DecoderError::shape("cross attention", "cache was built without memory")
        })?;
        let q = self.q_proj.forward(queries)?;
        self.attend(&q, k.view(), v.view(), bias, None)
    }
}

/// Causal bias for `new_tokens` queries appended after `past` cached keys.
fn causal_bias_with_offset(new_tokens: usize, past: usize) -> Array4<f32> {
    Array4::from_shape_fn((1, 1, new_tokens, past + new_tokens), |(_, _, i, j)| {
        if j > past + i { MASK_VALUE } else { 0.0 }
    })
}

impl Parameterized for MultiHeadAttention {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.out_proj]
            .into_iter()
            .flat_map(|layer| layer.parameters())
            .collect()
    }
}
