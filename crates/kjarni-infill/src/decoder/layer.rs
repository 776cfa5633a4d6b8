//! One pre-norm decoder block: self-attention, optional memory attention and
//! a position-wise feedforward, each wrapped in `x + dropout(f(LN(x)))`.

use ndarray::{Array3, Array4, ArrayViewD};
use rand::rngs::StdRng;

use crate::attention::MultiHeadAttention;
use crate::cache::LayerCache;
use crate::dropout::Dropout;
use crate::error::DecoderResult;
use crate::feedforward::FeedForward;
use crate::normalization::LayerNorm;
use crate::traits::Parameterized;

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    pub self_attn_norm: LayerNorm,
    pub self_attn: MultiHeadAttention,
    pub cross_attn_norm: LayerNorm,
    pub cross_attn: MultiHeadAttention,
    pub ffn_norm: LayerNorm,
    pub ffn: FeedForward,
    pub residual_dropout: Dropout,
}

impl DecoderLayer {
    fn residual(
        &self,
        x: &mut Array3<f32>,
        mut sub_output: Array3<f32>,
        rng: Option<&mut StdRng>,
    ) {
        self.residual_dropout.apply(&mut sub_output, rng);
        *x += &sub_output;
    }

    pub fn forward(
        &self,
        mut x: Array3<f32>,
        memory: Option<&Array3<f32>>,
        self_bias: &Array4<f32>,
        memory_bias: Option<&Array4<f32>>,
        mut rng: Option<&mut StdRng>,
    ) -> DecoderResult<Array3<f32>> {
        let normed = self.self_attn_norm.forward(&x)?;
        let attn = self
            .self_attn
            .forward(&normed, None, Some(self_bias), rng.as_deref_mut())?;
        self.residual(&mut x, attn, rng.as_deref_mut());

        if let Some(memory) = memory {
            let normed = self.cross_attn_norm.forward(&x)?;
            let attn = self
                .cross_attn
                .forward(&normed, Some(memory), memory_bias, rng.as_deref_mut())?;
            self.residual(&mut x, attn, rng.as_deref_mut());
        }

        let normed = self.ffn_norm.forward(&x)?;
        let ffn_out = self.ffn.forward(&normed, rng.as_deref_mut())?;
        self.residual(&mut x, ffn_out, rng);

        Ok(x)
    }

    /// Same block for new tokens only, reading and extending `cache`.
    pub fn forward_step(
        &self,
        mut x: Array3<f32>,
        cache: &mut LayerCache,
        memory_bias: Option<&Array4<f32>>,
    ) -> DecoderResult<Array3<f32>> {
        let normed = self.self_attn_norm.forward(&x)?;
        let attn = self.self_attn.forward_cached_self(&normed, cache)?;
        self.residual(&mut x, attn, None);

        if cache.memory_kv().is_some() {
            let normed = self.cross_attn_norm.forward(&x)?;
            let attn = self
                .cross_attn
                .forward_cached_memory(&normed, cache, memory_bias)?;
            self.residual(&mut x, attn, None);
        }

        let normed = self.ffn_norm.forward(&x)?;
        let ffn_out = self.ffn.forward(&normed, None)?;
        self.residual(&mut x, ffn_out, None);

        Ok(x)
    }
}

impl Parameterized for DecoderLayer {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.self_attn_norm.parameters();
        params.extend(self.self_attn.parameters());
        params.extend(self.cross_attn_norm.parameters());
        params.extend(self.cross_attn.parameters());
        params.extend(self.ffn_norm.parameters());
        params.extend(self.ffn.parameters());
        params
    }
}
