use std::time::Instant;

use ndarray::{Array3, Array4, ArrayViewD};
use rand::rngs::StdRng;

use crate::attention::MultiHeadAttention;
use crate::cache::{IncrementalCache, LayerCache};
use crate::decoder::config::DecoderConfig;
use crate::decoder::layer::DecoderLayer;
use crate::dropout::Dropout;
use crate::error::{DecoderError, DecoderResult};
use crate::feedforward::FeedForward;
use crate::linear_layer::LinearLayer;
use crate::normalization::LayerNorm;
use crate::traits::Parameterized;
use crate::utils::masks::attention_bias_lower_triangle;

/// `num_blocks` decoder layers followed by a final layer norm.
///
/// Every layer owns a memory-attention block. It is skipped when no memory
/// is given, but its weights still count as parameters.
#[derive(Debug, Clone)]
pub struct DecoderStack {
    pub layers: Vec<DecoderLayer>,
    pub final_norm: LayerNorm,
    pub embedding_dropout: Dropout,
}

impl DecoderStack {
    pub fn random(config: &DecoderConfig, rng: &mut StdRng) -> DecoderResult<Self> {
        let hidden = config.num_units;
        let eps = config.layer_norm_eps;
        let scale = config.init_scale;
        let ffn_config = &config.poswise_feedforward;

        let layers = (0..config.num_blocks)
            .map(|_| -> DecoderResult<DecoderLayer> {
                let self_attn = MultiHeadAttention::random(
                    hidden,
                    config.num_heads,
                    Dropout::new(config.attention_dropout),
                    scale,
                    rng,
                )?;
                let cross_attn = MultiHeadAttention::random(
                    hidden,
                    config.num_heads,
                    Dropout::new(config.attention_dropout),
                    scale,
                    rng,
                )?;
                let ffn = FeedForward::new(
                    LinearLayer::random(hidden, ffn_config.hidden_units, true, scale, rng),
                    LinearLayer::random(ffn_config.hidden_units, hidden, true, scale, rng),
                    ffn_config.activation,
                    Dropout::new(ffn_config.dropout),
                );
                Ok(DecoderLayer {
                    self_attn_norm: LayerNorm::identity(hidden, eps),
                    self_attn,
                    cross_attn_norm: LayerNorm::identity(hidden, eps),
                    cross_attn,
                    ffn_norm: LayerNorm::identity(hidden, eps),
                    ffn,
                    residual_dropout: Dropout::new(config.residual_dropout),
                })
            })
            .collect::<DecoderResult<Vec<_>>>()?;

        Ok(Self {
            layers,
            final_norm: LayerNorm::identity(hidden, eps),
            embedding_dropout: Dropout::new(config.embedding_dropout),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn hidden_size(&self) -> usize {
        self.final_norm.weight.len()
    }

    /// Full-sequence pass with a causal self-attention bias.
    pub fn forward(
        &self,
        mut inputs: Array3<f32>,
        memory: Option<&Array3<f32>>,
        memory_bias: Option<&Array4<f32>>,
        mut rng: Option<&mut StdRng>,
    ) -> DecoderResult<Array3<f32>> {
        let t_start = Instant::now();
        let self_bias = attention_bias_lower_triangle(inputs.shape()[1]);

        self.embedding_dropout.apply(&mut inputs, rng.as_deref_mut());
        let mut x = inputs;
        for layer in &self.layers {
            x = layer.forward(x, memory, &self_bias, memory_bias, rng.as_deref_mut())?;
        }
        let out = self.final_norm.forward(&x)?;

        log::debug!(
            "Decoder stack: {} layers over {:?} in {:?}",
            self.layers.len(),
            out.shape(),
            t_start.elapsed()
        );
        Ok(out)
    }

    /// Single-step pass: extends every layer cache by the new tokens and
    /// advances the cache step count.
    pub fn forward_step(
        &self,
        inputs: Array3<f32>,
        cache: &mut IncrementalCache,
    ) -> DecoderResult<Array3<f32>> {
        if cache.num_layers() != self.layers.len() {
            return Err(DecoderError::shape(
                "decoder step",
                format!(
                    "cache has {} layers, decoder has {}",
                    cache.num_layers(),
                    self.layers.len()
                ),
            ));
        }
        let mut x = inputs;
        {
            let (layer_caches, memory_bias) = cache.layers_mut();
            for (layer, layer_cache) in self.layers.iter().zip(layer_caches.iter_mut()) {
                x = layer.forward_step(x, layer_cache, memory_bias)?;
            }
        }
        cache.advance()?;
        self.final_norm.forward(&x)
    }

    /// Builds an empty cache for `rows` hypotheses. Memory keys/values are
    /// projected here, once per layer.
    pub fn init_cache(
        &self,
        memory: Option<&Array3<f32>>,
        memory_bias: Option<Array4<f32>>,
        position_signal: Array3<f32>,
    ) -> DecoderResult<IncrementalCache> {
        let (rows, capacity, hidden) = position_signal.dim();
        if hidden != self.hidden_size() {
            return Err(DecoderError::shape(
                "init cache",
                format!("position width {} vs hidden {}", hidden, self.hidden_size()),
            ));
        }
        if let Some(memory) = memory {
            if memory.shape()[0] != rows {
                return Err(DecoderError::shape(
                    "init cache",
                    format!("memory has {} rows, cache {}", memory.shape()[0], rows),
                ));
            }
        }

        let layers = self
            .layers
            .iter()
            .map(|layer| -> DecoderResult<LayerCache> {
                let memory_kv = memory
                    .map(|m| layer.cross_attn.project_kv(m))
                    .transpose()?;
                Ok(LayerCache::new(rows, capacity, hidden, memory_kv))
            })
            .collect::<DecoderResult<Vec<_>>>()?;

        IncrementalCache::new(layers, memory_bias, position_signal)
    }
}

impl Parameterized for DecoderStack {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params: Vec<_> = self.layers.iter().flat_map(|l| l.parameters()).collect();
        params.extend(self.final_norm.parameters());
        params
    }
}
