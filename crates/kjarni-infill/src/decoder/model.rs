//! The template-conditioned decoder: embeddings, position signal, layer stack
//! and output projection behind one step function.

use std::time::Instant;

use ndarray::{Array2, Array3, Array4, ArrayViewD, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::cache::IncrementalCache;
use crate::common::{DecodingStrategy, argmax};
use crate::data::SequenceBatch;
use crate::decoder::config::DecoderConfig;
use crate::decoder::stack::DecoderStack;
use crate::embeddings::EmbeddingTable;
use crate::error::{DecoderError, DecoderResult};
use crate::linear_layer::LinearLayer;
use crate::lm_head::OutputProjection;
use crate::position::SegmentalPositionEncoder;
use crate::search::{BeamOutput, BeamSearch, DecodeStep, GreedyOutput, GreedySearch};
use crate::traits::Parameterized;
use crate::training::losses::sequence_cross_entropy;
use crate::utils::masks::tile_rows;

/// Memory and per-step positions for an incremental decode.
#[derive(Debug, Clone, Copy)]
pub struct DecodeInputs<'a> {
    /// Encoded template, `[batch, mem_len, hidden]`.
    pub memory: Option<&'a Array3<f32>>,
    /// Bias over memory positions, `[batch or 1, 1, 1, mem_len]`.
    pub memory_bias: Option<&'a Array4<f32>>,
    /// `[batch, >= max_length]`; column `t` positions the input of step `t`.
    pub segment_ids: &'a Array2<u32>,
    pub offsets: &'a Array2<u32>,
}

/// Decoded ids and their scores, one or more hypotheses per batch row.
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
    /// `[batch, hypotheses, steps]`; greedy decoding yields one hypothesis.
    pub sampled_ids: Array3<u32>,
    /// `[batch, hypotheses]`
    pub log_probs: Array2<f32>,
    /// Tokens up to and including EOS, `[batch, hypotheses]`.
    pub lengths: Array2<usize>,
}

impl From<GreedyOutput> for Predictions {
    fn from(out: GreedyOutput) -> Self {
        let batch = out.lengths.len();
        Self {
            sampled_ids: out.sequences.insert_axis(Axis(1)),
            log_probs: out.log_probs.insert_axis(Axis(1)),
            lengths: Array2::from_shape_fn((batch, 1), |(b, _)| out.lengths[b]),
        }
    }
}

impl From<BeamOutput> for Predictions {
    fn from(out: BeamOutput) -> Self {
        Self {
            sampled_ids: out.sequences,
            log_probs: out.log_probs,
            lengths: out.lengths,
        }
    }
}

pub struct TemplateTransformerDecoder {
    config: DecoderConfig,
    embedding: EmbeddingTable,
    position: SegmentalPositionEncoder,
    stack: DecoderStack,
    output: OutputProjection,
}

impl TemplateTransformerDecoder {
    /// Builds a decoder with freshly initialised weights.
    ///
    /// Without `embedding`, a table of `config.vocab_size` rows is created;
    /// with one, its shape must agree with the configuration and, under
    /// `zero_pad`, its row 0 must already be zero.
    pub fn new(config: DecoderConfig, embedding: Option<EmbeddingTable>) -> DecoderResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embedding = match (embedding, config.vocab_size) {
            (Some(table), Some(vocab)) if table.vocab_size() != vocab => {
                return Err(DecoderError::config(format!(
                    "embedding table has {} rows but vocab_size is {}",
                    table.vocab_size(),
                    vocab
                )));
            }
            (Some(table), _) if config.zero_pad && !table.padding_row_is_zero() => {
                return Err(DecoderError::config(
                    "zero_pad is set but the given embedding table has a non-zero row 0",
                ));
            }
            (Some(table), _) => table,
            (None, Some(vocab)) => EmbeddingTable::random(
                vocab,
                config.num_units,
                config.zero_pad,
                config.init_scale,
                &mut rng,
            ),
            (None, None) => {
                return Err(DecoderError::config(
                    "vocab_size is required when no embedding table is given",
                ));
            }
        };
        if embedding.dim() != config.num_units {
            return Err(DecoderError::config(format!(
                "embedding dim {} does not match num_units {}",
                embedding.dim(),
                config.num_units
            )));
        }

        let stack = DecoderStack::random(&config, &mut rng)?;
        let output = if config.share_embed_and_transform {
            OutputProjection::tied(embedding.shared(), config.transform_with_bias)
        } else {
            OutputProjection::Untied(LinearLayer::random(
                config.num_units,
                embedding.vocab_size(),
                config.transform_with_bias,
                config.init_scale,
                &mut rng,
            ))
        };
        let position = SegmentalPositionEncoder::new(config.num_units, config.position_embedder);

        log::info!(
            "Template decoder: {} blocks, {} heads, width {}, vocab {}, {} parameters",
            config.num_blocks,
            config.num_heads,
            config.num_units,
            embedding.vocab_size(),
            stack.num_parameters() + embedding.num_parameters() + output.num_parameters()
        );

        Ok(Self {
            config,
            embedding,
            position,
            stack,
            output,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn embedding(&self) -> &EmbeddingTable {
        &self.embedding
    }

    pub fn stack(&self) -> &DecoderStack {
        &self.stack
    }

    pub fn output(&self) -> &OutputProjection {
        &self.output
    }

    pub fn hidden_size(&self) -> usize {
        self.config.num_units
    }

    /// Template word embeddings plus position signal, `[batch, len, hidden]`.
    pub fn encode_template(&self, template: &SequenceBatch) -> DecoderResult<Array3<f32>> {
        let mut memory = self.embedding.lookup(&template.ids)?;
        memory += &self
            .position
            .encode(&template.segment_ids, &template.offsets)?;
        Ok(memory)
    }

    /// Scaled decoder input embeddings plus position signal.
    fn embed_inputs(&self, inputs: &SequenceBatch) -> DecoderResult<Array3<f32>> {
        let mut x = self.embedding.lookup(&inputs.ids)?;
        let scale = self.config.embedding_scale();
        if scale != 1.0 {
            x.mapv_inplace(|v| v * scale);
        }
        x += &self.position.encode(&inputs.segment_ids, &inputs.offsets)?;
        Ok(x)
    }

    /// Full-sequence logits `[batch, len, vocab]` for `inputs`.
    pub fn decode_full(
        &self,
        inputs: &SequenceBatch,
        memory: Option<&Array3<f32>>,
        memory_bias: Option<&Array4<f32>>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<Array3<f32>> {
        if let Some(memory) = memory {
            if memory.shape()[0] != inputs.batch_size() {
                return Err(DecoderError::shape(
                    "decoder forward",
                    format!(
                        "memory batch {} vs input batch {}",
                        memory.shape()[0],
                        inputs.batch_size()
                    ),
                ));
            }
        }
        let x = self.embed_inputs(inputs)?;
        let hidden = self.stack.forward(x, memory, memory_bias, rng)?;
        self.output.project(&hidden)
    }

    /// Teacher-forced pass over `ids[:, :-1]` conditioned on the template.
    ///
    /// Returns the logits `[batch, len - 1, vocab]` and their argmax.
    pub fn forward(
        &self,
        decoder_batch: &SequenceBatch,
        template: &SequenceBatch,
        memory_bias: Option<&Array4<f32>>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<(Array3<f32>, Array2<u32>)> {
        if decoder_batch.len() < 2 {
            return Err(DecoderError::shape(
                "decoder forward",
                format!(
                    "need at least 2 tokens per row, got {}",
                    decoder_batch.len()
                ),
            ));
        }
        if template.batch_size() != decoder_batch.batch_size() {
            return Err(DecoderError::shape(
                "decoder forward",
                format!(
                    "template batch {} vs decoder batch {}",
                    template.batch_size(),
                    decoder_batch.batch_size()
                ),
            ));
        }
        let t_start = Instant::now();
        let inputs = decoder_batch.slice_steps(0, decoder_batch.len() - 1)?;
        let memory = self.encode_template(template)?;
        let logits = self.decode_full(&inputs, Some(&memory), memory_bias, rng)?;

        let (batch, len, _) = logits.dim();
        let preds = Array2::from_shape_fn((batch, len), |(b, t)| {
            argmax(&logits.slice(s![b, t, ..]))
        });
        log::debug!(
            "Decoder forward over {:?} in {:?}",
            logits.shape(),
            t_start.elapsed()
        );
        Ok((logits, preds))
    }

    /// Mean cross-entropy of `ids[:, 1:]` under the teacher-forced logits.
    ///
    /// `lengths` are full sequence lengths including the start token; row `b`
    /// contributes its first `lengths[b] - 1` targets.
    pub fn teacher_forcing_loss(
        &self,
        decoder_batch: &SequenceBatch,
        template: &SequenceBatch,
        lengths: &[usize],
        memory_bias: Option<&Array4<f32>>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<f32> {
        let (logits, _) = self.forward(decoder_batch, template, memory_bias, rng)?;
        let targets = decoder_batch.ids.slice(s![.., 1..]).to_owned();
        let target_lengths: Vec<usize> = lengths.iter().map(|l| l.saturating_sub(1)).collect();
        sequence_cross_entropy(&logits, &targets, &target_lengths)
    }

    /// Builds the cache for one decode call with room for `max_length` steps.
    ///
    /// With `expand > 1` every batch row is repeated `expand` times, copies
    /// adjacent, as beam search expects.
    pub fn init_cache(
        &self,
        inputs: &DecodeInputs<'_>,
        max_length: usize,
        expand: usize,
    ) -> DecoderResult<IncrementalCache> {
        let (batch, available) = inputs.segment_ids.dim();
        if inputs.offsets.dim() != inputs.segment_ids.dim() {
            return Err(DecoderError::shape(
                "init cache",
                format!(
                    "segment ids {:?} vs offsets {:?}",
                    inputs.segment_ids.shape(),
                    inputs.offsets.shape()
                ),
            ));
        }
        if available < max_length {
            return Err(DecoderError::shape(
                "init cache",
                format!(
                    "positions cover {} steps, max_length is {}",
                    available, max_length
                ),
            ));
        }
        let expand = expand.max(1);

        let steps = s![.., 0..max_length];
        let mut position_signal = self.position.encode(
            &inputs.segment_ids.slice(steps).to_owned(),
            &inputs.offsets.slice(steps).to_owned(),
        )?;
        let mut memory = inputs.memory.cloned();
        let mut memory_bias = inputs.memory_bias.cloned();
        if expand > 1 {
            position_signal = tile_rows(&position_signal, expand);
            memory = memory.map(|m| tile_rows(&m, expand));
            memory_bias = memory_bias.map(|bias| {
                if bias.shape()[0] == batch {
                    tile_rows(&bias, expand)
                } else {
                    bias
                }
            });
        }

        self.stack
            .init_cache(memory.as_ref(), memory_bias, position_signal)
    }

    pub fn greedy_decode(
        &self,
        search: &GreedySearch,
        start_tokens: &[u32],
        inputs: &DecodeInputs<'_>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<GreedyOutput> {
        let mut cache = self.init_cache(inputs, search.max_length, 1)?;
        search.decode(self, &mut cache, start_tokens, rng)
    }

    pub fn beam_decode(
        &self,
        search: &BeamSearch,
        start_tokens: &[u32],
        inputs: &DecodeInputs<'_>,
    ) -> DecoderResult<BeamOutput> {
        let mut cache = self.init_cache(inputs, search.decode_length, search.beam_width)?;
        search.decode(self, &mut cache, start_tokens)
    }

    /// Decodes from `bos_id` conditioned on the template: greedy when
    /// `beam_width <= 1`, beam search otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn dynamic_decode(
        &self,
        template: &SequenceBatch,
        memory_bias: Option<&Array4<f32>>,
        segment_ids: &Array2<u32>,
        offsets: &Array2<u32>,
        bos_id: u32,
        eos_id: u32,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<Predictions> {
        let batch = template.batch_size();
        if segment_ids.nrows() != batch {
            return Err(DecoderError::shape(
                "dynamic decode",
                format!(
                    "template batch {} vs position batch {}",
                    batch,
                    segment_ids.nrows()
                ),
            ));
        }
        let memory = self.encode_template(template)?;
        let inputs = DecodeInputs {
            memory: Some(&memory),
            memory_bias,
            segment_ids,
            offsets,
        };
        let start_tokens = vec![bos_id; batch];

        let mut generation = self.config.generation_config();
        generation.eos_token_id = eos_id;
        match &generation.strategy {
            DecodingStrategy::Greedy(_) => {
                let search = GreedySearch::from_config(&generation)?;
                Ok(self
                    .greedy_decode(&search, &start_tokens, &inputs, rng)?
                    .into())
            }
            DecodingStrategy::BeamSearch(_) => {
                let search = BeamSearch::from_config(&generation)?;
                Ok(self.beam_decode(&search, &start_tokens, &inputs)?.into())
            }
        }
    }

    /// [`Self::dynamic_decode`] from the configured `bos_idx` to `eos_idx`.
    pub fn generate(
        &self,
        template: &SequenceBatch,
        memory_bias: Option<&Array4<f32>>,
        segment_ids: &Array2<u32>,
        offsets: &Array2<u32>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<Predictions> {
        self.dynamic_decode(
            template,
            memory_bias,
            segment_ids,
            offsets,
            self.config.bos_idx,
            self.config.eos_idx,
            rng,
        )
    }
}

impl DecodeStep for TemplateTransformerDecoder {
    type Cache = IncrementalCache;

    fn vocab_size(&self) -> usize {
        self.output.vocab_size()
    }

    fn decode_step(
        &self,
        token_ids: &[u32],
        step: usize,
        cache: &mut IncrementalCache,
    ) -> DecoderResult<Array2<f32>> {
        cache.check_step(step)?;
        if token_ids.len() != cache.rows() {
            return Err(DecoderError::shape(
                "decode step",
                format!("{} tokens for {} cache rows", token_ids.len(), cache.rows()),
            ));
        }

        let mut x = self.embedding.lookup_1d(token_ids)?;
        let scale = self.config.embedding_scale();
        if scale != 1.0 {
            x.mapv_inplace(|v| v * scale);
        }
        x += &cache.position_at(step);

        let hidden = self.stack.forward_step(x.insert_axis(Axis(1)), cache)?;
        self.output.project_2d(&hidden.index_axis(Axis(1), 0))
    }

    fn reorder_cache(
        &self,
        cache: &mut IncrementalCache,
        parent_rows: &[usize],
    ) -> DecoderResult<()> {
        cache.reorder(parent_rows)
    }
}

impl Parameterized for TemplateTransformerDecoder {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.embedding.parameters();
        params.extend(self.stack.parameters());
        params.extend(self.output.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::Activation;
    use crate::decoder::config::FeedForwardConfig;
    use crate::utils::masks::attention_bias_from_lengths;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    fn tiny_config() -> DecoderConfig {
        DecoderConfig {
            num_blocks: 2,
            num_heads: 2,
            num_units: 8,
            vocab_size: Some(7),
            poswise_feedforward: FeedForwardConfig {
                hidden_units: 16,
                activation: Activation::Relu,
                dropout: 0.1,
            },
            maximum_decode_length: 5,
            seed: 7,
            ..Default::default()
        }
    }

    fn batch(ids: Vec<u32>, rows: usize) -> SequenceBatch {
        let len = ids.len() / rows;
        let ids = Array2::from_shape_vec((rows, len), ids).unwrap();
        let segment_ids = Array2::zeros((rows, len));
        let offsets = Array2::from_shape_fn((rows, len), |(_, t)| t as u32);
        SequenceBatch::new(ids, segment_ids, offsets).unwrap()
    }

    #[test]
    fn test_requires_vocab_or_table() {
        let config = DecoderConfig {
            vocab_size: None,
            ..tiny_config()
        };
        assert!(matches!(
            TemplateTransformerDecoder::new(config.clone(), None),
            Err(DecoderError::Configuration(_))
        ));

        let mut rng = StdRng::seed_from_u64(0);
        let table = EmbeddingTable::random(11, 8, false, 0.1, &mut rng);
        let model = TemplateTransformerDecoder::new(config, Some(table)).unwrap();
        assert_eq!(model.vocab_size(), 11);

        let wrong_dim = EmbeddingTable::random(7, 6, false, 0.1, &mut rng);
        assert!(TemplateTransformerDecoder::new(tiny_config(), Some(wrong_dim)).is_err());
    }

    #[test]
    fn test_zero_pad_rejects_given_table_with_padding_row() {
        let config = DecoderConfig {
            zero_pad: true,
            ..tiny_config()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let dense = EmbeddingTable::random(7, 8, false, 0.1, &mut rng);
        assert!(matches!(
            TemplateTransformerDecoder::new(config.clone(), Some(dense)),
            Err(DecoderError::Configuration(_))
        ));

        let padded = EmbeddingTable::random(7, 8, true, 0.1, &mut rng);
        let model = TemplateTransformerDecoder::new(config, Some(padded)).unwrap();
        assert!(model.embedding().padding_row_is_zero());
    }

    #[test]
    fn test_tied_output_shares_embedding() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        match model.output() {
            OutputProjection::Tied { embedding, .. } => {
                assert!(std::sync::Arc::ptr_eq(embedding, &model.embedding().shared()));
            }
            OutputProjection::Untied(_) => panic!("expected tied projection"),
        }

        let untied = TemplateTransformerDecoder::new(
            DecoderConfig {
                share_embed_and_transform: false,
                ..tiny_config()
            },
            None,
        )
        .unwrap();
        assert!(!untied.output().is_tied());
        assert!(untied.num_parameters() > model.num_parameters());
    }

    #[test]
    fn test_forward_shapes() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        let decoder_batch = batch(vec![1, 3, 4, 2, 1, 5, 2, 0], 2);
        let template = batch(vec![3, 6, 6, 4, 0, 0], 2);

        let (logits, preds) = model.forward(&decoder_batch, &template, None, None).unwrap();
        assert_eq!(logits.shape(), &[2, 3, 7]);
        assert_eq!(preds.shape(), &[2, 3]);
        assert!(preds.iter().all(|&p| p < 7));
    }

    #[test]
    fn test_forward_is_deterministic_without_rng() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        let decoder_batch = batch(vec![1, 3, 4, 2], 1);
        let template = batch(vec![3, 6, 4], 1);
        let (a, _) = model.forward(&decoder_batch, &template, None, None).unwrap();
        let (b, _) = model.forward(&decoder_batch, &template, None, None).unwrap();
        assert_eq!(a, b);

        let mut rng = StdRng::seed_from_u64(3);
        let (c, _) = model
            .forward(&decoder_batch, &template, None, Some(&mut rng))
            .unwrap();
        assert!(a.iter().zip(c.iter()).any(|(x, y)| (x - y).abs() > 1e-6));
    }

    #[test]
    fn test_forward_rejects_short_or_mismatched_batches() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        let short = batch(vec![1, 1], 2);
        let template = batch(vec![3, 4], 2);
        assert!(model.forward(&short, &template, None, None).is_err());

        let decoder_batch = batch(vec![1, 3, 2], 1);
        assert!(model.forward(&decoder_batch, &template, None, None).is_err());
    }

    #[test]
    fn test_teacher_forcing_loss_is_positive() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        let decoder_batch = batch(vec![1, 3, 4, 2, 1, 5, 2, 0], 2);
        let template = batch(vec![3, 6, 6, 4, 0, 0], 2);
        let bias = attention_bias_from_lengths(&[3, 2], template.len());

        let loss = model
            .teacher_forcing_loss(&decoder_batch, &template, &[4, 3], Some(&bias), None)
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss > 0.0);
        // near-uniform logits from a small init
        assert_abs_diff_eq!(loss, 7.0f32.ln(), epsilon = 1.0);
    }

    #[test]
    fn test_init_cache_needs_enough_positions() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        let segment_ids = Array2::zeros((2, 3));
        let offsets = Array2::zeros((2, 3));
        let inputs = DecodeInputs {
            memory: None,
            memory_bias: None,
            segment_ids: &segment_ids,
            offsets: &offsets,
        };
        assert!(model.init_cache(&inputs, 4, 1).is_err());

        let cache = model.init_cache(&inputs, 3, 2).unwrap();
        assert_eq!(cache.rows(), 4);
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.num_layers(), 2);
    }

    #[test]
    fn test_decode_step_checks_step_index() {
        let model = TemplateTransformerDecoder::new(tiny_config(), None).unwrap();
        let segment_ids = Array2::zeros((1, 4));
        let offsets = Array2::from_shape_fn((1, 4), |(_, t)| t as u32);
        let inputs = DecodeInputs {
            memory: None,
            memory_bias: None,
            segment_ids: &segment_ids,
            offsets: &offsets,
        };
        let mut cache = model.init_cache(&inputs, 4, 1).unwrap();

        let err = model.decode_step(&[1], 1, &mut cache).unwrap_err();
        assert!(matches!(
            err,
            DecoderError::CacheDesync {
                expected: 1,
                actual: 0
            }
        ));

        let logits = model.decode_step(&[1], 0, &mut cache).unwrap();
        assert_eq!(logits.shape(), &[1, 7]);
        assert_eq!(cache.step_count(), 1);
        assert!(model.decode_step(&[1, 1], 1, &mut cache).is_err());
    }

    #[test]
    fn test_predictions_from_greedy() {
        let out = GreedyOutput {
            sequences: Array2::from_shape_vec((2, 2), vec![3, 2, 4, 4]).unwrap(),
            log_probs: Array1::from(vec![-1.0, -2.0]),
            lengths: vec![2, 2],
            finished: vec![true, false],
        };
        let preds = Predictions::from(out);
        assert_eq!(preds.sampled_ids.shape(), &[2, 1, 2]);
        assert_eq!(preds.log_probs.shape(), &[2, 1]);
        assert_eq!(preds.sampled_ids[[1, 0, 1]], 4);
        assert_eq!(preds.lengths[[0, 0]], 2);
    }
}
