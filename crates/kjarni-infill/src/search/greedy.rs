use std::time::Instant;

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;

use crate::common::{
    DecodingStrategy, GenerationConfig, SamplingMethod, argmax, log_softmax_1d, sample_from_logits,
};
use crate::error::{DecoderError, DecoderResult};
use crate::search::{DecodeStep, check_logits};

/// Per-row progress of a greedy decode.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeState {
    pub step: usize,
    pub finished: Vec<bool>,
    /// Step at which each row first emitted EOS.
    pub finished_at: Vec<Option<usize>>,
    pub decoded_ids: Vec<Vec<u32>>,
    pub log_probs: Vec<f32>,
}

impl DecodeState {
    pub fn new(batch_size: usize) -> Self {
        Self {
            step: 0,
            finished: vec![false; batch_size],
            finished_at: vec![None; batch_size],
            decoded_ids: vec![Vec::new(); batch_size],
            log_probs: vec![0.0; batch_size],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.finished.len()
    }

    pub fn all_finished(&self) -> bool {
        self.finished.iter().all(|&f| f)
    }

    /// Picks one token per row from `logits`, records it, and updates the
    /// running log-probability and finished flags.
    pub fn advance(
        &mut self,
        logits: &Array2<f32>,
        method: SamplingMethod,
        eos_token_id: u32,
        accumulate_after_eos: bool,
        mut rng: Option<&mut StdRng>,
    ) -> DecoderResult<Vec<u32>> {
        check_logits(logits, self.batch_size(), self.step)?;

        let mut next_tokens = Vec::with_capacity(self.batch_size());
        for (row, row_logits) in logits.rows().into_iter().enumerate() {
            let token = match method {
                SamplingMethod::Argmax => argmax(&row_logits),
                SamplingMethod::Sample => {
                    let rng = rng.as_deref_mut().ok_or_else(|| {
                        DecoderError::config("sampling_method 'sample' needs a random generator")
                    })?;
                    sample_from_logits(&row_logits, rng)?
                }
            };

            let was_finished = self.finished[row];
            if !was_finished || accumulate_after_eos {
                self.log_probs[row] += log_softmax_1d(&row_logits)[token as usize];
            }
            if !was_finished && token == eos_token_id {
                self.finished[row] = true;
                self.finished_at[row] = Some(self.step);
            }
            self.decoded_ids[row].push(token);
            next_tokens.push(token);
        }

        self.step += 1;
        Ok(next_tokens)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GreedyOutput {
    /// `[batch, steps]`, tokens after a row's EOS included.
    pub sequences: Array2<u32>,
    pub log_probs: Array1<f32>,
    /// Tokens up to and including EOS, or `steps` for unfinished rows.
    pub lengths: Vec<usize>,
    pub finished: Vec<bool>,
}

/// Single-hypothesis decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct GreedySearch {
    pub eos_token_id: u32,
    pub max_length: usize,
    pub method: SamplingMethod,
    pub accumulate_after_eos: bool,
}

impl GreedySearch {
    pub fn new(eos_token_id: u32, max_length: usize, method: SamplingMethod) -> Self {
        Self {
            eos_token_id,
            max_length,
            method,
            accumulate_after_eos: true,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> DecoderResult<Self> {
        match &config.strategy {
            DecodingStrategy::Greedy(method) => Ok(Self {
                eos_token_id: config.eos_token_id,
                max_length: config.max_length,
                method: *method,
                accumulate_after_eos: config.accumulate_after_eos,
            }),
            DecodingStrategy::BeamSearch(_) => Err(DecoderError::config(
                "greedy search requested with a beam search strategy",
            )),
        }
    }

    /// Runs until every row has emitted EOS or `max_length` steps were taken.
    pub fn decode<M: DecodeStep>(
        &self,
        model: &M,
        cache: &mut M::Cache,
        start_tokens: &[u32],
        mut rng: Option<&mut StdRng>,
    ) -> DecoderResult<GreedyOutput> {
        let t_start = Instant::now();
        let batch_size = start_tokens.len();
        let mut state = DecodeState::new(batch_size);
        let mut tokens = start_tokens.to_vec();

        while state.step < self.max_length && !state.all_finished() {
            let logits = model.decode_step(&tokens, state.step, cache)?;
            tokens = state.advance(
                &logits,
                self.method,
                self.eos_token_id,
                self.accumulate_after_eos,
                rng.as_deref_mut(),
            )?;
            log::debug!("Greedy step {}: {:?}", state.step - 1, tokens);
        }

        let steps = state.step;
        let mut sequences = Array2::<u32>::zeros((batch_size, steps));
        for (row, ids) in state.decoded_ids.iter().enumerate() {
            for (t, &id) in ids.iter().enumerate() {
                sequences[[row, t]] = id;
            }
        }
        let lengths = state
            .finished_at
            .iter()
            .map(|at| at.map_or(steps, |s| s + 1))
            .collect();

        log::info!(
            "Greedy decode: {} rows, {} steps, {} finished in {:?}",
            batch_size,
            steps,
            state.finished.iter().filter(|&&f| f).count(),
            t_start.elapsed()
        );

        Ok(GreedyOutput {
            sequences,
            log_probs: Array1::from(state.log_probs),
            lengths,
            finished: state.finished,
        })
    }
}
