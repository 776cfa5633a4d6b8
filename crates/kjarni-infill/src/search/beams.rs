use std::time::Instant;

use ndarray::{Array2, Array3};

use crate::common::{DecodingStrategy, GenerationConfig, get_top_k_from_log_probs, log_softmax_1d};
use crate::error::{DecoderError, DecoderResult};
use crate::search::{DecodeStep, check_logits};

/// `((5 + length) / 6) ^ alpha`; `alpha = 0` gives 1.
pub fn length_penalty(length: usize, alpha: f32) -> f32 {
    ((5.0 + length as f32) / 6.0).powf(alpha)
}

#[derive(Clone, Debug, PartialEq)]
pub struct BeamHypothesis {
    /// Generated tokens, start token excluded.
    pub tokens: Vec<u32>,
    pub log_prob: f32,
    pub finished: bool,
}

impl BeamHypothesis {
    pub fn last_token(&self) -> Option<u32> {
        self.tokens.last().copied()
    }

    pub fn normalized_score(&self, alpha: f32) -> f32 {
        self.log_prob / length_penalty(self.tokens.len(), alpha)
    }
}

/// `beam_width` hypotheses per batch row, best first.
#[derive(Clone, Debug)]
pub struct BeamState {
    beams: Vec<Vec<BeamHypothesis>>,
    beam_width: usize,
    alpha: f32,
    eos_token_id: u32,
    step: usize,
}

impl BeamState {
    /// Only the first hypothesis of each row is live at the start; the others
    /// begin at `-inf` so the first expansion does not pick duplicates.
    pub fn new(batch_size: usize, beam_width: usize, alpha: f32, eos_token_id: u32) -> Self {
        let beams = (0..batch_size)
            .map(|_| {
                (0..beam_width)
                    .map(|i| BeamHypothesis {
                        tokens: Vec::new(),
                        log_prob: if i == 0 { 0.0 } else { f32::NEG_INFINITY },
                        finished: false,
                    })
                    .collect()
            })
            .collect();
        Self {
            beams,
            beam_width,
            alpha,
            eos_token_id,
            step: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.beams.len()
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn rows(&self) -> usize {
        self.batch_size() * self.beam_width
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn hypotheses(&self, batch_idx: usize) -> &[BeamHypothesis] {
        &self.beams[batch_idx]
    }

    pub fn all_finished(&self) -> bool {
        self.beams.iter().flatten().all(|h| h.finished)
    }

    /// Token to feed each row next: its last token, or the row's start token.
    pub fn current_tokens(&self, start_tokens: &[u32]) -> Vec<u32> {
        self.beams
            .iter()
            .zip(start_tokens)
            .flat_map(|(row, &start)| row.iter().map(move |h| h.last_token().unwrap_or(start)))
            .collect()
    }

    /// Expands, scores and prunes every row. Returns the parent row of each
    /// surviving hypothesis, for reordering the cache.
    ///
    /// Live hypotheses expand into their `beam_width` best tokens; finished
    /// ones are carried over unchanged. Candidates are enumerated parent by
    /// parent, best token first, and a stable sort keeps the earlier one when
    /// normalised scores tie.
    pub fn advance(&mut self, logits: &Array2<f32>) -> DecoderResult<Vec<usize>> {
        check_logits(logits, self.rows(), self.step)?;

        let k = self.beam_width;
        let mut parent_rows = Vec::with_capacity(self.rows());

        for (b, row_beams) in self.beams.iter_mut().enumerate() {
            let mut candidates: Vec<(f32, usize, BeamHypothesis)> = Vec::with_capacity(k * k);

            for (parent, hyp) in row_beams.iter().enumerate() {
                if hyp.finished {
                    candidates.push((hyp.normalized_score(self.alpha), parent, hyp.clone()));
                    continue;
                }
                let log_probs = log_softmax_1d(&logits.row(b * k + parent));
                for (token, token_lp) in get_top_k_from_log_probs(&log_probs, k) {
                    let mut tokens = Vec::with_capacity(hyp.tokens.len() + 1);
                    tokens.extend_from_slice(&hyp.tokens);
                    tokens.push(token);
                    let candidate = BeamHypothesis {
                        tokens,
                        log_prob: hyp.log_prob + token_lp,
                        finished: token == self.eos_token_id,
                    };
                    candidates.push((candidate.normalized_score(self.alpha), parent, candidate));
                }
            }

            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
            candidates.truncate(k);
            if candidates.len() < k {
                return Err(DecoderError::shape(
                    "beam search",
                    format!("only {} candidates for {} beams", candidates.len(), k),
                ));
            }

            parent_rows.extend(candidates.iter().map(|(_, parent, _)| b * k + parent));
            *row_beams = candidates.into_iter().map(|(_, _, h)| h).collect();
        }

        self.step += 1;
        Ok(parent_rows)
    }

    /// Best-first sequences padded with `eos_token_id`.
    pub fn finalize(self) -> BeamOutput {
        let batch = self.batch_size();
        let k = self.beam_width;
        let max_len = self
            .beams
            .iter()
            .flatten()
            .map(|h| h.tokens.len())
            .max()
            .unwrap_or(0);

        let mut sequences = Array3::from_elem((batch, k, max_len), self.eos_token_id);
        let mut lengths = Array2::<usize>::zeros((batch, k));
        let mut log_probs = Array2::<f32>::zeros((batch, k));
        let mut scores = Array2::<f32>::zeros((batch, k));

        for (b, row) in self.beams.iter().enumerate() {
            for (i, hyp) in row.iter().enumerate() {
                for (t, &token) in hyp.tokens.iter().enumerate() {
                    sequences[[b, i, t]] = token;
                }
                lengths[[b, i]] = hyp.tokens.len();
                log_probs[[b, i]] = hyp.log_prob;
                scores[[b, i]] = hyp.normalized_score(self.alpha);
            }
        }

        BeamOutput {
            sequences,
            lengths,
            log_probs,
            scores,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeamOutput {
    /// `[batch, beam, len]`, start token stripped, padded with EOS.
    pub sequences: Array3<u32>,
    pub lengths: Array2<usize>,
    /// Cumulative log-probabilities, `[batch, beam]`.
    pub log_probs: Array2<f32>,
    /// Length-normalised scores the beams are sorted by.
    pub scores: Array2<f32>,
}

/// `beam_width`-hypothesis decoding with length-penalised ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamSearch {
    pub eos_token_id: u32,
    pub beam_width: usize,
    pub decode_length: usize,
    pub alpha: f32,
}

impl BeamSearch {
    pub fn new(
        eos_token_id: u32,
        beam_width: usize,
        decode_length: usize,
        alpha: f32,
    ) -> DecoderResult<Self> {
        if beam_width < 1 {
            return Err(DecoderError::config("beam_width must be at least 1"));
        }
        Ok(Self {
            eos_token_id,
            beam_width,
            decode_length,
            alpha,
        })
    }

    pub fn from_config(config: &GenerationConfig) -> DecoderResult<Self> {
        match &config.strategy {
            DecodingStrategy::BeamSearch(params) => Self::new(
                config.eos_token_id,
                params.num_beams,
                config.max_length,
                params.alpha,
            ),
            DecodingStrategy::Greedy(_) => Self::new(config.eos_token_id, 1, config.max_length, 0.0),
        }
    }

    /// `cache` must already hold `start_tokens.len() * beam_width` rows, with
    /// the copies of each batch row adjacent.
    pub fn decode<M: DecodeStep>(
        &self,
        model: &M,
        cache: &mut M::Cache,
        start_tokens: &[u32],
    ) -> DecoderResult<BeamOutput> {
        let t_start = Instant::now();
        let mut state = BeamState::new(
            start_tokens.len(),
            self.beam_width,
            self.alpha,
            self.eos_token_id,
        );

        while state.step() < self.decode_length && !state.all_finished() {
            let tokens = state.current_tokens(start_tokens);
            let logits = model.decode_step(&tokens, state.step(), cache)?;
            let parent_rows = state.advance(&logits)?;
            model.reorder_cache(cache, &parent_rows)?;
            log::debug!("Beam step {}: parents {:?}", state.step() - 1, parent_rows);
        }

        log::info!(
            "Beam decode: {} rows x {} beams, {} steps in {:?}",
            state.batch_size(),
            self.beam_width,
            state.step(),
            t_start.elapsed()
        );
        Ok(state.finalize())
    }
}
