//! Policy-gradient fine-tuning signal for generated sequences.
//!
//! An external scorer assigns a reward to every generated step. The trainer
//! subtracts a learned per-step baseline, accumulates the advantages into
//! reward-to-go weights, and turns them into a REINFORCE loss over the
//! sampled tokens. The baseline is the only state kept between calls.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{Array1, Array2, Array3, Axis, s};
use serde::{Deserialize, Serialize};

use crate::activations::softmax_inplace;
use crate::error::{DecoderError, DecoderResult};
use crate::traits::Parameterized;
use crate::training::losses::{check_token_logits, clipped_log_prob};

fn default_max_seq_length() -> usize {
    10
}
fn default_baseline_learning_rate() -> f32 {
    0.01
}
fn default_reg_coefficient() -> f32 {
    1e-5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTrainerConfig {
    /// Length of the baseline; rewards may cover at most this many steps.
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_baseline_learning_rate")]
    pub baseline_learning_rate: f32,
    /// Weight of the L2 penalty in [`RewardTrainer::regularized_loss`].
    #[serde(default = "default_reg_coefficient")]
    pub reg_coefficient: f32,
}

impl Default for RewardTrainerConfig {
    fn default() -> Self {
        Self {
            max_seq_length: default_max_seq_length(),
            baseline_learning_rate: default_baseline_learning_rate(),
            reg_coefficient: default_reg_coefficient(),
        }
    }
}

/// Result of [`RewardTrainer::compute_policy_loss`].
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyLoss {
    pub loss: f32,
    /// Mean advantage, `mean(rewards - baseline)`.
    pub mean_reward: f32,
    /// `rewards - baseline`, `[batch, reward_steps]`.
    pub advantages: Array2<f32>,
    /// Suffix sums of the advantages, `[batch, reward_steps]`.
    pub reward_to_go: Array2<f32>,
    /// Steps that entered the loss: `min(reward_steps, truncate_at)`.
    pub steps: usize,
}

/// `w[b, t] = Σ_{t' >= t} a[b, t']`
pub fn reward_to_go(advantages: &Array2<f32>) -> Array2<f32> {
    let mut out = advantages.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let mut running = 0.0;
        for v in row.iter_mut().rev() {
            running += *v;
            *v = running;
        }
    }
    out
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

pub struct RewardTrainer {
    config: RewardTrainerConfig,
    baseline: RwLock<Array1<f32>>,
}

impl RewardTrainer {
    pub fn new(config: RewardTrainerConfig) -> DecoderResult<Self> {
        if config.max_seq_length == 0 {
            return Err(DecoderError::config("max_seq_length must be positive"));
        }
        if !(config.baseline_learning_rate >= 0.0) || !(config.reg_coefficient >= 0.0) {
            return Err(DecoderError::config(format!(
                "baseline_learning_rate ({}) and reg_coefficient ({}) must be non-negative",
                config.baseline_learning_rate, config.reg_coefficient
            )));
        }
        let baseline = RwLock::new(Array1::zeros(config.max_seq_length));
        Ok(Self { config, baseline })
    }

    pub fn config(&self) -> &RewardTrainerConfig {
        &self.config
    }

    fn read_baseline(&self) -> RwLockReadGuard<'_, Array1<f32>> {
        self.baseline.read().unwrap_or_else(|poisoned| {
            log::warn!("Baseline lock poisoned, reading last written values");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write_baseline(&self) -> RwLockWriteGuard<'_, Array1<f32>> {
        self.baseline.write().unwrap_or_else(|poisoned| {
            log::warn!("Baseline lock poisoned, overwriting last written values");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Snapshot of the current baseline.
    pub fn baseline(&self) -> Array1<f32> {
        self.read_baseline().clone()
    }

    fn check_reward_steps(&self, rewards: &Array2<f32>) -> DecoderResult<()> {
        if rewards.ncols() > self.config.max_seq_length {
            return Err(DecoderError::shape(
                "reward signal",
                format!(
                    "rewards cover {} steps, baseline holds {}",
                    rewards.ncols(),
                    self.config.max_seq_length
                ),
            ));
        }
        Ok(())
    }

    fn advantages_against(baseline: &Array1<f32>, rewards: &Array2<f32>) -> Array2<f32> {
        let steps = rewards.ncols();
        rewards - &baseline.slice(s![..steps])
    }

    /// `rewards - baseline[..steps]`
    pub fn advantages(&self, rewards: &Array2<f32>) -> DecoderResult<Array2<f32>> {
        self.check_reward_steps(rewards)?;
        Ok(Self::advantages_against(&self.read_baseline(), rewards))
    }

    /// `mean |rewards - baseline|`
    pub fn baseline_loss(&self, rewards: &Array2<f32>) -> DecoderResult<f32> {
        let advantages = self.advantages(rewards)?;
        Ok(advantages.mapv(f32::abs).mean().unwrap_or(0.0))
    }

    /// One gradient step of the baseline on `mean |rewards - baseline|`.
    ///
    /// Returns the loss before the step.
    pub fn update_baseline(&self, rewards: &Array2<f32>) -> DecoderResult<f32> {
        self.check_reward_steps(rewards)?;
        if rewards.is_empty() {
            return Ok(0.0);
        }
        let mut baseline = self.write_baseline();
        let advantages = Self::advantages_against(&baseline, rewards);
        let loss = advantages.mapv(f32::abs).mean().unwrap_or(0.0);

        let n = advantages.len() as f32;
        let lr = self.config.baseline_learning_rate;
        for (t, column) in advantages.axis_iter(Axis(1)).enumerate() {
            let grad = -column.iter().map(|&a| sign(a)).sum::<f32>() / n;
            baseline[t] -= lr * grad;
        }
        log::debug!("Baseline step: loss {:.4}", loss);
        Ok(loss)
    }

    /// REINFORCE loss of `sampled_ids` under `logits`, weighted by the
    /// reward-to-go of `rewards - baseline`.
    ///
    /// Only the first `min(reward_steps, truncate_at)` steps enter the loss.
    /// The baseline is read, not updated.
    pub fn compute_policy_loss(
        &self,
        sampled_ids: &Array2<u32>,
        logits: &Array3<f32>,
        rewards: &Array2<f32>,
        truncate_at: usize,
    ) -> DecoderResult<PolicyLoss> {
        check_token_logits("policy loss", sampled_ids, logits)?;
        let (batch, steps, _) = logits.dim();
        if rewards.nrows() != batch {
            return Err(DecoderError::shape(
                "policy loss",
                format!("rewards batch {} vs logits batch {}", rewards.nrows(), batch),
            ));
        }
        if rewards.ncols() > steps {
            return Err(DecoderError::shape(
                "policy loss",
                format!(
                    "rewards have {} steps, logits {}",
                    rewards.ncols(),
                    steps
                ),
            ));
        }

        let advantages = self.advantages(rewards)?;
        let weights = reward_to_go(&advantages);
        let window = rewards.ncols().min(truncate_at);
        let mean_reward = advantages.mean().unwrap_or(0.0);

        let count = batch * window;
        let loss = if count == 0 {
            log::warn!("Policy loss over an empty window, returning 0");
            0.0
        } else {
            let mut total = 0.0f32;
            for b in 0..batch {
                for t in 0..window {
                    let (log_p, _) =
                        clipped_log_prob(&logits.slice(s![b, t, ..]), sampled_ids[[b, t]]);
                    total += weights[[b, t]] * log_p;
                }
            }
            -total / count as f32
        };

        log::debug!(
            "Policy loss {:.4} over {} steps, mean reward {:.4}",
            loss,
            window,
            mean_reward
        );
        Ok(PolicyLoss {
            loss,
            mean_reward,
            advantages,
            reward_to_go: weights,
            steps: window,
        })
    }

    /// Policy loss plus `reg_coefficient * Σ ‖W‖² / 2` over `model`.
    pub fn regularized_loss(&self, policy: &PolicyLoss, model: &impl Parameterized) -> f32 {
        policy.loss + self.config.reg_coefficient * model.l2_loss()
    }
}

/// Gradient of [`PolicyLoss::loss`] with respect to `logits`.
///
/// `∂L/∂z[b, t, v] = -(w[b, t] / N) (1[v = y] - p[v])` inside the loss
/// window, zero outside it and wherever the probability clip was active.
pub fn policy_logit_gradients(
    sampled_ids: &Array2<u32>,
    logits: &Array3<f32>,
    policy: &PolicyLoss,
) -> DecoderResult<Array3<f32>> {
    check_token_logits("policy gradient", sampled_ids, logits)?;
    let (batch, steps, _) = logits.dim();
    if policy.reward_to_go.nrows() != batch || policy.steps > steps {
        return Err(DecoderError::shape(
            "policy gradient",
            format!(
                "loss covers {:?} / {} steps, logits {:?}",
                policy.reward_to_go.shape(),
                policy.steps,
                logits.shape()
            ),
        ));
    }

    let mut grads = Array3::zeros(logits.dim());
    let count = batch * policy.steps;
    if count == 0 {
        return Ok(grads);
    }
    for b in 0..batch {
        for t in 0..policy.steps {
            let row = logits.slice(s![b, t, ..]);
            let token = sampled_ids[[b, t]] as usize;
            let (_, clipped) = clipped_log_prob(&row, token as u32);
            if clipped {
                continue;
            }
            let mut probs = row.to_vec();
            softmax_inplace(&mut probs);
            let coef = -policy.reward_to_go[[b, t]] / count as f32;
            let mut out = grads.slice_mut(s![b, t, ..]);
            for (v, p) in probs.iter().enumerate() {
                let indicator = if v == token { 1.0 } else { 0.0 };
                out[v] = coef * (indicator - p);
            }
        }
    }
    Ok(grads)
}
