//! Losses for supervised and reward-driven training.
//!
//! Nothing here runs the decoder: both losses take logits the caller already
//! computed, so an external optimiser can drive the updates.

pub mod losses;
pub mod reward;

pub use losses::{PROB_EPSILON, clipped_log_prob, sequence_cross_entropy};
pub use reward::{
    PolicyLoss, RewardTrainer, RewardTrainerConfig, policy_logit_gradients, reward_to_go,
};
