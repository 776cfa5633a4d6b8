//! Traits shared by the decoder components.

use ndarray::ArrayViewD;

/// Anything that owns trainable weights.
pub trait Parameterized {
    /// Every weight tensor owned by this component, in a stable order.
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// `Σ ‖W‖² / 2` over all owned weights.
    fn l2_loss(&self) -> f32 {
        self.parameters()
            .iter()
            .map(|p| p.iter().map(|w| w * w).sum::<f32>())
            .sum::<f32>()
            * 0.5
    }
}
