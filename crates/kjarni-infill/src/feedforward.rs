//! Position-wise feedforward network: dense, activation, dropout, dense.

use ndarray::{Array3, ArrayViewD};
use rand::rngs::StdRng;

use crate::activations::{Activation, apply_activation};
use crate::dropout::Dropout;
use crate::error::DecoderResult;
use crate::linear_layer::LinearLayer;
use crate::traits::Parameterized;

#[derive(Debug, Clone)]
pub struct FeedForward {
    fc1: LinearLayer,
    fc2: LinearLayer,
    activation: Activation,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(
        fc1: impl Into<LinearLayer>,
        fc2: impl Into<LinearLayer>,
        activation: Activation,
        dropout: Dropout,
    ) -> Self {
        Self {
            fc1: fc1.into(),
            fc2: fc2.into(),
            activation,
            dropout,
        }
    }

    pub fn hidden_units(&self) -> usize {
        self.fc1.out_features()
    }

    pub fn forward(
        &self,
        hidden: &Array3<f32>,
        rng: Option<&mut StdRng>,
    ) -> DecoderResult<Array3<f32>> {
        let mut intermediate = self.fc1.forward(hidden)?;
        apply_activation(&mut intermediate, self.activation);
        self.dropout.apply(&mut intermediate, rng);
        self.fc2.forward(&intermediate)
    }
}

impl Parameterized for FeedForward {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};

    #[test]
    fn test_relu_ffn_known_values() {
        // fc1: identity with a negative bias on the second unit, fc2: sum
        let fc1 = LinearLayer::new(Array2::eye(2), Array1::from_vec(vec![0.0, -10.0]));
        let fc2 = LinearLayer::new(Array2::ones((1, 2)), None);
        let ffn = FeedForward::new(fc1, fc2, Activation::Relu, Dropout::new(0.1));

        let x = Array3::from_shape_vec((1, 2, 2), vec![1.0, 2.0, -3.0, 4.0]).unwrap();
        let out = ffn.forward(&x, None).unwrap();
        assert_eq!(out.shape(), &[1, 2, 1]);
        assert_abs_diff_eq!(out[[0, 0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(out[[0, 1, 0]], 0.0, epsilon = 1e-6);
        assert_eq!(ffn.hidden_units(), 2);
        assert_eq!(ffn.num_parameters(), 4 + 2 + 2);
    }
}
