//! Layer normalization over the last axis.

use ndarray::{Array1, Array3, ArrayViewD, Axis};

use crate::error::{DecoderError, DecoderResult};
use crate::traits::Parameterized;

#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Self {
        Self { weight, bias, eps }
    }

    /// Unit scale, zero shift.
    pub fn identity(hidden_size: usize, eps: f32) -> Self {
        Self::new(Array1::ones(hidden_size), Array1::zeros(hidden_size), eps)
    }

    pub fn forward(&self, hidden_states: &Array3<f32>) -> DecoderResult<Array3<f32>> {
        let mean = hidden_states
            .mean_axis(Axis(2))
            .ok_or_else(|| DecoderError::shape("layer norm", "hidden size is zero"))?;
        let variance = hidden_states.var_axis(Axis(2), 0.0);

        let mean_expanded = mean.insert_axis(Axis(2));
        let inv_std = variance
            .insert_axis(Axis(2))
            .mapv(|v| 1.0 / (v + self.eps).sqrt());
        let normalized = (hidden_states - &mean_expanded) * &inv_std;

        Ok(normalized * &self.weight + &self.bias)
    }
}

impl Parameterized for LayerNorm {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.weight.view().into_dyn(), self.bias.view().into_dyn()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn test_layer_norm_basic() {
        let layer_norm = LayerNorm::identity(3, 1e-6);
        let input = Array3::from_shape_vec((1, 1, 3), vec![1.0, 2.0, 3.0]).unwrap();
        let output = layer_norm.forward(&input).unwrap();

        // mean 2, variance 2/3
        let expected = 1.0 / (2.0f32 / 3.0 + 1e-6).sqrt();
        assert_abs_diff_eq!(output[[0, 0, 0]], -expected, epsilon = 1e-4);
        assert_abs_diff_eq!(output[[0, 0, 1]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(output[[0, 0, 2]], expected, epsilon = 1e-4);
    }

    #[test]
    fn test_layer_norm_affine() {
        let layer_norm = LayerNorm::new(arr1(&[2.0, 2.0]), arr1(&[1.0, -1.0]), 1e-6);
        let input = Array3::from_shape_vec((1, 1, 2), vec![0.0, 4.0]).unwrap();
        let output = layer_norm.forward(&input).unwrap();
        assert_abs_diff_eq!(output[[0, 0, 0]], -1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(output[[0, 0, 1]], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_constant_row_is_finite() {
        let layer_norm = LayerNorm::identity(4, 1e-6);
        let input = Array3::from_elem((2, 3, 4), 5.0);
        let output = layer_norm.forward(&input).unwrap();
        assert!(output.iter().all(|x| x.is_finite() && x.abs() < 1e-3));
    }
}
