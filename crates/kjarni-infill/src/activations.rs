//! Activation functions and softmax operations.

use std::str::FromStr;

use libm::{erff, tanhf};
use ndarray::{Array3, ArrayViewMut1, Axis, Dimension, Zip};
use serde::{Deserialize, Serialize};

use crate::error::DecoderError;

/// Minimum array size for parallel execution.
pub const PARALLEL_THRESHOLD: usize = 16_384;

const SQRT_2_INV: f32 = 0.7071067811865475;
const SQRT_2_OVER_PI: f32 = 0.7978845608;
const GELU_COEFF: f32 = 0.044715;

/// Supported activation functions for the position-wise feedforward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
    #[serde(alias = "gelu_new")]
    GeluNew,
    Tanh,
}

impl FromStr for Activation {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_fast" => Ok(Activation::GeluNew),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(DecoderError::config(format!(
                "unknown activation function: {}",
                s
            ))),
        }
    }
}

#[inline(always)]
pub fn relu_scalar(x: f32) -> f32 {
    x.max(0.0)
}

#[inline(always)]
pub fn gelu_scalar(x: f32) -> f32 {
    0.5 * x * (1.0 + erff(x * SQRT_2_INV))
}

#[inline(always)]
pub fn gelu_new_scalar(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    0.5 * x * (1.0 + tanhf(inner))
}

impl Activation {
    #[inline(always)]
    pub fn apply_scalar(self, x: f32) -> f32 {
        match self {
            Activation::Relu => relu_scalar(x),
            Activation::Gelu => gelu_scalar(x),
            Activation::GeluNew => gelu_new_scalar(x),
            Activation::Tanh => tanhf(x),
        }
    }
}

/// Applies the activation in place, in parallel for large tensors.
pub fn apply_activation(arr: &mut Array3<f32>, activation: Activation) {
    if arr.len() >= PARALLEL_THRESHOLD {
        Zip::from(arr).par_for_each(|x| *x = activation.apply_scalar(*x));
    } else {
        arr.mapv_inplace(|x| activation.apply_scalar(x));
    }
}

/// Applies softmax in-place to a slice.
pub fn softmax_inplace(slice: &mut [f32]) {
    if slice.is_empty() {
        return;
    }

    let max = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));

    let mut sum = 0.0;
    for v in slice.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }

    if sum > 0.0 {
        let scale = 1.0 / sum;
        for v in slice.iter_mut() {
            *v *= scale;
        }
    }
}

fn softmax_row(mut row: ArrayViewMut1<f32>) {
    if let Some(slice) = row.as_slice_mut() {
        softmax_inplace(slice);
    } else {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

/// Softmax along the last axis of an array of any rank.
pub fn softmax_last_axis_inplace<D: Dimension>(scores: &mut ndarray::Array<f32, D>) {
    let last = Axis(scores.ndim() - 1);
    for row in scores.lanes_mut(last) {
        softmax_row(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut x: Array2<f32> = array![[1.0, 2.0, 3.0], [-1e9, 0.0, -1e9]];
        softmax_last_axis_inplace(&mut x);
        for row in x.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(x[[1, 1]], 1.0, epsilon = 1e-6);
        assert!(x[[0, 2]] > x[[0, 1]]);
    }

    #[test]
    fn test_activation_scalars() {
        assert_eq!(Activation::Relu.apply_scalar(-2.0), 0.0);
        assert_eq!(Activation::Relu.apply_scalar(1.5), 1.5);
        assert_abs_diff_eq!(Activation::Gelu.apply_scalar(0.0), 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(Activation::Gelu.apply_scalar(1.0), 0.8413, epsilon = 1e-3);
        assert_abs_diff_eq!(Activation::GeluNew.apply_scalar(1.0), 0.8412, epsilon = 1e-3);
    }

    #[test]
    fn test_activation_from_str() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("gelu_fast".parse::<Activation>().unwrap(), Activation::GeluNew);
        assert!("swiglu".parse::<Activation>().is_err());
    }
}
