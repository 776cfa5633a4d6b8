//! Dense projection with weights stored as `[out_features, in_features]`.

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayViewD};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand_distr::Uniform;

use crate::error::DecoderResult;
use crate::traits::Parameterized;
use crate::utils::linear_algebra::{matmul_2d_transposed, matmul_3d_2d_transposed};

/// Uniform `[-scale, scale)` initialisation; zeros when `scale` is not positive.
pub fn uniform_init(shape: (usize, usize), scale: f32, rng: &mut StdRng) -> Array2<f32> {
    if scale > 0.0 {
        Array2::random_using(shape, Uniform::new(-scale, scale), rng)
    } else {
        Array2::zeros(shape)
    }
}

#[derive(Debug, Clone)]
pub struct LinearLayer {
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f32>, bias: impl Into<Option<Array1<f32>>>) -> Self {
        Self {
            weight,
            bias: bias.into(),
        }
    }

    pub fn random(
        in_features: usize,
        out_features: usize,
        with_bias: bool,
        scale: f32,
        rng: &mut StdRng,
    ) -> Self {
        let weight = uniform_init((out_features, in_features), scale, rng);
        let bias = with_bias.then(|| Array1::zeros(out_features));
        Self { weight, bias }
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// `[rows, in] -> [rows, out]`
    pub fn matmul(&self, input: &ArrayView2<f32>) -> DecoderResult<Array2<f32>> {
        let mut out = matmul_2d_transposed(input, &self.weight.view())?;
        if let Some(bias) = &self.bias {
            out += bias;
        }
        Ok(out)
    }

    /// `[batch, seq, in] -> [batch, seq, out]`
    pub fn forward(&self, input: &Array3<f32>) -> DecoderResult<Array3<f32>> {
        let mut out = matmul_3d_2d_transposed(input, &self.weight)?;
        if let Some(bias) = &self.bias {
            out += bias;
        }
        Ok(out)
    }
}

impl From<Array2<f32>> for LinearLayer {
    fn from(weight: Array2<f32>) -> Self {
        LinearLayer::new(weight, None)
    }
}

impl From<(Array2<f32>, Array1<f32>)> for LinearLayer {
    fn from((weight, bias): (Array2<f32>, Array1<f32>)) -> Self {
        LinearLayer::new(weight, bias)
    }
}

impl Parameterized for LinearLayer {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        let mut params = vec![self.weight.view().into_dyn()];
        if let Some(bias) = &self.bias {
            params.push(bias.view().into_dyn());
        }
        params
    }
}
