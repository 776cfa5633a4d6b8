//! Hidden states to vocabulary logits.

use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, ArrayView2, ArrayViewD};

use crate::error::{DecoderError, DecoderResult};
use crate::linear_layer::LinearLayer;
use crate::traits::Parameterized;
use crate::utils::linear_algebra::matmul_2d_transposed;

/// Output projection, fixed for the lifetime of the decoder.
#[derive(Debug, Clone)]
pub enum OutputProjection {
    /// `logits = h · Eᵀ (+ affine_bias)` over the shared embedding table.
    Tied {
        embedding: Arc<Array2<f32>>,
        affine_bias: Option<Array1<f32>>,
    },
    /// Independent dense layer `hidden -> vocab`.
    Untied(LinearLayer),
}

impl OutputProjection {
    pub fn tied(embedding: Arc<Array2<f32>>, with_bias: bool) -> Self {
        let affine_bias = with_bias.then(|| Array1::zeros(embedding.nrows()));
        OutputProjection::Tied {
            embedding,
            affine_bias,
        }
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            OutputProjection::Tied { embedding, .. } => embedding.nrows(),
            OutputProjection::Untied(layer) => layer.out_features(),
        }
    }

    pub fn hidden_size(&self) -> usize {
        match self {
            OutputProjection::Tied { embedding, .. } => embedding.ncols(),
            OutputProjection::Untied(layer) => layer.in_features(),
        }
    }

    pub fn is_tied(&self) -> bool {
        matches!(self, OutputProjection::Tied { .. })
    }

    /// `[rows, hidden] -> [rows, vocab]`
    pub fn project_2d(&self, hidden: &ArrayView2<f32>) -> DecoderResult<Array2<f32>> {
        if hidden.ncols() != self.hidden_size() {
            return Err(DecoderError::shape(
                "output projection",
                format!(
                    "hidden width {} vs projection width {}",
                    hidden.ncols(),
                    self.hidden_size()
                ),
            ));
        }
        match self {
            OutputProjection::Tied {
                embedding,
                affine_bias,
            } => {
                let mut logits = matmul_2d_transposed(hidden, &embedding.view())?;
                if let Some(bias) = affine_bias {
                    logits += bias;
                }
                Ok(logits)
            }
            OutputProjection::Untied(layer) => layer.matmul(hidden),
        }
    }

    /// `[batch, len, hidden] -> [batch, len, vocab]`
    pub fn project(&self, hidden: &Array3<f32>) -> DecoderResult<Array3<f32>> {
        let (batch, len, width) = hidden.dim();
        let contiguous = hidden.as_standard_layout();
        let flat = contiguous.view().into_shape_with_order((batch * len, width))?;
        let logits = self.project_2d(&flat)?;
        Ok(logits.into_shape_with_order((batch, len, self.vocab_size()))?)
    }
}

impl Parameterized for OutputProjection {
    /// The tied table is owned by the embedding and is not repeated here.
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        match self {
            OutputProjection::Tied { affine_bias, .. } => affine_bias
                .iter()
                .map(|b| b.view().into_dyn())
                .collect(),
            OutputProjection::Untied(layer) => layer.parameters(),
        }
    }
}
