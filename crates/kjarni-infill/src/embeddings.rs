//! Word embedding table shared between the decoder input and the tied
//! output projection.

use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayViewD, Axis, s};
use rand::rngs::StdRng;

use crate::error::{DecoderError, DecoderResult};
use crate::linear_layer::uniform_init;
use crate::traits::Parameterized;

#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    table: Arc<Array2<f32>>,
}

impl EmbeddingTable {
    /// Wraps a `[vocab_size, dim]` table. With `zero_pad`, row 0 is zeroed.
    pub fn new(mut table: Array2<f32>, zero_pad: bool) -> Self {
        if zero_pad && table.nrows() > 0 {
            table.slice_mut(s![0, ..]).fill(0.0);
        }
        Self {
            table: Arc::new(table),
        }
    }

    pub fn random(
        vocab_size: usize,
        dim: usize,
        zero_pad: bool,
        scale: f32,
        rng: &mut StdRng,
    ) -> Self {
        Self::new(uniform_init((vocab_size, dim), scale, rng), zero_pad)
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    /// Whether row 0, the padding id, is all zeros.
    pub fn padding_row_is_zero(&self) -> bool {
        self.table.nrows() == 0 || self.table.row(0).iter().all(|&v| v == 0.0)
    }

    /// Read-only handle on the table for the tied output projection.
    pub fn shared(&self) -> Arc<Array2<f32>> {
        Arc::clone(&self.table)
    }

    fn check_ids<'a>(&self, ids: impl Iterator<Item = &'a u32>) -> DecoderResult<Vec<usize>> {
        let vocab = self.vocab_size();
        ids.map(|&id| {
            let idx = id as usize;
            if idx < vocab {
                Ok(idx)
            } else {
                Err(DecoderError::shape(
                    "embedding lookup",
                    format!("token id {} out of range for vocab size {}", id, vocab),
                ))
            }
        })
        .collect()
    }

    /// `[rows] -> [rows, dim]`
    pub fn lookup_1d(&self, ids: &[u32]) -> DecoderResult<Array2<f32>> {
        let indices = self.check_ids(ids.iter())?;
        Ok(self.table.select(Axis(0), &indices))
    }

    /// `[batch, len] -> [batch, len, dim]`
    pub fn lookup(&self, ids: &Array2<u32>) -> DecoderResult<Array3<f32>> {
        let (batch, len) = ids.dim();
        let indices = self.check_ids(ids.iter())?;
        let flat = self.table.select(Axis(0), &indices);
        Ok(flat.into_shape_with_order((batch, len, self.dim()))?)
    }
}

impl Parameterized for EmbeddingTable {
    fn parameters(&self) -> Vec<ArrayViewD<'_, f32>> {
        vec![self.table.view().into_dyn()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_lookup_shapes_and_rows() {
        let table = array![[0.0f32, 0.1], [1.0, 1.1], [2.0, 2.1]];
        let emb = EmbeddingTable::new(table, false);
        let ids = array![[2u32, 0], [1, 1]];
        let out = emb.lookup(&ids).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);
        assert_eq!(out[[0, 0, 1]], 2.1);
        assert_eq!(out[[1, 1, 0]], 1.0);

        let rows = emb.lookup_1d(&[1, 2]).unwrap();
        assert_eq!(rows, array![[1.0, 1.1], [2.0, 2.1]]);
    }

    #[test]
    fn test_zero_pad_clears_first_row() {
        let emb = EmbeddingTable::random(5, 4, true, 0.5, &mut StdRng::seed_from_u64(0));
        let row = emb.lookup_1d(&[0]).unwrap();
        assert!(row.iter().all(|&v| v == 0.0));
        assert!(emb.padding_row_is_zero());
        assert!(!EmbeddingTable::new(Array2::ones((3, 2)), false).padding_row_is_zero());
    }

    #[test]
    fn test_out_of_range_id() {
        let emb = EmbeddingTable::new(Array2::zeros((3, 2)), false);
        assert!(emb.lookup_1d(&[3]).is_err());
    }

    #[test]
    fn test_shared_handle_points_at_same_table() {
        let emb = EmbeddingTable::new(Array2::ones((3, 2)), false);
        let shared = emb.shared();
        assert_eq!(Arc::strong_count(&shared), 2);
        assert_eq!(shared.shape(), &[3, 2]);
    }
}
