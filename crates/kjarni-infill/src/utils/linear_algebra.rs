//! Linear algebra operations for the decoder.
//!
//! 2-D products go through faer; batched per-head products parallelise over
//! the batch axis with rayon and run each head single-threaded.

use faer::Parallelism;
use ndarray::{Array2, Array3, Array4, ArrayView2, Zip, linalg::general_mat_mul};

use crate::error::{DecoderError, DecoderResult};

fn contiguous<'a>(a: &'a ndarray::CowArray<'_, f32, ndarray::Ix2>, context: &str) -> DecoderResult<&'a [f32]> {
    a.as_slice()
        .ok_or_else(|| DecoderError::shape(context, "operand is not in standard layout"))
}

/// `a @ bᵀ` for `a: [m, k]` and a weight stored as `[n, k]`.
pub fn matmul_2d_transposed(
    a: &ArrayView2<f32>,
    b_transposed: &ArrayView2<f32>,
) -> DecoderResult<Array2<f32>> {
    let (m, k) = a.dim();
    let (n, k2) = b_transposed.dim();
    if k != k2 {
        return Err(DecoderError::shape(
            "matmul_2d_transposed",
            format!("inner dimensions differ: [{}, {}] @ [{}, {}]^T", m, k, n, k2),
        ));
    }

    let mut c = Array2::<f32>::zeros((m, n));
    let a_s = a.as_standard_layout();
    let b_s = b_transposed.as_standard_layout();
    let a_sl = contiguous(&a_s, "matmul_2d_transposed")?;
    let b_sl = contiguous(&b_s, "matmul_2d_transposed")?;
    if let Some(c_sl) = c.as_slice_mut() {
        faer::linalg::matmul::matmul(
            faer::mat::from_row_major_slice_mut(c_sl, m, n),
            faer::mat::from_row_major_slice(a_sl, m, k),
            faer::mat::from_row_major_slice(b_sl, n, k).transpose(),
            None,
            1.0,
            Parallelism::Rayon(0),
        );
    }
    Ok(c)
}

/// `[batch, seq, in] @ [out, in]^T -> [batch, seq, out]`
pub fn matmul_3d_2d_transposed(
    a: &Array3<f32>,
    b_transposed: &Array2<f32>,
) -> DecoderResult<Array3<f32>> {
    let (batch, m, k) = a.dim();
    let n = b_transposed.nrows();

    let a_std = a.as_standard_layout();
    let a_flat = a_std.view().into_shape_with_order((batch * m, k))?;
    let c_flat = matmul_2d_transposed(&a_flat, &b_transposed.view())?;

    Ok(c_flat.into_shape_with_order((batch, m, n))?)
}

/// Batched per-head product `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`.
pub fn matmul_4d(a: &Array4<f32>, b: &Array4<f32>) -> DecoderResult<Array4<f32>> {
    let (batch, heads, seq1, dim) = a.dim();
    let (b_batch, b_heads, dim2, seq2) = b.dim();
    if batch != b_batch || heads != b_heads || dim != dim2 {
        return Err(DecoderError::shape(
            "matmul_4d",
            format!("{:?} @ {:?}", a.shape(), b.shape()),
        ));
    }

    let mut output = Array4::<f32>::zeros((batch, heads, seq1, seq2));

    Zip::from(output.outer_iter_mut())
        .and(a.outer_iter())
        .and(b.outer_iter())
        .par_for_each(|mut out_b, a_b, b_b| {
            Zip::from(out_b.outer_iter_mut())
                .and(a_b.outer_iter())
                .and(b_b.outer_iter())
                .for_each(|mut out_h, a_h, b_h| {
                    general_mat_mul(1.0, &a_h, &b_h, 0.0, &mut out_h);
                });
        });

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array;

    #[test]
    fn test_transposed_matches_dot() {
        let a = Array::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as f32 * 0.1);
        let w = Array::from_shape_fn((5, 4), |(i, j)| (i as f32 - j as f32) * 0.2);
        let c = matmul_2d_transposed(&a.view(), &w.view()).unwrap();
        let expected = a.dot(&w.t());
        for (x, y) in c.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_transposed_rejects_mismatch() {
        let a = Array2::<f32>::zeros((2, 3));
        let w = Array2::<f32>::zeros((4, 5));
        assert!(matmul_2d_transposed(&a.view(), &w.view()).is_err());
    }

    #[test]
    fn test_matmul_3d_2d_transposed_shape() {
        let a = Array3::<f32>::ones((2, 3, 4));
        let w = Array2::<f32>::ones((6, 4));
        let c = matmul_3d_2d_transposed(&a, &w).unwrap();
        assert_eq!(c.shape(), &[2, 3, 6]);
        assert_abs_diff_eq!(c[[1, 2, 5]], 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_matmul_4d_per_head() {
        let a = Array::from_shape_fn((2, 2, 3, 4), |(b, h, i, j)| (b + h + i * j) as f32);
        let bm = Array::from_shape_fn((2, 2, 4, 2), |(b, h, i, j)| (b * h + i + j) as f32);
        let c = matmul_4d(&a, &bm).unwrap();
        for b in 0..2 {
            for h in 0..2 {
                let a_h: ndarray::ArrayView2<f32> = a.slice(ndarray::s![b, h, .., ..]);
                let b_h: ndarray::ArrayView2<f32> = bm.slice(ndarray::s![b, h, .., ..]);
                let expected = a_h.dot(&b_h);
                let got = c.slice(ndarray::s![b, h, .., ..]);
                assert_eq!(got, expected);
            }
        }
    }
}
