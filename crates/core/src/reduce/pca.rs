//! Principal components by centered randomized SVD.
//!
//! The wide products run as candle matmuls on the uncentered data with the
//! column means subtracted from the product, so flattened hidden states are
//! never copied into a centered matrix. The small factorizations use nalgebra.

use candle_core::{DType, Device, Tensor};
use nalgebra::{DMatrix, SymmetricEigen};
use rand::rngs::StdRng;
use rand::Rng;

const OVERSAMPLING: usize = 10;
const POWER_ITERATIONS: usize = 2;

/// `X - 1 mean^T` for a `rows x dim` tensor, applied lazily.
struct Centered {
    x: Tensor,
    mean: Tensor,
}

impl Centered {
    fn new(data: &[f32], rows: usize, dim: usize) -> candle_core::Result<Self> {
        let x = Tensor::from_slice(data, (rows, dim), &Device::Cpu)?;
        let mean = x.mean_keepdim(0)?;
        Ok(Self { x, mean })
    }

    /// `Xc * right` for a `dim x c` matrix.
    fn mul(&self, right: &DMatrix<f64>) -> candle_core::Result<DMatrix<f64>> {
        let right = to_tensor(right)?;
        let product = self.x.matmul(&right)?.broadcast_sub(&self.mean.matmul(&right)?)?;
        to_matrix(&product)
    }

    /// `Xc^T * left` for a `rows x c` matrix.
    fn mul_t(&self, left: &DMatrix<f64>) -> candle_core::Result<DMatrix<f64>> {
        let left = to_tensor(left)?;
        let column_sums = left.sum_keepdim(0)?;
        let product = self
            .x
            .t()?
            .matmul(&left)?
            .broadcast_sub(&self.mean.t()?.matmul(&column_sums)?)?;
        to_matrix(&product)
    }
}

fn to_tensor(m: &DMatrix<f64>) -> candle_core::Result<Tensor> {
    // nalgebra stores columns contiguously.
    Tensor::from_slice(m.as_slice(), (m.ncols(), m.nrows()), &Device::Cpu)?
        .t()?
        .to_dtype(DType::F32)
}

fn to_matrix(t: &Tensor) -> candle_core::Result<DMatrix<f64>> {
    let (rows, cols) = t.dims2()?;
    let values = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(DMatrix::from_row_slice(rows, cols, &values))
}

/// Scores of the top `k` principal components, `rows x k` row-major.
///
/// Components are sign-normalized so their largest-magnitude score is positive.
/// Components past the rank of the data are zero.
pub fn principal_components(
    data: &[f32],
    rows: usize,
    dim: usize,
    k: usize,
    rng: &mut StdRng,
) -> candle_core::Result<Vec<f64>> {
    let mut scores = vec![0f64; rows * k];
    let rank_cap = k.min(rows).min(dim);
    if rank_cap == 0 {
        return Ok(scores);
    }
    let sketch = (rank_cap + OVERSAMPLING).min(rows).min(dim);
    let centered = Centered::new(data, rows, dim)?;

    let test_matrix = DMatrix::from_fn(dim, sketch, |_, _| if rng.gen::<bool>() { 1.0 } else { -1.0 });
    let mut q = centered.mul(&test_matrix)?.qr().q();
    for _ in 0..POWER_ITERATIONS {
        let z = centered.mul_t(&q)?.qr().q();
        q = centered.mul(&z)?.qr().q();
    }

    // B = Q^T Xc, and B B^T = Z^T Z with Z = Xc^T Q.
    let z = centered.mul_t(&q)?;
    let eigen = SymmetricEigen::new(z.transpose() * &z);
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    for (c, &e) in order.iter().take(rank_cap).enumerate() {
        let sigma = eigen.eigenvalues[e].max(0.0).sqrt();
        let column = &q * eigen.eigenvectors.column(e);
        for i in 0..rows {
            scores[i * k + c] = column[i] * sigma;
        }
        let pivot = (0..rows)
            .map(|i| scores[i * k + c])
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(0.0);
        if pivot < 0.0 {
            for i in 0..rows {
                scores[i * k + c] = -scores[i * k + c];
            }
        }
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn points_on_a_line_project_onto_the_first_component() {
        // Points along (1, 2, 2) / 3 with no spread elsewhere.
        let ts = [-2.0f32, -1.0, 0.0, 1.0, 2.0];
        let data: Vec<f32> = ts.iter().flat_map(|t| [t / 3.0, 2.0 * t / 3.0, 2.0 * t / 3.0]).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let scores = principal_components(&data, 5, 3, 2, &mut rng).unwrap();

        for (i, t) in ts.iter().enumerate() {
            assert!((scores[i * 2].abs() - t.abs() as f64).abs() < 1e-4, "{scores:?}");
            assert!(scores[i * 2 + 1].abs() < 1e-4, "{scores:?}");
        }
        // Sign normalization: the extreme score is positive.
        let extreme = scores.iter().step_by(2).cloned().fold(0.0f64, |a, b| if b.abs() > a.abs() { b } else { a });
        assert!(extreme > 0.0);
    }

    #[test]
    fn scores_are_deterministic_for_a_seed() {
        let data: Vec<f32> = (0..40).map(|v| ((v * 37) % 11) as f32).collect();
        let a = principal_components(&data, 8, 5, 2, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = principal_components(&data, 8, 5, 2, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn variance_is_ordered_by_component() {
        // Wide spread on the first axis, narrow on the second.
        let data: Vec<f32> = (0..20)
            .flat_map(|i| [(i as f32 - 10.0) * 3.0, if i % 2 == 0 { 0.5 } else { -0.5 }, 1.0])
            .collect();
        let scores = principal_components(&data, 20, 3, 2, &mut StdRng::seed_from_u64(3)).unwrap();
        let spread = |c: usize| scores.iter().skip(c).step_by(2).map(|s| s * s).sum::<f64>();
        assert!(spread(0) > 100.0 * spread(1));
        assert!((spread(1) - 5.0).abs() < 1e-2, "{}", spread(1));
    }

    #[test]
    fn single_row_has_no_variance() {
        let scores = principal_components(&[1.0, 2.0, 3.0], 1, 3, 2, &mut StdRng::seed_from_u64(0)).unwrap();
        assert!(scores.iter().all(|s| s.abs() < 1e-9));
    }
}
