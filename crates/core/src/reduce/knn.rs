//! Exact nearest neighbours from blocked squared-distance products.

use candle_core::{Device, Tensor};

/// Query rows per distance block; bounds the block to `BLOCK_ROWS x rows`.
const BLOCK_ROWS: usize = 512;

/// The `k` nearest other rows of each row of a `rows x dim` matrix, nearest
/// first, as `(row, squared distance)`. Ties go to the lower row index.
pub fn nearest_neighbors(
    x: &[f64],
    rows: usize,
    dim: usize,
    k: usize,
) -> candle_core::Result<Vec<Vec<(usize, f64)>>> {
    let k = k.min(rows.saturating_sub(1));
    let points = Tensor::from_slice(x, (rows, dim), &Device::Cpu)?;
    let norms = points.sqr()?.sum_keepdim(1)?;
    let norms_t = norms.t()?;
    let points_t = points.t()?;

    let mut neighbors = Vec::with_capacity(rows);
    for start in (0..rows).step_by(BLOCK_ROWS) {
        let len = BLOCK_ROWS.min(rows - start);
        let distances = (points.narrow(0, start, len)?.matmul(&points_t)? * -2.0)?
            .broadcast_add(&norms.narrow(0, start, len)?)?
            .broadcast_add(&norms_t)?
            .to_vec2::<f64>()?;

        for (offset, row) in distances.iter().enumerate() {
            let i = start + offset;
            let by_distance = |a: &usize, b: &usize| row[*a].total_cmp(&row[*b]).then(a.cmp(b));
            let mut order: Vec<usize> = (0..rows).filter(|&j| j != i).collect();
            if k < order.len() {
                order.select_nth_unstable_by(k, by_distance);
                order.truncate(k);
            }
            order.sort_by(by_distance);
            neighbors.push(order.into_iter().map(|j| (j, row[j].max(0.0))).collect());
        }
    }
    Ok(neighbors)
}
