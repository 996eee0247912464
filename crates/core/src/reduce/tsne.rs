//! Barnes-Hut t-SNE (van der Maaten, 2014) into two dimensions.
//!
//! Input affinities are kept only between each row and its `3 * perplexity`
//! nearest neighbours, and the repulsion between embedded points is summed
//! over a quadtree. Memory stays linear in the number of rows.

use super::knn::nearest_neighbors;

const PERPLEXITY: f64 = 30.0;
const ITERATIONS: usize = 1000;
const EXAGGERATION_ITERATIONS: usize = 250;
const EXAGGERATION: f64 = 12.0;
const LEARNING_RATE: f64 = 200.0;
const MIN_GAIN: f64 = 0.01;
/// A quadtree cell is summarized when `width / distance < THETA`.
const THETA: f64 = 0.5;
const MAX_DEPTH: usize = 48;

/// Sparse symmetric rows of `(column, value)`, sorted by column.
type SparseRows = Vec<Vec<(usize, f64)>>;

/// Embeds `rows x dim` points, starting from `init` (`rows x 2`).
pub fn tsne(x: &[f64], rows: usize, dim: usize, init: Vec<[f64; 2]>) -> candle_core::Result<Vec<[f64; 2]>> {
    let perplexity = PERPLEXITY.min(((rows - 1) as f64 / 3.0).max(1.0));
    let k = (3.0 * perplexity) as usize + 1;
    let neighbors = nearest_neighbors(x, rows, dim, k)?;
    let p = joint_probabilities(&neighbors, perplexity);
    Ok(optimize(init, &p))
}

fn optimize(mut y: Vec<[f64; 2]>, p: &SparseRows) -> Vec<[f64; 2]> {
    let rows = y.len();
    let mut update = vec![[0f64; 2]; rows];
    let mut gains = vec![[1f64; 2]; rows];
    let mut grad = vec![[0f64; 2]; rows];
    let mut repulsion = vec![[0f64; 2]; rows];

    for iter in 0..ITERATIONS {
        let exaggeration = if iter < EXAGGERATION_ITERATIONS { EXAGGERATION } else { 1.0 };
        let momentum = if iter < EXAGGERATION_ITERATIONS { 0.5 } else { 0.8 };

        for (i, row) in p.iter().enumerate() {
            let mut g = [0f64; 2];
            for &(j, pij) in row {
                let dx = y[i][0] - y[j][0];
                let dy = y[i][1] - y[j][1];
                let coeff = exaggeration * pij / (1.0 + dx * dx + dy * dy);
                g[0] += coeff * dx;
                g[1] += coeff * dy;
            }
            grad[i] = g;
        }

        let tree = QuadTree::build(&y);
        let mut sum_q = 0.0;
        for (point, force) in y.iter().zip(repulsion.iter_mut()) {
            *force = [0.0, 0.0];
            sum_q += tree.repulsion(*point, THETA, force);
        }
        let sum_q = sum_q.max(f64::MIN_POSITIVE);

        for i in 0..rows {
            for d in 0..2 {
                let g = 4.0 * (grad[i][d] - repulsion[i][d] / sum_q);
                let same_direction = (g > 0.0) == (update[i][d] > 0.0);
                gains[i][d] = if same_direction {
                    (gains[i][d] * 0.8).max(MIN_GAIN)
                } else {
                    gains[i][d] + 0.2
                };
                update[i][d] = momentum * update[i][d] - LEARNING_RATE * gains[i][d] * g;
                y[i][d] += update[i][d];
            }
        }

        let mean = y.iter().fold([0f64; 2], |acc, p| [acc[0] + p[0], acc[1] + p[1]]);
        let mean = [mean[0] / rows as f64, mean[1] / rows as f64];
        for point in &mut y {
            point[0] -= mean[0];
            point[1] -= mean[1];
        }
    }
    y
}

/// Symmetrized input affinities over the neighbour graph, summing to one.
///
/// Each row's conditional distribution is calibrated to `perplexity` over its
/// own neighbours only.
fn joint_probabilities(neighbors: &[Vec<(usize, f64)>], perplexity: f64) -> SparseRows {
    let target_entropy = perplexity.ln();
    let mut joint: SparseRows = vec![Vec::new(); neighbors.len()];

    for (i, row) in neighbors.iter().enumerate() {
        let min_d = row.first().map_or(0.0, |(_, d)| *d);
        // Scale-free start: distances of wide embeddings can be huge.
        let typical = row.iter().map(|(_, d)| *d - min_d).find(|d| *d > 0.0);
        let mut beta = typical.map_or(1.0, |d| 1.0 / d);
        let (mut lo, mut hi) = (0.0f64, f64::INFINITY);
        let mut weights = vec![0f64; row.len()];
        for _ in 0..100 {
            let mut sum = 0.0;
            let mut weighted = 0.0;
            for (w, (_, d)) in weights.iter_mut().zip(row) {
                *w = (-(d - min_d) * beta).exp();
                sum += *w;
                weighted += (d - min_d) * *w;
            }
            let sum = sum.max(f64::MIN_POSITIVE);
            let entropy = sum.ln() + beta * weighted / sum;
            for w in weights.iter_mut() {
                *w /= sum;
            }
            let diff = entropy - target_entropy;
            if diff.abs() < 1e-5 {
                break;
            }
            if diff > 0.0 {
                lo = beta;
                beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
            } else {
                hi = beta;
                beta = (beta + lo) / 2.0;
            }
        }
        for (&w, &(j, _)) in weights.iter().zip(row) {
            joint[i].push((j, w));
            joint[j].push((i, w));
        }
    }

    let mut total = 0.0;
    for row in &mut joint {
        row.sort_by_key(|(j, _)| *j);
        row.dedup_by(|next, kept| {
            let same = next.0 == kept.0;
            if same {
                kept.1 += next.1;
            }
            same
        });
        total += row.iter().map(|(_, v)| v).sum::<f64>();
    }
    let total = total.max(f64::MIN_POSITIVE);
    for row in &mut joint {
        for (_, v) in row.iter_mut() {
            *v /= total;
        }
    }
    joint
}

struct Cell {
    center: [f64; 2],
    half: f64,
    mass: f64,
    com: [f64; 2],
    /// Index of the first of four consecutive children.
    children: Option<usize>,
}

impl Cell {
    fn new(center: [f64; 2], half: f64) -> Self {
        Self { center, half, mass: 0.0, com: [0.0, 0.0], children: None }
    }

    fn absorb(&mut self, point: [f64; 2], mass: f64) {
        let total = self.mass + mass;
        self.com = [
            (self.com[0] * self.mass + point[0] * mass) / total,
            (self.com[1] * self.mass + point[1] * mass) / total,
        ];
        self.mass = total;
    }

    fn quadrant(&self, point: [f64; 2]) -> usize {
        usize::from(point[0] >= self.center[0]) | usize::from(point[1] >= self.center[1]) << 1
    }
}

/// Point quadtree over the embedding, stored as an arena.
struct QuadTree {
    cells: Vec<Cell>,
}

impl QuadTree {
    fn build(points: &[[f64; 2]]) -> Self {
        let (mut lo, mut hi) = ([f64::INFINITY; 2], [f64::NEG_INFINITY; 2]);
        for p in points {
            for d in 0..2 {
                lo[d] = lo[d].min(p[d]);
                hi[d] = hi[d].max(p[d]);
            }
        }
        let center = [(lo[0] + hi[0]) / 2.0, (lo[1] + hi[1]) / 2.0];
        let half = ((hi[0] - lo[0]).max(hi[1] - lo[1]) / 2.0 * (1.0 + 1e-5)).max(1e-12);
        let mut tree = Self { cells: vec![Cell::new(center, half)] };
        for p in points {
            tree.insert(0, *p, 1.0, 0);
        }
        tree
    }

    fn insert(&mut self, index: usize, point: [f64; 2], mass: f64, depth: usize) {
        let cell = &mut self.cells[index];
        if cell.mass == 0.0 {
            cell.absorb(point, mass);
            return;
        }
        if let Some(first) = cell.children {
            cell.absorb(point, mass);
            let quadrant = cell.quadrant(point);
            self.insert(first + quadrant, point, mass, depth + 1);
            return;
        }
        // Duplicates, and points closer than the depth limit resolves, share a leaf.
        if cell.com == point || depth >= MAX_DEPTH {
            cell.absorb(point, mass);
            return;
        }

        let (resident, resident_mass) = (cell.com, cell.mass);
        let (center, half) = (cell.center, cell.half / 2.0);
        let first = self.cells.len();
        for quadrant in 0..4 {
            let x = if quadrant & 1 == 1 { center[0] + half } else { center[0] - half };
            let y = if quadrant & 2 == 2 { center[1] + half } else { center[1] - half };
            self.cells.push(Cell::new([x, y], half));
        }
        let cell = &mut self.cells[index];
        cell.children = Some(first);
        cell.absorb(point, mass);
        let (resident_quadrant, quadrant) = (cell.quadrant(resident), cell.quadrant(point));
        self.insert(first + resident_quadrant, resident, resident_mass, depth + 1);
        self.insert(first + quadrant, point, mass, depth + 1);
    }

    /// Adds the unnormalized repulsive force on `point` into `force` and
    /// returns its share of the normalization `sum_{j != i} (1 + d_ij^2)^-1`.
    fn repulsion(&self, point: [f64; 2], theta: f64, force: &mut [f64; 2]) -> f64 {
        let mut sum_q = 0.0;
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let cell = &self.cells[index];
            if cell.mass == 0.0 {
                continue;
            }
            let dx = point[0] - cell.com[0];
            let dy = point[1] - cell.com[1];
            let d2 = dx * dx + dy * dy;
            let width = 2.0 * cell.half;
            match cell.children {
                Some(first) if width * width >= theta * theta * d2 => stack.extend(first..first + 4),
                _ if d2 == 0.0 => {
                    // The point's own leaf; anything else in it sits at distance zero.
                    sum_q += (cell.mass - 1.0).max(0.0);
                }
                _ => {
                    let q = 1.0 / (1.0 + d2);
                    sum_q += cell.mass * q;
                    force[0] += cell.mass * q * q * dx;
                    force[1] += cell.mass * q * q * dy;
                }
            }
        }
        sum_q
    }
}
