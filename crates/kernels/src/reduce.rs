//! Row-wise tree reductions used by the two-phase softmax and RMSNorm kernels.
//!
//! Phase one of both kernels reduces each row of the last axis to a single
//! statistic. The reference backend mirrors a shared-accumulator tree: partial
//! results are combined pairwise, halving the active width each round, so the
//! summation order matches what a work-group reduction produces.

/// Combines `values` pairwise until a single value remains.
pub fn tree_reduce<F>(values: &[f32], identity: f32, combine: F) -> f32
where
    F: Fn(f32, f32) -> f32,
{
    if values.is_empty() {
        return identity;
    }
    let mut scratch = values.to_vec();
    let mut width = scratch.len();
    while width > 1 {
        let half = width / 2;
        for i in 0..half {
            scratch[i] = combine(scratch[2 * i], scratch[2 * i + 1]);
        }
        if width % 2 == 1 {
            scratch[half] = scratch[width - 1];
            width = half + 1;
        } else {
            width = half;
        }
    }
    scratch[0]
}

pub fn row_max(row: &[f32]) -> f32 {
    tree_reduce(row, f32::NEG_INFINITY, f32::max)
}

pub fn row_sum(row: &[f32]) -> f32 {
    tree_reduce(row, 0.0, |a, b| a + b)
}

/// Mean of squared entries, accumulated through the same tree.
pub fn mean_square(row: &[f32]) -> f32 {
    if row.is_empty() {
        return 0.0;
    }
    let squares: Vec<f32> = row.iter().map(|v| v * v).collect();
    row_sum(&squares) / row.len() as f32
}

/// Sum of elementwise products of two equally sized rows.
pub fn row_dot(a: &[f32], b: &[f32]) -> f32 {
    let products: Vec<f32> = a.iter().zip(b).map(|(x, y)| x * y).collect();
    row_sum(&products)
}
