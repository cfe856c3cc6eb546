//! Two-phase softmax over the last axis with optional fused dropout.
//!
//! Phase one reduces each row to its maximum through [`reduce::row_max`];
//! phase two exponentiates against that maximum and normalises by the tree sum.
//! Masked logits are exactly `-inf` and therefore produce exact zeros. A row
//! that is masked everywhere yields zeros instead of NaN.

use crate::dropout::{self, DropoutSpec};
use crate::{checks, reduce, Operand, Result};

/// Forward state needed by [`Softmax::backward`].
#[derive(Debug, Clone)]
pub struct SoftmaxSaved {
    /// Probabilities before dropout.
    probs: Vec<f32>,
    /// Scaled keep-mask, present when dropout was active.
    mask: Option<Vec<f32>>,
    template: Operand,
}

impl SoftmaxSaved {
    pub fn probabilities(&self) -> &[f32] {
        &self.probs
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax {
    pub dropout: Option<DropoutSpec>,
}

impl Softmax {
    pub fn new(dropout: Option<DropoutSpec>) -> Self {
        Self { dropout }
    }

    pub fn forward(&self, x: &Operand) -> Result<(Operand, SoftmaxSaved)> {
        checks::expect_min_rank("softmax", x.dims(), 1)?;
        let width = x.dims()[x.rank() - 1];
        let mut probs = x.materialize()?;
        if width > 0 {
            for row in probs.chunks_mut(width) {
                softmax_row(row);
            }
        }
        let mut out = probs.clone();
        let mask = dropout::apply(&mut out, self.dropout.as_ref());
        let output = x.like(out, x.dims())?;
        let saved = SoftmaxSaved {
            probs,
            mask,
            template: x.clone(),
        };
        Ok((output, saved))
    }

    pub fn backward(&self, grad: &Operand, saved: &SoftmaxSaved) -> Result<Operand> {
        checks::expect_same_representation("softmax.backward", grad, &saved.template)?;
        checks::expect_shape("softmax.backward", grad.dims(), saved.template.dims())?;
        let dims = saved.template.dims();
        let width = dims[dims.len() - 1];
        let mut g = grad.materialize()?;
        if let Some(mask) = &saved.mask {
            for (value, m) in g.iter_mut().zip(mask) {
                *value *= m;
            }
        }
        let mut dx = vec![0f32; g.len()];
        if width > 0 {
            for ((dx_row, g_row), y_row) in dx
                .chunks_mut(width)
                .zip(g.chunks(width))
                .zip(saved.probs.chunks(width))
            {
                let dot = reduce::row_dot(g_row, y_row);
                for ((d, gi), yi) in dx_row.iter_mut().zip(g_row).zip(y_row) {
                    *d = yi * (gi - dot);
                }
            }
        }
        saved.template.like(dx, dims)
    }
}

/// One-shot softmax without dropout.
pub fn softmax(x: &Operand) -> Result<Operand> {
    Ok(Softmax::default().forward(x)?.0)
}

fn softmax_row(row: &mut [f32]) {
    let max = reduce::row_max(row);
    if max == f32::NEG_INFINITY {
        row.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    for v in row.iter_mut() {
        *v = (*v - max).exp();
    }
    let sum = reduce::row_sum(row);
    for v in row.iter_mut() {
        *v /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn matches_candle_softmax() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 2f32, (3, 5, 7), &device)?;
        let expected = candle_nn::ops::softmax_last_dim(&x)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let out = softmax(&Operand::Plain(x))?.materialize()?;
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn masked_entries_are_exact_zeros() -> Result<()> {
        let device = Device::Cpu;
        let ninf = f32::NEG_INFINITY;
        let x = Operand::from_host(vec![0.3, ninf, 1.2, ninf, ninf, ninf], &[2, 3], false, &device)?;
        let y = softmax(&x)?.materialize()?;
        assert_eq!(y[1], 0.0);
        assert!((y[0] + y[2] - 1.0).abs() < 1e-6);
        assert_eq!(&y[3..], &[0.0, 0.0, 0.0]);
        assert!(y.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn backward_matches_finite_difference() -> Result<()> {
        let device = Device::Cpu;
        let x: Vec<f32> = (0..8).map(|i| (i as f32 * 0.37).sin()).collect();
        let upstream: Vec<f32> = (0..8).map(|i| (i as f32 * 0.11).cos()).collect();
        let op = Softmax::default();
        let input = Operand::from_host(x.clone(), &[2, 4], false, &device)?;
        let (_, saved) = op.forward(&input)?;
        let grad = Operand::from_host(upstream.clone(), &[2, 4], false, &device)?;
        let analytic = op.backward(&grad, &saved)?.materialize()?;

        let loss = |values: &[f32]| -> Result<f32> {
            let y = softmax(&Operand::from_host(values.to_vec(), &[2, 4], false, &device)?)?
                .materialize()?;
            Ok(y.iter().zip(&upstream).map(|(a, b)| a * b).sum())
        };
        let eps = 1e-3;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus[i] += eps;
            let mut minus = x.clone();
            minus[i] -= eps;
            let numeric = (loss(&plus)? - loss(&minus)?) / (2.0 * eps);
            assert!((numeric - analytic[i]).abs() < 1e-3, "index {i}");
        }
        Ok(())
    }

    #[test]
    fn dropout_replays_with_the_same_seed() -> Result<()> {
        let device = Device::Cpu;
        let x = Operand::Plain(Tensor::randn(0f32, 1f32, (4, 16), &device)?);
        let op = Softmax::new(Some(DropoutSpec::new(0.5, 99)?));
        let (first, saved) = op.forward(&x)?;
        let (second, _) = op.forward(&x)?;
        assert_eq!(first.materialize()?, second.materialize()?);
        let dropped = first.materialize()?.iter().filter(|v| **v == 0.0).count();
        assert!(dropped > 0);

        let ones = Operand::from_host(vec![1.0; 64], &[4, 16], false, &device)?;
        let dx = op.backward(&ones, &saved)?.materialize()?;
        assert!(dx.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn packed_input_stays_packed() -> Result<()> {
        let device = Device::Cpu;
        let x = Operand::Plain(Tensor::randn(0f32, 1f32, (2, 8), &device)?);
        let plain = softmax(&x)?.materialize()?;
        let packed = softmax(&x.to_representation(true)?)?;
        assert!(packed.is_packed());
        for (a, b) in packed.materialize()?.iter().zip(&plain) {
            assert!((a - b).abs() < 2e-3);
        }
        Ok(())
    }
}
