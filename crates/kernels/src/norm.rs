//! RMS normalisation over the last axis.
//!
//! Phase one reduces each row to its mean of squares; phase two rescales every
//! element by `1 / sqrt(mean_square + eps)` and the learnable `gamma`. Inputs
//! may be packed; `gamma` is always a plain `[hidden]` tensor.

use candle_core::Tensor;

use crate::{checks, reduce, KernelError, Operand, Result};

pub const DEFAULT_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct RmsNormSaved {
    input: Operand,
    gamma: Vec<f32>,
    inv_rms: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RmsNormGrads {
    pub input: Operand,
    pub gamma: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RmsNorm {
    pub eps: f32,
}

impl Default for RmsNorm {
    fn default() -> Self {
        Self { eps: DEFAULT_EPS }
    }
}

impl RmsNorm {
    pub fn new(eps: f32) -> Result<Self> {
        if eps.is_nan() || eps <= 0.0 {
            return Err(KernelError::Config(format!(
                "rms norm epsilon must be positive, got {eps}"
            )));
        }
        Ok(Self { eps })
    }

    pub fn forward(&self, x: &Operand, gamma: &Tensor) -> Result<(Operand, RmsNormSaved)> {
        checks::expect_min_rank("rms_norm", x.dims(), 1)?;
        let hidden = x.dims()[x.rank() - 1];
        checks::expect_shape("rms_norm.gamma", gamma.dims(), &[hidden])?;
        let gamma = gamma.to_vec1::<f32>()?;
        let values = x.materialize()?;

        let rows = if hidden == 0 { 0 } else { values.len() / hidden };
        let mut inv_rms = Vec::with_capacity(rows);
        let mut out = vec![0f32; values.len()];
        if hidden > 0 {
            for (row, out_row) in values.chunks(hidden).zip(out.chunks_mut(hidden)) {
                let inv = 1.0 / (reduce::mean_square(row) + self.eps).sqrt();
                for ((o, v), g) in out_row.iter_mut().zip(row).zip(&gamma) {
                    *o = v * inv * g;
                }
                inv_rms.push(inv);
            }
        }

        let output = x.like(out, x.dims())?;
        let saved = RmsNormSaved {
            input: x.clone(),
            gamma,
            inv_rms,
        };
        Ok((output, saved))
    }

    /// `dx = dy·γ·inv − x·s` with `s = mean(dy·γ·x)·inv / (ms + eps)`,
    /// `dγ = Σ dy·x·inv` over every row.
    pub fn backward(&self, grad: &Operand, saved: &RmsNormSaved) -> Result<RmsNormGrads> {
        checks::expect_same_representation("rms_norm.backward", grad, &saved.input)?;
        checks::expect_shape("rms_norm.backward", grad.dims(), saved.input.dims())?;
        let hidden = saved.gamma.len();
        let dy = grad.materialize()?;
        let x = saved.input.materialize()?;

        let mut dx = vec![0f32; x.len()];
        let mut dgamma = vec![0f32; hidden];
        if hidden > 0 {
            for (((dx_row, dy_row), x_row), inv) in dx
                .chunks_mut(hidden)
                .zip(dy.chunks(hidden))
                .zip(x.chunks(hidden))
                .zip(&saved.inv_rms)
            {
                let weighted: Vec<f32> = dy_row.iter().zip(&saved.gamma).map(|(d, g)| d * g).collect();
                let mean = reduce::row_dot(&weighted, x_row) / hidden as f32;
                // inv^3 == inv / (ms + eps)
                let scale = mean * inv * inv * inv;
                for (c, d) in dx_row.iter_mut().enumerate() {
                    *d = weighted[c] * inv - x_row[c] * scale;
                    dgamma[c] += dy_row[c] * x_row[c] * inv;
                }
            }
        }

        Ok(RmsNormGrads {
            input: saved.input.like(dx, saved.input.dims())?,
            gamma: Tensor::from_vec(dgamma, hidden, saved.input.device())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample(n: usize, phase: f32) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.71 + phase).sin()).collect()
    }

    #[test]
    fn matches_candle_rms_norm() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (2, 3, 8), &device)?;
        let gamma = Tensor::randn(1f32, 0.1f32, 8, &device)?;
        let expected = candle_nn::ops::rms_norm(&x, &gamma, DEFAULT_EPS)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let (out, _) = RmsNorm::default().forward(&Operand::Plain(x), &gamma)?;
        for (a, b) in out.materialize()?.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn gradients_match_finite_difference() -> Result<()> {
        let device = Device::Cpu;
        let dims = [3usize, 4];
        let x = sample(12, 0.2);
        let gamma = sample(4, 1.3);
        let upstream = sample(12, 2.9);
        let norm = RmsNorm::default();

        let loss = |xv: &[f32], gv: &[f32]| -> Result<f32> {
            let input = Operand::from_host(xv.to_vec(), &dims, false, &device)?;
            let g = Tensor::from_vec(gv.to_vec(), 4, &device)?;
            let y = norm.forward(&input, &g)?.0.materialize()?;
            Ok(y.iter().zip(&upstream).map(|(a, b)| a * b).sum())
        };

        let input = Operand::from_host(x.clone(), &dims, false, &device)?;
        let g = Tensor::from_vec(gamma.clone(), 4, &device)?;
        let (_, saved) = norm.forward(&input, &g)?;
        let grad = Operand::from_host(upstream.clone(), &dims, false, &device)?;
        let grads = norm.backward(&grad, &saved)?;
        let dx = grads.input.materialize()?;
        let dgamma = grads.gamma.to_vec1::<f32>()?;

        let eps = 1e-3;
        for i in 0..x.len() {
            let (mut plus, mut minus) = (x.clone(), x.clone());
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (loss(&plus, &gamma)? - loss(&minus, &gamma)?) / (2.0 * eps);
            assert!((numeric - dx[i]).abs() < 2e-3, "dx[{i}]");
        }
        for c in 0..gamma.len() {
            let (mut plus, mut minus) = (gamma.clone(), gamma.clone());
            plus[c] += eps;
            minus[c] -= eps;
            let numeric = (loss(&x, &plus)? - loss(&x, &minus)?) / (2.0 * eps);
            assert!((numeric - dgamma[c]).abs() < 2e-3, "dgamma[{c}]");
        }
        Ok(())
    }

    #[test]
    fn gamma_must_match_hidden_width() -> Result<()> {
        let device = Device::Cpu;
        let x = Operand::from_host(sample(8, 0.0), &[2, 4], false, &device)?;
        let gamma = Tensor::ones(3, candle_core::DType::F32, &device)?;
        assert!(RmsNorm::default().forward(&x, &gamma).is_err());
        assert!(RmsNorm::new(0.0).is_err());
        Ok(())
    }
}
