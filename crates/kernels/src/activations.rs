//! Activation catalogue for fused kernels.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the tanh approximation used by GPT style models:
//!   `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))`.
//! * **Identity** passes values through and is the default for fused matmuls.
//!
//! Activations evaluate in `f32` even when operands are packed; packed outputs
//! are re-encoded after the non-linearity.

use crate::{checks, KernelError, Operand, Result};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_CUBIC: f32 = 0.044_715;

/// Identifies which non-linearity a kernel fuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// Identity function.
    #[default]
    Identity,
    /// GeLU with the tanh approximation.
    Gelu,
}

impl ActivationKind {
    /// Parses the attribute spelling used by the kernel registry.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "linear" | "identity" => Ok(Self::Identity),
            "gelu" => Ok(Self::Gelu),
            other => Err(KernelError::Config(format!("unknown activation {other:?}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gelu => "gelu",
        }
    }

    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Identity => x,
            Self::Gelu => gelu(x),
        }
    }

    #[inline]
    pub fn derivative(self, x: f32) -> f32 {
        match self {
            Self::Identity => 1.0,
            Self::Gelu => gelu_derivative(x),
        }
    }
}

#[inline]
pub fn gelu(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

#[inline]
pub fn gelu_derivative(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
    let t = inner.tanh();
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_CUBIC * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

/// Saved state of a [`Gelu`] forward pass.
#[derive(Debug, Clone)]
pub struct GeluSaved {
    input: Operand,
}

/// Standalone elementwise GELU op.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gelu;

impl Gelu {
    pub fn forward(&self, x: &Operand) -> Result<(Operand, GeluSaved)> {
        let values: Vec<f32> = x.materialize()?.into_iter().map(gelu).collect();
        let out = x.like(values, x.dims())?;
        Ok((out, GeluSaved { input: x.clone() }))
    }

    pub fn backward(&self, grad: &Operand, saved: &GeluSaved) -> Result<Operand> {
        checks::expect_same_representation("gelu.backward", grad, &saved.input)?;
        checks::expect_shape("gelu.backward", grad.dims(), saved.input.dims())?;
        let dy = grad.materialize()?;
        let x = saved.input.materialize()?;
        let dx = dy
            .iter()
            .zip(&x)
            .map(|(g, v)| g * gelu_derivative(*v))
            .collect();
        saved.input.like(dx, saved.input.dims())
    }
}
