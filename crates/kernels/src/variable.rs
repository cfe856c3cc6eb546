//! Mutable weight tensors owned by a single layer.

use candle_core::{DType, Device, Tensor};

use crate::{checks, KernelError, Result};

/// A named weight with a trainable flag.
///
/// Only an explicit [`Variable::assign`] (weight loading) or an optimizer step
/// through [`Variable::apply_gradient`] mutates the value.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    value: Tensor,
    trainable: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>, value: Tensor, trainable: bool) -> Self {
        Self {
            name: name.into(),
            value,
            trainable,
        }
    }

    /// Normal initialisation with zero mean, as used for projection kernels.
    pub fn randn(name: impl Into<String>, dims: &[usize], std: f32, device: &Device) -> Result<Self> {
        let value = Tensor::randn(0f32, std, dims.to_vec(), device)?;
        Ok(Self::new(name, value, true))
    }

    pub fn zeros(name: impl Into<String>, dims: &[usize], device: &Device) -> Result<Self> {
        let value = Tensor::zeros(dims.to_vec(), DType::F32, device)?;
        Ok(Self::new(name, value, true))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn dims(&self) -> &[usize] {
        self.value.dims()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Replaces the value with a tensor of identical shape.
    pub fn assign(&mut self, value: Tensor) -> Result<()> {
        checks::expect_shape(&self.name, value.dims(), self.value.dims())?;
        self.value = value.to_dtype(DType::F32)?;
        Ok(())
    }

    /// Plain gradient step `value -= lr * grad`.
    pub fn apply_gradient(&mut self, grad: &Tensor, lr: f64) -> Result<()> {
        if !self.trainable {
            return Err(KernelError::Usage(format!(
                "variable {} is frozen and cannot be updated",
                self.name
            )));
        }
        checks::expect_shape(&self.name, grad.dims(), self.value.dims())?;
        self.value = (&self.value - grad.affine(lr, 0.0)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_step_moves_against_the_gradient() -> Result<()> {
        let device = Device::Cpu;
        let mut var = Variable::zeros("w", &[2, 2], &device)?;
        let grad = Tensor::ones((2, 2), DType::F32, &device)?;
        var.apply_gradient(&grad, 0.5)?;
        let values = var.value().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values, vec![-0.5; 4]);
        Ok(())
    }

    #[test]
    fn frozen_variables_reject_updates() -> Result<()> {
        let device = Device::Cpu;
        let mut var = Variable::zeros("w", &[3], &device)?;
        var.set_trainable(false);
        let grad = Tensor::ones(3, DType::F32, &device)?;
        assert!(matches!(
            var.apply_gradient(&grad, 0.1),
            Err(KernelError::Usage(_))
        ));
        Ok(())
    }

    #[test]
    fn assign_checks_shape() -> Result<()> {
        let device = Device::Cpu;
        let mut var = Variable::zeros("w", &[2, 3], &device)?;
        assert!(var.assign(Tensor::ones((3, 2), DType::F32, &device)?).is_err());
        var.assign(Tensor::ones((2, 3), DType::F32, &device)?)?;
        assert_eq!(var.value().sum_all()?.to_scalar::<f32>()?, 6.0);
        Ok(())
    }
}
