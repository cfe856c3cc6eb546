//! Capability-tagged tensor handle consumed by every kernel.
//!
//! Kernels never inspect storage dtypes to pick a code path; they match on
//! [`Operand::Plain`] or [`Operand::Packed`] instead. Structural helpers keep
//! the representation intact where the lane layout allows it and fall back to an
//! exact decode/re-encode otherwise (values that are already half precision
//! survive a second cast unchanged).

use candle_core::{DType, Device, Tensor};

use crate::packed::{lane_dims, pack, unpack, PackOptions, PackedTensor};
use crate::{checks, KernelError, Result};

/// A plain `f32` tensor or its packed half-precision counterpart.
#[derive(Debug, Clone)]
pub enum Operand {
    Plain(Tensor),
    Packed(PackedTensor),
}

impl From<Tensor> for Operand {
    fn from(tensor: Tensor) -> Self {
        Operand::Plain(tensor)
    }
}

impl From<PackedTensor> for Operand {
    fn from(tensor: PackedTensor) -> Self {
        Operand::Packed(tensor)
    }
}

impl Operand {
    pub fn is_packed(&self) -> bool {
        matches!(self, Operand::Packed(_))
    }

    /// Logical shape; packed operands report their unhalved last dimension.
    pub fn dims(&self) -> &[usize] {
        match self {
            Operand::Plain(t) => t.dims(),
            Operand::Packed(p) => p.dims(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims().len()
    }

    pub fn elem_count(&self) -> usize {
        checks::elem_count(self.dims())
    }

    pub fn device(&self) -> &Device {
        match self {
            Operand::Plain(t) => t.device(),
            Operand::Packed(p) => p.device(),
        }
    }

    /// Reads the logical values back to host memory, blocking on the device.
    pub fn materialize(&self) -> Result<Vec<f32>> {
        match self {
            Operand::Plain(t) => Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?),
            Operand::Packed(p) => p.decode(),
        }
    }

    /// Builds an operand from host values in the requested representation.
    pub fn from_host(values: Vec<f32>, dims: &[usize], packed: bool, device: &Device) -> Result<Self> {
        if packed {
            Ok(Operand::Packed(PackedTensor::from_values(&values, dims, device)?))
        } else {
            Ok(Operand::Plain(Tensor::from_vec(values, dims.to_vec(), device)?))
        }
    }

    /// Builds an operand with the same representation and device as `self`.
    pub fn like(&self, values: Vec<f32>, dims: &[usize]) -> Result<Self> {
        Self::from_host(values, dims, self.is_packed(), self.device())
    }

    /// Plain `f32` view of the operand, unpacking when needed.
    pub fn to_plain(&self) -> Result<Tensor> {
        match self {
            Operand::Plain(t) => Ok(t.clone()),
            Operand::Packed(p) => unpack(p),
        }
    }

    /// Converts to the requested representation.
    pub fn to_representation(&self, packed: bool) -> Result<Self> {
        match (self, packed) {
            (Operand::Plain(t), true) => Ok(Operand::Packed(pack(t, &PackOptions::default())?)),
            (Operand::Packed(p), false) => Ok(Operand::Plain(unpack(p)?)),
            _ => Ok(self.clone()),
        }
    }

    pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
        if checks::elem_count(dims) != self.elem_count() {
            return Err(KernelError::Usage(format!(
                "cannot reshape {:?} into {:?}",
                self.dims(),
                dims
            )));
        }
        match self {
            Operand::Plain(t) => Ok(Operand::Plain(t.reshape(dims.to_vec())?)),
            Operand::Packed(p) => {
                expect_unpadded("reshape", p)?;
                // Lanes never straddle rows while both last dimensions are even,
                // so the flat lane order is shared by both shapes.
                checks::expect_even_last("packed.reshape", dims)?;
                let lanes = p.lanes().reshape(lane_dims(dims))?;
                Ok(Operand::Packed(PackedTensor::from_lanes(lanes, dims.to_vec())?))
            }
        }
    }

    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        validate_perm(perm, self.rank())?;
        match self {
            Operand::Plain(t) => Ok(Operand::Plain(t.permute(perm.to_vec())?.contiguous()?)),
            Operand::Packed(p) => {
                expect_unpadded("permute", p)?;
                let last = self.rank() - 1;
                if perm[last] == last {
                    let lanes = p.lanes().permute(perm.to_vec())?.contiguous()?;
                    let dims: Vec<usize> = perm.iter().map(|&axis| p.dims()[axis]).collect();
                    Ok(Operand::Packed(PackedTensor::from_lanes(lanes, dims)?))
                } else {
                    let (values, dims) = permute_host(&p.decode()?, p.dims(), perm)?;
                    self.like(values, &dims)
                }
            }
        }
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let dims = self.dims();
        if dim >= dims.len() || start + len > dims[dim] {
            return Err(KernelError::Usage(format!(
                "narrow({dim}, {start}, {len}) out of range for {:?}",
                dims
            )));
        }
        match self {
            Operand::Plain(t) => Ok(Operand::Plain(t.narrow(dim, start, len)?)),
            Operand::Packed(p) => {
                expect_unpadded("narrow", p)?;
                let mut out = p.dims().to_vec();
                out[dim] = len;
                let lanes = if dim + 1 == dims.len() {
                    if start % 2 != 0 || len % 2 != 0 {
                        return Err(KernelError::Precision(format!(
                            "packed narrow along the last axis must be lane aligned (start {start}, len {len})"
                        )));
                    }
                    p.lanes().narrow(dim, start / 2, len / 2)?
                } else {
                    p.lanes().narrow(dim, start, len)?
                };
                Ok(Operand::Packed(PackedTensor::from_lanes(lanes, out)?))
            }
        }
    }

    /// Concatenates operands sharing one representation along `dim`.
    pub fn cat(items: &[&Operand], dim: usize) -> Result<Self> {
        let first = items
            .first()
            .ok_or_else(|| KernelError::Usage("cat requires at least one operand".into()))?;
        for item in &items[1..] {
            checks::expect_same_representation("cat", first, item)?;
        }
        match first {
            Operand::Plain(_) => {
                let tensors = items
                    .iter()
                    .map(|item| item.to_plain())
                    .collect::<Result<Vec<_>>>()?;
                Ok(Operand::Plain(Tensor::cat(&tensors, dim)?))
            }
            Operand::Packed(_) => {
                let mut lanes = Vec::with_capacity(items.len());
                let mut dims = first.dims().to_vec();
                dims[dim] = 0;
                for item in items {
                    if let Operand::Packed(p) = item {
                        expect_unpadded("cat", p)?;
                        dims[dim] += p.dims()[dim];
                        lanes.push(p.lanes().clone());
                    }
                }
                let lanes = Tensor::cat(&lanes, dim)?;
                Ok(Operand::Packed(PackedTensor::from_lanes(lanes, dims)?))
            }
        }
    }
}

fn expect_unpadded(op: &str, p: &PackedTensor) -> Result<()> {
    if p.is_padded() {
        Err(KernelError::Unsupported {
            op: "packed layout",
            detail: format!("{op} on a padded tensor; unpack it first"),
        })
    } else {
        Ok(())
    }
}

fn validate_perm(perm: &[usize], rank: usize) -> Result<()> {
    let mut seen = vec![false; rank];
    if perm.len() != rank {
        return Err(KernelError::Usage(format!(
            "permutation {:?} does not match rank {rank}",
            perm
        )));
    }
    for &axis in perm {
        if axis >= rank || seen[axis] {
            return Err(KernelError::Usage(format!("invalid permutation {:?}", perm)));
        }
        seen[axis] = true;
    }
    Ok(())
}

/// Row-major strides for `dims`.
pub(crate) fn strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

/// Host-side permutation; returns the permuted values and their shape.
pub(crate) fn permute_host(values: &[f32], dims: &[usize], perm: &[usize]) -> Result<(Vec<f32>, Vec<usize>)> {
    validate_perm(perm, dims.len())?;
    let in_strides = strides(dims);
    let out_dims: Vec<usize> = perm.iter().map(|&axis| dims[axis]).collect();
    let total = checks::elem_count(&out_dims);
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0usize; out_dims.len()];
    for _ in 0..total {
        let src: usize = index
            .iter()
            .zip(perm)
            .map(|(&i, &axis)| i * in_strides[axis])
            .sum();
        out.push(values[src]);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok((out, out_dims))
}

/// Inverse of a permutation.
pub(crate) fn invert_perm(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0usize; perm.len()];
    for (position, &axis) in perm.iter().enumerate() {
        inverse[axis] = position;
    }
    inverse
}
