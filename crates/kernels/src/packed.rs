//! Packed half-precision codec.
//!
//! A [`PackedTensor`] keeps the logical shape of a plain `f32` tensor while its
//! storage is a `u32` tensor whose last dimension is halved: lane `i` of a row
//! holds the binary16 bits of logical element `2i` in its low half and of
//! element `2i + 1` in its high half. Conversion is lossy (roughly three
//! significant decimal digits); values beyond the binary16 range saturate to
//! infinity.
//!
//! Packing can pad the last two dimensions up to a multiple of a block factor
//! for tiled kernels. Padding is recorded on the tensor and sliced away again by
//! [`unpack`].

use candle_core::{DType, Device, Tensor};
use half::f16;

use crate::{checks, KernelError, Result};

/// Knobs accepted by [`pack`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackOptions {
    /// Multiplier applied to every value before the half-precision cast.
    pub scale: f32,
    /// Block factor for padding the last two dimensions; `0` disables padding.
    pub pad: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self { scale: 1.0, pad: 0 }
    }
}

/// Encodes two `f32` values into one packed lane.
#[inline]
pub fn encode_lane(even: f32, odd: f32) -> u32 {
    let lo = f16::from_f32(even).to_bits() as u32;
    let hi = f16::from_f32(odd).to_bits() as u32;
    lo | (hi << 16)
}

/// Decodes a packed lane into its `(even, odd)` pair.
#[inline]
pub fn decode_lane(lane: u32) -> (f32, f32) {
    let even = f16::from_bits((lane & 0xFFFF) as u16).to_f32();
    let odd = f16::from_bits((lane >> 16) as u16).to_f32();
    (even, odd)
}

/// Tensor whose last dimension stores two half-precision values per `u32` lane.
#[derive(Debug, Clone)]
pub struct PackedTensor {
    lanes: Tensor,
    logical: Vec<usize>,
    padded: Vec<usize>,
    scale: f32,
    pad: usize,
}

impl PackedTensor {
    /// Packs host values laid out row-major with logical shape `dims`.
    pub fn from_values(values: &[f32], dims: &[usize], device: &Device) -> Result<Self> {
        checks::expect_min_rank("packed.from_values", dims, 1)?;
        checks::expect_even_last("packed.from_values", dims)?;
        if values.len() != checks::elem_count(dims) {
            return Err(KernelError::Usage(format!(
                "packed.from_values: {} values do not fill shape {:?}",
                values.len(),
                dims
            )));
        }
        let lanes: Vec<u32> = values
            .chunks_exact(2)
            .map(|pair| encode_lane(pair[0], pair[1]))
            .collect();
        let lanes = Tensor::from_vec(lanes, lane_dims(dims), device)?;
        Ok(Self {
            lanes,
            logical: dims.to_vec(),
            padded: dims.to_vec(),
            scale: 1.0,
            pad: 0,
        })
    }

    /// Wraps an existing lane tensor describing an unpadded logical shape.
    pub fn from_lanes(lanes: Tensor, logical: Vec<usize>) -> Result<Self> {
        if lanes.dtype() != DType::U32 {
            return Err(KernelError::Precision(format!(
                "packed lanes must be u32, got {:?}",
                lanes.dtype()
            )));
        }
        checks::expect_even_last("packed.from_lanes", &logical)?;
        checks::expect_shape("packed.from_lanes", lanes.dims(), &lane_dims(&logical))?;
        Ok(Self {
            lanes,
            padded: logical.clone(),
            logical,
            scale: 1.0,
            pad: 0,
        })
    }

    /// Logical shape, excluding any padding.
    pub fn dims(&self) -> &[usize] {
        &self.logical
    }

    /// Logical shape including padding.
    pub fn padded_dims(&self) -> &[usize] {
        &self.padded
    }

    /// Raw `u32` lane storage.
    pub fn lanes(&self) -> &Tensor {
        &self.lanes
    }

    pub fn device(&self) -> &Device {
        self.lanes.device()
    }

    /// Scale applied when the tensor was packed.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Padding block factor recorded at pack time (`0` when unpadded).
    pub fn pad(&self) -> usize {
        self.pad
    }

    pub fn is_padded(&self) -> bool {
        self.logical != self.padded
    }

    /// Decodes the logical (unpadded) values to host memory.
    pub fn decode(&self) -> Result<Vec<f32>> {
        let padded = self.decode_padded()?;
        if !self.is_padded() {
            return Ok(padded);
        }
        Ok(slice_padding(&padded, &self.padded, &self.logical))
    }

    fn decode_padded(&self) -> Result<Vec<f32>> {
        let lanes = self.lanes.flatten_all()?.to_vec1::<u32>()?;
        let mut values = Vec::with_capacity(lanes.len() * 2);
        for lane in lanes {
            let (even, odd) = decode_lane(lane);
            values.push(even);
            values.push(odd);
        }
        Ok(values)
    }
}

/// Casts `x` to half precision and pairs adjacent last-axis elements into lanes.
pub fn pack(x: &Tensor, options: &PackOptions) -> Result<PackedTensor> {
    let dims = x.dims().to_vec();
    checks::expect_min_rank("pack", &dims, 1)?;
    let padded = padded_dims(&dims, options.pad);
    checks::expect_even_last("pack", &padded)?;

    let values = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let values = if padded == dims {
        values
    } else {
        insert_padding(&values, &dims, &padded)
    };

    let scale = options.scale;
    let lanes: Vec<u32> = values
        .chunks_exact(2)
        .map(|pair| encode_lane(pair[0] * scale, pair[1] * scale))
        .collect();
    let lanes = Tensor::from_vec(lanes, lane_dims(&padded), x.device())?;
    Ok(PackedTensor {
        lanes,
        logical: dims,
        padded,
        scale,
        pad: options.pad,
    })
}

/// Expands lanes back to `f32`, slicing away recorded padding.
///
/// The pack-time scale is not undone.
pub fn unpack(x: &PackedTensor) -> Result<Tensor> {
    let values = x.decode()?;
    Ok(Tensor::from_vec(values, x.logical.clone(), x.device())?)
}

/// Gradient of [`pack`]: `dx = unpack(dy) * scale`.
pub fn pack_backward(grad: &PackedTensor, options: &PackOptions) -> Result<Tensor> {
    let dx = unpack(grad)?;
    if options.scale == 1.0 {
        Ok(dx)
    } else {
        Ok(dx.affine(options.scale as f64, 0.0)?)
    }
}

/// Gradient of [`unpack`]: the upstream gradient packed with the input's padding.
pub fn unpack_backward(grad: &Tensor, input: &PackedTensor) -> Result<PackedTensor> {
    checks::expect_shape("unpack.grad", grad.dims(), input.dims())?;
    pack(
        grad,
        &PackOptions {
            scale: 1.0,
            pad: input.pad(),
        },
    )
}

pub(crate) fn lane_dims(dims: &[usize]) -> Vec<usize> {
    let mut lanes = dims.to_vec();
    if let Some(last) = lanes.last_mut() {
        *last /= 2;
    }
    lanes
}

fn round_up(value: usize, block: usize) -> usize {
    value.div_ceil(block) * block
}

fn padded_dims(dims: &[usize], pad: usize) -> Vec<usize> {
    let mut padded = dims.to_vec();
    if pad == 0 {
        return padded;
    }
    let rank = padded.len();
    padded[rank - 1] = round_up(padded[rank - 1], pad);
    if rank >= 2 {
        padded[rank - 2] = round_up(padded[rank - 2], pad);
    }
    padded
}

/// Views a shape as `(outer, rows, cols)` over its last two axes.
fn outer_rows_cols(dims: &[usize]) -> (usize, usize, usize) {
    let rank = dims.len();
    let cols = dims[rank - 1];
    let rows = if rank >= 2 { dims[rank - 2] } else { 1 };
    let outer = if rank > 2 {
        dims[..rank - 2].iter().product()
    } else {
        1
    };
    (outer, rows, cols)
}

fn insert_padding(values: &[f32], dims: &[usize], padded: &[usize]) -> Vec<f32> {
    let (outer, rows, cols) = outer_rows_cols(dims);
    let (_, prows, pcols) = outer_rows_cols(padded);
    let mut out = vec![0f32; outer * prows * pcols];
    for o in 0..outer {
        for r in 0..rows {
            let src = (o * rows + r) * cols;
            let dst = (o * prows + r) * pcols;
            out[dst..dst + cols].copy_from_slice(&values[src..src + cols]);
        }
    }
    out
}

fn slice_padding(values: &[f32], padded: &[usize], dims: &[usize]) -> Vec<f32> {
    let (outer, rows, cols) = outer_rows_cols(dims);
    let (_, prows, pcols) = outer_rows_cols(padded);
    let mut out = Vec::with_capacity(outer * rows * cols);
    for o in 0..outer {
        for r in 0..rows {
            let src = (o * prows + r) * pcols;
            out.extend_from_slice(&values[src..src + cols]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn round_trip_random_normal_within_half_precision() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 64), &device)?;
        let packed = pack(&x, &PackOptions::default())?;
        assert_eq!(packed.dims(), &[2, 64]);
        assert_eq!(packed.lanes().dims(), &[2, 32]);
        let restored = unpack(&packed)?;
        assert_eq!(restored.dims(), &[2, 64]);
        assert!(max_abs_diff(&x, &restored) < 2e-3);
        Ok(())
    }

    #[test]
    fn lane_layout_puts_even_element_in_low_bits() {
        let lane = encode_lane(1.0, -2.0);
        assert_eq!(lane & 0xFFFF, 0x3C00);
        assert_eq!(lane >> 16, 0xC000);
        assert_eq!(decode_lane(lane), (1.0, -2.0));
    }

    #[test]
    fn negative_infinity_survives_the_cast() {
        let (even, odd) = decode_lane(encode_lane(f32::NEG_INFINITY, 0.5));
        assert_eq!(even, f32::NEG_INFINITY);
        assert_eq!(odd, 0.5);
    }

    #[test]
    fn padding_is_recorded_and_sliced_back() -> Result<()> {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..15).map(|i| i as f32 * 0.25).collect();
        let x = Tensor::from_vec(data.clone(), (3, 5), &device)?;
        let packed = pack(&x, &PackOptions { scale: 1.0, pad: 4 })?;
        assert!(packed.is_padded());
        assert_eq!(packed.padded_dims(), &[4, 8]);
        assert_eq!(packed.lanes().dims(), &[4, 4]);

        let restored = unpack(&packed)?;
        assert_eq!(restored.dims(), &[3, 5]);
        assert_eq!(restored.flatten_all()?.to_vec1::<f32>()?, data);
        Ok(())
    }

    #[test]
    fn odd_last_dimension_without_padding_is_rejected() {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let err = pack(&x, &PackOptions::default()).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn scale_is_applied_before_the_cast() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![1.0f32, 2.0, -3.0, 0.5], (1, 4), &device)?;
        let packed = pack(&x, &PackOptions { scale: 0.5, pad: 0 })?;
        assert_eq!(packed.scale(), 0.5);
        let restored = unpack(&packed)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(restored, vec![0.5, 1.0, -1.5, 0.25]);
        Ok(())
    }

    #[test]
    fn gradients_mirror_each_other() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![0.5f32, -1.0, 2.0, 4.0, 1.0, 3.0], (2, 3), &device)?;
        let options = PackOptions { scale: 2.0, pad: 2 };
        let packed = pack(&x, &options)?;

        let dy = Tensor::from_vec(vec![1.0f32, 1.0, 1.0, 1.0, 1.0, 1.0], (2, 3), &device)?;
        let dy_packed = unpack_backward(&dy, &packed)?;
        assert_eq!(dy_packed.padded_dims(), packed.padded_dims());

        let dx = pack_backward(&dy_packed, &options)?;
        assert_eq!(dx.dims(), &[2, 3]);
        let values = dx.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (*v - 2.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn from_values_requires_matching_length() {
        let device = Device::Cpu;
        let err = PackedTensor::from_values(&[1.0, 2.0, 3.0], &[2, 2], &device).unwrap_err();
        assert!(matches!(err, KernelError::Usage(_)));
    }
}
