//! Fused generic matrix multiply.
//!
//! Computes `y = scale * act(scale_a * scale_b * op(A) · op(B))` where `op`
//! optionally transposes the last two axes of an operand. Batch axes follow
//! standard batch-matmul broadcasting: an axis of size one in either operand is
//! repeated to match the other, and missing leading axes count as size one.
//!
//! Plain operands fall back to candle's `broadcast_matmul` with the scale and
//! activation applied as separate steps; this path loses no precision and is
//! the reference the gradient checks compare against. Packed operands run the
//! fused CPU kernel over decoded lanes and emit a packed result. Mixing the two
//! representations is rejected.
//!
//! `force_output_shape` and `perm` let the kernel write its result directly in
//! a reshaped and permuted layout (for example a head-split `[B, H, T, D]`
//! view). The values are exactly `permute(reshape(y))` of the unforced output.

use candle_core::Tensor;

use crate::activations::ActivationKind;
use crate::operand::{invert_perm, permute_host, strides};
use crate::{checks, KernelError, Operand, Result};

/// Options accepted by [`FusedMatMul`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatMulOptions {
    pub transpose_a: bool,
    pub transpose_b: bool,
    /// Output scale applied after the activation.
    pub scale: Option<f32>,
    /// Scale folded into `A` before the product.
    pub scale_a: Option<f32>,
    /// Scale folded into `B` before the product.
    pub scale_b: Option<f32>,
    pub activation: ActivationKind,
    /// Shape the raw `[batch.., M, N]` result is reshaped to before writing.
    pub force_output_shape: Option<Vec<usize>>,
    /// Axis permutation applied after `force_output_shape`.
    pub perm: Option<Vec<usize>>,
}

impl MatMulOptions {
    pub fn transposed(transpose_a: bool, transpose_b: bool) -> Self {
        Self {
            transpose_a,
            transpose_b,
            ..Self::default()
        }
    }

    fn operand_scale(&self) -> f32 {
        self.scale_a.unwrap_or(1.0) * self.scale_b.unwrap_or(1.0)
    }

    fn output_scale(&self) -> f32 {
        self.scale.unwrap_or(1.0)
    }
}

/// State kept from a forward pass for the gradient rule.
#[derive(Debug, Clone)]
pub struct MatMulSaved {
    a: Operand,
    b: Operand,
    /// Pre-activation product, only kept when an activation is fused.
    pre_activation: Option<Vec<f32>>,
    raw_dims: Vec<usize>,
    out_dims: Vec<usize>,
}

impl MatMulSaved {
    /// Shape of the forward output after the output view.
    pub fn output_dims(&self) -> &[usize] {
        &self.out_dims
    }
}

/// Gradients with respect to both operands, in their forward representation.
#[derive(Debug, Clone)]
pub struct MatMulGrads {
    pub a: Operand,
    pub b: Operand,
}

/// Fused matmul kernel configured once and applied to many operand pairs.
#[derive(Debug, Clone)]
pub struct FusedMatMul {
    options: MatMulOptions,
}

impl FusedMatMul {
    pub fn new(options: MatMulOptions) -> Result<Self> {
        reject_double_transpose(&options)?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &MatMulOptions {
        &self.options
    }

    pub fn forward(&self, a: &Operand, b: &Operand) -> Result<(Operand, MatMulSaved)> {
        reject_double_transpose(&self.options)?;
        checks::expect_same_representation("matmul", a, b)?;
        let geometry = Geometry::resolve(a.dims(), b.dims(), &self.options)?;
        let raw_dims = geometry.raw_dims();

        let (out, pre_activation) = match (a, b) {
            (Operand::Plain(ta), Operand::Plain(tb)) => self.forward_plain(ta, tb)?,
            _ => self.forward_packed(a, b, &geometry)?,
        };
        let out_dims = out.dims().to_vec();
        let saved = MatMulSaved {
            a: a.clone(),
            b: b.clone(),
            pre_activation,
            raw_dims,
            out_dims,
        };
        Ok((out, saved))
    }

    /// Unfused reference path: separate product, scale and activation steps.
    fn forward_plain(&self, a: &Tensor, b: &Tensor) -> Result<(Operand, Option<Vec<f32>>)> {
        let opts = &self.options;
        let a = if opts.transpose_a { a.t()? } else { a.clone() }.contiguous()?;
        let b = if opts.transpose_b { b.t()? } else { b.clone() }.contiguous()?;
        let mut z = a.broadcast_matmul(&b)?;
        let operand_scale = opts.operand_scale();
        if operand_scale != 1.0 {
            z = z.affine(operand_scale as f64, 0.0)?;
        }
        let (mut y, pre_activation) = match opts.activation {
            ActivationKind::Identity => (z, None),
            ActivationKind::Gelu => {
                let pre = z.flatten_all()?.to_vec1::<f32>()?;
                (z.gelu()?, Some(pre))
            }
        };
        let output_scale = opts.output_scale();
        if output_scale != 1.0 {
            y = y.affine(output_scale as f64, 0.0)?;
        }

        let mut out = Operand::Plain(y);
        if let Some(shape) = &opts.force_output_shape {
            out = out.reshape(shape)?;
        }
        if let Some(perm) = &opts.perm {
            out = out.permute(perm)?;
        }
        Ok((out, pre_activation))
    }

    /// Fused reference kernel over decoded lanes.
    fn forward_packed(
        &self,
        a: &Operand,
        b: &Operand,
        geometry: &Geometry,
    ) -> Result<(Operand, Option<Vec<f32>>)> {
        let opts = &self.options;
        let a_values = a.materialize()?;
        let b_values = b.materialize()?;
        let mut z = geometry.gemm(&a_values, &b_values, opts);
        let operand_scale = opts.operand_scale();
        if operand_scale != 1.0 {
            z.iter_mut().for_each(|v| *v *= operand_scale);
        }
        let output_scale = opts.output_scale();
        let activation = opts.activation;
        let y: Vec<f32> = z
            .iter()
            .map(|v| activation.apply(*v) * output_scale)
            .collect();
        let pre_activation = match activation {
            ActivationKind::Identity => None,
            ActivationKind::Gelu => Some(z),
        };

        let (values, dims) = apply_view(y, geometry.raw_dims(), opts)?;
        let out = a.like(values, &dims)?;
        Ok((out, pre_activation))
    }

    pub fn backward(&self, grad: &Operand, saved: &MatMulSaved) -> Result<MatMulGrads> {
        let opts = &self.options;
        if opts.transpose_a && opts.transpose_b {
            return Err(KernelError::Unsupported {
                op: "FusedMatMul.backward",
                detail: "transposing both operands".into(),
            });
        }
        checks::expect_same_representation("matmul.backward", grad, &saved.a)?;
        checks::expect_shape("matmul.backward", grad.dims(), &saved.out_dims)?;

        let mut dz = undo_view(grad.materialize()?, &saved.out_dims, opts)?;
        let output_scale = opts.output_scale();
        let operand_scale = opts.operand_scale();
        match &saved.pre_activation {
            Some(pre) => {
                for (g, z) in dz.iter_mut().zip(pre) {
                    *g *= output_scale * opts.activation.derivative(*z) * operand_scale;
                }
            }
            None => {
                let factor = output_scale * operand_scale;
                if factor != 1.0 {
                    dz.iter_mut().for_each(|g| *g *= factor);
                }
            }
        }

        let geometry = Geometry::resolve(saved.a.dims(), saved.b.dims(), opts)?;
        debug_assert_eq!(geometry.raw_dims(), saved.raw_dims);
        let a_values = saved.a.materialize()?;
        let b_values = saved.b.materialize()?;
        let (da, db) = geometry.adjoint(&a_values, &b_values, &dz, opts);
        Ok(MatMulGrads {
            a: saved.a.like(da, saved.a.dims())?,
            b: saved.b.like(db, saved.b.dims())?,
        })
    }
}

/// One-shot convenience wrapper around [`FusedMatMul::forward`].
pub fn matmul(a: &Operand, b: &Operand, options: &MatMulOptions) -> Result<Operand> {
    let op = FusedMatMul::new(options.clone())?;
    Ok(op.forward(a, b)?.0)
}

fn reject_double_transpose(options: &MatMulOptions) -> Result<()> {
    if options.transpose_a && options.transpose_b {
        Err(KernelError::Unsupported {
            op: "FusedMatMul",
            detail: "transposing both operands".into(),
        })
    } else {
        Ok(())
    }
}

fn apply_view(values: Vec<f32>, raw_dims: Vec<usize>, opts: &MatMulOptions) -> Result<(Vec<f32>, Vec<usize>)> {
    let mut dims = raw_dims;
    if let Some(shape) = &opts.force_output_shape {
        if checks::elem_count(shape) != checks::elem_count(&dims) {
            return Err(KernelError::Config(format!(
                "forced output shape {:?} does not hold a {:?} result",
                shape, dims
            )));
        }
        dims = shape.clone();
    }
    match &opts.perm {
        Some(perm) => permute_host(&values, &dims, perm),
        None => Ok((values, dims)),
    }
}

/// Maps an output-view gradient back onto the raw `[batch.., M, N]` layout.
fn undo_view(values: Vec<f32>, out_dims: &[usize], opts: &MatMulOptions) -> Result<Vec<f32>> {
    match &opts.perm {
        Some(perm) => Ok(permute_host(&values, out_dims, &invert_perm(perm))?.0),
        None => Ok(values),
    }
}

/// Resolved problem size and broadcast batch mapping.
#[derive(Debug, Clone)]
struct Geometry {
    m: usize,
    k: usize,
    n: usize,
    out_batch: Vec<usize>,
    a_offsets: Vec<usize>,
    b_offsets: Vec<usize>,
    a_batches: usize,
    b_batches: usize,
}

impl Geometry {
    fn resolve(a: &[usize], b: &[usize], opts: &MatMulOptions) -> Result<Self> {
        checks::expect_min_rank("matmul.a", a, 2)?;
        checks::expect_min_rank("matmul.b", b, 2)?;
        let (ar, ac) = (a[a.len() - 2], a[a.len() - 1]);
        let (br, bc) = (b[b.len() - 2], b[b.len() - 1]);
        let (m, k) = if opts.transpose_a { (ac, ar) } else { (ar, ac) };
        let (kb, n) = if opts.transpose_b { (bc, br) } else { (br, bc) };
        if k != kb {
            return Err(KernelError::Usage(format!(
                "matmul inner dimensions differ: {:?} x {:?} (transpose_a={}, transpose_b={})",
                a, b, opts.transpose_a, opts.transpose_b
            )));
        }

        let a_batch = &a[..a.len() - 2];
        let b_batch = &b[..b.len() - 2];
        let rank = a_batch.len().max(b_batch.len());
        let pa = left_pad(a_batch, rank);
        let pb = left_pad(b_batch, rank);
        let mut out_batch = Vec::with_capacity(rank);
        for (&x, &y) in pa.iter().zip(&pb) {
            let dim = if x == y || y == 1 {
                x
            } else if x == 1 {
                y
            } else {
                return Err(KernelError::Usage(format!(
                    "matmul batch dimensions {:?} and {:?} do not broadcast",
                    a_batch, b_batch
                )));
            };
            out_batch.push(dim);
        }

        Ok(Self {
            m,
            k,
            n,
            a_offsets: batch_offsets(&out_batch, &pa),
            b_offsets: batch_offsets(&out_batch, &pb),
            a_batches: checks::elem_count(&pa),
            b_batches: checks::elem_count(&pb),
            out_batch,
        })
    }

    fn raw_dims(&self) -> Vec<usize> {
        let mut dims = self.out_batch.clone();
        dims.push(self.m);
        dims.push(self.n);
        dims
    }

    #[inline]
    fn a_at(&self, a: &[f32], base: usize, i: usize, p: usize, transposed: bool) -> f32 {
        if transposed {
            a[base + p * self.m + i]
        } else {
            a[base + i * self.k + p]
        }
    }

    #[inline]
    fn b_at(&self, b: &[f32], base: usize, p: usize, j: usize, transposed: bool) -> f32 {
        if transposed {
            b[base + j * self.k + p]
        } else {
            b[base + p * self.n + j]
        }
    }

    fn gemm(&self, a: &[f32], b: &[f32], opts: &MatMulOptions) -> Vec<f32> {
        let (m, k, n) = (self.m, self.k, self.n);
        let mut out = vec![0f32; self.a_offsets.len() * m * n];
        for (batch, (&ai, &bi)) in self.a_offsets.iter().zip(&self.b_offsets).enumerate() {
            let a_base = ai * m * k;
            let b_base = bi * k * n;
            let o_base = batch * m * n;
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0f32;
                    for p in 0..k {
                        acc += self.a_at(a, a_base, i, p, opts.transpose_a)
                            * self.b_at(b, b_base, p, j, opts.transpose_b);
                    }
                    out[o_base + i * n + j] = acc;
                }
            }
        }
        out
    }

    /// Adjoint of [`Geometry::gemm`], accumulated over broadcast batches.
    ///
    /// `dA_op = dZ · op(B)^T` and `dB_op = op(A)^T · dZ`, written back in each
    /// operand's stored orientation.
    fn adjoint(&self, a: &[f32], b: &[f32], dz: &[f32], opts: &MatMulOptions) -> (Vec<f32>, Vec<f32>) {
        let (m, k, n) = (self.m, self.k, self.n);
        let mut da = vec![0f32; self.a_batches * m * k];
        let mut db = vec![0f32; self.b_batches * k * n];
        for (batch, (&ai, &bi)) in self.a_offsets.iter().zip(&self.b_offsets).enumerate() {
            let a_base = ai * m * k;
            let b_base = bi * k * n;
            let g_base = batch * m * n;
            for i in 0..m {
                for p in 0..k {
                    let mut acc = 0f32;
                    for j in 0..n {
                        acc += dz[g_base + i * n + j] * self.b_at(b, b_base, p, j, opts.transpose_b);
                    }
                    let index = if opts.transpose_a { p * m + i } else { i * k + p };
                    da[a_base + index] += acc;
                }
            }
            for p in 0..k {
                for j in 0..n {
                    let mut acc = 0f32;
                    for i in 0..m {
                        acc += self.a_at(a, a_base, i, p, opts.transpose_a) * dz[g_base + i * n + j];
                    }
                    let index = if opts.transpose_b { j * k + p } else { p * n + j };
                    db[b_base + index] += acc;
                }
            }
        }
        (da, db)
    }
}

fn left_pad(dims: &[usize], rank: usize) -> Vec<usize> {
    let mut padded = vec![1usize; rank - dims.len()];
    padded.extend_from_slice(dims);
    padded
}

/// Matrix index inside an operand for every output batch entry.
fn batch_offsets(out_batch: &[usize], operand: &[usize]) -> Vec<usize> {
    let operand_strides = strides(operand);
    let total = checks::elem_count(out_batch);
    let mut offsets = Vec::with_capacity(total);
    let mut index = vec![0usize; out_batch.len()];
    for _ in 0..total {
        let offset = index
            .iter()
            .enumerate()
            .map(|(axis, &i)| if operand[axis] == 1 { 0 } else { i * operand_strides[axis] })
            .sum();
        offsets.push(offset);
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < out_batch[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn seq(n: usize, step: f32, offset: f32) -> Vec<f32> {
        (0..n).map(|i| i as f32 * step - offset).collect()
    }

    fn max_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).fold(0f32, |acc, (x, y)| acc.max((x - y).abs()))
    }

    #[test]
    fn both_transposed_fails_fast() {
        let err = FusedMatMul::new(MatMulOptions::transposed(true, true)).unwrap_err();
        assert!(matches!(err, KernelError::Unsupported { .. }));
        let device = Device::Cpu;
        let a = Operand::from_host(seq(4, 0.1, 0.0), &[2, 2], false, &device).unwrap();
        assert!(matmul(&a, &a, &MatMulOptions::transposed(true, true)).is_err());
    }

    #[test]
    fn mixed_precision_operands_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let a = Operand::from_host(seq(6, 0.1, 0.2), &[3, 2], false, &device)?;
        let b = Operand::from_host(seq(4, 0.1, 0.2), &[2, 2], true, &device)?;
        let err = matmul(&a, &b, &MatMulOptions::default()).unwrap_err();
        assert!(matches!(err, KernelError::Precision(_)));
        Ok(())
    }

    #[test]
    fn transpose_combinations_match_manual_product() -> Result<()> {
        let device = Device::Cpu;
        // A = [[1, 2, 3], [4, 5, 6]], B = [[1, 0], [0, 1], [1, 1]].
        let a = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0];
        let expected = vec![4.0f32, 5.0, 10.0, 11.0];
        let a_t = vec![1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0];
        let b_t = vec![1.0f32, 0.0, 1.0, 0.0, 1.0, 1.0];
        // C = [[1, 2, 3, 4], [5, 6, 7, 8]], D = [[1, 0], [0, 1], [1, 0], [0, 1]].
        let c = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let d = vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        let d_t = vec![1.0f32, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0];
        let expected_cd = vec![4.0f32, 6.0, 12.0, 14.0];

        let cases = [
            (a.clone(), vec![2usize, 3], b.clone(), vec![3usize, 2], false, false, expected.clone()),
            (a_t, vec![3, 2], b.clone(), vec![3, 2], true, false, expected.clone()),
            (a, vec![2, 3], b_t, vec![2, 3], false, true, expected),
            (c.clone(), vec![2, 4], d, vec![4, 2], false, false, expected_cd.clone()),
            (c, vec![2, 4], d_t, vec![2, 4], false, true, expected_cd),
        ];
        for (av, ad, bv, bd, ta, tb, want) in cases {
            // Packed operands need an even last dimension.
            let packable = ad[1] % 2 == 0 && bd[1] % 2 == 0;
            for packed in [false, true] {
                if packed && !packable {
                    continue;
                }
                let lhs = Operand::from_host(av.clone(), &ad, packed, &device)?;
                let rhs = Operand::from_host(bv.clone(), &bd, packed, &device)?;
                let out = matmul(&lhs, &rhs, &MatMulOptions::transposed(ta, tb))?;
                assert_eq!(out.dims(), &[2, 2]);
                assert_eq!(out.is_packed(), packed);
                assert!(max_diff(&out.materialize()?, &want) < 1e-2, "ta={ta} tb={tb} packed={packed}");
            }
        }
        Ok(())
    }

    #[test]
    fn packed_operands_with_odd_last_dimension_are_rejected() {
        let device = Device::Cpu;
        let err = Operand::from_host(seq(6, 0.1, 0.0), &[2, 3], true, &device).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn fused_scale_and_gelu_match_unfused_steps() -> Result<()> {
        let device = Device::Cpu;
        let a = Operand::from_host(seq(2 * 3 * 4, 0.05, 0.5), &[2, 3, 4], false, &device)?;
        let b = Operand::from_host(seq(4 * 6, 0.04, 0.4), &[4, 6], false, &device)?;
        let options = MatMulOptions {
            scale: Some(0.5),
            scale_a: Some(2.0),
            activation: ActivationKind::Gelu,
            ..MatMulOptions::default()
        };
        let plain = matmul(&a, &b, &options)?;
        let packed = matmul(
            &a.to_representation(true)?,
            &b.to_representation(true)?,
            &options,
        )?;
        assert_eq!(plain.dims(), &[2, 3, 6]);
        assert!(packed.is_packed());
        assert!(max_diff(&plain.materialize()?, &packed.materialize()?) < 1e-2);
        Ok(())
    }

    #[test]
    fn forced_view_equals_reshape_then_permute() -> Result<()> {
        let device = Device::Cpu;
        let x = Operand::from_host(seq(2 * 3 * 4, 0.1, 1.0), &[2, 3, 4], false, &device)?;
        let w = Operand::from_host(seq(4 * 8, 0.05, 0.7), &[4, 8], false, &device)?;
        let unforced = matmul(&x, &w, &MatMulOptions::default())?;
        let expected = unforced.reshape(&[2, 3, 2, 4])?.permute(&[0, 2, 1, 3])?;

        let options = MatMulOptions {
            force_output_shape: Some(vec![2, 3, 2, 4]),
            perm: Some(vec![0, 2, 1, 3]),
            ..MatMulOptions::default()
        };
        for packed in [false, true] {
            let out = matmul(
                &x.to_representation(packed)?,
                &w.to_representation(packed)?,
                &options,
            )?;
            assert_eq!(out.dims(), &[2, 2, 3, 4]);
            assert!(max_diff(&out.materialize()?, &expected.materialize()?) < 2e-2);
        }
        Ok(())
    }

    #[test]
    fn batch_broadcast_gradient_sums_over_repeated_axis() -> Result<()> {
        let device = Device::Cpu;
        let a = Operand::from_host(seq(2 * 2 * 3, 0.1, 0.3), &[2, 2, 3], false, &device)?;
        let b = Operand::from_host(seq(3 * 2, 0.2, 0.1), &[1, 3, 2], false, &device)?;
        let op = FusedMatMul::new(MatMulOptions::default())?;
        let (y, saved) = op.forward(&a, &b)?;
        assert_eq!(y.dims(), &[2, 2, 2]);
        let ones = Operand::from_host(vec![1.0; 8], &[2, 2, 2], false, &device)?;
        let grads = op.backward(&ones, &saved)?;
        assert_eq!(grads.a.dims(), &[2, 2, 3]);
        assert_eq!(grads.b.dims(), &[1, 3, 2]);

        // dB[p, j] = sum over batches and rows of A[.., i, p].
        let a_values = a.materialize()?;
        let db = grads.b.materialize()?;
        for p in 0..3 {
            let column: f32 = (0..4).map(|row| a_values[row * 3 + p]).sum();
            assert!((db[p * 2] - column).abs() < 1e-5);
            assert!((db[p * 2 + 1] - column).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn mismatched_inner_dimension_is_a_usage_error() -> Result<()> {
        let device = Device::Cpu;
        let a = Operand::from_host(seq(6, 0.1, 0.0), &[2, 3], false, &device)?;
        let b = Operand::from_host(seq(4, 0.1, 0.0), &[2, 2], false, &device)?;
        assert!(matches!(
            matmul(&a, &b, &MatMulOptions::default()).unwrap_err(),
            KernelError::Usage(_)
        ));
        Ok(())
    }
}
