//! Explicit kernel dispatch table.
//!
//! Ops are identified by name and registered once per execution [`Backend`].
//! Each entry carries a forward function over named operands and named scalar
//! attributes, and optionally a gradient rule that receives the upstream
//! gradient together with the forward inputs, output and attributes. The table
//! is built at start-up and passed by reference; nothing here is global.
//!
//! The CPU entries registered by [`register_kernels`] are the reference oracle
//! any accelerated backend is checked against.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::activations::{ActivationKind, Gelu};
use crate::dropout::DropoutSpec;
use crate::matmul::{FusedMatMul, MatMulOptions};
use crate::norm::RmsNorm;
use crate::packed::{pack, pack_backward, unpack, unpack_backward, PackOptions};
use crate::softmax::Softmax;
use crate::{KernelError, Operand, Result};

/// Execution backend an entry is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => f.write_str("cpu"),
        }
    }
}

/// Scalar attribute attached to a kernel invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Shape(Vec<usize>),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl TryFrom<usize> for AttrValue {
    type Error = KernelError;

    fn try_from(v: usize) -> Result<Self> {
        i64::try_from(v)
            .map(AttrValue::Int)
            .map_err(|_| KernelError::Config(format!("attribute value {v} does not fit in i64")))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        AttrValue::Float(v as f64)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<Vec<usize>> for AttrValue {
    fn from(v: Vec<usize>) -> Self {
        AttrValue::Shape(v)
    }
}

/// Named operands passed to and returned from kernels.
pub type TensorMap = BTreeMap<String, Operand>;

/// Named scalar attributes with typed accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMap {
    values: HashMap<String, AttrValue>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<V>(mut self, key: &str, value: V) -> Result<Self>
    where
        V: TryInto<AttrValue>,
        KernelError: From<V::Error>,
    {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Fails only for integers outside the `i64` range.
    pub fn insert<V>(&mut self, key: &str, value: V) -> Result<()>
    where
        V: TryInto<AttrValue>,
        KernelError: From<V::Error>,
    {
        self.values.insert(key.to_string(), value.try_into()?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(AttrValue::Bool(v)) => Ok(*v),
            Some(other) => Err(attr_type_error(key, "bool", other)),
        }
    }

    pub fn f32_opt(&self, key: &str) -> Result<Option<f32>> {
        match self.get(key) {
            None => Ok(None),
            Some(AttrValue::Float(v)) => Ok(Some(*v as f32)),
            Some(AttrValue::Int(v)) => Ok(Some(*v as f32)),
            Some(other) => Err(attr_type_error(key, "float", other)),
        }
    }

    pub fn f32_or(&self, key: &str, default: f32) -> Result<f32> {
        Ok(self.f32_opt(key)?.unwrap_or(default))
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(AttrValue::Int(v)) if *v >= 0 => Ok(*v as usize),
            Some(other) => Err(attr_type_error(key, "non-negative int", other)),
        }
    }

    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        match self.get(key) {
            None => Ok(default),
            Some(AttrValue::Str(v)) => Ok(v.as_str()),
            Some(other) => Err(attr_type_error(key, "string", other)),
        }
    }

    pub fn shape_opt(&self, key: &str) -> Result<Option<Vec<usize>>> {
        match self.get(key) {
            None => Ok(None),
            Some(AttrValue::Shape(v)) => Ok(Some(v.clone())),
            Some(other) => Err(attr_type_error(key, "shape", other)),
        }
    }
}

fn attr_type_error(key: &str, expected: &str, got: &AttrValue) -> KernelError {
    KernelError::Config(format!("attribute `{key}` must be a {expected}, got {got:?}"))
}

/// Inputs handed to a gradient rule.
#[derive(Debug, Clone, Copy)]
pub struct GradientContext<'a> {
    pub inputs: &'a TensorMap,
    pub output: &'a Operand,
    pub attrs: &'a AttrMap,
}

pub type ForwardFn = Arc<dyn Fn(&TensorMap, &AttrMap) -> Result<Operand> + Send + Sync>;
pub type GradientFn = Arc<dyn Fn(&Operand, &GradientContext<'_>) -> Result<TensorMap> + Send + Sync>;

/// Forward implementation plus optional gradient rule.
///
/// Entries may capture state shared across calls, such as a growable table
/// cache owned by the registry.
#[derive(Clone)]
pub struct KernelEntry {
    pub forward: ForwardFn,
    pub gradient: Option<GradientFn>,
}

impl KernelEntry {
    pub fn new<F, G>(forward: F, gradient: G) -> Self
    where
        F: Fn(&TensorMap, &AttrMap) -> Result<Operand> + Send + Sync + 'static,
        G: Fn(&Operand, &GradientContext<'_>) -> Result<TensorMap> + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(forward),
            gradient: Some(Arc::new(gradient)),
        }
    }

    pub fn forward_only<F>(forward: F) -> Self
    where
        F: Fn(&TensorMap, &AttrMap) -> Result<Operand> + Send + Sync + 'static,
    {
        Self {
            forward: Arc::new(forward),
            gradient: None,
        }
    }
}

impl fmt::Debug for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelEntry")
            .field("has_gradient", &self.gradient.is_some())
            .finish()
    }
}

/// Dispatch table keyed by `(op name, backend)`.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    entries: HashMap<(String, Backend), KernelEntry>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the ops of this crate.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        register_kernels(&mut registry)?;
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, backend: Backend, entry: KernelEntry) -> Result<()> {
        let key = (name.to_string(), backend);
        if self.entries.contains_key(&key) {
            return Err(KernelError::Config(format!(
                "kernel {name} is already registered for {backend}"
            )));
        }
        log::debug!("registered kernel {name} for {backend}");
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn contains(&self, name: &str, backend: Backend) -> bool {
        self.entries.contains_key(&(name.to_string(), backend))
    }

    /// Registered op names for a backend, sorted.
    pub fn names(&self, backend: Backend) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .filter(|(_, b)| *b == backend)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn lookup(&self, name: &str, backend: Backend) -> Result<&KernelEntry> {
        self.entries
            .get(&(name.to_string(), backend))
            .ok_or_else(|| KernelError::Unsupported {
                op: "KernelRegistry.lookup",
                detail: format!("{name} on backend {backend}"),
            })
    }

    pub fn forward(&self, name: &str, backend: Backend, inputs: &TensorMap, attrs: &AttrMap) -> Result<Operand> {
        (self.lookup(name, backend)?.forward)(inputs, attrs)
    }

    pub fn gradient(
        &self,
        name: &str,
        backend: Backend,
        grad: &Operand,
        context: &GradientContext<'_>,
    ) -> Result<TensorMap> {
        let entry = self.lookup(name, backend)?;
        let rule = entry.gradient.as_ref().ok_or_else(|| KernelError::Unsupported {
            op: "KernelRegistry.gradient",
            detail: format!("{name} has no gradient rule on {backend}"),
        })?;
        rule(grad, context)
    }
}

/// Fetches a required named input.
pub fn input<'a>(inputs: &'a TensorMap, op: &str, key: &str) -> Result<&'a Operand> {
    inputs
        .get(key)
        .ok_or_else(|| KernelError::Usage(format!("{op}: missing input `{key}`")))
}

/// Builds a [`TensorMap`] from `(name, operand)` pairs.
pub fn tensor_map<I, S>(items: I) -> TensorMap
where
    I: IntoIterator<Item = (S, Operand)>,
    S: Into<String>,
{
    items.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Registers `Pack`, `Unpack`, `FusedMatMul`, `Gelu`, `Softmax` and `RmsNorm`.
pub fn register_kernels(registry: &mut KernelRegistry) -> Result<()> {
    registry.register("Pack", Backend::Cpu, KernelEntry::new(pack_forward, pack_gradient))?;
    registry.register("Unpack", Backend::Cpu, KernelEntry::new(unpack_forward, unpack_gradient))?;
    registry.register(
        "FusedMatMul",
        Backend::Cpu,
        KernelEntry::new(matmul_forward, matmul_gradient),
    )?;
    registry.register("Gelu", Backend::Cpu, KernelEntry::new(gelu_forward, gelu_gradient))?;
    registry.register(
        "Softmax",
        Backend::Cpu,
        KernelEntry::new(softmax_forward, softmax_gradient),
    )?;
    registry.register(
        "RmsNorm",
        Backend::Cpu,
        KernelEntry::new(rms_norm_forward, rms_norm_gradient),
    )?;
    Ok(())
}

fn pack_options(attrs: &AttrMap) -> Result<PackOptions> {
    Ok(PackOptions {
        scale: attrs.f32_or("scale", 1.0)?,
        pad: attrs.usize_or("pad", 0)?,
    })
}

fn expect_plain<'a>(op: &str, operand: &'a Operand) -> Result<&'a candle_core::Tensor> {
    match operand {
        Operand::Plain(t) => Ok(t),
        Operand::Packed(_) => Err(KernelError::Precision(format!("{op} expects a plain tensor"))),
    }
}

fn expect_packed<'a>(op: &str, operand: &'a Operand) -> Result<&'a crate::PackedTensor> {
    match operand {
        Operand::Packed(p) => Ok(p),
        Operand::Plain(_) => Err(KernelError::Precision(format!("{op} expects a packed tensor"))),
    }
}

fn pack_forward(inputs: &TensorMap, attrs: &AttrMap) -> Result<Operand> {
    let x = expect_plain("Pack", input(inputs, "Pack", "x")?)?;
    Ok(Operand::Packed(pack(x, &pack_options(attrs)?)?))
}

fn pack_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> Result<TensorMap> {
    let dy = expect_packed("Pack.gradient", grad)?;
    let dx = pack_backward(dy, &pack_options(ctx.attrs)?)?;
    Ok(tensor_map([("x", Operand::Plain(dx))]))
}

fn unpack_forward(inputs: &TensorMap, _attrs: &AttrMap) -> Result<Operand> {
    let x = expect_packed("Unpack", input(inputs, "Unpack", "x")?)?;
    Ok(Operand::Plain(unpack(x)?))
}

fn unpack_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> Result<TensorMap> {
    let dy = expect_plain("Unpack.gradient", grad)?;
    let x = expect_packed("Unpack.gradient", input(ctx.inputs, "Unpack", "x")?)?;
    Ok(tensor_map([("x", Operand::Packed(unpack_backward(dy, x)?))]))
}

fn matmul_op(attrs: &AttrMap) -> Result<FusedMatMul> {
    FusedMatMul::new(MatMulOptions {
        transpose_a: attrs.bool_or("transpose_a", false)?,
        transpose_b: attrs.bool_or("transpose_b", false)?,
        scale: attrs.f32_opt("scale")?,
        scale_a: attrs.f32_opt("scale_a")?,
        scale_b: attrs.f32_opt("scale_b")?,
        activation: ActivationKind::from_name(attrs.str_or("activation", "")?)?,
        force_output_shape: attrs.shape_opt("force_output_shape")?,
        perm: attrs.shape_opt("perm")?,
    })
}

fn matmul_forward(inputs: &TensorMap, attrs: &AttrMap) -> Result<Operand> {
    let op = matmul_op(attrs)?;
    let a = input(inputs, "FusedMatMul", "a")?;
    let b = input(inputs, "FusedMatMul", "b")?;
    Ok(op.forward(a, b)?.0)
}

fn matmul_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> Result<TensorMap> {
    let op = matmul_op(ctx.attrs)?;
    let a = input(ctx.inputs, "FusedMatMul", "a")?;
    let b = input(ctx.inputs, "FusedMatMul", "b")?;
    let (_, saved) = op.forward(a, b)?;
    let grads = op.backward(grad, &saved)?;
    Ok(tensor_map([("a", grads.a), ("b", grads.b)]))
}

fn gelu_forward(inputs: &TensorMap, _attrs: &AttrMap) -> Result<Operand> {
    Ok(Gelu.forward(input(inputs, "Gelu", "x")?)?.0)
}

fn gelu_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> Result<TensorMap> {
    let (_, saved) = Gelu.forward(input(ctx.inputs, "Gelu", "x")?)?;
    Ok(tensor_map([("x", Gelu.backward(grad, &saved)?)]))
}

fn softmax_op(attrs: &AttrMap) -> Result<Softmax> {
    let probability = attrs.f32_or("dropout", 0.0)?;
    let dropout = if probability > 0.0 {
        Some(DropoutSpec::new(probability, attrs.usize_or("seed", 0)? as u64)?)
    } else {
        None
    };
    Ok(Softmax::new(dropout))
}

fn softmax_forward(inputs: &TensorMap, attrs: &AttrMap) -> Result<Operand> {
    Ok(softmax_op(attrs)?.forward(input(inputs, "Softmax", "x")?)?.0)
}

fn softmax_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> Result<TensorMap> {
    let op = softmax_op(ctx.attrs)?;
    let (_, saved) = op.forward(input(ctx.inputs, "Softmax", "x")?)?;
    Ok(tensor_map([("x", op.backward(grad, &saved)?)]))
}

fn rms_norm_op(attrs: &AttrMap) -> Result<RmsNorm> {
    RmsNorm::new(attrs.f32_or("eps", crate::norm::DEFAULT_EPS)?)
}

fn rms_norm_forward(inputs: &TensorMap, attrs: &AttrMap) -> Result<Operand> {
    let x = input(inputs, "RmsNorm", "x")?;
    let gamma = input(inputs, "RmsNorm", "gamma")?.to_plain()?;
    Ok(rms_norm_op(attrs)?.forward(x, &gamma)?.0)
}

fn rms_norm_gradient(grad: &Operand, ctx: &GradientContext<'_>) -> Result<TensorMap> {
    let op = rms_norm_op(ctx.attrs)?;
    let x = input(ctx.inputs, "RmsNorm", "x")?;
    let gamma = input(ctx.inputs, "RmsNorm", "gamma")?.to_plain()?;
    let (_, saved) = op.forward(x, &gamma)?;
    let grads = op.backward(grad, &saved)?;
    Ok(tensor_map([
        ("x", grads.input),
        ("gamma", Operand::Plain(grads.gamma)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn builtin_ops_are_registered_for_cpu() -> Result<()> {
        let registry = KernelRegistry::with_builtin()?;
        assert_eq!(
            registry.names(Backend::Cpu),
            vec!["FusedMatMul", "Gelu", "Pack", "RmsNorm", "Softmax", "Unpack"]
        );
        Ok(())
    }

    #[test]
    fn duplicate_registration_is_rejected() -> Result<()> {
        let mut registry = KernelRegistry::with_builtin()?;
        let err = registry
            .register("Gelu", Backend::Cpu, KernelEntry::forward_only(gelu_forward))
            .unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
        Ok(())
    }

    #[test]
    fn pack_then_unpack_through_the_table() -> Result<()> {
        let registry = KernelRegistry::with_builtin()?;
        let x = Tensor::randn(0f32, 1f32, (2, 8), &Device::Cpu)?;
        let packed = registry.forward(
            "Pack",
            Backend::Cpu,
            &tensor_map([("x", Operand::Plain(x.clone()))]),
            &AttrMap::new(),
        )?;
        assert!(packed.is_packed());
        let plain = registry.forward("Unpack", Backend::Cpu, &tensor_map([("x", packed)]), &AttrMap::new())?;
        let diff = (plain.to_plain()? - &x)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 2e-3);
        Ok(())
    }

    #[test]
    fn matmul_attributes_are_decoded() -> Result<()> {
        let registry = KernelRegistry::with_builtin()?;
        let device = Device::Cpu;
        let a = Operand::Plain(Tensor::randn(0f32, 1f32, (3, 2), &device)?);
        let b = Operand::Plain(Tensor::randn(0f32, 1f32, (3, 4), &device)?);
        let inputs = tensor_map([("a", a), ("b", b)]);
        let attrs = AttrMap::new()
            .with("transpose_a", true)?
            .with("scale", 0.5f32)?
            .with("activation", "gelu")?;
        let out = registry.forward("FusedMatMul", Backend::Cpu, &inputs, &attrs)?;
        assert_eq!(out.dims(), &[2, 4]);

        let grad = Operand::Plain(Tensor::ones((2, 4), candle_core::DType::F32, &device)?);
        let ctx = GradientContext {
            inputs: &inputs,
            output: &out,
            attrs: &attrs,
        };
        let grads = registry.gradient("FusedMatMul", Backend::Cpu, &grad, &ctx)?;
        assert_eq!(grads["a"].dims(), &[3, 2]);
        assert_eq!(grads["b"].dims(), &[3, 4]);

        let bad = AttrMap::new().with("transpose_a", true)?.with("transpose_b", true)?;
        assert!(registry.forward("FusedMatMul", Backend::Cpu, &inputs, &bad).is_err());
        Ok(())
    }

    #[test]
    fn unknown_ops_are_unsupported() {
        let registry = KernelRegistry::new();
        let err = registry
            .forward("Nope", Backend::Cpu, &TensorMap::new(), &AttrMap::new())
            .unwrap_err();
        assert!(matches!(err, KernelError::Unsupported { .. }));
    }

    #[test]
    fn wrongly_typed_attributes_are_config_errors() -> Result<()> {
        let attrs = AttrMap::new().with("scale", "big")?;
        assert!(matches!(attrs.f32_or("scale", 1.0), Err(KernelError::Config(_))));
        Ok(())
    }

    #[test]
    fn index_attributes_round_trip_and_reject_overflow() -> Result<()> {
        let attrs = AttrMap::new().with("past_len", 7usize)?;
        assert_eq!(attrs.usize_or("past_len", 0)?, 7);
        let err = AttrMap::new().with("past_len", usize::MAX).unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
        Ok(())
    }
}
