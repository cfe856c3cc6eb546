//! Rotary positional embeddings with a shared, growable angle cache.
//!
//! Channels are rotated in adjacent `(even, odd)` pairs. For pair `i` at
//! absolute position `p` the angle is `p * theta^(-2i / rotate_dim)`; channels
//! past `rotate_dim` pass through untouched. The inverse rotation (used as the
//! gradient) is the same map with the sine negated, so [`RopeTables`] keep a
//! `-sin` table next to `cos` and `sin`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use candle_core::{Device, Tensor};
use kernels::registry::{
    input, tensor_map, AttrMap, Backend, GradientContext, KernelEntry, KernelRegistry, TensorMap,
};
use kernels::{checks, KernelError, Operand, Result};

pub const DEFAULT_THETA: f32 = 10_000.0;
pub const DEFAULT_GROWTH_CHUNK: usize = 256;

/// Configuration for building rotary positional embeddings.
///
/// Environment overrides (`ROPE_THETA`, `ROPE_ROTATE_DIM`) are layered by the
/// attention config before this struct is built.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// How many leading dimensions to rotate; `None` rotates the full `head_dim`.
    pub rotate_dim: Option<usize>,
    /// Positions added to the tables whenever they have to grow.
    pub growth_chunk: usize,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: DEFAULT_THETA,
            rotate_dim: None,
            growth_chunk: DEFAULT_GROWTH_CHUNK,
        }
    }
}

impl RopeConfig {
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            ..Self::default()
        }
    }

    pub fn rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            return Err(KernelError::Config("rope head_dim must be non-zero".into()));
        }
        let rotate_dim = self.rotate_dim();
        if rotate_dim == 0 || rotate_dim > self.head_dim {
            return Err(KernelError::Config(format!(
                "invalid rotate_dim {} for head_dim {}",
                rotate_dim, self.head_dim
            )));
        }
        if rotate_dim % 2 != 0 {
            return Err(KernelError::Config(format!(
                "rotate_dim must be even to pair dimensions, got {rotate_dim}"
            )));
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            return Err(KernelError::Config(format!(
                "rope_theta must be positive, got {}",
                self.rope_theta
            )));
        }
        if self.growth_chunk == 0 {
            return Err(KernelError::Config("rope growth_chunk must be non-zero".into()));
        }
        Ok(())
    }

    /// `theta^(-2i / rotate_dim)` for every rotated pair.
    pub fn inv_freqs(&self) -> Vec<f64> {
        let rotate_dim = self.rotate_dim();
        let base = self.rope_theta as f64;
        (0..rotate_dim / 2)
            .map(|idx| base.powf(-((2 * idx) as f64 / rotate_dim as f64)))
            .collect()
    }
}

/// Immutable snapshot of the angle tables, each shaped `[len, rotate_dim / 2]`.
#[derive(Debug, Clone)]
pub struct RopeTables {
    len: usize,
    half_dim: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
    neg_sin: Vec<f32>,
    device: Device,
}

impl RopeTables {
    fn build(len: usize, config: &RopeConfig, device: &Device) -> Self {
        let inv_freqs = config.inv_freqs();
        let half_dim = inv_freqs.len();
        let mut cos = Vec::with_capacity(len * half_dim);
        let mut sin = Vec::with_capacity(len * half_dim);
        for pos in 0..len {
            let pos_f = pos as f64;
            for &inv_freq in &inv_freqs {
                let angle = pos_f * inv_freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
        let neg_sin = sin.iter().map(|v| -v).collect();
        Self {
            len,
            half_dim,
            cos,
            sin,
            neg_sin,
            device: device.clone(),
        }
    }

    /// Number of positions covered.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn half_dim(&self) -> usize {
        self.half_dim
    }

    fn rows<'a>(&'a self, table: &'a [f32], start: usize, count: usize) -> &'a [f32] {
        &table[start * self.half_dim..(start + count) * self.half_dim]
    }

    /// `[count, half_dim]` slice of a table as a tensor.
    fn slice_tensor(&self, table: &[f32], start: usize, count: usize) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            self.rows(table, start, count),
            (count, self.half_dim),
            &self.device,
        )?)
    }

    pub fn cos(&self, start: usize, count: usize) -> Result<Tensor> {
        self.slice_tensor(&self.cos, start, count)
    }

    pub fn sin(&self, start: usize, count: usize) -> Result<Tensor> {
        self.slice_tensor(&self.sin, start, count)
    }

    pub fn neg_sin(&self, start: usize, count: usize) -> Result<Tensor> {
        self.slice_tensor(&self.neg_sin, start, count)
    }
}

/// Angle tables shared read-only across layers and decoding steps.
///
/// Tables only ever grow, in multiples of [`RopeConfig::growth_chunk`].
/// Readers receive an `Arc` snapshot, so growth never invalidates a slice
/// another layer is still using.
#[derive(Debug)]
pub struct RopeCache {
    config: RopeConfig,
    device: Device,
    tables: RwLock<Arc<RopeTables>>,
    growths: AtomicUsize,
}

impl RopeCache {
    pub fn new(config: RopeConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let tables = RopeTables::build(0, &config, device);
        Ok(Self {
            config,
            device: device.clone(),
            tables: RwLock::new(Arc::new(tables)),
            growths: AtomicUsize::new(0),
        })
    }

    /// Builds a cache already covering `positions`.
    pub fn with_capacity(config: RopeConfig, device: &Device, positions: usize) -> Result<Self> {
        let cache = Self::new(config, device)?;
        cache.ensure(positions)?;
        Ok(cache)
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Positions currently covered.
    pub fn capacity(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    /// How many times the tables have been rebuilt larger.
    pub fn growth_count(&self) -> usize {
        self.growths.load(Ordering::Relaxed)
    }

    fn snapshot(&self) -> Result<Arc<RopeTables>> {
        let guard = self
            .tables
            .read()
            .map_err(|_| KernelError::Usage("rope cache lock poisoned".into()))?;
        Ok(Arc::clone(&guard))
    }

    /// Returns tables covering at least `positions` entries, growing if needed.
    pub fn ensure(&self, positions: usize) -> Result<Arc<RopeTables>> {
        let current = self.snapshot()?;
        if current.len() >= positions {
            return Ok(current);
        }
        let mut guard = self
            .tables
            .write()
            .map_err(|_| KernelError::Usage("rope cache lock poisoned".into()))?;
        if guard.len() >= positions {
            return Ok(Arc::clone(&guard));
        }
        let chunk = self.config.growth_chunk;
        let len = positions.div_ceil(chunk) * chunk;
        log::debug!(
            "growing rope tables from {} to {} positions (rotate_dim={})",
            guard.len(),
            len,
            self.config.rotate_dim()
        );
        let tables = Arc::new(RopeTables::build(len, &self.config, &self.device));
        *guard = Arc::clone(&tables);
        self.growths.fetch_add(1, Ordering::Relaxed);
        Ok(tables)
    }
}

/// Rotates the leading `rotate_dim` channels of `x` (`[batch, heads, seq, head_dim]`).
///
/// Query index `t` sits at absolute position `past_len + t`. With `inverse` the
/// sine is negated, which undoes a forward rotation at the same positions.
pub fn rotate(x: &Operand, tables: &RopeTables, past_len: usize, rotate_dim: usize, inverse: bool) -> Result<Operand> {
    checks::expect_rank("rope", x.dims(), 4)?;
    let (seq_len, head_dim) = (x.dims()[2], x.dims()[3]);
    if rotate_dim > head_dim || rotate_dim % 2 != 0 || rotate_dim / 2 != tables.half_dim() {
        return Err(KernelError::Config(format!(
            "rotate_dim {rotate_dim} does not fit head_dim {head_dim} and tables of width {}",
            tables.half_dim()
        )));
    }
    if tables.len() < past_len + seq_len {
        return Err(KernelError::Usage(format!(
            "rope tables cover {} positions, need {}",
            tables.len(),
            past_len + seq_len
        )));
    }
    match x {
        Operand::Plain(t) => Ok(Operand::Plain(rotate_plain(t, tables, past_len, rotate_dim, inverse)?)),
        Operand::Packed(_) => rotate_host(x, tables, past_len, rotate_dim, inverse),
    }
}

fn rotate_plain(x: &Tensor, tables: &RopeTables, past_len: usize, rotate_dim: usize, inverse: bool) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = x.dims4()?;
    let half_dim = rotate_dim / 2;
    let cos = tables.cos(past_len, seq_len)?;
    let sin = if inverse {
        tables.neg_sin(past_len, seq_len)?
    } else {
        tables.sin(past_len, seq_len)?
    };
    let cos_b = cos
        .reshape((1, 1, seq_len, half_dim))?
        .broadcast_as((batch, heads, seq_len, half_dim))?;
    let sin_b = sin
        .reshape((1, 1, seq_len, half_dim))?
        .broadcast_as((batch, heads, seq_len, half_dim))?;

    let main = x.narrow(3, 0, rotate_dim)?.contiguous()?;
    let pairs = main.reshape((batch, heads, seq_len, half_dim, 2))?;
    let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
    let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

    let rotated_even = (even.mul(&cos_b)? - odd.mul(&sin_b)?)?;
    let rotated_odd = (even.mul(&sin_b)? + odd.mul(&cos_b)?)?;
    let rotated = Tensor::cat(&[&rotated_even.unsqueeze(4)?, &rotated_odd.unsqueeze(4)?], 4)?
        .reshape((batch, heads, seq_len, rotate_dim))?;

    let tail_dim = head_dim - rotate_dim;
    if tail_dim == 0 {
        Ok(rotated)
    } else {
        let tail = x.narrow(3, rotate_dim, tail_dim)?.contiguous()?;
        Ok(Tensor::cat(&[&rotated, &tail], 3)?)
    }
}

/// Lane-level rotation for packed operands; pairs never straddle a lane.
fn rotate_host(x: &Operand, tables: &RopeTables, past_len: usize, rotate_dim: usize, inverse: bool) -> Result<Operand> {
    let dims = x.dims().to_vec();
    let (seq_len, head_dim) = (dims[2], dims[3]);
    let half_dim = rotate_dim / 2;
    let sin_table = if inverse { &tables.neg_sin } else { &tables.sin };
    let mut values = x.materialize()?;
    for (row_index, row) in values.chunks_mut(head_dim).enumerate() {
        let pos = past_len + row_index % seq_len;
        let cos = tables.rows(&tables.cos, pos, 1);
        let sin = tables.rows(sin_table, pos, 1);
        for i in 0..half_dim {
            let (even, odd) = (row[2 * i], row[2 * i + 1]);
            row[2 * i] = even * cos[i] - odd * sin[i];
            row[2 * i + 1] = even * sin[i] + odd * cos[i];
        }
    }
    x.like(values, &dims)
}

/// Forward state of a [`RotaryEmbedding`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RopeSaved {
    pub past_len: usize,
    pub seq_len: usize,
}

/// Rotation operator bound to a shared [`RopeCache`].
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cache: Arc<RopeCache>,
}

impl RotaryEmbedding {
    pub fn new(config: RopeConfig, device: &Device) -> Result<Self> {
        Ok(Self {
            cache: Arc::new(RopeCache::new(config, device)?),
        })
    }

    /// Shares an existing cache, typically one per model across all layers.
    pub fn with_cache(cache: Arc<RopeCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<RopeCache> {
        &self.cache
    }

    pub fn config(&self) -> &RopeConfig {
        self.cache.config()
    }

    pub fn forward(&self, x: &Operand, past_len: usize) -> Result<(Operand, RopeSaved)> {
        checks::expect_rank("rope", x.dims(), 4)?;
        checks::expect_shape("rope.head_dim", &x.dims()[3..], &[self.config().head_dim])?;
        let seq_len = x.dims()[2];
        let tables = self.cache.ensure(past_len + seq_len)?;
        let out = rotate(x, &tables, past_len, self.config().rotate_dim(), false)?;
        Ok((out, RopeSaved { past_len, seq_len }))
    }

    /// Inverse rotation of the upstream gradient at the forward positions.
    pub fn backward(&self, grad: &Operand, saved: &RopeSaved) -> Result<Operand> {
        checks::expect_rank("rope.backward", grad.dims(), 4)?;
        if grad.dims()[2] != saved.seq_len {
            return Err(KernelError::Usage(format!(
                "rope.backward: gradient covers {} positions, forward covered {}",
                grad.dims()[2],
                saved.seq_len
            )));
        }
        let tables = self.cache.ensure(saved.past_len + saved.seq_len)?;
        rotate(grad, &tables, saved.past_len, self.config().rotate_dim(), true)
    }
}

/// Rope caches shared by every call of a registered `Rope` op.
///
/// One cache is kept per distinct [`RopeConfig`] and device; each grows on
/// demand and is never rebuilt smaller.
#[derive(Debug, Default)]
pub struct RopeCachePool {
    caches: Mutex<Vec<Arc<RopeCache>>>,
}

impl RopeCachePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache for `config` on `device`, created on first use.
    pub fn get(&self, config: &RopeConfig, device: &Device) -> Result<Arc<RopeCache>> {
        let mut caches = self
            .caches
            .lock()
            .map_err(|_| KernelError::Usage("rope cache pool lock poisoned".into()))?;
        if let Some(cache) = caches
            .iter()
            .find(|c| c.config() == config && c.device().same_device(device))
        {
            return Ok(Arc::clone(cache));
        }
        let cache = Arc::new(RopeCache::new(config.clone(), device)?);
        caches.push(Arc::clone(&cache));
        Ok(cache)
    }

    /// Distinct caches created so far.
    pub fn len(&self) -> usize {
        self.caches.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers the `Rope` op backed by a fresh [`RopeCachePool`]. Attributes:
/// `past_len`, `rotate_dim` (`0` = full head), `theta`.
pub fn register_kernels(registry: &mut KernelRegistry) -> Result<()> {
    register_kernels_with(registry, Arc::new(RopeCachePool::new()))
}

/// Registers the `Rope` op reading its tables from `pool`.
pub fn register_kernels_with(registry: &mut KernelRegistry, pool: Arc<RopeCachePool>) -> Result<()> {
    let forward_pool = Arc::clone(&pool);
    registry.register(
        "Rope",
        Backend::Cpu,
        KernelEntry::new(
            move |inputs: &TensorMap, attrs: &AttrMap| {
                rope_call(&forward_pool, input(inputs, "Rope", "x")?, attrs, false)
            },
            move |grad: &Operand, ctx: &GradientContext<'_>| {
                Ok(tensor_map([("x", rope_call(&pool, grad, ctx.attrs, true)?)]))
            },
        ),
    )
}

fn rope_call(pool: &RopeCachePool, x: &Operand, attrs: &AttrMap, inverse: bool) -> Result<Operand> {
    checks::expect_rank("Rope", x.dims(), 4)?;
    let head_dim = x.dims()[3];
    let rotate_dim = match attrs.usize_or("rotate_dim", 0)? {
        0 => None,
        d => Some(d),
    };
    let config = RopeConfig {
        head_dim,
        rope_theta: attrs.f32_or("theta", DEFAULT_THETA)?,
        rotate_dim,
        ..RopeConfig::default()
    };
    let past_len = attrs.usize_or("past_len", 0)?;
    let cache = pool.get(&config, x.device())?;
    let tables = cache.ensure(past_len + x.dims()[2])?;
    rotate(x, &tables, past_len, cache.config().rotate_dim(), inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(dims: &[usize], phase: f32) -> Vec<f32> {
        let n: usize = dims.iter().product();
        (0..n).map(|i| ((i as f32) * 0.37 + phase).sin()).collect()
    }

    fn scalar_reference(values: &[f32], dims: &[usize], past_len: usize, config: &RopeConfig) -> Vec<f32> {
        let (seq_len, head_dim) = (dims[2], dims[3]);
        let inv = config.inv_freqs();
        let mut out = values.to_vec();
        for (r, row) in out.chunks_mut(head_dim).enumerate() {
            let pos = (past_len + r % seq_len) as f64;
            for (i, f) in inv.iter().enumerate() {
                let (s, c) = ((pos * f).sin() as f32, (pos * f).cos() as f32);
                let (e, o) = (row[2 * i], row[2 * i + 1]);
                row[2 * i] = e * c - o * s;
                row[2 * i + 1] = e * s + o * c;
            }
        }
        out
    }

    #[test]
    fn odd_rotate_dim_is_a_config_error() {
        let config = RopeConfig {
            rotate_dim: Some(5),
            ..RopeConfig::new(8)
        };
        assert!(matches!(
            RotaryEmbedding::new(config, &Device::Cpu),
            Err(KernelError::Config(_))
        ));
    }

    #[test]
    fn vectorised_rotation_matches_scalar_loop() -> Result<()> {
        let dims = [2usize, 2, 5, 8];
        let values = sample(&dims, 0.3);
        let config = RopeConfig::new(8);
        let rope = RotaryEmbedding::new(config.clone(), &Device::Cpu)?;
        let x = Operand::from_host(values.clone(), &dims, false, &Device::Cpu)?;
        let (out, _) = rope.forward(&x, 3)?;
        let expected = scalar_reference(&values, &dims, 3, &config);
        for (a, b) in out.materialize()?.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn tail_dimensions_pass_through_bitwise() -> Result<()> {
        let dims = [1usize, 1, 4, 16];
        let values = sample(&dims, 1.1);
        let config = RopeConfig {
            rotate_dim: Some(8),
            ..RopeConfig::new(16)
        };
        let rope = RotaryEmbedding::new(config, &Device::Cpu)?;
        let x = Operand::from_host(values.clone(), &dims, false, &Device::Cpu)?;
        let out = rope.forward(&x, 0)?.0.materialize()?;
        for (row_out, row_in) in out.chunks(16).zip(values.chunks(16)) {
            assert_eq!(&row_out[8..], &row_in[8..]);
        }
        Ok(())
    }

    #[test]
    fn inverse_rotation_recovers_the_upstream_gradient() -> Result<()> {
        let dims = [1usize, 2, 6, 8];
        let grad = sample(&dims, 2.0);
        let rope = RotaryEmbedding::new(RopeConfig::new(8), &Device::Cpu)?;
        let g = Operand::from_host(grad.clone(), &dims, false, &Device::Cpu)?;
        let (rotated, saved) = rope.forward(&g, 0)?;
        let back = rope.backward(&rotated, &saved)?.materialize()?;
        for (a, b) in back.iter().zip(&grad) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn packed_rotation_tracks_plain_rotation() -> Result<()> {
        let dims = [1usize, 2, 3, 8];
        let values = sample(&dims, 0.7);
        let rope = RotaryEmbedding::new(RopeConfig::new(8), &Device::Cpu)?;
        let plain = rope
            .forward(&Operand::from_host(values.clone(), &dims, false, &Device::Cpu)?, 2)?
            .0;
        let packed = rope
            .forward(&Operand::from_host(values, &dims, true, &Device::Cpu)?, 2)?
            .0;
        assert!(packed.is_packed());
        for (a, b) in plain.materialize()?.iter().zip(&packed.materialize()?) {
            assert!((a - b).abs() < 5e-3);
        }
        Ok(())
    }

    #[test]
    fn cache_grows_in_chunks_and_never_shrinks() -> Result<()> {
        let config = RopeConfig {
            growth_chunk: 16,
            ..RopeConfig::new(4)
        };
        let cache = RopeCache::new(config, &Device::Cpu)?;
        assert_eq!(cache.capacity()?, 0);
        cache.ensure(3)?;
        assert_eq!(cache.capacity()?, 16);
        cache.ensure(10)?;
        assert_eq!(cache.growth_count(), 1);
        cache.ensure(17)?;
        assert_eq!(cache.capacity()?, 32);
        cache.ensure(1)?;
        assert_eq!(cache.capacity()?, 32);
        assert_eq!(cache.growth_count(), 2);
        Ok(())
    }
}
