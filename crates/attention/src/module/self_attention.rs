//! Causal self-attention block with incremental decoding support.
//!
//! One call runs: fused Q/K/V projection written directly in head-split layout,
//! rotary embedding of `Q` and the new `K` slice at the cache's cumulative
//! phase, merge into the KV cache, masked scores, softmax (with dropout while
//! training), the weighted sum over `V`, head merge and output projection.
//!
//! Training calls return an [`AttentionTape`] for [`CausalSelfAttention::backward`].
//! In checkpoint mode the tape keeps only the input and dropout seeds and the
//! forward pass is replayed inside `backward`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use embedding::positional::rope::{RopeCache, RopeSaved, RotaryEmbedding};
use kernels::dropout::{self, DropoutSpec};
use kernels::matmul::{FusedMatMul, MatMulOptions, MatMulSaved};
use kernels::softmax::{Softmax, SoftmaxSaved};
use kernels::{checks, Operand, Variable};

use crate::core::{AttentionConfig, AttentionError, Result};
use crate::kv_cache::KvCache;
use crate::masks::{AttentionMask, MaskSaved};

/// Standard deviation of the projection weight initialisation.
pub const INIT_STD: f32 = 0.02;

/// Head-split permutation applied to the `[B, T, 3, H, D]` projection.
const QKV_PERM: [usize; 5] = [2, 0, 3, 1, 4];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub training: bool,
    /// Return the attention probabilities for visualisation.
    pub include_attention: bool,
}

impl CallOptions {
    pub fn training() -> Self {
        Self {
            training: true,
            include_attention: false,
        }
    }

    pub fn inference() -> Self {
        Self::default()
    }

    pub fn with_attention(mut self) -> Self {
        self.include_attention = true;
        self
    }
}

/// Seeds of the two dropout masks drawn by one training call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropoutSeeds {
    pub attention: u64,
    pub residual: u64,
}

#[derive(Debug)]
pub struct AttentionOutput {
    /// `[B, T, C]` in the block's configured representation.
    pub output: Operand,
    /// `[B, H, T, T_key]` probabilities before dropout, owned by the caller.
    pub attention: Option<Tensor>,
    /// Updated cache; only produced outside training with RoPE enabled.
    pub present: Option<KvCache>,
    /// Backward state; only produced by training calls.
    pub tape: Option<AttentionTape>,
}

/// State a training call leaves for its backward pass.
#[derive(Debug, Clone)]
pub struct AttentionTape {
    input: Operand,
    caller_packed: bool,
    seeds: DropoutSeeds,
    saved: Option<Box<ForwardSaved>>,
}

impl AttentionTape {
    pub fn seeds(&self) -> DropoutSeeds {
        self.seeds
    }

    /// `true` when intermediates were discarded and will be recomputed.
    pub fn is_checkpointed(&self) -> bool {
        self.saved.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct AttentionGrads {
    /// Gradient for the block input, in the caller's representation.
    pub input: Operand,
    pub c_attn: Tensor,
    pub c_proj: Tensor,
}

#[derive(Debug, Clone)]
struct ForwardSaved {
    qkv: MatMulSaved,
    rope_q: Option<RopeSaved>,
    rope_k: Option<RopeSaved>,
    core_packed: bool,
    mask: MaskSaved,
    softmax: SoftmaxSaved,
    mix: MatMulSaved,
    proj: MatMulSaved,
    resid_mask: Option<Vec<f32>>,
}

struct Pass {
    output: Operand,
    attention: Option<Tensor>,
    present: Option<KvCache>,
    saved: ForwardSaved,
}

/// Multi-head causal self-attention.
#[derive(Debug)]
pub struct CausalSelfAttention {
    config: AttentionConfig,
    c_attn: Variable,
    c_proj: Variable,
    rope: Option<RotaryEmbedding>,
    mask: AttentionMask,
    mix_op: FusedMatMul,
    proj_op: FusedMatMul,
    calls: AtomicU64,
}

impl CausalSelfAttention {
    /// Builds a block with its own RoPE cache (if RoPE is enabled).
    pub fn new(config: AttentionConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let rope = match config.rope_config() {
            Some(rope_config) => Some(RotaryEmbedding::new(rope_config, device)?),
            None => None,
        };
        Self::build(config, rope, device)
    }

    /// Builds a block sharing a model-wide RoPE cache.
    pub fn with_rope_cache(config: AttentionConfig, cache: Arc<RopeCache>, device: &Device) -> Result<Self> {
        config.validate()?;
        match config.rope_config() {
            Some(expected) if &expected == cache.config() => {}
            Some(expected) => {
                return Err(AttentionError::config(format!(
                    "shared rope cache {:?} does not match layer rope {:?}",
                    cache.config(),
                    expected
                )))
            }
            None => return Err(AttentionError::config("layer has rope disabled but a rope cache was supplied")),
        }
        Self::build(config, Some(RotaryEmbedding::with_cache(cache)), device)
    }

    fn build(config: AttentionConfig, rope: Option<RotaryEmbedding>, device: &Device) -> Result<Self> {
        let c = config.n_embd;
        let c_attn = Variable::randn(format!("{}/c_attn/kernel", config.name), &[c, 3 * c], INIT_STD, device)?;
        let c_proj = Variable::randn(format!("{}/c_proj/kernel", config.name), &[c, c], INIT_STD, device)?;
        let mask = AttentionMask::new(config.head_dim())?;
        log::info!(
            "attention init name={} n_embd={} n_head={} block_size={} rope={} packed={} checkpoint={}",
            config.name,
            config.n_embd,
            config.n_head,
            config.block_size,
            config.rope.is_some(),
            config.packed,
            config.checkpoint
        );
        Ok(Self {
            config,
            c_attn,
            c_proj,
            rope,
            mask,
            mix_op: FusedMatMul::new(MatMulOptions::default())?,
            proj_op: FusedMatMul::new(MatMulOptions::default())?,
            calls: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn c_attn(&self) -> &Variable {
        &self.c_attn
    }

    pub fn c_proj(&self) -> &Variable {
        &self.c_proj
    }

    pub fn rope(&self) -> Option<&RotaryEmbedding> {
        self.rope.as_ref()
    }

    /// Runs the block on `x` (`[B, T, C]`), optionally continuing from `past`.
    pub fn call(&self, x: &Operand, options: CallOptions, past: Option<KvCache>) -> Result<AttentionOutput> {
        let (batch, seq) = checks::expect_batch_seq_hidden("attention input", x.dims(), self.config.n_embd)?;
        if seq == 0 {
            return Err(AttentionError::usage("attention input must hold at least one position"));
        }
        if let Some(cache) = &past {
            if options.training {
                return Err(AttentionError::usage("a kv cache cannot be used while training"));
            }
            if self.rope.is_none() {
                return Err(AttentionError::usage(
                    "a kv cache requires rotary embeddings; absolute positions cannot be decoded incrementally",
                ));
            }
            let layout = cache.layout();
            if layout.batch != batch
                || layout.num_heads != self.config.n_head
                || layout.head_dim != self.config.head_dim()
            {
                return Err(AttentionError::usage(format!(
                    "kv cache layout {layout:?} does not fit input batch {batch} with {} heads of {}",
                    self.config.n_head,
                    self.config.head_dim()
                )));
            }
            if seq > self.config.block_size {
                return Err(AttentionError::usage(format!(
                    "a chunk of {seq} positions cannot follow a kv cache with window {}",
                    self.config.block_size
                )));
            }
        }

        let seeds = if options.training {
            self.next_seeds()
        } else {
            DropoutSeeds::default()
        };
        let input = x.to_representation(self.config.packed)?;
        let pass = self.forward_pass(
            &input,
            batch,
            seq,
            options.training,
            seeds,
            past,
            options.include_attention,
        )?;

        let tape = if options.training {
            Some(AttentionTape {
                input,
                caller_packed: x.is_packed(),
                seeds,
                saved: (!self.config.checkpoint).then(|| Box::new(pass.saved)),
            })
        } else {
            None
        };
        Ok(AttentionOutput {
            output: pass.output,
            attention: pass.attention,
            present: pass.present,
            tape,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn forward_pass(
        &self,
        input: &Operand,
        batch: usize,
        seq: usize,
        training: bool,
        seeds: DropoutSeeds,
        past: Option<KvCache>,
        want_attention: bool,
    ) -> Result<Pass> {
        let (c, heads, head_dim) = (self.config.n_embd, self.config.n_head, self.config.head_dim());

        let (qkv, qkv_saved) = self
            .qkv_op(batch, seq)?
            .forward(input, &self.weight_operand(&self.c_attn)?)?;
        let head_dims = [batch, heads, seq, head_dim];
        let q = qkv.narrow(0, 0, 1)?.reshape(&head_dims)?;
        let k = qkv.narrow(0, 1, 1)?.reshape(&head_dims)?;
        let v = qkv.narrow(0, 2, 1)?.reshape(&head_dims)?;

        let phase = past.as_ref().map(KvCache::cumulative_length).unwrap_or(0);
        let (q, k, rope_q, rope_k) = match &self.rope {
            Some(rope) => {
                let (q, saved_q) = rope.forward(&q, phase)?;
                let (k, saved_k) = rope.forward(&k, phase)?;
                (q, k, Some(saved_q), Some(saved_k))
            }
            None => (q, k, None, None),
        };

        let (keys, values, past_len, present) = if training || self.rope.is_none() {
            (k, v, 0, None)
        } else {
            let update = KvCache::append(past, &k, &v, self.config.block_size)?;
            (update.keys, update.values, update.past_len, Some(update.present))
        };

        // Score rows hold one lane per key pair, so an odd key count runs unpacked.
        let core_packed = self.config.packed && keys.dims()[2] % 2 == 0;
        let q = q.to_representation(core_packed)?;
        let keys = keys.to_representation(core_packed)?;
        let values = values.to_representation(core_packed)?;

        let (scores, mask_saved) = self.mask.forward(&q, &keys, past_len)?;
        let (probs, softmax_saved) = self.softmax(training, seeds)?.forward(&scores)?;
        let attention = if want_attention {
            Some(Tensor::from_vec(
                softmax_saved.probabilities().to_vec(),
                scores.dims().to_vec(),
                input.device(),
            )?)
        } else {
            None
        };

        let (mixed, mix_saved) = self.mix_op.forward(&probs, &values)?;
        let merged = mixed
            .permute(&[0, 2, 1, 3])?
            .reshape(&[batch, seq, c])?
            .to_representation(self.config.packed)?;
        let (out, proj_saved) = self
            .proj_op
            .forward(&merged, &self.weight_operand(&self.c_proj)?)?;

        let (output, resid_mask) = if training && self.config.resid_dropout > 0.0 {
            let spec = DropoutSpec::new(self.config.resid_dropout, seeds.residual)?;
            let mut data = out.materialize()?;
            let mask = dropout::apply(&mut data, Some(&spec));
            (out.like(data, out.dims())?, mask)
        } else {
            (out, None)
        };

        Ok(Pass {
            output,
            attention,
            present,
            saved: ForwardSaved {
                qkv: qkv_saved,
                rope_q,
                rope_k,
                core_packed,
                mask: mask_saved,
                softmax: softmax_saved,
                mix: mix_saved,
                proj: proj_saved,
                resid_mask,
            },
        })
    }

    /// Gradients of a training call with respect to its input and weights.
    pub fn backward(&self, tape: &AttentionTape, grad: &Operand) -> Result<AttentionGrads> {
        checks::expect_shape("attention grad", grad.dims(), tape.input.dims())?;
        let (batch, seq) = (tape.input.dims()[0], tape.input.dims()[1]);
        let (heads, head_dim) = (self.config.n_head, self.config.head_dim());
        let packed = self.config.packed;

        let recomputed;
        let saved = match &tape.saved {
            Some(saved) => saved.as_ref(),
            None => {
                log::debug!("attention {}: recomputing checkpointed forward", self.config.name);
                recomputed = self
                    .forward_pass(&tape.input, batch, seq, true, tape.seeds, None, false)?
                    .saved;
                &recomputed
            }
        };

        let mut g = grad.to_representation(packed)?;
        if let Some(mask) = &saved.resid_mask {
            let mut data = g.materialize()?;
            for (value, m) in data.iter_mut().zip(mask) {
                *value *= m;
            }
            g = g.like(data, g.dims())?;
        }

        let proj = self.proj_op.backward(&g, &saved.proj)?;
        let d_mixed = proj
            .a
            .reshape(&[batch, seq, heads, head_dim])?
            .permute(&[0, 2, 1, 3])?
            .to_representation(saved.core_packed)?;
        let mix = self.mix_op.backward(&d_mixed, &saved.mix)?;
        let d_scores = self.softmax(true, tape.seeds)?.backward(&mix.a, &saved.softmax)?;
        let scores = self.mask.backward(&d_scores, &saved.mask)?;

        let mut dq = scores.q.to_representation(packed)?;
        let mut dk = scores.k.to_representation(packed)?;
        let dv = mix.b.to_representation(packed)?;
        if let (Some(rope), Some(saved_q), Some(saved_k)) = (&self.rope, &saved.rope_q, &saved.rope_k) {
            dq = rope.backward(&dq, saved_q)?;
            dk = rope.backward(&dk, saved_k)?;
        }

        let stacked = [1, batch, heads, seq, head_dim];
        let d_qkv = Operand::cat(
            &[&dq.reshape(&stacked)?, &dk.reshape(&stacked)?, &dv.reshape(&stacked)?],
            0,
        )?;
        let qkv = self.qkv_op(batch, seq)?.backward(&d_qkv, &saved.qkv)?;

        Ok(AttentionGrads {
            input: qkv.a.to_representation(tape.caller_packed)?,
            c_attn: qkv.b.to_plain()?,
            c_proj: proj.b.to_plain()?,
        })
    }

    /// Optimizer hook: `w -= lr * grad` on both projections.
    pub fn apply_gradients(&mut self, grads: &AttentionGrads, lr: f64) -> Result<()> {
        self.c_attn.apply_gradient(&grads.c_attn, lr)?;
        self.c_proj.apply_gradient(&grads.c_proj, lr)?;
        Ok(())
    }

    /// Names under which [`CausalSelfAttention::save_weights`] stores tensors.
    pub fn weight_names(&self) -> [&str; 2] {
        [self.c_attn.name(), self.c_proj.name()]
    }

    pub fn save_weights(&self, weights: &mut HashMap<String, Tensor>) {
        for var in [&self.c_attn, &self.c_proj] {
            weights.insert(var.name().to_string(), var.value().clone());
        }
    }

    /// Loads both projections; nothing is assigned unless both are valid.
    pub fn load_weights(&mut self, weights: &HashMap<String, Tensor>) -> Result<()> {
        let fetch = |var: &Variable| -> Result<Tensor> {
            let tensor = weights
                .get(var.name())
                .ok_or_else(|| AttentionError::usage(format!("missing weight {}", var.name())))?;
            checks::expect_shape(var.name(), tensor.dims(), var.dims())?;
            Ok(tensor.clone())
        };
        let c_attn = fetch(&self.c_attn)?;
        let c_proj = fetch(&self.c_proj)?;
        self.c_attn.assign(c_attn)?;
        self.c_proj.assign(c_proj)?;
        Ok(())
    }

    fn qkv_op(&self, batch: usize, seq: usize) -> Result<FusedMatMul> {
        Ok(FusedMatMul::new(MatMulOptions {
            force_output_shape: Some(vec![batch, seq, 3, self.config.n_head, self.config.head_dim()]),
            perm: Some(QKV_PERM.to_vec()),
            ..MatMulOptions::default()
        })?)
    }

    fn weight_operand(&self, var: &Variable) -> Result<Operand> {
        Ok(Operand::Plain(var.value().clone()).to_representation(self.config.packed)?)
    }

    fn softmax(&self, training: bool, seeds: DropoutSeeds) -> Result<Softmax> {
        let dropout = if training && self.config.attn_dropout > 0.0 {
            Some(DropoutSpec::new(self.config.attn_dropout, seeds.attention)?)
        } else {
            None
        };
        Ok(Softmax::new(dropout))
    }

    fn next_seeds(&self) -> DropoutSeeds {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let base = self
            .config
            .seed
            .wrapping_add(call.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        DropoutSeeds {
            attention: base,
            residual: base ^ 0xD1B5_4A32_D192_ED03,
        }
    }
}
