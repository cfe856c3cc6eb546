use std::sync::Arc;
use std::thread;

use anyhow::Result;
use candle_core::{Device, Tensor};
use embedding::positional::rope::{rotate, RopeCache, RopeCachePool, RopeConfig, RotaryEmbedding};
use kernels::registry::{tensor_map, AttrMap, Backend, GradientContext, KernelRegistry};
use kernels::Operand;
use static_assertions::assert_impl_all;

assert_impl_all!(RopeConfig: Send, Sync);
assert_impl_all!(RopeCache: Send, Sync);
assert_impl_all!(RotaryEmbedding: Send, Sync, Clone);

#[test]
fn offset_rotation_matches_the_tail_of_a_full_rotation() -> Result<()> {
    let device = Device::Cpu;
    let full = Tensor::randn(0f32, 1f32, (1, 2, 6, 8), &device)?;
    let rope = RotaryEmbedding::new(RopeConfig::new(8), &device)?;
    let (all, _) = rope.forward(&Operand::Plain(full.clone()), 0)?;
    let tail = full.narrow(2, 4, 2)?;
    let (step, _) = rope.forward(&Operand::Plain(tail), 4)?;
    let expected = all.to_plain()?.narrow(2, 4, 2)?;
    let diff = (step.to_plain()? - expected)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn shared_cache_serves_concurrent_readers() -> Result<()> {
    let device = Device::Cpu;
    let cache = Arc::new(RopeCache::new(RopeConfig::new(4), &device)?);
    let handles: Vec<_> = (1..5)
        .map(|i| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.ensure(i * 300).map(|t| t.len()))
        })
        .collect();
    for handle in handles {
        let len = handle.join().expect("reader thread")?;
        assert!(len >= 300);
    }
    assert_eq!(cache.capacity()?, 1280);
    Ok(())
}

#[test]
fn tables_past_capacity_are_rejected() -> Result<()> {
    let device = Device::Cpu;
    let cache = RopeCache::with_capacity(
        RopeConfig {
            growth_chunk: 4,
            ..RopeConfig::new(4)
        },
        &device,
        4,
    )?;
    let tables = cache.ensure(4)?;
    let x = Operand::Plain(Tensor::zeros((1, 1, 3, 4), candle_core::DType::F32, &device)?);
    assert!(rotate(&x, &tables, 2, 4, false).is_err());
    Ok(())
}

#[test]
fn registered_rope_gradient_inverts_the_forward() -> Result<()> {
    let mut registry = KernelRegistry::with_builtin()?;
    embedding::register_kernels(&mut registry)?;
    let device = Device::Cpu;
    let x = Operand::Plain(Tensor::randn(0f32, 1f32, (2, 2, 3, 8), &device)?);
    let attrs = AttrMap::new().with("past_len", 5usize)?.with("rotate_dim", 6usize)?;
    let inputs = tensor_map([("x", x.clone())]);
    let y = registry.forward("Rope", Backend::Cpu, &inputs, &attrs)?;
    let ctx = GradientContext {
        inputs: &inputs,
        output: &y,
        attrs: &attrs,
    };
    let back = registry.gradient("Rope", Backend::Cpu, &y, &ctx)?;
    let diff = (back["x"].to_plain()? - x.to_plain()?)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;
    assert!(diff < 1e-5);
    Ok(())
}

#[test]
fn registered_rope_reuses_one_growable_cache() -> Result<()> {
    let pool = Arc::new(RopeCachePool::new());
    let mut registry = KernelRegistry::new();
    embedding::register_kernels_with(&mut registry, Arc::clone(&pool))?;
    let device = Device::Cpu;
    let inputs = tensor_map([("x", Operand::Plain(Tensor::randn(0f32, 1f32, (1, 2, 4, 8), &device)?))]);

    for past_len in [0usize, 3, 10] {
        let attrs = AttrMap::new().with("past_len", past_len)?;
        registry.forward("Rope", Backend::Cpu, &inputs, &attrs)?;
    }
    assert_eq!(pool.len(), 1);
    let cache = pool.get(&RopeConfig::new(8), &device)?;
    assert_eq!(cache.growth_count(), 1);
    assert_eq!(cache.capacity()?, 256);

    let wide = AttrMap::new().with("past_len", 300usize)?;
    registry.forward("Rope", Backend::Cpu, &inputs, &wide)?;
    assert_eq!(cache.growth_count(), 2);
    assert_eq!(cache.capacity()?, 512);

    let partial = AttrMap::new().with("rotate_dim", 4usize)?;
    registry.forward("Rope", Backend::Cpu, &inputs, &partial)?;
    assert_eq!(pool.len(), 2);
    Ok(())
}
