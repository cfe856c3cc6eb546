use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kernels::activations::ActivationKind;
use kernels::matmul::{FusedMatMul, MatMulOptions};
use kernels::Operand;

fn bench_matmul(c: &mut Criterion) {
    let device = Device::Cpu;
    let sizes = &[32usize, 64, 128];
    let op = FusedMatMul::new(MatMulOptions {
        scale: Some(0.5),
        activation: ActivationKind::Gelu,
        ..MatMulOptions::default()
    })
    .expect("matmul");

    for packed in [false, true] {
        let label = if packed { "packed" } else { "plain" };
        let mut group = c.benchmark_group(format!("fused_matmul/{label}"));
        for &size in sizes {
            let a = Tensor::randn(0f32, 1.0, (4, size, size), &device).expect("a");
            let b = Tensor::randn(0f32, 1.0, (size, size), &device).expect("b");
            let a = Operand::Plain(a).to_representation(packed).expect("cast a");
            let b = Operand::Plain(b).to_representation(packed).expect("cast b");

            group.throughput(Throughput::Elements((4 * size * size * size) as u64));
            group.bench_with_input(BenchmarkId::new("forward", size), &(a, b), |bench, (a, b)| {
                bench.iter(|| {
                    let out = op.forward(black_box(a), black_box(b)).expect("forward");
                    black_box(out);
                });
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_matmul);
criterion_main!(benches);
