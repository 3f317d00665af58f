//! Block codec throughput: decompose and reconstruct one 64³ block.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use vdc::codec::{BlockCodec, CodecScratch};

const BS: [usize; 3] = [64, 64, 64];
const CRATIOS: [usize; 4] = [500, 100, 10, 1];

fn field() -> Vec<f32> {
    let n = BS.iter().product::<usize>();
    (0..n)
        .map(|i| {
            let x = (i % 64) as f32;
            let y = ((i / 64) % 64) as f32;
            let z = (i / 4096) as f32;
            (x * 0.11).sin() * (y * 0.07).cos() + z * 0.01
        })
        .collect()
}

fn bench_decompose(c: &mut Criterion) {
    let mut group = c.benchmark_group("decompose");
    group.throughput(Throughput::Elements(field().len() as u64));

    for wname in ["bior1.1", "bior2.2", "bior4.4"] {
        let codec = BlockCodec::new(wname, &BS, &CRATIOS).unwrap();
        let input = field();
        let mut block = input.clone();
        let mut slots = vec![Vec::new(); CRATIOS.len()];
        let mut scratch = CodecScratch::default();

        group.bench_with_input(BenchmarkId::from_parameter(wname), &input, |b, input| {
            b.iter(|| {
                block.copy_from_slice(input);
                codec
                    .decompose(black_box(&mut block), &mut slots, &mut scratch)
                    .unwrap();
            })
        });
    }
    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruct");
    let codec = BlockCodec::new("bior4.4", &BS, &CRATIOS).unwrap();
    let mut block = field();
    let mut slots = vec![Vec::new(); CRATIOS.len()];
    let mut scratch = CodecScratch::default();
    codec.decompose(&mut block, &mut slots, &mut scratch).unwrap();

    for lod in 0..CRATIOS.len() {
        group.bench_with_input(BenchmarkId::new("lod", lod), &lod, |b, &lod| {
            b.iter(|| {
                codec
                    .reconstruct(
                        black_box(&slots[..=lod]),
                        codec.num_levels(),
                        &mut block,
                        &mut scratch,
                    )
                    .unwrap();
            })
        });
    }

    let level = codec.num_levels() / 2;
    group.bench_function("coarse_level", |b| {
        b.iter(|| {
            codec
                .reconstruct(black_box(&slots), level, &mut block, &mut scratch)
                .unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_decompose, bench_reconstruct);
criterion_main!(benches);
