//! Segmenter throughput over characteristic inputs: incompressible
//! noise, a pure byte run, and partially duplicated data.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use dwarfs::progress::Progress;
use dwarfs::segmenter::{new_segmenter, BlockManager, ChunkSink, FragmentExtent, SegmenterConfig};

struct DropSink;

impl ChunkSink for DropSink {
    fn add_chunk(&mut self, _: u32, _: u64, _: u64) {}
    fn add_hole(&mut self, _: u64) {}
}

fn pseudo_random(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn run_segmenter(data: &[u8], max_active_blocks: usize) {
    let cfg = SegmenterConfig {
        context: String::new(),
        block_size_bits: 22,
        blockhash_window_size: 12,
        window_increment_shift: 1,
        max_active_blocks,
        bloom_filter_size: 4,
    };
    let mut seg = new_segmenter(
        cfg,
        1,
        Arc::new(BlockManager::new()),
        Arc::new(Progress::default()),
        Box::new(|_, _| {}),
    );
    seg.add_file(&[FragmentExtent::Data(data)], &mut DropSink);
    seg.finish(&mut DropSink);
}

fn bench_segmenter(c: &mut Criterion) {
    const SIZE: usize = 8 << 20;

    let noise = pseudo_random(1, SIZE);
    let zeros = vec![0u8; SIZE];
    let mut duplicated = pseudo_random(2, SIZE / 2);
    duplicated.extend_from_within(..SIZE / 2);

    let mut group = c.benchmark_group("segmenter");
    group.throughput(Throughput::Bytes(SIZE as u64));

    group.bench_function("noise", |b| b.iter(|| run_segmenter(&noise, 1)));
    group.bench_function("zeros", |b| b.iter(|| run_segmenter(&zeros, 1)));
    group.bench_function("duplicated", |b| b.iter(|| run_segmenter(&duplicated, 1)));
    group.bench_function("duplicated_multiblock", |b| {
        b.iter(|| run_segmenter(&duplicated, 4))
    });

    group.finish();
}

criterion_group!(benches, bench_segmenter);
criterion_main!(benches);
