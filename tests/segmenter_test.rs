//! Segmenter unit tests: chunk lists must reconstruct the input exactly,
//! offsets must respect granularity, and the rolling hash must behave
//! like a true sliding window.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use common::random_bytes;
use dwarfs::progress::Progress;
use dwarfs::segmenter::{
    new_segmenter, BlockManager, ChunkSink, FragmentExtent, RsyncHash, SegmenterConfig,
};
use proptest::prelude::*;

#[derive(Default)]
struct CollectingSink {
    chunks: Vec<(u32, u64, u64)>,
    holes: Vec<u64>,
}

impl ChunkSink for CollectingSink {
    fn add_chunk(&mut self, block: u32, offset: u64, size: u64) {
        self.chunks.push((block, offset, size));
    }
    fn add_hole(&mut self, size: u64) {
        self.holes.push(size);
    }
}

struct Harness {
    blocks: Arc<Mutex<HashMap<u32, Arc<Vec<u8>>>>>,
    block_mgr: Arc<BlockManager>,
    progress: Arc<Progress>,
}

impl Harness {
    fn new() -> Self {
        Harness {
            blocks: Arc::new(Mutex::new(HashMap::new())),
            block_mgr: Arc::new(BlockManager::new()),
            progress: Arc::new(Progress::default()),
        }
    }

    fn segmenter(
        &self,
        cfg: SegmenterConfig,
        granularity: u32,
    ) -> Box<dyn dwarfs::segmenter::SegmenterApi> {
        let blocks = Arc::clone(&self.blocks);
        new_segmenter(
            cfg,
            granularity,
            Arc::clone(&self.block_mgr),
            Arc::clone(&self.progress),
            Box::new(move |data, logical| {
                blocks.lock().unwrap().insert(logical, data);
            }),
        )
    }

    /// Reassemble a file from its chunk list.
    fn reconstruct(&self, chunks: &[(u32, u64, u64)]) -> Vec<u8> {
        let blocks = self.blocks.lock().unwrap();
        let mut out = Vec::new();
        for &(block, offset, size) in chunks {
            let data = &blocks[&block];
            out.extend_from_slice(&data[offset as usize..(offset + size) as usize]);
        }
        out
    }
}

fn test_config(window_bits: u32, lookback: usize) -> SegmenterConfig {
    SegmenterConfig {
        context: String::new(),
        block_size_bits: 16,
        blockhash_window_size: window_bits,
        window_increment_shift: 1,
        max_active_blocks: lookback,
        bloom_filter_size: 4,
    }
}

#[test]
fn chunks_reconstruct_input() {
    let harness = Harness::new();
    let mut seg = harness.segmenter(test_config(8, 2), 1);

    // A mix of repetitive and random content across several files.
    let files: Vec<Vec<u8>> = vec![
        random_bytes(1, 100_000),
        vec![0x42; 50_000],
        random_bytes(1, 100_000), // exact repeat of the first file
        b"tiny".to_vec(),
        random_bytes(2, 70_000),
    ];

    let mut all_chunks = Vec::new();
    for data in &files {
        let mut sink = CollectingSink::default();
        seg.add_file(&[FragmentExtent::Data(data)], &mut sink);
        all_chunks.push(sink.chunks);
    }
    seg.finish(&mut CollectingSink::default());

    for (data, chunks) in files.iter().zip(&all_chunks) {
        assert_eq!(&harness.reconstruct(chunks), data);
    }
}

#[test]
fn duplicate_file_reuses_earlier_block() {
    let harness = Harness::new();
    let mut seg = harness.segmenter(test_config(8, 1), 1);

    let data = random_bytes(3, 60_000);

    let mut first = CollectingSink::default();
    seg.add_file(&[FragmentExtent::Data(&data)], &mut first);
    let mut second = CollectingSink::default();
    seg.add_file(&[FragmentExtent::Data(&data)], &mut second);
    seg.finish(&mut CollectingSink::default());

    // The second copy should be mostly references into the first copy's
    // block rather than fresh data.
    let fresh: u64 = second
        .chunks
        .iter()
        .filter(|&&(block, ..)| !first.chunks.iter().any(|&(b, ..)| b == block))
        .map(|&(.., size)| size)
        .sum();
    assert!(
        fresh < data.len() as u64 / 10,
        "second copy wrote {fresh} fresh bytes"
    );
    assert_eq!(harness.reconstruct(&second.chunks), data);
}

#[test]
fn long_zero_runs_do_not_explode() {
    let harness = Harness::new();
    let mut seg = harness.segmenter(test_config(8, 1), 1);

    let data = vec![0u8; 200_000];
    let mut sink = CollectingSink::default();
    seg.add_file(&[FragmentExtent::Data(&data)], &mut sink);
    seg.finish(&mut CollectingSink::default());

    assert_eq!(harness.reconstruct(&sink.chunks), data);

    // Self-matching means almost none of the zeros are stored; only a
    // short prefix ever reaches the block.
    let stored = harness
        .progress
        .filesystem_size
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(stored < 20_000, "stored {stored} bytes of a pure zero run");
}

#[test]
fn granularity_is_respected() {
    let harness = Harness::new();
    let granularity = 6;
    let mut seg = harness.segmenter(test_config(6, 2), granularity);

    for seed in 10..14 {
        let data = random_bytes(seed, 60_000 - 60_000 % granularity as usize);
        let mut sink = CollectingSink::default();
        seg.add_file(&[FragmentExtent::Data(&data)], &mut sink);
        for &(_, offset, size) in &sink.chunks {
            assert_eq!(offset % granularity as u64, 0);
            assert_eq!(size % granularity as u64, 0);
        }
        assert_eq!(harness.reconstruct(&sink.chunks), data);
    }
    seg.finish(&mut CollectingSink::default());
}

#[test]
fn holes_pass_through() {
    let harness = Harness::new();
    let mut seg = harness.segmenter(test_config(8, 1), 1);

    let head = random_bytes(5, 30_000);
    let tail = random_bytes(6, 20_000);
    let mut sink = CollectingSink::default();
    seg.add_file(
        &[
            FragmentExtent::Data(&head),
            FragmentExtent::Hole(65536),
            FragmentExtent::Data(&tail),
        ],
        &mut sink,
    );
    seg.finish(&mut CollectingSink::default());

    assert_eq!(sink.holes, vec![65536]);
    let bytes: u64 = sink.chunks.iter().map(|&(.., s)| s).sum();
    assert_eq!(bytes, (head.len() + tail.len()) as u64);
}

#[test]
fn disabled_segmentation_still_chunks() {
    let harness = Harness::new();
    let mut seg = harness.segmenter(test_config(0, 0), 1);

    let data = random_bytes(8, 150_000);
    let mut sink = CollectingSink::default();
    seg.add_file(&[FragmentExtent::Data(&data)], &mut sink);
    seg.finish(&mut CollectingSink::default());

    assert_eq!(harness.reconstruct(&sink.chunks), data);
}

// ── Rolling hash ─────────────────────────────────────────────────────────────

#[test]
fn repeating_window_matches_rolled_hash() {
    for window in [16u32, 256, 4096] {
        for byte in [0u8, 1, 0x55, 0xFF] {
            let mut h = RsyncHash::new(window);
            for _ in 0..window {
                h.roll_in(byte);
            }
            assert_eq!(h.hash(), RsyncHash::repeating_window(byte, window));
        }
    }
}

proptest! {
    /// Sliding the hash across data gives the same value as hashing each
    /// window from scratch.
    #[test]
    fn sliding_equals_fresh(data in proptest::collection::vec(any::<u8>(), 64..512)) {
        let window = 32usize;
        let mut rolling = RsyncHash::new(window as u32);
        for &b in &data[..window] {
            rolling.roll_in(b);
        }

        for end in window..data.len() {
            let mut fresh = RsyncHash::new(window as u32);
            for &b in &data[end - window..end] {
                fresh.roll_in(b);
            }
            prop_assert_eq!(rolling.hash(), fresh.hash());
            rolling.roll(data[end - window], data[end]);
        }
    }
}
