//! Shared helpers: build an image from a directory with test-sized knobs.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use dwarfs::categorizer::CategorizerManager;
use dwarfs::codec;
use dwarfs::history::History;
use dwarfs::inode::{InodeManager, OrderPolicy};
use dwarfs::metadata::MetadataOptions;
use dwarfs::progress::Progress;
use dwarfs::scanner::{ScanOptions, Scanner};
use dwarfs::segmenter::SegmenterConfig;
use dwarfs::writer::{CategoryWriterConfig, ImageWriter, WriterOptions};

pub struct BuildConfig {
    pub categorize: Vec<String>,
    pub block_size_bits: u32,
    pub window_size: u32,
    pub max_lookback_blocks: usize,
    pub order: OrderPolicy,
    pub compression: String,
    pub scan: ScanOptions,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            categorize: Vec::new(),
            block_size_bits: 20,
            window_size: 12,
            max_lookback_blocks: 1,
            order: OrderPolicy::None,
            compression: "zstd:level=3".to_owned(),
            scan: ScanOptions::default(),
        }
    }
}

/// Build `input` into an image at `output`; returns the progress counters.
pub fn build_image(input: &Path, output: &Path, cfg: &BuildConfig) -> Arc<Progress> {
    let categorizers = CategorizerManager::with_builtins(&cfg.categorize).unwrap();
    let progress = Arc::new(Progress::default());

    let scanner = Scanner::new(cfg.scan.clone(), &categorizers, Arc::clone(&progress));
    let mut tree = scanner.scan(input).unwrap();

    let inode_mgr = InodeManager::build(&tree, &progress);
    let layout = inode_mgr.assign_inode_numbers(&mut tree);

    let resolve = |name: &str| -> CategoryWriterConfig {
        let spec = match name {
            "pcmaudio/waveform" => "pcmaudio",
            "incompressible" => "null",
            _ => cfg.compression.as_str(),
        };
        CategoryWriterConfig {
            codec: Arc::from(codec::parse_codec_spec(spec).unwrap()),
            segmenter: SegmenterConfig {
                context: format!("[{name}] "),
                block_size_bits: cfg.block_size_bits,
                blockhash_window_size: cfg.window_size,
                window_increment_shift: 1,
                max_active_blocks: cfg.max_lookback_blocks,
                bloom_filter_size: 4,
            },
            order: cfg.order,
        }
    };

    let mut history = History::new();
    history.append(vec!["test".to_owned()]);

    let mut writer = ImageWriter {
        tree: &tree,
        inode_mgr: &inode_mgr,
        layout: &layout,
        categorizers: &categorizers,
        progress: Arc::clone(&progress),
        metadata_options: MetadataOptions::default(),
        options: WriterOptions::default(),
        history,
    };
    writer.write(output, &resolve).unwrap();

    progress
}

/// A deterministic pseudo-random byte stream (xorshift), for data that
/// should not compress or self-match.
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
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

/// A minimal 16-bit little-endian PCM WAV file.
pub fn make_wav(channels: u16, sample_rate: u32, samples_per_channel: u32) -> Vec<u8> {
    let bytes_per_sample = 2u16;
    let data_len = samples_per_channel * channels as u32 * bytes_per_sample as u32;
    let byte_rate = sample_rate * channels as u32 * bytes_per_sample as u32;
    let block_align = channels * bytes_per_sample;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    // A quiet sawtooth so the payload is non-trivial but compressible.
    for i in 0..samples_per_channel {
        for c in 0..channels {
            let v = ((i % 256) as i16 - 128) * (c as i16 + 1);
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}
