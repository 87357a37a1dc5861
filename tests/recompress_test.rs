//! Rewrite/recompress behaviour: contents and identity are preserved,
//! untouched sections keep their checksums.

mod common;

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use common::{build_image, random_bytes, BuildConfig};
use dwarfs::codec;
use dwarfs::metadata::MetadataOptions;
use dwarfs::reader::{Filesystem, FilesystemOptions};
use dwarfs::section::{scan_sections, SectionType};
use dwarfs::writer::{recompress_image, CategoryFilter, RecompressMode, RecompressOptions};
use tempfile::TempDir;

fn recompress_opts(mode: RecompressMode) -> RecompressOptions {
    let mut block_codecs: HashMap<String, Arc<dyn codec::Codec>> = HashMap::new();
    block_codecs.insert(String::new(), Arc::from(codec::parse_codec_spec("lz4").unwrap()));
    RecompressOptions {
        mode,
        categories: CategoryFilter::default(),
        block_codecs,
        schema_codec: Arc::from(codec::parse_codec_spec("zstd:level=3").unwrap()),
        metadata_codec: Arc::from(codec::parse_codec_spec("null").unwrap()),
        history_codec: Arc::from(codec::parse_codec_spec("zstd:level=3").unwrap()),
        rebuild_metadata: None,
        remove_header: false,
        no_section_index: false,
        no_history: false,
        history_args: vec!["recompress".to_owned()],
    }
}

fn build_sample(input: &TempDir, image: &std::path::Path) -> Vec<u8> {
    fs::create_dir(input.path().join("d")).unwrap();
    let payload = random_bytes(5, 300 << 10);
    fs::write(input.path().join("d/data.bin"), &payload).unwrap();
    fs::write(input.path().join("note.txt"), b"hello recompress").unwrap();
    build_image(
        input.path(),
        image,
        &BuildConfig {
            block_size_bits: 17,
            ..BuildConfig::default()
        },
    );
    payload
}

#[test]
fn recompress_preserves_contents_and_inodes() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("orig.dwarfs");
    let rewritten = out.path().join("rew.dwarfs");

    let payload = build_sample(&input, &image);

    recompress_image(&image, &rewritten, &recompress_opts(RecompressMode::Block)).unwrap();

    let a = Filesystem::open(&image, FilesystemOptions::default()).unwrap();
    let b = Filesystem::open(&rewritten, FilesystemOptions::default()).unwrap();

    let ia = a.find_path("d/data.bin").unwrap();
    let ib = b.find_path("d/data.bin").unwrap();
    assert_eq!(ia, ib, "inode numbers survive recompression");
    assert_eq!(b.read(ib, 300 << 10, 0).unwrap(), payload);

    let ra: Vec<_> = a.readdir(a.root_inode()).unwrap();
    let rb: Vec<_> = b.readdir(b.root_inode()).unwrap();
    assert_eq!(ra, rb);

    // Two history records now: the build and the rewrite.
    assert_eq!(b.history().unwrap().records.len(), 2);

    b.check_integrity().unwrap();
}

#[test]
fn untouched_blocks_keep_their_checksums() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("orig.dwarfs");
    let rewritten = out.path().join("rew.dwarfs");

    build_sample(&input, &image);

    // Metadata-only recompression leaves the data blocks alone.
    recompress_image(&image, &rewritten, &recompress_opts(RecompressMode::Metadata)).unwrap();

    let mut fa = fs::File::open(&image).unwrap();
    let mut fb = fs::File::open(&rewritten).unwrap();
    let sa = scan_sections(&mut fa, 0).unwrap();
    let sb = scan_sections(&mut fb, 0).unwrap();

    let blocks_a: Vec<_> = sa
        .iter()
        .filter(|s| s.header.section_type == SectionType::Block)
        .collect();
    let blocks_b: Vec<_> = sb
        .iter()
        .filter(|s| s.header.section_type == SectionType::Block)
        .collect();

    assert_eq!(blocks_a.len(), blocks_b.len());
    for (x, y) in blocks_a.iter().zip(&blocks_b) {
        assert_eq!(x.header.xxh3_64, y.header.xxh3_64);
        assert_eq!(x.header.sha2_512_256, y.header.sha2_512_256);
    }
}

#[test]
fn rebuild_metadata_round_trips() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("orig.dwarfs");
    let rewritten = out.path().join("rew.dwarfs");

    let payload = build_sample(&input, &image);

    let mut opts = recompress_opts(RecompressMode::None);
    opts.rebuild_metadata = Some(MetadataOptions {
        packed_chunk_table: false,
        packed_directories: false,
        packed_shared_files_table: false,
        packed_names: false,
        packed_symlinks: false,
        ..MetadataOptions::default()
    });
    recompress_image(&image, &rewritten, &opts).unwrap();

    let b = Filesystem::open(&rewritten, FilesystemOptions::default()).unwrap();
    let ib = b.find_path("d/data.bin").unwrap();
    assert_eq!(b.read(ib, 300 << 10, 0).unwrap(), payload);
    assert!(!b.metadata().options.packed_chunk_table);
}
