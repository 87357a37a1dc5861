//! End-to-end scenarios: build an image from a real directory tree, open
//! it, and verify what a mounted view would have to show.

mod common;

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use common::{build_image, make_wav, random_bytes, BuildConfig};
use dwarfs::entry::InodeRank;
use dwarfs::error::Error;
use dwarfs::inode::OrderPolicy;
use dwarfs::metadata::HOLE_BLOCK;
use dwarfs::reader::{Filesystem, FilesystemOptions};
use dwarfs::section::{scan_sections, SectionType};
use tempfile::TempDir;
use xxhash_rust::xxh3::xxh3_128;

fn open(path: &std::path::Path) -> Filesystem {
    Filesystem::open(path, FilesystemOptions::default()).unwrap()
}

#[test]
fn empty_directory() {
    let input = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("empty.dwarfs");

    build_image(input.path(), &image, &BuildConfig::default());

    let fs = open(&image);
    assert_eq!(fs.readdir(fs.root_inode()).unwrap().len(), 0);

    let sv = fs.statvfs();
    assert_eq!(sv.files, 1);
    assert_eq!(sv.blocks, 0);
}

#[test]
fn single_file_contents() {
    let input = TempDir::new().unwrap();
    fs::write(input.path().join("hello.txt"), b"Hello, World!\n").unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("hello.dwarfs");

    build_image(input.path(), &image, &BuildConfig::default());

    let fs = open(&image);
    let inode = fs.find_path("hello.txt").unwrap();
    assert_eq!(fs.getattr(inode).unwrap().size, 14);

    let data = fs.read(inode, 14, 0).unwrap();
    assert_eq!(data, b"Hello, World!\n");

    // The canonical digest of the payload without its trailing newline.
    assert_eq!(
        xxh3_128(&data[..13]),
        0x9553D72C8403DB7750DD474484F21D53u128
    );

    // Reads past EOF clamp; reads at EOF are empty.
    assert_eq!(fs.read(inode, 100, 7).unwrap(), b"World!\n");
    assert!(fs.read(inode, 10, 14).unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn hardlinks_share_one_inode() {
    let input = TempDir::new().unwrap();
    fs::create_dir(input.path().join("a")).unwrap();
    fs::create_dir(input.path().join("b")).unwrap();
    fs::write(input.path().join("a/f"), vec![0u8; 1 << 20]).unwrap();
    fs::hard_link(input.path().join("a/f"), input.path().join("b/f")).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("links.dwarfs");
    build_image(input.path(), &image, &BuildConfig::default());

    let fs = Filesystem::open(
        &image,
        FilesystemOptions {
            enable_nlink: true,
            ..FilesystemOptions::default()
        },
    )
    .unwrap();

    let ia = fs.find_path("a/f").unwrap();
    let ib = fs.find_path("b/f").unwrap();
    assert_eq!(ia, ib);
    assert_eq!(fs.getattr(ia).unwrap().nlink, 2);

    // One data block for the zeros.
    assert_eq!(fs.metadata().counts.blocks, 1);
    assert_eq!(fs.read(ia, 1 << 20, 0).unwrap(), vec![0u8; 1 << 20]);
}

#[test]
fn duplicate_content_shares_chunks() {
    let input = TempDir::new().unwrap();
    let data = random_bytes(7, 4 << 20);
    fs::write(input.path().join("one.bin"), &data).unwrap();
    fs::write(input.path().join("two.bin"), &data).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("dup.dwarfs");
    let progress = build_image(
        input.path(),
        &image,
        &BuildConfig {
            block_size_bits: 22,
            ..BuildConfig::default()
        },
    );

    // More than half of the input bytes were deduplicated.
    let dup = progress.duplicate_size.load(std::sync::atomic::Ordering::Relaxed);
    assert!(dup * 2 > 4 << 20, "deduplicated only {dup} bytes");

    let fs = open(&image);
    assert_eq!(fs.metadata().counts.blocks, 1);

    let i1 = fs.find_path("one.bin").unwrap();
    let i2 = fs.find_path("two.bin").unwrap();
    assert_ne!(i1, i2, "distinct paths are distinct inodes");
    assert_eq!(fs.metadata().chunks_of(i1), fs.metadata().chunks_of(i2));
    assert_eq!(fs.read(i2, 4 << 20, 0).unwrap(), data);
}

#[test]
fn partial_overlap_references_previous_block() {
    let input = TempDir::new().unwrap();
    let a = random_bytes(3, 1 << 20);
    let mut b = a.clone();
    b.extend_from_slice(&random_bytes(4, 1 << 20));
    fs::write(input.path().join("a.bin"), &a).unwrap();
    fs::write(input.path().join("b.bin"), &b).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("overlap.dwarfs");
    build_image(
        input.path(),
        &image,
        &BuildConfig {
            block_size_bits: 20,
            window_size: 12, // 4 KiB window
            max_lookback_blocks: 1,
            order: OrderPolicy::None,
            ..BuildConfig::default()
        },
    );

    let fs = open(&image);
    let ia = fs.find_path("a.bin").unwrap();
    let ib = fs.find_path("b.bin").unwrap();

    let chunks_a = fs.metadata().chunks_of(ia);
    assert_eq!(chunks_a.len(), 1);
    let block_of_a = chunks_a[0].block;

    let chunks_b = fs.metadata().chunks_of(ib);
    assert_eq!(chunks_b[0].block, block_of_a);
    assert_eq!(chunks_b[0].offset, 0);
    assert_eq!(chunks_b[0].size, 1 << 20);
    assert!(chunks_b[1..].iter().all(|c| c.block != block_of_a));

    assert_eq!(fs.read(ib, 2 << 20, 0).unwrap(), b);
}

#[test]
fn wav_categorization_routes_waveform() {
    let input = TempDir::new().unwrap();
    let wav = make_wav(2, 44100, 44100);
    fs::write(input.path().join("tone.wav"), &wav).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("pcm.dwarfs");
    build_image(
        input.path(),
        &image,
        &BuildConfig {
            categorize: vec!["pcmaudio".to_owned()],
            ..BuildConfig::default()
        },
    );

    let fs = open(&image);
    let inode = fs.find_path("tone.wav").unwrap();

    // Three fragments: 44 B header, 44100*2*2 B waveform, empty trailer.
    let info = fs.inodeinfo(inode).unwrap();
    let chunks = info["chunks"].as_array().unwrap();
    let meta_cat = "pcmaudio/metadata";
    let wave_cat = "pcmaudio/waveform";

    let header_bytes: u64 = chunks
        .iter()
        .take_while(|c| c["category"] == meta_cat)
        .map(|c| c["size"].as_u64().unwrap())
        .sum();
    assert_eq!(header_bytes, 44);

    let wave_bytes: u64 = chunks
        .iter()
        .filter(|c| c["category"] == wave_cat)
        .map(|c| c["size"].as_u64().unwrap())
        .sum();
    assert_eq!(wave_bytes, 44100 * 2 * 2);

    // Granularity: waveform chunk offsets/sizes are frame multiples.
    for c in chunks.iter().filter(|c| c["category"] == wave_cat) {
        assert_eq!(c["offset"].as_u64().unwrap() % 4, 0);
        assert_eq!(c["size"].as_u64().unwrap() % 4, 0);
    }

    assert_eq!(fs.read(inode, wav.len() as u64, 0).unwrap(), wav);
}

#[test]
fn corrupt_metadata_is_detected_on_open() {
    let input = TempDir::new().unwrap();
    fs::write(input.path().join("x"), b"some contents").unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("corrupt.dwarfs");
    build_image(input.path(), &image, &BuildConfig::default());

    // Flip one bit inside the METADATA_V2 payload.
    let mut f = fs::OpenOptions::new().read(true).write(true).open(&image).unwrap();
    let sections = scan_sections(&mut f, 0).unwrap();
    let md = sections
        .iter()
        .find(|s| s.header.section_type == SectionType::MetadataV2)
        .unwrap();
    let target = md.payload_offset() + md.header.length / 2;
    let mut byte = [0u8; 1];
    f.seek(SeekFrom::Start(target)).unwrap();
    f.read_exact(&mut byte).unwrap();
    byte[0] ^= 0x10;
    f.seek(SeekFrom::Start(target)).unwrap();
    f.write_all(&byte).unwrap();
    f.sync_all().unwrap();

    match Filesystem::open(&image, FilesystemOptions::default()).err() {
        Some(Error::CorruptImage(_)) => {}
        other => panic!("expected CorruptImage, got {other:?}"),
    }
}

#[test]
fn round_trip_structure_and_contents() {
    let input = TempDir::new().unwrap();
    fs::create_dir_all(input.path().join("sub/deep")).unwrap();
    fs::write(input.path().join("top.txt"), b"top").unwrap();
    fs::write(input.path().join("sub/mid.bin"), random_bytes(9, 4096)).unwrap();
    fs::write(input.path().join("sub/deep/empty"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("../top.txt", input.path().join("sub/link")).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("tree.dwarfs");
    build_image(input.path(), &image, &BuildConfig::default());

    let fs = open(&image);

    let root_entries = fs.readdir(fs.root_inode()).unwrap();
    let names: Vec<&str> = root_entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["sub", "top.txt"], "entries are name-sorted");

    let sub = fs.find_path("sub").unwrap();
    assert_eq!(fs.metadata().rank_of(sub), InodeRank::Directory);

    let mid = fs.find_path("sub/mid.bin").unwrap();
    assert_eq!(fs.read(mid, 4096, 0).unwrap(), random_bytes(9, 4096));

    let empty = fs.find_path("sub/deep/empty").unwrap();
    assert_eq!(fs.getattr(empty).unwrap().size, 0);
    assert!(fs.read(empty, 10, 0).unwrap().is_empty());

    #[cfg(unix)]
    {
        let link = fs.find_path("sub/link").unwrap();
        assert_eq!(fs.readlink(link).unwrap(), "../top.txt");
    }

    // Every lookup in a directory succeeds through binary search.
    for (name, inode) in &root_entries {
        assert_eq!(fs.lookup(fs.root_inode(), name), Some(*inode));
    }

    fs.check_integrity().unwrap();
}

#[test]
fn sparse_files_read_as_zeros() {
    let input = TempDir::new().unwrap();
    let mut data = random_bytes(11, 128 * 1024);
    data.extend_from_slice(&vec![0u8; 256 * 1024]);
    data.extend_from_slice(&random_bytes(12, 64 * 1024));
    fs::write(input.path().join("sparse.bin"), &data).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("sparse.dwarfs");
    build_image(
        input.path(),
        &image,
        &BuildConfig {
            scan: dwarfs::scanner::ScanOptions {
                detect_sparse_files: true,
                min_hole_size: 64 * 1024,
                ..Default::default()
            },
            ..BuildConfig::default()
        },
    );

    let fs = open(&image);
    let inode = fs.find_path("sparse.bin").unwrap();
    assert!(
        fs.metadata()
            .chunks_of(inode)
            .iter()
            .any(|c| c.block == HOLE_BLOCK),
        "zero run was not stored as a hole"
    );
    assert_eq!(fs.read(inode, data.len() as u64, 0).unwrap(), data);

    // A read entirely inside the hole.
    assert_eq!(
        fs.read(inode, 4096, 160 * 1024).unwrap(),
        vec![0u8; 4096]
    );
}

#[test]
fn concurrent_reads_agree() {
    let input = TempDir::new().unwrap();
    let data = random_bytes(21, 2 << 20);
    fs::write(input.path().join("big.bin"), &data).unwrap();

    let out = TempDir::new().unwrap();
    let image = out.path().join("conc.dwarfs");
    build_image(
        input.path(),
        &image,
        &BuildConfig {
            block_size_bits: 18,
            ..BuildConfig::default()
        },
    );

    let fs = Arc::new(open(&image));
    let inode = fs.find_path("big.bin").unwrap();
    let data = Arc::new(data);

    let mut handles = Vec::new();
    for t in 0..8 {
        let fs = Arc::clone(&fs);
        let data = Arc::clone(&data);
        handles.push(std::thread::spawn(move || {
            let offset = (t % 4) * (256 << 10);
            let got = fs.read(inode, 512 << 10, offset as u64).unwrap();
            assert_eq!(&got[..], &data[offset..offset + (512 << 10)]);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn history_records_survive() {
    let input = TempDir::new().unwrap();
    fs::write(input.path().join("f"), b"x").unwrap();
    let out = TempDir::new().unwrap();
    let image = out.path().join("hist.dwarfs");
    build_image(input.path(), &image, &BuildConfig::default());

    let fs = open(&image);
    let history = fs.history().expect("image carries a history section");
    assert_eq!(history.records.len(), 1);
    assert!(!history.records[0].tool_version.is_empty());
}
