//! Frozen metadata: encode/decode round trips for all packing variants,
//! option validation, and schema feature gating.

mod common;

use dwarfs::error::Error;
use dwarfs::metadata::{
    decode_metadata, encode_metadata, Chunk, DirEntryRow, DirectoryRow, InodeRow, Metadata,
    MetadataOptions, RankCounts,
};
use dwarfs::section::{SectionHeader, SectionType};

/// A small filesystem: root with two files (one duplicated three times)
/// and a symlink.
fn sample_metadata(options: MetadataOptions) -> Metadata {
    let mtime_only = options.mtime_only;
    Metadata {
        directories: vec![
            DirectoryRow { parent_inode: 0, first_entry: 0 },
            DirectoryRow { parent_inode: 0, first_entry: 5 },
        ],
        inodes: (0..6)
            .map(|i| InodeRow {
                mode_index: if i == 0 { 0 } else { 1 },
                owner_index: 0,
                group_index: 0,
                atime_offset: i,
                mtime_offset: i,
                ctime_offset: i,
            })
            .collect(),
        // Sorted by name: dup-a, dup-b, dup-c, link, other.
        dir_entries: vec![
            DirEntryRow { name_index: 0, inode: 2 },
            DirEntryRow { name_index: 1, inode: 3 },
            DirEntryRow { name_index: 2, inode: 4 },
            DirEntryRow { name_index: 4, inode: 1 },
            DirEntryRow { name_index: 3, inode: 5 },
        ],
        chunks: vec![
            Chunk { block: 0, offset: 0, size: 1000 },
            Chunk { block: 0, offset: 1000, size: 24 },
        ],
        chunk_table: vec![0, 1, 2],
        symlink_table: vec![0],
        shared_files_table: vec![0, 0, 0, 1],
        devices: vec![],
        uids: vec![1000],
        gids: vec![100],
        modes: vec![0o040755, 0o100644],
        names: vec![
            "dup-a".into(),
            "dup-b".into(),
            "dup-c".into(),
            "other".into(),
            "link".into(),
        ],
        symlinks: vec!["dup-a".into()],
        category_names: vec!["<default>".into()],
        block_categories: vec![0],
        reg_file_size_cache: Some(vec![1000, 24]),
        timestamp_base: 1_600_000_000,
        time_resolution_sec: options.time_resolution_sec,
        mtime_only,
        counts: RankCounts {
            dirs: 1,
            symlinks: 1,
            regular: 4,
            devices: 0,
            others: 0,
            unique: 2,
            blocks: 1,
        },
        options,
    }
}

fn assert_same(a: &Metadata, b: &Metadata) {
    assert_eq!(a.directories, b.directories);
    assert_eq!(a.inodes, b.inodes);
    assert_eq!(a.dir_entries, b.dir_entries);
    assert_eq!(a.chunks, b.chunks);
    assert_eq!(a.chunk_table, b.chunk_table);
    assert_eq!(a.symlink_table, b.symlink_table);
    assert_eq!(a.shared_files_table, b.shared_files_table);
    assert_eq!(a.uids, b.uids);
    assert_eq!(a.gids, b.gids);
    assert_eq!(a.modes, b.modes);
    assert_eq!(a.names, b.names);
    assert_eq!(a.symlinks, b.symlinks);
    assert_eq!(a.category_names, b.category_names);
    assert_eq!(a.block_categories, b.block_categories);
    assert_eq!(a.reg_file_size_cache, b.reg_file_size_cache);
    assert_eq!(a.timestamp_base, b.timestamp_base);
}

#[test]
fn round_trip_packed() {
    let md = sample_metadata(MetadataOptions::default());
    let (schema, tables) = encode_metadata(&md).unwrap();
    let back = decode_metadata(&schema, &tables).unwrap();
    assert_same(&md, &back);
}

#[test]
fn round_trip_plain() {
    let md = sample_metadata(MetadataOptions {
        packed_chunk_table: false,
        packed_directories: false,
        packed_shared_files_table: false,
        packed_names: false,
        packed_symlinks: false,
        ..MetadataOptions::default()
    });
    let (schema, tables) = encode_metadata(&md).unwrap();
    let back = decode_metadata(&schema, &tables).unwrap();
    assert_same(&md, &back);
}

#[test]
fn accessors_resolve_the_sample() {
    let md = sample_metadata(MetadataOptions::default());

    // Ranks by inode number: dir 0, symlink 1, regular 2..6.
    assert_eq!(md.inode_count(), 6);
    assert_eq!(md.mode(0), 0o040755);
    assert_eq!(md.mode(2), 0o100644);

    // The three duplicates share unique slot 0 and its chunk range.
    assert_eq!(md.unique_of(2), 0);
    assert_eq!(md.unique_of(4), 0);
    assert_eq!(md.chunks_of(2), md.chunks_of(3));
    assert_eq!(md.file_size(2), 1000);
    assert_eq!(md.file_size(5), 24);

    assert_eq!(md.symlink_target(1), "dup-a");

    // Binary search over sorted names.
    assert_eq!(md.lookup(0, "dup-b"), Some(3));
    assert_eq!(md.lookup(0, "missing"), None);

    // Hardlink-style counting: three dirents reference inode 2? No —
    // each duplicate is its own inode with one dirent.
    assert_eq!(md.nlink(2), 1);

    // Times decode against the base.
    let (atime, mtime, ctime) = md.times(3);
    assert_eq!(mtime, 1_600_000_000 + 3);
    assert_eq!(atime, mtime);
    assert_eq!(ctime, mtime);
}

#[test]
fn size_cache_is_advisory() {
    let mut md = sample_metadata(MetadataOptions::default());
    md.reg_file_size_cache = None;
    // Falls back to summing the chunk list.
    assert_eq!(md.file_size(2), 1000);
    assert_eq!(md.file_size(5), 24);
}

#[test]
fn conflicting_string_table_options_are_rejected() {
    let opts = MetadataOptions {
        force_pack_string_tables: true,
        plain_names_table: true,
        ..MetadataOptions::default()
    };
    match opts.validate() {
        Err(Error::Config(_)) => {}
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn unknown_schema_features_are_rejected() {
    let md = sample_metadata(MetadataOptions::default());
    let (schema, tables) = encode_metadata(&md).unwrap();

    let mut doc: serde_json::Value = serde_json::from_slice(&schema).unwrap();
    doc["features"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!("time-travel"));
    let patched = serde_json::to_vec(&doc).unwrap();

    match decode_metadata(&patched, &tables) {
        Err(Error::SchemaFeatureUnsupported(f)) => assert_eq!(f, "time-travel"),
        other => panic!("expected SchemaFeatureUnsupported, got {other:?}"),
    }
}

// ── Section framing ──────────────────────────────────────────────────────────

#[test]
fn section_checksums_verify_and_detect_corruption() {
    let payload = b"some section payload bytes".to_vec();
    let header = SectionHeader::for_payload(3, SectionType::History, 2, &payload);

    header.verify_fast(&payload).unwrap();
    header.verify_full(&payload).unwrap();

    let mut corrupted = payload.clone();
    corrupted[5] ^= 0x80;
    assert!(header.verify_fast(&corrupted).is_err());

    // A header/payload length mismatch also fails.
    assert!(header.verify_fast(&payload[..10]).is_err());
}

#[test]
fn section_header_round_trips() {
    let payload = vec![7u8; 123];
    let header = SectionHeader::for_payload(0, SectionType::Block, 2, &payload);

    let mut buf = Vec::new();
    header.write(&mut buf).unwrap();
    assert_eq!(buf.len(), dwarfs::section::SECTION_HEADER_SIZE);

    let back = SectionHeader::read(&buf[..]).unwrap();
    assert_eq!(back, header);
}
