//! Frozen metadata: the tables that describe the directory tree, inodes
//! and chunk lists of an image.
//!
//! The on-disk representation is split over two sections:
//!
//! - `METADATA_V2_SCHEMA` — a JSON descriptor: table offsets/row counts
//!   inside the data section, packing flags, time base/resolution, rank
//!   counts, and a feature list.  A reader MUST refuse an image whose
//!   schema lists a feature it does not know.
//! - `METADATA_V2` — the packed little-endian tables themselves,
//!   concatenated in schema order.
//!
//! # Inode layout
//! Inodes are grouped by rank: `directory, symlink, regular, device,
//! other`.  The rank of an inode follows from the rank counts (and is
//! recoverable from its mode), so rank boundaries can be binary-searched.
//! Regular inodes map through `shared_files_table` to a *unique content*
//! slot; `chunk_table` holds prefix sums from unique slot to chunk range.
//! Sparse holes are chunks with the block sentinel [`HOLE_BLOCK`].
//!
//! # Packing
//! Boolean options (all recorded in the schema): `packed_chunk_table`
//! (varint deltas), `packed_directories` (varint with delta-coded
//! `first_entry`), `packed_shared_files_table` (run lengths of the
//! multi-reference groups, stored as `count - 2`), `packed_names` /
//! `packed_symlinks` (shared string buffer + varint length index).
//! `force_pack_string_tables` combined with `plain_names_table` /
//! `plain_symlinks_table` for the same table is a configuration error.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::categorizer::CategorizerManager;
use crate::entry::{EntryKind, EntryTree, InodeRank};
use crate::error::{Error, Result};
use crate::inode::{InodeLayout, InodeManager};
use crate::segmenter::BlockManager;

/// Block-number sentinel marking a hole chunk; its `size` bytes read as
/// zeros and occupy no block storage.
pub const HOLE_BLOCK: u32 = u32::MAX;

/// Schema features understood by this build.  An image listing anything
/// else is rejected with `SchemaFeatureUnsupported`.
pub const SUPPORTED_FEATURES: &[&str] = &["holes", "categories"];

// ── Table row types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub block: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryRow {
    pub parent_inode: u32,
    pub first_entry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRow {
    pub mode_index: u32,
    pub owner_index: u32,
    pub group_index: u32,
    pub atime_offset: u64,
    pub mtime_offset: u64,
    pub ctime_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryRow {
    pub name_index: u32,
    pub inode: u32,
}

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataOptions {
    pub packed_chunk_table: bool,
    pub packed_directories: bool,
    pub packed_shared_files_table: bool,
    pub packed_names: bool,
    pub packed_symlinks: bool,
    pub force_pack_string_tables: bool,
    pub plain_names_table: bool,
    pub plain_symlinks_table: bool,
    pub mtime_only: bool,
    pub time_resolution_sec: u32,
    /// Write the advisory per-unique-content size cache.
    pub inode_size_cache: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        MetadataOptions {
            packed_chunk_table: true,
            packed_directories: true,
            packed_shared_files_table: true,
            packed_names: true,
            packed_symlinks: true,
            force_pack_string_tables: false,
            plain_names_table: false,
            plain_symlinks_table: false,
            mtime_only: true,
            time_resolution_sec: 1,
            inode_size_cache: true,
        }
    }
}

impl MetadataOptions {
    pub fn validate(&self) -> Result<()> {
        if self.force_pack_string_tables && (self.plain_names_table || self.plain_symlinks_table)
        {
            return Err(Error::Config(
                "force_pack_string_tables cannot be combined with a plain table option \
                 for the same table"
                    .into(),
            ));
        }
        if self.time_resolution_sec == 0 {
            return Err(Error::Config("time resolution must be non-zero".into()));
        }
        Ok(())
    }

    fn names_packed(&self) -> bool {
        (self.packed_names || self.force_pack_string_tables) && !self.plain_names_table
    }

    fn symlinks_packed(&self) -> bool {
        (self.packed_symlinks || self.force_pack_string_tables) && !self.plain_symlinks_table
    }
}

// ── Rank counts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RankCounts {
    pub dirs: u32,
    pub symlinks: u32,
    pub regular: u32,
    pub devices: u32,
    pub others: u32,
    pub unique: u32,
    pub blocks: u32,
}

impl RankCounts {
    pub fn inode_count(&self) -> u32 {
        self.dirs + self.symlinks + self.regular + self.devices + self.others
    }

    pub fn rank_of(&self, inode: u32) -> InodeRank {
        let d = self.dirs;
        let s = d + self.symlinks;
        let r = s + self.regular;
        let v = r + self.devices;
        if inode < d {
            InodeRank::Directory
        } else if inode < s {
            InodeRank::Symlink
        } else if inode < r {
            InodeRank::Regular
        } else if inode < v {
            InodeRank::Device
        } else {
            InodeRank::Other
        }
    }
}

// ── Decoded metadata ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Metadata {
    pub directories: Vec<DirectoryRow>,
    pub inodes: Vec<InodeRow>,
    pub dir_entries: Vec<DirEntryRow>,
    pub chunks: Vec<Chunk>,
    pub chunk_table: Vec<u32>,
    pub symlink_table: Vec<u32>,
    pub shared_files_table: Vec<u32>,
    pub devices: Vec<u64>,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub modes: Vec<u32>,
    pub names: Vec<String>,
    pub symlinks: Vec<String>,
    pub category_names: Vec<String>,
    /// Category id per physical block.
    pub block_categories: Vec<u32>,
    /// Advisory; rebuilt on demand when absent.
    pub reg_file_size_cache: Option<Vec<u64>>,
    pub timestamp_base: u64,
    pub time_resolution_sec: u32,
    pub mtime_only: bool,
    pub counts: RankCounts,
    pub options: MetadataOptions,
}

impl Metadata {
    // ── Inode accessors ─────────────────────────────────────────────────────

    pub fn inode_count(&self) -> u32 {
        self.counts.inode_count()
    }

    pub fn rank_of(&self, inode: u32) -> InodeRank {
        self.counts.rank_of(inode)
    }

    pub fn mode(&self, inode: u32) -> u32 {
        self.modes[self.inodes[inode as usize].mode_index as usize]
    }

    pub fn uid(&self, inode: u32) -> u32 {
        self.uids[self.inodes[inode as usize].owner_index as usize]
    }

    pub fn gid(&self, inode: u32) -> u32 {
        self.gids[self.inodes[inode as usize].group_index as usize]
    }

    pub fn times(&self, inode: u32) -> (u64, u64, u64) {
        let row = &self.inodes[inode as usize];
        let res = self.time_resolution_sec as u64;
        let decode = |off: u64| (self.timestamp_base + off) * res;
        if self.mtime_only {
            let m = decode(row.mtime_offset);
            (m, m, m)
        } else {
            (
                decode(row.atime_offset),
                decode(row.mtime_offset),
                decode(row.ctime_offset),
            )
        }
    }

    /// Unique-content slot of a regular inode.
    pub fn unique_of(&self, inode: u32) -> u32 {
        debug_assert_eq!(self.rank_of(inode), InodeRank::Regular);
        let pos = inode - self.counts.dirs - self.counts.symlinks;
        self.shared_files_table[pos as usize]
    }

    pub fn chunks_of(&self, inode: u32) -> &[Chunk] {
        let u = self.unique_of(inode) as usize;
        let lo = self.chunk_table[u] as usize;
        let hi = self.chunk_table[u + 1] as usize;
        &self.chunks[lo..hi]
    }

    /// Regular file size: size cache when present, chunk sum otherwise.
    pub fn file_size(&self, inode: u32) -> u64 {
        let u = self.unique_of(inode);
        if let Some(cache) = &self.reg_file_size_cache {
            if let Some(&sz) = cache.get(u as usize) {
                return sz;
            }
        }
        self.chunks_of(inode).iter().map(|c| c.size as u64).sum()
    }

    pub fn symlink_target(&self, inode: u32) -> &str {
        debug_assert_eq!(self.rank_of(inode), InodeRank::Symlink);
        let pos = (inode - self.counts.dirs) as usize;
        &self.symlinks[self.symlink_table[pos] as usize]
    }

    pub fn device_rdev(&self, inode: u32) -> u64 {
        let pos = (inode - self.counts.dirs - self.counts.symlinks - self.counts.regular)
            as usize;
        self.devices[pos]
    }

    // ── Directory accessors ─────────────────────────────────────────────────

    /// Dirent range of a directory inode.
    pub fn dir_entry_range(&self, inode: u32) -> std::ops::Range<usize> {
        debug_assert_eq!(self.rank_of(inode), InodeRank::Directory);
        let d = inode as usize;
        self.directories[d].first_entry as usize..self.directories[d + 1].first_entry as usize
    }

    pub fn dir_parent(&self, inode: u32) -> u32 {
        self.directories[inode as usize].parent_inode
    }

    /// Binary search a name inside a directory; entries are name-sorted.
    pub fn lookup(&self, dir_inode: u32, name: &str) -> Option<u32> {
        let range = self.dir_entry_range(dir_inode);
        let entries = &self.dir_entries[range];
        entries
            .binary_search_by(|e| self.names[e.name_index as usize].as_str().cmp(name))
            .ok()
            .map(|i| entries[i].inode)
    }

    pub fn entry_name(&self, e: &DirEntryRow) -> &str {
        &self.names[e.name_index as usize]
    }

    /// Total link count of an inode (number of dirents referencing it,
    /// plus subdirectories' `..` for directories).
    pub fn nlink(&self, inode: u32) -> u32 {
        match self.rank_of(inode) {
            InodeRank::Directory => {
                let subdirs = self
                    .dir_entry_range(inode)
                    .filter(|&i| self.rank_of(self.dir_entries[i].inode) == InodeRank::Directory)
                    .count() as u32;
                2 + subdirs
            }
            _ => self
                .dir_entries
                .iter()
                .filter(|e| e.inode == inode)
                .count()
                .max(1) as u32,
        }
    }

    /// Total bytes of all unique file contents, holes included.
    pub fn total_file_bytes(&self) -> u64 {
        (0..self.counts.unique as usize)
            .map(|u| {
                let lo = self.chunk_table[u] as usize;
                let hi = self.chunk_table[u + 1] as usize;
                self.chunks[lo..hi].iter().map(|c| c.size as u64).sum::<u64>()
            })
            .sum()
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Chunk lists per unique content, accumulated during segmentation with
/// logical block numbers.
#[derive(Debug, Default, Clone)]
pub struct ChunkStore {
    /// unique slot → fragment index → chunks.
    per_unique: Vec<Vec<Vec<Chunk>>>,
}

impl ChunkStore {
    pub fn new(unique_count: usize, fragment_counts: impl Fn(usize) -> usize) -> Self {
        ChunkStore {
            per_unique: (0..unique_count)
                .map(|u| vec![Vec::new(); fragment_counts(u)])
                .collect(),
        }
    }

    pub fn sink(&mut self, unique: u32, fragment_index: u32) -> &mut Vec<Chunk> {
        &mut self.per_unique[unique as usize][fragment_index as usize]
    }

    /// Concatenate fragments in file order, remapping logical → physical
    /// block numbers.
    pub fn assemble(&self, block_mgr: &BlockManager) -> (Vec<Chunk>, Vec<u32>) {
        let mut chunks = Vec::new();
        let mut chunk_table = Vec::with_capacity(self.per_unique.len() + 1);
        chunk_table.push(0u32);
        for frags in &self.per_unique {
            for frag_chunks in frags {
                for c in frag_chunks {
                    let block = if c.block == HOLE_BLOCK {
                        HOLE_BLOCK
                    } else {
                        block_mgr.physical_of(c.block)
                    };
                    chunks.push(Chunk { block, ..*c });
                }
            }
            chunk_table.push(chunks.len() as u32);
        }
        (chunks, chunk_table)
    }
}

/// Build the metadata tables from the finished scan/segmentation state.
pub fn build_metadata(
    tree: &EntryTree,
    inode_mgr: &InodeManager,
    layout: &InodeLayout,
    chunk_store: &ChunkStore,
    block_mgr: &BlockManager,
    block_categories: Vec<u32>,
    categorizers: &CategorizerManager,
    options: MetadataOptions,
) -> Result<Metadata> {
    options.validate()?;

    let mut md = Metadata {
        options: options.clone(),
        mtime_only: options.mtime_only,
        time_resolution_sec: options.time_resolution_sec,
        ..Default::default()
    };

    md.counts = RankCounts {
        dirs: layout.dir_inodes.len() as u32,
        symlinks: layout.symlink_inodes.len() as u32,
        regular: layout.regular_inodes.len() as u32,
        devices: layout.device_inodes.len() as u32,
        others: layout.other_inodes.len() as u32,
        unique: inode_mgr.unique_reps.len() as u32,
        blocks: block_mgr.block_count(),
    };

    // Value tables: dedup uid/gid/mode.
    let mut uid_ix: HashMap<u32, u32> = HashMap::new();
    let mut gid_ix: HashMap<u32, u32> = HashMap::new();
    let mut mode_ix: HashMap<u32, u32> = HashMap::new();
    let mut intern =
        |map: &mut HashMap<u32, u32>, table: &mut Vec<u32>, v: u32| -> u32 {
            *map.entry(v).or_insert_with(|| {
                table.push(v);
                (table.len() - 1) as u32
            })
        };

    // Time base: minimum timestamp over all entries, in resolution units.
    let res = options.time_resolution_sec as u64;
    let mut base = u64::MAX;
    for e in &tree.entries {
        base = base.min(e.mtime / res);
        if !options.mtime_only {
            base = base.min(e.atime / res).min(e.ctime / res);
        }
    }
    if base == u64::MAX {
        base = 0;
    }
    md.timestamp_base = base;

    // Inode rows in rank order.
    let mut inode_entries: Vec<Option<u32>> = vec![None; md.counts.inode_count() as usize];
    for (id, e) in tree.entries.iter().enumerate() {
        let inode = match &e.kind {
            EntryKind::File { data } => {
                layout.rank_offset(InodeRank::Regular)
                    + tree.file(*data).inode.expect("inode assigned")
            }
            _ => layout.entry_inode[&(id as u32)],
        };
        // First entry wins; hardlinks share stat data anyway.
        if inode_entries[inode as usize].is_none() {
            inode_entries[inode as usize] = Some(id as u32);
        }
    }

    for entry_id in inode_entries.iter() {
        let e = tree.entry(crate::entry::EntryId(entry_id.expect("every inode has an entry")));
        md.inodes.push(InodeRow {
            mode_index: intern(&mut mode_ix, &mut md.modes, e.mode),
            owner_index: intern(&mut uid_ix, &mut md.uids, e.uid),
            group_index: intern(&mut gid_ix, &mut md.gids, e.gid),
            atime_offset: e.atime / res - base,
            mtime_offset: e.mtime / res - base,
            ctime_offset: e.ctime / res - base,
        });
    }

    // Directory table + dirents, in directory-inode order.
    let mut name_ix: HashMap<String, u32> = HashMap::new();
    for &dir_id in &layout.dir_inodes {
        md.directories.push(DirectoryRow {
            parent_inode: tree
                .entry(dir_id)
                .parent
                .map(|p| layout.entry_inode[&p.0])
                .unwrap_or(0),
            first_entry: md.dir_entries.len() as u32,
        });

        let EntryKind::Directory { children } = &tree.entry(dir_id).kind else {
            unreachable!("directory rank holds only directories");
        };
        for &child in children {
            let ce = tree.entry(child);
            let name_index = *name_ix.entry(ce.name.clone()).or_insert_with(|| {
                md.names.push(ce.name.clone());
                (md.names.len() - 1) as u32
            });
            md.dir_entries.push(DirEntryRow {
                name_index,
                inode: layout.inode_of(tree, child),
            });
        }
    }
    md.directories.push(DirectoryRow {
        parent_inode: 0,
        first_entry: md.dir_entries.len() as u32,
    });

    // Symlink targets, deduplicated.
    let mut sym_ix: HashMap<String, u32> = HashMap::new();
    for &id in &layout.symlink_inodes {
        let EntryKind::Symlink { target } = &tree.entry(id).kind else {
            unreachable!("symlink rank holds only symlinks");
        };
        let ix = *sym_ix.entry(target.clone()).or_insert_with(|| {
            md.symlinks.push(target.clone());
            (md.symlinks.len() - 1) as u32
        });
        md.symlink_table.push(ix);
    }

    // Devices.
    for &id in &layout.device_inodes {
        let EntryKind::Device { rdev } = tree.entry(id).kind else {
            unreachable!("device rank holds only devices");
        };
        md.devices.push(rdev);
    }

    md.shared_files_table = inode_mgr.shared_files_of(layout);

    let (chunks, chunk_table) = chunk_store.assemble(block_mgr);
    md.chunks = chunks;
    md.chunk_table = chunk_table;

    md.category_names = categorizers.category_names().map(str::to_owned).collect();
    md.block_categories = block_categories;

    if options.inode_size_cache {
        md.reg_file_size_cache = Some(
            inode_mgr
                .unique_reps
                .iter()
                .map(|&fid| tree.file(fid).size)
                .collect(),
        );
    }

    Ok(md)
}

// ── Varint helpers ───────────────────────────────────────────────────────────

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let b = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(b);
            break;
        }
        out.push(b | 0x80);
    }
}

fn get_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let b = *data
            .get(*pos)
            .ok_or_else(|| Error::CorruptImage("varint runs past table end".into()))?;
        *pos += 1;
        v |= ((b & 0x7F) as u64) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptImage("varint too long".into()));
        }
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct TableDesc {
    offset: usize,
    len: usize,
    count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaDoc {
    version: u32,
    features: Vec<String>,
    counts: RankCounts,
    time_base: u64,
    time_resolution_sec: u32,
    mtime_only: bool,
    options: MetadataOptions,
    tables: HashMap<String, TableDesc>,
}

struct TableWriter {
    buf: Vec<u8>,
    tables: HashMap<String, TableDesc>,
}

impl TableWriter {
    fn add(&mut self, name: &str, count: usize, body: Vec<u8>) {
        self.tables.insert(
            name.to_owned(),
            TableDesc {
                offset: self.buf.len(),
                len: body.len(),
                count,
            },
        );
        self.buf.extend_from_slice(&body);
    }
}

fn encode_u32s(vals: impl Iterator<Item = u32>) -> Vec<u8> {
    let mut out = Vec::new();
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn encode_u64s(vals: impl Iterator<Item = u64>) -> Vec<u8> {
    let mut out = Vec::new();
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn encode_string_table(strings: &[String], packed: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if packed {
        // Varint length index, then one shared buffer.
        for s in strings {
            put_varint(&mut out, s.len() as u64);
        }
        for s in strings {
            out.extend_from_slice(s.as_bytes());
        }
    } else {
        for s in strings {
            put_varint(&mut out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
    }
    out
}

fn decode_string_table(data: &[u8], count: usize, packed: bool) -> Result<Vec<String>> {
    let mut pos = 0usize;
    let mut out = Vec::with_capacity(count);
    if packed {
        let mut lens = Vec::with_capacity(count);
        for _ in 0..count {
            lens.push(get_varint(data, &mut pos)? as usize);
        }
        for len in lens {
            let s = data
                .get(pos..pos + len)
                .ok_or_else(|| Error::CorruptImage("string table truncated".into()))?;
            out.push(String::from_utf8_lossy(s).into_owned());
            pos += len;
        }
    } else {
        for _ in 0..count {
            let len = get_varint(data, &mut pos)? as usize;
            let s = data
                .get(pos..pos + len)
                .ok_or_else(|| Error::CorruptImage("string table truncated".into()))?;
            out.push(String::from_utf8_lossy(s).into_owned());
            pos += len;
        }
    }
    Ok(out)
}

/// Serialize metadata into `(schema_json, table_bytes)`.
pub fn encode_metadata(md: &Metadata) -> Result<(Vec<u8>, Vec<u8>)> {
    let opts = &md.options;
    let mut w = TableWriter {
        buf: Vec::new(),
        tables: HashMap::new(),
    };

    // directories
    if opts.packed_directories {
        let mut body = Vec::new();
        let mut prev_first = 0u32;
        for row in &md.directories {
            put_varint(&mut body, row.parent_inode as u64);
            put_varint(&mut body, (row.first_entry - prev_first) as u64);
            prev_first = row.first_entry;
        }
        w.add("directories", md.directories.len(), body);
    } else {
        let mut body = Vec::new();
        for row in &md.directories {
            body.extend_from_slice(&row.parent_inode.to_le_bytes());
            body.extend_from_slice(&row.first_entry.to_le_bytes());
        }
        w.add("directories", md.directories.len(), body);
    }

    // inodes
    {
        let mut body = Vec::new();
        for row in &md.inodes {
            body.extend_from_slice(&row.mode_index.to_le_bytes());
            body.extend_from_slice(&row.owner_index.to_le_bytes());
            body.extend_from_slice(&row.group_index.to_le_bytes());
            body.extend_from_slice(&row.atime_offset.to_le_bytes());
            body.extend_from_slice(&row.mtime_offset.to_le_bytes());
            body.extend_from_slice(&row.ctime_offset.to_le_bytes());
        }
        w.add("inodes", md.inodes.len(), body);
    }

    // dir_entries
    {
        let mut body = Vec::new();
        for e in &md.dir_entries {
            body.extend_from_slice(&e.name_index.to_le_bytes());
            body.extend_from_slice(&e.inode.to_le_bytes());
        }
        w.add("dir_entries", md.dir_entries.len(), body);
    }

    // chunks
    {
        let mut body = Vec::new();
        for c in &md.chunks {
            body.extend_from_slice(&c.block.to_le_bytes());
            body.extend_from_slice(&c.offset.to_le_bytes());
            body.extend_from_slice(&c.size.to_le_bytes());
        }
        w.add("chunks", md.chunks.len(), body);
    }

    // chunk_table
    if opts.packed_chunk_table {
        let mut body = Vec::new();
        let mut prev = 0u32;
        for &v in &md.chunk_table {
            put_varint(&mut body, (v - prev) as u64);
            prev = v;
        }
        w.add("chunk_table", md.chunk_table.len(), body);
    } else {
        w.add(
            "chunk_table",
            md.chunk_table.len(),
            encode_u32s(md.chunk_table.iter().copied()),
        );
    }

    // shared_files_table
    if opts.packed_shared_files_table {
        // The table is non-decreasing with the multi-reference groups in
        // front; runs of length >= 2 are stored as `count - 2`.
        let mut body = Vec::new();
        let mut shared_groups = 0u64;
        let mut i = 0usize;
        while i < md.shared_files_table.len() {
            let v = md.shared_files_table[i];
            let mut j = i;
            while j < md.shared_files_table.len() && md.shared_files_table[j] == v {
                j += 1;
            }
            let run = j - i;
            if run < 2 {
                break;
            }
            put_varint(&mut body, (run - 2) as u64);
            shared_groups += 1;
            i = j;
        }
        let mut framed = Vec::new();
        put_varint(&mut framed, shared_groups);
        framed.extend_from_slice(&body);
        w.add("shared_files_table", md.shared_files_table.len(), framed);
    } else {
        w.add(
            "shared_files_table",
            md.shared_files_table.len(),
            encode_u32s(md.shared_files_table.iter().copied()),
        );
    }

    w.add(
        "symlink_table",
        md.symlink_table.len(),
        encode_u32s(md.symlink_table.iter().copied()),
    );
    w.add("devices", md.devices.len(), encode_u64s(md.devices.iter().copied()));
    w.add("uids", md.uids.len(), encode_u32s(md.uids.iter().copied()));
    w.add("gids", md.gids.len(), encode_u32s(md.gids.iter().copied()));
    w.add("modes", md.modes.len(), encode_u32s(md.modes.iter().copied()));

    w.add(
        "names",
        md.names.len(),
        encode_string_table(&md.names, opts.names_packed()),
    );
    w.add(
        "symlinks",
        md.symlinks.len(),
        encode_string_table(&md.symlinks, opts.symlinks_packed()),
    );
    w.add(
        "category_names",
        md.category_names.len(),
        encode_string_table(&md.category_names, false),
    );
    w.add(
        "block_categories",
        md.block_categories.len(),
        encode_u32s(md.block_categories.iter().copied()),
    );

    if let Some(cache) = &md.reg_file_size_cache {
        w.add(
            "reg_file_size_cache",
            cache.len(),
            encode_u64s(cache.iter().copied()),
        );
    }

    let mut features = vec!["categories".to_owned()];
    if md.chunks.iter().any(|c| c.block == HOLE_BLOCK) {
        features.push("holes".to_owned());
    }

    let schema = SchemaDoc {
        version: 1,
        features,
        counts: md.counts,
        time_base: md.timestamp_base,
        time_resolution_sec: md.time_resolution_sec,
        mtime_only: md.mtime_only,
        options: md.options.clone(),
        tables: w.tables,
    };

    let schema_bytes = serde_json::to_vec(&schema)
        .map_err(|e| Error::CorruptImage(format!("schema serialization failed: {e}")))?;
    Ok((schema_bytes, w.buf))
}

// ── Decoding ─────────────────────────────────────────────────────────────────

fn table<'d>(data: &'d [u8], schema: &SchemaDoc, name: &str) -> Result<(&'d [u8], usize)> {
    let desc = schema
        .tables
        .get(name)
        .ok_or_else(|| Error::CorruptImage(format!("metadata table '{name}' is missing")))?;
    let body = data
        .get(desc.offset..desc.offset + desc.len)
        .ok_or_else(|| Error::CorruptImage(format!("metadata table '{name}' out of bounds")))?;
    Ok((body, desc.count))
}

fn decode_u32s(body: &[u8], count: usize) -> Result<Vec<u32>> {
    if body.len() != count * 4 {
        return Err(Error::CorruptImage("u32 table length mismatch".into()));
    }
    Ok(body.chunks_exact(4).map(LittleEndian::read_u32).collect())
}

fn decode_u64s(body: &[u8], count: usize) -> Result<Vec<u64>> {
    if body.len() != count * 8 {
        return Err(Error::CorruptImage("u64 table length mismatch".into()));
    }
    Ok(body.chunks_exact(8).map(LittleEndian::read_u64).collect())
}

/// Parse the schema document and decode the metadata tables.
pub fn decode_metadata(schema_bytes: &[u8], data: &[u8]) -> Result<Metadata> {
    let schema: SchemaDoc = serde_json::from_slice(schema_bytes)
        .map_err(|e| Error::CorruptImage(format!("bad metadata schema: {e}")))?;

    if schema.version != 1 {
        return Err(Error::SchemaFeatureUnsupported(format!(
            "metadata schema version {}",
            schema.version
        )));
    }
    for f in &schema.features {
        if !SUPPORTED_FEATURES.contains(&f.as_str()) {
            return Err(Error::SchemaFeatureUnsupported(f.clone()));
        }
    }

    let opts = schema.options.clone();
    let mut md = Metadata {
        counts: schema.counts,
        timestamp_base: schema.time_base,
        time_resolution_sec: schema.time_resolution_sec,
        mtime_only: schema.mtime_only,
        ..Default::default()
    };

    // directories
    {
        let (body, count) = table(data, &schema, "directories")?;
        if opts.packed_directories {
            let mut pos = 0usize;
            let mut first = 0u32;
            for _ in 0..count {
                let parent = get_varint(body, &mut pos)? as u32;
                first += get_varint(body, &mut pos)? as u32;
                md.directories.push(DirectoryRow {
                    parent_inode: parent,
                    first_entry: first,
                });
            }
        } else {
            if body.len() != count * 8 {
                return Err(Error::CorruptImage("directories table length mismatch".into()));
            }
            for row in body.chunks_exact(8) {
                md.directories.push(DirectoryRow {
                    parent_inode: LittleEndian::read_u32(&row[0..4]),
                    first_entry: LittleEndian::read_u32(&row[4..8]),
                });
            }
        }
    }

    // inodes
    {
        let (body, count) = table(data, &schema, "inodes")?;
        if body.len() != count * 36 {
            return Err(Error::CorruptImage("inodes table length mismatch".into()));
        }
        for row in body.chunks_exact(36) {
            md.inodes.push(InodeRow {
                mode_index: LittleEndian::read_u32(&row[0..4]),
                owner_index: LittleEndian::read_u32(&row[4..8]),
                group_index: LittleEndian::read_u32(&row[8..12]),
                atime_offset: LittleEndian::read_u64(&row[12..20]),
                mtime_offset: LittleEndian::read_u64(&row[20..28]),
                ctime_offset: LittleEndian::read_u64(&row[28..36]),
            });
        }
    }

    // dir_entries
    {
        let (body, count) = table(data, &schema, "dir_entries")?;
        if body.len() != count * 8 {
            return Err(Error::CorruptImage("dir_entries table length mismatch".into()));
        }
        for row in body.chunks_exact(8) {
            md.dir_entries.push(DirEntryRow {
                name_index: LittleEndian::read_u32(&row[0..4]),
                inode: LittleEndian::read_u32(&row[4..8]),
            });
        }
    }

    // chunks
    {
        let (body, count) = table(data, &schema, "chunks")?;
        if body.len() != count * 12 {
            return Err(Error::CorruptImage("chunks table length mismatch".into()));
        }
        for row in body.chunks_exact(12) {
            md.chunks.push(Chunk {
                block: LittleEndian::read_u32(&row[0..4]),
                offset: LittleEndian::read_u32(&row[4..8]),
                size: LittleEndian::read_u32(&row[8..12]),
            });
        }
    }

    // chunk_table
    {
        let (body, count) = table(data, &schema, "chunk_table")?;
        if opts.packed_chunk_table {
            let mut pos = 0usize;
            let mut acc = 0u32;
            for _ in 0..count {
                acc += get_varint(body, &mut pos)? as u32;
                md.chunk_table.push(acc);
            }
        } else {
            md.chunk_table = decode_u32s(body, count)?;
        }
    }

    // shared_files_table
    {
        let (body, count) = table(data, &schema, "shared_files_table")?;
        if opts.packed_shared_files_table {
            let mut pos = 0usize;
            let groups = get_varint(body, &mut pos)?;
            let mut out = Vec::with_capacity(count);
            let mut unique = 0u32;
            for _ in 0..groups {
                let run = get_varint(body, &mut pos)? as usize + 2;
                out.extend(std::iter::repeat(unique).take(run));
                unique += 1;
            }
            while out.len() < count {
                out.push(unique);
                unique += 1;
            }
            if out.len() != count {
                return Err(Error::CorruptImage(
                    "shared_files_table run lengths exceed file count".into(),
                ));
            }
            md.shared_files_table = out;
        } else {
            md.shared_files_table = decode_u32s(body, count)?;
        }
    }

    {
        let (body, count) = table(data, &schema, "symlink_table")?;
        md.symlink_table = decode_u32s(body, count)?;
    }
    {
        let (body, count) = table(data, &schema, "devices")?;
        md.devices = decode_u64s(body, count)?;
    }
    {
        let (body, count) = table(data, &schema, "uids")?;
        md.uids = decode_u32s(body, count)?;
    }
    {
        let (body, count) = table(data, &schema, "gids")?;
        md.gids = decode_u32s(body, count)?;
    }
    {
        let (body, count) = table(data, &schema, "modes")?;
        md.modes = decode_u32s(body, count)?;
    }
    {
        let (body, count) = table(data, &schema, "names")?;
        md.names = decode_string_table(body, count, opts.names_packed())?;
    }
    {
        let (body, count) = table(data, &schema, "symlinks")?;
        md.symlinks = decode_string_table(body, count, opts.symlinks_packed())?;
    }
    {
        let (body, count) = table(data, &schema, "category_names")?;
        md.category_names = decode_string_table(body, count, false)?;
    }
    {
        let (body, count) = table(data, &schema, "block_categories")?;
        md.block_categories = decode_u32s(body, count)?;
    }
    if schema.tables.contains_key("reg_file_size_cache") {
        let (body, count) = table(data, &schema, "reg_file_size_cache")?;
        md.reg_file_size_cache = Some(decode_u64s(body, count)?);
    }

    md.options = opts;

    // Structural sanity: the chunk table must cover every unique slot.
    if md.chunk_table.len() != md.counts.unique as usize + 1 {
        return Err(Error::CorruptImage("chunk table does not match unique count".into()));
    }
    if md.directories.len() != md.counts.dirs as usize + 1 {
        return Err(Error::CorruptImage("directory table does not match dir count".into()));
    }
    if md.inodes.len() != md.counts.inode_count() as usize {
        return Err(Error::CorruptImage("inode table does not match inode count".into()));
    }

    Ok(md)
}
