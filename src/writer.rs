//! Filesystem writer: drives per-category segmentation, merges the
//! resulting block streams into a single physical order, compresses
//! blocks on a worker pool, and frames everything into sections.
//!
//! # Pipeline
//!
//! ```text
//! segmenter workers ──► merger ──► compression pool ──► writer thread
//!   (one job per            (assigns physical              (single
//!    category stream,        block numbers,                 consumer,
//!    max_active_slots        bounded queue)                 reorders by
//!    at a time)                                             physical no)
//! ```
//!
//! The merger admits category streams in a fixed order and keeps at most
//! `max_active_slots` segmenter jobs running, so blocks of one category
//! are contiguous in the output and peak memory stays bounded.  The
//! writer thread buffers out-of-order compressed blocks in a sorted map
//! and appends strictly in physical order.
//!
//! After the data blocks: schema, metadata, optional history, and the
//! section index.  An optional raw header is preserved verbatim in front
//! of everything unless `remove_header` is set.

use crossbeam_channel::{bounded, unbounded};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Mutex};

use crate::categorizer::{CategorizerManager, FragmentCategory};
use crate::codec::{self, Codec, COMPRESSION_NONE};
use crate::entry::{EntryTree, Extent};
use crate::error::{Error, Result};
use crate::history::History;
use crate::inode::{FragmentRef, InodeManager, InodeLayout, OrderPolicy};
use crate::metadata::{
    self, build_metadata, Chunk, ChunkStore, MetadataOptions, HOLE_BLOCK,
};
use crate::progress::Progress;
use crate::section::{
    encode_section_index, RawSection, SectionHeader, SectionIndexEntry, SectionType,
    SECTION_HEADER_SIZE,
};
use crate::segmenter::{
    new_segmenter, BlockManager, ChunkSink, FragmentExtent, SegmenterConfig,
};

// ── Options ──────────────────────────────────────────────────────────────────

/// Per-category policies, resolved from the option stacks before writing.
pub struct CategoryWriterConfig {
    pub codec: Arc<dyn Codec>,
    pub segmenter: SegmenterConfig,
    pub order: OrderPolicy,
}

pub struct WriterOptions {
    pub num_workers: usize,
    pub max_active_slots: usize,
    /// Bound on in-flight uncompressed block bytes in the queues.
    pub max_queue_size: u64,
    pub no_section_index: bool,
    pub no_history: bool,
    /// Raw bytes prepended verbatim before the first section.
    pub header: Option<Vec<u8>>,
    pub schema_codec: Arc<dyn Codec>,
    pub metadata_codec: Arc<dyn Codec>,
    pub history_codec: Arc<dyn Codec>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            num_workers: num_cpus::get(),
            max_active_slots: 1,
            max_queue_size: 512 << 20,
            no_section_index: false,
            no_history: false,
            header: None,
            schema_codec: Arc::new(crate::codec::ZstdCodec { level: 9 }),
            metadata_codec: Arc::new(crate::codec::NullCodec),
            history_codec: Arc::new(crate::codec::ZstdCodec { level: 9 }),
        }
    }
}

// ── Chunk collection ─────────────────────────────────────────────────────────

/// Collects the chunk list of one fragment; holes become sentinel chunks.
struct ChunkCollector {
    chunks: Vec<Chunk>,
}

impl ChunkSink for ChunkCollector {
    fn add_chunk(&mut self, block: u32, offset: u64, size: u64) {
        debug_assert!(offset <= u32::MAX as u64 && size <= u32::MAX as u64);
        self.chunks.push(Chunk {
            block,
            offset: offset as u32,
            size: size as u32,
        });
    }

    fn add_hole(&mut self, size: u64) {
        // Holes wider than a chunk can express are split.
        let mut remaining = size;
        while remaining > 0 {
            let piece = remaining.min(1 << 30);
            self.chunks.push(Chunk {
                block: HOLE_BLOCK,
                offset: 0,
                size: piece as u32,
            });
            remaining -= piece;
        }
    }
}

/// A sink that must never receive anything; used for `finish()`, which
/// only flushes block state.
struct NullSink;

impl ChunkSink for NullSink {
    fn add_chunk(&mut self, _: u32, _: u64, _: u64) {
        debug_assert!(false, "chunk emitted after the last fragment");
    }
    fn add_hole(&mut self, _: u64) {
        debug_assert!(false, "hole emitted after the last fragment");
    }
}

// ── Pipeline messages ────────────────────────────────────────────────────────

enum MergerMsg {
    Block {
        stream: usize,
        logical: u32,
        data: Arc<Vec<u8>>,
    },
    Done {
        stream: usize,
    },
}

struct CompressJob {
    physical: u32,
    data: Arc<Vec<u8>>,
    codec: Arc<dyn Codec>,
    metadata: Option<Value>,
}

struct WriteJob {
    physical: u32,
    compression: u16,
    payload: Vec<u8>,
}

// ── Section output ───────────────────────────────────────────────────────────

/// Appends checksummed sections and records their index entries.
pub struct SectionStream<W: Write> {
    out: W,
    path: PathBuf,
    /// Offset of the next section relative to the end of the raw header.
    position: u64,
    next_number: u32,
    index: Vec<SectionIndexEntry>,
}

impl<W: Write> SectionStream<W> {
    pub fn new(out: W, path: PathBuf) -> Self {
        SectionStream {
            out,
            path,
            position: 0,
            next_number: 0,
            index: Vec::new(),
        }
    }

    pub fn write_header(&mut self, header: &[u8]) -> Result<()> {
        debug_assert_eq!(self.next_number, 0, "raw header must precede all sections");
        self.out
            .write_all(header)
            .map_err(|e| Error::io_write(&self.path, e))
    }

    pub fn append(
        &mut self,
        section_type: SectionType,
        compression: u16,
        payload: &[u8],
    ) -> Result<()> {
        let header = SectionHeader::for_payload(self.next_number, section_type, compression, payload);
        self.append_with_header(&header, payload)
    }

    /// Append a section whose checksums were computed (or validated)
    /// earlier; used by the rewrite path to carry checksums over.
    pub fn append_with_header(&mut self, header: &SectionHeader, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(header.number, self.next_number);
        let mut buf = Vec::with_capacity(SECTION_HEADER_SIZE);
        header
            .write(&mut buf)
            .map_err(|e| Error::io_write(&self.path, e))?;
        self.out
            .write_all(&buf)
            .map_err(|e| Error::io_write(&self.path, e))?;
        self.out
            .write_all(payload)
            .map_err(|e| Error::io_write(&self.path, e))?;

        self.index.push(SectionIndexEntry {
            section_type: header.section_type,
            offset: self.position,
        });
        self.position += (SECTION_HEADER_SIZE + payload.len()) as u64;
        self.next_number += 1;
        Ok(())
    }

    /// Write the trailing section index (which lists itself last).
    pub fn finish_with_index(&mut self) -> Result<()> {
        let mut entries = self.index.clone();
        entries.push(SectionIndexEntry {
            section_type: SectionType::SectionIndex,
            offset: self.position,
        });
        let payload = encode_section_index(&entries);
        self.append(SectionType::SectionIndex, COMPRESSION_NONE, &payload)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn compress_payload(codec: &dyn Codec, payload: &[u8]) -> Result<(u16, Vec<u8>)> {
    match codec.compress(payload, None).map_err(map_codec_err)? {
        Some(out) => Ok((codec.compression_id(), out)),
        None => Ok((COMPRESSION_NONE, payload.to_vec())),
    }
}

fn map_codec_err(e: codec::CodecError) -> Error {
    match e {
        codec::CodecError::RequirementUnmet(msg) => Error::MetadataRequirementUnmet {
            category: String::new(),
            reason: msg,
        },
        other => Error::CorruptImage(other.to_string()),
    }
}

// ── Category streams ─────────────────────────────────────────────────────────

/// One unit of segmentation work: a `(category, subcategory)` pair with
/// its ordered fragment span.
struct CategoryStream {
    category: FragmentCategory,
    items: Vec<FragmentRef>,
    codec: Arc<dyn Codec>,
    seg_cfg: SegmenterConfig,
    metadata: Option<Value>,
    granularity: u32,
}

/// Resolve per-category configuration into concrete streams, checking
/// codec metadata requirements along the way.
fn build_streams(
    tree: &EntryTree,
    inode_mgr: &InodeManager,
    categorizers: &CategorizerManager,
    resolve: &dyn Fn(&str) -> CategoryWriterConfig,
) -> Result<Vec<CategoryStream>> {
    let mut categories: Vec<u32> = inode_mgr.category_fragments.keys().copied().collect();
    categories.sort_unstable();

    let mut streams = Vec::new();
    for cat in categories {
        let name = categorizers.category_name(cat).to_owned();
        let cfg = resolve(&name);

        log::debug!(
            "[{name}] {} bytes across {} fragments",
            inode_mgr.category_sizes.get(&cat).copied().unwrap_or(0),
            inode_mgr.category_fragments.get(&cat).map_or(0, Vec::len)
        );

        // The span is computed synchronously here; ordering for the
        // nilsimsa policy still runs on the rayon pool.
        let span = inode_mgr
            .ordered_span(cat, cfg.order, tree, categorizers)
            .recv()
            .map_err(|_| Error::OutOfResources("ordering worker died".into()))?;

        // Split the span at subcategory boundaries; the span keeps equal
        // subcategories contiguous.
        let mut start = 0usize;
        while start < span.len() {
            let sub = span[start].category;
            let mut end = start;
            while end < span.len() && span[end].category == sub {
                end += 1;
            }

            let metadata = categorizers.category_metadata(sub);
            if let Some(req) = cfg.codec.metadata_requirements() {
                let doc = metadata.as_ref().ok_or_else(|| Error::MetadataRequirementUnmet {
                    category: name.clone(),
                    reason: "category supplies no metadata".into(),
                })?;
                req.check(doc).map_err(|e| Error::MetadataRequirementUnmet {
                    category: name.clone(),
                    reason: e.to_string(),
                })?;
            }

            let granularity = cfg
                .codec
                .compression_constraints(metadata.as_ref())
                .granularity
                .unwrap_or(1);

            let mut seg_cfg = cfg.segmenter.clone();
            seg_cfg.context = format!("[{name}] ");

            streams.push(CategoryStream {
                category: sub,
                items: span[start..end].to_vec(),
                codec: Arc::clone(&cfg.codec),
                seg_cfg,
                metadata,
                granularity,
            });
            start = end;
        }
    }
    Ok(streams)
}

/// Fragment extents clipped out of the file's extent map.
fn fragment_extents<'d>(
    data: &'d [u8],
    extents: &[Extent],
    frag_offset: u64,
    frag_size: u64,
) -> Vec<FragmentExtent<'d>> {
    let lo = frag_offset;
    let hi = frag_offset + frag_size;
    let mut out = Vec::new();
    for e in extents {
        let (off, len, is_hole) = match *e {
            Extent::Data { offset, len } => (offset, len, false),
            Extent::Hole { offset, len } => (offset, len, true),
        };
        let s = off.max(lo);
        let t = (off + len).min(hi);
        if s >= t {
            continue;
        }
        if is_hole {
            out.push(FragmentExtent::Hole(t - s));
        } else {
            out.push(FragmentExtent::Data(&data[s as usize..t as usize]));
        }
    }
    out
}

// ── Write driver ─────────────────────────────────────────────────────────────

pub struct ImageWriter<'a> {
    pub tree: &'a EntryTree,
    pub inode_mgr: &'a InodeManager,
    pub layout: &'a InodeLayout,
    pub categorizers: &'a CategorizerManager,
    pub progress: Arc<Progress>,
    pub metadata_options: MetadataOptions,
    pub options: WriterOptions,
    pub history: History,
}

impl<'a> ImageWriter<'a> {
    /// Write the complete image to `output_path`.
    pub fn write(
        &mut self,
        output_path: &Path,
        resolve: &dyn Fn(&str) -> CategoryWriterConfig,
    ) -> Result<()> {
        self.metadata_options.validate()?;

        let streams = build_streams(self.tree, self.inode_mgr, self.categorizers, resolve)?;

        let block_mgr = Arc::new(BlockManager::new());
        let chunk_results: Mutex<Vec<(u32, u32, Vec<Chunk>)>> = Mutex::new(Vec::new());
        let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());

        let out_file = fs::File::create(output_path)
            .map_err(|e| Error::io_write(output_path, e))?;
        let mut stream_out = SectionStream::new(out_file, output_path.to_path_buf());
        if let Some(header) = &self.options.header {
            stream_out.write_header(header)?;
        }

        // Queue bound in blocks, derived from the byte budget.
        let max_block = streams
            .iter()
            .map(|s| 1u64 << s.seg_cfg.block_size_bits)
            .max()
            .unwrap_or(1 << 24);
        let queue_blocks = (self.options.max_queue_size / max_block).max(2) as usize;

        let (merger_tx, merger_rx) = bounded::<MergerMsg>(queue_blocks);
        let (comp_tx, comp_rx) = bounded::<CompressJob>(queue_blocks);
        let (write_tx, write_rx) = unbounded::<WriteJob>();

        // Physical block number → category id, recorded by the merger.
        let block_categories: Mutex<Vec<u32>> = Mutex::new(Vec::new());

        let stream_count = streams.len();
        let progress = Arc::clone(&self.progress);

        let writer_result: Mutex<Option<SectionStream<fs::File>>> = Mutex::new(None);

        std::thread::scope(|scope| {
            // ── Merger: single total order over all category streams ────────
            let merger_block_mgr = Arc::clone(&block_mgr);
            let merger_categories = &block_categories;
            let merger_streams: Vec<u32> = streams.iter().map(|s| s.category.value).collect();
            let merger_codecs: Vec<(Arc<dyn Codec>, Option<Value>)> = streams
                .iter()
                .map(|s| (Arc::clone(&s.codec), s.metadata.clone()))
                .collect();
            scope.spawn(move || {
                let mut queues: Vec<VecDeque<(u32, Arc<Vec<u8>>)>> =
                    (0..stream_count).map(|_| VecDeque::new()).collect();
                let mut done = vec![false; stream_count];
                let mut current = 0usize;
                let mut next_physical = 0u32;

                let mut flush_current = |current: &mut usize,
                                         queues: &mut Vec<VecDeque<(u32, Arc<Vec<u8>>)>>,
                                         done: &[bool],
                                         next_physical: &mut u32| {
                    loop {
                        if *current >= stream_count {
                            break;
                        }
                        if let Some((logical, data)) = queues[*current].pop_front() {
                            let physical = *next_physical;
                            *next_physical += 1;
                            merger_block_mgr.set_physical(logical, physical);
                            merger_categories
                                .lock()
                                .unwrap()
                                .push(merger_streams[*current]);
                            let (codec, metadata) = &merger_codecs[*current];
                            if comp_tx
                                .send(CompressJob {
                                    physical,
                                    data,
                                    codec: Arc::clone(codec),
                                    metadata: metadata.clone(),
                                })
                                .is_err()
                            {
                                break;
                            }
                        } else if done[*current] {
                            *current += 1;
                        } else {
                            break;
                        }
                    }
                };

                for msg in merger_rx {
                    match msg {
                        MergerMsg::Block { stream, logical, data } => {
                            queues[stream].push_back((logical, data));
                        }
                        MergerMsg::Done { stream } => {
                            done[stream] = true;
                        }
                    }
                    flush_current(&mut current, &mut queues, &done, &mut next_physical);
                }
                flush_current(&mut current, &mut queues, &done, &mut next_physical);
                drop(comp_tx);
            });

            // ── Compression pool ────────────────────────────────────────────
            for _ in 0..self.options.num_workers.max(1) {
                let comp_rx = comp_rx.clone();
                let write_tx = write_tx.clone();
                let errors = &errors;
                scope.spawn(move || {
                    for job in comp_rx {
                        let result = job.codec.compress(&job.data, job.metadata.as_ref());
                        let (compression, payload) = match result {
                            Ok(Some(out)) => (job.codec.compression_id(), out),
                            Ok(None) => (COMPRESSION_NONE, job.data.to_vec()),
                            Err(e) => {
                                errors.lock().unwrap().push(map_codec_err(e));
                                continue;
                            }
                        };
                        if write_tx
                            .send(WriteJob {
                                physical: job.physical,
                                compression,
                                payload,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
            drop(write_tx);
            drop(comp_rx);

            // ── Writer thread: strict physical order ────────────────────────
            let writer_progress = Arc::clone(&progress);
            let writer_errors = &errors;
            let writer_slot = &writer_result;
            scope.spawn(move || {
                let mut pending: BTreeMap<u32, WriteJob> = BTreeMap::new();
                let mut expected = 0u32;
                for job in write_rx {
                    pending.insert(job.physical, job);
                    while let Some(entry) = pending.first_entry() {
                        if *entry.key() != expected {
                            break;
                        }
                        let job = entry.remove();
                        writer_progress
                            .compressed_size
                            .fetch_add(job.payload.len() as u64, AtomicOrdering::Relaxed);
                        if let Err(e) =
                            stream_out.append(SectionType::Block, job.compression, &job.payload)
                        {
                            writer_errors.lock().unwrap().push(e);
                            return;
                        }
                        expected += 1;
                    }
                }
                debug_assert!(pending.is_empty(), "gap in physical block numbering");
                *writer_slot.lock().unwrap() = Some(stream_out);
            });

            // ── Segmenter jobs, max_active_slots at a time ──────────────────
            let next_stream = Arc::new(std::sync::atomic::AtomicUsize::new(0));
            for _ in 0..self.options.max_active_slots.max(1) {
                let next_stream = Arc::clone(&next_stream);
                let streams = &streams;
                let merger_tx = merger_tx.clone();
                let block_mgr = Arc::clone(&block_mgr);
                let chunk_results = &chunk_results;
                let errors = &errors;
                let tree: &EntryTree = self.tree;
                let progress = Arc::clone(&progress);
                scope.spawn(move || {
                    loop {
                        let si = next_stream.fetch_add(1, AtomicOrdering::Relaxed);
                        if si >= streams.len() {
                            break;
                        }
                        let stream = &streams[si];
                        let tx = merger_tx.clone();
                        let mut seg = new_segmenter(
                            stream.seg_cfg.clone(),
                            stream.granularity,
                            Arc::clone(&block_mgr),
                            Arc::clone(&progress),
                            Box::new(move |data, logical| {
                                let _ = tx.send(MergerMsg::Block {
                                    stream: si,
                                    logical,
                                    data,
                                });
                            }),
                        );

                        for item in &stream.items {
                            let fd = tree.file(item.file);
                            let data = match fs::read(&fd.primary_path) {
                                Ok(d) => d,
                                Err(e) => {
                                    errors.lock().unwrap().push(Error::io_read(
                                        &fd.primary_path,
                                        e,
                                    ));
                                    continue;
                                }
                            };
                            // Hole extents are only honored at byte
                            // granularity; frame-aligned categories take
                            // the fragment as one data extent.
                            let exts = if stream.granularity <= 1 {
                                fragment_extents(&data, &fd.extents, item.offset, item.size)
                            } else {
                                let lo = (item.offset as usize).min(data.len());
                                let hi = ((item.offset + item.size) as usize).min(data.len());
                                vec![FragmentExtent::Data(&data[lo..hi])]
                            };
                            let mut sink = ChunkCollector { chunks: Vec::new() };
                            seg.add_file(&exts, &mut sink);
                            chunk_results.lock().unwrap().push((
                                item.unique,
                                item.fragment_index,
                                sink.chunks,
                            ));
                        }

                        seg.finish(&mut NullSink);
                        let _ = merger_tx.send(MergerMsg::Done { stream: si });
                    }
                });
            }
            drop(merger_tx);
        });

        if let Some(e) = errors.into_inner().unwrap().into_iter().next() {
            return Err(e);
        }

        let mut stream_out = writer_result
            .into_inner()
            .unwrap()
            .ok_or_else(|| Error::OutOfResources("writer thread died".into()))?;

        // ── Assemble chunk store and metadata ───────────────────────────────
        let mut chunk_store = ChunkStore::new(self.inode_mgr.unique_reps.len(), |u| {
            self.tree
                .file(self.inode_mgr.unique_reps[u])
                .fragments
                .0
                .len()
                .max(1)
        });
        for (unique, frag, chunks) in chunk_results.into_inner().unwrap() {
            *chunk_store.sink(unique, frag) = chunks;
        }

        let block_categories = block_categories.into_inner().unwrap();
        let md = build_metadata(
            self.tree,
            self.inode_mgr,
            self.layout,
            &chunk_store,
            &block_mgr,
            block_categories,
            self.categorizers,
            self.metadata_options.clone(),
        )?;

        let (schema_bytes, metadata_bytes) = metadata::encode_metadata(&md)?;

        let (comp, payload) = compress_payload(self.options.schema_codec.as_ref(), &schema_bytes)?;
        stream_out.append(SectionType::MetadataV2Schema, comp, &payload)?;

        let (comp, payload) =
            compress_payload(self.options.metadata_codec.as_ref(), &metadata_bytes)?;
        stream_out.append(SectionType::MetadataV2, comp, &payload)?;

        if !self.options.no_history {
            let history_bytes = self.history.to_bytes()?;
            let (comp, payload) =
                compress_payload(self.options.history_codec.as_ref(), &history_bytes)?;
            stream_out.append(SectionType::History, comp, &payload)?;
        }

        if !self.options.no_section_index {
            stream_out.finish_with_index()?;
        }

        stream_out
            .into_inner()
            .sync_all()
            .map_err(|e| Error::io_write(output_path, e))?;

        Ok(())
    }
}

// ── Recompression ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecompressMode {
    None,
    Block,
    Metadata,
    All,
}

impl RecompressMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(RecompressMode::None),
            "block" => Some(RecompressMode::Block),
            "metadata" => Some(RecompressMode::Metadata),
            "all" => Some(RecompressMode::All),
            _ => None,
        }
    }

    fn blocks(self) -> bool {
        matches!(self, RecompressMode::Block | RecompressMode::All)
    }

    fn metadata(self) -> bool {
        matches!(self, RecompressMode::Metadata | RecompressMode::All)
    }
}

/// `--recompress-categories [!]c1,c2` filter.
#[derive(Debug, Clone, Default)]
pub struct CategoryFilter {
    names: Vec<String>,
    negated: bool,
}

impl CategoryFilter {
    pub fn parse(spec: &str) -> Self {
        let (negated, rest) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        CategoryFilter {
            names: rest.split(',').map(str::to_owned).filter(|s| !s.is_empty()).collect(),
            negated,
        }
    }

    pub fn matches(&self, category: &str) -> bool {
        if self.names.is_empty() {
            return true;
        }
        self.names.iter().any(|n| n == category) != self.negated
    }
}

pub struct RecompressOptions {
    pub mode: RecompressMode,
    pub categories: CategoryFilter,
    /// Codec per category name; the empty name is the default.
    pub block_codecs: HashMap<String, Arc<dyn Codec>>,
    pub schema_codec: Arc<dyn Codec>,
    pub metadata_codec: Arc<dyn Codec>,
    pub history_codec: Arc<dyn Codec>,
    /// Re-encode the metadata tables with these options.
    pub rebuild_metadata: Option<MetadataOptions>,
    pub remove_header: bool,
    pub no_section_index: bool,
    pub no_history: bool,
    /// Arguments recorded in the appended history record.
    pub history_args: Vec<String>,
}

/// Rewrite an image, optionally re-compressing sections.
///
/// Unchanged sections keep their previously computed checksums.  A
/// checksum failure on a `BLOCK` or `HISTORY` section is reported and the
/// section is copied verbatim instead of being recompressed; a failure on
/// schema or metadata is fatal.
pub fn recompress_image(
    input_path: &Path,
    output_path: &Path,
    opts: &RecompressOptions,
) -> Result<()> {
    let mut input = fs::File::open(input_path).map_err(|e| Error::io_read(input_path, e))?;

    let image_offset = crate::section::find_image_offset(&mut input, 1 << 20).unwrap_or(0);
    let sections = crate::section::sections_from_index(&mut input, image_offset)
        .ok()
        .flatten()
        .map(Ok)
        .unwrap_or_else(|| crate::section::scan_sections(&mut input, image_offset))
        .map_err(|e| Error::CorruptImage(e.to_string()))?;

    let read_payload = |input: &mut fs::File, sec: &RawSection| -> Result<Vec<u8>> {
        input
            .seek(SeekFrom::Start(sec.payload_offset()))
            .map_err(|e| Error::io_read(input_path, e))?;
        let mut buf = vec![0u8; sec.header.length as usize];
        std::io::Read::read_exact(input, &mut buf).map_err(|e| Error::io_read(input_path, e))?;
        Ok(buf)
    };

    // Metadata is needed up front for per-category filtering.
    let mut schema_bytes = None;
    let mut metadata_bytes = None;
    for sec in &sections {
        match sec.header.section_type {
            SectionType::MetadataV2Schema => {
                let payload = read_payload(&mut input, sec)?;
                sec.header
                    .verify_fast(&payload)
                    .map_err(|e| Error::CorruptImage(e.to_string()))?;
                schema_bytes =
                    Some(codec::decompress(sec.header.compression, &payload).map_err(map_codec_err)?);
            }
            SectionType::MetadataV2 => {
                let payload = read_payload(&mut input, sec)?;
                sec.header
                    .verify_fast(&payload)
                    .map_err(|e| Error::CorruptImage(e.to_string()))?;
                metadata_bytes =
                    Some(codec::decompress(sec.header.compression, &payload).map_err(map_codec_err)?);
            }
            _ => {}
        }
    }
    let schema_bytes =
        schema_bytes.ok_or_else(|| Error::CorruptImage("image has no schema section".into()))?;
    let metadata_bytes =
        metadata_bytes.ok_or_else(|| Error::CorruptImage("image has no metadata section".into()))?;
    let md = metadata::decode_metadata(&schema_bytes, &metadata_bytes)?;

    // Preserve the raw header unless asked not to.
    let header_bytes = if image_offset > 0 && !opts.remove_header {
        input
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io_read(input_path, e))?;
        let mut buf = vec![0u8; image_offset as usize];
        std::io::Read::read_exact(&mut input, &mut buf)
            .map_err(|e| Error::io_read(input_path, e))?;
        Some(buf)
    } else {
        None
    };

    let out_file =
        fs::File::create(output_path).map_err(|e| Error::io_write(output_path, e))?;
    let mut out = SectionStream::new(out_file, output_path.to_path_buf());
    if let Some(h) = &header_bytes {
        out.write_header(h)?;
    }

    let codec_for_category = |name: &str| -> Option<&Arc<dyn Codec>> {
        opts.block_codecs
            .get(name)
            .or_else(|| opts.block_codecs.get(""))
    };

    let mut history = None;
    let mut block_no = 0u32;

    for sec in &sections {
        let payload = read_payload(&mut input, sec)?;

        match sec.header.section_type {
            SectionType::Block => {
                let this_block = block_no;
                block_no += 1;

                let category_name = md
                    .block_categories
                    .get(this_block as usize)
                    .and_then(|&c| md.category_names.get(c as usize))
                    .cloned()
                    .unwrap_or_default();

                let recompress = opts.mode.blocks()
                    && opts.categories.matches(&category_name)
                    && codec_for_category(&category_name).is_some();

                if recompress {
                    if sec.header.verify_fast(&payload).is_err() {
                        log::warn!(
                            "bad checksum in block section {}; copying verbatim",
                            sec.header.number
                        );
                        copy_section(&mut out, sec, &payload)?;
                        continue;
                    }
                    let raw =
                        codec::decompress(sec.header.compression, &payload).map_err(map_codec_err)?;
                    let codec = codec_for_category(&category_name).expect("checked above");
                    let (comp, new_payload) = compress_payload(codec.as_ref(), &raw)?;
                    out.append(SectionType::Block, comp, &new_payload)?;
                } else {
                    copy_section(&mut out, sec, &payload)?;
                }
            }
            SectionType::MetadataV2Schema | SectionType::MetadataV2 => {
                sec.header
                    .verify_fast(&payload)
                    .map_err(|e| Error::CorruptImage(e.to_string()))?;

                let (raw, codec): (&[u8], &Arc<dyn Codec>) =
                    if sec.header.section_type == SectionType::MetadataV2Schema {
                        (&schema_bytes, &opts.schema_codec)
                    } else {
                        (&metadata_bytes, &opts.metadata_codec)
                    };

                if let Some(new_md_opts) = &opts.rebuild_metadata {
                    new_md_opts.validate()?;
                    let mut rebuilt = metadata::decode_metadata(&schema_bytes, &metadata_bytes)?;
                    // The time resolution is frozen at build time; only
                    // packing and cache options can change on rebuild.
                    let mut new_opts = new_md_opts.clone();
                    new_opts.time_resolution_sec = rebuilt.time_resolution_sec;
                    rebuilt.mtime_only = new_opts.mtime_only;
                    rebuilt.options = new_opts;
                    let (new_schema, new_tables) = metadata::encode_metadata(&rebuilt)?;
                    let raw = if sec.header.section_type == SectionType::MetadataV2Schema {
                        new_schema
                    } else {
                        new_tables
                    };
                    let (comp, payload) = compress_payload(codec.as_ref(), &raw)?;
                    out.append(sec.header.section_type, comp, &payload)?;
                } else if opts.mode.metadata() {
                    let (comp, payload) = compress_payload(codec.as_ref(), raw)?;
                    out.append(sec.header.section_type, comp, &payload)?;
                } else {
                    copy_section(&mut out, sec, &payload)?;
                }
            }
            SectionType::History => {
                if sec.header.verify_fast(&payload).is_err() {
                    log::warn!(
                        "bad checksum in history section {}; dropping it",
                        sec.header.number
                    );
                    history = Some(History::new());
                } else {
                    let raw =
                        codec::decompress(sec.header.compression, &payload).map_err(map_codec_err)?;
                    history = Some(History::from_bytes(&raw)?);
                }
            }
            SectionType::SectionIndex => {
                // Always rebuilt at the end.
            }
        }
    }

    if !opts.no_history {
        let mut history = history.unwrap_or_default();
        history.append(opts.history_args.clone());
        let (comp, payload) =
            compress_payload(opts.history_codec.as_ref(), &history.to_bytes()?)?;
        out.append(SectionType::History, comp, &payload)?;
    }

    if !opts.no_section_index {
        out.finish_with_index()?;
    }

    out.into_inner()
        .sync_all()
        .map_err(|e| Error::io_write(output_path, e))?;
    Ok(())
}

/// Copy a section verbatim, reusing its validated checksums but
/// renumbering it for its position in the new image.
fn copy_section<W: Write>(
    out: &mut SectionStream<W>,
    sec: &RawSection,
    payload: &[u8],
) -> Result<()> {
    let mut header = sec.header;
    if header.number == out.next_number {
        out.append_with_header(&header, payload)
    } else {
        // Renumbering invalidates the stored checksums; recompute.
        header = SectionHeader::for_payload(
            out.next_number,
            header.section_type,
            header.compression,
            payload,
        );
        out.append_with_header(&header, payload)
    }
}
