//! Rolling-hash segmenter: sub-file deduplication against a bounded
//! window of recent blocks.
//!
//! Strategy: each *block* keeps its own rolling hash and an index of
//! hash → offset pairs, populated every `window_step` frames as the block
//! grows.  Each *file* gets a fresh rolling hash whose values expire
//! immediately; up to `max_active_blocks` recent blocks are probed for
//! matches.  File data behind the sliding window is lazily appended to
//! the current block (keeping a `window + step` lookback unwritten), so
//! memory use stays proportional to block size times the active-block
//! count.
//!
//! A global Bloom filter over all active blocks' hash values gates the
//! per-block probes; it is rebuilt from the per-block filters whenever the
//! active set rotates.  Windows consisting of a single repeating byte are
//! indexed at most once per block — their precomputed hash values are
//! known at construction time — which keeps long runs of constant bytes
//! from exploding the collision chains.
//!
//! The segmenter operates in *frames* of `granularity` bytes and
//! multiplies at the boundary, so every chunk offset/size it emits is a
//! granularity multiple.  The common `granularity == 1` case is a
//! compile-time specialisation with no multiplies in the hot path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::progress::Progress;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Prefix for log lines, e.g. the category name.
    pub context: String,
    /// Block size is `1 << block_size_bits`, rounded down to the
    /// category's granularity.
    pub block_size_bits: u32,
    /// Window is `1 << blockhash_window_size` frames; 0 disables
    /// segmentation.
    pub blockhash_window_size: u32,
    /// Hash values are recorded every `window >> window_increment_shift`
    /// frames.
    pub window_increment_shift: u32,
    /// Number of recent blocks kept searchable; 0 disables segmentation.
    pub max_active_blocks: usize,
    /// Power-of-two scale factor on the global Bloom filter.
    pub bloom_filter_size: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        SegmenterConfig {
            context: String::new(),
            block_size_bits: 24,
            blockhash_window_size: 12,
            window_increment_shift: 1,
            max_active_blocks: 1,
            bloom_filter_size: 4,
        }
    }
}

// ── Rolling hash ─────────────────────────────────────────────────────────────

/// Additive/multiplicative 32-bit rolling hash over bytes, split into two
/// 16-bit halves: `a` sums the window bytes, `b` sums the running `a`.
#[derive(Debug, Clone)]
pub struct RsyncHash {
    a: u32,
    b: u32,
    window_bytes: u32,
}

impl RsyncHash {
    pub fn new(window_bytes: u32) -> Self {
        RsyncHash { a: 0, b: 0, window_bytes }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.a = 0;
        self.b = 0;
    }

    /// Grow the window by one byte.
    #[inline]
    pub fn roll_in(&mut self, inb: u8) {
        self.a = self.a.wrapping_add(inb as u32);
        self.b = self.b.wrapping_add(self.a);
    }

    /// Slide the full window by one byte.
    #[inline]
    pub fn roll(&mut self, outb: u8, inb: u8) {
        self.a = self.a.wrapping_add(inb as u32).wrapping_sub(outb as u32);
        self.b = self
            .b
            .wrapping_add(self.a)
            .wrapping_sub(self.window_bytes.wrapping_mul(outb as u32));
    }

    #[inline]
    pub fn hash(&self) -> u32 {
        (self.a & 0xFFFF) | (self.b << 16)
    }

    /// Hash of a window filled with one repeating byte.
    pub fn repeating_window(byte: u8, window_bytes: u32) -> u32 {
        let c = byte as u64;
        let n = window_bytes as u64;
        let a = (n * c) & 0xFFFF;
        let b = (n * (n + 1) / 2 * c) & 0xFFFF;
        (a | (b << 16)) as u32
    }
}

// ── Bloom filter ─────────────────────────────────────────────────────────────

/// Single-probe Bloom filter: the rolling hash value itself is split into
/// word index and bit, no secondary hashing.  High false-positive rates
/// are acceptable — the secondary lookup is cheap — but the test itself
/// must be a single load.
pub struct BloomFilter {
    bits: Vec<u64>,
    index_mask: usize,
    size: usize,
}

impl BloomFilter {
    /// `size` is in bits and must be a power of two (or 0 to disable).
    pub fn new(size: usize) -> Self {
        assert!(size == 0 || size.is_power_of_two(), "size must be a power of two");
        let size = if size > 0 { size.max(64) } else { 0 };
        BloomFilter {
            bits: vec![0u64; size / 64],
            index_mask: (size / 64).saturating_sub(1),
            size,
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.size > 0
    }

    #[inline]
    pub fn add(&mut self, ix: u32) {
        let ix = ix as usize;
        self.bits[(ix >> 6) & self.index_mask] |= 1u64 << (ix & 0x3F);
    }

    #[inline]
    pub fn test(&self, ix: u32) -> bool {
        let ix = ix as usize;
        self.bits[(ix >> 6) & self.index_mask] & (1u64 << (ix & 0x3F)) != 0
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn merge(&mut self, other: &BloomFilter) {
        assert_eq!(self.size, other.size, "size mismatch");
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
    }

    pub fn size_bits(&self) -> usize {
        self.size
    }
}

// ── Hash → offsets multimap ──────────────────────────────────────────────────

/// Block-local index from hash value to the frame offsets that produced
/// it.  Collisions are rare; the first offset sits in the primary map and
/// the rest in an overflow map.
#[derive(Default)]
struct OffsetMultimap {
    values: HashMap<u32, u32>,
    collisions: HashMap<u32, Vec<u32>>,
}

impl OffsetMultimap {
    fn insert(&mut self, key: u32, val: u32) {
        if let Some(&first) = self.values.get(&key) {
            let _ = first;
            self.collisions.entry(key).or_default().push(val);
        } else {
            self.values.insert(key, val);
        }
    }

    fn for_each(&self, key: u32, mut f: impl FnMut(u32)) {
        if let Some(&v) = self.values.get(&key) {
            f(v);
            if let Some(coll) = self.collisions.get(&key) {
                for &v in coll {
                    f(v);
                }
            }
        }
    }

    fn any_value_is(&self, key: u32, mut f: impl FnMut(u32) -> bool) -> bool {
        if let Some(&v) = self.values.get(&key) {
            if f(v) {
                return true;
            }
            if let Some(coll) = self.collisions.get(&key) {
                return coll.iter().any(|&v| f(v));
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.values.len() + self.collisions.values().map(Vec::len).sum::<usize>()
    }
}

// ── Granularity policies ─────────────────────────────────────────────────────

/// Frame size policy; the constant case compiles the multiplies away.
pub trait Granularity: Copy + Send + Sync + 'static {
    fn granularity(&self) -> usize;

    #[inline]
    fn frames_to_bytes(&self, frames: u64) -> u64 {
        frames * self.granularity() as u64
    }

    #[inline]
    fn bytes_to_frames(&self, bytes: u64) -> u64 {
        debug_assert_eq!(bytes % self.granularity() as u64, 0);
        bytes / self.granularity() as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConstGranularity<const N: usize>;

impl<const N: usize> Granularity for ConstGranularity<N> {
    #[inline]
    fn granularity(&self) -> usize {
        N
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VarGranularity(pub u32);

impl Granularity for VarGranularity {
    #[inline]
    fn granularity(&self) -> usize {
        self.0 as usize
    }
}

// ── Block manager ────────────────────────────────────────────────────────────

/// Hands out logical block numbers across all per-category segmenters and
/// tracks the logical → physical renumbering done by the writer.
#[derive(Default)]
pub struct BlockManager {
    next: AtomicU32,
    physical: Mutex<Vec<Option<u32>>>,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_logical_block(&self) -> u32 {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.physical.lock().unwrap().push(None);
        n
    }

    pub fn set_physical(&self, logical: u32, physical: u32) {
        let mut map = self.physical.lock().unwrap();
        map[logical as usize] = Some(physical);
    }

    pub fn physical_of(&self, logical: u32) -> u32 {
        self.physical.lock().unwrap()[logical as usize]
            .expect("block was never assigned a physical number")
    }

    pub fn block_count(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

// ── Chunk sink ───────────────────────────────────────────────────────────────

/// Receives the chunk list for the fragment currently being segmented.
/// Offsets and sizes are in bytes and always granularity multiples.
pub trait ChunkSink {
    fn add_chunk(&mut self, block: u32, offset: u64, size: u64);
    fn add_hole(&mut self, size: u64);
}

/// One extent of the fragment being added; holes pass through to the sink.
pub enum FragmentExtent<'a> {
    Data(&'a [u8]),
    Hole(u64),
}

// ── Statistics ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SegmenterStats {
    total_hashes: u64,
    l2_collisions: u64,
    total_matches: u64,
    good_matches: u64,
    bad_matches: u64,
    bloom_lookups: u64,
    bloom_hits: u64,
    bloom_true_positives: u64,
}

// ── Active block ─────────────────────────────────────────────────────────────

struct ActiveBlock<G: Granularity> {
    num: u32,
    capacity_frames: usize,
    window_frames: usize,
    step_mask: usize,
    hasher: RsyncHash,
    filter: BloomFilter,
    offsets: OffsetMultimap,
    data: Arc<Vec<u8>>,
    g: G,
}

impl<G: Granularity> ActiveBlock<G> {
    fn new(
        num: u32,
        capacity_frames: usize,
        window_frames: usize,
        window_step: usize,
        filter_bits: usize,
        g: G,
    ) -> Self {
        let mut data = Vec::new();
        data.reserve(g.frames_to_bytes(capacity_frames as u64) as usize);
        ActiveBlock {
            num,
            capacity_frames,
            window_frames,
            step_mask: window_step - 1,
            hasher: RsyncHash::new(g.frames_to_bytes(window_frames as u64) as u32),
            filter: BloomFilter::new(filter_bits),
            offsets: OffsetMultimap::default(),
            data: Arc::new(data),
            g,
        }
    }

    #[inline]
    fn size_frames(&self) -> usize {
        self.g.bytes_to_frames(self.data.len() as u64) as usize
    }

    #[inline]
    fn full(&self) -> bool {
        self.size_frames() == self.capacity_frames
    }

    /// Frames until the next indexed hash position.
    fn next_hash_distance_frames(&self) -> usize {
        (self.step_mask + 1 - (self.size_frames() & self.step_mask)) & self.step_mask
    }

    /// True when the window at `offset` is a single repeating byte whose
    /// hash is already recorded for an equally repeating window.
    fn is_existing_repeating_sequence(
        &self,
        hashval: u32,
        offset: usize,
        repseq: &HashMap<u32, Vec<u8>>,
        repcoll: &mut HashMap<u8, u64>,
    ) -> bool {
        let Some(bytes) = repseq.get(&hashval) else { return false };

        let g = self.g.granularity();
        let win = &self.data[offset * g..(offset + self.window_frames) * g];
        let byte = win[0];
        if !bytes.contains(&byte) || !win.iter().all(|&b| b == byte) {
            return false;
        }

        self.offsets.any_value_is(hashval, |off| {
            let other =
                &self.data[off as usize * g..(off as usize + self.window_frames) * g];
            if other.iter().all(|&b| b == byte) {
                *repcoll.entry(byte).or_default() += 1;
                true
            } else {
                false
            }
        })
    }

    fn append(
        &mut self,
        src: &[u8],
        global_filter: &mut BloomFilter,
        repseq: &HashMap<u32, Vec<u8>>,
        repcoll: &mut HashMap<u8, u64>,
    ) {
        let g = self.g.granularity();
        let start_frame = self.size_frames();
        debug_assert!(start_frame + src.len() / g <= self.capacity_frames);

        Arc::get_mut(&mut self.data)
            .expect("block is shared only after it is ready")
            .extend_from_slice(src);

        if self.window_frames == 0 {
            return;
        }

        let total_frames = self.size_frames();
        let data = Arc::clone(&self.data);
        let mut offset = start_frame;
        while offset < total_frames {
            if offset < self.window_frames {
                let base = offset * g;
                for i in 0..g {
                    self.hasher.roll_in(data[base + i]);
                }
            } else {
                let out_base = (offset - self.window_frames) * g;
                let in_base = offset * g;
                for i in 0..g {
                    self.hasher.roll(data[out_base + i], data[in_base + i]);
                }
            }
            offset += 1;
            if offset >= self.window_frames && (offset & self.step_mask) == 0 {
                let hashval = self.hasher.hash();
                let win_start = offset - self.window_frames;
                if !self.is_existing_repeating_sequence(hashval, win_start, repseq, repcoll) {
                    self.offsets.insert(hashval, win_start as u32);
                    if self.filter.enabled() {
                        self.filter.add(hashval);
                    }
                    global_filter.add(hashval);
                }
            }
        }
    }
}

// ── Match candidate ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SegmentMatch {
    block: u32,
    /// Frame offset inside the block.
    offset: u32,
    /// Match length in frames; 0 for a hash collision.
    size: u32,
    /// Frame position inside the fragment.
    pos: usize,
}

impl SegmentMatch {
    /// Largest length wins; ties go to the earlier block, then the lower
    /// offset.
    fn better_than(&self, other: &SegmentMatch) -> bool {
        (self.size, std::cmp::Reverse(self.block), std::cmp::Reverse(self.offset))
            > (other.size, std::cmp::Reverse(other.block), std::cmp::Reverse(other.offset))
    }
}

// ── Segmenter ────────────────────────────────────────────────────────────────

/// Callback invoked with the finished block bytes and its logical number.
pub type BlockReadyFn = Box<dyn FnMut(Arc<Vec<u8>>, u32) + Send>;

pub trait SegmenterApi: Send {
    fn add_file(&mut self, extents: &[FragmentExtent<'_>], sink: &mut dyn ChunkSink);
    fn finish(&mut self, sink: &mut dyn ChunkSink);
}

#[derive(Default)]
struct ChunkState {
    offset_frames: u64,
    size_frames: u64,
}

struct SegmenterCore<G: Granularity> {
    cfg: SegmenterConfig,
    g: G,
    window_frames: usize,
    window_step: usize,
    block_capacity_frames: usize,
    blocks: VecDeque<ActiveBlock<G>>,
    global_filter: BloomFilter,
    repseq: HashMap<u32, Vec<u8>>,
    repcoll: HashMap<u8, u64>,
    stats: SegmenterStats,
    chunk: ChunkState,
    block_mgr: Arc<BlockManager>,
    progress: Arc<Progress>,
    block_ready: BlockReadyFn,
}

impl<G: Granularity> SegmenterCore<G> {
    fn new(
        cfg: SegmenterConfig,
        g: G,
        block_mgr: Arc<BlockManager>,
        progress: Arc<Progress>,
        block_ready: BlockReadyFn,
    ) -> Self {
        let window_frames = if cfg.blockhash_window_size > 0 {
            1usize << cfg.blockhash_window_size
        } else {
            0
        };
        let window_step = (window_frames >> cfg.window_increment_shift).max(1);

        let gran = g.granularity();
        let raw_block = 1usize << cfg.block_size_bits;
        let block_bytes = raw_block - raw_block % gran;
        let block_capacity_frames = block_bytes / gran;

        let enabled = window_frames > 0 && cfg.max_active_blocks > 0;
        let filter_bits = if enabled {
            let hash_count = (cfg.max_active_blocks.max(1)
                * (block_capacity_frames / window_step))
                .max(1)
                .next_power_of_two();
            (1usize << cfg.bloom_filter_size) * hash_count
        } else {
            0
        };

        let mut repseq: HashMap<u32, Vec<u8>> = HashMap::new();
        if enabled {
            let window_bytes = (window_frames * gran) as u32;
            for i in 0..=255u8 {
                let val = RsyncHash::repeating_window(i, window_bytes);
                repseq.entry(val).or_default().push(i);
            }
            log::debug!(
                "{}using a {} byte window at {} frame steps with {}-byte frames",
                cfg.context,
                window_frames * gran,
                window_step,
                gran
            );
            log::debug!(
                "{}bloom filter size: {} KiB",
                cfg.context,
                filter_bits / 8 / 1024
            );
        }

        SegmenterCore {
            cfg,
            g,
            window_frames,
            window_step,
            block_capacity_frames,
            blocks: VecDeque::new(),
            global_filter: BloomFilter::new(filter_bits),
            repseq,
            repcoll: HashMap::new(),
            stats: SegmenterStats::default(),
            chunk: ChunkState::default(),
            block_mgr,
            progress,
            block_ready,
        }
    }

    #[inline]
    fn segmentation_enabled(&self) -> bool {
        self.window_frames > 0 && self.cfg.max_active_blocks > 0
    }

    #[inline]
    fn multi_block_mode(&self) -> bool {
        self.cfg.max_active_blocks > 1
    }

    fn emit_block_ready(&mut self) {
        let block = self.blocks.back_mut().expect("no active block");
        self.stats.total_hashes += block.offsets.len() as u64;
        for c in block.offsets.collisions.values() {
            self.stats.l2_collisions += c.len() as u64;
        }
        (self.block_ready)(Arc::clone(&block.data), block.num);
        self.progress.block_count.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_chunk(&mut self, sink: &mut dyn ChunkSink) {
        if self.chunk.size_frames > 0 {
            let block = self.blocks.back().expect("no active block");
            sink.add_chunk(
                block.num,
                self.g.frames_to_bytes(self.chunk.offset_frames),
                self.g.frames_to_bytes(self.chunk.size_frames),
            );
            self.chunk.offset_frames = if block.full() {
                0
            } else {
                block.size_frames() as u64
            };
            self.chunk.size_frames = 0;
            self.progress.chunk_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn append_to_block(
        &mut self,
        data: &[u8],
        offset_frames: usize,
        size_frames: usize,
        sink: &mut dyn ChunkSink,
    ) {
        if self.blocks.is_empty() || self.blocks.back().unwrap().full() {
            if self.blocks.len() >= self.cfg.max_active_blocks.max(1) {
                self.blocks.pop_front();
            }

            if self.segmentation_enabled() {
                self.global_filter.clear();
                if self.multi_block_mode() {
                    for b in &self.blocks {
                        self.global_filter.merge(&b.filter);
                    }
                }
            }

            let num = self.block_mgr.new_logical_block();
            self.blocks.push_back(ActiveBlock::new(
                num,
                self.block_capacity_frames,
                if self.segmentation_enabled() { self.window_frames } else { 0 },
                self.window_step,
                if self.multi_block_mode() { self.global_filter.size_bits() } else { 0 },
                self.g,
            ));
        }

        let g = self.g.granularity();
        let src = &data[offset_frames * g..(offset_frames + size_frames) * g];

        let block = self.blocks.back_mut().unwrap();
        block.append(src, &mut self.global_filter, &self.repseq, &mut self.repcoll);
        self.chunk.size_frames += size_frames as u64;
        self.progress
            .filesystem_size
            .fetch_add(src.len() as u64, Ordering::Relaxed);

        if self.blocks.back().unwrap().full() {
            self.finish_chunk(sink);
            self.emit_block_ready();
        }
    }

    fn add_data(
        &mut self,
        data: &[u8],
        mut offset_frames: usize,
        mut size_frames: usize,
        sink: &mut dyn ChunkSink,
    ) {
        while size_frames > 0 {
            let block_fill = self
                .blocks
                .back()
                .map(|b| b.size_frames())
                .unwrap_or(0);
            let room = if block_fill == self.block_capacity_frames || self.blocks.is_empty() {
                self.block_capacity_frames
            } else {
                self.block_capacity_frames - block_fill
            };
            let take = size_frames.min(room);
            self.append_to_block(data, offset_frames, take, sink);
            offset_frames += take;
            size_frames -= take;
        }
    }

    fn seek(&self, hasher: &mut RsyncHash, data: &[u8], from_frame: usize) -> usize {
        hasher.clear();
        let g = self.g.granularity();
        let base = from_frame * g;
        for b in &data[base..base + self.window_frames * g] {
            hasher.roll_in(*b);
        }
        from_frame + self.window_frames
    }

    #[inline]
    fn slide(&self, hasher: &mut RsyncHash, data: &[u8], offset_frame: usize) -> usize {
        let g = self.g.granularity();
        let out = (offset_frame - self.window_frames) * g;
        let inn = offset_frame * g;
        for i in 0..g {
            hasher.roll(data[out + i], data[inn + i]);
        }
        offset_frame + 1
    }

    /// Byte-verify a candidate and extend it backward/forward as far as
    /// the already-written prefix, the fragment end and the block bounds
    /// allow.
    fn verify_and_extend(
        &self,
        block: &ActiveBlock<G>,
        off: u32,
        data: &[u8],
        pos: usize,
        len: usize,
        begin: usize,
        end: usize,
    ) -> Option<SegmentMatch> {
        let g = self.g.granularity();
        let bdata = &block.data;
        let off = off as usize;

        if bdata[off * g..(off + len) * g] != data[pos * g..(pos + len) * g] {
            return None;
        }

        let max_back = (pos - begin).min(off);
        let mut back = 0usize;
        while back < max_back
            && bdata[(off - back - 1) * g..(off - back) * g]
                == data[(pos - back - 1) * g..(pos - back) * g]
        {
            back += 1;
        }

        let bsize = block.size_frames();
        let max_fwd = (end - (pos + len)).min(bsize - (off + len));
        let mut fwd = 0usize;
        while fwd < max_fwd
            && bdata[(off + len + fwd) * g..(off + len + fwd + 1) * g]
                == data[(pos + len + fwd) * g..(pos + len + fwd + 1) * g]
        {
            fwd += 1;
        }

        Some(SegmentMatch {
            block: block.num,
            offset: (off - back) as u32,
            size: (len + back + fwd) as u32,
            pos: pos - back,
        })
    }

    fn segment_and_add_data(&mut self, data: &[u8], sink: &mut dyn ChunkSink) {
        let window = self.window_frames;
        let step = self.window_step;
        let total = self.g.bytes_to_frames(data.len() as u64) as usize;
        let lookback = window + step;

        debug_assert!(total >= window, "fragment shorter than the hash window");

        let mut hasher = RsyncHash::new(self.g.frames_to_bytes(window as u64) as u32);
        let mut written = 0usize;
        let mut offset = self.seek(&mut hasher, data, 0);
        let mut next_hash = lookback
            + self
                .blocks
                .back()
                .map(|b| b.next_hash_distance_frames())
                .unwrap_or(step);

        let mut candidates: Vec<(usize, u32)> = Vec::new();
        let mut matches: Vec<SegmentMatch> = Vec::new();

        while offset < total {
            let h = hasher.hash();
            self.stats.bloom_lookups += 1;

            if self.global_filter.test(h) {
                self.stats.bloom_hits += 1;

                candidates.clear();
                if self.multi_block_mode() {
                    for (bi, block) in self.blocks.iter().enumerate() {
                        if block.filter.test(h) {
                            block.offsets.for_each(h, |off| candidates.push((bi, off)));
                        }
                    }
                } else if let Some(block) = self.blocks.front() {
                    block.offsets.for_each(h, |off| candidates.push((0, off)));
                }

                if !candidates.is_empty() {
                    self.stats.bloom_true_positives += 1;

                    matches.clear();
                    for &(bi, off) in &candidates {
                        let m = self.verify_and_extend(
                            &self.blocks[bi],
                            off,
                            data,
                            offset - window,
                            window,
                            written,
                            total,
                        );
                        match m {
                            Some(m) => matches.push(m),
                            None => self.stats.bad_matches += 1,
                        }
                    }
                    self.stats.total_matches += candidates.len() as u64;

                    let best = matches
                        .iter()
                        .copied()
                        .reduce(|a, b| if b.better_than(&a) { b } else { a });

                    if let Some(best) = best.filter(|m| m.size > 0) {
                        self.stats.good_matches += 1;
                        log::trace!(
                            "{}match of {} frames @ block {} offset {}",
                            self.cfg.context,
                            best.size,
                            best.block,
                            best.offset
                        );

                        let num_to_write = best.pos - written;
                        self.add_data(data, written, num_to_write, sink);
                        written += num_to_write;
                        self.finish_chunk(sink);

                        sink.add_chunk(
                            best.block,
                            self.g.frames_to_bytes(best.offset as u64),
                            self.g.frames_to_bytes(best.size as u64),
                        );
                        self.progress.chunk_count.fetch_add(1, Ordering::Relaxed);
                        self.progress.saved_by_segmentation.fetch_add(
                            self.g.frames_to_bytes(best.size as u64),
                            Ordering::Relaxed,
                        );

                        written += best.size as usize;
                        offset = written;

                        if total - written < window {
                            break;
                        }

                        offset = self.seek(&mut hasher, data, offset);
                        next_hash = written
                            + lookback
                            + self
                                .blocks
                                .back()
                                .map(|b| b.next_hash_distance_frames())
                                .unwrap_or(0);
                        continue;
                    }
                }
            }

            // No match; keep at least `lookback` frames unwritten so a
            // later match can still extend backward over them.
            if offset == next_hash {
                let num_to_write = offset - lookback - written;
                self.add_data(data, written, num_to_write, sink);
                written += num_to_write;
                next_hash += step;
            }

            offset = self.slide(&mut hasher, data, offset);
        }

        self.add_data(data, written, total - written, sink);
        self.finish_chunk(sink);
    }
}

impl<G: Granularity> SegmenterApi for SegmenterCore<G> {
    fn add_file(&mut self, extents: &[FragmentExtent<'_>], sink: &mut dyn ChunkSink) {
        for ext in extents {
            match ext {
                FragmentExtent::Hole(size) => sink.add_hole(*size),
                FragmentExtent::Data(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    let frames = self.g.bytes_to_frames(data.len() as u64) as usize;
                    if !self.segmentation_enabled() || frames < self.window_frames {
                        self.add_data(data, 0, frames, sink);
                        self.finish_chunk(sink);
                    } else {
                        self.segment_and_add_data(data, sink);
                    }
                }
            }
        }
    }

    fn finish(&mut self, sink: &mut dyn ChunkSink) {
        self.finish_chunk(sink);
        if self.blocks.back().is_some_and(|b| !b.full() && b.size_frames() > 0) {
            self.emit_block_ready();
        }

        let s = &self.stats;
        if s.bloom_lookups > 0 {
            log::debug!(
                "{}bloom filter reject rate: {:.3}% (TPR={:.3}%, lookups={})",
                self.cfg.context,
                100.0 - 100.0 * s.bloom_hits as f64 / s.bloom_lookups as f64,
                if s.bloom_hits > 0 {
                    100.0 * s.bloom_true_positives as f64 / s.bloom_hits as f64
                } else {
                    0.0
                },
                s.bloom_lookups
            );
        }
        if s.total_matches > 0 {
            log::debug!(
                "{}segment matches: good={}, bad={}, total={}",
                self.cfg.context,
                s.good_matches,
                s.bad_matches,
                s.total_matches
            );
        }
        if s.total_hashes > 0 {
            log::debug!(
                "{}segmentation collisions: {:.3}% [{} hashes]",
                self.cfg.context,
                100.0 * s.l2_collisions as f64 / s.total_hashes as f64,
                s.total_hashes
            );
        }
        for (byte, count) in &self.repcoll {
            log::debug!(
                "{}avoided {count} collisions in {byte:#04x}-byte sequences",
                self.cfg.context
            );
        }
    }
}

/// Create a segmenter for one category.
///
/// Granularities with a dedicated compile-time specialisation (1, plus
/// the common PCM frame sizes) avoid per-byte multiplies; anything else
/// takes the variable-granularity path.
pub fn new_segmenter(
    cfg: SegmenterConfig,
    granularity: u32,
    block_mgr: Arc<BlockManager>,
    progress: Arc<Progress>,
    block_ready: BlockReadyFn,
) -> Box<dyn SegmenterApi> {
    match granularity {
        0 | 1 => Box::new(SegmenterCore::new(
            cfg,
            ConstGranularity::<1>,
            block_mgr,
            progress,
            block_ready,
        )),
        2 => Box::new(SegmenterCore::new(cfg, ConstGranularity::<2>, block_mgr, progress, block_ready)),
        3 => Box::new(SegmenterCore::new(cfg, ConstGranularity::<3>, block_mgr, progress, block_ready)),
        4 => Box::new(SegmenterCore::new(cfg, ConstGranularity::<4>, block_mgr, progress, block_ready)),
        6 => Box::new(SegmenterCore::new(cfg, ConstGranularity::<6>, block_mgr, progress, block_ready)),
        g => Box::new(SegmenterCore::new(cfg, VarGranularity(g), block_mgr, progress, block_ready)),
    }
}
