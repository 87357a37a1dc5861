//! Block cache: LRU over decompressed blocks with parallel background
//! decompression, request coalescing, and adaptive sequential prefetch.
//!
//! Entries move `missing → decompressing → ready` under the map lock.
//! Concurrent requests for the same block register as waiters on the
//! in-flight entry, so every block is decompressed exactly once no matter
//! how many readers ask for it.  When the last few requests hit
//! consecutive block numbers, the next blocks are scheduled speculatively.
//!
//! An optional tidy pass evicts blocks by age; the `swap` strategy is a
//! stricter variant of the time strategy that also drops blocks untouched
//! since the previous sweep.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::codec;
use crate::error::{Error, Result};
use crate::section::SectionHeader;

/// Where to find one block inside the image file.
#[derive(Debug, Clone)]
pub struct BlockSource {
    pub header: SectionHeader,
    /// Absolute file offset of the payload.
    pub payload_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TidyStrategy {
    None,
    /// Evict blocks older than `max_age`.
    Time,
    /// Evict blocks not accessed since the previous sweep.
    Swap,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Upper bound on decompressed bytes held by the cache.
    pub max_bytes: usize,
    pub num_workers: usize,
    /// Blocks whose compressed/uncompressed ratio is above this are not
    /// kept in the cache after their waiters are served — decompressing
    /// them again is cheaper than the memory.
    pub decompress_ratio: f64,
    /// Number of trailing consecutive accesses that triggers prefetch.
    pub sequential_threshold: usize,
    /// How many blocks to prefetch once sequential access is detected.
    pub prefetch_count: usize,
    pub tidy: TidyStrategy,
    pub tidy_interval: Duration,
    pub tidy_max_age: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            max_bytes: 512 << 20,
            num_workers: num_cpus::get().min(8),
            decompress_ratio: 0.8,
            sequential_threshold: 4,
            prefetch_count: 2,
            tidy: TidyStrategy::None,
            tidy_interval: Duration::from_secs(5),
            tidy_max_age: Duration::from_secs(60),
        }
    }
}

type BlockResult = std::result::Result<Arc<Vec<u8>>, String>;

enum EntryState {
    Decompressing {
        waiters: Vec<Sender<BlockResult>>,
    },
    Ready {
        data: Arc<Vec<u8>>,
        last_access: Instant,
    },
}

struct CacheInner {
    entries: HashMap<u32, EntryState>,
    total_bytes: usize,
    /// Recent distinct block numbers, newest last; drives prefetch.
    recent: Vec<u32>,
    last_sweep: Instant,
}

/// A pending read of one block range; resolves to the decompressed block.
pub struct BlockFuture {
    rx: Receiver<BlockResult>,
    immediate: Option<Arc<Vec<u8>>>,
}

impl BlockFuture {
    pub fn wait(self) -> Result<Arc<Vec<u8>>> {
        if let Some(data) = self.immediate {
            return Ok(data);
        }
        self.rx
            .recv()
            .map_err(|_| Error::OutOfResources("block cache worker died".into()))?
            .map_err(Error::CorruptImage)
    }
}

pub struct BlockCache {
    inner: Arc<Mutex<CacheInner>>,
    sources: Arc<Vec<BlockSource>>,
    job_tx: Sender<u32>,
    opts: CacheOptions,
}

impl BlockCache {
    pub fn new(image_path: PathBuf, sources: Vec<BlockSource>, opts: CacheOptions) -> Result<Self> {
        let sources = Arc::new(sources);
        let inner = Arc::new(Mutex::new(CacheInner {
            entries: HashMap::new(),
            total_bytes: 0,
            recent: Vec::new(),
            last_sweep: Instant::now(),
        }));

        let (job_tx, job_rx) = unbounded::<u32>();

        for _ in 0..opts.num_workers.max(1) {
            let job_rx: Receiver<u32> = job_rx.clone();
            let inner = Arc::clone(&inner);
            let sources = Arc::clone(&sources);
            let opts = opts.clone();
            let mut file = File::open(&image_path).map_err(|e| Error::io_read(&image_path, e))?;
            std::thread::spawn(move || {
                for block_no in job_rx {
                    let source = &sources[block_no as usize];
                    let result = decompress_block(&mut file, source);
                    finish_block(&inner, &opts, block_no, source.header.length, result);
                }
            });
        }

        if opts.tidy != TidyStrategy::None {
            let inner = Arc::clone(&inner);
            let opts_t = opts.clone();
            std::thread::spawn(move || loop {
                std::thread::sleep(opts_t.tidy_interval);
                // All handles share `inner`; when the cache is dropped the
                // Arc count decays and this sweeper exits.
                if Arc::strong_count(&inner) == 1 {
                    break;
                }
                tidy_sweep(&inner, &opts_t);
            });
        }

        Ok(BlockCache {
            inner,
            sources,
            job_tx,
            opts,
        })
    }

    pub fn block_count(&self) -> usize {
        self.sources.len()
    }

    /// Section header and payload location of one block.
    pub fn block_source(&self, block_no: u32) -> &BlockSource {
        &self.sources[block_no as usize]
    }

    /// Request a block; the returned future resolves once the block is
    /// decompressed.  Concurrent requests coalesce onto one job.
    pub fn get(&self, block_no: u32) -> BlockFuture {
        let mut schedule = Vec::new();
        let future;
        {
            let mut inner = self.inner.lock().unwrap();

            track_access(&mut inner, block_no, &self.opts, self.sources.len(), &mut schedule);

            match inner.entries.get_mut(&block_no) {
                Some(EntryState::Ready { data, last_access, .. }) => {
                    *last_access = Instant::now();
                    future = BlockFuture {
                        rx: bounded(0).1,
                        immediate: Some(Arc::clone(data)),
                    };
                }
                Some(EntryState::Decompressing { waiters }) => {
                    let (tx, rx) = bounded(1);
                    waiters.push(tx);
                    future = BlockFuture { rx, immediate: None };
                }
                None => {
                    let (tx, rx) = bounded(1);
                    inner
                        .entries
                        .insert(block_no, EntryState::Decompressing { waiters: vec![tx] });
                    schedule.push(block_no);
                    future = BlockFuture { rx, immediate: None };
                }
            }
        }
        for b in schedule {
            let _ = self.job_tx.send(b);
        }
        future
    }

    /// Schedule a block for decompression without waiting for it.
    fn prefetch_locked(inner: &mut CacheInner, block_no: u32, schedule: &mut Vec<u32>) {
        if !inner.entries.contains_key(&block_no) {
            inner
                .entries
                .insert(block_no, EntryState::Decompressing { waiters: Vec::new() });
            schedule.push(block_no);
        }
    }
}

fn track_access(
    inner: &mut CacheInner,
    block_no: u32,
    opts: &CacheOptions,
    block_count: usize,
    schedule: &mut Vec<u32>,
) {
    if inner.recent.last() != Some(&block_no) {
        inner.recent.push(block_no);
        let keep = opts.sequential_threshold.max(2);
        if inner.recent.len() > keep {
            let excess = inner.recent.len() - keep;
            inner.recent.drain(..excess);
        }
    }

    let k = opts.sequential_threshold;
    if k >= 2 && inner.recent.len() >= k {
        let tail = &inner.recent[inner.recent.len() - k..];
        let sequential = tail.windows(2).all(|w| w[1] == w[0] + 1);
        if sequential {
            for next in 1..=opts.prefetch_count as u32 {
                let b = block_no + next;
                if (b as usize) < block_count {
                    BlockCache::prefetch_locked(inner, b, schedule);
                }
            }
        }
    }
}

fn decompress_block(file: &mut File, source: &BlockSource) -> BlockResult {
    let mut payload = vec![0u8; source.header.length as usize];
    file.seek(SeekFrom::Start(source.payload_offset))
        .and_then(|_| file.read_exact(&mut payload))
        .map_err(|e| format!("block read failed: {e}"))?;

    source
        .header
        .verify_fast(&payload)
        .map_err(|e| e.to_string())?;

    let data = codec::decompress(source.header.compression, &payload)
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(data))
}

fn finish_block(
    inner: &Arc<Mutex<CacheInner>>,
    opts: &CacheOptions,
    block_no: u32,
    compressed_len: u64,
    result: BlockResult,
) {
    let mut inner = inner.lock().unwrap();
    let Some(state) = inner.entries.remove(&block_no) else { return };
    let EntryState::Decompressing { waiters } = state else {
        // An eviction raced us; the waiters were already served.
        return;
    };

    match result {
        Ok(data) => {
            for w in &waiters {
                let _ = w.send(Ok(Arc::clone(&data)));
            }

            // Blocks that barely compressed are cheaper to decompress
            // again than to hold decompressed.
            let ratio = compressed_len as f64 / data.len().max(1) as f64;
            if ratio < opts.decompress_ratio || opts.decompress_ratio >= 1.0 {
                inner.total_bytes += data.len();
                inner.entries.insert(
                    block_no,
                    EntryState::Ready {
                        data,
                        last_access: Instant::now(),
                    },
                );
                evict_lru(&mut inner, opts.max_bytes);
            }
        }
        Err(e) => {
            for w in waiters {
                let _ = w.send(Err(e.clone()));
            }
        }
    }
}

fn evict_lru(inner: &mut CacheInner, max_bytes: usize) {
    while inner.total_bytes > max_bytes {
        let victim = inner
            .entries
            .iter()
            .filter_map(|(&no, st)| match st {
                EntryState::Ready { last_access, .. } => Some((no, *last_access)),
                _ => None,
            })
            .min_by_key(|&(_, t)| t);
        let Some((no, _)) = victim else { break };
        if let Some(EntryState::Ready { data, .. }) = inner.entries.remove(&no) {
            inner.total_bytes -= data.len();
        }
    }
}

fn tidy_sweep(inner: &Arc<Mutex<CacheInner>>, opts: &CacheOptions) {
    let mut inner = inner.lock().unwrap();
    let now = Instant::now();
    let cutoff = match opts.tidy {
        TidyStrategy::Time => opts.tidy_max_age,
        TidyStrategy::Swap => now.duration_since(inner.last_sweep),
        TidyStrategy::None => return,
    };
    inner.last_sweep = now;

    let expired: Vec<u32> = inner
        .entries
        .iter()
        .filter_map(|(&no, st)| match st {
            EntryState::Ready { last_access, .. }
                if now.duration_since(*last_access) > cutoff =>
            {
                Some(no)
            }
            _ => None,
        })
        .collect();

    for no in expired {
        if let Some(EntryState::Ready { data, .. }) = inner.entries.remove(&no) {
            inner.total_bytes -= data.len();
            log::trace!("tidy: evicted block {no} ({} bytes)", data.len());
        }
    }
}
