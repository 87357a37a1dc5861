//! Filesystem reader: opens an image, validates its sections, decodes the
//! frozen metadata, and serves `lookup` / `readdir` / `readv` / `statvfs`
//! over the block cache.
//!
//! On open, every non-block section is checksum-verified (xxh3); blocks
//! are verified lazily when the cache first decompresses them.  A full
//! verification pass over all sections, including the SHA-512/256 chain,
//! is available as [`Filesystem::check_integrity`].

pub mod cache;

use serde_json::json;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec;
use crate::entry::InodeRank;
use crate::error::{Error, Result};
use crate::history::History;
use crate::metadata::{self, Chunk, Metadata, HOLE_BLOCK};
use crate::section::{self, RawSection, SectionType};

pub use cache::{BlockCache, BlockFuture, BlockSource, CacheOptions, TidyStrategy};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOffset {
    Exact(u64),
    /// Scan forward for the first section header.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlockMode {
    None,
    /// Log a warning when mlock fails.
    Try,
    /// Abort the open when mlock fails.
    Must,
}

#[derive(Clone)]
pub struct FilesystemOptions {
    pub image_offset: ImageOffset,
    pub mlock: MlockMode,
    pub cache: CacheOptions,
    /// Verify the SHA-512/256 chain of every section on open.
    pub full_check: bool,
    /// Report true hardlink counts instead of 1.
    pub enable_nlink: bool,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        FilesystemOptions {
            image_offset: ImageOffset::Exact(0),
            mlock: MlockMode::None,
            cache: CacheOptions::default(),
            full_check: false,
            enable_nlink: false,
        }
    }
}

// ── Stat results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub files: u64,
    pub namemax: u64,
}

/// One piece of a `readv` result.
pub enum ByteSpan {
    Mapped {
        block: Arc<Vec<u8>>,
        offset: usize,
        len: usize,
    },
    /// A hole; reads as `len` zero bytes.
    Zero { len: usize },
}

impl ByteSpan {
    pub fn len(&self) -> usize {
        match self {
            ByteSpan::Mapped { len, .. } | ByteSpan::Zero { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_to(&self, out: &mut Vec<u8>) {
        match self {
            ByteSpan::Mapped { block, offset, len } => {
                out.extend_from_slice(&block[*offset..*offset + *len]);
            }
            ByteSpan::Zero { len } => out.resize(out.len() + len, 0),
        }
    }
}

/// A pending span: resolves to a [`ByteSpan`] when the block is ready.
pub enum SpanFuture {
    Pending {
        future: BlockFuture,
        offset: usize,
        len: usize,
    },
    Zero { len: usize },
}

impl SpanFuture {
    pub fn wait(self) -> Result<ByteSpan> {
        match self {
            SpanFuture::Pending { future, offset, len } => Ok(ByteSpan::Mapped {
                block: future.wait()?,
                offset,
                len,
            }),
            SpanFuture::Zero { len } => Ok(ByteSpan::Zero { len }),
        }
    }
}

// ── Filesystem ───────────────────────────────────────────────────────────────

pub struct Filesystem {
    path: PathBuf,
    metadata: Metadata,
    cache: BlockCache,
    sections: Vec<RawSection>,
    history: Option<History>,
    header: Option<Vec<u8>>,
    enable_nlink: bool,
    /// Keeps the mlocked metadata buffer resident for the lifetime of the
    /// filesystem.
    _locked_metadata: LockedBuffer,
}

/// A byte buffer optionally pinned into RAM with `mlock`.
struct LockedBuffer {
    buf: Vec<u8>,
    locked: bool,
}

impl LockedBuffer {
    fn new(buf: Vec<u8>, mode: MlockMode) -> Result<Self> {
        let mut locked = false;
        if mode != MlockMode::None && !buf.is_empty() {
            let rc = unsafe { libc::mlock(buf.as_ptr() as *const libc::c_void, buf.len()) };
            if rc == 0 {
                locked = true;
            } else {
                let err = std::io::Error::last_os_error();
                match mode {
                    MlockMode::Must => {
                        return Err(Error::OutOfResources(format!("mlock failed: {err}")))
                    }
                    MlockMode::Try => log::warn!("mlock failed: {err}"),
                    MlockMode::None => {}
                }
            }
        }
        Ok(LockedBuffer { buf, locked })
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        if self.locked {
            unsafe {
                libc::munlock(self.buf.as_ptr() as *const libc::c_void, self.buf.len());
            }
        }
    }
}

impl Filesystem {
    pub fn open(path: impl AsRef<Path>, opts: FilesystemOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| Error::io_read(&path, e))?;

        let image_offset = match opts.image_offset {
            ImageOffset::Exact(o) => o,
            ImageOffset::Auto => section::find_image_offset(&mut file, 1 << 20)
                .map_err(|e| Error::CorruptImage(e.to_string()))?,
        };

        let sections = section::sections_from_index(&mut file, image_offset)
            .map_err(|e| Error::CorruptImage(e.to_string()))?
            .map(Ok)
            .unwrap_or_else(|| {
                section::scan_sections(&mut file, image_offset)
                    .map_err(|e| Error::CorruptImage(e.to_string()))
            })?;

        if sections.is_empty() {
            return Err(Error::CorruptImage("image contains no sections".into()));
        }

        let header = if image_offset > 0 {
            file.seek(SeekFrom::Start(0))
                .map_err(|e| Error::io_read(&path, e))?;
            let mut buf = vec![0u8; image_offset as usize];
            file.read_exact(&mut buf)
                .map_err(|e| Error::io_read(&path, e))?;
            Some(buf)
        } else {
            None
        };

        let read_payload = |file: &mut File, sec: &RawSection| -> Result<Vec<u8>> {
            file.seek(SeekFrom::Start(sec.payload_offset()))
                .map_err(|e| Error::io_read(&path, e))?;
            let mut buf = vec![0u8; sec.header.length as usize];
            file.read_exact(&mut buf)
                .map_err(|e| Error::io_read(&path, e))?;
            Ok(buf)
        };

        let mut schema_bytes: Option<Vec<u8>> = None;
        let mut metadata_raw: Option<Vec<u8>> = None;
        let mut history: Option<History> = None;
        let mut block_sources: Vec<BlockSource> = Vec::new();

        for sec in &sections {
            match sec.header.section_type {
                SectionType::Block => {
                    // Verified lazily by the cache.
                    block_sources.push(BlockSource {
                        header: sec.header,
                        payload_offset: sec.payload_offset(),
                    });
                }
                SectionType::MetadataV2Schema => {
                    let payload = read_payload(&mut file, sec)?;
                    sec.header
                        .verify_fast(&payload)
                        .map_err(|e| Error::CorruptImage(e.to_string()))?;
                    schema_bytes = Some(
                        codec::decompress(sec.header.compression, &payload)
                            .map_err(|e| Error::CorruptImage(e.to_string()))?,
                    );
                }
                SectionType::MetadataV2 => {
                    let payload = read_payload(&mut file, sec)?;
                    sec.header
                        .verify_fast(&payload)
                        .map_err(|e| Error::CorruptImage(e.to_string()))?;
                    metadata_raw = Some(
                        codec::decompress(sec.header.compression, &payload)
                            .map_err(|e| Error::CorruptImage(e.to_string()))?,
                    );
                }
                SectionType::History => {
                    let payload = read_payload(&mut file, sec)?;
                    if sec.header.verify_fast(&payload).is_ok() {
                        if let Ok(raw) = codec::decompress(sec.header.compression, &payload) {
                            history = History::from_bytes(&raw).ok();
                        }
                    } else {
                        log::warn!("history section has a bad checksum; ignoring it");
                    }
                }
                SectionType::SectionIndex => {}
            }
        }

        let schema_bytes =
            schema_bytes.ok_or_else(|| Error::CorruptImage("image has no schema section".into()))?;
        let metadata_raw = metadata_raw
            .ok_or_else(|| Error::CorruptImage("image has no metadata section".into()))?;

        let md = metadata::decode_metadata(&schema_bytes, &metadata_raw)?;
        let locked = LockedBuffer::new(metadata_raw, opts.mlock)?;

        if md.counts.blocks as usize != block_sources.len() {
            return Err(Error::CorruptImage(format!(
                "metadata references {} blocks but the image has {}",
                md.counts.blocks,
                block_sources.len()
            )));
        }

        let cache = BlockCache::new(path.clone(), block_sources, opts.cache.clone())?;

        let fs = Filesystem {
            path,
            metadata: md,
            cache,
            sections,
            history,
            header,
            enable_nlink: opts.enable_nlink,
            _locked_metadata: locked,
        };

        if opts.full_check {
            fs.check_integrity()?;
        }

        Ok(fs)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn history(&self) -> Option<&History> {
        self.history.as_ref()
    }

    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    pub fn root_inode(&self) -> u32 {
        0
    }

    /// Full verification: every section's xxh3 and SHA-512/256.
    pub fn check_integrity(&self) -> Result<()> {
        let mut file = File::open(&self.path).map_err(|e| Error::io_read(&self.path, e))?;
        for sec in &self.sections {
            file.seek(SeekFrom::Start(sec.payload_offset()))
                .map_err(|e| Error::io_read(&self.path, e))?;
            let mut payload = vec![0u8; sec.header.length as usize];
            file.read_exact(&mut payload)
                .map_err(|e| Error::io_read(&self.path, e))?;
            sec.header
                .verify_full(&payload)
                .map_err(|e| Error::CorruptImage(e.to_string()))?;
        }
        Ok(())
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    /// Look up one name inside a directory inode.
    pub fn lookup(&self, dir_inode: u32, name: &str) -> Option<u32> {
        self.metadata.lookup(dir_inode, name)
    }

    /// Resolve a slash-separated path from the root.
    pub fn find_path(&self, path: &str) -> Option<u32> {
        let mut inode = self.root_inode();
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if self.metadata.rank_of(inode) != InodeRank::Directory {
                return None;
            }
            inode = self.lookup(inode, comp)?;
        }
        Some(inode)
    }

    pub fn getattr(&self, inode: u32) -> Result<Stat> {
        if inode >= self.metadata.inode_count() {
            return Err(Error::CorruptImage(format!("inode {inode} out of range")));
        }
        let (atime, mtime, ctime) = self.metadata.times(inode);
        let rank = self.metadata.rank_of(inode);
        let size = match rank {
            InodeRank::Regular => self.metadata.file_size(inode),
            InodeRank::Symlink => self.metadata.symlink_target(inode).len() as u64,
            _ => 0,
        };
        let nlink = if self.enable_nlink || rank == InodeRank::Directory {
            self.metadata.nlink(inode)
        } else {
            1
        };
        Ok(Stat {
            inode,
            mode: self.metadata.mode(inode),
            nlink,
            uid: self.metadata.uid(inode),
            gid: self.metadata.gid(inode),
            size,
            rdev: if rank == InodeRank::Device {
                self.metadata.device_rdev(inode)
            } else {
                0
            },
            atime,
            mtime,
            ctime,
        })
    }

    /// Directory listing; `.` and `..` are the adapter's business.
    pub fn readdir(&self, dir_inode: u32) -> Result<Vec<(String, u32)>> {
        if self.metadata.rank_of(dir_inode) != InodeRank::Directory {
            return Err(Error::CorruptImage(format!(
                "inode {dir_inode} is not a directory"
            )));
        }
        Ok(self
            .metadata
            .dir_entry_range(dir_inode)
            .map(|i| {
                let e = &self.metadata.dir_entries[i];
                (self.metadata.entry_name(e).to_owned(), e.inode)
            })
            .collect())
    }

    pub fn readlink(&self, inode: u32) -> Result<&str> {
        if self.metadata.rank_of(inode) != InodeRank::Symlink {
            return Err(Error::CorruptImage(format!("inode {inode} is not a symlink")));
        }
        Ok(self.metadata.symlink_target(inode))
    }

    pub fn statvfs(&self) -> StatVfs {
        let total = self.metadata.total_file_bytes();
        StatVfs {
            bsize: 512,
            frsize: 512,
            blocks: total.div_ceil(512),
            files: self.metadata.inode_count() as u64,
            namemax: 255,
        }
    }

    // ── Reading ─────────────────────────────────────────────────────────────

    /// Schedule the block reads for `size` bytes at `offset` and return
    /// one future per span.  The spans concatenate, in order, to the
    /// requested byte range (clamped at EOF).
    pub fn readv_lazy(&self, inode: u32, size: u64, offset: u64) -> Result<Vec<SpanFuture>> {
        if self.metadata.rank_of(inode) != InodeRank::Regular {
            return Err(Error::CorruptImage(format!(
                "inode {inode} is not a regular file"
            )));
        }

        let file_size = self.metadata.file_size(inode);
        if offset >= file_size || size == 0 {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(file_size);

        let mut spans = Vec::new();
        let mut pos = 0u64;
        for chunk in self.metadata.chunks_of(inode) {
            let chunk_end = pos + chunk.size as u64;
            if chunk_end <= offset {
                pos = chunk_end;
                continue;
            }
            if pos >= end {
                break;
            }

            let lo = offset.max(pos) - pos;
            let hi = end.min(chunk_end) - pos;
            if chunk.block == HOLE_BLOCK {
                spans.push(SpanFuture::Zero { len: (hi - lo) as usize });
            } else {
                spans.push(SpanFuture::Pending {
                    future: self.cache.get(chunk.block),
                    offset: (chunk.offset as u64 + lo) as usize,
                    len: (hi - lo) as usize,
                });
            }
            pos = chunk_end;
        }

        Ok(spans)
    }

    /// Blocking `readv`: waits for every span.
    pub fn readv(&self, inode: u32, size: u64, offset: u64) -> Result<Vec<ByteSpan>> {
        self.readv_lazy(inode, size, offset)?
            .into_iter()
            .map(SpanFuture::wait)
            .collect()
    }

    /// Convenience: concatenated bytes of a `readv`.
    pub fn read(&self, inode: u32, size: u64, offset: u64) -> Result<Vec<u8>> {
        let spans = self.readv(inode, size, offset)?;
        let mut out = Vec::with_capacity(spans.iter().map(ByteSpan::len).sum());
        for span in &spans {
            span.append_to(&mut out);
        }
        Ok(out)
    }

    /// JSON description of an inode's chunk layout; the adapter exposes
    /// this as the `user.dwarfs.inodeinfo` xattr.
    pub fn inodeinfo(&self, inode: u32) -> Result<serde_json::Value> {
        let rank = self.metadata.rank_of(inode);
        let mut doc = json!({
            "inode": inode,
            "rank": format!("{rank:?}").to_lowercase(),
            "mode": format!("{:o}", self.metadata.mode(inode)),
        });
        if rank == InodeRank::Regular {
            let chunks: Vec<_> = self
                .metadata
                .chunks_of(inode)
                .iter()
                .map(|c: &Chunk| {
                    if c.block == HOLE_BLOCK {
                        json!({"hole": true, "size": c.size})
                    } else {
                        let category = self
                            .metadata
                            .block_categories
                            .get(c.block as usize)
                            .and_then(|&cat| self.metadata.category_names.get(cat as usize))
                            .cloned();
                        json!({
                            "block": c.block,
                            "offset": c.offset,
                            "size": c.size,
                            "category": category,
                        })
                    }
                })
                .collect();
            doc["chunks"] = json!(chunks);
            doc["size"] = json!(self.metadata.file_size(inode));
        }
        Ok(doc)
    }
}
