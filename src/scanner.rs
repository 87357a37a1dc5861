//! Input scanner: walks the source tree, captures stat data, hashes and
//! categorizes file contents, and detects hardlinks and sparse extents.
//!
//! The walk itself is single-threaded (it populates the entry arena);
//! hashing and categorization fan out over the rayon pool afterwards.
//! A file that fails to read is demoted to an empty file and counted in
//! `progress.errors` — the run continues and finishes with exit code 2.
//!
//! Diagnostics: setting `DWARFS_DUMP_FILES_RAW` / `DWARFS_DUMP_FILES_FINAL`
//! to a path makes the scanner write a JSON dump of the file list before /
//! after content processing.

use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use walkdir::WalkDir;

use crate::categorizer::{CategorizerManager, InodeFragments};
use crate::entry::{Entry, EntryId, EntryKind, EntryTree, Extent, FileData, FileDataId};
use crate::error::{Error, Result};
use crate::progress::Progress;

/// Hole detection scans in multiples of this.
const HOLE_SCAN_GRANULARITY: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Replace every entry's owner with this uid.
    pub set_owner: Option<u32>,
    /// Replace every entry's group with this gid.
    pub set_group: Option<u32>,
    /// Replace every timestamp with this epoch value.
    pub set_time: Option<u64>,
    /// Octal permission bits forced onto every entry (file type preserved).
    pub chmod: Option<u32>,
    /// Keep atime/ctime instead of collapsing them onto mtime.
    pub keep_all_times: bool,
    /// Detect runs of zero bytes and store them as holes.
    pub detect_sparse_files: bool,
    /// Shortest zero run stored as a hole.
    pub min_hole_size: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            set_owner: None,
            set_group: None,
            set_time: None,
            chmod: None,
            keep_all_times: false,
            detect_sparse_files: false,
            min_hole_size: 64 * 1024,
        }
    }
}

pub struct Scanner<'a> {
    opts: ScanOptions,
    categorizer: &'a CategorizerManager,
    progress: Arc<Progress>,
}

struct PendingFile {
    entry: EntryId,
    path: PathBuf,
    size: u64,
}

impl<'a> Scanner<'a> {
    pub fn new(
        opts: ScanOptions,
        categorizer: &'a CategorizerManager,
        progress: Arc<Progress>,
    ) -> Self {
        Scanner {
            opts,
            categorizer,
            progress,
        }
    }

    /// Scan a whole directory tree rooted at `root`.
    pub fn scan(&self, root: &Path) -> Result<EntryTree> {
        self.scan_filtered(root, None)
    }

    /// Scan only the paths listed in `list` (relative to `root`), plus the
    /// directories needed to reach them.
    pub fn scan_list(&self, root: &Path, list: &[PathBuf]) -> Result<EntryTree> {
        let set: std::collections::HashSet<PathBuf> =
            list.iter().map(|p| root.join(p)).collect();
        self.scan_filtered(root, Some(&set))
    }

    fn scan_filtered(
        &self,
        root: &Path,
        filter: Option<&std::collections::HashSet<PathBuf>>,
    ) -> Result<EntryTree> {
        let root_meta = fs::symlink_metadata(root)
            .map_err(|e| Error::io_read(root, e))?;
        if !root_meta.is_dir() {
            return Err(Error::Config(format!(
                "input '{}' is not a directory",
                root.display()
            )));
        }

        let mut tree = EntryTree {
            entries: Vec::new(),
            files: Vec::new(),
            root: EntryId(0),
        };
        tree.entries.push(self.make_entry(String::new(), None, &root_meta, EntryKind::Directory {
            children: Vec::new(),
        }));
        self.progress.dirs_scanned.fetch_add(1, Ordering::Relaxed);

        let mut dir_ids: HashMap<PathBuf, EntryId> = HashMap::new();
        dir_ids.insert(root.to_path_buf(), EntryId(0));

        // (input dev, input ino) → file-data record, for hardlink folding.
        let mut link_map: HashMap<(u64, u64), FileDataId> = HashMap::new();
        let mut pending: Vec<PendingFile> = Vec::new();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for item in walker {
            let item = match item {
                Ok(i) => i,
                Err(e) => {
                    log::warn!("scan error: {e}");
                    self.progress.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if let Some(wanted) = filter {
                let is_wanted = wanted.iter().any(|w| {
                    w == item.path() || w.starts_with(item.path()) || item.path().starts_with(w)
                });
                if !is_wanted {
                    continue;
                }
            }

            let parent_path = item.path().parent().unwrap_or(root);
            let Some(&parent) = dir_ids.get(parent_path) else {
                // Parent was skipped due to an error; skip the child too.
                continue;
            };

            let meta = match item.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("stat failed for {}: {e}", item.path().display());
                    self.progress.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let name = item.file_name().to_string_lossy().into_owned();
            let ft = meta.file_type();

            let id = EntryId(tree.entries.len() as u32);

            if ft.is_dir() {
                tree.entries.push(self.make_entry(
                    name,
                    Some(parent),
                    &meta,
                    EntryKind::Directory { children: Vec::new() },
                ));
                dir_ids.insert(item.path().to_path_buf(), id);
                self.progress.dirs_scanned.fetch_add(1, Ordering::Relaxed);
            } else if ft.is_symlink() {
                let target = match fs::read_link(item.path()) {
                    Ok(t) => t.to_string_lossy().into_owned(),
                    Err(e) => {
                        log::warn!("readlink failed for {}: {e}", item.path().display());
                        self.progress.errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                };
                tree.entries.push(self.make_entry(
                    name,
                    Some(parent),
                    &meta,
                    EntryKind::Symlink { target },
                ));
                self.progress.symlinks_scanned.fetch_add(1, Ordering::Relaxed);
            } else if ft.is_file() {
                let (dev, ino, size) = stat_identity(&meta);
                let data_id = match link_map.get(&(dev, ino)) {
                    Some(&fid) => {
                        // Hardlink to an already-seen file.
                        tree.files[fid.0 as usize].refs += 1;
                        self.progress.hardlink_size.fetch_add(size, Ordering::Relaxed);
                        fid
                    }
                    None => {
                        let fid = FileDataId(tree.files.len() as u32);
                        tree.files.push(FileData {
                            size,
                            hash: [0; 32],
                            refs: 1,
                            primary_path: item.path().to_path_buf(),
                            fragments: InodeFragments::empty(),
                            extents: vec![Extent::Data { offset: 0, len: size }],
                            inode: None,
                        });
                        link_map.insert((dev, ino), fid);
                        pending.push(PendingFile {
                            entry: id,
                            path: item.path().to_path_buf(),
                            size,
                        });
                        fid
                    }
                };
                tree.entries.push(self.make_entry(
                    name,
                    Some(parent),
                    &meta,
                    EntryKind::File { data: data_id },
                ));
                self.progress.files_scanned.fetch_add(1, Ordering::Relaxed);
                self.progress.original_size.fetch_add(size, Ordering::Relaxed);
            } else {
                let kind = device_kind(&meta);
                tree.entries.push(self.make_entry(name, Some(parent), &meta, kind));
                self.progress.specials_scanned.fetch_add(1, Ordering::Relaxed);
            }

            if let EntryKind::Directory { children } =
                &mut tree.entries[parent.0 as usize].kind
            {
                children.push(id);
            }
        }

        self.dump_files("DWARFS_DUMP_FILES_RAW", &tree);

        self.process_contents(&mut tree, pending);
        tree.sort_directories();

        self.dump_files("DWARFS_DUMP_FILES_FINAL", &tree);

        Ok(tree)
    }

    /// Hash + hole-scan + categorize all unique files in parallel.
    fn process_contents(&self, tree: &mut EntryTree, pending: Vec<PendingFile>) {
        struct Processed {
            entry: EntryId,
            hash: [u8; 32],
            fragments: InodeFragments,
            extents: Vec<Extent>,
            size: u64,
            failed: bool,
        }

        let results: Vec<Processed> = pending
            .par_iter()
            .map(|pf| {
                let data = match fs::read(&pf.path) {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("read failed for {}: {e}", pf.path.display());
                        return Processed {
                            entry: pf.entry,
                            hash: *blake3::hash(b"").as_bytes(),
                            fragments: InodeFragments::empty(),
                            extents: vec![],
                            size: 0,
                            failed: true,
                        };
                    }
                };

                let hash = *blake3::hash(&data).as_bytes();

                let extents = if self.opts.detect_sparse_files {
                    find_zero_extents(&data, self.opts.min_hole_size)
                } else {
                    vec![Extent::Data { offset: 0, len: data.len() as u64 }]
                };

                let mut job = self.categorizer.job(&pf.path);
                job.set_total_size(data.len() as u64);
                job.categorize_random_access(&data);
                job.categorize_sequential(&data);
                let fragments = job.result();

                let _ = pf.size; // stat size may be stale; trust the read
                Processed {
                    entry: pf.entry,
                    hash,
                    fragments,
                    extents,
                    size: data.len() as u64,
                    failed: false,
                }
            })
            .collect();

        for r in results {
            let EntryKind::File { data } = tree.entries[r.entry.0 as usize].kind else {
                unreachable!("pending list only holds files");
            };
            let fd = &mut tree.files[data.0 as usize];
            if r.failed {
                // Demote to an empty file and count the error.
                self.progress.errors.fetch_add(1, Ordering::Relaxed);
                fd.size = 0;
                fd.extents = vec![];
                fd.hash = r.hash;
                fd.fragments = InodeFragments::empty();
                continue;
            }
            fd.size = r.size;
            fd.hash = r.hash;
            fd.extents = r.extents;
            fd.fragments = if r.fragments.is_empty() {
                InodeFragments::single_default(r.size)
            } else {
                debug_assert_eq!(r.fragments.total_size(), r.size);
                r.fragments
            };
        }
    }

    fn make_entry(
        &self,
        name: String,
        parent: Option<EntryId>,
        meta: &fs::Metadata,
        kind: EntryKind,
    ) -> Entry {
        let (mode, uid, gid, atime, mtime, ctime) = stat_fields(meta);

        let mode = match self.opts.chmod {
            Some(bits) => (mode & !0o7777) | (bits & 0o7777),
            None => mode,
        };
        let mtime = self.opts.set_time.unwrap_or(mtime);
        let (atime, ctime) = if self.opts.keep_all_times && self.opts.set_time.is_none() {
            (atime, ctime)
        } else {
            (mtime, mtime)
        };

        Entry {
            name,
            parent,
            mode,
            uid: self.opts.set_owner.unwrap_or(uid),
            gid: self.opts.set_group.unwrap_or(gid),
            atime,
            mtime,
            ctime,
            kind,
        }
    }

    fn dump_files(&self, env_var: &str, tree: &EntryTree) {
        let Ok(path) = std::env::var(env_var) else { return };
        let mut out = Vec::new();
        tree.walk(|id, e| {
            if let EntryKind::File { data } = e.kind {
                let fd = tree.file(data);
                out.push(serde_json::json!({
                    "path": tree.path_of(id).display().to_string(),
                    "size": fd.size,
                    "hash": hex::encode(fd.hash),
                    "fragments": fd.fragments.iter().map(|f| {
                        serde_json::json!({
                            "category": f.category.value,
                            "subcategory": f.category.subcategory,
                            "length": f.length,
                        })
                    }).collect::<Vec<_>>(),
                }));
            }
        });
        if let Err(e) = fs::write(&path, serde_json::to_vec_pretty(&out).unwrap_or_default()) {
            log::warn!("cannot write {env_var} dump to {path}: {e}");
        }
    }
}

// ── Stat helpers ─────────────────────────────────────────────────────────────

#[cfg(unix)]
fn stat_fields(meta: &fs::Metadata) -> (u32, u32, u32, u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (
        meta.mode(),
        meta.uid(),
        meta.gid(),
        meta.atime().max(0) as u64,
        meta.mtime().max(0) as u64,
        meta.ctime().max(0) as u64,
    )
}

#[cfg(not(unix))]
fn stat_fields(meta: &fs::Metadata) -> (u32, u32, u32, u64, u64, u64) {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mode = if meta.is_dir() { 0o040755 } else { 0o100644 };
    (mode, 0, 0, mtime, mtime, mtime)
}

#[cfg(unix)]
fn stat_identity(meta: &fs::Metadata) -> (u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino(), meta.len())
}

#[cfg(not(unix))]
fn stat_identity(meta: &fs::Metadata) -> (u64, u64, u64) {
    (0, 0, meta.len())
}

#[cfg(unix)]
fn device_kind(meta: &fs::Metadata) -> EntryKind {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    let ft = meta.file_type();
    if ft.is_char_device() || ft.is_block_device() {
        EntryKind::Device { rdev: meta.rdev() }
    } else {
        EntryKind::Other
    }
}

#[cfg(not(unix))]
fn device_kind(_meta: &fs::Metadata) -> EntryKind {
    EntryKind::Other
}

// ── Sparse detection ─────────────────────────────────────────────────────────

/// Splits `data` into data/hole extents by scanning for zero runs in
/// [`HOLE_SCAN_GRANULARITY`] steps.  The union of the returned extents is
/// exactly `[0, data.len())` with no overlap.
pub fn find_zero_extents(data: &[u8], min_hole_size: u64) -> Vec<Extent> {
    let gran = HOLE_SCAN_GRANULARITY as usize;
    let mut extents: Vec<Extent> = Vec::new();
    let mut pos = 0usize;

    let mut push = |e: Extent, extents: &mut Vec<Extent>| {
        if e.is_empty() {
            return;
        }
        match (extents.last_mut(), e) {
            (Some(Extent::Data { len, .. }), Extent::Data { len: l2, .. }) => *len += l2,
            (Some(Extent::Hole { len, .. }), Extent::Hole { len: l2, .. }) => *len += l2,
            _ => extents.push(e),
        }
    };

    while pos < data.len() {
        let end = (pos + gran).min(data.len());
        let window = &data[pos..end];
        let is_zero = window.iter().all(|&b| b == 0);
        let ext = if is_zero {
            Extent::Hole { offset: pos as u64, len: window.len() as u64 }
        } else {
            Extent::Data { offset: pos as u64, len: window.len() as u64 }
        };
        push(ext, &mut extents);
        pos = end;
    }

    // Holes below the threshold fold back into data.
    let mut out: Vec<Extent> = Vec::new();
    for e in extents {
        match e {
            Extent::Hole { offset, len } if len < min_hole_size => {
                match out.last_mut() {
                    Some(Extent::Data { len: dl, .. }) => *dl += len,
                    _ => out.push(Extent::Data { offset, len }),
                }
            }
            Extent::Data { offset, len } => match out.last_mut() {
                Some(Extent::Data { len: dl, .. }) => *dl += len,
                _ => out.push(Extent::Data { offset, len }),
            },
            hole => out.push(hole),
        }
    }

    out
}
