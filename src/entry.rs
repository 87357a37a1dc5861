//! Scan-tree entries: the in-memory representation of the input tree
//! between scanning and metadata building.
//!
//! Entries live in a flat arena and refer to each other by index, so the
//! parent back-reference is a plain non-owning `EntryId` and ownership
//! only runs downward.  Regular files point at a shared *file-data
//! record*; hardlinks (same device/inode in the input) and the scanner's
//! content deduplication both funnel into that table, so
//! `hardlink_count(file) == refs` of its record.

use std::path::PathBuf;

use crate::categorizer::InodeFragments;

/// Index into [`EntryTree::entries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub u32);

/// Index into [`EntryTree::files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDataId(pub u32);

/// Mode bits for the entry-kind rank used by the metadata inode layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InodeRank {
    Directory = 0,
    Symlink = 1,
    Regular = 2,
    Device = 3,
    Other = 4,
}

#[derive(Debug, Clone)]
pub enum EntryKind {
    Directory {
        /// Sorted by entry name during finalisation.
        children: Vec<EntryId>,
    },
    File {
        data: FileDataId,
    },
    Symlink {
        target: String,
    },
    /// Character or block device; `rdev` from the input stat.
    Device {
        rdev: u64,
    },
    /// Fifo or socket.
    Other,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub parent: Option<EntryId>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub kind: EntryKind,
}

impl Entry {
    pub fn rank(&self) -> InodeRank {
        match &self.kind {
            EntryKind::Directory { .. } => InodeRank::Directory,
            EntryKind::Symlink { .. } => InodeRank::Symlink,
            EntryKind::File { .. } => InodeRank::Regular,
            EntryKind::Device { .. } => InodeRank::Device,
            EntryKind::Other => InodeRank::Other,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }
}

/// One extent of a regular file; the union of extents covers `[0, size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Data { offset: u64, len: u64 },
    Hole { offset: u64, len: u64 },
}

impl Extent {
    pub fn len(&self) -> u64 {
        match self {
            Extent::Data { len, .. } | Extent::Hole { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared per-content record; one per hardlink group before content
/// dedup, refined by the inode manager afterwards.
#[derive(Debug, Clone)]
pub struct FileData {
    pub size: u64,
    /// BLAKE3 of the file contents; in-process identity only.
    pub hash: [u8; 32],
    /// Number of entries referring to this record.
    pub refs: u32,
    /// Path the contents are (re)read from during segmentation.
    pub primary_path: PathBuf,
    pub fragments: InodeFragments,
    pub extents: Vec<Extent>,
    /// Filled in by the inode manager during finalisation.
    pub inode: Option<u32>,
}

impl FileData {
    pub fn has_holes(&self) -> bool {
        self.extents.iter().any(|e| matches!(e, Extent::Hole { .. }))
    }
}

/// The complete scan result.
pub struct EntryTree {
    pub entries: Vec<Entry>,
    pub files: Vec<FileData>,
    pub root: EntryId,
}

impl EntryTree {
    pub fn entry(&self, id: EntryId) -> &Entry {
        &self.entries[id.0 as usize]
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        &mut self.entries[id.0 as usize]
    }

    pub fn file(&self, id: FileDataId) -> &FileData {
        &self.files[id.0 as usize]
    }

    pub fn file_mut(&mut self, id: FileDataId) -> &mut FileData {
        &mut self.files[id.0 as usize]
    }

    /// Full path of an entry, for diagnostics.
    pub fn path_of(&self, id: EntryId) -> PathBuf {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let e = self.entry(c);
            if !e.name.is_empty() {
                parts.push(e.name.clone());
            }
            cur = e.parent;
        }
        parts.iter().rev().collect()
    }

    /// Path with components reversed, the similarity tie-breaking key.
    pub fn reverse_path_of(&self, id: EntryId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let e = self.entry(c);
            if !e.name.is_empty() {
                parts.push(e.name.clone());
            }
            cur = e.parent;
        }
        parts.join("/")
    }

    /// Sort every directory's children by name; binary-searchable order is
    /// an on-disk invariant.
    pub fn sort_directories(&mut self) {
        for i in 0..self.entries.len() {
            let EntryKind::Directory { children } = &self.entries[i].kind else {
                continue;
            };
            let mut sorted = children.clone();
            sorted.sort_by(|&a, &b| {
                self.entries[a.0 as usize]
                    .name
                    .cmp(&self.entries[b.0 as usize].name)
            });
            if let EntryKind::Directory { children } = &mut self.entries[i].kind {
                *children = sorted;
            }
        }
    }

    /// Depth-first walk in directory order.
    pub fn walk(&self, mut f: impl FnMut(EntryId, &Entry)) {
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let e = self.entry(id);
            f(id, e);
            if let EntryKind::Directory { children } = &e.kind {
                for &c in children.iter().rev() {
                    stack.push(c);
                }
            }
        }
    }
}
