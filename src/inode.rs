//! Inode manager: content deduplication, inode numbering, per-category
//! fragment grouping and ordering.
//!
//! Files are grouped by content hash so every distinct content is stored
//! once; duplicate files become separate inodes sharing the chunk range of
//! their representative.  Inode numbers are handed out by rank
//! (`directory, symlink, regular, device, other`), matching the frozen
//! metadata layout; within the regular rank, records sharing content sit
//! next to each other with multi-reference groups first, which is what the
//! packed shared-files table relies on.
//!
//! Per category, the manager publishes the *ordered span* of fragments the
//! segmenter will consume.  Ordering runs on the rayon pool; the span is
//! delivered through a one-shot channel the segmenter job blocks on.

use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering as AtomicOrdering;

use crate::categorizer::{CategorizerManager, CategoryId, FragmentCategory};
use crate::entry::{EntryId, EntryKind, EntryTree, FileDataId, InodeRank};
use crate::nilsimsa;
use crate::ordering::{order_nilsimsa, OrderElement, SimilarityOrderingOptions};
use crate::progress::Progress;

/// Per-category inode ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderPolicy {
    /// Keep the deduplicated scan order.
    None,
    /// Lexicographic by path.
    Path,
    /// Lexicographic by reverse path.
    RevPath,
    /// Size descending, then reverse path.
    Similarity,
    /// Locality-sensitive-hash clustering (see `ordering`).
    Nilsimsa,
}

impl OrderPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(OrderPolicy::None),
            "path" => Some(OrderPolicy::Path),
            "revpath" => Some(OrderPolicy::RevPath),
            "similarity" => Some(OrderPolicy::Similarity),
            "nilsimsa" => Some(OrderPolicy::Nilsimsa),
            _ => None,
        }
    }
}

/// One category-typed fragment of a unique file content, as consumed by
/// the segmenter.
#[derive(Debug, Clone)]
pub struct FragmentRef {
    /// Representative file-data record holding the bytes.
    pub file: FileDataId,
    /// Unique-content index (chunk table slot).
    pub unique: u32,
    /// Index into the record's fragment list.
    pub fragment_index: u32,
    pub category: FragmentCategory,
    /// Byte offset of the fragment within the file.
    pub offset: u64,
    pub size: u64,
}

/// Inode numbering by rank; derived once after the scan.
pub struct InodeLayout {
    pub dir_inodes: Vec<EntryId>,
    pub symlink_inodes: Vec<EntryId>,
    /// Regular inodes in final order: records grouped by unique content,
    /// groups with two or more members first.
    pub regular_inodes: Vec<FileDataId>,
    pub device_inodes: Vec<EntryId>,
    pub other_inodes: Vec<EntryId>,
    /// entry id → inode number, for non-regular entries.
    pub entry_inode: HashMap<u32, u32>,
}

impl InodeLayout {
    pub fn inode_count(&self) -> u32 {
        (self.dir_inodes.len()
            + self.symlink_inodes.len()
            + self.regular_inodes.len()
            + self.device_inodes.len()
            + self.other_inodes.len()) as u32
    }

    pub fn rank_offset(&self, rank: InodeRank) -> u32 {
        let d = self.dir_inodes.len() as u32;
        let s = self.symlink_inodes.len() as u32;
        let r = self.regular_inodes.len() as u32;
        let v = self.device_inodes.len() as u32;
        match rank {
            InodeRank::Directory => 0,
            InodeRank::Symlink => d,
            InodeRank::Regular => d + s,
            InodeRank::Device => d + s + r,
            InodeRank::Other => d + s + r + v,
        }
    }

    /// Inode number of any entry.
    pub fn inode_of(&self, tree: &EntryTree, id: EntryId) -> u32 {
        match &tree.entry(id).kind {
            EntryKind::File { data } => {
                self.rank_offset(InodeRank::Regular)
                    + tree.file(*data).inode.expect("inode assigned") as u32
            }
            _ => self.entry_inode[&id.0],
        }
    }
}

pub struct InodeManager {
    /// Representative record per unique content.
    pub unique_reps: Vec<FileDataId>,
    /// file-data index → unique-content index.
    pub unique_of_file: Vec<u32>,
    /// Fragments per category, in unique-content order.
    pub category_fragments: HashMap<CategoryId, Vec<FragmentRef>>,
    /// Total fragment bytes per category, for capacity planning.
    pub category_sizes: HashMap<CategoryId, u64>,
}

impl InodeManager {
    /// Deduplicate contents and group fragments by category.
    pub fn build(tree: &EntryTree, progress: &Progress) -> Self {
        let mut by_content: HashMap<([u8; 32], u64), u32> = HashMap::new();
        let mut unique_reps: Vec<FileDataId> = Vec::new();
        let mut unique_of_file: Vec<u32> = Vec::with_capacity(tree.files.len());

        for (i, fd) in tree.files.iter().enumerate() {
            let key = (fd.hash, fd.size);
            match by_content.get(&key) {
                Some(&u) => {
                    unique_of_file.push(u);
                    progress
                        .duplicate_size
                        .fetch_add(fd.size * fd.refs as u64, AtomicOrdering::Relaxed);
                }
                None => {
                    let u = unique_reps.len() as u32;
                    by_content.insert(key, u);
                    unique_reps.push(FileDataId(i as u32));
                    unique_of_file.push(u);
                }
            }
        }

        let mut category_fragments: HashMap<CategoryId, Vec<FragmentRef>> = HashMap::new();
        let mut category_sizes: HashMap<CategoryId, u64> = HashMap::new();

        for (u, &rep) in unique_reps.iter().enumerate() {
            let fd = tree.file(rep);
            let mut offset = 0u64;
            for (fi, frag) in fd.fragments.iter().enumerate() {
                category_fragments
                    .entry(frag.category.value)
                    .or_default()
                    .push(FragmentRef {
                        file: rep,
                        unique: u as u32,
                        fragment_index: fi as u32,
                        category: frag.category,
                        offset,
                        size: frag.length,
                    });
                *category_sizes.entry(frag.category.value).or_default() += frag.length;
                offset += frag.length;
            }
        }

        InodeManager {
            unique_reps,
            unique_of_file,
            category_fragments,
            category_sizes,
        }
    }

    /// Assign inode numbers by rank and write them into the tree.
    pub fn assign_inode_numbers(&self, tree: &mut EntryTree) -> InodeLayout {
        let mut dir_inodes = Vec::new();
        let mut symlink_inodes = Vec::new();
        let mut device_inodes = Vec::new();
        let mut other_inodes = Vec::new();

        tree.walk(|id, e| match e.kind {
            EntryKind::Directory { .. } => dir_inodes.push(id),
            EntryKind::Symlink { .. } => symlink_inodes.push(id),
            EntryKind::Device { .. } => device_inodes.push(id),
            EntryKind::Other => other_inodes.push(id),
            EntryKind::File { .. } => {}
        });

        // Regular rank: group records by unique content; groups with two
        // or more members come first so the shared-files table packs.
        let mut groups: Vec<Vec<FileDataId>> = vec![Vec::new(); self.unique_reps.len()];
        for (i, &u) in self.unique_of_file.iter().enumerate() {
            groups[u as usize].push(FileDataId(i as u32));
        }

        let mut regular_inodes: Vec<FileDataId> = Vec::with_capacity(tree.files.len());
        for group in groups.iter().filter(|g| g.len() >= 2) {
            regular_inodes.extend_from_slice(group);
        }
        for group in groups.iter().filter(|g| g.len() == 1) {
            regular_inodes.extend_from_slice(group);
        }

        for (pos, &fid) in regular_inodes.iter().enumerate() {
            tree.file_mut(fid).inode = Some(pos as u32);
        }

        let mut entry_inode = HashMap::new();
        let d = dir_inodes.len() as u32;
        let s = symlink_inodes.len() as u32;
        let r = regular_inodes.len() as u32;
        let v = device_inodes.len() as u32;
        for (i, id) in dir_inodes.iter().enumerate() {
            entry_inode.insert(id.0, i as u32);
        }
        for (i, id) in symlink_inodes.iter().enumerate() {
            entry_inode.insert(id.0, d + i as u32);
        }
        for (i, id) in device_inodes.iter().enumerate() {
            entry_inode.insert(id.0, d + s + r + i as u32);
        }
        for (i, id) in other_inodes.iter().enumerate() {
            entry_inode.insert(id.0, d + s + r + v + i as u32);
        }

        let layout = InodeLayout {
            dir_inodes,
            symlink_inodes,
            regular_inodes,
            device_inodes,
            other_inodes,
            entry_inode,
        };

        self.dump_inodes(tree, &layout);
        layout
    }

    /// Shared-files mapping: regular-rank position → unique-content index.
    pub fn shared_files_of(&self, layout: &InodeLayout) -> Vec<u32> {
        layout
            .regular_inodes
            .iter()
            .map(|fid| self.unique_of_file[fid.0 as usize])
            .collect()
    }

    /// Publish the ordered fragment span for one category.
    ///
    /// The returned channel delivers exactly once; the per-category
    /// segmenter job blocks on it.
    pub fn ordered_span(
        &self,
        category: CategoryId,
        policy: OrderPolicy,
        tree: &EntryTree,
        mgr: &CategorizerManager,
    ) -> Receiver<Vec<FragmentRef>> {
        let fragments = self
            .category_fragments
            .get(&category)
            .cloned()
            .unwrap_or_default();

        // Subcategories must stay contiguous regardless of policy: the
        // span is partitioned by subcategory, each partition is ordered
        // on its own, and the partitions are concatenated.
        let mut items = fragments;
        items.sort_by(|a, b| {
            if a.category == b.category {
                std::cmp::Ordering::Equal
            } else if mgr.subcategory_less(a.category, b.category) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });

        if policy != OrderPolicy::None {
            let mut groups: Vec<Vec<FragmentRef>> = Vec::new();
            for item in items {
                match groups.last_mut() {
                    Some(g) if g[0].category == item.category => g.push(item),
                    _ => groups.push(vec![item]),
                }
            }
            if groups.len() > 1 {
                // Order each partition independently and splice the
                // results back together in subcategory order.
                let (tx, rx) = bounded(1);
                let receivers: Vec<Receiver<Vec<FragmentRef>>> = groups
                    .into_iter()
                    .map(|g| self.ordered_group(g, policy, tree, category))
                    .collect();
                rayon::spawn(move || {
                    let mut out = Vec::new();
                    for r in receivers {
                        let Ok(part) = r.recv() else { return };
                        out.extend(part);
                    }
                    let _ = tx.send(out);
                });
                return rx;
            }
            let single = groups.into_iter().next().unwrap_or_default();
            return self.ordered_group(single, policy, tree, category);
        }

        deliver(items)
    }

    fn ordered_group(
        &self,
        items: Vec<FragmentRef>,
        policy: OrderPolicy,
        tree: &EntryTree,
        category: CategoryId,
    ) -> Receiver<Vec<FragmentRef>> {
        match policy {
            OrderPolicy::None => deliver(items),
            OrderPolicy::Path => {
                let mut keyed: Vec<(String, FragmentRef)> = items
                    .into_iter()
                    .map(|f| (tree.file(f.file).primary_path.display().to_string(), f))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                deliver(keyed.into_iter().map(|(_, f)| f).collect())
            }
            OrderPolicy::RevPath => {
                let mut keyed: Vec<(String, FragmentRef)> = items
                    .into_iter()
                    .map(|f| (reverse_path(&tree.file(f.file).primary_path), f))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                deliver(keyed.into_iter().map(|(_, f)| f).collect())
            }
            OrderPolicy::Similarity => {
                let mut keyed: Vec<(u64, String, FragmentRef)> = items
                    .into_iter()
                    .map(|f| {
                        (
                            f.size,
                            reverse_path(&tree.file(f.file).primary_path),
                            f,
                        )
                    })
                    .collect();
                keyed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
                deliver(keyed.into_iter().map(|(_, _, f)| f).collect())
            }
            OrderPolicy::Nilsimsa => {
                let elements: Vec<OrderElement> = items
                    .par_iter()
                    .map(|f| {
                        let fd = tree.file(f.file);
                        let digest = std::fs::read(&fd.primary_path).ok().map(|data| {
                            let lo = (f.offset as usize).min(data.len());
                            let hi = ((f.offset + f.size) as usize).min(data.len());
                            nilsimsa::digest(&data[lo..hi])
                        });
                        OrderElement {
                            digest,
                            size: f.size,
                            rev_path: reverse_path(&fd.primary_path),
                        }
                    })
                    .collect();

                let opts = SimilarityOrderingOptions {
                    context: format!("category {category}: "),
                    ..Default::default()
                };

                let (tx, rx) = bounded(1);
                let order_rx = order_nilsimsa(elements, opts);
                rayon::spawn(move || {
                    let Ok(order) = order_rx.recv() else { return };
                    let mut by_index: Vec<Option<FragmentRef>> =
                        items.into_iter().map(Some).collect();
                    let mut out: Vec<FragmentRef> = order
                        .iter()
                        .filter_map(|&i| by_index[i as usize].take())
                        .collect();
                    // Items without a digest (unreadable files) go last,
                    // in their original order.
                    out.extend(by_index.into_iter().flatten());
                    let _ = tx.send(out);
                });
                rx
            }
        }
    }

    fn dump_inodes(&self, tree: &EntryTree, layout: &InodeLayout) {
        let Ok(path) = std::env::var("DWARFS_DUMP_INODES") else { return };
        let reg_base = layout.rank_offset(InodeRank::Regular);
        let out: Vec<_> = layout
            .regular_inodes
            .iter()
            .enumerate()
            .map(|(pos, fid)| {
                let fd = tree.file(*fid);
                serde_json::json!({
                    "inode": reg_base + pos as u32,
                    "size": fd.size,
                    "refs": fd.refs,
                    "unique": self.unique_of_file[fid.0 as usize],
                    "path": fd.primary_path.display().to_string(),
                })
            })
            .collect();
        if let Err(e) =
            std::fs::write(&path, serde_json::to_vec_pretty(&out).unwrap_or_default())
        {
            log::warn!("cannot write DWARFS_DUMP_INODES dump to {path}: {e}");
        }
    }
}

fn deliver(items: Vec<FragmentRef>) -> Receiver<Vec<FragmentRef>> {
    let (tx, rx) = bounded(1);
    let _ = tx.send(items);
    rx
}

fn reverse_path(path: &std::path::Path) -> String {
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.reverse();
    parts.join("/")
}
