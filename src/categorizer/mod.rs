//! Content categorization: classifies file regions into named categories.
//!
//! A categorizer inspects a file and partitions its bytes into typed
//! *fragments* (`{category, subcategory?, length}`).  Categories select
//! per-region policies downstream: codec, ordering, segmentation
//! parameters, granularity.
//!
//! Two interfaces exist: **random-access** categorizers see the whole file
//! at once; **sequential** categorizers receive the file in chunks and
//! report at end of stream.  The per-file [`CategorizerJob`] composes them:
//! random-access categorizers run first in registration order, and the
//! first non-empty partition wins.  If that winner was preceded by a
//! sequential categorizer in the registration order, the earlier
//! sequential categorizers still get to see the stream and the earliest
//! non-empty result overrides.
//!
//! Category ids are opaque integers handed out by the
//! [`CategorizerManager`]; id 0 is always the default category.

pub mod fits;
pub mod incompressible;
pub mod pcmaudio;

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Index into the manager's category-name table.
pub type CategoryId = u32;

/// Name of the implicit category that uncategorized bytes fall into.
pub const DEFAULT_CATEGORY: &str = "<default>";

/// Id of [`DEFAULT_CATEGORY`]; the manager registers it first.
pub const DEFAULT_CATEGORY_ID: CategoryId = 0;

/// Category plus optional categorizer-defined subcategory.
///
/// Subcategories are interned by the owning categorizer, so equal
/// subcategory values denote identical metadata (e.g. the same PCM frame
/// layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentCategory {
    pub value: CategoryId,
    pub subcategory: Option<u32>,
}

impl FragmentCategory {
    pub fn new(value: CategoryId) -> Self {
        FragmentCategory { value, subcategory: None }
    }

    pub fn with_subcategory(value: CategoryId, subcategory: u32) -> Self {
        FragmentCategory { value, subcategory: Some(subcategory) }
    }

    pub const fn default_category() -> Self {
        FragmentCategory { value: DEFAULT_CATEGORY_ID, subcategory: None }
    }
}

/// One contiguous piece of a file's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub category: FragmentCategory,
    pub length: u64,
}

/// An ordered fragment list partitioning a file's byte range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeFragments(pub Vec<Fragment>);

impl InodeFragments {
    pub fn empty() -> Self {
        InodeFragments(Vec::new())
    }

    /// A single fragment covering `size` bytes of the default category.
    pub fn single_default(size: u64) -> Self {
        InodeFragments(vec![Fragment {
            category: FragmentCategory::default_category(),
            length: size,
        }])
    }

    pub fn push(&mut self, category: FragmentCategory, length: u64) {
        if length > 0 {
            self.0.push(Fragment { category, length });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.0.iter().map(|f| f.length).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.0.iter()
    }
}

/// Turns a category name into its id; handed to categorizers so they never
/// see the manager.
pub type CategoryMapper<'a> = dyn Fn(&str) -> CategoryId + 'a;

// ── Categorizer traits ───────────────────────────────────────────────────────

pub trait Categorizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every category name this categorizer can emit.
    fn categories(&self) -> &[&'static str];

    /// Whether results always consist of a single fragment.
    fn is_single_fragment(&self) -> bool {
        false
    }

    /// JSON metadata for a (sub)category, consumed by codecs that declared
    /// metadata requirements.  `None` for categories without metadata.
    fn category_metadata(&self, _category_name: &str, _c: FragmentCategory) -> Option<Value> {
        None
    }

    /// Defines an ordering among subcategories of one category; used to
    /// keep equal frame layouts adjacent in the inode order.
    fn subcategory_less(&self, a: FragmentCategory, b: FragmentCategory) -> bool {
        a.subcategory < b.subcategory
    }
}

/// Sees the whole file at once.
pub trait RandomAccessCategorizer: Categorizer {
    /// Returns an empty partition when the file is not recognised.
    fn categorize(&self, path: &Path, data: &[u8], mapper: &CategoryMapper) -> InodeFragments;
}

/// Receives the file in chunks; reports at end of stream.
pub trait SequentialCategorizer: Categorizer {
    /// `None` when the categorizer can rule the file out by size alone.
    fn job(
        &self,
        path: &Path,
        total_size: u64,
        mapper: &CategoryMapper,
    ) -> Option<Box<dyn SequentialCategorizerJob>>;
}

pub trait SequentialCategorizerJob: Send {
    fn add(&mut self, data: &[u8]);
    /// Empty partition when the stream did not match.
    fn result(self: Box<Self>) -> InodeFragments;
}

enum Registered {
    Random(Arc<dyn RandomAccessCategorizer>),
    Sequential(Arc<dyn SequentialCategorizer>),
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Owns the registered categorizers and the category-name table.
pub struct CategorizerManager {
    categorizers: Vec<Registered>,
    /// category id → (name, categorizer index); index is `usize::MAX` for
    /// the default category, which no categorizer owns.
    categories: Vec<(String, usize)>,
    catmap: HashMap<String, CategoryId>,
}

impl Default for CategorizerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CategorizerManager {
    pub fn new() -> Self {
        let mut mgr = CategorizerManager {
            categorizers: Vec::new(),
            categories: Vec::new(),
            catmap: HashMap::new(),
        };
        mgr.insert_category(DEFAULT_CATEGORY, usize::MAX);
        mgr
    }

    fn insert_category(&mut self, name: &str, categorizer_index: usize) {
        if self.catmap.contains_key(name) {
            log::warn!("duplicate category: {name}");
            return;
        }
        let id = self.categories.len() as CategoryId;
        self.catmap.insert(name.to_owned(), id);
        self.categories.push((name.to_owned(), categorizer_index));
    }

    pub fn add_random_access(&mut self, c: Arc<dyn RandomAccessCategorizer>) {
        let idx = self.categorizers.len();
        for name in c.categories() {
            self.insert_category(name, idx);
        }
        self.categorizers.push(Registered::Random(c));
    }

    pub fn add_sequential(&mut self, c: Arc<dyn SequentialCategorizer>) {
        let idx = self.categorizers.len();
        for name in c.categories() {
            self.insert_category(name, idx);
        }
        self.categorizers.push(Registered::Sequential(c));
    }

    /// Create the built-in categorizers named in `names`, in priority order.
    pub fn with_builtins(names: &[String]) -> Result<Self, String> {
        let mut mgr = Self::new();
        for name in names {
            match name.as_str() {
                "pcmaudio" => mgr.add_random_access(Arc::new(pcmaudio::PcmAudioCategorizer::new())),
                "fits" => mgr.add_random_access(Arc::new(fits::FitsCategorizer::new())),
                "incompressible" => {
                    mgr.add_sequential(Arc::new(incompressible::IncompressibleCategorizer::default()))
                }
                other => return Err(format!("unknown categorizer: {other}")),
            }
        }
        Ok(mgr)
    }

    pub fn category(&self, name: &str) -> Option<CategoryId> {
        self.catmap.get(name).copied()
    }

    pub fn category_name(&self, id: CategoryId) -> &str {
        &self.categories[id as usize].0
    }

    pub fn num_categories(&self) -> usize {
        self.categories.len()
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|(n, _)| n.as_str())
    }

    /// Metadata for a category, from the categorizer that owns it.
    pub fn category_metadata(&self, c: FragmentCategory) -> Option<Value> {
        let (name, idx) = self.categories.get(c.value as usize)?;
        let cat = self.categorizers.get(*idx)?;
        let inner: &dyn Categorizer = match cat {
            Registered::Random(r) => r.as_ref(),
            Registered::Sequential(s) => s.as_ref(),
        };
        inner.category_metadata(name, c)
    }

    pub fn subcategory_less(&self, a: FragmentCategory, b: FragmentCategory) -> bool {
        if a.value != b.value {
            return a.value < b.value;
        }
        let idx = self.categories[a.value as usize].1;
        match self.categorizers.get(idx) {
            Some(Registered::Random(r)) => r.subcategory_less(a, b),
            Some(Registered::Sequential(s)) => s.subcategory_less(a, b),
            None => a.subcategory < b.subcategory,
        }
    }

    /// Start a categorization job for one file.
    pub fn job<'mgr>(&'mgr self, path: &Path) -> CategorizerJob<'mgr> {
        CategorizerJob {
            mgr: self,
            path: path.to_owned(),
            best: InodeFragments::empty(),
            best_index: None,
            is_global_best: false,
            total_size: 0,
            seq_jobs: Vec::new(),
        }
    }
}

// ── Per-file job ─────────────────────────────────────────────────────────────

pub struct CategorizerJob<'mgr> {
    mgr: &'mgr CategorizerManager,
    path: std::path::PathBuf,
    best: InodeFragments,
    best_index: Option<usize>,
    is_global_best: bool,
    total_size: u64,
    seq_jobs: Vec<(usize, Box<dyn SequentialCategorizerJob>)>,
}

impl<'mgr> CategorizerJob<'mgr> {
    pub fn set_total_size(&mut self, total_size: u64) {
        self.total_size = total_size;
    }

    /// Run all random-access categorizers over the mapped file.
    ///
    /// The first non-empty partition wins; it is the *global* best (no
    /// sequential pass needed) only when no sequential categorizer
    /// precedes it in registration order.
    pub fn categorize_random_access(&mut self, data: &[u8]) {
        debug_assert!(self.best_index.is_none(), "random-access pass ran twice");
        self.total_size = data.len() as u64;

        let mapper = |name: &str| {
            self.mgr
                .category(name)
                .unwrap_or_else(|| panic!("unknown category: {name}"))
        };

        let mut global_best = true;
        for (index, cat) in self.mgr.categorizers.iter().enumerate() {
            match cat {
                Registered::Random(r) => {
                    let frags = r.categorize(&self.path, data, &mapper);
                    if !frags.is_empty() {
                        self.best = frags;
                        self.best_index = Some(index);
                        self.is_global_best = global_best;
                        break;
                    }
                }
                Registered::Sequential(_) => global_best = false,
            }
        }
    }

    /// Feed a chunk to the sequential categorizers that could still win.
    pub fn categorize_sequential(&mut self, data: &[u8]) {
        if self.is_global_best {
            return;
        }

        if self.seq_jobs.is_empty() {
            let mapper = |name: &str| {
                self.mgr
                    .category(name)
                    .unwrap_or_else(|| panic!("unknown category: {name}"))
            };
            for (index, cat) in self.mgr.categorizers.iter().enumerate() {
                if let Some(best) = self.best_index {
                    if index >= best {
                        break;
                    }
                }
                if let Registered::Sequential(s) = cat {
                    if let Some(job) = s.job(&self.path, self.total_size, &mapper) {
                        self.seq_jobs.push((index, job));
                    }
                }
            }
        }

        for (_, job) in &mut self.seq_jobs {
            job.add(data);
        }
    }

    /// Resolve the winning partition; empty when nothing matched.
    pub fn result(mut self) -> InodeFragments {
        for (_, job) in self.seq_jobs.drain(..) {
            let frags = job.result();
            if !frags.is_empty() {
                self.best = frags;
                break;
            }
        }

        log::trace!(
            "{} -> {}",
            self.path.display(),
            self.best
                .iter()
                .map(|f| format!("{}:{}", self.mgr.category_name(f.category.value), f.length))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.best
    }
}
