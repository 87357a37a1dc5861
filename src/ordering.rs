//! Similarity ordering — permutes items so that similar ones end up
//! adjacent, amplifying what the segmenter can deduplicate.
//!
//! The pipeline over a set of weighted 256-bit signatures:
//!
//! 1. Deduplicate: equal signatures collapse into a representative plus a
//!    duplicate list (re-emitted contiguously at output time, ordered by
//!    the secondary key).
//! 2. Hierarchical clustering: starting with everything in one cluster,
//!    recursively split by assigning each signature to the first child
//!    whose centroid (elementwise bit-majority) is within distance `D`,
//!    creating children up to `max_children`; `D` halves per level and
//!    bottoms out at 1.
//! 3. Small clusters are ordered internally by nearest-neighbour greedy
//!    walk over Hamming distance.
//! 4. The tree is linearised bottom-up: children sorted by total weight
//!    descending, then nearest-neighbour greedy between the last
//!    signature of one child and the first of the next.
//! 5. DFS emit: representative followed by its duplicates.
//!
//! Cluster subtrees are processed in parallel on the rayon pool; the
//! public entry point hands back a one-shot channel fulfilled when every
//! outstanding subtree has finished.

use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;
use std::collections::HashMap;

use crate::nilsimsa::{distance, NilsimsaDigest};

#[derive(Debug, Clone)]
pub struct SimilarityOrderingOptions {
    /// Prefix for log lines, e.g. the category name.
    pub context: String,
    /// Fan-out bound per tree node.
    pub max_children: usize,
    /// Clusters at or below this size stop splitting and are ordered
    /// directly.
    pub max_cluster_size: usize,
}

impl Default for SimilarityOrderingOptions {
    fn default() -> Self {
        SimilarityOrderingOptions {
            context: String::new(),
            max_children: 256,
            max_cluster_size: 256,
        }
    }
}

/// One orderable item.
#[derive(Debug, Clone)]
pub struct OrderElement {
    /// Similarity signature; items without one are skipped (they keep
    /// their original relative order elsewhere).
    pub digest: Option<NilsimsaDigest>,
    /// Byte size; doubles as the tree weight.
    pub size: u64,
    /// Path with components reversed, the tie-breaking key.
    pub rev_path: String,
}

impl OrderElement {
    /// Secondary ordering: size descending, then reverse path.
    fn order_less(&self, other: &Self) -> bool {
        (other.size, &self.rev_path) < (self.size, &other.rev_path)
    }
}

// ── Centroid ─────────────────────────────────────────────────────────────────

/// Elementwise bit-majority vote over the signatures added so far.
struct Centroid {
    bits: NilsimsaDigest,
    counts: Box<[u32; 256]>,
    total: u32,
}

impl Centroid {
    fn new() -> Self {
        Centroid {
            bits: [0; 4],
            counts: Box::new([0; 256]),
            total: 0,
        }
    }

    fn add(&mut self, vec: &NilsimsaDigest) {
        self.total += 1;
        for bit in 0..256 {
            if vec[bit >> 6] >> (bit & 0x3F) & 1 != 0 {
                self.counts[bit] += 1;
            }
            if self.counts[bit] > self.total / 2 {
                self.bits[bit >> 6] |= 1u64 << (bit & 0x3F);
            } else {
                self.bits[bit >> 6] &= !(1u64 << (bit & 0x3F));
            }
        }
    }

    fn distance_to(&self, vec: &NilsimsaDigest) -> u32 {
        distance(&self.bits, vec)
    }
}

// ── Cluster tree ─────────────────────────────────────────────────────────────

struct Cluster {
    centroid: Centroid,
    index: Vec<u32>,
}

enum Node {
    Leaf(Cluster),
    Inner(Vec<Node>),
}

impl Node {
    fn first_index(&self) -> u32 {
        match self {
            Node::Leaf(c) => c.index[0],
            Node::Inner(children) => children[0].first_index(),
        }
    }

    fn last_index(&self) -> u32 {
        match self {
            Node::Leaf(c) => *c.index.last().unwrap(),
            Node::Inner(children) => children.last().unwrap().last_index(),
        }
    }
}

// ── Nearest-neighbour greedy walk ────────────────────────────────────────────

/// Supplies the per-slot reads and the swap operation for
/// `order_by_shortest_path`, bundled behind a single mutable borrow so the
/// reads and the swap (which may touch the same backing storage) don't need
/// to be captured as separate closures alive at once.
trait ShortestPathOps {
    /// Reads the signature that ends slot `i`.
    fn get_i(&self, i: usize) -> NilsimsaDigest;
    /// Reads the signature that starts slot `k`.  Kept distinct from
    /// `get_i` so the tree linearisation can chain "last of left" to
    /// "first of right".
    fn get_k(&self, k: usize) -> NilsimsaDigest;
    fn swap(&mut self, i: usize, k: usize);
}

/// Orders `count` slots so each step picks the closest next signature.
fn order_by_shortest_path(count: usize, ops: &mut impl ShortestPathOps) {
    if count < 2 {
        return;
    }
    for i in 0..count - 1 {
        let bi = ops.get_i(i);
        let mut best_distance = u32::MAX;
        let mut best_index = 0usize;

        for k in i + 1..count {
            let d = distance(&bi, &ops.get_k(k));
            if d < best_distance {
                best_distance = d;
                best_index = k;
                if best_distance <= 1 {
                    break;
                }
            }
        }

        if best_index > 0 && i + 1 != best_index {
            ops.swap(i + 1, best_index);
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SimilarityOrdering<'a> {
    elements: &'a [OrderElement],
    opts: SimilarityOrderingOptions,
}

impl<'a> SimilarityOrdering<'a> {
    pub fn new(elements: &'a [OrderElement], opts: SimilarityOrderingOptions) -> Self {
        SimilarityOrdering { elements, opts }
    }

    fn bits(&self, i: u32) -> &NilsimsaDigest {
        self.elements[i as usize].digest.as_ref().unwrap()
    }

    /// Indices of all elements that carry a signature.
    fn build_index(&self) -> Vec<u32> {
        (0..self.elements.len() as u32)
            .filter(|&i| self.elements[i as usize].digest.is_some())
            .collect()
    }

    /// Sort by raw signature and collapse equal signatures.  The index
    /// tie-break keeps the representative choice deterministic.
    fn find_duplicates(&self, index: &mut Vec<u32>) -> HashMap<u32, Vec<u32>> {
        index.sort_unstable_by(|&a, &b| self.bits(a).cmp(self.bits(b)).then(a.cmp(&b)));

        let mut dup: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut out: Vec<u32> = Vec::with_capacity(index.len());

        for &i in index.iter() {
            match out.last() {
                Some(&rep) if self.bits(rep) == self.bits(i) => {
                    dup.entry(rep).or_default().push(i);
                }
                _ => out.push(i),
            }
        }

        log::trace!(
            "{}find duplicates: {} unique / {} groups",
            self.opts.context,
            out.len(),
            dup.len()
        );

        *index = out;
        dup
    }

    /// Sum of pairwise distances along the order; diagnostics only.
    fn total_distance(&self, index: &[u32]) -> u64 {
        index
            .windows(2)
            .map(|w| distance(self.bits(w[0]), self.bits(w[1])) as u64)
            .sum()
    }

    /// Order a leaf cluster: secondary-key sort, then greedy walk.
    fn order_cluster(&self, index: &mut [u32]) {
        if index.is_empty() {
            return;
        }
        index.sort_by(|&a, &b| {
            let (ea, eb) = (&self.elements[a as usize], &self.elements[b as usize]);
            if ea.order_less(eb) {
                std::cmp::Ordering::Less
            } else if eb.order_less(ea) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });

        let mut bits: Vec<NilsimsaDigest> = index.iter().map(|&i| *self.bits(i)).collect();
        let count = index.len();

        struct ClusterOps<'a> {
            bits: &'a mut Vec<NilsimsaDigest>,
            index: &'a mut [u32],
        }
        impl ShortestPathOps for ClusterOps<'_> {
            fn get_i(&self, i: usize) -> NilsimsaDigest {
                self.bits[i]
            }
            fn get_k(&self, k: usize) -> NilsimsaDigest {
                self.bits[k]
            }
            fn swap(&mut self, i: usize, k: usize) {
                self.bits.swap(i, k);
                self.index.swap(i, k);
            }
        }

        order_by_shortest_path(
            count,
            &mut ClusterOps {
                bits: &mut bits,
                index,
            },
        );
    }

    /// One level of splitting: distribute the cluster's signatures over
    /// child clusters by centroid distance.
    fn cluster_by_distance(&self, cluster: Cluster, max_distance: u32) -> Vec<Node> {
        let mut children: Vec<Cluster> = Vec::new();

        for i in cluster.index {
            let vec = *self.bits(i);
            let mut chosen: Option<usize> = None;
            let mut best_distance = u32::MAX;
            let mut best: usize = 0;

            for (ci, c) in children.iter().enumerate() {
                let d = c.centroid.distance_to(&vec);
                if d <= max_distance {
                    chosen = Some(ci);
                    break;
                } else if d < best_distance {
                    best_distance = d;
                    best = ci;
                }
            }

            let target = match chosen {
                Some(ci) => ci,
                None if children.len() < self.opts.max_children => {
                    children.push(Cluster {
                        centroid: Centroid::new(),
                        index: Vec::new(),
                    });
                    children.len() - 1
                }
                None => best,
            };

            children[target].centroid.add(&vec);
            children[target].index.push(i);
        }

        children.into_iter().map(Node::Leaf).collect()
    }

    /// Recursive split; subtrees fan out on the rayon pool.
    fn cluster_rec(&self, cluster: Cluster, max_distance: u32) -> Node {
        let mut children = self.cluster_by_distance(cluster, max_distance);

        children.par_iter_mut().for_each(|child| {
            let Node::Leaf(c) = child else { return };
            if max_distance > 1 && c.index.len() > self.opts.max_cluster_size {
                let cluster = Cluster {
                    centroid: Centroid::new(),
                    index: std::mem::take(&mut c.index),
                };
                *child = self.cluster_rec(cluster, max_distance / 2);
            } else if c.index.len() > 1 {
                self.order_cluster(&mut c.index);
            }
        });

        Node::Inner(children)
    }

    /// Bottom-up child ordering; returns the subtree weight.
    fn order_tree_rec(&self, node: &mut Node) -> u64 {
        let children = match node {
            Node::Leaf(c) => {
                return c
                    .index
                    .iter()
                    .map(|&i| self.elements[i as usize].size)
                    .sum();
            }
            Node::Inner(children) => children,
        };

        let mut weighted: Vec<(u64, Node)> = std::mem::take(children)
            .into_iter()
            .map(|mut cn| {
                let w = self.order_tree_rec(&mut cn);
                (w, cn)
            })
            .collect();
        let total: u64 = weighted.iter().map(|(w, _)| w).sum();

        weighted.sort_by_key(|(w, _)| std::cmp::Reverse(*w));

        struct WeightedOps<'a, 'b, 'c> {
            weighted: &'a mut Vec<(u64, Node)>,
            owner: &'b SimilarityOrdering<'c>,
        }
        impl ShortestPathOps for WeightedOps<'_, '_, '_> {
            fn get_i(&self, i: usize) -> NilsimsaDigest {
                *self.owner.bits(self.weighted[i].1.last_index())
            }
            fn get_k(&self, k: usize) -> NilsimsaDigest {
                *self.owner.bits(self.weighted[k].1.first_index())
            }
            fn swap(&mut self, i: usize, k: usize) {
                self.weighted.swap(i, k);
            }
        }

        let count = weighted.len();
        order_by_shortest_path(
            count,
            &mut WeightedOps {
                weighted: &mut weighted,
                owner: self,
            },
        );

        *children = weighted.into_iter().map(|(_, cn)| cn).collect();
        total
    }

    /// DFS emit: every representative followed by its duplicate group.
    fn collect_rec(&self, node: &Node, dup: &HashMap<u32, Vec<u32>>, ordered: &mut Vec<u32>) {
        match node {
            Node::Leaf(c) => {
                for &e in &c.index {
                    ordered.push(e);
                    if let Some(group) = dup.get(&e) {
                        let mut group = group.clone();
                        group.sort_by(|&a, &b| {
                            let (ea, eb) =
                                (&self.elements[a as usize], &self.elements[b as usize]);
                            if ea.order_less(eb) {
                                std::cmp::Ordering::Less
                            } else if eb.order_less(ea) {
                                std::cmp::Ordering::Greater
                            } else {
                                std::cmp::Ordering::Equal
                            }
                        });
                        ordered.extend(group);
                    }
                }
            }
            Node::Inner(children) => {
                for cn in children {
                    self.collect_rec(cn, dup, ordered);
                }
            }
        }
    }

    /// Compute the full ordering synchronously on the calling thread
    /// (which may itself be a rayon worker).
    pub fn run(&self) -> Vec<u32> {
        let mut index = self.build_index();
        if index.len() < 2 {
            return index;
        }

        log::debug!(
            "{}total distance before ordering: {}",
            self.opts.context,
            self.total_distance(&index)
        );

        let size_hint = index.len();
        let dup = self.find_duplicates(&mut index);

        let root_cluster = Cluster {
            centroid: Centroid::new(),
            index,
        };
        let mut root = self.cluster_rec(root_cluster, 128);
        self.order_tree_rec(&mut root);

        let mut ordered = Vec::with_capacity(size_hint);
        self.collect_rec(&root, &dup, &mut ordered);

        log::debug!(
            "{}total distance after ordering: {}",
            self.opts.context,
            self.total_distance(&ordered)
        );

        ordered
    }
}

/// Asynchronous entry point: schedules the ordering on the rayon pool and
/// returns a one-shot channel with the permutation.
pub fn order_nilsimsa(
    elements: Vec<OrderElement>,
    opts: SimilarityOrderingOptions,
) -> Receiver<Vec<u32>> {
    let (tx, rx) = bounded(1);
    rayon::spawn(move || {
        let ordering = SimilarityOrdering::new(&elements, opts);
        // A dropped receiver just means the caller no longer cares.
        let _ = tx.send(ordering.run());
    });
    rx
}
