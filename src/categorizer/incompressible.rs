//! Incompressible-run categorizer — finds stretches of apparently random
//! bytes and splits them off so they can be routed to the null codec
//! instead of wasting compressor time.
//!
//! The stream is scanned in fixed-size windows; each window's byte
//! histogram yields a Shannon entropy estimate.  Windows above the
//! threshold are considered random.  Only runs of at least
//! `min_fragment_size` consecutive random bytes become `incompressible`
//! fragments; everything else stays in the default category.  Files with
//! no qualifying run produce an empty partition, so the categorizer
//! simply does not apply.

use std::path::Path;

use super::{
    Categorizer, CategoryMapper, FragmentCategory, InodeFragments, SequentialCategorizer,
    SequentialCategorizerJob, DEFAULT_CATEGORY,
};

pub const INCOMPRESSIBLE_CATEGORY: &str = "incompressible";

/// Entropy is estimated per window of this many bytes.
const WINDOW_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct IncompressibleCategorizer {
    /// Windows with entropy above this many bits per byte count as random.
    pub entropy_threshold: f64,
    /// Shortest random run worth splitting off.
    pub min_fragment_size: u64,
}

impl Default for IncompressibleCategorizer {
    fn default() -> Self {
        IncompressibleCategorizer {
            entropy_threshold: 7.92,
            min_fragment_size: 128 * 1024,
        }
    }
}

fn window_entropy(histogram: &[u32; 256], total: usize) -> f64 {
    let total = total as f64;
    let mut h = 0.0;
    for &count in histogram {
        if count > 0 {
            let p = count as f64 / total;
            h -= p * p.log2();
        }
    }
    h
}

struct Job {
    entropy_threshold: f64,
    min_fragment_size: u64,
    default_id: u32,
    incompressible_id: u32,
    histogram: [u32; 256],
    filled: usize,
    /// (is_random, window_bytes) per completed window, merged at the end.
    windows: Vec<(bool, u64)>,
}

impl Job {
    fn finish_window(&mut self) {
        if self.filled == 0 {
            return;
        }
        let random =
            window_entropy(&self.histogram, self.filled) >= self.entropy_threshold;
        self.windows.push((random, self.filled as u64));
        self.histogram = [0; 256];
        self.filled = 0;
    }
}

impl SequentialCategorizerJob for Job {
    fn add(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (WINDOW_SIZE - self.filled).min(data.len());
            for &b in &data[..take] {
                self.histogram[b as usize] += 1;
            }
            self.filled += take;
            data = &data[take..];
            if self.filled == WINDOW_SIZE {
                self.finish_window();
            }
        }
    }

    fn result(mut self: Box<Self>) -> InodeFragments {
        self.finish_window();

        // Merge adjacent windows of the same class into runs.
        let mut runs: Vec<(bool, u64)> = Vec::new();
        for (random, len) in self.windows.drain(..) {
            match runs.last_mut() {
                Some((r, l)) if *r == random => *l += len,
                _ => runs.push((random, len)),
            }
        }

        // Short random runs are not worth a separate fragment; fold them
        // back into their neighbours.
        let mut folded: Vec<(bool, u64)> = Vec::new();
        for (random, len) in runs {
            let random = random && len >= self.min_fragment_size;
            match folded.last_mut() {
                Some((r, l)) if *r == random => *l += len,
                _ => folded.push((random, len)),
            }
        }

        if !folded.iter().any(|&(random, _)| random) {
            return InodeFragments::empty();
        }

        let mut fragments = InodeFragments::empty();
        for (random, len) in folded {
            let category = if random {
                self.incompressible_id
            } else {
                self.default_id
            };
            fragments.push(FragmentCategory::new(category), len);
        }
        fragments
    }
}

impl Categorizer for IncompressibleCategorizer {
    fn name(&self) -> &'static str {
        "incompressible"
    }

    fn categories(&self) -> &[&'static str] {
        &[INCOMPRESSIBLE_CATEGORY]
    }
}

impl SequentialCategorizer for IncompressibleCategorizer {
    fn job(
        &self,
        _path: &Path,
        total_size: u64,
        mapper: &CategoryMapper,
    ) -> Option<Box<dyn SequentialCategorizerJob>> {
        if total_size < self.min_fragment_size {
            return None;
        }
        Some(Box::new(Job {
            entropy_threshold: self.entropy_threshold,
            min_fragment_size: self.min_fragment_size,
            default_id: mapper(DEFAULT_CATEGORY),
            incompressible_id: mapper(INCOMPRESSIBLE_CATEGORY),
            histogram: [0; 256],
            filled: 0,
            windows: Vec::new(),
        }))
    }
}
