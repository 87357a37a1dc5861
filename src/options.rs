//! Per-category option stacks and compression-level presets.
//!
//! Several writer options accept repeated `[category::]value` entries:
//! the bare form sets the default, a prefixed form overrides it for one
//! category, and later entries win over earlier ones for the same
//! category.  [`CategorizedOption`] models one such stack.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// An option with a default value and per-category overrides.
#[derive(Debug, Clone)]
pub struct CategorizedOption<T: Clone> {
    default: T,
    overrides: HashMap<String, T>,
}

impl<T: Clone> CategorizedOption<T> {
    pub fn new(default: T) -> Self {
        CategorizedOption {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Apply one `[category::]value` entry (already split and parsed).
    pub fn set(&mut self, category: Option<&str>, value: T) {
        match category {
            Some(cat) => {
                self.overrides.insert(cat.to_owned(), value);
            }
            None => self.default = value,
        }
    }

    pub fn get(&self, category: &str) -> &T {
        self.overrides.get(category).unwrap_or(&self.default)
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Whether an explicit override exists for `category`.
    pub fn has_override(&self, category: &str) -> bool {
        self.overrides.contains_key(category)
    }

    /// Parse and fold a list of raw `[category::]spec` strings.
    pub fn parse_all(
        &mut self,
        entries: &[String],
        parse: impl Fn(&str) -> Result<T>,
    ) -> Result<()> {
        for entry in entries {
            let (category, spec) = split_entry(entry);
            self.set(category, parse(spec)?);
        }
        Ok(())
    }
}

/// Split `cat::value` into `(Some("cat"), "value")`, or `(None, value)`
/// for the bare form.
pub fn split_entry(entry: &str) -> (Option<&str>, &str) {
    match entry.split_once("::") {
        Some((cat, value)) => (Some(cat), value),
        None => (None, entry),
    }
}

// ── Compression level presets ────────────────────────────────────────────────

/// What `--compress-level N` expands to before explicit options override
/// it: block size, codecs, window parameters and inode order.
#[derive(Debug, Clone)]
pub struct LevelPreset {
    pub block_size_bits: u32,
    pub default_compression: &'static str,
    pub metadata_compression: &'static str,
    pub window_size: u32,
    pub window_step_shift: u32,
    pub max_lookback_blocks: usize,
    pub order: &'static str,
}

/// Presets for levels 0..=9; 7 is the default.
pub fn level_preset(level: u32) -> Result<LevelPreset> {
    let preset = match level {
        0 => LevelPreset {
            block_size_bits: 20,
            default_compression: "null",
            metadata_compression: "null",
            window_size: 0,
            window_step_shift: 0,
            max_lookback_blocks: 0,
            order: "none",
        },
        1 => LevelPreset {
            block_size_bits: 20,
            default_compression: "lz4",
            metadata_compression: "null",
            window_size: 0,
            window_step_shift: 0,
            max_lookback_blocks: 0,
            order: "path",
        },
        2 => LevelPreset {
            block_size_bits: 22,
            default_compression: "lz4hc",
            metadata_compression: "null",
            window_size: 0,
            window_step_shift: 0,
            max_lookback_blocks: 0,
            order: "path",
        },
        3 => LevelPreset {
            block_size_bits: 22,
            default_compression: "zstd:level=7",
            metadata_compression: "null",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 1,
            order: "similarity",
        },
        4 => LevelPreset {
            block_size_bits: 23,
            default_compression: "zstd:level=11",
            metadata_compression: "null",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 1,
            order: "similarity",
        },
        5 => LevelPreset {
            block_size_bits: 23,
            default_compression: "zstd:level=16",
            metadata_compression: "null",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 1,
            order: "nilsimsa",
        },
        6 => LevelPreset {
            block_size_bits: 24,
            default_compression: "zstd:level=20",
            metadata_compression: "null",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 1,
            order: "nilsimsa",
        },
        7 => LevelPreset {
            block_size_bits: 24,
            default_compression: "zstd:level=22",
            metadata_compression: "null",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 1,
            order: "nilsimsa",
        },
        8 => LevelPreset {
            block_size_bits: 26,
            default_compression: "zstd:level=22",
            metadata_compression: "zstd:level=16",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 2,
            order: "nilsimsa",
        },
        9 => LevelPreset {
            block_size_bits: 26,
            default_compression: "lzma",
            metadata_compression: "zstd:level=16",
            window_size: 12,
            window_step_shift: 1,
            max_lookback_blocks: 4,
            order: "nilsimsa",
        },
        other => {
            return Err(Error::Config(format!(
                "compress level {other} out of range (0..9)"
            )))
        }
    };
    Ok(preset)
}
