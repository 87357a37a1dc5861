//! FITS categorizer — splits FITS images into `metadata / image / metadata`
//! fragments.
//!
//! FITS files are sequences of 2880-byte records.  The header consists of
//! 80-byte ASCII "cards" (`KEYWORD = value / comment`), terminated by an
//! `END` card and padded to a record boundary; the data unit follows,
//! sized `|BITPIX| / 8 * NAXIS1 * ... * NAXISn` bytes and padded to a
//! record boundary as well.  Only integer pixel formats are accepted; the
//! image fragment's subcategory interns the pixel layout so codecs can
//! derive a per-pixel granularity.

use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use super::{
    Categorizer, CategoryMapper, FragmentCategory, InodeFragments, RandomAccessCategorizer,
};

pub const METADATA_CATEGORY: &str = "fits/metadata";
pub const IMAGE_CATEGORY: &str = "fits/image";

const RECORD_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FitsMetadata {
    /// Bits per pixel; integer formats only (8, 16, 32, 64).
    pub bitpix: u8,
    pub naxis: u8,
}

impl FitsMetadata {
    fn bytes_per_pixel(&self) -> u64 {
        self.bitpix as u64 / 8
    }

    fn to_json(&self) -> Value {
        serde_json::json!({
            "bitpix":           self.bitpix,
            "naxis":            self.naxis,
            "bytes_per_sample": self.bytes_per_pixel(),
            "number_of_channels": 1,
        })
    }
}

#[derive(Default)]
struct MetadataStore {
    forward: Vec<FitsMetadata>,
    reverse: std::collections::HashMap<FitsMetadata, u32>,
}

impl MetadataStore {
    fn add(&mut self, m: FitsMetadata) -> u32 {
        if let Some(&ix) = self.reverse.get(&m) {
            return ix;
        }
        let ix = self.forward.len() as u32;
        self.forward.push(m);
        self.reverse.insert(m, ix);
        ix
    }
}

/// Parsed value of one header card: `keyword`, `= value` (if any).
fn card<'d>(data: &'d [u8], index: usize) -> Option<(&'d str, Option<&'d str>)> {
    let raw = data.get(index * CARD_SIZE..(index + 1) * CARD_SIZE)?;
    let text = std::str::from_utf8(raw).ok()?;
    let keyword = text[..8].trim_end();
    if &text[8..10] == "= " {
        // Strip an optional trailing comment.
        let value = text[10..].split('/').next().unwrap_or("").trim();
        Some((keyword, Some(value)))
    } else {
        Some((keyword, None))
    }
}

pub struct FitsCategorizer {
    store: Mutex<MetadataStore>,
}

impl FitsCategorizer {
    pub fn new() -> Self {
        FitsCategorizer {
            store: Mutex::new(MetadataStore::default()),
        }
    }
}

impl Default for FitsCategorizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Categorizer for FitsCategorizer {
    fn name(&self) -> &'static str {
        "fits"
    }

    fn categories(&self) -> &[&'static str] {
        &[METADATA_CATEGORY, IMAGE_CATEGORY]
    }

    fn category_metadata(&self, category_name: &str, c: FragmentCategory) -> Option<Value> {
        if category_name != IMAGE_CATEGORY {
            return None;
        }
        let sub = c.subcategory?;
        let store = self.store.lock().unwrap();
        store.forward.get(sub as usize).map(FitsMetadata::to_json)
    }
}

impl RandomAccessCategorizer for FitsCategorizer {
    fn categorize(&self, path: &Path, data: &[u8], mapper: &CategoryMapper) -> InodeFragments {
        let mut fragments = InodeFragments::empty();

        if data.len() < RECORD_SIZE || !data.starts_with(b"SIMPLE  =") {
            return fragments;
        }

        let mut bitpix: Option<i64> = None;
        let mut naxis: Option<u32> = None;
        let mut axes: Vec<u64> = Vec::new();
        let mut header_end: Option<usize> = None;

        'records: for rec in 0.. {
            let rec_base = rec * RECORD_SIZE / CARD_SIZE;
            if (rec + 1) * RECORD_SIZE > data.len() {
                // Header never terminated.
                return InodeFragments::empty();
            }
            for i in 0..RECORD_SIZE / CARD_SIZE {
                let Some((keyword, value)) = card(data, rec_base + i) else {
                    return InodeFragments::empty();
                };
                match keyword {
                    "SIMPLE" if rec == 0 && i == 0 => {
                        if value.map(str::trim) != Some("T") {
                            log::debug!("{}: non-conforming FITS file", path.display());
                            return InodeFragments::empty();
                        }
                    }
                    "BITPIX" => bitpix = value.and_then(|v| v.parse().ok()),
                    "NAXIS" => naxis = value.and_then(|v| v.parse().ok()),
                    "END" => {
                        header_end = Some((rec + 1) * RECORD_SIZE);
                        break 'records;
                    }
                    kw if kw.starts_with("NAXIS") => {
                        if let Some(n) = value.and_then(|v| v.parse::<u64>().ok()) {
                            axes.push(n);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (Some(header_end), Some(bitpix), Some(naxis)) = (header_end, bitpix, naxis) else {
            return fragments;
        };

        // Floating-point formats (negative BITPIX) go to the default codec.
        if !(bitpix == 8 || bitpix == 16 || bitpix == 32 || bitpix == 64) {
            log::debug!("{}: unsupported BITPIX {bitpix}", path.display());
            return fragments;
        }
        if axes.len() != naxis as usize || axes.iter().any(|&n| n == 0) {
            log::warn!("{}: inconsistent NAXIS cards", path.display());
            return fragments;
        }

        let data_len: u64 = axes.iter().product::<u64>() * (bitpix as u64 / 8);
        if header_end as u64 + data_len > data.len() as u64 {
            log::warn!("{}: data unit extends past end of file", path.display());
            return fragments;
        }

        let meta = FitsMetadata {
            bitpix: bitpix as u8,
            naxis: naxis as u8,
        };
        let subcategory = self.store.lock().unwrap().add(meta);

        fragments.push(
            FragmentCategory::new(mapper(METADATA_CATEGORY)),
            header_end as u64,
        );
        fragments.push(
            FragmentCategory::with_subcategory(mapper(IMAGE_CATEGORY), subcategory),
            data_len,
        );
        fragments.push(
            FragmentCategory::new(mapper(METADATA_CATEGORY)),
            data.len() as u64 - header_end as u64 - data_len,
        );

        fragments
    }
}
