//! Codec registry: frozen on-disk compression ids + per-codec constraints.
//!
//! # Identity rules
//! Every codec is identified by a `u16` compression id.  That id is:
//!   - Written into every section header on disk.
//!   - The authoritative identity for decompression.
//!
//! Ids are permanent.  An id is NEVER reused, even if a codec is retired.
//! A reader that encounters an id not available in this build MUST fail
//! for that section — no negotiation, no fallback.
//!
//! # Bad-ratio signal
//! `Codec::compress` returns `Ok(None)` when the compressed output would
//! not be smaller than the input.  The writer then stores the payload
//! verbatim with compression id `NONE` (the section type stays `BLOCK`).
//!
//! # Metadata requirements & constraints
//! A codec may declare *metadata requirements* — a JSON document checked
//! against the categorizer-supplied metadata of the category it is being
//! registered for.  Requirement entries:
//!
//! ```text
//! {"endianness":      ["set", ["little"]],
//!  "bytes_per_sample": ["range", 1, 2]}
//! ```
//!
//! The writer refuses a `(codec, category)` pairing whose requirements are
//! unmet.  From the same metadata a codec derives *compression
//! constraints*, currently just the granularity (smallest unit the codec
//! accepts, e.g. one full PCM frame).

use serde_json::Value;
use std::io::{Read, Write};
use thiserror::Error;

// ── Frozen compression ids ───────────────────────────────────────────────────
//
// These values are permanent; parsers MUST reject unknown ids.

pub const COMPRESSION_NONE: u16 = 0;
pub const COMPRESSION_LZMA: u16 = 1;
pub const COMPRESSION_ZSTD: u16 = 2;
pub const COMPRESSION_LZ4: u16 = 3;
pub const COMPRESSION_LZ4HC: u16 = 4;
pub const COMPRESSION_BROTLI: u16 = 5;
pub const COMPRESSION_PCM: u16 = 6;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    /// A section names a compression id this build cannot supply.
    /// Decoding MUST NOT continue for that section.
    #[error("unknown compression id {0} — cannot decode without it")]
    UnknownCompression(u16),
    #[error("bad codec spec '{0}': {1}")]
    BadSpec(String, String),
    #[error("metadata requirement not met: {0}")]
    RequirementUnmet(String),
}

// ── Compression constraints ──────────────────────────────────────────────────

/// Constraints a codec imposes on the data it is fed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionConstraints {
    /// Smallest unit in bytes the codec accepts; block sizes and chunk
    /// boundaries are rounded to multiples of this.
    pub granularity: Option<u32>,
}

// ── Metadata requirements ────────────────────────────────────────────────────

/// One requirement over a single metadata key.
#[derive(Debug, Clone)]
enum Requirement {
    /// Value must be one of the listed strings.
    Set(Vec<String>),
    /// Integer value must lie in `[min, max]`.
    Range(i64, i64),
}

/// A parsed requirements document, checked against categorizer metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataRequirements {
    entries: Vec<(String, Requirement)>,
}

impl MetadataRequirements {
    /// Parse from the JSON requirement format shown in the module docs.
    pub fn parse(doc: &Value) -> Result<Self, CodecError> {
        let obj = doc.as_object().ok_or_else(|| {
            CodecError::RequirementUnmet("requirements document is not an object".into())
        })?;

        let mut entries = Vec::with_capacity(obj.len());
        for (key, spec) in obj {
            let arr = spec.as_array().filter(|a| a.len() >= 2).ok_or_else(|| {
                CodecError::RequirementUnmet(format!("bad requirement for '{key}'"))
            })?;
            let req = match arr[0].as_str() {
                Some("set") => {
                    let vals = arr[1]
                        .as_array()
                        .ok_or_else(|| {
                            CodecError::RequirementUnmet(format!("bad set for '{key}'"))
                        })?
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_owned))
                        .collect();
                    Requirement::Set(vals)
                }
                Some("range") if arr.len() == 3 => Requirement::Range(
                    arr[1].as_i64().unwrap_or(i64::MIN),
                    arr[2].as_i64().unwrap_or(i64::MAX),
                ),
                _ => {
                    return Err(CodecError::RequirementUnmet(format!(
                        "unknown requirement kind for '{key}'"
                    )))
                }
            };
            entries.push((key.clone(), req));
        }

        Ok(MetadataRequirements { entries })
    }

    /// Check categorizer-supplied metadata against the requirements.
    pub fn check(&self, metadata: &Value) -> Result<(), CodecError> {
        for (key, req) in &self.entries {
            let val = metadata.get(key).ok_or_else(|| {
                CodecError::RequirementUnmet(format!("metadata is missing '{key}'"))
            })?;
            match req {
                Requirement::Set(allowed) => {
                    let s = val.as_str().unwrap_or_default();
                    if !allowed.iter().any(|a| a == s) {
                        return Err(CodecError::RequirementUnmet(format!(
                            "'{key}' is '{s}', allowed: {allowed:?}"
                        )));
                    }
                }
                Requirement::Range(min, max) => {
                    let n = val.as_i64().ok_or_else(|| {
                        CodecError::RequirementUnmet(format!("'{key}' is not an integer"))
                    })?;
                    if n < *min || n > *max {
                        return Err(CodecError::RequirementUnmet(format!(
                            "'{key}' is {n}, allowed range: [{min}, {max}]"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;
    fn compression_id(&self) -> u16;

    /// Estimated working memory for compressing `input_size` bytes.
    fn estimated_memory(&self, input_size: usize) -> usize {
        input_size
    }

    /// Requirements over categorizer metadata; `None` means the codec
    /// accepts any category.
    fn metadata_requirements(&self) -> Option<MetadataRequirements> {
        None
    }

    /// Constraints derived from the category metadata.
    fn compression_constraints(&self, _metadata: Option<&Value>) -> CompressionConstraints {
        CompressionConstraints::default()
    }

    /// Compress `data`.  `Ok(None)` signals a bad ratio — the caller
    /// stores the data uncompressed.
    fn compress(&self, data: &[u8], metadata: Option<&Value>)
        -> Result<Option<Vec<u8>>, CodecError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

fn worth_it(original: &[u8], compressed: Vec<u8>) -> Option<Vec<u8>> {
    (compressed.len() < original.len()).then_some(compressed)
}

// ── Built-in codecs ──────────────────────────────────────────────────────────

/// No compression — payload stored verbatim.
pub struct NullCodec;

impl Codec for NullCodec {
    fn name(&self) -> &'static str {
        "null"
    }
    fn compression_id(&self) -> u16 {
        COMPRESSION_NONE
    }
    fn estimated_memory(&self, _input_size: usize) -> usize {
        0
    }
    fn compress(&self, data: &[u8], _: Option<&Value>) -> Result<Option<Vec<u8>>, CodecError> {
        Ok(Some(data.to_vec()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec {
    pub level: i32,
}

impl Codec for ZstdCodec {
    fn name(&self) -> &'static str {
        "zstd"
    }
    fn compression_id(&self) -> u16 {
        COMPRESSION_ZSTD
    }
    fn estimated_memory(&self, input_size: usize) -> usize {
        // Window plus internal tables; grows with level.
        input_size + (1usize << (20 + (self.level / 4).clamp(0, 7) as usize))
    }
    fn compress(&self, data: &[u8], _: Option<&Value>) -> Result<Option<Vec<u8>>, CodecError> {
        let out = zstd::encode_all(data, self.level)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(worth_it(data, out))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct Lz4Codec {
    /// High-compression analog: on-disk id LZ4HC.  `lz4_flex` has a single
    /// compressor; the distinct id is kept for image compatibility.
    pub hc: bool,
}

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        if self.hc {
            "lz4hc"
        } else {
            "lz4"
        }
    }
    fn compression_id(&self) -> u16 {
        if self.hc {
            COMPRESSION_LZ4HC
        } else {
            COMPRESSION_LZ4
        }
    }
    fn compress(&self, data: &[u8], _: Option<&Value>) -> Result<Option<Vec<u8>>, CodecError> {
        Ok(worth_it(data, lz4_flex::compress_prepend_size(data)))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct BrotliCodec {
    pub quality: u32,
}

impl Codec for BrotliCodec {
    fn name(&self) -> &'static str {
        "brotli"
    }
    fn compression_id(&self) -> u16 {
        COMPRESSION_BROTLI
    }
    fn estimated_memory(&self, input_size: usize) -> usize {
        input_size + (1usize << 22)
    }
    fn compress(&self, data: &[u8], _: Option<&Value>) -> Result<Option<Vec<u8>>, CodecError> {
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, self.quality, 22);
            w.write_all(data)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(worth_it(data, out))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

pub struct LzmaCodec;

impl Codec for LzmaCodec {
    fn name(&self) -> &'static str {
        "lzma"
    }
    fn compression_id(&self) -> u16 {
        COMPRESSION_LZMA
    }
    fn estimated_memory(&self, input_size: usize) -> usize {
        input_size + (1usize << 24)
    }
    fn compress(&self, data: &[u8], _: Option<&Value>) -> Result<Option<Vec<u8>>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(worth_it(data, out))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

// ── PCM codec ────────────────────────────────────────────────────────────────

/// Waveform codec: per-lane sample delta pre-filter, then zstd.
///
/// The pre-filter subtracts each byte from the byte one frame earlier
/// (stride = `number_of_channels * bytes_per_sample`), which turns slowly
/// varying PCM into near-constant residue that the entropy stage handles
/// far better than raw samples.
///
/// On-disk payload: `stride u16 LE` followed by the zstd stream.  The
/// stride is the codec metadata recovered at decompression/recompression
/// time.
pub struct PcmCodec {
    pub level: i32,
}

fn delta_filter(data: &[u8], stride: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..stride.min(data.len())]);
    for i in stride..data.len() {
        out.push(data[i].wrapping_sub(data[i - stride]));
    }
    out
}

fn delta_unfilter(data: &mut [u8], stride: usize) {
    for i in stride..data.len() {
        data[i] = data[i].wrapping_add(data[i - stride]);
    }
}

fn pcm_stride(metadata: Option<&Value>) -> Option<usize> {
    let m = metadata?;
    let channels = m.get("number_of_channels")?.as_u64()? as usize;
    let bytes = m.get("bytes_per_sample")?.as_u64()? as usize;
    let stride = channels * bytes;
    (1..=u16::MAX as usize).contains(&stride).then_some(stride)
}

impl Codec for PcmCodec {
    fn name(&self) -> &'static str {
        "pcmaudio"
    }
    fn compression_id(&self) -> u16 {
        COMPRESSION_PCM
    }
    fn estimated_memory(&self, input_size: usize) -> usize {
        2 * input_size + (1usize << 22)
    }

    fn metadata_requirements(&self) -> Option<MetadataRequirements> {
        let doc = serde_json::json!({
            "endianness":         ["set", ["big", "little"]],
            "signedness":         ["set", ["signed", "unsigned"]],
            "padding":            ["set", ["lsb", "msb"]],
            "bits_per_sample":    ["range", 8, 32],
            "bytes_per_sample":   ["range", 1, 4],
            "number_of_channels": ["range", 1, 32],
        });
        Some(MetadataRequirements::parse(&doc).expect("static requirements document"))
    }

    fn compression_constraints(&self, metadata: Option<&Value>) -> CompressionConstraints {
        CompressionConstraints {
            granularity: pcm_stride(metadata).map(|s| s as u32),
        }
    }

    fn compress(
        &self,
        data: &[u8],
        metadata: Option<&Value>,
    ) -> Result<Option<Vec<u8>>, CodecError> {
        let stride = pcm_stride(metadata).ok_or_else(|| {
            CodecError::Compression("pcmaudio codec needs frame-layout metadata".into())
        })?;

        let filtered = delta_filter(data, stride);
        let packed = zstd::encode_all(&filtered[..], self.level)
            .map_err(|e| CodecError::Compression(e.to_string()))?;

        let mut out = Vec::with_capacity(2 + packed.len());
        out.extend_from_slice(&(stride as u16).to_le_bytes());
        out.extend_from_slice(&packed);
        Ok(worth_it(data, out))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::Decompression("pcmaudio payload too short".into()));
        }
        let stride = u16::from_le_bytes([data[0], data[1]]) as usize;
        if stride == 0 {
            return Err(CodecError::Decompression("pcmaudio stride is zero".into()));
        }
        let mut out =
            zstd::decode_all(&data[2..]).map_err(|e| CodecError::Decompression(e.to_string()))?;
        delta_unfilter(&mut out, stride);
        Ok(out)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Resolve a compression id from a section header to a codec.
///
/// Fails hard on unknown ids — the caller MUST NOT fall back.
pub fn codec_for_id(id: u16) -> Result<Box<dyn Codec>, CodecError> {
    match id {
        COMPRESSION_NONE => Ok(Box::new(NullCodec)),
        COMPRESSION_LZMA => Ok(Box::new(LzmaCodec)),
        COMPRESSION_ZSTD => Ok(Box::new(ZstdCodec { level: 0 })),
        COMPRESSION_LZ4 => Ok(Box::new(Lz4Codec { hc: false })),
        COMPRESSION_LZ4HC => Ok(Box::new(Lz4Codec { hc: true })),
        COMPRESSION_BROTLI => Ok(Box::new(BrotliCodec { quality: 5 })),
        COMPRESSION_PCM => Ok(Box::new(PcmCodec { level: 0 })),
        other => Err(CodecError::UnknownCompression(other)),
    }
}

/// Decompress a section payload according to its compression id.
pub fn decompress(id: u16, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    codec_for_id(id)?.decompress(payload)
}

/// Parse a codec spec string: `name[:key=value]*`.
///
/// Examples: `null`, `zstd:level=19`, `lz4hc`, `brotli:quality=9`,
/// `pcmaudio:level=7`.
pub fn parse_codec_spec(spec: &str) -> Result<Box<dyn Codec>, CodecError> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default();

    let mut level: Option<i64> = None;
    let mut quality: Option<i64> = None;
    for opt in parts {
        let (k, v) = opt
            .split_once('=')
            .ok_or_else(|| CodecError::BadSpec(spec.into(), format!("bad option '{opt}'")))?;
        let n: i64 = v
            .parse()
            .map_err(|_| CodecError::BadSpec(spec.into(), format!("'{k}' is not a number")))?;
        match k {
            "level" => level = Some(n),
            "quality" => quality = Some(n),
            _ => return Err(CodecError::BadSpec(spec.into(), format!("unknown option '{k}'"))),
        }
    }

    match name {
        "null" | "none" => Ok(Box::new(NullCodec)),
        "zstd" => {
            let level = level.unwrap_or(3);
            if !(1..=22).contains(&level) {
                return Err(CodecError::BadSpec(spec.into(), "zstd level must be 1..22".into()));
            }
            Ok(Box::new(ZstdCodec { level: level as i32 }))
        }
        "lz4" => Ok(Box::new(Lz4Codec { hc: false })),
        "lz4hc" => Ok(Box::new(Lz4Codec { hc: true })),
        "brotli" => {
            let quality = quality.or(level).unwrap_or(5);
            if !(0..=11).contains(&quality) {
                return Err(CodecError::BadSpec(
                    spec.into(),
                    "brotli quality must be 0..11".into(),
                ));
            }
            Ok(Box::new(BrotliCodec { quality: quality as u32 }))
        }
        "lzma" => Ok(Box::new(LzmaCodec)),
        "pcmaudio" => Ok(Box::new(PcmCodec { level: level.unwrap_or(7) as i32 })),
        other => Err(CodecError::BadSpec(spec.into(), format!("unknown codec '{other}'"))),
    }
}
