//! PCM audio categorizer — recognises WAV, WAV64, AIFF and CAF containers
//! holding linear PCM and splits them into `metadata / waveform / metadata`
//! fragments.
//!
//! Only integer linear PCM is accepted; floating-point and compressed
//! payloads fall through to the default category.  The waveform fragment
//! carries a subcategory describing the frame layout
//! (`{endianness, signedness, padding, bits/bytes per sample, channels}`),
//! interned so identical layouts compare equal.  The layout doubles as the
//! category metadata consumed by frame-aware codecs (granularity = one
//! frame = `channels * bytes_per_sample`).

use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use super::{
    Categorizer, CategoryMapper, FragmentCategory, InodeFragments, RandomAccessCategorizer,
};

pub const METADATA_CATEGORY: &str = "pcmaudio/metadata";
pub const WAVEFORM_CATEGORY: &str = "pcmaudio/waveform";

/// Anything smaller cannot hold a header plus one sample.
const MIN_PCMAUDIO_SIZE: usize = 32;

// ── Frame layout ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Signedness {
    Signed,
    Unsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Padding {
    Lsb,
    Msb,
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Endianness::Big => "big",
            Endianness::Little => "little",
        })
    }
}

impl fmt::Display for Signedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signedness::Signed => "signed",
            Signedness::Unsigned => "unsigned",
        })
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Padding::Lsb => "lsb",
            Padding::Msb => "msb",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PcmMetadata {
    pub sample_endianness: Endianness,
    pub sample_signedness: Signedness,
    pub sample_padding: Padding,
    pub bits_per_sample: u8,
    pub bytes_per_sample: u8,
    pub number_of_channels: u16,
}

impl PcmMetadata {
    /// Sanity checks shared by all container formats.
    fn check(&self) -> bool {
        if self.number_of_channels == 0 {
            return false;
        }
        match self.bits_per_sample {
            8 => self.bytes_per_sample == 1,
            16 => self.bytes_per_sample == 2,
            20 | 24 => self.bytes_per_sample == 3 || self.bytes_per_sample == 4,
            32 => self.bytes_per_sample == 4,
            _ => false,
        }
    }

    fn frame_size(&self) -> u64 {
        self.number_of_channels as u64 * self.bytes_per_sample as u64
    }

    fn to_json(&self) -> Value {
        serde_json::json!({
            "endianness":         self.sample_endianness.to_string(),
            "signedness":         self.sample_signedness.to_string(),
            "padding":            self.sample_padding.to_string(),
            "bytes_per_sample":   self.bytes_per_sample,
            "bits_per_sample":    self.bits_per_sample,
            "number_of_channels": self.number_of_channels,
        })
    }
}

impl fmt::Display for PcmMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, bits={}, bytes={}, channels={}]",
            self.sample_endianness,
            self.sample_signedness,
            self.sample_padding,
            self.bits_per_sample,
            self.bytes_per_sample,
            self.number_of_channels
        )
    }
}

/// Interning store: identical frame layouts share one subcategory value.
#[derive(Default)]
struct MetadataStore {
    forward: Vec<PcmMetadata>,
    reverse: std::collections::HashMap<PcmMetadata, u32>,
}

impl MetadataStore {
    fn add(&mut self, m: PcmMetadata) -> u32 {
        if let Some(&ix) = self.reverse.get(&m) {
            return ix;
        }
        let ix = self.forward.len() as u32;
        self.forward.push(m);
        self.reverse.insert(m, ix);
        ix
    }

    fn lookup(&self, ix: u32) -> Option<&PcmMetadata> {
        self.forward.get(ix as usize)
    }
}

// ── Byte readers ─────────────────────────────────────────────────────────────

fn u16le(d: &[u8], p: usize) -> Option<u16> {
    Some(u16::from_le_bytes(d.get(p..p + 2)?.try_into().ok()?))
}
fn u32le(d: &[u8], p: usize) -> Option<u32> {
    Some(u32::from_le_bytes(d.get(p..p + 4)?.try_into().ok()?))
}
fn u64le(d: &[u8], p: usize) -> Option<u64> {
    Some(u64::from_le_bytes(d.get(p..p + 8)?.try_into().ok()?))
}
fn u16be(d: &[u8], p: usize) -> Option<u16> {
    Some(u16::from_be_bytes(d.get(p..p + 2)?.try_into().ok()?))
}
fn u32be(d: &[u8], p: usize) -> Option<u32> {
    Some(u32::from_be_bytes(d.get(p..p + 4)?.try_into().ok()?))
}
fn u64be(d: &[u8], p: usize) -> Option<u64> {
    Some(u64::from_be_bytes(d.get(p..p + 8)?.try_into().ok()?))
}

fn align_up(x: usize, alignment: usize) -> usize {
    match x % alignment {
        0 => x,
        r => x + (alignment - r),
    }
}

// WAV64 chunk GUIDs: fourcc followed by the fixed wave64 GUID remainder.
const W64_GUID_TAIL: [u8; 12] = [
    0xf3, 0xac, 0xd3, 0x11, 0x8c, 0xd1, 0x00, 0xc0, 0x4f, 0x8e, 0xdb, 0x8a,
];
const W64_RIFF_ID: [u8; 16] = [
    b'r', b'i', b'f', b'f', 0x2e, 0x91, 0xcf, 0x11, 0xa5, 0xd6, 0x28, 0xdb, 0x04, 0xc1, 0x00, 0x00,
];

const WAVE_FORMAT_PCM: u16 = 0x0001;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;

// ── Categorizer ──────────────────────────────────────────────────────────────

pub struct PcmAudioCategorizer {
    store: Mutex<MetadataStore>,
}

impl PcmAudioCategorizer {
    pub fn new() -> Self {
        PcmAudioCategorizer {
            store: Mutex::new(MetadataStore::default()),
        }
    }

    fn add_fragments(
        &self,
        frag: &mut InodeFragments,
        mapper: &CategoryMapper,
        meta: PcmMetadata,
        total_size: u64,
        pcm_start: u64,
        pcm_length: u64,
    ) {
        let subcategory = self.store.lock().unwrap().add(meta);

        frag.push(FragmentCategory::new(mapper(METADATA_CATEGORY)), pcm_start);
        frag.push(
            FragmentCategory::with_subcategory(mapper(WAVEFORM_CATEGORY), subcategory),
            pcm_length,
        );
        if pcm_start + pcm_length < total_size {
            frag.push(
                FragmentCategory::new(mapper(METADATA_CATEGORY)),
                total_size - (pcm_start + pcm_length),
            );
        }
    }

    fn check_metadata(&self, meta: &PcmMetadata, context: &str, path: &Path) -> bool {
        if !meta.check() {
            log::warn!("[{context}] {}: metadata check failed: {meta}", path.display());
            return false;
        }
        log::trace!("[{context}] {}: meta={meta}", path.display());
        true
    }

    /// Drop trailing padding that is not a whole number of frames.
    /// Some writers round the data chunk up; the residue is not PCM.
    fn trim_to_frames(
        meta: &PcmMetadata,
        mut pcm_length: u64,
        context: &str,
        path: &Path,
    ) -> u64 {
        let padding = pcm_length % meta.frame_size();
        if padding > 0 {
            log::debug!(
                "[{context}] {}: data size includes {padding} padding byte(s)",
                path.display()
            );
            pcm_length -= padding;
        }
        pcm_length
    }

    // ── WAV / WAV64 ─────────────────────────────────────────────────────────

    fn check_wav_like(
        &self,
        frag: &mut InodeFragments,
        path: &Path,
        data: &[u8],
        mapper: &CategoryMapper,
        wav64: bool,
    ) -> bool {
        let (id_size, file_header_size, chunk_header_size, chunk_align, context) = if wav64 {
            (16usize, 40usize, 24usize, 8usize, "WAV64")
        } else {
            (4usize, 12usize, 8usize, 2usize, "WAV")
        };

        // File header: id, size, form id.
        if wav64 {
            if data.len() < file_header_size || data[..16] != W64_RIFF_ID {
                return false;
            }
            if &data[24..28] != b"wave" || data[28..40] != W64_GUID_TAIL {
                return false;
            }
        } else {
            if data.len() < file_header_size || &data[..4] != b"RIFF" {
                return false;
            }
            if &data[8..12] != b"WAVE" {
                return false;
            }
        }

        let chunk_id_matches = |pos: usize, fourcc: &[u8; 4]| -> bool {
            if wav64 {
                data.get(pos..pos + 4) == Some(&fourcc[..])
                    && data.get(pos + 4..pos + 16) == Some(&W64_GUID_TAIL[..])
            } else {
                data.get(pos..pos + 4) == Some(&fourcc[..])
            }
        };

        let mut pos = file_header_size;
        let mut meta: Option<PcmMetadata> = None;

        while pos + chunk_header_size <= data.len() {
            pos = align_up(pos, chunk_align);
            if pos + chunk_header_size > data.len() {
                break;
            }

            // WAV64 sizes include the 24-byte chunk header; WAV sizes do not.
            let raw_size = if wav64 {
                match u64le(data, pos + id_size) {
                    Some(s) if s >= chunk_header_size as u64 => s - chunk_header_size as u64,
                    _ => {
                        log::warn!("[{context}] {}: invalid chunk size", path.display());
                        return false;
                    }
                }
            } else {
                match u32le(data, pos + id_size) {
                    Some(s) => s as u64,
                    None => return false,
                }
            };

            let body = pos + chunk_header_size;
            if body as u64 + raw_size > data.len() as u64 {
                log::warn!("[{context}] {}: unexpected end of file", path.display());
                return false;
            }

            if chunk_id_matches(pos, b"fmt ") {
                if meta.is_some() {
                    log::warn!("[{context}] {}: unexpected second `fmt ` chunk", path.display());
                    return false;
                }
                // 20-byte chunks come from legacy writers and are accepted.
                if ![16, 18, 40].contains(&raw_size) && !(raw_size == 20 && !wav64) {
                    log::warn!(
                        "[{context}] {}: unexpected `fmt ` chunk size {raw_size}",
                        path.display()
                    );
                    return false;
                }

                let format_code = u16le(data, body).unwrap_or(0);
                let num_channels = u16le(data, body + 2).unwrap_or(0);
                let bits_per_sample = u16le(data, body + 14).unwrap_or(0);

                let is_extensible = raw_size == 40 && format_code == WAVE_FORMAT_EXTENSIBLE;
                let effective_code = if is_extensible {
                    u16le(data, body + 24).unwrap_or(0)
                } else {
                    format_code
                };

                if effective_code != WAVE_FORMAT_PCM {
                    if effective_code == WAVE_FORMAT_IEEE_FLOAT {
                        log::debug!(
                            "[{context}] {}: floating point format not supported",
                            path.display()
                        );
                    } else {
                        log::warn!(
                            "[{context}] {}: unsupported format {format_code:#06x}",
                            path.display()
                        );
                    }
                    return false;
                }

                let m = PcmMetadata {
                    sample_endianness: Endianness::Little,
                    sample_signedness: if bits_per_sample > 8 {
                        Signedness::Signed
                    } else {
                        Signedness::Unsigned
                    },
                    sample_padding: Padding::Lsb,
                    bits_per_sample: bits_per_sample.min(255) as u8,
                    bytes_per_sample: ((bits_per_sample + 7) / 8).min(255) as u8,
                    number_of_channels: num_channels,
                };
                if !self.check_metadata(&m, context, path) {
                    return false;
                }
                meta = Some(m);
            } else if chunk_id_matches(pos, b"data") {
                let Some(m) = meta else {
                    log::warn!(
                        "[{context}] {}: got `data` chunk without `fmt ` chunk",
                        path.display()
                    );
                    return false;
                };
                let pcm_length = Self::trim_to_frames(&m, raw_size, context, path);
                self.add_fragments(
                    frag,
                    mapper,
                    m,
                    data.len() as u64,
                    body as u64,
                    pcm_length,
                );
                return true;
            }

            pos = body + raw_size as usize;
        }

        false
    }

    // ── AIFF ────────────────────────────────────────────────────────────────

    fn check_aiff(
        &self,
        frag: &mut InodeFragments,
        path: &Path,
        data: &[u8],
        mapper: &CategoryMapper,
    ) -> bool {
        if data.len() < 12 || &data[..4] != b"FORM" || &data[8..12] != b"AIFF" {
            return false;
        }

        let mut pos = 12usize;
        let mut meta: Option<PcmMetadata> = None;
        let mut num_sample_frames = 0u64;

        while pos + 8 <= data.len() {
            pos = align_up(pos, 2);
            if pos + 8 > data.len() {
                break;
            }

            let size = match u32be(data, pos + 4) {
                Some(s) => s as u64,
                None => return false,
            };
            let body = pos + 8;
            if body as u64 + size > data.len() as u64 {
                log::warn!("[AIFF] {}: unexpected end of file", path.display());
                return false;
            }

            match &data[pos..pos + 4] {
                b"COMM" => {
                    if size != 18 {
                        log::warn!("[AIFF] {}: unexpected `COMM` size {size}", path.display());
                        return false;
                    }
                    if meta.is_some() {
                        log::warn!("[AIFF] {}: unexpected second `COMM` chunk", path.display());
                        return false;
                    }

                    let num_chan = u16be(data, body).unwrap_or(0);
                    num_sample_frames = u32be(data, body + 2).unwrap_or(0) as u64;
                    let sample_size = u16be(data, body + 6).unwrap_or(0);

                    let m = PcmMetadata {
                        sample_endianness: Endianness::Big,
                        sample_signedness: Signedness::Signed,
                        sample_padding: Padding::Lsb,
                        bits_per_sample: sample_size.min(255) as u8,
                        bytes_per_sample: ((sample_size + 7) / 8).min(255) as u8,
                        number_of_channels: num_chan,
                    };
                    if !self.check_metadata(&m, "AIFF", path) {
                        return false;
                    }
                    meta = Some(m);
                }
                b"SSND" => {
                    let Some(m) = meta else {
                        log::warn!(
                            "[AIFF] {}: got `SSND` chunk without `COMM` chunk",
                            path.display()
                        );
                        return false;
                    };
                    if size < 8 {
                        return false;
                    }

                    let offset = u32be(data, body).unwrap_or(0) as u64;
                    let pcm_start = body as u64 + 8 + offset;
                    let pcm_length = num_sample_frames * m.frame_size();

                    if 8 + offset + pcm_length > size {
                        log::warn!(
                            "[AIFF] {}: `SSND` chunk too small for {pcm_length} PCM bytes",
                            path.display()
                        );
                        return false;
                    }

                    self.add_fragments(frag, mapper, m, data.len() as u64, pcm_start, pcm_length);
                    return true;
                }
                _ => {}
            }

            pos = body + size as usize;
        }

        false
    }

    // ── CAF ─────────────────────────────────────────────────────────────────

    fn check_caf(
        &self,
        frag: &mut InodeFragments,
        path: &Path,
        data: &[u8],
        mapper: &CategoryMapper,
    ) -> bool {
        if data.len() < 8 || &data[..4] != b"caff" {
            return false;
        }
        let version = u16be(data, 4).unwrap_or(0);
        let flags = u16be(data, 6).unwrap_or(0);
        if version != 1 || flags != 0 {
            log::warn!(
                "[CAF] {}: unsupported file version/flags: {version}/{flags}",
                path.display()
            );
            return false;
        }

        const FLAG_IS_FLOAT: u32 = 1 << 0;
        const FLAG_IS_LITTLE_ENDIAN: u32 = 1 << 1;

        let mut pos = 8usize;
        let mut meta: Option<PcmMetadata> = None;

        while pos + 12 <= data.len() {
            let mut size = match u64be(data, pos + 4) {
                Some(s) => s,
                None => return false,
            };
            // A data chunk of size -1 runs to the end of the file.
            if size == u64::MAX && &data[pos..pos + 4] == b"data" {
                size = (data.len() - pos - 12) as u64;
            }

            let body = pos + 12;
            if body as u64 + size > data.len() as u64 {
                log::warn!("[CAF] {}: unexpected end of file", path.display());
                return false;
            }

            match &data[pos..pos + 4] {
                b"desc" => {
                    if size != 32 {
                        log::warn!("[CAF] {}: unexpected `desc` size {size}", path.display());
                        return false;
                    }
                    if meta.is_some() {
                        log::warn!("[CAF] {}: unexpected second `desc` chunk", path.display());
                        return false;
                    }

                    if &data[body + 8..body + 12] != b"lpcm" {
                        log::debug!("[CAF] {}: non-lpcm format", path.display());
                        return false;
                    }
                    let format_flags = u32be(data, body + 12).unwrap_or(0);
                    if format_flags & FLAG_IS_FLOAT != 0 {
                        log::debug!(
                            "[CAF] {}: floating point format not supported",
                            path.display()
                        );
                        return false;
                    }

                    let bytes_per_packet = u32be(data, body + 16).unwrap_or(0);
                    let frames_per_packet = u32be(data, body + 20).unwrap_or(0);
                    let channels_per_frame = u32be(data, body + 24).unwrap_or(0);
                    let bits_per_channel = u32be(data, body + 28).unwrap_or(0);

                    if frames_per_packet != 1 {
                        log::warn!(
                            "[CAF] {}: unsupported frames per packet: {frames_per_packet}",
                            path.display()
                        );
                        return false;
                    }
                    if bytes_per_packet == 0
                        || channels_per_frame == 0
                        || bytes_per_packet > 4 * channels_per_frame
                        || bytes_per_packet % channels_per_frame != 0
                    {
                        log::warn!(
                            "[CAF] {}: unsupported packet size {bytes_per_packet} \
                             ({channels_per_frame} channels)",
                            path.display()
                        );
                        return false;
                    }

                    let m = PcmMetadata {
                        sample_endianness: if format_flags & FLAG_IS_LITTLE_ENDIAN != 0 {
                            Endianness::Little
                        } else {
                            Endianness::Big
                        },
                        sample_signedness: Signedness::Signed,
                        sample_padding: Padding::Lsb,
                        bits_per_sample: bits_per_channel.min(255) as u8,
                        bytes_per_sample: (bytes_per_packet / channels_per_frame).min(255) as u8,
                        number_of_channels: channels_per_frame.min(u16::MAX as u32) as u16,
                    };
                    if !self.check_metadata(&m, "CAF", path) {
                        return false;
                    }
                    meta = Some(m);
                }
                b"data" => {
                    let Some(m) = meta else {
                        log::warn!(
                            "[CAF] {}: got `data` chunk without `desc` chunk",
                            path.display()
                        );
                        return false;
                    };
                    // Data chunk starts with a 4-byte edit count.
                    if size < 4 {
                        return false;
                    }
                    let pcm_length = Self::trim_to_frames(&m, size - 4, "CAF", path);
                    self.add_fragments(
                        frag,
                        mapper,
                        m,
                        data.len() as u64,
                        body as u64 + 4,
                        pcm_length,
                    );
                    return true;
                }
                _ => {}
            }

            pos = body + size as usize;
        }

        false
    }
}

impl Categorizer for PcmAudioCategorizer {
    fn name(&self) -> &'static str {
        "pcmaudio"
    }

    fn categories(&self) -> &[&'static str] {
        &[METADATA_CATEGORY, WAVEFORM_CATEGORY]
    }

    fn category_metadata(&self, category_name: &str, c: FragmentCategory) -> Option<Value> {
        if category_name != WAVEFORM_CATEGORY {
            return None;
        }
        let sub = c.subcategory.expect("waveform category must carry a subcategory");
        self.store.lock().unwrap().lookup(sub).map(PcmMetadata::to_json)
    }

    fn subcategory_less(&self, a: FragmentCategory, b: FragmentCategory) -> bool {
        let store = self.store.lock().unwrap();
        match (
            a.subcategory.and_then(|s| store.lookup(s).copied()),
            b.subcategory.and_then(|s| store.lookup(s).copied()),
        ) {
            (Some(ma), Some(mb)) => ma < mb,
            (a, b) => a.is_some() < b.is_some(),
        }
    }
}

impl RandomAccessCategorizer for PcmAudioCategorizer {
    fn categorize(&self, path: &Path, data: &[u8], mapper: &CategoryMapper) -> InodeFragments {
        let mut fragments = InodeFragments::empty();
        if data.len() < MIN_PCMAUDIO_SIZE {
            return fragments;
        }

        if self.check_aiff(&mut fragments, path, data, mapper) {
            return fragments;
        }
        fragments = InodeFragments::empty();
        if self.check_caf(&mut fragments, path, data, mapper) {
            return fragments;
        }
        fragments = InodeFragments::empty();
        if self.check_wav_like(&mut fragments, path, data, mapper, false) {
            return fragments;
        }
        fragments = InodeFragments::empty();
        if self.check_wav_like(&mut fragments, path, data, mapper, true) {
            return fragments;
        }

        InodeFragments::empty()
    }
}
