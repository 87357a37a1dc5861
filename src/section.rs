//! On-disk section framing — every byte in an image after the optional raw
//! header belongs to exactly one section.
//!
//! # Header layout (64 bytes, all numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      6   magic        = "DWARFS"  (6 ASCII bytes)
//!    6      1   major        = 2
//!    7      1   minor        = 5
//!    8      4   number       sequential, starts at 0 after the raw header
//!   12      2   type         see [`SectionType`]
//!   14      2   compression  see `codec::CompressionId`
//!   16      8   length       payload bytes that follow the header
//!   24      8   xxh3_64      XXH3-64 over bytes [8..24) ++ payload
//!   32     32   sha2_512_256 SHA-512/256 over bytes [24..32) ++ payload
//!   64      —   payload
//! ```
//!
//! # Checksums
//! `xxh3_64` covers the `number`/`type`/`compression`/`length` fields plus
//! the payload; it is the cheap check performed on open.  `sha2_512_256`
//! covers the `xxh3_64` field plus the payload, chaining the two: verifying
//! the SHA also pins the XXH, which pins the remaining header fields.  The
//! slow check is only run on request (`--check` style full verification).
//!
//! # Section index
//! The `SectionIndex` section is an uncompressed array of `u64` entries
//! `(type << 48) | offset`, with `offset` relative to the first byte after
//! the raw header.  It lists every section in file order and ends with an
//! entry for itself, so a reader can locate it from the last 8 bytes of the
//! image without scanning.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha512_256};
use std::io::{self, Read, Seek, SeekFrom, Write};
use thiserror::Error;
use xxhash_rust::xxh3::Xxh3;

pub const SECTION_MAGIC: &[u8; 6] = b"DWARFS";
pub const MAJOR_VERSION: u8 = 2;
pub const MINOR_VERSION: u8 = 5;
pub const SECTION_HEADER_SIZE: usize = 64;

/// Discriminates the role of a section within the image.
///
/// Values 1..=6 belonged to the retired v1 framing and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SectionType {
    /// Opaque (usually compressed) data block referenced by chunks.
    Block = 0,
    /// Descriptor for the frozen metadata layout.
    MetadataV2Schema = 7,
    /// Frozen metadata tables.
    MetadataV2 = 8,
    /// Uncompressed array of `(type << 48) | offset` entries.
    SectionIndex = 9,
    /// Appendable JSON run-history records.
    History = 10,
}

impl SectionType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(SectionType::Block),
            7 => Some(SectionType::MetadataV2Schema),
            8 => Some(SectionType::MetadataV2),
            9 => Some(SectionType::SectionIndex),
            10 => Some(SectionType::History),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SectionError {
    #[error("invalid section magic — not a DwarFS image section")]
    InvalidMagic,
    #[error("unsupported image version {major}.{minor} (this build handles {MAJOR_VERSION}.x)")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("unknown section type {0}")]
    UnknownType(u16),
    #[error("section {number}: XXH3-64 mismatch (stored {stored:#018x}, computed {computed:#018x})")]
    Xxh3Mismatch {
        number: u32,
        stored: u64,
        computed: u64,
    },
    #[error("section {number}: SHA-512/256 mismatch (stored {stored}, computed {computed})")]
    Sha2Mismatch {
        number: u32,
        stored: String,
        computed: String,
    },
    #[error("section index entry {index} is inconsistent with the section at offset {offset}")]
    BadIndexEntry { index: usize, offset: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Section header ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub major:        u8,
    pub minor:        u8,
    pub number:       u32,
    pub section_type: SectionType,
    /// Raw compression id; resolved by the codec registry.
    pub compression:  u16,
    pub length:       u64,
    pub xxh3_64:      u64,
    pub sha2_512_256: [u8; 32],
}

fn xxh3_over(header_fields: &[u8], payload: &[u8]) -> u64 {
    let mut h = Xxh3::new();
    h.update(header_fields);
    h.update(payload);
    h.digest()
}

fn sha2_over(xxh_field: &[u8; 8], payload: &[u8]) -> [u8; 32] {
    let mut h = Sha512_256::new();
    h.update(xxh_field);
    h.update(payload);
    h.finalize().into()
}

impl SectionHeader {
    /// Build a fully checksummed header for `payload`.
    pub fn for_payload(
        number: u32,
        section_type: SectionType,
        compression: u16,
        payload: &[u8],
    ) -> Self {
        let mut fields = [0u8; 16];
        fields[0..4].copy_from_slice(&number.to_le_bytes());
        fields[4..6].copy_from_slice(&(section_type as u16).to_le_bytes());
        fields[6..8].copy_from_slice(&compression.to_le_bytes());
        fields[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());

        let xxh3_64 = xxh3_over(&fields, payload);
        let sha2_512_256 = sha2_over(&xxh3_64.to_le_bytes(), payload);

        SectionHeader {
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            number,
            section_type,
            compression,
            length: payload.len() as u64,
            xxh3_64,
            sha2_512_256,
        }
    }

    /// Write the 64-byte header.
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(SECTION_MAGIC)?;
        w.write_all(&[self.major, self.minor])?;
        w.write_u32::<LittleEndian>(self.number)?;
        w.write_u16::<LittleEndian>(self.section_type as u16)?;
        w.write_u16::<LittleEndian>(self.compression)?;
        w.write_u64::<LittleEndian>(self.length)?;
        w.write_u64::<LittleEndian>(self.xxh3_64)?;
        w.write_all(&self.sha2_512_256)
    }

    /// Read and structurally validate a 64-byte header.
    ///
    /// Checksum validation is separate ([`SectionHeader::verify_fast`],
    /// [`SectionHeader::verify_full`]) because it needs the payload.
    pub fn read<R: Read>(mut r: R) -> Result<Self, SectionError> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)?;
        if &magic != SECTION_MAGIC {
            return Err(SectionError::InvalidMagic);
        }

        let major = r.read_u8()?;
        let minor = r.read_u8()?;
        if major != MAJOR_VERSION {
            return Err(SectionError::UnsupportedVersion { major, minor });
        }

        let number = r.read_u32::<LittleEndian>()?;
        let type_raw = r.read_u16::<LittleEndian>()?;
        let section_type =
            SectionType::from_u16(type_raw).ok_or(SectionError::UnknownType(type_raw))?;
        let compression = r.read_u16::<LittleEndian>()?;
        let length = r.read_u64::<LittleEndian>()?;
        let xxh3_64 = r.read_u64::<LittleEndian>()?;
        let mut sha2_512_256 = [0u8; 32];
        r.read_exact(&mut sha2_512_256)?;

        Ok(SectionHeader {
            major,
            minor,
            number,
            section_type,
            compression,
            length,
            xxh3_64,
            sha2_512_256,
        })
    }

    fn checksummed_fields(&self) -> [u8; 16] {
        let mut fields = [0u8; 16];
        fields[0..4].copy_from_slice(&self.number.to_le_bytes());
        fields[4..6].copy_from_slice(&(self.section_type as u16).to_le_bytes());
        fields[6..8].copy_from_slice(&self.compression.to_le_bytes());
        fields[8..16].copy_from_slice(&self.length.to_le_bytes());
        fields
    }

    /// Fast check: XXH3-64 over the numbered header fields plus payload.
    pub fn verify_fast(&self, payload: &[u8]) -> Result<(), SectionError> {
        let computed = xxh3_over(&self.checksummed_fields(), payload);
        if computed != self.xxh3_64 {
            return Err(SectionError::Xxh3Mismatch {
                number: self.number,
                stored: self.xxh3_64,
                computed,
            });
        }
        Ok(())
    }

    /// Full check: the fast check plus SHA-512/256 over the xxh3 field and
    /// the payload.
    pub fn verify_full(&self, payload: &[u8]) -> Result<(), SectionError> {
        self.verify_fast(payload)?;
        let computed = sha2_over(&self.xxh3_64.to_le_bytes(), payload);
        if computed != self.sha2_512_256 {
            return Err(SectionError::Sha2Mismatch {
                number: self.number,
                stored: hex::encode(self.sha2_512_256),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }
}

// ── Section index ────────────────────────────────────────────────────────────

/// One parsed entry of the `SectionIndex` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionIndexEntry {
    pub section_type: SectionType,
    /// Offset of the section header, relative to the end of the raw header.
    pub offset: u64,
}

impl SectionIndexEntry {
    pub const OFFSET_MASK: u64 = (1 << 48) - 1;

    pub fn encode(&self) -> u64 {
        ((self.section_type as u64) << 48) | (self.offset & Self::OFFSET_MASK)
    }

    pub fn decode(v: u64) -> Result<Self, SectionError> {
        let type_raw = (v >> 48) as u16;
        let section_type =
            SectionType::from_u16(type_raw).ok_or(SectionError::UnknownType(type_raw))?;
        Ok(SectionIndexEntry {
            section_type,
            offset: v & Self::OFFSET_MASK,
        })
    }
}

/// Serialize index entries (including the trailing self-entry) into the
/// uncompressed payload of a `SectionIndex` section.
pub fn encode_section_index(entries: &[SectionIndexEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 8);
    for e in entries {
        out.extend_from_slice(&e.encode().to_le_bytes());
    }
    out
}

pub fn decode_section_index(payload: &[u8]) -> Result<Vec<SectionIndexEntry>, SectionError> {
    if payload.len() % 8 != 0 {
        return Err(SectionError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "section index payload is not a multiple of 8 bytes",
        )));
    }
    payload
        .chunks_exact(8)
        .map(|c| SectionIndexEntry::decode(u64::from_le_bytes(c.try_into().unwrap())))
        .collect()
}

// ── Image parsing ────────────────────────────────────────────────────────────

/// A section located within an image: header plus payload position.
#[derive(Debug, Clone)]
pub struct RawSection {
    pub header: SectionHeader,
    /// Absolute file offset of the section header.
    pub header_offset: u64,
}

impl RawSection {
    pub fn payload_offset(&self) -> u64 {
        self.header_offset + SECTION_HEADER_SIZE as u64
    }

    pub fn end_offset(&self) -> u64 {
        self.payload_offset() + self.header.length
    }
}

/// Scans forward from `start` for the section magic, up to `limit` bytes.
/// Used for `offset=auto` when the image is embedded in a larger file.
pub fn find_image_offset<R: Read + Seek>(r: &mut R, limit: u64) -> Result<u64, SectionError> {
    r.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    r.by_ref().take(limit).read_to_end(&mut buf)?;

    let mut pos = 0usize;
    while pos + SECTION_HEADER_SIZE <= buf.len() {
        if &buf[pos..pos + 6] == SECTION_MAGIC && buf[pos + 6] == MAJOR_VERSION {
            // Candidate: the first section must be numbered 0.
            let number = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap());
            if number == 0 {
                return Ok(pos as u64);
            }
        }
        pos += 1;
    }

    Err(SectionError::InvalidMagic)
}

/// Read every section header sequentially starting at `image_offset`.
///
/// Stops cleanly at EOF.  Payloads are not read; callers seek to
/// `payload_offset()` for the sections they need.
pub fn scan_sections<R: Read + Seek>(
    r: &mut R,
    image_offset: u64,
) -> Result<Vec<RawSection>, SectionError> {
    let file_len = r.seek(SeekFrom::End(0))?;
    let mut pos = image_offset;
    let mut sections = Vec::new();

    while pos + SECTION_HEADER_SIZE as u64 <= file_len {
        r.seek(SeekFrom::Start(pos))?;
        let header = SectionHeader::read(&mut *r)?;
        let sec = RawSection {
            header,
            header_offset: pos,
        };
        if sec.end_offset() > file_len {
            return Err(SectionError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "section {} payload extends past end of file",
                    header.number
                ),
            )));
        }
        pos = sec.end_offset();
        sections.push(sec);
    }

    Ok(sections)
}

/// Try to locate sections through the trailing section index.
///
/// Returns `None` when the image carries no index; callers fall back to
/// [`scan_sections`].
pub fn sections_from_index<R: Read + Seek>(
    r: &mut R,
    image_offset: u64,
) -> Result<Option<Vec<RawSection>>, SectionError> {
    let file_len = r.seek(SeekFrom::End(0))?;
    if file_len < image_offset + 8 {
        return Ok(None);
    }

    // The final 8 bytes are the index's self-entry.
    r.seek(SeekFrom::Start(file_len - 8))?;
    let tail = r.read_u64::<LittleEndian>()?;
    let self_entry = match SectionIndexEntry::decode(tail) {
        Ok(e) if e.section_type == SectionType::SectionIndex => e,
        _ => return Ok(None),
    };

    let index_hdr_pos = image_offset + self_entry.offset;
    if index_hdr_pos + SECTION_HEADER_SIZE as u64 > file_len {
        return Ok(None);
    }

    r.seek(SeekFrom::Start(index_hdr_pos))?;
    let header = match SectionHeader::read(&mut *r) {
        Ok(h) if h.section_type == SectionType::SectionIndex => h,
        _ => return Ok(None),
    };

    let mut payload = vec![0u8; header.length as usize];
    r.read_exact(&mut payload)?;
    header.verify_fast(&payload)?;

    let entries = decode_section_index(&payload)?;
    let mut sections = Vec::with_capacity(entries.len());

    for (i, e) in entries.iter().enumerate() {
        let hdr_pos = image_offset + e.offset;
        r.seek(SeekFrom::Start(hdr_pos))?;
        let h = SectionHeader::read(&mut *r)?;
        if h.section_type != e.section_type {
            return Err(SectionError::BadIndexEntry {
                index: i,
                offset: e.offset,
            });
        }
        sections.push(RawSection {
            header: h,
            header_offset: hdr_pos,
        });
    }

    Ok(Some(sections))
}
