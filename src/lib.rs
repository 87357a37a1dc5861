//! # dwarfs — read-only, content-addressed, block-compressed filesystem
//!
//! Format guarantees (frozen for major version 2):
//! - Every byte after the optional raw header belongs to exactly one
//!   section: magic, version, sequential number, type, compression id,
//!   length, XXH3-64 and SHA-512/256 (see `section`)
//! - Compression ids are frozen 16-bit values; ids are never reused and
//!   an unknown id fails the section, never falls back
//! - The trailing section index ends with an entry for itself, so a
//!   reader finds it from the last 8 bytes without scanning
//! - Metadata is a frozen table set described by a schema section; a
//!   reader MUST reject schemas listing unknown features
//! - Chunk lists concatenate to exactly the original file bytes; chunk
//!   offsets and sizes are multiples of their category's granularity
//!
//! The write path is `scanner` → `categorizer` → `inode` → `segmenter` →
//! `writer`; the read path is `reader` (sections + metadata + block
//! cache).  `ordering` and `nilsimsa` implement the similarity ordering
//! that groups related data ahead of segmentation.

pub mod categorizer;
pub mod codec;
pub mod entry;
pub mod error;
pub mod history;
pub mod inode;
pub mod metadata;
pub mod nilsimsa;
pub mod options;
pub mod ordering;
pub mod progress;
pub mod reader;
pub mod scanner;
pub mod section;
pub mod segmenter;
pub mod writer;

// Flat re-exports for the most common types.
pub use categorizer::{CategorizerManager, FragmentCategory, InodeFragments};
pub use error::{Error, Result};
pub use inode::{InodeManager, OrderPolicy};
pub use metadata::{Metadata, MetadataOptions};
pub use progress::Progress;
pub use reader::{Filesystem, FilesystemOptions};
pub use scanner::{ScanOptions, Scanner};
pub use section::{SectionHeader, SectionType};
pub use segmenter::SegmenterConfig;
pub use writer::{ImageWriter, RecompressMode, WriterOptions};
