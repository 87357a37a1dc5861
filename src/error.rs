//! Crate-wide error taxonomy.
//!
//! Worker threads capture errors and hand them back through their result
//! channels; the main thread joins and reports.  File-level scan errors are
//! *not* represented here — the scanner demotes the offending file to empty
//! and counts the error, so a run can still finish with exit code 2.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::section::SectionType;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad CLI/option values, unknown category or codec.  Abort early.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error reading {path}: {source}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error writing {path}: {source}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Magic/version mismatch, bad checksum on a required section,
    /// inconsistent section index or missing section.  Fatal for the reader.
    #[error("corrupt image: {0}")]
    CorruptImage(String),

    /// Checksum mismatch on a BLOCK/HISTORY section during recompress.
    /// Reported; the section is skipped.
    #[error("bad checksum in section {number} ({section_type:?})")]
    BadChecksum {
        number: u32,
        section_type: SectionType,
    },

    /// The image uses features not recognised by this build.
    #[error("unsupported feature in image: {0}")]
    SchemaFeatureUnsupported(String),

    /// Codec rejected by categorizer metadata.  Fatal at writer setup;
    /// per-section at recompress.
    #[error("compression metadata requirements not met for '{category}': {reason}")]
    MetadataRequirementUnmet { category: String, reason: String },

    #[error("out of resources: {0}")]
    OutOfResources(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::IoRead { path: path.into(), source }
    }

    pub fn io_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::IoWrite { path: path.into(), source }
    }
}
