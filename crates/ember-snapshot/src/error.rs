use std::io;

use ember_mmu::TlbImageError;
use thiserror::Error;

use crate::format::SectionId;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("not an ember snapshot (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("required section {0} is missing")]
    MissingSection(SectionId),

    #[error("section {0} appears more than once")]
    DuplicateSection(SectionId),

    #[error("section {0} ends before its payload does")]
    TruncatedSection(SectionId),

    /// A field failed validation while decoding; the restore loop rewrites
    /// this into [`SnapshotError::Corrupt`] once it knows the section.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("section {section} is corrupt: {reason}")]
    Corrupt { section: SectionId, reason: &'static str },

    #[error("section {section} disagrees with CPU state: {reason}")]
    Inconsistent { section: SectionId, reason: &'static str },

    #[error("MMU section does not fit this MMU: {0}")]
    TlbImage(#[from] TlbImageError),

    #[error("{0} is out of range for the snapshot format")]
    TooLarge(&'static str),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("guest RAM size mismatch (expected {expected} bytes, found {found} bytes)")]
    RamLenMismatch { expected: u64, found: u64 },

    #[error("lz4 decompression failed: {0}")]
    Lz4Decompress(#[from] lz4_flex::block::DecompressError),
}

impl SnapshotError {
    /// Tie a payload-level error to the section it was read from.
    pub(crate) fn in_section(self, section: SectionId) -> Self {
        match self {
            SnapshotError::InvalidField(reason) => SnapshotError::Corrupt { section, reason },
            SnapshotError::Lz4Decompress(_) => SnapshotError::Corrupt {
                section,
                reason: "lz4 chunk does not decompress",
            },
            SnapshotError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                SnapshotError::TruncatedSection(section)
            }
            other => other,
        }
    }
}
