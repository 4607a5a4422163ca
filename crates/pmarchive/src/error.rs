//! Error and Result types for archive operations.

use crate::record::{InDom, Pmid};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for archive operations.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// The error type for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Record framing or content could not be decoded.
    #[error("{archive}: format error at byte offset {offset}: {reason}")]
    Format {
        /// Name of the archive file being read.
        archive: String,
        /// Byte offset of the offending record.
        offset: u64,
        /// What was wrong.
        reason: String,
    },

    /// Corrupt framing found while scanning a file, with the file size for context.
    #[error(
        "{archive}: corrupt record at byte offset {offset} into a file of {file_size} bytes: {reason}"
    )]
    CorruptRecord {
        /// Name of the archive file being read.
        archive: String,
        /// Byte offset of the offending record.
        offset: u64,
        /// Size of the file on disk.
        file_size: u64,
        /// What was wrong.
        reason: String,
    },

    /// The same metric name is bound to two different pmids.
    #[error("{archive}: metric {name} renumbered from pmid {previous} to {pmid}")]
    PmidRenumbered {
        /// Archive where the conflicting definition was seen.
        archive: String,
        /// The metric name in conflict.
        name: String,
        /// The pmid first bound to `name`.
        previous: Pmid,
        /// The pmid seen later.
        pmid: Pmid,
    },

    /// A metric descriptor differs from an earlier sighting of the same pmid.
    #[error("{archive}: metadata for pmid {pmid} does not match: {field} was {expected}, now {found}")]
    MetricMismatch {
        /// Archive where the conflicting descriptor was seen.
        archive: String,
        /// The pmid in conflict.
        pmid: Pmid,
        /// Which descriptor attribute differs.
        field: &'static str,
        /// Value stored from the first sighting.
        expected: String,
        /// Value of the later sighting.
        found: String,
    },

    /// An instance domain snapshot violates instance uniqueness.
    #[error("{archive}: instance domain {indom}: {reason}")]
    InvalidInDom {
        /// Archive the snapshot came from.
        archive: String,
        /// The offending instance domain.
        indom: InDom,
        /// What was wrong.
        reason: String,
    },

    /// A delta instance domain record arrived without a prior snapshot.
    #[error("{archive}: delta for instance domain {indom} has no prior snapshot")]
    OrphanDelta {
        /// Archive the delta came from.
        archive: String,
        /// The instance domain.
        indom: InDom,
    },

    /// A data record references a pmid with no descriptor.
    #[error("no descriptor for pmid {0}")]
    MissingDescriptor(Pmid),

    /// Input archives disagree on a label attribute that must match.
    #[error("label mismatch between {first} ({first_value}) and {other} ({other_value}): {field}")]
    LabelMismatch {
        /// Which label attribute differs.
        field: &'static str,
        /// The first input archive.
        first: String,
        /// The first archive's value.
        first_value: String,
        /// The disagreeing archive.
        other: String,
        /// The disagreeing archive's value.
        other_value: String,
    },

    /// Invalid selection, window, or option.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested conversion cannot be expressed in the target format.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// I/O error bound to a specific file.
    #[error("{}: {source}", .path.display())]
    File {
        /// Path of the file.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    /// Returns true for metadata conflicts that tolerant mode may recover from.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::PmidRenumbered { .. } | Self::MetricMismatch { .. }
        )
    }

    /// Wraps an I/O error with the path it happened on.
    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}
