//! pmarchive - performance metrics archive merging
//!
//! Reads archives made of a metadata file, a temporal index and numbered data
//! volumes, and writes a single archive holding the time-ordered union of
//! their records, optionally cut down to a time window and a set of metrics.
//!
//! # Components
//!
//! - [`record`]: in-memory records and the on-disk codec
//! - [`log`]: [`ArchiveReader`] and [`OutputWriter`] over the archive files
//! - [`meta`]: instance domain deltas and the [`ReconciliationStore`]
//! - [`extract`]: selection, the [`MergeScheduler`] and [`MergeSession`]
//!
//! # Example
//!
//! ```rust,ignore
//! use pmarchive::extract::{ExtractConfig, MergeSession, SelectionSpec, TimeWindow};
//! use pmarchive::record::Timestamp;
//!
//! let config = ExtractConfig {
//!     window: TimeWindow::new(Some(Timestamp::from_secs(start)), None),
//!     sample_limit: Some(1000),
//!     ..ExtractConfig::default()
//! };
//! let summary = MergeSession::new(inputs, "merged", config, SelectionSpec::all()).run()?;
//! assert!(summary.output_written());
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod extract;
pub mod log;
pub mod meta;
pub mod record;

pub use error::{ArchiveError, Result};
pub use extract::{ExtractConfig, ExtractSummary, MergeScheduler, MergeSession, SelectionSpec};
pub use log::{ArchiveReader, OutputWriter};
pub use meta::ReconciliationStore;
pub use record::{ArchiveVersion, InDom, Pmid, ResultRecord, Timestamp};
