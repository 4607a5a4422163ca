//! Merging several archives into one.
//!
//! [`MergeSession`] drives a run: it reconciles the metadata of every input,
//! resolves the metric selection, then interleaves the data records of all
//! inputs in time order through a [`MergeScheduler`] and writes them to a
//! new archive.

pub mod config;
pub mod merge;
pub mod select;
pub mod session;

pub use config::{ExtractConfig, TimeWindow, MIN_VOLUME_BYTES};
pub use merge::{Emitted, MergeScheduler, MergeStats, Pending, RecordSource};
pub use select::{
    Catalog, InstanceFilter, InstanceRef, MetricRef, MetricSelection, SelectionSpec, Selector,
};
pub use session::{EmptyOutput, ExtractSummary, MergeSession, StopReason};
