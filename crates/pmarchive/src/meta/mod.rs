//! Metadata handling: instance domain diffing and cross-archive reconciliation.

pub mod indom;
pub mod store;

pub use indom::{apply, diff, same_instances, IndomEncoding};
pub use store::{Insertion, LabelKey, ReconciliationStore, Sighting, StoreCounts, TextKey};
