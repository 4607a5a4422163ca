//! Instance domain diffing.
//!
//! Consecutive observations of an instance domain usually differ by a handful
//! of instances. [`diff`] decides whether a delta against the previous
//! observation is smaller than a full copy, and [`apply`] rebuilds the full
//! observation from a delta.

use crate::record::{DecodeError, DeltaEntry, IndomDelta, IndomSnapshot, Instance};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// How a new observation should be written relative to the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndomEncoding {
    /// Identical instance list; nothing needs writing.
    Unchanged,
    /// Write the whole instance list.
    Full(IndomSnapshot),
    /// Write only the changes.
    Delta(IndomDelta),
}

/// Returns true when both snapshots hold the same instance list.
///
/// Compares lengths first, then ids, then names. Timestamps are ignored.
pub fn same_instances(a: &IndomSnapshot, b: &IndomSnapshot) -> bool {
    if a.instances.len() != b.instances.len() {
        return false;
    }
    if a.instances
        .iter()
        .zip(&b.instances)
        .any(|(x, y)| x.id != y.id)
    {
        return false;
    }
    a.instances
        .iter()
        .zip(&b.instances)
        .all(|(x, y)| x.name == y.name)
}

/// Chooses the encoding of `new` given the previously written `old`.
///
/// Both snapshots must be sorted by instance id. A renamed instance forces a
/// full write, as does a change count of at least the size of `new`.
pub fn diff(old: &IndomSnapshot, new: &IndomSnapshot) -> IndomEncoding {
    if same_instances(old, new) {
        return IndomEncoding::Unchanged;
    }

    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.instances.len() && j < new.instances.len() {
        let (o, n) = (&old.instances[i], &new.instances[j]);
        match o.id.cmp(&n.id) {
            Ordering::Equal => {
                if o.name != n.name {
                    return IndomEncoding::Full(new.clone());
                }
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                changes.push(DeltaEntry::Delete(o.id));
                i += 1;
            }
            Ordering::Greater => {
                changes.push(DeltaEntry::Add(n.clone()));
                j += 1;
            }
        }
    }
    changes.extend(old.instances[i..].iter().map(|o| DeltaEntry::Delete(o.id)));
    changes.extend(new.instances[j..].iter().cloned().map(DeltaEntry::Add));

    if changes.len() >= new.instances.len() {
        return IndomEncoding::Full(new.clone());
    }
    IndomEncoding::Delta(IndomDelta {
        indom: new.indom,
        timestamp: new.timestamp,
        changes,
    })
}

/// Rebuilds the full observation described by `delta` on top of `prior`.
///
/// Deleting an absent id or adding a present one means the delta was not
/// computed against `prior`.
pub fn apply(prior: &IndomSnapshot, delta: &IndomDelta) -> Result<IndomSnapshot, DecodeError> {
    let mut instances: BTreeMap<i32, String> = prior
        .instances
        .iter()
        .map(|inst| (inst.id, inst.name.clone()))
        .collect();

    for change in &delta.changes {
        match change {
            DeltaEntry::Delete(id) => {
                if instances.remove(id).is_none() {
                    return Err(DecodeError::new(format!(
                        "delta for indom {} deletes unknown instance {id}",
                        delta.indom
                    )));
                }
            }
            DeltaEntry::Add(inst) => {
                if instances.insert(inst.id, inst.name.clone()).is_some() {
                    return Err(DecodeError::new(format!(
                        "delta for indom {} adds existing instance {}",
                        delta.indom, inst.id
                    )));
                }
            }
        }
    }

    Ok(IndomSnapshot {
        indom: delta.indom,
        timestamp: delta.timestamp,
        instances: instances
            .into_iter()
            .map(|(id, name)| Instance { id, name })
            .collect(),
    })
}
