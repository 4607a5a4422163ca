//! Metadata reconciliation across input archives.
//!
//! The store owns one descriptor per pmid and a timestamp-ordered history of
//! every instance domain, label set and help text seen in any input. It
//! enforces that a metric means the same thing everywhere, and it hands the
//! writer exactly the metadata a data record needs, each entry at most once.

use crate::error::{ArchiveError, Result};
use crate::record::{
    InDom, IndomSnapshot, LabelRecord, LabelScope, MetaRecord, MetricDescriptor, Pmid,
    ResultRecord, TextKind, TextRecord, TextTarget, Timestamp,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Key of a label history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelKey {
    /// What the labels are attached to.
    pub scope: LabelScope,
    /// Identifier within the scope.
    pub ident: u32,
}

impl LabelKey {
    /// Returns true when labels under this key describe `pmid` (with instance domain `indom`).
    pub fn applies_to(&self, pmid: Pmid, indom: InDom) -> bool {
        match self.scope {
            LabelScope::Context => true,
            LabelScope::Domain => self.ident == pmid.domain(),
            LabelScope::Cluster => self.ident == pmid.cluster_id(),
            LabelScope::Item => self.ident == pmid.0,
            LabelScope::InDom | LabelScope::Instances => !indom.is_null() && self.ident == indom.0,
        }
    }

    /// Keys of every non-context label history that can describe `pmid`.
    fn entity_keys(pmid: Pmid, indom: InDom) -> impl Iterator<Item = LabelKey> {
        let key = |scope, ident| LabelKey { scope, ident };
        let indom_keys = (!indom.is_null()).then(|| {
            [
                key(LabelScope::InDom, indom.0),
                key(LabelScope::Instances, indom.0),
            ]
        });
        [
            key(LabelScope::Domain, pmid.domain()),
            key(LabelScope::Cluster, pmid.cluster_id()),
            key(LabelScope::Item, pmid.0),
        ]
        .into_iter()
        .chain(indom_keys.into_iter().flatten())
    }
}

/// Key of a help text history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextKey {
    /// One-line or full help.
    pub kind: TextKind,
    /// What the text describes.
    pub target: TextTarget,
}

/// Result of offering a descriptor to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First time this pmid was seen.
    New,
    /// Consistent repeat of a known pmid.
    Repeat,
    /// The pmid is skip-listed and the descriptor was ignored.
    Skipped,
}

/// Result of offering a timestamped entry to a history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// Added at a new timestamp.
    Added,
    /// Identical to the entry already held at this timestamp.
    Duplicate,
    /// Replaced an unwritten entry at the same timestamp.
    Replaced,
    /// Differs from an entry at the same timestamp that is already written.
    Ignored,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    written: bool,
}

impl<T> Entry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            written: false,
        }
    }
}

type History<T> = BTreeMap<Timestamp, Entry<T>>;

fn insert_timed<T: PartialEq>(history: &mut History<T>, ts: Timestamp, value: T) -> Insertion {
    match history.get_mut(&ts) {
        None => {
            history.insert(ts, Entry::new(value));
            Insertion::Added
        }
        Some(existing) if existing.value == value => Insertion::Duplicate,
        Some(existing) if !existing.written => {
            existing.value = value;
            Insertion::Replaced
        }
        Some(_) => Insertion::Ignored,
    }
}

/// Greatest entry with timestamp <= `ts`.
fn floor_mut<T>(history: &mut History<T>, ts: Timestamp) -> Option<&mut Entry<T>> {
    history.range_mut(..=ts).next_back().map(|(_, entry)| entry)
}

/// Entry counts held by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    /// Metric descriptors.
    pub descriptors: usize,
    /// Instance domain snapshots across all domains.
    pub indoms: usize,
    /// Label records across all keys.
    pub labels: usize,
    /// Help texts across all keys.
    pub texts: usize,
}

#[derive(Debug, Clone)]
struct DescEntry {
    desc: MetricDescriptor,
    written: bool,
}

/// Reconciled metadata of all inputs.
#[derive(Debug, Default)]
pub struct ReconciliationStore {
    tolerant: bool,
    descs: HashMap<Pmid, DescEntry>,
    names: HashMap<String, Pmid>,
    skipped: BTreeSet<Pmid>,
    indoms: HashMap<InDom, History<IndomSnapshot>>,
    labels: BTreeMap<LabelKey, History<LabelRecord>>,
    texts: HashMap<TextKey, History<TextRecord>>,
}

impl ReconciliationStore {
    /// Creates an empty store. In tolerant mode metric conflicts skip-list
    /// the offending pmid instead of failing.
    pub fn new(tolerant: bool) -> Self {
        Self {
            tolerant,
            ..Self::default()
        }
    }

    /// Records a metric descriptor sighting from `archive`.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::PmidRenumbered`] when one of its names belongs to a
    /// different pmid, [`ArchiveError::MetricMismatch`] when it disagrees with
    /// the stored descriptor. Neither is returned in tolerant mode.
    pub fn add_desc(&mut self, archive: &str, desc: MetricDescriptor) -> Result<Sighting> {
        if self.skipped.contains(&desc.pmid) {
            return Ok(Sighting::Skipped);
        }
        match self.check_desc(archive, &desc) {
            Ok(()) => {}
            Err(err) if self.tolerant && err.is_consistency() => {
                warn!("{err}; skipping pmid {} in all output", desc.pmid);
                self.skip(desc.pmid);
                return Ok(Sighting::Skipped);
            }
            Err(err) => return Err(err),
        }

        if self.descs.contains_key(&desc.pmid) {
            return Ok(Sighting::Repeat);
        }
        debug!(pmid = %desc.pmid, names = ?desc.names, "new metric");
        for name in &desc.names {
            self.names.insert(name.clone(), desc.pmid);
        }
        if !desc.indom.is_null() {
            self.indoms.entry(desc.indom).or_default();
        }
        self.descs.insert(
            desc.pmid,
            DescEntry {
                desc,
                written: false,
            },
        );
        Ok(Sighting::New)
    }

    fn check_desc(&self, archive: &str, desc: &MetricDescriptor) -> Result<()> {
        for name in &desc.names {
            if let Some(&owner) = self.names.get(name) {
                if owner != desc.pmid {
                    return Err(ArchiveError::PmidRenumbered {
                        archive: archive.to_string(),
                        name: name.clone(),
                        previous: owner,
                        pmid: desc.pmid,
                    });
                }
            }
        }

        let Some(stored) = self.descs.get(&desc.pmid).map(|entry| &entry.desc) else {
            return Ok(());
        };
        let mismatch = |field: &'static str, expected: String, found: String| {
            Err(ArchiveError::MetricMismatch {
                archive: archive.to_string(),
                pmid: desc.pmid,
                field,
                expected,
                found,
            })
        };
        if stored.metric_type != desc.metric_type {
            return mismatch(
                "type",
                format!("{:?}", stored.metric_type),
                format!("{:?}", desc.metric_type),
            );
        }
        if stored.indom != desc.indom {
            return mismatch("indom", stored.indom.to_string(), desc.indom.to_string());
        }
        if stored.semantics != desc.semantics {
            return mismatch(
                "semantics",
                format!("{:?}", stored.semantics),
                format!("{:?}", desc.semantics),
            );
        }
        if stored.units != desc.units {
            return mismatch("units", stored.units.to_string(), desc.units.to_string());
        }
        let stored_names: BTreeSet<&String> = stored.names.iter().collect();
        let names: BTreeSet<&String> = desc.names.iter().collect();
        if stored_names != names {
            return mismatch(
                "names",
                stored.names.join(","),
                desc.names.join(","),
            );
        }
        Ok(())
    }

    fn skip(&mut self, pmid: Pmid) {
        self.skipped.insert(pmid);
        if let Some(entry) = self.descs.remove(&pmid) {
            for name in &entry.desc.names {
                if self.names.get(name) == Some(&pmid) {
                    self.names.remove(name);
                }
            }
        }
    }

    /// Records an instance domain snapshot.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::InvalidInDom`] when instance ids or names are not unique.
    pub fn add_indom(&mut self, archive: &str, snapshot: IndomSnapshot) -> Result<Insertion> {
        snapshot
            .check_unique()
            .map_err(|reason| ArchiveError::InvalidInDom {
                archive: archive.to_string(),
                indom: snapshot.indom,
                reason,
            })?;
        let ts = snapshot.timestamp;
        let indom = snapshot.indom;
        let outcome = insert_timed(self.indoms.entry(indom).or_default(), ts, snapshot);
        if outcome == Insertion::Ignored {
            warn!("{archive}: indom {indom} at {ts} differs from an entry already written");
        }
        Ok(outcome)
    }

    /// Records a label record.
    pub fn add_label(&mut self, archive: &str, label: LabelRecord) -> Insertion {
        let key = LabelKey {
            scope: label.scope,
            ident: label.ident,
        };
        let ts = label.timestamp;
        let outcome = insert_timed(self.labels.entry(key).or_default(), ts, label);
        if outcome == Insertion::Ignored {
            warn!("{archive}: labels {key:?} at {ts} differ from an entry already written");
        }
        outcome
    }

    /// Records a help text, filed under `ts` for time lookups.
    pub fn add_text(&mut self, archive: &str, ts: Timestamp, text: TextRecord) -> Insertion {
        let key = TextKey {
            kind: text.kind,
            target: text.target,
        };
        let outcome = insert_timed(self.texts.entry(key).or_default(), ts, text);
        if outcome == Insertion::Ignored {
            warn!("{archive}: help text {key:?} at {ts} differs from an entry already written");
        }
        outcome
    }

    /// Returns true if `pmid` is excluded from output.
    pub fn is_skipped(&self, pmid: Pmid) -> bool {
        self.skipped.contains(&pmid)
    }

    /// Pmids excluded from output, ascending.
    pub fn skipped(&self) -> impl Iterator<Item = Pmid> + '_ {
        self.skipped.iter().copied()
    }

    /// Stored descriptor for `pmid`.
    pub fn descriptor(&self, pmid: Pmid) -> Option<&MetricDescriptor> {
        self.descs.get(&pmid).map(|entry| &entry.desc)
    }

    /// All stored descriptors, in no particular order.
    pub fn descriptors(&self) -> impl Iterator<Item = &MetricDescriptor> {
        self.descs.values().map(|entry| &entry.desc)
    }

    /// Pmid currently bound to `name`.
    pub fn lookup_name(&self, name: &str) -> Option<Pmid> {
        self.names.get(name).copied()
    }

    /// Latest snapshot of `indom` with timestamp <= `ts`.
    pub fn floor_indom(&self, indom: InDom, ts: Timestamp) -> Option<&IndomSnapshot> {
        self.indoms
            .get(&indom)?
            .range(..=ts)
            .next_back()
            .map(|(_, entry)| &entry.value)
    }

    /// Latest label record under `key` with timestamp <= `ts`.
    pub fn floor_label(&self, key: LabelKey, ts: Timestamp) -> Option<&LabelRecord> {
        self.labels
            .get(&key)?
            .range(..=ts)
            .next_back()
            .map(|(_, entry)| &entry.value)
    }

    /// Latest help text under `key` with timestamp <= `ts`.
    pub fn floor_text(&self, key: TextKey, ts: Timestamp) -> Option<&TextRecord> {
        self.texts
            .get(&key)?
            .range(..=ts)
            .next_back()
            .map(|(_, entry)| &entry.value)
    }

    /// Number of entries held.
    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            descriptors: self.descs.len(),
            indoms: self.indoms.values().map(BTreeMap::len).sum(),
            labels: self.labels.values().map(BTreeMap::len).sum(),
            texts: self.texts.values().map(BTreeMap::len).sum(),
        }
    }

    /// Collects the not-yet-written metadata `record` needs and marks it written.
    ///
    /// For each metric: its descriptor, then the latest instance domain
    /// snapshot, label records and help texts at or before the record's
    /// timestamp. Instance domains come back with their original timestamps;
    /// the writer restamps them.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::MissingDescriptor`] if the record names an unknown pmid.
    pub fn take_metadata(&mut self, record: &ResultRecord) -> Result<Vec<MetaRecord>> {
        let ts = record.timestamp;
        let mut out = Vec::new();
        let mut label_keys = BTreeSet::new();

        for vset in &record.vsets {
            let entry = self
                .descs
                .get_mut(&vset.pmid)
                .ok_or(ArchiveError::MissingDescriptor(vset.pmid))?;
            if !entry.written {
                entry.written = true;
                out.push(MetaRecord::Desc(entry.desc.clone()));
            }
            let indom = entry.desc.indom;
            label_keys.extend(LabelKey::entity_keys(vset.pmid, indom));

            if !indom.is_null() {
                if let Some(found) = self.indoms.get_mut(&indom).and_then(|h| floor_mut(h, ts)) {
                    if !found.written {
                        found.written = true;
                        out.push(MetaRecord::InDom(found.value.clone()));
                    }
                }
            }

            for kind in [TextKind::OneLine, TextKind::Help] {
                let targets = [
                    Some(TextTarget::Pmid(vset.pmid)),
                    (!indom.is_null()).then_some(TextTarget::InDom(indom)),
                ];
                for target in targets.into_iter().flatten() {
                    let key = TextKey { kind, target };
                    if let Some(found) = self.texts.get_mut(&key).and_then(|h| floor_mut(h, ts)) {
                        if !found.written {
                            found.written = true;
                            out.push(MetaRecord::Text(found.value.clone()));
                        }
                    }
                }
            }
        }

        if !record.vsets.is_empty() {
            // Context labels describe every metric, whatever their ident.
            let context = LabelKey {
                scope: LabelScope::Context,
                ident: 0,
            }..=LabelKey {
                scope: LabelScope::Context,
                ident: u32::MAX,
            };
            label_keys.extend(self.labels.range(context).map(|(key, _)| *key));
        }
        for key in label_keys {
            let Some(history) = self.labels.get_mut(&key) else {
                continue;
            };
            if let Some(found) = floor_mut(history, ts) {
                if !found.written {
                    found.written = true;
                    out.push(MetaRecord::Label(found.value.clone()));
                }
            }
        }

        Ok(out)
    }
}
