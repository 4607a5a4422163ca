//! Metric and instance selection.
//!
//! A [`SelectionSpec`] names metrics the way a user writes them (names,
//! subtrees, pmids, instance names). It is resolved once against the inputs'
//! metadata into a [`Selector`], which then filters every data record.

use crate::error::{ArchiveError, Result};
use crate::record::{InDom, IndomSnapshot, MetaRecord, Pmid, ResultRecord, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

/// A metric named by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetricRef {
    /// A metric name, or a non-leaf name selecting the whole subtree below it.
    Name(String),
    /// A numeric metric identifier.
    Pmid(Pmid),
}

/// An instance named by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceRef {
    /// Internal instance id.
    Id(i32),
    /// External instance name, matched up to its first space.
    Name(String),
}

/// One wanted metric with an optional instance restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSelection {
    /// The metric.
    pub metric: MetricRef,
    /// Instances to keep; empty keeps all.
    pub instances: Vec<InstanceRef>,
}

impl MetricSelection {
    /// Selects every instance of a metric.
    pub fn metric(metric: MetricRef) -> Self {
        Self {
            metric,
            instances: Vec::new(),
        }
    }

    /// Selects some instances of a metric.
    pub fn with_instances(metric: MetricRef, instances: Vec<InstanceRef>) -> Self {
        Self { metric, instances }
    }
}

/// Wanted and skipped metrics, as handed over by a configuration parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSpec {
    /// Metrics to keep; empty keeps everything.
    pub wanted: Vec<MetricSelection>,
    /// Metrics to drop regardless of `wanted`.
    pub skip: Vec<MetricRef>,
}

/// Names, instance domains and instances seen across all inputs, used to
/// resolve a [`SelectionSpec`].
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    names: BTreeMap<String, Vec<Pmid>>,
    indoms: HashMap<Pmid, InDom>,
    instances: HashMap<InDom, IndomSnapshot>,
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds what a metadata record tells about names and instances.
    pub fn add(&mut self, record: &MetaRecord) {
        match record {
            MetaRecord::Desc(desc) => {
                for name in &desc.names {
                    let pmids = self.names.entry(name.clone()).or_default();
                    if !pmids.contains(&desc.pmid) {
                        pmids.push(desc.pmid);
                    }
                }
                self.indoms.entry(desc.pmid).or_insert(desc.indom);
            }
            MetaRecord::InDom(snapshot) => {
                // Union of every instance ever seen, ascending by id.
                let known = self.instances.entry(snapshot.indom).or_insert_with(|| {
                    IndomSnapshot::new(snapshot.indom, Timestamp::ZERO, Vec::new())
                });
                let before = known.instances.len();
                for inst in &snapshot.instances {
                    if !known.instances.iter().any(|k| k.id == inst.id) {
                        known.instances.push(inst.clone());
                    }
                }
                if known.instances.len() != before {
                    known.sort();
                }
            }
            MetaRecord::InDomDelta(_) | MetaRecord::Label(_) | MetaRecord::Text(_) => {}
        }
    }

    /// Pmids bound to `name`, or to any metric below it when it is a non-leaf.
    pub fn pmids_for_name(&self, name: &str) -> Vec<Pmid> {
        if let Some(pmids) = self.names.get(name) {
            return pmids.clone();
        }
        let prefix = format!("{name}.");
        let mut pmids: Vec<Pmid> = self
            .names
            .range(prefix.clone()..)
            .take_while(|(candidate, _)| candidate.starts_with(&prefix))
            .flat_map(|(_, pmids)| pmids.iter().copied())
            .collect();
        pmids.sort_unstable();
        pmids.dedup();
        pmids
    }

    /// Instance domain of `pmid`, if a descriptor was seen.
    pub fn indom_of(&self, pmid: Pmid) -> Option<InDom> {
        self.indoms.get(&pmid).copied()
    }

    /// Id of the instance called `name` (up to its first space) in `indom`.
    pub fn instance_by_name(&self, indom: InDom, name: &str) -> Option<i32> {
        self.instances.get(&indom)?.lookup_name(name)
    }

    /// Returns true if `id` was ever an instance of `indom`.
    pub fn has_instance(&self, indom: InDom, id: i32) -> bool {
        self.instances
            .get(&indom)
            .is_some_and(|known| known.instances.iter().any(|inst| inst.id == id))
    }

    fn resolve_metric(&self, metric: &MetricRef) -> Vec<Pmid> {
        match metric {
            MetricRef::Name(name) => self.pmids_for_name(name),
            MetricRef::Pmid(pmid) => {
                if self.indoms.contains_key(pmid) {
                    vec![*pmid]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

fn describe(metric: &MetricRef) -> String {
    match metric {
        MetricRef::Name(name) => name.clone(),
        MetricRef::Pmid(pmid) => format!("pmid {pmid}"),
    }
}

/// Instances kept for one wanted metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceFilter {
    /// Keep every instance.
    All,
    /// Keep only these instance ids.
    Only(HashSet<i32>),
}

impl InstanceFilter {
    fn merge(&mut self, other: InstanceFilter) {
        match other {
            InstanceFilter::All => *self = InstanceFilter::All,
            InstanceFilter::Only(more) => {
                if let InstanceFilter::Only(ids) = self {
                    ids.extend(more);
                }
            }
        }
    }
}

impl SelectionSpec {
    /// Selects everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Resolves names and instance names against `catalog`.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Config`] for a wanted metric or instance that no input
    /// knows, or an instance restriction on a metric without an instance domain.
    pub fn resolve(&self, catalog: &Catalog) -> Result<Selector> {
        let mut selector = Selector::all();

        if !self.wanted.is_empty() {
            let mut wanted: HashMap<Pmid, InstanceFilter> = HashMap::new();
            for selection in &self.wanted {
                let pmids = catalog.resolve_metric(&selection.metric);
                if pmids.is_empty() {
                    return Err(ArchiveError::Config(format!(
                        "metric {} not found in any input archive",
                        describe(&selection.metric)
                    )));
                }
                for pmid in pmids {
                    let filter = resolve_instances(catalog, pmid, selection)?;
                    wanted
                        .entry(pmid)
                        .and_modify(|current| current.merge(filter.clone()))
                        .or_insert(filter);
                }
            }
            selector.wanted = Some(wanted);
        }

        for metric in &self.skip {
            let pmids = catalog.resolve_metric(metric);
            if pmids.is_empty() {
                warn!("skipped metric {} not found in any input archive", describe(metric));
            }
            selector.skip.extend(pmids);
        }
        Ok(selector)
    }
}

fn resolve_instances(
    catalog: &Catalog,
    pmid: Pmid,
    selection: &MetricSelection,
) -> Result<InstanceFilter> {
    if selection.instances.is_empty() {
        return Ok(InstanceFilter::All);
    }
    let indom = catalog.indom_of(pmid).unwrap_or(InDom::NULL);
    if indom.is_null() {
        return Err(ArchiveError::Config(format!(
            "metric {} ({pmid}) has no instance domain",
            describe(&selection.metric)
        )));
    }
    let mut ids = HashSet::with_capacity(selection.instances.len());
    for inst in &selection.instances {
        let id = match inst {
            InstanceRef::Id(id) if catalog.has_instance(indom, *id) => *id,
            InstanceRef::Name(name) => catalog.instance_by_name(indom, name).ok_or_else(|| {
                ArchiveError::Config(format!(
                    "instance \"{name}\" not found in instance domain {indom} of {}",
                    describe(&selection.metric)
                ))
            })?,
            InstanceRef::Id(id) => {
                return Err(ArchiveError::Config(format!(
                    "instance {id} not found in instance domain {indom} of {}",
                    describe(&selection.metric)
                )))
            }
        };
        ids.insert(id);
    }
    Ok(InstanceFilter::Only(ids))
}

/// Resolved selection applied to each data record.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    wanted: Option<HashMap<Pmid, InstanceFilter>>,
    skip: HashSet<Pmid>,
}

impl Selector {
    /// Keeps everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds `pmid` to the skip-list.
    pub fn skip(&mut self, pmid: Pmid) {
        self.skip.insert(pmid);
    }

    /// Returns true if any values of `pmid` can survive selection.
    pub fn wants(&self, pmid: Pmid) -> bool {
        !self.skip.contains(&pmid)
            && self
                .wanted
                .as_ref()
                .map_or(true, |wanted| wanted.contains_key(&pmid))
    }

    /// Narrows `record` to wanted metrics and instances.
    ///
    /// Marks pass unchanged. Returns `None` if no metric survives.
    pub fn apply(&self, mut record: ResultRecord) -> Option<ResultRecord> {
        if record.is_mark() {
            return Some(record);
        }
        record.vsets.retain_mut(|vset| {
            if self.skip.contains(&vset.pmid) {
                return false;
            }
            let Some(wanted) = &self.wanted else {
                return true;
            };
            match wanted.get(&vset.pmid) {
                None => false,
                Some(InstanceFilter::All) => true,
                Some(InstanceFilter::Only(ids)) => {
                    vset.values.retain(|value| ids.contains(&value.inst));
                    !vset.values.is_empty()
                }
            }
        });
        (!record.vsets.is_empty()).then_some(record)
    }
}
