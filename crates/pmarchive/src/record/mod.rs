//! Record model shared by the reader, the reconciliation store and the writer.
//!
//! Every record an archive can hold is decoded once, by [`codec`], into one of
//! the owned types below. Nothing downstream looks at raw bytes again.

pub mod codec;
pub mod frame;

use std::fmt;

pub use codec::{
    decode_label, decode_meta, decode_result, encode_label, encode_meta, encode_result,
    DecodeError, RecordType,
};
pub use frame::{read_record, write_record, FrameError, FRAME_OVERHEAD};

/// Magic number shared by all archive labels; the low byte carries the version.
pub const LOG_MAGIC: u32 = 0x5005_2600;

/// Volume number stored in the metadata file label.
pub const VOL_META: i32 = -1;

/// Volume number stored in the temporal index label.
pub const VOL_INDEX: i32 = -2;

/// Archive format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArchiveVersion {
    /// Legacy format: 32-bit timestamps with microsecond resolution, 32-bit offsets.
    V2,
    /// Current format: 64-bit seconds plus nanoseconds, 64-bit offsets, delta indoms.
    V3,
}

impl ArchiveVersion {
    /// Creates a version from the number in the label magic.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }

    /// Returns the version number.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Largest byte offset a data volume may reach in this version.
    pub fn max_volume_offset(self) -> u64 {
        match self {
            Self::V2 => i32::MAX as u64,
            Self::V3 => i64::MAX as u64,
        }
    }
}

impl fmt::Display for ArchiveVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u32())
    }
}

/// Point in time with nanosecond resolution.
///
/// Ordering is lexicographic on `(sec, nsec)`, so the derived `Ord` is the
/// archive's time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Seconds since the epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: u32,
}

impl Timestamp {
    /// The epoch.
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    /// Number of seconds in a day, the step of the daily window roll.
    pub const SECS_PER_DAY: i64 = 86_400;

    /// Creates a timestamp, normalizing an overflowing nanosecond field.
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self {
            sec: sec + (nsec / 1_000_000_000) as i64,
            nsec: nsec % 1_000_000_000,
        }
    }

    /// Creates a timestamp from whole seconds.
    pub fn from_secs(sec: i64) -> Self {
        Self { sec, nsec: 0 }
    }

    /// Creates a timestamp from seconds and microseconds.
    pub fn from_micros(sec: i64, usec: u32) -> Self {
        Self::new(sec, usec.saturating_mul(1000))
    }

    /// Microseconds within the second (legacy resolution).
    pub fn usec(&self) -> u32 {
        self.nsec / 1000
    }

    /// Returns true if this timestamp can be stored in a legacy 32-bit field.
    pub fn fits_legacy(&self) -> bool {
        self.sec >= 0 && self.sec <= i64::from(u32::MAX)
    }

    /// Returns this timestamp shifted by whole seconds, saturating at the
    /// ends of the range.
    pub fn add_secs(self, secs: i64) -> Self {
        Self {
            sec: self.sec.saturating_add(secs),
            nsec: self.nsec,
        }
    }

    /// Returns this timestamp shifted by whole seconds, or `None` on overflow.
    pub fn checked_add_secs(self, secs: i64) -> Option<Self> {
        Some(Self {
            sec: self.sec.checked_add(secs)?,
            nsec: self.nsec,
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Performance metric identifier: domain (9 bits), cluster (12 bits), item (10 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pmid(pub u32);

impl Pmid {
    /// `pmcd.pid`, the process id of the collector that wrote a prologue/epilogue.
    pub const PMCD_PID: Pmid = Pmid::new(2, 0, 23);

    /// `pmcd.seqnum`, the collector's sequence number for the same records.
    pub const PMCD_SEQNUM: Pmid = Pmid::new(2, 0, 24);

    /// Builds a pmid from its components.
    pub const fn new(domain: u32, cluster: u32, item: u32) -> Self {
        Self(((domain & 0x1ff) << 22) | ((cluster & 0xfff) << 10) | (item & 0x3ff))
    }

    /// Agent domain.
    pub fn domain(self) -> u32 {
        (self.0 >> 22) & 0x1ff
    }

    /// Cluster within the domain.
    pub fn cluster(self) -> u32 {
        (self.0 >> 10) & 0xfff
    }

    /// Item within the cluster.
    pub fn item(self) -> u32 {
        self.0 & 0x3ff
    }

    /// Identifier of the cluster this pmid belongs to (item zeroed), used for cluster labels.
    pub fn cluster_id(self) -> u32 {
        Self::new(self.domain(), self.cluster(), 0).0
    }
}

impl fmt::Display for Pmid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.domain(), self.cluster(), self.item())
    }
}

/// Instance domain identifier: domain (9 bits), serial (22 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InDom(pub u32);

impl InDom {
    /// Marker for metrics with a single value and no instance domain.
    pub const NULL: InDom = InDom(u32::MAX);

    /// Builds an instance domain identifier.
    pub const fn new(domain: u32, serial: u32) -> Self {
        Self(((domain & 0x1ff) << 22) | (serial & 0x3f_ffff))
    }

    /// Returns true for the null instance domain.
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// Agent domain.
    pub fn domain(self) -> u32 {
        (self.0 >> 22) & 0x1ff
    }

    /// Serial number within the domain.
    pub fn serial(self) -> u32 {
        self.0 & 0x3f_ffff
    }
}

impl fmt::Display for InDom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("PM_INDOM_NULL")
        } else {
            write!(f, "{}.{}", self.domain(), self.serial())
        }
    }
}

/// Data type of a metric's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// NUL-terminated string.
    String,
    /// Opaque byte blob.
    Aggregate,
    /// Opaque static byte blob.
    AggregateStatic,
    /// Event records.
    Event,
    /// High resolution event records.
    HighResEvent,
    /// Metric not supported by its agent.
    NoSupport,
    /// Any other wire value, carried through untouched.
    Other(i32),
}

impl MetricType {
    /// Maps the wire value.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::I32,
            1 => Self::U32,
            2 => Self::I64,
            3 => Self::U64,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::String,
            7 => Self::Aggregate,
            8 => Self::AggregateStatic,
            9 => Self::Event,
            10 => Self::HighResEvent,
            -1 => Self::NoSupport,
            other => Self::Other(other),
        }
    }

    /// Returns the wire value.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::I32 => 0,
            Self::U32 => 1,
            Self::I64 => 2,
            Self::U64 => 3,
            Self::Float => 4,
            Self::Double => 5,
            Self::String => 6,
            Self::Aggregate => 7,
            Self::AggregateStatic => 8,
            Self::Event => 9,
            Self::HighResEvent => 10,
            Self::NoSupport => -1,
            Self::Other(value) => value,
        }
    }
}

/// Value semantics of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semantics {
    /// Monotonically increasing counter.
    Counter,
    /// Instantaneous value.
    Instant,
    /// Value that rarely changes.
    Discrete,
    /// Any other wire value.
    Other(i32),
}

impl Semantics {
    /// Maps the wire value.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Counter,
            3 => Self::Instant,
            4 => Self::Discrete,
            other => Self::Other(other),
        }
    }

    /// Returns the wire value.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Counter => 1,
            Self::Instant => 3,
            Self::Discrete => 4,
            Self::Other(value) => value,
        }
    }
}

/// Packed dimension and scale of a metric (space, time, count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Units(pub u32);

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Metric descriptor: one per pmid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Metric identifier.
    pub pmid: Pmid,
    /// Value type.
    pub metric_type: MetricType,
    /// Instance domain, or [`InDom::NULL`].
    pub indom: InDom,
    /// Value semantics.
    pub semantics: Semantics,
    /// Dimension and scale.
    pub units: Units,
    /// Names bound to this pmid.
    pub names: Vec<String>,
}

/// One `(instance id, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instance {
    /// Internal instance identifier.
    pub id: i32,
    /// External instance name.
    pub name: String,
}

impl Instance {
    /// Creates an instance.
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Name up to the first space, the part that must be unique within a domain.
    pub fn short_name(&self) -> &str {
        self.name.split(' ').next().unwrap_or("")
    }
}

/// A full observation of an instance domain at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndomSnapshot {
    /// Instance domain.
    pub indom: InDom,
    /// When the observation was made.
    pub timestamp: Timestamp,
    /// Instances, ascending by id once [`IndomSnapshot::sort`] has run.
    pub instances: Vec<Instance>,
}

impl IndomSnapshot {
    /// Creates a snapshot, sorting instances by id.
    pub fn new(indom: InDom, timestamp: Timestamp, instances: Vec<Instance>) -> Self {
        let mut snapshot = Self {
            indom,
            timestamp,
            instances,
        };
        snapshot.sort();
        snapshot
    }

    /// Sorts instances into ascending id order.
    pub fn sort(&mut self) {
        self.instances.sort_by_key(|inst| inst.id);
    }

    /// Checks that ids are unique and names are unique up to the first space.
    ///
    /// Returns the reason for the first violation found.
    pub fn check_unique(&self) -> std::result::Result<(), String> {
        let mut ids = std::collections::HashSet::with_capacity(self.instances.len());
        let mut names = std::collections::HashSet::with_capacity(self.instances.len());
        for inst in &self.instances {
            if !ids.insert(inst.id) {
                return Err(format!("duplicate instance id {}", inst.id));
            }
            if !names.insert(inst.short_name()) {
                return Err(format!("duplicate instance name \"{}\"", inst.short_name()));
            }
        }
        Ok(())
    }

    /// Looks up an instance id by name, matching up to the first space.
    pub fn lookup_name(&self, name: &str) -> Option<i32> {
        let wanted = name.split(' ').next().unwrap_or("");
        self.instances
            .iter()
            .find(|inst| inst.short_name() == wanted)
            .map(|inst| inst.id)
    }
}

/// One change carried by a delta instance domain record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEntry {
    /// Instance present in the new observation only.
    Add(Instance),
    /// Instance id present in the old observation only.
    Delete(i32),
}

impl DeltaEntry {
    /// Instance id this change applies to.
    pub fn id(&self) -> i32 {
        match self {
            Self::Add(inst) => inst.id,
            Self::Delete(id) => *id,
        }
    }
}

/// Changes relative to the immediately preceding snapshot of the same indom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndomDelta {
    /// Instance domain.
    pub indom: InDom,
    /// When the new observation was made.
    pub timestamp: Timestamp,
    /// Changes in ascending instance id order.
    pub changes: Vec<DeltaEntry>,
}

/// Scope a label set is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LabelScope {
    /// Whole collection context.
    Context,
    /// Agent domain.
    Domain,
    /// Instance domain.
    InDom,
    /// Metric cluster.
    Cluster,
    /// Single metric.
    Item,
    /// Each instance of an instance domain.
    Instances,
}

impl LabelScope {
    /// Maps the wire flag.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x01 => Some(Self::Context),
            0x02 => Some(Self::Domain),
            0x04 => Some(Self::InDom),
            0x08 => Some(Self::Cluster),
            0x10 => Some(Self::Item),
            0x20 => Some(Self::Instances),
            _ => None,
        }
    }

    /// Returns the wire flag.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Context => 0x01,
            Self::Domain => 0x02,
            Self::InDom => 0x04,
            Self::Cluster => 0x08,
            Self::Item => 0x10,
            Self::Instances => 0x20,
        }
    }
}

/// Position of one name/value pair inside a label set's JSON text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    /// Offset of the name.
    pub name_off: u16,
    /// Length of the name.
    pub name_len: u8,
    /// Label flags.
    pub flags: u8,
    /// Offset of the value.
    pub value_off: u16,
    /// Length of the value.
    pub value_len: u16,
}

/// One JSON label set, optionally bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelSet {
    /// Instance the set belongs to, `None` outside [`LabelScope::Instances`].
    pub inst: Option<i32>,
    /// JSON object text.
    pub json: String,
    /// Parsed label positions within `json`.
    pub labels: Vec<Label>,
}

/// Label sets attached to one `(scope, ident)` at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRecord {
    /// When the labels were observed.
    pub timestamp: Timestamp,
    /// What the labels are attached to.
    pub scope: LabelScope,
    /// Identifier within the scope (domain, indom, cluster id, pmid, or zero).
    pub ident: u32,
    /// The label sets.
    pub sets: Vec<LabelSet>,
}

/// Kind of help text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TextKind {
    /// Short one-line summary.
    OneLine,
    /// Full help text.
    Help,
}

/// What a help text describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TextTarget {
    /// A metric.
    Pmid(Pmid),
    /// An instance domain.
    InDom(InDom),
}

/// Help text for a metric or an instance domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRecord {
    /// One-line or full help.
    pub kind: TextKind,
    /// What the text describes.
    pub target: TextTarget,
    /// The text itself.
    pub text: String,
}

/// A decoded metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    /// Metric descriptor.
    Desc(MetricDescriptor),
    /// Full instance domain snapshot (legacy or current encoding).
    InDom(IndomSnapshot),
    /// Delta instance domain (current encoding only).
    InDomDelta(IndomDelta),
    /// Label sets (legacy or current encoding).
    Label(LabelRecord),
    /// Help text.
    Text(TextRecord),
}

impl MetaRecord {
    /// Timestamp carried on the wire, if this kind has one.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::InDom(snapshot) => Some(snapshot.timestamp),
            Self::InDomDelta(delta) => Some(delta.timestamp),
            Self::Label(label) => Some(label.timestamp),
            Self::Desc(_) | Self::Text(_) => None,
        }
    }
}

/// Value of one instance of a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// 32-bit value stored in place.
    Insitu(u32),
    /// Typed byte block for wider values.
    Block {
        /// Value type byte.
        vtype: u8,
        /// Payload bytes.
        bytes: Vec<u8>,
    },
}

/// One instance's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceValue {
    /// Instance id (`-1` for singular metrics).
    pub inst: i32,
    /// The value.
    pub value: Value,
}

/// Values of one metric in a data record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSet {
    /// Metric identifier.
    pub pmid: Pmid,
    /// Fetch error code when the metric could not be sampled.
    pub error: Option<i32>,
    /// Values, one per instance.
    pub values: Vec<InstanceValue>,
}

impl ValueSet {
    /// Creates a value set of in-place 32-bit values.
    pub fn insitu(pmid: Pmid, values: &[(i32, u32)]) -> Self {
        Self {
            pmid,
            error: None,
            values: values
                .iter()
                .map(|&(inst, value)| InstanceValue {
                    inst,
                    value: Value::Insitu(value),
                })
                .collect(),
        }
    }
}

/// Collector session identity taken from prologue/epilogue records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    /// `pmcd.pid` value.
    pub pid: u32,
    /// `pmcd.seqnum` value.
    pub seqnum: u32,
}

/// One timestamped set of metric values; zero value sets make a mark record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    /// Sample time.
    pub timestamp: Timestamp,
    /// Per-metric values.
    pub vsets: Vec<ValueSet>,
}

impl ResultRecord {
    /// Creates a mark record signalling a discontinuity.
    pub fn mark(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            vsets: Vec::new(),
        }
    }

    /// Returns true for mark records.
    pub fn is_mark(&self) -> bool {
        self.vsets.is_empty()
    }

    /// Extracts the collector session from a 5-metric prologue/epilogue record.
    ///
    /// Only the exact shape written by the collector qualifies: five value
    /// sets, with `pmcd.pid` and `pmcd.seqnum` each holding one in-place value.
    pub fn session_id(&self) -> Option<SessionId> {
        if self.vsets.len() != 5 {
            return None;
        }
        let single = |pmid: Pmid| {
            self.vsets
                .iter()
                .find(|vset| vset.pmid == pmid)
                .and_then(|vset| match vset.values.as_slice() {
                    [InstanceValue {
                        value: Value::Insitu(v),
                        ..
                    }] => Some(*v),
                    _ => None,
                })
        };
        Some(SessionId {
            pid: single(Pmid::PMCD_PID)?,
            seqnum: single(Pmid::PMCD_SEQNUM)?,
        })
    }
}

/// Archive label, written at the start of every file of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLabel {
    /// Format version.
    pub version: ArchiveVersion,
    /// Process id of the writer.
    pub pid: u32,
    /// Time of the first data record.
    pub start: Timestamp,
    /// Volume number: data volumes are >= 0, see [`VOL_META`] and [`VOL_INDEX`].
    pub vol: i32,
    /// Host the metrics were collected from.
    pub hostname: String,
    /// Timezone of the collection host.
    pub timezone: String,
    /// Zoneinfo name (current format only).
    pub zoneinfo: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmid_components() {
        let pmid = Pmid::new(60, 3, 17);
        assert_eq!(pmid.domain(), 60);
        assert_eq!(pmid.cluster(), 3);
        assert_eq!(pmid.item(), 17);
        assert_eq!(pmid.to_string(), "60.3.17");
        assert_eq!(Pmid(pmid.cluster_id()).item(), 0);
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::new(10, 999_999_999);
        let b = Timestamp::from_secs(11);
        assert!(a < b);
        assert_eq!(Timestamp::new(1, 1_500_000_000), Timestamp::new(2, 500_000_000));
        assert_eq!(Timestamp::from_micros(5, 250).nsec, 250_000);
    }

    #[test]
    fn test_timestamp_shift_overflow() {
        let late = Timestamp::new(i64::MAX - 10, 5);
        assert_eq!(late.add_secs(86_400), Timestamp::new(i64::MAX, 5));
        assert!(late.checked_add_secs(86_400).is_none());
        assert_eq!(late.checked_add_secs(10), Some(Timestamp::new(i64::MAX, 5)));
    }

    #[test]
    fn test_short_name_uniqueness() {
        let snapshot = IndomSnapshot::new(
            InDom::new(1, 1),
            Timestamp::ZERO,
            vec![Instance::new(2, "cpu0 extra"), Instance::new(1, "cpu0")],
        );
        assert_eq!(snapshot.instances[0].id, 1);
        assert!(snapshot.check_unique().is_err());
        assert_eq!(snapshot.lookup_name("cpu0 whatever"), Some(1));
    }

    #[test]
    fn test_session_id_requires_five_metrics() {
        let mut record = ResultRecord {
            timestamp: Timestamp::from_secs(1),
            vsets: vec![
                ValueSet::insitu(Pmid::PMCD_PID, &[(-1, 4242)]),
                ValueSet::insitu(Pmid::PMCD_SEQNUM, &[(-1, 7)]),
                ValueSet::insitu(Pmid::new(2, 10, 1), &[(-1, 0)]),
                ValueSet::insitu(Pmid::new(2, 10, 2), &[(-1, 0)]),
            ],
        };
        assert_eq!(record.session_id(), None);
        record
            .vsets
            .push(ValueSet::insitu(Pmid::new(2, 10, 3), &[(-1, 0)]));
        assert_eq!(
            record.session_id(),
            Some(SessionId {
                pid: 4242,
                seqnum: 7
            })
        );
    }
}
