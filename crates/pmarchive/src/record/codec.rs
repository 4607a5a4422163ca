//! Byte-level encoding of archive labels, metadata records and data records.
//!
//! Everything on disk is big-endian. Decoding validates lengths as it goes and
//! produces owned records; encoding targets one [`ArchiveVersion`] and refuses
//! content that version cannot express.

use crate::error::{ArchiveError, Result};
use crate::record::{
    ArchiveLabel, ArchiveVersion, DeltaEntry, InDom, IndomDelta, IndomSnapshot, Instance,
    InstanceValue, Label, LabelRecord, LabelScope, LabelSet, MetaRecord, MetricDescriptor,
    MetricType, Pmid, ResultRecord, Semantics, TextKind, TextRecord, TextTarget, Timestamp,
    Units, Value, ValueSet, LOG_MAGIC,
};

/// Size of the legacy NUL-padded hostname field.
const LEGACY_HOST_LEN: usize = 64;
/// Size of the legacy NUL-padded timezone field.
const LEGACY_TZ_LEN: usize = 40;

const TEXT_ONELINE: u32 = 0x01;
const TEXT_HELP: u32 = 0x02;
const TEXT_PMID: u32 = 0x04;
const TEXT_INDOM: u32 = 0x08;

const VALFMT_INSITU: u32 = 0;
const VALFMT_BLOCK: u32 = 1;

/// Instance id used for label sets not bound to an instance.
const IN_NULL: i32 = -1;

/// String index marking a deleted instance in a delta record.
const STRIDX_DELETED: i32 = -1;

/// Leading tag of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RecordType {
    /// Metric descriptor.
    Desc = 1,
    /// Full instance domain with a legacy timestamp.
    InDomV2 = 2,
    /// Label sets with a legacy timestamp.
    LabelV2 = 3,
    /// Help text.
    Text = 4,
    /// Full instance domain.
    InDom = 5,
    /// Delta instance domain.
    InDomDelta = 6,
    /// Label sets.
    Label = 7,
}

impl RecordType {
    /// Maps the wire tag.
    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Desc),
            2 => Some(Self::InDomV2),
            3 => Some(Self::LabelV2),
            4 => Some(Self::Text),
            5 => Some(Self::InDom),
            6 => Some(Self::InDomDelta),
            7 => Some(Self::Label),
            _ => None,
        }
    }

    /// Returns true for tags only valid in current-format archives.
    pub fn is_current_only(self) -> bool {
        matches!(self, Self::InDom | Self::InDomDelta | Self::Label)
    }
}

/// Malformed record content.
///
/// Carries only the reason; the reader knows which archive and offset it was
/// looking at and attaches them with [`DecodeError::at`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct DecodeError {
    reason: String,
}

impl DecodeError {
    /// Creates a decode error.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason text.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Attaches location context, producing an [`ArchiveError::Format`].
    pub fn at(self, archive: impl Into<String>, offset: u64) -> ArchiveError {
        ArchiveError::Format {
            archive: archive.into(),
            offset,
            reason: self.reason,
        }
    }
}

type DecodeResult<T> = std::result::Result<T, DecodeError>;

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> DecodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                DecodeError::new(format!(
                    "record too short reading {what}: need {n} bytes at {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> DecodeResult<u8> {
        Ok(self.array::<1>(what)?[0])
    }

    fn u16(&mut self, what: &str) -> DecodeResult<u16> {
        Ok(u16::from_be_bytes(self.array(what)?))
    }

    fn u32(&mut self, what: &str) -> DecodeResult<u32> {
        Ok(u32::from_be_bytes(self.array(what)?))
    }

    fn i32(&mut self, what: &str) -> DecodeResult<i32> {
        Ok(i32::from_be_bytes(self.array(what)?))
    }

    fn i64(&mut self, what: &str) -> DecodeResult<i64> {
        Ok(i64::from_be_bytes(self.array(what)?))
    }

    fn count(&mut self, what: &str) -> DecodeResult<usize> {
        let n = self.i32(what)?;
        usize::try_from(n).map_err(|_| DecodeError::new(format!("negative {what}: {n}")))
    }

    fn timestamp(&mut self, version: ArchiveVersion) -> DecodeResult<Timestamp> {
        match version {
            ArchiveVersion::V2 => {
                let sec = self.u32("timestamp seconds")?;
                let usec = self.u32("timestamp microseconds")?;
                if usec >= 1_000_000 {
                    return Err(DecodeError::new(format!("microseconds out of range: {usec}")));
                }
                Ok(Timestamp::from_micros(i64::from(sec), usec))
            }
            ArchiveVersion::V3 => {
                let sec = self.i64("timestamp seconds")?;
                let nsec = self.u32("timestamp nanoseconds")?;
                if nsec >= 1_000_000_000 {
                    return Err(DecodeError::new(format!("nanoseconds out of range: {nsec}")));
                }
                Ok(Timestamp { sec, nsec })
            }
        }
    }

    fn string(&mut self, len: usize, what: &str) -> DecodeResult<String> {
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DecodeError::new(format!("{what} is not valid UTF-8")))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

struct Encoder {
    buf: Vec<u8>,
    version: ArchiveVersion,
}

impl Encoder {
    fn new(version: ArchiveVersion) -> Self {
        Self {
            buf: Vec::with_capacity(128),
            version,
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn count(&mut self, n: usize, what: &str) -> Result<()> {
        let n = i32::try_from(n)
            .map_err(|_| ArchiveError::Unsupported(format!("too many {what}: {n}")))?;
        self.i32(n);
        Ok(())
    }

    fn timestamp(&mut self, ts: Timestamp) -> Result<()> {
        match self.version {
            ArchiveVersion::V2 => {
                if !ts.fits_legacy() {
                    return Err(ArchiveError::Unsupported(format!(
                        "timestamp {ts} does not fit a version 2 archive"
                    )));
                }
                self.u32(ts.sec as u32);
                self.u32(ts.usec());
            }
            ArchiveVersion::V3 => {
                self.i64(ts.sec);
                self.u32(ts.nsec);
            }
        }
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Decodes an archive label body.
pub fn decode_label(body: &[u8]) -> DecodeResult<ArchiveLabel> {
    let mut dec = Decoder::new(body);
    let magic = dec.u32("label magic")?;
    if magic & 0xffff_ff00 != LOG_MAGIC {
        return Err(DecodeError::new(format!("invalid label magic {magic:#010x}")));
    }
    let version = ArchiveVersion::from_u32(magic & 0xff).ok_or_else(|| {
        DecodeError::new(format!("unsupported archive version {}", magic & 0xff))
    })?;
    let pid = dec.u32("label pid")?;
    let start = dec.timestamp(version)?;
    let vol = dec.i32("label volume")?;

    let (hostname, timezone, zoneinfo) = match version {
        ArchiveVersion::V2 => (
            padded_string(dec.take(LEGACY_HOST_LEN, "label hostname")?),
            padded_string(dec.take(LEGACY_TZ_LEN, "label timezone")?),
            String::new(),
        ),
        ArchiveVersion::V3 => {
            let mut field = |what: &str| -> DecodeResult<String> {
                let len = dec.u16(what)? as usize;
                dec.string(len, what)
            };
            (
                field("label hostname")?,
                field("label timezone")?,
                field("label zoneinfo")?,
            )
        }
    };

    Ok(ArchiveLabel {
        version,
        pid,
        start,
        vol,
        hostname,
        timezone,
        zoneinfo,
    })
}

/// Encodes an archive label in its own version.
///
/// Legacy hostnames and timezones longer than their fixed fields are truncated.
pub fn encode_label(label: &ArchiveLabel) -> Result<Vec<u8>> {
    let mut enc = Encoder::new(label.version);
    enc.u32(LOG_MAGIC | label.version.as_u32());
    enc.u32(label.pid);
    enc.timestamp(label.start)?;
    enc.i32(label.vol);
    match label.version {
        ArchiveVersion::V2 => {
            enc.bytes(&pad_string(&label.hostname, LEGACY_HOST_LEN));
            enc.bytes(&pad_string(&label.timezone, LEGACY_TZ_LEN));
        }
        ArchiveVersion::V3 => {
            for field in [&label.hostname, &label.timezone, &label.zoneinfo] {
                let len = u16::try_from(field.len()).map_err(|_| {
                    ArchiveError::Unsupported(format!("label string of {} bytes", field.len()))
                })?;
                enc.u16(len);
                enc.bytes(field.as_bytes());
            }
        }
    }
    Ok(enc.finish())
}

fn padded_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn pad_string(s: &str, width: usize) -> Vec<u8> {
    let mut cut = s.len().min(width - 1);
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = s.as_bytes()[..cut].to_vec();
    out.resize(width, 0);
    out
}

/// Decodes one metadata record read from an archive of `version`.
pub fn decode_meta(body: &[u8], version: ArchiveVersion) -> DecodeResult<MetaRecord> {
    let mut dec = Decoder::new(body);
    let tag = dec.u32("record type")?;
    let kind = RecordType::from_u32(tag)
        .ok_or_else(|| DecodeError::new(format!("unknown metadata record type {tag}")))?;
    if kind.is_current_only() && version == ArchiveVersion::V2 {
        return Err(DecodeError::new(format!(
            "record type {tag} is not valid in a version 2 archive"
        )));
    }

    match kind {
        RecordType::Desc => decode_desc(&mut dec).map(MetaRecord::Desc),
        RecordType::InDomV2 => decode_indom(&mut dec, ArchiveVersion::V2, false)
            .map(|raw| MetaRecord::InDom(raw.into_snapshot())),
        RecordType::InDom => decode_indom(&mut dec, ArchiveVersion::V3, false)
            .map(|raw| MetaRecord::InDom(raw.into_snapshot())),
        RecordType::InDomDelta => decode_indom(&mut dec, ArchiveVersion::V3, true)
            .map(|raw| MetaRecord::InDomDelta(raw.into_delta())),
        RecordType::LabelV2 => decode_labels(&mut dec, ArchiveVersion::V2).map(MetaRecord::Label),
        RecordType::Label => decode_labels(&mut dec, ArchiveVersion::V3).map(MetaRecord::Label),
        RecordType::Text => decode_text(&mut dec).map(MetaRecord::Text),
    }
}

fn decode_desc(dec: &mut Decoder<'_>) -> DecodeResult<MetricDescriptor> {
    let pmid = Pmid(dec.u32("pmid")?);
    let metric_type = MetricType::from_i32(dec.i32("type")?);
    let indom = InDom(dec.u32("indom")?);
    let semantics = Semantics::from_i32(dec.i32("semantics")?);
    let units = Units(dec.u32("units")?);
    let numnames = dec.count("name count")?;
    let mut names = Vec::with_capacity(numnames.min(64));
    for _ in 0..numnames {
        let len = dec.u32("name length")? as usize;
        names.push(dec.string(len, "metric name")?);
    }
    Ok(MetricDescriptor {
        pmid,
        metric_type,
        indom,
        semantics,
        units,
        names,
    })
}

/// Instance entries of an indom record; `None` names are delta deletions.
struct RawIndom {
    timestamp: Timestamp,
    indom: InDom,
    entries: Vec<(i32, Option<String>)>,
}

fn decode_indom(
    dec: &mut Decoder<'_>,
    ts_version: ArchiveVersion,
    delta: bool,
) -> DecodeResult<RawIndom> {
    let timestamp = dec.timestamp(ts_version)?;
    let indom = InDom(dec.u32("indom")?);
    let numinst = dec.count("instance count")?;
    let mut ids = Vec::with_capacity(numinst.min(4096));
    for _ in 0..numinst {
        ids.push(dec.i32("instance id")?);
    }
    let mut stridx = Vec::with_capacity(numinst.min(4096));
    for _ in 0..numinst {
        stridx.push(dec.i32("instance name index")?);
    }
    let strbuf = dec.rest();

    let mut entries = Vec::with_capacity(numinst);
    for (id, idx) in ids.into_iter().zip(stridx) {
        if idx == STRIDX_DELETED {
            if !delta {
                return Err(DecodeError::new(format!(
                    "instance {id} of indom {indom} has no name"
                )));
            }
            entries.push((id, None));
            continue;
        }
        let start = usize::try_from(idx)
            .ok()
            .filter(|&s| s < strbuf.len())
            .ok_or_else(|| {
                DecodeError::new(format!("instance {id} name index {idx} out of range"))
            })?;
        let len = strbuf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| DecodeError::new(format!("instance {id} name is not terminated")))?;
        let name = std::str::from_utf8(&strbuf[start..start + len])
            .map_err(|_| DecodeError::new(format!("instance {id} name is not valid UTF-8")))?;
        entries.push((id, Some(name.to_string())));
    }

    Ok(RawIndom {
        timestamp,
        indom,
        entries,
    })
}

impl RawIndom {
    fn into_snapshot(self) -> IndomSnapshot {
        let instances = self
            .entries
            .into_iter()
            .filter_map(|(id, name)| name.map(|name| Instance::new(id, name)))
            .collect();
        IndomSnapshot::new(self.indom, self.timestamp, instances)
    }

    fn into_delta(self) -> IndomDelta {
        let mut changes: Vec<DeltaEntry> = self
            .entries
            .into_iter()
            .map(|(id, name)| match name {
                Some(name) => DeltaEntry::Add(Instance::new(id, name)),
                None => DeltaEntry::Delete(id),
            })
            .collect();
        changes.sort_by_key(DeltaEntry::id);
        IndomDelta {
            indom: self.indom,
            timestamp: self.timestamp,
            changes,
        }
    }
}

fn decode_labels(dec: &mut Decoder<'_>, ts_version: ArchiveVersion) -> DecodeResult<LabelRecord> {
    let timestamp = dec.timestamp(ts_version)?;
    let raw_scope = dec.u32("label scope")?;
    let scope = LabelScope::from_u32(raw_scope)
        .ok_or_else(|| DecodeError::new(format!("unknown label scope {raw_scope:#x}")))?;
    let ident = dec.u32("label identifier")?;
    let nsets = dec.count("label set count")?;
    let mut sets = Vec::with_capacity(nsets.min(1024));
    for _ in 0..nsets {
        let inst = dec.i32("label instance")?;
        let jsonlen = dec.u32("label json length")? as usize;
        let json = dec.string(jsonlen, "label json")?;
        let nlabels = dec.count("label count")?;
        let mut labels = Vec::with_capacity(nlabels.min(256));
        for _ in 0..nlabels {
            let label = Label {
                name_off: dec.u16("label name offset")?,
                name_len: dec.u8("label name length")?,
                flags: dec.u8("label flags")?,
                value_off: dec.u16("label value offset")?,
                value_len: dec.u16("label value length")?,
            };
            let name_end = label.name_off as usize + label.name_len as usize;
            let value_end = label.value_off as usize + label.value_len as usize;
            if name_end > json.len() || value_end > json.len() {
                return Err(DecodeError::new(format!(
                    "label offsets exceed json length {}",
                    json.len()
                )));
            }
            labels.push(label);
        }
        sets.push(LabelSet {
            inst: (inst != IN_NULL).then_some(inst),
            json,
            labels,
        });
    }
    Ok(LabelRecord {
        timestamp,
        scope,
        ident,
        sets,
    })
}

fn decode_text(dec: &mut Decoder<'_>) -> DecodeResult<TextRecord> {
    let class = dec.u32("text class")?;
    let ident = dec.u32("text identifier")?;
    let kind = match class & (TEXT_ONELINE | TEXT_HELP) {
        TEXT_ONELINE => TextKind::OneLine,
        TEXT_HELP => TextKind::Help,
        _ => return Err(DecodeError::new(format!("invalid text class {class:#x}"))),
    };
    let target = match class & (TEXT_PMID | TEXT_INDOM) {
        TEXT_PMID => TextTarget::Pmid(Pmid(ident)),
        TEXT_INDOM => TextTarget::InDom(InDom(ident)),
        _ => return Err(DecodeError::new(format!("invalid text class {class:#x}"))),
    };
    let raw = dec.rest();
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| DecodeError::new("help text is not terminated"))?;
    let text = String::from_utf8(raw[..end].to_vec())
        .map_err(|_| DecodeError::new("help text is not valid UTF-8"))?;
    Ok(TextRecord { kind, target, text })
}

/// Encodes one metadata record for an output archive of `version`.
///
/// Full indoms and labels use the tag native to `version`. Delta indoms and
/// out-of-range timestamps cannot be written to a legacy archive.
pub fn encode_meta(record: &MetaRecord, version: ArchiveVersion) -> Result<Vec<u8>> {
    let mut enc = Encoder::new(version);
    match record {
        MetaRecord::Desc(desc) => {
            enc.u32(RecordType::Desc as u32);
            enc.u32(desc.pmid.0);
            enc.i32(desc.metric_type.as_i32());
            enc.u32(desc.indom.0);
            enc.i32(desc.semantics.as_i32());
            enc.u32(desc.units.0);
            enc.count(desc.names.len(), "metric names")?;
            for name in &desc.names {
                enc.u32(name.len() as u32);
                enc.bytes(name.as_bytes());
            }
        }
        MetaRecord::InDom(snapshot) => {
            let tag = match version {
                ArchiveVersion::V2 => RecordType::InDomV2,
                ArchiveVersion::V3 => RecordType::InDom,
            };
            enc.u32(tag as u32);
            enc.timestamp(snapshot.timestamp)?;
            enc.u32(snapshot.indom.0);
            let entries: Vec<(i32, Option<&str>)> = snapshot
                .instances
                .iter()
                .map(|inst| (inst.id, Some(inst.name.as_str())))
                .collect();
            encode_indom_entries(&mut enc, &entries)?;
        }
        MetaRecord::InDomDelta(delta) => {
            if version == ArchiveVersion::V2 {
                return Err(ArchiveError::Unsupported(format!(
                    "delta instance domain {} cannot be written to a version 2 archive",
                    delta.indom
                )));
            }
            enc.u32(RecordType::InDomDelta as u32);
            enc.timestamp(delta.timestamp)?;
            enc.u32(delta.indom.0);
            let entries: Vec<(i32, Option<&str>)> = delta
                .changes
                .iter()
                .map(|change| match change {
                    DeltaEntry::Add(inst) => (inst.id, Some(inst.name.as_str())),
                    DeltaEntry::Delete(id) => (*id, None),
                })
                .collect();
            encode_indom_entries(&mut enc, &entries)?;
        }
        MetaRecord::Label(label) => {
            let tag = match version {
                ArchiveVersion::V2 => RecordType::LabelV2,
                ArchiveVersion::V3 => RecordType::Label,
            };
            enc.u32(tag as u32);
            enc.timestamp(label.timestamp)?;
            enc.u32(label.scope.as_u32());
            enc.u32(label.ident);
            enc.count(label.sets.len(), "label sets")?;
            for set in &label.sets {
                enc.i32(set.inst.unwrap_or(IN_NULL));
                enc.u32(set.json.len() as u32);
                enc.bytes(set.json.as_bytes());
                enc.count(set.labels.len(), "labels")?;
                for l in &set.labels {
                    enc.u16(l.name_off);
                    enc.u8(l.name_len);
                    enc.u8(l.flags);
                    enc.u16(l.value_off);
                    enc.u16(l.value_len);
                }
            }
        }
        MetaRecord::Text(text) => {
            let (target, ident) = match text.target {
                TextTarget::Pmid(pmid) => (TEXT_PMID, pmid.0),
                TextTarget::InDom(indom) => (TEXT_INDOM, indom.0),
            };
            let kind = match text.kind {
                TextKind::OneLine => TEXT_ONELINE,
                TextKind::Help => TEXT_HELP,
            };
            enc.u32(RecordType::Text as u32);
            enc.u32(kind | target);
            enc.u32(ident);
            enc.bytes(text.text.as_bytes());
            enc.u8(0);
        }
    }
    Ok(enc.finish())
}

fn encode_indom_entries(enc: &mut Encoder, entries: &[(i32, Option<&str>)]) -> Result<()> {
    enc.count(entries.len(), "instances")?;
    for (id, _) in entries {
        enc.i32(*id);
    }
    let mut strbuf = Vec::new();
    for (_, name) in entries {
        match name {
            Some(name) => {
                let idx = i32::try_from(strbuf.len()).map_err(|_| {
                    ArchiveError::Unsupported("instance names exceed 2GiB".to_string())
                })?;
                enc.i32(idx);
                strbuf.extend_from_slice(name.as_bytes());
                strbuf.push(0);
            }
            None => enc.i32(STRIDX_DELETED),
        }
    }
    enc.bytes(&strbuf);
    Ok(())
}

/// Decodes a data record read from an archive of `version`.
pub fn decode_result(body: &[u8], version: ArchiveVersion) -> DecodeResult<ResultRecord> {
    let mut dec = Decoder::new(body);
    let timestamp = dec.timestamp(version)?;
    let numpmid = dec.u32("pmid count")? as usize;
    let mut vsets = Vec::with_capacity(numpmid.min(1024));
    for _ in 0..numpmid {
        let pmid = Pmid(dec.u32("pmid")?);
        let numval = dec.i32("value count")?;
        if numval <= 0 {
            vsets.push(ValueSet {
                pmid,
                error: (numval < 0).then_some(numval),
                values: Vec::new(),
            });
            continue;
        }
        let valfmt = dec.u32("value format")?;
        let mut values = Vec::with_capacity((numval as usize).min(4096));
        for _ in 0..numval {
            let inst = dec.i32("instance")?;
            let value = match valfmt {
                VALFMT_INSITU => Value::Insitu(dec.u32("value")?),
                VALFMT_BLOCK => {
                    let header = dec.u32("value block header")?;
                    let vtype = (header >> 24) as u8;
                    let vlen = (header & 0x00ff_ffff) as usize;
                    if vlen < 4 {
                        return Err(DecodeError::new(format!(
                            "value block length {vlen} for pmid {pmid}"
                        )));
                    }
                    let bytes = dec.take(vlen - 4, "value block")?.to_vec();
                    dec.take(block_padding(vlen), "value block padding")?;
                    Value::Block { vtype, bytes }
                }
                other => {
                    return Err(DecodeError::new(format!(
                        "unknown value format {other} for pmid {pmid}"
                    )))
                }
            };
            values.push(InstanceValue { inst, value });
        }
        vsets.push(ValueSet {
            pmid,
            error: None,
            values,
        });
    }
    Ok(ResultRecord { timestamp, vsets })
}

/// Encodes a data record for an output archive of `version`.
///
/// A value block's length field counts its 4-byte header, and the block is
/// padded to a 4-byte boundary.
pub fn encode_result(record: &ResultRecord, version: ArchiveVersion) -> Result<Vec<u8>> {
    let mut enc = Encoder::new(version);
    enc.timestamp(record.timestamp)?;
    enc.u32(record.vsets.len() as u32);
    for vset in &record.vsets {
        enc.u32(vset.pmid.0);
        if let Some(code) = vset.error {
            enc.i32(code);
            continue;
        }
        enc.count(vset.values.len(), "values")?;
        let Some(first) = vset.values.first() else {
            continue;
        };
        let valfmt = match first.value {
            Value::Insitu(_) => VALFMT_INSITU,
            Value::Block { .. } => VALFMT_BLOCK,
        };
        enc.u32(valfmt);
        for iv in &vset.values {
            enc.i32(iv.inst);
            match (&iv.value, valfmt) {
                (Value::Insitu(v), VALFMT_INSITU) => enc.u32(*v),
                (Value::Block { vtype, bytes }, VALFMT_BLOCK) => {
                    let vlen = bytes.len() + 4;
                    if vlen > 0x00ff_ffff {
                        return Err(ArchiveError::Unsupported(format!(
                            "value block of {} bytes for pmid {}",
                            bytes.len(),
                            vset.pmid
                        )));
                    }
                    enc.u32((u32::from(*vtype) << 24) | vlen as u32);
                    enc.bytes(bytes);
                    enc.bytes(&[0u8; 3][..block_padding(vlen)]);
                }
                _ => {
                    return Err(ArchiveError::Unsupported(format!(
                        "mixed value formats for pmid {}",
                        vset.pmid
                    )))
                }
            }
        }
    }
    Ok(enc.finish())
}

fn block_padding(vlen: usize) -> usize {
    (4 - vlen % 4) % 4
}
