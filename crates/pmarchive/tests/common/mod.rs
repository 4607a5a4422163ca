//! Builders for small input archives used by the integration tests.

#![allow(dead_code)]

use pmarchive::log::{OutputWriter, WriterOptions};
use pmarchive::record::{
    ArchiveLabel, ArchiveVersion, InDom, IndomSnapshot, Instance, MetaRecord, MetricDescriptor,
    MetricType, Pmid, ResultRecord, Semantics, Timestamp, Units, ValueSet,
};
use std::path::Path;

/// Per-CPU user time, one value per CPU instance.
pub const CPU_USER: Pmid = Pmid::new(60, 0, 0);
/// Load average, singular.
pub const LOAD: Pmid = Pmid::new(60, 2, 0);
/// CPU instance domain.
pub const CPU_INDOM: InDom = InDom::new(60, 0);

const PMCD_NUMAGENTS: Pmid = Pmid::new(2, 0, 3);
const PMCD_NUMCLIENTS: Pmid = Pmid::new(2, 0, 4);
const PMCD_TIMEZONE: Pmid = Pmid::new(2, 0, 5);

pub fn label(host: &str, version: ArchiveVersion) -> ArchiveLabel {
    ArchiveLabel {
        version,
        pid: 4242,
        start: Timestamp::ZERO,
        vol: 0,
        hostname: host.to_string(),
        timezone: "UTC".to_string(),
        zoneinfo: if version == ArchiveVersion::V3 {
            ":Etc/UTC".to_string()
        } else {
            String::new()
        },
    }
}

pub fn desc(pmid: Pmid, name: &str, metric_type: MetricType, indom: InDom) -> MetricDescriptor {
    MetricDescriptor {
        pmid,
        metric_type,
        indom,
        semantics: if indom.is_null() {
            Semantics::Instant
        } else {
            Semantics::Counter
        },
        units: Units(0),
        names: vec![name.to_string()],
    }
}

pub fn cpu_desc() -> MetricDescriptor {
    desc(CPU_USER, "kernel.percpu.cpu.user", MetricType::U64, CPU_INDOM)
}

pub fn load_desc() -> MetricDescriptor {
    desc(LOAD, "kernel.all.load", MetricType::Float, InDom::NULL)
}

fn pmcd_descs() -> Vec<MetaRecord> {
    [
        (Pmid::PMCD_PID, "pmcd.pid"),
        (Pmid::PMCD_SEQNUM, "pmcd.seqnum"),
        (PMCD_NUMAGENTS, "pmcd.numagents"),
        (PMCD_NUMCLIENTS, "pmcd.numclients"),
        (PMCD_TIMEZONE, "pmcd.timezone"),
    ]
    .into_iter()
    .map(|(pmid, name)| MetaRecord::Desc(desc(pmid, name, MetricType::U32, InDom::NULL)))
    .collect()
}

pub fn cpus(ids: &[i32]) -> IndomSnapshot {
    IndomSnapshot::new(
        CPU_INDOM,
        Timestamp::ZERO,
        ids.iter().map(|&id| Instance::new(id, format!("cpu{id}"))).collect(),
    )
}

/// The five-metric record a collector writes when it starts or stops.
pub fn prologue(ts: i64, pid: u32, seqnum: u32) -> ResultRecord {
    ResultRecord {
        timestamp: Timestamp::from_secs(ts),
        vsets: vec![
            ValueSet::insitu(Pmid::PMCD_PID, &[(-1, pid)]),
            ValueSet::insitu(Pmid::PMCD_SEQNUM, &[(-1, seqnum)]),
            ValueSet::insitu(PMCD_NUMAGENTS, &[(-1, 10)]),
            ValueSet::insitu(PMCD_NUMCLIENTS, &[(-1, 1)]),
            ValueSet::insitu(PMCD_TIMEZONE, &[(-1, 0)]),
        ],
    }
}

/// A sample with one value per listed CPU and a load average.
pub fn sample(ts: i64, cpus: &[i32]) -> ResultRecord {
    let values: Vec<(i32, u32)> = cpus.iter().map(|&id| (id, ts as u32 + id as u32)).collect();
    ResultRecord {
        timestamp: Timestamp::from_secs(ts),
        vsets: vec![
            ValueSet::insitu(CPU_USER, &values),
            ValueSet::insitu(LOAD, &[(-1, ts as u32)]),
        ],
    }
}

/// Writes an archive of the given records, each with its own metadata.
pub fn write_archive(
    base: &Path,
    label: ArchiveLabel,
    records: Vec<(ResultRecord, Vec<MetaRecord>)>,
) {
    let mut writer = OutputWriter::create(base, label, WriterOptions::default()).unwrap();
    for (record, metadata) in records {
        writer.write_record(&record, metadata, false).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes one collector session: prologue, samples at `times`, epilogue.
pub fn write_session(
    base: &Path,
    host: &str,
    version: ArchiveVersion,
    (pid, seqnum): (u32, u32),
    times: &[i64],
) {
    let first = times[0];
    let last = times[times.len() - 1];
    let mut records = vec![(prologue(first - 1, pid, seqnum), pmcd_descs())];
    for (i, &ts) in times.iter().enumerate() {
        let metadata = if i == 0 {
            vec![
                MetaRecord::Desc(cpu_desc()),
                MetaRecord::Desc(load_desc()),
                MetaRecord::InDom(cpus(&[0, 1])),
            ]
        } else {
            Vec::new()
        };
        records.push((sample(ts, &[0, 1]), metadata));
    }
    records.push((prologue(last + 1, pid, seqnum), Vec::new()));
    write_archive(base, label(host, version), records);
}

/// Writes samples without prologue or epilogue.
pub fn write_samples(base: &Path, host: &str, version: ArchiveVersion, times: &[i64]) {
    let records = times
        .iter()
        .enumerate()
        .map(|(i, &ts)| {
            let metadata = if i == 0 {
                vec![
                    MetaRecord::Desc(cpu_desc()),
                    MetaRecord::Desc(load_desc()),
                    MetaRecord::InDom(cpus(&[0, 1])),
                ]
            } else {
                Vec::new()
            };
            (sample(ts, &[0, 1]), metadata)
        })
        .collect();
    write_archive(base, label(host, version), records);
}
