//! End-to-end extract runs over archives written to a temporary directory.

mod common;

use common::*;
use pmarchive::extract::{
    EmptyOutput, ExtractConfig, InstanceRef, MergeSession, MetricRef, MetricSelection,
    SelectionSpec, StopReason, TimeWindow,
};
use pmarchive::log::{meta_path, volume_path, ArchiveReader, ReaderOptions, TemporalIndex};
use pmarchive::meta::apply;
use pmarchive::record::{
    decode_label, decode_meta, read_record, ArchiveVersion, InDom, MetaRecord, MetricType, Pmid,
    ResultRecord, Timestamp,
};
use pmarchive::ArchiveError;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn run(
    inputs: &[&Path],
    output: &Path,
    config: ExtractConfig,
    selection: SelectionSpec,
) -> pmarchive::Result<pmarchive::ExtractSummary> {
    let inputs: Vec<PathBuf> = inputs.iter().map(|p| p.to_path_buf()).collect();
    MergeSession::new(inputs, output, config, selection).run()
}

fn read_data(base: &Path) -> Vec<ResultRecord> {
    let mut reader = ArchiveReader::open(base, ReaderOptions::default()).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.next_data().unwrap() {
        records.push(record);
    }
    records
}

fn read_meta(base: &Path) -> Vec<MetaRecord> {
    let mut reader = ArchiveReader::open(base, ReaderOptions::default()).unwrap();
    let mut records = Vec::new();
    while let Some((_, record)) = reader.next_meta().unwrap() {
        records.push(record);
    }
    records
}

/// Metadata records exactly as stored, deltas left encoded.
fn read_raw_meta(base: &Path) -> Vec<MetaRecord> {
    let mut file = BufReader::new(File::open(meta_path(base)).unwrap());
    let label = decode_label(&read_record(&mut file).unwrap().unwrap()).unwrap();
    let mut records = Vec::new();
    while let Some(body) = read_record(&mut file).unwrap() {
        records.push(decode_meta(&body, label.version).unwrap());
    }
    records
}

fn times(records: &[ResultRecord]) -> Vec<i64> {
    records.iter().map(|r| r.timestamp.sec).collect()
}

fn described(meta: &[MetaRecord]) -> Vec<Pmid> {
    meta.iter()
        .filter_map(|record| match record {
            MetaRecord::Desc(desc) => Some(desc.pmid),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Merging
// ============================================================================

#[test]
fn test_continuing_session_merges_without_mark() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    // Same collector pid and seqnum: b continues the session a ended.
    write_session(&a, "node1", ArchiveVersion::V3, (900, 3), &[10, 11, 12]);
    write_session(&b, "node1", ArchiveVersion::V3, (900, 3), &[20, 21, 22]);

    let summary = run(&[&b, &a], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();

    assert_eq!(summary.stop, StopReason::InputsExhausted);
    assert_eq!(summary.written.records, 10);
    assert_eq!(summary.written.marks, 0);
    assert_eq!(summary.merge.marks_suppressed, 1);
    assert_eq!(summary.merge.marks_dropped, 1);

    let records = read_data(&out);
    assert_eq!(times(&records), vec![9, 10, 11, 12, 13, 19, 20, 21, 22, 23]);
    assert!(records.iter().all(|r| !r.is_mark()));

    let meta = read_meta(&out);
    let mut pmids = described(&meta);
    let total = pmids.len();
    pmids.sort();
    pmids.dedup();
    assert_eq!(total, 7, "each descriptor written once");
    assert_eq!(pmids.len(), 7);
    assert_eq!(summary.written.indoms_full, 1);
}

#[test]
fn test_new_session_gets_mark() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_session(&a, "node1", ArchiveVersion::V3, (900, 3), &[10, 11]);
    write_session(&b, "node1", ArchiveVersion::V3, (901, 4), &[20, 21]);

    let summary = run(&[&a, &b], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();
    assert_eq!(summary.written.marks, 1);

    let records = read_data(&out);
    let mark = records.iter().position(ResultRecord::is_mark).unwrap();
    assert_eq!(records[mark].timestamp, Timestamp::from_secs(12));
    assert_eq!(records[mark + 1].timestamp, Timestamp::from_secs(19));
}

#[test]
fn test_overlapping_inputs_interleave() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 3, 5, 7]);
    write_samples(&b, "node1", ArchiveVersion::V3, &[2, 3, 6]);

    run(&[&a, &b], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();

    let records = read_data(&out);
    let data: Vec<i64> = records
        .iter()
        .filter(|r| !r.is_mark())
        .map(|r| r.timestamp.sec)
        .collect();
    assert_eq!(data, vec![1, 2, 3, 3, 5, 6, 7]);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn test_output_label() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[40, 41]);

    run(&[&a], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();

    let reader = ArchiveReader::open(&out, ReaderOptions::default()).unwrap();
    assert_eq!(reader.label().hostname, "node1");
    assert_eq!(reader.label().timezone, "UTC");
    assert_eq!(reader.label().pid, std::process::id());
    assert_eq!(reader.label().start, Timestamp::from_secs(40));
}

// ============================================================================
// Metadata conflicts
// ============================================================================

fn write_retyped(base: &Path) {
    write_archive(
        base,
        label("node1", ArchiveVersion::V3),
        vec![
            (
                sample(20, &[0, 1]),
                vec![
                    MetaRecord::Desc(cpu_desc()),
                    MetaRecord::Desc(desc(
                        LOAD,
                        "kernel.all.load",
                        MetricType::Double,
                        InDom::NULL,
                    )),
                    MetaRecord::InDom(cpus(&[0, 1])),
                ],
            ),
            (sample(21, &[0, 1]), Vec::new()),
        ],
    );
}

#[test]
fn test_type_conflict_aborts() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[10, 11]);
    write_retyped(&b);

    let err = run(&[&a, &b], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap_err();
    match err {
        ArchiveError::MetricMismatch { pmid, field, .. } => {
            assert_eq!(pmid, LOAD);
            assert_eq!(field, "type");
        }
        other => panic!("expected a metric mismatch, got {other}"),
    }
    assert!(err_is_clean(&out));
}

fn err_is_clean(out: &Path) -> bool {
    !meta_path(out).exists() && !volume_path(out, 0).exists()
}

#[test]
fn test_type_conflict_tolerant_skips_metric() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[10, 11]);
    write_retyped(&b);

    let config = ExtractConfig {
        tolerant: true,
        ..ExtractConfig::default()
    };
    let summary = run(&[&a, &b], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.skipped, vec![LOAD]);
    assert_eq!(summary.written.records, 4);

    for record in read_data(&out) {
        assert!(record.vsets.iter().all(|vset| vset.pmid != LOAD));
    }
    assert_eq!(described(&read_meta(&out)), vec![CPU_USER]);
}

#[test]
fn test_hostname_mismatch() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1]);
    write_samples(&b, "node2", ArchiveVersion::V3, &[2]);

    let err = run(&[&a, &b], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap_err();
    assert!(matches!(err, ArchiveError::LabelMismatch { field: "hostname", .. }));
    assert!(err_is_clean(&out));
}

// ============================================================================
// Instance domains
// ============================================================================

#[test]
fn test_indom_change_written_as_delta() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    let before: Vec<i32> = (0..7).collect();
    let after: Vec<i32> = (1..9).collect();
    write_archive(
        &a,
        label("node1", ArchiveVersion::V3),
        vec![
            (
                sample(10, &before),
                vec![
                    MetaRecord::Desc(cpu_desc()),
                    MetaRecord::Desc(load_desc()),
                    MetaRecord::InDom(cpus(&before)),
                ],
            ),
            (sample(20, &after), vec![MetaRecord::InDom(cpus(&after))]),
        ],
    );

    let summary = run(&[&a], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();
    assert_eq!(summary.written.indoms_full, 1);
    assert_eq!(summary.written.indoms_delta, 1);

    let raw = read_raw_meta(&out);
    let prior = raw
        .iter()
        .find_map(|record| match record {
            MetaRecord::InDom(snapshot) => Some(snapshot.clone()),
            _ => None,
        })
        .unwrap();
    let delta = raw
        .iter()
        .find_map(|record| match record {
            MetaRecord::InDomDelta(delta) => Some(delta.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(delta.changes.len(), 3);
    assert_eq!(delta.timestamp, Timestamp::from_secs(20));

    let rebuilt = apply(&prior, &delta).unwrap();
    let ids: Vec<i32> = rebuilt.instances.iter().map(|inst| inst.id).collect();
    assert_eq!(ids, after);
    assert_eq!(rebuilt.instances[0].name, "cpu1");
}

#[test]
fn test_legacy_output_never_uses_delta() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    let before: Vec<i32> = (0..7).collect();
    let after: Vec<i32> = (1..9).collect();
    write_archive(
        &a,
        label("node1", ArchiveVersion::V2),
        vec![
            (
                sample(10, &before),
                vec![
                    MetaRecord::Desc(cpu_desc()),
                    MetaRecord::Desc(load_desc()),
                    MetaRecord::InDom(cpus(&before)),
                ],
            ),
            (sample(20, &after), vec![MetaRecord::InDom(cpus(&after))]),
        ],
    );

    let summary = run(&[&a], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();
    assert_eq!(summary.version, ArchiveVersion::V2);
    assert_eq!(summary.written.indoms_full, 2);
    assert_eq!(summary.written.indoms_delta, 0);
    assert!(read_raw_meta(&out)
        .iter()
        .all(|record| !matches!(record, MetaRecord::InDomDelta(_))));
}

#[test]
fn test_downgrade_refused() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2]);

    let config = ExtractConfig {
        output_version: Some(ArchiveVersion::V2),
        ..ExtractConfig::default()
    };
    let err = run(&[&a], &out, config, SelectionSpec::all()).unwrap_err();
    assert!(matches!(err, ArchiveError::Unsupported(_)));
}

/// Samples at exact times, with full metadata on the first one.
fn write_timed(base: &Path, version: ArchiveVersion, stamps: &[Timestamp]) {
    let records = stamps
        .iter()
        .enumerate()
        .map(|(i, &ts)| {
            let mut record = sample(ts.sec, &[0, 1]);
            record.timestamp = ts;
            let metadata = if i == 0 {
                vec![
                    MetaRecord::Desc(cpu_desc()),
                    MetaRecord::Desc(load_desc()),
                    MetaRecord::InDom(cpus(&[0, 1])),
                ]
            } else {
                Vec::new()
            };
            (record, metadata)
        })
        .collect();
    write_archive(base, label("node1", version), records);
}

#[test]
fn test_legacy_inputs_written_as_current() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    let stamps = [Timestamp::from_micros(1, 250), Timestamp::from_micros(2, 999_999)];
    write_timed(&a, ArchiveVersion::V2, &stamps);

    let config = ExtractConfig {
        output_version: Some(ArchiveVersion::V3),
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.version, ArchiveVersion::V3);

    let reader = ArchiveReader::open(&out, ReaderOptions::default()).unwrap();
    assert_eq!(reader.version(), ArchiveVersion::V3);
    assert_eq!(reader.label().start, stamps[0]);
    let got: Vec<Timestamp> = read_data(&out).iter().map(|r| r.timestamp).collect();
    assert_eq!(got, stamps);
}

#[test]
fn test_mixed_versions_merge_to_current() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_timed(
        &a,
        ArchiveVersion::V2,
        &[Timestamp::from_micros(1, 500_000), Timestamp::from_micros(3, 7)],
    );
    write_timed(
        &b,
        ArchiveVersion::V3,
        &[Timestamp::new(2, 123_456_789), Timestamp::from_secs(4)],
    );

    let summary = run(&[&a, &b], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();
    assert_eq!(summary.version, ArchiveVersion::V3);

    let reader = ArchiveReader::open(&out, ReaderOptions::default()).unwrap();
    assert_eq!(reader.version(), ArchiveVersion::V3);
    assert_eq!(reader.label().zoneinfo, ":Etc/UTC");

    let records = read_data(&out);
    let got: Vec<(Timestamp, bool)> = records
        .iter()
        .map(|r| (r.timestamp, r.is_mark()))
        .collect();
    assert_eq!(
        got,
        vec![
            (Timestamp::new(1, 500_000_000), false),
            // Nanoseconds from the current-format input survive.
            (Timestamp::new(2, 123_456_789), false),
            (Timestamp::new(3, 7_000), false),
            (Timestamp::new(3, 7_000), true),
            (Timestamp::from_secs(4), false),
        ]
    );
}

// ============================================================================
// Volumes and index
// ============================================================================

#[test]
fn test_records_per_volume() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2, 3, 4, 5, 6, 7]);

    let config = ExtractConfig {
        records_per_volume: Some(3),
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.written.volumes, 3);
    for vol in 0..3 {
        assert!(volume_path(&out, vol).exists());
    }

    // Reading checks each volume's label against its number.
    assert_eq!(times(&read_data(&out)), vec![1, 2, 3, 4, 5, 6, 7]);

    let index = TemporalIndex::read(pmarchive::log::index_path(&out)).unwrap();
    let vols: Vec<i32> = index.entries.iter().map(|entry| entry.vol).collect();
    assert_eq!(vols, vec![0, 1, 2]);
    let stamps: Vec<i64> = index.entries.iter().map(|entry| entry.timestamp.sec).collect();
    assert_eq!(stamps, vec![1, 4, 7]);
}

// ============================================================================
// Window, limits and selection
// ============================================================================

#[test]
fn test_time_window() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    let all: Vec<i64> = (10..=20).collect();
    write_samples(&a, "node1", ArchiveVersion::V3, &all);

    let config = ExtractConfig {
        window: TimeWindow::new(Some(Timestamp::from_secs(15)), Some(Timestamp::from_secs(17))),
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.stop, StopReason::WindowEnd);
    assert_eq!(summary.merge.before_window, 5);

    assert_eq!(times(&read_data(&out)), vec![15, 16, 17]);
    let reader = ArchiveReader::open(&out, ReaderOptions::default()).unwrap();
    assert_eq!(reader.label().start, Timestamp::from_secs(15));
}

#[test]
fn test_daily_roll() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[10, 11, 12, 13, 86_410, 86_411]);

    let config = ExtractConfig {
        window: TimeWindow::new(Some(Timestamp::from_secs(10)), Some(Timestamp::from_secs(12))),
        daily_roll: true,
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.window_rolls, 1);
    assert_eq!(summary.stop, StopReason::InputsExhausted);

    let records = read_data(&out);
    assert_eq!(times(&records), vec![10, 11, 12, 12, 86_410, 86_411]);
    assert!(records[3].is_mark());
}

#[test]
fn test_daily_roll_keeps_time_order_across_inputs() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[10, 86_405]);
    write_samples(&b, "node1", ArchiveVersion::V3, &[11, 13, 86_411]);

    let config = ExtractConfig {
        window: TimeWindow::new(Some(Timestamp::from_secs(10)), Some(Timestamp::from_secs(12))),
        daily_roll: true,
        ..ExtractConfig::default()
    };
    let summary = run(&[&a, &b], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.window_rolls, 1);
    assert_eq!(summary.marks_collapsed, 1);

    let records = read_data(&out);
    let got: Vec<(i64, bool)> = records
        .iter()
        .map(|r| (r.timestamp.sec, r.is_mark()))
        .collect();
    assert_eq!(got, vec![(10, false), (11, false), (11, true), (86_411, false)]);
    assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn test_daily_roll_never_starts_with_mark() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    let out = dir.path().join("out");
    // a's only record falls between the first window and the rolled one.
    write_samples(&a, "node1", ArchiveVersion::V3, &[50_000]);
    write_samples(&b, "node1", ArchiveVersion::V3, &[86_405]);

    let config = ExtractConfig {
        window: TimeWindow::new(Some(Timestamp::from_secs(0)), Some(Timestamp::from_secs(10))),
        daily_roll: true,
        ..ExtractConfig::default()
    };
    let summary = run(&[&a, &b], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.window_rolls, 1);
    assert_eq!(summary.marks_collapsed, 1);
    assert_eq!(summary.written.marks, 0);

    let records = read_data(&out);
    assert_eq!(times(&records), vec![86_405]);
    assert!(!records[0].is_mark());
}

#[test]
fn test_sample_limit() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2, 3, 4, 5, 6]);

    let config = ExtractConfig {
        sample_limit: Some(4),
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.stop, StopReason::SampleLimit);
    assert_eq!(summary.written.records, 4);
    assert_eq!(times(&read_data(&out)), vec![1, 2, 3, 4]);
}

#[test]
fn test_instance_selection() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2]);

    let selection = SelectionSpec {
        wanted: vec![MetricSelection::with_instances(
            MetricRef::Name("kernel.percpu.cpu.user".to_string()),
            vec![InstanceRef::Name("cpu1".to_string())],
        )],
        skip: Vec::new(),
    };
    run(&[&a], &out, ExtractConfig::default(), selection).unwrap();

    for record in read_data(&out) {
        assert_eq!(record.vsets.len(), 1);
        assert_eq!(record.vsets[0].pmid, CPU_USER);
        let insts: Vec<i32> = record.vsets[0].values.iter().map(|v| v.inst).collect();
        assert_eq!(insts, vec![1]);
    }
    assert_eq!(described(&read_meta(&out)), vec![CPU_USER]);
}

#[test]
fn test_skip_by_subtree() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2]);

    let selection = SelectionSpec {
        wanted: Vec::new(),
        skip: vec![MetricRef::Name("kernel.percpu".to_string())],
    };
    run(&[&a], &out, ExtractConfig::default(), selection).unwrap();

    assert_eq!(described(&read_meta(&out)), vec![LOAD]);
    assert!(read_meta(&out)
        .iter()
        .all(|record| !matches!(record, MetaRecord::InDom(_))));
}

#[test]
fn test_unknown_metric_rejected() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1]);

    let selection = SelectionSpec {
        wanted: vec![MetricSelection::metric(MetricRef::Name("no.such.metric".to_string()))],
        skip: Vec::new(),
    };
    let err = run(&[&a], &out, ExtractConfig::default(), selection).unwrap_err();
    assert!(matches!(err, ArchiveError::Config(_)));
    assert!(err_is_clean(&out));
}

// ============================================================================
// Empty output and damaged input
// ============================================================================

#[test]
fn test_no_qualifying_records() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2, 3]);

    let config = ExtractConfig {
        window: TimeWindow::new(Some(Timestamp::from_secs(100)), None),
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert_eq!(summary.empty, Some(EmptyOutput::NoQualifyingRecords));
    assert!(!summary.output_written());
    assert!(err_is_clean(&out));
}

#[test]
fn test_all_inputs_empty() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_archive(&a, label("node1", ArchiveVersion::V3), Vec::new());

    let summary = run(&[&a], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap();
    assert_eq!(summary.empty, Some(EmptyOutput::AllInputsEmpty));
    assert!(err_is_clean(&out));
}

fn damage(base: &Path) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(volume_path(base, 0))
        .unwrap();
    // Length word promising more bytes than follow.
    file.write_all(&[0, 0, 0, 64, 1, 2, 3]).unwrap();
}

#[test]
fn test_corrupt_input_aborts() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2, 3]);
    damage(&a);

    let err = run(&[&a], &out, ExtractConfig::default(), SelectionSpec::all()).unwrap_err();
    assert!(matches!(err, ArchiveError::CorruptRecord { .. }));
    assert!(err_is_clean(&out));
}

#[test]
fn test_corrupt_input_desperate() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    let out = dir.path().join("out");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2, 3]);
    damage(&a);

    let config = ExtractConfig {
        desperate: true,
        ..ExtractConfig::default()
    };
    let summary = run(&[&a], &out, config, SelectionSpec::all()).unwrap();
    assert!(summary.degraded);
    assert_eq!(times(&read_data(&out)), vec![1, 2, 3]);
}

#[test]
fn test_existing_output_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a");
    write_samples(&a, "node1", ArchiveVersion::V3, &[1, 2]);

    let err = run(&[&a], &a, ExtractConfig::default(), SelectionSpec::all()).unwrap_err();
    assert!(matches!(err, ArchiveError::File { .. } | ArchiveError::Io(_)));
    assert_eq!(times(&read_data(&a)), vec![1, 2]);
}
