//! One extract run from open inputs to a finished output archive.

use crate::error::{ArchiveError, Result};
use crate::extract::config::{ExtractConfig, TimeWindow};
use crate::extract::merge::{Emitted, MergeScheduler, MergeStats};
use crate::extract::select::{Catalog, SelectionSpec, Selector};
use crate::log::{ArchiveReader, OutputWriter, ReaderOptions, WriterOptions, WriterSummary};
use crate::meta::{LabelKey, ReconciliationStore, Sighting, StoreCounts};
use crate::record::{
    ArchiveLabel, ArchiveVersion, InDom, MetaRecord, Pmid, ResultRecord, TextTarget, Timestamp,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Why the merge loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every input ran out of records.
    InputsExhausted,
    /// The configured number of records was written.
    SampleLimit,
    /// A record passed the end of the time window.
    WindowEnd,
}

/// Why no output archive was left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyOutput {
    /// None of the inputs held a data record.
    AllInputsEmpty,
    /// Inputs had records, but none survived selection and the window.
    NoQualifyingRecords,
}

/// What an extract run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Output archive base name.
    pub output: PathBuf,
    /// Output format version.
    pub version: ArchiveVersion,
    /// Why the merge stopped.
    pub stop: StopReason,
    /// Set when the output was removed for being empty.
    pub empty: Option<EmptyOutput>,
    /// Writer counters.
    pub written: WriterSummary,
    /// Merge counters.
    pub merge: MergeStats,
    /// Metadata held after reconciliation.
    pub metadata: StoreCounts,
    /// Pmids left out after metadata conflicts (tolerant mode).
    pub skipped: Vec<Pmid>,
    /// Times the window moved forward a day.
    pub window_rolls: u32,
    /// Marks not written because the output was still empty or already
    /// ended in a mark.
    pub marks_collapsed: u64,
    /// Set when corrupt input was cut short in desperate mode.
    pub degraded: bool,
}

impl ExtractSummary {
    /// Returns true if an output archive exists after the run.
    pub fn output_written(&self) -> bool {
        self.empty.is_none()
    }
}

/// A metadata record from one input, filed under its lookup timestamp.
struct RawMeta {
    source: usize,
    timestamp: Timestamp,
    record: MetaRecord,
}

/// Merges input archives into one output archive.
///
/// # Example
///
/// ```rust,no_run
/// use pmarchive::extract::{ExtractConfig, MergeSession, SelectionSpec};
///
/// let summary = MergeSession::new(
///     vec!["/var/log/pcp/a/20240101".into(), "/var/log/pcp/a/20240102".into()],
///     "/tmp/merged",
///     ExtractConfig::default(),
///     SelectionSpec::all(),
/// )
/// .run()?;
/// println!("{} records", summary.written.records);
/// # Ok::<(), pmarchive::ArchiveError>(())
/// ```
#[derive(Debug, Clone)]
pub struct MergeSession {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    config: ExtractConfig,
    selection: SelectionSpec,
}

impl MergeSession {
    /// Creates a session; nothing is opened until [`MergeSession::run`].
    pub fn new(
        inputs: Vec<PathBuf>,
        output: impl AsRef<Path>,
        config: ExtractConfig,
        selection: SelectionSpec,
    ) -> Self {
        Self {
            inputs,
            output: output.as_ref().to_path_buf(),
            config,
            selection,
        }
    }

    /// Runs the extract.
    ///
    /// Inputs are opened and all their metadata is reconciled before the
    /// output is created, so configuration and consistency errors leave no
    /// files behind. Errors during the merge delete the partial output unless
    /// desperate mode is set.
    pub fn run(self) -> Result<ExtractSummary> {
        self.config.validate()?;
        if self.inputs.is_empty() {
            return Err(ArchiveError::Config("no input archives".to_string()));
        }

        let options = ReaderOptions {
            desperate: self.config.desperate,
        };
        let mut readers = self
            .inputs
            .iter()
            .map(|path| ArchiveReader::open(path, options))
            .collect::<Result<Vec<_>>>()?;
        check_labels(&readers)?;
        let version = output_version(&readers, self.config.output_version)?;

        let (catalog, raw) = load_metadata(&mut readers)?;
        let mut selector = self.selection.resolve(&catalog)?;
        let store = reconcile(&readers, raw, &mut selector, self.config.tolerant)?;

        let label = output_label(&readers, version);
        let writer_options = WriterOptions {
            max_volume_bytes: self.config.max_volume_bytes,
            index_flush_bytes: self.config.index_flush_bytes,
        };
        let writer = OutputWriter::create(&self.output, label, writer_options)?;
        info!(
            output = %self.output.display(),
            inputs = readers.len(),
            %version,
            "extracting"
        );

        let scheduler = MergeScheduler::new(readers, selector, self.config.window.start);
        let mut run = Run {
            config: &self.config,
            scheduler,
            store,
            writer,
            window: self.config.window,
            rolls: 0,
            after_mark: true,
            marks_collapsed: 0,
        };

        let stop = match run.merge() {
            Ok(stop) => stop,
            Err(err) => {
                run.abandon(&err);
                return Err(err);
            }
        };
        run.finish(self.output, version, stop)
    }
}

fn check_labels(readers: &[ArchiveReader]) -> Result<()> {
    let Some((first, rest)) = readers.split_first() else {
        return Ok(());
    };
    for other in rest {
        if other.label().hostname != first.label().hostname {
            return Err(ArchiveError::LabelMismatch {
                field: "hostname",
                first: first.name(),
                first_value: first.label().hostname.clone(),
                other: other.name(),
                other_value: other.label().hostname.clone(),
            });
        }
        if other.label().timezone != first.label().timezone {
            warn!(
                "{}: timezone {} differs from {} in {}; using {}",
                other.name(),
                other.label().timezone,
                first.label().timezone,
                first.name(),
                first.label().timezone
            );
        }
    }
    Ok(())
}

fn output_version(
    readers: &[ArchiveReader],
    requested: Option<ArchiveVersion>,
) -> Result<ArchiveVersion> {
    let newest = readers
        .iter()
        .map(ArchiveReader::version)
        .max()
        .unwrap_or(ArchiveVersion::V3);
    match requested {
        None => Ok(newest),
        Some(ArchiveVersion::V2) if newest == ArchiveVersion::V3 => {
            Err(ArchiveError::Unsupported(
                "cannot write a version 2 archive from version 3 inputs".to_string(),
            ))
        }
        Some(version) => Ok(version),
    }
}

fn output_label(readers: &[ArchiveReader], version: ArchiveVersion) -> ArchiveLabel {
    let first = readers[0].label();
    let start = readers
        .iter()
        .map(|reader| reader.label().start)
        .min()
        .unwrap_or(first.start);
    let zoneinfo = readers
        .iter()
        .map(|reader| reader.label().zoneinfo.as_str())
        .find(|zone| !zone.is_empty())
        .unwrap_or("")
        .to_string();
    ArchiveLabel {
        version,
        pid: std::process::id(),
        start,
        vol: 0,
        hostname: first.hostname.clone(),
        timezone: first.timezone.clone(),
        zoneinfo,
    }
}

/// Reads every metadata record of every input.
fn load_metadata(readers: &mut [ArchiveReader]) -> Result<(Catalog, Vec<RawMeta>)> {
    let mut catalog = Catalog::new();
    let mut raw = Vec::new();
    for (source, reader) in readers.iter_mut().enumerate() {
        let before = raw.len();
        while let Some((timestamp, record)) = reader.next_meta()? {
            catalog.add(&record);
            raw.push(RawMeta {
                source,
                timestamp,
                record,
            });
        }
        debug!("{}: {} metadata records", reader.name(), raw.len() - before);
    }
    Ok((catalog, raw))
}

/// Feeds the metadata of selected metrics to a new store.
///
/// Descriptors go first so that instance domains, labels and help text can
/// be kept only when a surviving metric refers to them.
fn reconcile(
    readers: &[ArchiveReader],
    raw: Vec<RawMeta>,
    selector: &mut Selector,
    tolerant: bool,
) -> Result<ReconciliationStore> {
    let mut store = ReconciliationStore::new(tolerant);
    let (descs, rest): (Vec<RawMeta>, Vec<RawMeta>) = raw
        .into_iter()
        .partition(|meta| matches!(meta.record, MetaRecord::Desc(_)));

    for meta in descs {
        let MetaRecord::Desc(desc) = meta.record else {
            continue;
        };
        if !selector.wants(desc.pmid) {
            continue;
        }
        let pmid = desc.pmid;
        if store.add_desc(&readers[meta.source].name(), desc)? == Sighting::Skipped {
            selector.skip(pmid);
        }
    }

    let metrics: Vec<(Pmid, InDom)> = store
        .descriptors()
        .map(|desc| (desc.pmid, desc.indom))
        .collect();
    let indoms: HashSet<InDom> = metrics
        .iter()
        .map(|&(_, indom)| indom)
        .filter(|indom| !indom.is_null())
        .collect();

    for meta in rest {
        let archive = readers[meta.source].name();
        match meta.record {
            MetaRecord::InDom(snapshot) if indoms.contains(&snapshot.indom) => {
                store.add_indom(&archive, snapshot)?;
            }
            MetaRecord::Label(label) => {
                let key = LabelKey {
                    scope: label.scope,
                    ident: label.ident,
                };
                if metrics
                    .iter()
                    .any(|&(pmid, indom)| key.applies_to(pmid, indom))
                {
                    store.add_label(&archive, label);
                }
            }
            MetaRecord::Text(text) => {
                let keep = match text.target {
                    TextTarget::Pmid(pmid) => store.descriptor(pmid).is_some(),
                    TextTarget::InDom(indom) => indoms.contains(&indom),
                };
                if keep {
                    store.add_text(&archive, meta.timestamp, text);
                }
            }
            _ => {}
        }
    }

    let counts = store.counts();
    debug!(
        descriptors = counts.descriptors,
        indoms = counts.indoms,
        labels = counts.labels,
        texts = counts.texts,
        "metadata reconciled"
    );
    Ok(store)
}

/// State of the merge loop.
struct Run<'a> {
    config: &'a ExtractConfig,
    scheduler: MergeScheduler<ArchiveReader>,
    store: ReconciliationStore,
    writer: OutputWriter,
    window: TimeWindow,
    rolls: u32,
    /// True while the output is empty or ends in a mark.
    after_mark: bool,
    marks_collapsed: u64,
}

impl Run<'_> {
    fn limit_reached(&self) -> bool {
        self.config
            .sample_limit
            .is_some_and(|limit| self.writer.written() >= limit)
    }

    fn prepare_volume(&mut self) -> Result<()> {
        if let Some(per_volume) = self.config.records_per_volume {
            let written = self.writer.written();
            if written > 0 && written % per_volume == 0 {
                self.writer.new_volume()?;
            }
        }
        Ok(())
    }

    /// Writes a mark unless the output is empty or already ends in one.
    fn write_mark(&mut self, ts: Timestamp, force_index: bool) -> Result<()> {
        if self.after_mark {
            self.marks_collapsed += 1;
            debug!("mark at {ts} not written, no record since the last one");
            return Ok(());
        }
        self.prepare_volume()?;
        self.writer.write_mark(ts, force_index)?;
        self.after_mark = true;
        debug!("mark at {ts}");
        Ok(())
    }

    fn write_record(&mut self, record: &ResultRecord, force_index: bool) -> Result<()> {
        self.prepare_volume()?;
        let metadata = self.store.take_metadata(record)?;
        self.writer.write_record(record, metadata, force_index)?;
        self.after_mark = false;
        Ok(())
    }

    /// Moves the window forward by whole days until `ts` is not past its end,
    /// then marks the discontinuity.
    ///
    /// Returns `None` when the window cannot move that far, otherwise whether
    /// the output now ends in a mark.
    fn roll_window(&mut self, ts: Timestamp) -> Result<Option<bool>> {
        let Some(days) = self.window.roll_until(ts) else {
            warn!("window cannot roll forward to {ts}; stopping");
            return Ok(None);
        };
        self.rolls = self.rolls.saturating_add(days);
        let dropped = self.scheduler.discard_before(self.window.start);
        info!(
            "window rolled {days} day(s) to [{}, {}], {dropped} buffered records discarded",
            self.window.start.unwrap_or_default(),
            self.window.end.unwrap_or_default()
        );
        match self.writer.last_timestamp() {
            Some(last) if !self.limit_reached() => {
                self.write_mark(last, true)?;
                Ok(Some(true))
            }
            _ => Ok(Some(false)),
        }
    }

    fn merge(&mut self) -> Result<StopReason> {
        let daily_roll = self.config.effective_daily_roll();
        loop {
            if self.limit_reached() {
                return Ok(StopReason::SampleLimit);
            }
            let Some(item) = self.scheduler.next()? else {
                return Ok(StopReason::InputsExhausted);
            };
            match item {
                Emitted::Mark { timestamp, .. } => self.write_mark(timestamp, false)?,
                Emitted::Record { record, .. } => {
                    let mut force_index = false;
                    if self.window.after_end(record.timestamp) {
                        if !daily_roll {
                            return Ok(StopReason::WindowEnd);
                        }
                        let Some(marked) = self.roll_window(record.timestamp)? else {
                            return Ok(StopReason::WindowEnd);
                        };
                        force_index = !marked;
                        if self.limit_reached() {
                            return Ok(StopReason::SampleLimit);
                        }
                        if !self.window.contains(record.timestamp) {
                            continue;
                        }
                    }
                    self.write_record(&record, force_index)?;
                }
            }
        }
    }

    /// Cleans up after a failed merge.
    fn abandon(self, err: &ArchiveError) {
        if self.config.desperate {
            warn!("{err}; keeping partial output");
            if let Err(finish_err) = self.writer.finish() {
                error!("finishing partial output failed: {finish_err}");
            }
        } else if let Err(remove_err) = self.writer.discard() {
            error!("removing partial output failed: {remove_err}");
        }
    }

    fn finish(
        self,
        output: PathBuf,
        version: ArchiveVersion,
        stop: StopReason,
    ) -> Result<ExtractSummary> {
        let merge = self.scheduler.stats();
        let degraded = self.scheduler.sources().any(ArchiveReader::truncated);
        let all_empty = self.scheduler.sources().all(|r| r.data_records() == 0);
        let skipped: Vec<Pmid> = self.store.skipped().collect();
        let metadata = self.store.counts();

        let (written, empty) = if self.writer.written() == 0 {
            self.writer.discard()?;
            let empty = if all_empty {
                warn!("all input archives are empty; no output written");
                EmptyOutput::AllInputsEmpty
            } else {
                warn!("no qualifying records found; no output written");
                EmptyOutput::NoQualifyingRecords
            };
            (WriterSummary::default(), Some(empty))
        } else {
            let written = self.writer.finish()?;
            info!(
                records = written.records,
                marks = written.marks,
                volumes = written.volumes,
                ?stop,
                "extract complete"
            );
            (written, None)
        };

        Ok(ExtractSummary {
            output,
            version,
            stop,
            empty,
            written,
            merge,
            metadata,
            skipped,
            window_rolls: self.rolls,
            marks_collapsed: self.marks_collapsed,
            degraded,
        })
    }
}
