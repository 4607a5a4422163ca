//! Output archive writer.
//!
//! Owns the three output streams. Each data record goes out after the
//! metadata it depends on; volume rollover and temporal index entries are
//! decided here, record by record.

use crate::error::{ArchiveError, Result};
use crate::log::index::{IndexEntry, IndexWriter};
use crate::log::{index_path, meta_path, remove_archive, volume_path};
use crate::meta::indom::{diff, IndomEncoding};
use crate::record::{
    encode_label, encode_meta, encode_result, write_record, ArchiveLabel, ArchiveVersion, InDom,
    IndomSnapshot, MetaRecord, ResultRecord, Timestamp, FRAME_OVERHEAD, VOL_META,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default distance in data bytes between forced index entries.
pub const DEFAULT_INDEX_FLUSH_BYTES: u64 = 100_000;

/// Writer tuning.
#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    /// Ceiling on a data volume's size, below the version maximum.
    pub max_volume_bytes: Option<u64>,
    /// Data bytes written past the last index point that force a new entry.
    pub index_flush_bytes: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_volume_bytes: None,
            index_flush_bytes: DEFAULT_INDEX_FLUSH_BYTES,
        }
    }
}

/// Counters reported when the writer finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    /// Data records written, marks excluded.
    pub records: u64,
    /// Mark records written.
    pub marks: u64,
    /// Data volumes created.
    pub volumes: u32,
    /// Temporal index entries written.
    pub index_entries: u64,
    /// Metric descriptors written.
    pub descriptors: u64,
    /// Instance domains written in full.
    pub indoms_full: u64,
    /// Instance domains written as deltas.
    pub indoms_delta: u64,
    /// Instance domains not written because nothing changed.
    pub indoms_unchanged: u64,
    /// Label records written.
    pub labels: u64,
    /// Help texts written.
    pub texts: u64,
    /// Timestamp of the first record written.
    pub first_timestamp: Option<Timestamp>,
    /// Timestamp of the last record written.
    pub last_timestamp: Option<Timestamp>,
}

/// Writer for one output archive.
#[derive(Debug)]
pub struct OutputWriter {
    base: PathBuf,
    label: ArchiveLabel,
    options: WriterOptions,
    max_volume_bytes: u64,
    meta: BufWriter<File>,
    meta_offset: u64,
    data: BufWriter<File>,
    data_offset: u64,
    volume: u32,
    index: IndexWriter,
    flush_point: u64,
    volume_fresh: bool,
    started: bool,
    last_indexed: Option<Timestamp>,
    written_indoms: HashMap<InDom, IndomSnapshot>,
    summary: WriterSummary,
}

fn create_file(path: &Path) -> Result<BufWriter<File>> {
    let file = File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| ArchiveError::file(path, e))?;
    Ok(BufWriter::new(file))
}

fn write_label<W: Write>(writer: &mut W, label: &ArchiveLabel, vol: i32) -> Result<u64> {
    let mut label = label.clone();
    label.vol = vol;
    Ok(write_record(writer, &encode_label(&label)?)?)
}

impl OutputWriter {
    /// Creates `base.meta`, `base.index` and `base.0`, each with its label.
    ///
    /// The label version selects the output format. Existing files are never
    /// overwritten.
    pub fn create(
        base: impl AsRef<Path>,
        label: ArchiveLabel,
        options: WriterOptions,
    ) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        let version = label.version;

        let mut meta = create_file(&meta_path(&base))?;
        let meta_offset = write_label(&mut meta, &label, VOL_META)?;
        let index = IndexWriter::create(index_path(&base), &label)?;
        let mut data = create_file(&volume_path(&base, 0))?;
        let data_offset = write_label(&mut data, &label, 0)?;

        let max_volume_bytes = options
            .max_volume_bytes
            .map_or(version.max_volume_offset(), |max| {
                max.min(version.max_volume_offset())
            });
        debug!(base = %base.display(), %version, "created output archive");

        Ok(Self {
            base,
            label,
            options,
            max_volume_bytes,
            meta,
            meta_offset,
            data,
            data_offset,
            volume: 0,
            index,
            flush_point: options.index_flush_bytes,
            volume_fresh: true,
            started: false,
            last_indexed: None,
            written_indoms: HashMap::new(),
            summary: WriterSummary {
                volumes: 1,
                ..WriterSummary::default()
            },
        })
    }

    /// Output format version.
    pub fn version(&self) -> ArchiveVersion {
        self.label.version
    }

    /// Base path of the output archive.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Current data volume number.
    pub fn volume(&self) -> u32 {
        self.volume
    }

    /// Records written so far, marks included.
    pub fn written(&self) -> u64 {
        self.summary.records + self.summary.marks
    }

    /// Timestamp of the last record written.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.summary.last_timestamp
    }

    /// Closes the current data volume and starts the next one.
    pub fn new_volume(&mut self) -> Result<()> {
        self.data.flush()?;
        let next = self.volume + 1;
        let path = volume_path(&self.base, next);
        let mut data = create_file(&path)?;
        self.data_offset = write_label(&mut data, &self.label, next as i32)?;
        self.data = data;
        self.volume = next;
        self.volume_fresh = true;
        self.flush_point = self.data_offset + self.options.index_flush_bytes;
        self.summary.volumes += 1;
        info!("new volume {}", path.display());
        Ok(())
    }

    fn rewrite_labels(&mut self, start: Timestamp) -> Result<()> {
        self.label.start = start;
        for (stream, vol) in [(&mut self.meta, VOL_META), (&mut self.data, self.volume as i32)] {
            stream.seek(SeekFrom::Start(0))?;
            write_label(stream, &self.label, vol)?;
            stream.seek(SeekFrom::End(0))?;
        }
        self.index.rewrite_label(&self.label)?;
        debug!("archive start set to {start}");
        Ok(())
    }

    fn put_meta(&mut self, record: &MetaRecord) -> Result<()> {
        let body = encode_meta(record, self.label.version)?;
        self.meta_offset += write_record(&mut self.meta, &body)?;
        Ok(())
    }

    /// Writes `snapshot` as of `ts`, unless it matches what was last written.
    /// Returns true if anything was written.
    fn put_indom(&mut self, mut snapshot: IndomSnapshot, ts: Timestamp) -> Result<bool> {
        snapshot.timestamp = ts;
        let encoding = match self.written_indoms.get(&snapshot.indom) {
            Some(prior) => match diff(prior, &snapshot) {
                IndomEncoding::Delta(_) if self.label.version == ArchiveVersion::V2 => {
                    IndomEncoding::Full(snapshot.clone())
                }
                other => other,
            },
            None => IndomEncoding::Full(snapshot.clone()),
        };
        match encoding {
            IndomEncoding::Unchanged => {
                self.summary.indoms_unchanged += 1;
                return Ok(false);
            }
            IndomEncoding::Full(full) => {
                self.put_meta(&MetaRecord::InDom(full))?;
                self.summary.indoms_full += 1;
            }
            IndomEncoding::Delta(delta) => {
                self.put_meta(&MetaRecord::InDomDelta(delta))?;
                self.summary.indoms_delta += 1;
            }
        }
        self.written_indoms.insert(snapshot.indom, snapshot);
        Ok(true)
    }

    /// Writes a data record preceded by `metadata`.
    ///
    /// Instance domains in `metadata` are stamped with the record's
    /// timestamp. An index entry follows when this is the first record of a
    /// volume, when the data stream passed the flush threshold, when an
    /// instance domain was written, or when `force_index` is set.
    pub fn write_record(
        &mut self,
        record: &ResultRecord,
        metadata: Vec<MetaRecord>,
        force_index: bool,
    ) -> Result<()> {
        let ts = record.timestamp;
        if !self.started {
            self.rewrite_labels(ts)?;
            self.summary.first_timestamp = Some(ts);
            self.started = true;
        }

        let body = encode_result(record, self.label.version)?;
        let framed = (body.len() + FRAME_OVERHEAD) as u64;
        if !self.volume_fresh && self.data_offset + framed > self.max_volume_bytes {
            self.new_volume()?;
        }

        let meta_before = self.meta_offset;
        let data_before = self.data_offset;
        let mut need_index = force_index || self.volume_fresh;
        if data_before > self.flush_point {
            need_index = true;
            self.flush_point = data_before + self.options.index_flush_bytes;
        }

        for item in metadata {
            match item {
                MetaRecord::InDom(snapshot) => {
                    if self.put_indom(snapshot, ts)? {
                        need_index = true;
                    }
                }
                MetaRecord::InDomDelta(_) => {
                    return Err(ArchiveError::Unsupported(
                        "delta instance domains are computed by the writer".to_string(),
                    ))
                }
                other => {
                    self.put_meta(&other)?;
                    match other {
                        MetaRecord::Desc(_) => self.summary.descriptors += 1,
                        MetaRecord::Label(_) => self.summary.labels += 1,
                        MetaRecord::Text(_) => self.summary.texts += 1,
                        MetaRecord::InDom(_) | MetaRecord::InDomDelta(_) => {}
                    }
                }
            }
        }

        self.data_offset += write_record(&mut self.data, &body)?;
        self.volume_fresh = false;
        if record.is_mark() {
            self.summary.marks += 1;
        } else {
            self.summary.records += 1;
        }
        self.summary.last_timestamp = Some(ts);

        if need_index && self.last_indexed != Some(ts) {
            self.put_index(ts, meta_before, data_before)?;
        }
        Ok(())
    }

    /// Writes a mark record.
    pub fn write_mark(&mut self, ts: Timestamp, force_index: bool) -> Result<()> {
        self.write_record(&ResultRecord::mark(ts), Vec::new(), force_index)
    }

    /// Adds an index entry pointing at the given offsets.
    ///
    /// Both streams are flushed and positioned at the offsets so the entry
    /// records the true stream positions, then returned to the end.
    fn put_index(&mut self, ts: Timestamp, meta_at: u64, data_at: u64) -> Result<()> {
        self.meta.flush()?;
        self.data.flush()?;
        self.meta.seek(SeekFrom::Start(meta_at))?;
        self.data.seek(SeekFrom::Start(data_at))?;
        let entry = IndexEntry {
            timestamp: ts,
            vol: self.volume as i32,
            meta_offset: self.meta.stream_position()?,
            data_offset: self.data.stream_position()?,
        };
        self.index.put(&entry)?;
        self.meta.seek(SeekFrom::End(0))?;
        self.data.seek(SeekFrom::End(0))?;
        self.last_indexed = Some(ts);
        debug!(
            %ts,
            vol = entry.vol,
            meta = entry.meta_offset,
            data = entry.data_offset,
            "index entry"
        );
        Ok(())
    }

    /// Writes the closing index entry, flushes and syncs every file.
    pub fn finish(mut self) -> Result<WriterSummary> {
        if let Some(last) = self.summary.last_timestamp {
            if self.last_indexed != Some(last) {
                let (meta_end, data_end) = (self.meta_offset, self.data_offset);
                self.put_index(last, meta_end, data_end)?;
            }
        }
        for (stream, path) in [
            (&mut self.meta, meta_path(&self.base)),
            (&mut self.data, volume_path(&self.base, self.volume)),
        ] {
            stream.flush()?;
            stream
                .get_ref()
                .sync_all()
                .map_err(|e| ArchiveError::file(path, e))?;
        }
        self.summary.index_entries = self.index.entries();
        self.index.finish()?;
        Ok(self.summary)
    }

    /// Closes and deletes every file written so far.
    pub fn discard(self) -> Result<()> {
        let base = self.base.clone();
        drop(self);
        remove_archive(&base)
    }
}
