//! Sequential reader over one input archive.
//!
//! Metadata and data are independent cursors with their own end-of-stream
//! state. Data volumes are walked in ascending order. Delta instance domains
//! are expanded to full snapshots before they leave the reader, so callers
//! never see a delta.

use crate::error::{ArchiveError, Result};
use crate::log::{base_name, list_volumes, meta_path, volume_path};
use crate::meta::indom;
use crate::record::{
    decode_label, decode_meta, decode_result, read_record, ArchiveLabel, ArchiveVersion,
    DecodeError, FrameError, InDom, IndomSnapshot, MetaRecord, ResultRecord, SessionId,
    Timestamp, FRAME_OVERHEAD, VOL_META,
};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Options for opening an archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Stop quietly at the first corrupt record instead of failing.
    pub desperate: bool,
}

/// One open file of an archive with its read position.
#[derive(Debug)]
struct Stream {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    size: u64,
}

impl Stream {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(|e| ArchiveError::file(&path, e))?;
        let size = file
            .metadata()
            .map_err(|e| ArchiveError::file(&path, e))?
            .len();
        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: 0,
            size,
        })
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }

    /// Next framed body and the offset it started at.
    fn next_body(&mut self) -> std::result::Result<Option<(u64, Vec<u8>)>, RecordFault> {
        let start = self.offset;
        match read_record(&mut self.reader) {
            Ok(Some(body)) => {
                self.offset += (body.len() + FRAME_OVERHEAD) as u64;
                Ok(Some((start, body)))
            }
            Ok(None) => Ok(None),
            Err(FrameError::Corrupt(e)) => Err(RecordFault::Corrupt { offset: start, err: e }),
            Err(FrameError::Io(e)) => Err(RecordFault::Fatal(ArchiveError::file(&self.path, e))),
        }
    }

    fn label(&mut self) -> Result<ArchiveLabel> {
        let name = self.name();
        match self.next_body() {
            Ok(Some((offset, body))) => decode_label(&body).map_err(|e| e.at(name, offset)),
            Ok(None) => Err(ArchiveError::Format {
                archive: name,
                offset: 0,
                reason: "missing archive label".to_string(),
            }),
            Err(RecordFault::Corrupt { offset, err }) => Err(err.at(name, offset)),
            Err(RecordFault::Fatal(err)) => Err(err),
        }
    }

    fn corrupt(&self, offset: u64, err: DecodeError) -> ArchiveError {
        ArchiveError::CorruptRecord {
            archive: self.name(),
            offset,
            file_size: self.size,
            reason: err.reason().to_string(),
        }
    }
}

enum RecordFault {
    Corrupt { offset: u64, err: DecodeError },
    Fatal(ArchiveError),
}

/// Reader over the metadata file and data volumes of one archive.
#[derive(Debug)]
pub struct ArchiveReader {
    base: PathBuf,
    label: ArchiveLabel,
    desperate: bool,
    meta: Option<Stream>,
    data: Option<Stream>,
    pending_volumes: VecDeque<u32>,
    last_indoms: HashMap<InDom, IndomSnapshot>,
    last_meta_ts: Timestamp,
    prologue: Option<SessionId>,
    epilogue: Option<SessionId>,
    data_records: u64,
    truncated: bool,
}

impl ArchiveReader {
    /// Opens the archive named by `path`.
    ///
    /// `path` may be the base name or any of its files (`base.meta`,
    /// `base.index`, `base.N`). The labels of the metadata file and the first
    /// data volume are read and checked here.
    ///
    /// # Errors
    ///
    /// Missing files, damaged labels, or labels that disagree on version.
    pub fn open(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let base = if meta_path(path).exists() {
            path.to_path_buf()
        } else {
            base_name(path)
        };

        let mut meta = Stream::open(meta_path(&base))?;
        let label = meta.label()?;
        if label.vol != VOL_META {
            return Err(ArchiveError::Format {
                archive: meta.name(),
                offset: 0,
                reason: format!("label volume {} is not a metadata label", label.vol),
            });
        }

        let mut pending_volumes: VecDeque<u32> = list_volumes(&base)?.into();
        let Some(first) = pending_volumes.pop_front() else {
            return Err(ArchiveError::Format {
                archive: base.display().to_string(),
                offset: 0,
                reason: "no data volumes".to_string(),
            });
        };

        let mut reader = Self {
            base,
            label,
            desperate: options.desperate,
            meta: Some(meta),
            data: None,
            pending_volumes,
            last_indoms: HashMap::new(),
            last_meta_ts: Timestamp::ZERO,
            prologue: None,
            epilogue: None,
            data_records: 0,
            truncated: false,
        };
        reader.open_volume(first)?;
        debug!(
            archive = %reader.name(),
            version = %reader.label.version,
            host = %reader.label.hostname,
            "opened archive"
        );
        Ok(reader)
    }

    fn open_volume(&mut self, vol: u32) -> Result<()> {
        let mut stream = Stream::open(volume_path(&self.base, vol))?;
        let label = stream.label()?;
        if label.vol != vol as i32 {
            return Err(ArchiveError::Format {
                archive: stream.name(),
                offset: 0,
                reason: format!("label names volume {}, expected {vol}", label.vol),
            });
        }
        if label.version != self.label.version {
            return Err(ArchiveError::Format {
                archive: stream.name(),
                offset: 0,
                reason: format!(
                    "volume is {} but metadata is {}",
                    label.version, self.label.version
                ),
            });
        }
        debug!("reading volume {}", stream.path.display());
        self.data = Some(stream);
        Ok(())
    }

    /// Archive base name for messages.
    pub fn name(&self) -> String {
        self.base.display().to_string()
    }

    /// Base path of the archive.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Label of the metadata file.
    pub fn label(&self) -> &ArchiveLabel {
        &self.label
    }

    /// Format version of the archive.
    pub fn version(&self) -> ArchiveVersion {
        self.label.version
    }

    /// Session of the first prologue record read so far.
    pub fn prologue(&self) -> Option<SessionId> {
        self.prologue
    }

    /// Session of the last prologue/epilogue record read so far.
    pub fn epilogue(&self) -> Option<SessionId> {
        self.epilogue
    }

    /// Number of data records read.
    pub fn data_records(&self) -> u64 {
        self.data_records
    }

    /// Returns true if a corrupt record cut either stream short.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Returns true once the metadata stream is exhausted.
    pub fn meta_eof(&self) -> bool {
        self.meta.is_none()
    }

    /// Returns true once every data volume is exhausted.
    pub fn data_eof(&self) -> bool {
        self.data.is_none()
    }

    /// Handles a bad record: an error, or in desperate mode a log line and
    /// the end of that stream.
    fn fault(&mut self, err: ArchiveError) -> Result<()> {
        if !self.desperate {
            return Err(err);
        }
        error!("{err}; ignoring the rest of the file");
        self.truncated = true;
        Ok(())
    }

    /// Next metadata record with the timestamp it should be filed under.
    ///
    /// Records without a wire timestamp (descriptors, help text) get the
    /// timestamp of the latest timestamped record before them in this file.
    pub fn next_meta(&mut self) -> Result<Option<(Timestamp, MetaRecord)>> {
        let Some(mut stream) = self.meta.take() else {
            return Ok(None);
        };
        let (offset, body) = match stream.next_body() {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(None),
            Err(RecordFault::Fatal(err)) => return Err(err),
            Err(RecordFault::Corrupt { offset, err }) => {
                self.fault(stream.corrupt(offset, err))?;
                return Ok(None);
            }
        };
        let record = match decode_meta(&body, self.label.version) {
            Ok(record) => record,
            Err(err) => {
                self.fault(stream.corrupt(offset, err))?;
                return Ok(None);
            }
        };

        let record = match record {
            MetaRecord::InDomDelta(delta) => {
                let Some(prior) = self.last_indoms.get(&delta.indom) else {
                    let err = ArchiveError::OrphanDelta {
                        archive: self.name(),
                        indom: delta.indom,
                    };
                    self.fault(err)?;
                    return Ok(None);
                };
                let full = match indom::apply(prior, &delta) {
                    Ok(full) => full,
                    Err(err) => {
                        self.fault(stream.corrupt(offset, err))?;
                        return Ok(None);
                    }
                };
                MetaRecord::InDom(full)
            }
            other => other,
        };
        if let MetaRecord::InDom(snapshot) = &record {
            self.last_indoms.insert(snapshot.indom, snapshot.clone());
        }
        if let Some(ts) = record.timestamp() {
            self.last_meta_ts = ts;
        }

        self.meta = Some(stream);
        Ok(Some((self.last_meta_ts, record)))
    }

    /// Next data record, crossing into later volumes as each one ends.
    pub fn next_data(&mut self) -> Result<Option<ResultRecord>> {
        loop {
            let Some(mut stream) = self.data.take() else {
                return Ok(None);
            };
            let (offset, body) = match stream.next_body() {
                Ok(Some(found)) => found,
                Ok(None) => {
                    match self.pending_volumes.pop_front() {
                        Some(vol) => self.open_volume(vol)?,
                        None => debug!("{}: end of data", self.name()),
                    }
                    continue;
                }
                Err(RecordFault::Fatal(err)) => return Err(err),
                Err(RecordFault::Corrupt { offset, err }) => {
                    self.fault(stream.corrupt(offset, err))?;
                    return Ok(None);
                }
            };
            let record = match decode_result(&body, self.label.version) {
                Ok(record) => record,
                Err(err) => {
                    self.fault(stream.corrupt(offset, err))?;
                    return Ok(None);
                }
            };
            self.data = Some(stream);

            self.data_records += 1;
            if let Some(session) = record.session_id() {
                if self.prologue.is_none() {
                    self.prologue = Some(session);
                }
                self.epilogue = Some(session);
            }
            return Ok(Some(record));
        }
    }
}
