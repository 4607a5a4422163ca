//! Temporal index: fixed-size entries mapping a timestamp to the metadata and
//! data offsets of the first record at or after it.

use crate::error::{ArchiveError, Result};
use crate::record::{
    decode_label, encode_label, read_record, write_record, ArchiveLabel, ArchiveVersion,
    FrameError, Timestamp, VOL_INDEX,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// One temporal index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Timestamp of the record the offsets point at.
    pub timestamp: Timestamp,
    /// Data volume holding the record.
    pub vol: i32,
    /// Offset into the metadata file.
    pub meta_offset: u64,
    /// Offset into the data volume.
    pub data_offset: u64,
}

impl IndexEntry {
    /// Encoded size of one entry.
    pub fn size(version: ArchiveVersion) -> usize {
        match version {
            ArchiveVersion::V2 => 20,
            ArchiveVersion::V3 => 32,
        }
    }

    /// Writes the entry in the layout of `version`.
    pub fn write_to<W: Write>(&self, writer: &mut W, version: ArchiveVersion) -> Result<()> {
        match version {
            ArchiveVersion::V2 => {
                let narrow = |v: u64| {
                    u32::try_from(v).map_err(|_| {
                        ArchiveError::Unsupported(format!(
                            "offset {v} does not fit a version 2 index"
                        ))
                    })
                };
                if !self.timestamp.fits_legacy() {
                    return Err(ArchiveError::Unsupported(format!(
                        "timestamp {} does not fit a version 2 index",
                        self.timestamp
                    )));
                }
                writer.write_all(&(self.timestamp.sec as u32).to_be_bytes())?;
                writer.write_all(&self.timestamp.usec().to_be_bytes())?;
                writer.write_all(&self.vol.to_be_bytes())?;
                writer.write_all(&narrow(self.meta_offset)?.to_be_bytes())?;
                writer.write_all(&narrow(self.data_offset)?.to_be_bytes())?;
            }
            ArchiveVersion::V3 => {
                writer.write_all(&self.timestamp.sec.to_be_bytes())?;
                writer.write_all(&self.timestamp.nsec.to_be_bytes())?;
                writer.write_all(&self.vol.to_be_bytes())?;
                writer.write_all(&self.meta_offset.to_be_bytes())?;
                writer.write_all(&self.data_offset.to_be_bytes())?;
            }
        }
        Ok(())
    }

    /// Decodes an entry from exactly [`IndexEntry::size`] bytes.
    fn from_bytes(buf: &[u8], version: ArchiveVersion) -> Self {
        let u32_at =
            |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| (u64::from(u32_at(at)) << 32) | u64::from(u32_at(at + 4));
        match version {
            ArchiveVersion::V2 => Self {
                timestamp: Timestamp::from_micros(i64::from(u32_at(0)), u32_at(4)),
                vol: u32_at(8) as i32,
                meta_offset: u64::from(u32_at(12)),
                data_offset: u64::from(u32_at(16)),
            },
            ArchiveVersion::V3 => Self {
                timestamp: Timestamp::new(u64_at(0) as i64, u32_at(8)),
                vol: u32_at(12) as i32,
                meta_offset: u64_at(16),
                data_offset: u64_at(24),
            },
        }
    }
}

/// A temporal index file read back from disk.
#[derive(Debug, Clone)]
pub struct TemporalIndex {
    /// The index file's label.
    pub label: ArchiveLabel,
    /// Entries in file order.
    pub entries: Vec<IndexEntry>,
}

impl TemporalIndex {
    /// Reads a whole index file.
    ///
    /// # Errors
    ///
    /// A damaged label, a label for another file kind, or a trailing partial entry.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let file = File::open(path).map_err(|e| ArchiveError::file(path, e))?;
        let mut reader = BufReader::new(file);

        let body = match read_record(&mut reader) {
            Ok(Some(body)) => body,
            Ok(None) => {
                return Err(ArchiveError::Format {
                    archive: name,
                    offset: 0,
                    reason: "empty index file".to_string(),
                })
            }
            Err(FrameError::Corrupt(e)) => return Err(e.at(name, 0)),
            Err(FrameError::Io(e)) => return Err(ArchiveError::file(path, e)),
        };
        let label = decode_label(&body).map_err(|e| e.at(name.clone(), 0))?;
        if label.vol != VOL_INDEX {
            return Err(ArchiveError::Format {
                archive: name,
                offset: 0,
                reason: format!("label volume {} is not an index label", label.vol),
            });
        }

        let header_len = (body.len() + crate::record::FRAME_OVERHEAD) as u64;
        let mut rest = Vec::new();
        reader
            .read_to_end(&mut rest)
            .map_err(|e| ArchiveError::file(path, e))?;
        let size = IndexEntry::size(label.version);
        if rest.len() % size != 0 {
            return Err(ArchiveError::Format {
                archive: name,
                offset: header_len + (rest.len() - rest.len() % size) as u64,
                reason: format!("partial index entry of {} bytes", rest.len() % size),
            });
        }
        let entries = rest
            .chunks_exact(size)
            .map(|chunk| IndexEntry::from_bytes(chunk, label.version))
            .collect();
        Ok(Self { label, entries })
    }

    /// Last entry with timestamp <= `ts`.
    pub fn floor(&self, ts: Timestamp) -> Option<&IndexEntry> {
        self.entries.iter().rev().find(|entry| entry.timestamp <= ts)
    }
}

/// Appends entries to an index file being written.
#[derive(Debug)]
pub(crate) struct IndexWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    version: ArchiveVersion,
    label_len: u64,
    entries: u64,
}

impl IndexWriter {
    /// Creates the index file and writes its label.
    pub(crate) fn create(path: PathBuf, label: &ArchiveLabel) -> Result<Self> {
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ArchiveError::file(&path, e))?;
        let mut writer = BufWriter::new(file);
        let mut label = label.clone();
        label.vol = VOL_INDEX;
        let label_len = write_record(&mut writer, &encode_label(&label)?)?;
        Ok(Self {
            path,
            writer,
            version: label.version,
            label_len,
            entries: 0,
        })
    }

    /// Rewrites the label in place. Its length does not change.
    pub(crate) fn rewrite_label(&mut self, label: &ArchiveLabel) -> Result<()> {
        let mut label = label.clone();
        label.vol = VOL_INDEX;
        self.writer.seek(SeekFrom::Start(0))?;
        let written = write_record(&mut self.writer, &encode_label(&label)?)?;
        debug_assert_eq!(written, self.label_len);
        self.writer.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Appends one entry.
    pub(crate) fn put(&mut self, entry: &IndexEntry) -> Result<()> {
        entry.write_to(&mut self.writer, self.version)?;
        self.entries += 1;
        Ok(())
    }

    /// Entries written so far.
    pub(crate) fn entries(&self) -> u64 {
        self.entries
    }

    /// Flushes and syncs the file.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| ArchiveError::file(&self.path, e))?;
        Ok(())
    }
}
