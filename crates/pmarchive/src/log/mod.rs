//! Archive files on disk.
//!
//! An archive named `base` is the set of files `base.meta` (label plus
//! metadata records), `base.index` (label plus temporal index entries) and
//! the data volumes `base.0`, `base.1`, and so on.
//!
//! # Example
//!
//! ```rust,no_run
//! use pmarchive::log::{ArchiveReader, ReaderOptions};
//!
//! let mut reader = ArchiveReader::open("/var/log/pcp/host/20240101", ReaderOptions::default())?;
//! while let Some(record) = reader.next_data()? {
//!     println!("{} metrics at {}", record.vsets.len(), record.timestamp);
//! }
//! # Ok::<(), pmarchive::ArchiveError>(())
//! ```

pub mod index;
pub mod reader;
pub mod writer;

pub use index::{IndexEntry, TemporalIndex};
pub use reader::{ArchiveReader, ReaderOptions};
pub use writer::{OutputWriter, WriterOptions, WriterSummary};

use crate::error::{ArchiveError, Result};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension of the metadata file.
pub const META_SUFFIX: &str = "meta";

/// Extension of the temporal index file.
pub const INDEX_SUFFIX: &str = "index";

/// Strips a `.meta`, `.index` or `.N` suffix, leaving the archive base name.
pub fn base_name(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext)
            if ext == META_SUFFIX
                || ext == INDEX_SUFFIX
                || (!ext.is_empty() && ext.bytes().all(|b| b.is_ascii_digit())) =>
        {
            path.with_extension("")
        }
        _ => path.to_path_buf(),
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the metadata file.
pub fn meta_path(base: &Path) -> PathBuf {
    with_suffix(base, META_SUFFIX)
}

/// Path of the temporal index file.
pub fn index_path(base: &Path) -> PathBuf {
    with_suffix(base, INDEX_SUFFIX)
}

/// Path of data volume `vol`.
pub fn volume_path(base: &Path, vol: u32) -> PathBuf {
    with_suffix(base, &vol.to_string())
}

/// Lists the data volume numbers present on disk, ascending.
pub fn list_volumes(base: &Path) -> Result<Vec<u32>> {
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(stem) = base.file_name().and_then(|name| name.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{stem}.");

    let mut volumes = Vec::new();
    let entries = fs::read_dir(&dir).map_err(|e| ArchiveError::file(&dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ArchiveError::file(&dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(&prefix) else {
            continue;
        };
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(vol) = suffix.parse::<u32>() {
                volumes.push(vol);
            }
        }
    }
    volumes.sort_unstable();
    Ok(volumes)
}

/// Removes every file of the archive `base`. Missing files are not an error.
pub fn remove_archive(base: &Path) -> Result<()> {
    let mut paths = vec![meta_path(base), index_path(base)];
    paths.extend(list_volumes(base)?.into_iter().map(|vol| volume_path(base, vol)));
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => debug!("removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ArchiveError::file(path, e)),
        }
    }
    Ok(())
}
