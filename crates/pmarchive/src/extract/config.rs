//! Extract options.

use crate::error::{ArchiveError, Result};
use crate::log::writer::DEFAULT_INDEX_FLUSH_BYTES;
use crate::record::{ArchiveVersion, Timestamp};
use tracing::warn;

/// Smallest volume ceiling accepted; a volume must hold its label and a record.
pub const MIN_VOLUME_BYTES: u64 = 1024;

/// Inclusive time bounds on the records copied to the output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    /// Earliest timestamp kept.
    pub start: Option<Timestamp>,
    /// Latest timestamp kept.
    pub end: Option<Timestamp>,
}

impl TimeWindow {
    /// Creates a window; either bound may be open.
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        Self { start, end }
    }

    /// Returns true if `ts` lies before the start bound.
    pub fn before_start(&self, ts: Timestamp) -> bool {
        self.start.is_some_and(|start| ts < start)
    }

    /// Returns true if `ts` lies past the end bound.
    pub fn after_end(&self, ts: Timestamp) -> bool {
        self.end.is_some_and(|end| ts > end)
    }

    /// Returns true if `ts` is inside both bounds.
    pub fn contains(&self, ts: Timestamp) -> bool {
        !self.before_start(ts) && !self.after_end(ts)
    }

    /// Shifts both bounds forward by the fewest whole days that bring the end
    /// bound to `ts` or past it, and returns that number of days.
    ///
    /// Returns `None`, leaving the window alone, if the shifted bounds do not
    /// fit a [`Timestamp`].
    pub fn roll_until(&mut self, ts: Timestamp) -> Option<u32> {
        let Some(end) = self.end else {
            return Some(0);
        };
        if ts <= end {
            return Some(0);
        }
        let behind = ts.sec.checked_sub(end.sec)?;
        let mut days = behind / Timestamp::SECS_PER_DAY;
        if behind % Timestamp::SECS_PER_DAY != 0 || ts.nsec > end.nsec {
            days += 1;
        }
        let shift = days.checked_mul(Timestamp::SECS_PER_DAY)?;
        let days = u32::try_from(days).ok()?;
        let start = match self.start {
            Some(start) => Some(start.checked_add_secs(shift)?),
            None => None,
        };
        self.end = Some(end.checked_add_secs(shift)?);
        self.start = start;
        Some(days)
    }

    /// Returns true if both bounds are set and less than a day apart.
    pub fn fits_one_day(&self) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => end < start.add_secs(Timestamp::SECS_PER_DAY),
            _ => false,
        }
    }
}

/// Configuration for an extract run.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Records outside this window are dropped.
    pub window: TimeWindow,
    /// Stop after writing this many records, marks included.
    pub sample_limit: Option<u64>,
    /// Start a new data volume after every this many records.
    pub records_per_volume: Option<u64>,
    /// Ceiling on data volume size, below the version maximum.
    pub max_volume_bytes: Option<u64>,
    /// Output format; defaults to the newest input version.
    pub output_version: Option<ArchiveVersion>,
    /// Keep going past corrupt input records and keep partial output.
    pub desperate: bool,
    /// Skip conflicting metrics instead of failing.
    pub tolerant: bool,
    /// Move the window forward a day when a record passes its end.
    pub daily_roll: bool,
    /// Data bytes between forced temporal index entries.
    pub index_flush_bytes: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            window: TimeWindow::default(),
            sample_limit: None,
            records_per_volume: None,
            max_volume_bytes: None,
            output_version: None,
            desperate: false,
            tolerant: false,
            daily_roll: false,
            index_flush_bytes: DEFAULT_INDEX_FLUSH_BYTES,
        }
    }
}

impl ExtractConfig {
    /// Checks option values before any file is touched.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Config`] for an inverted window or a zero-sized limit.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.window.start, self.window.end) {
            if end < start {
                return Err(ArchiveError::Config(format!(
                    "window end {end} is before window start {start}"
                )));
            }
        }
        if self.sample_limit == Some(0) {
            return Err(ArchiveError::Config("sample limit must be positive".to_string()));
        }
        if self.records_per_volume == Some(0) {
            return Err(ArchiveError::Config(
                "records per volume must be positive".to_string(),
            ));
        }
        if let Some(bytes) = self.max_volume_bytes {
            if bytes < MIN_VOLUME_BYTES {
                return Err(ArchiveError::Config(format!(
                    "volume size {bytes} is below the minimum of {MIN_VOLUME_BYTES} bytes"
                )));
            }
        }
        if self.index_flush_bytes == 0 {
            return Err(ArchiveError::Config(
                "index flush threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the daily roll can take effect; warns and returns false if not.
    pub(crate) fn effective_daily_roll(&self) -> bool {
        if !self.daily_roll {
            return false;
        }
        if !self.window.fits_one_day() {
            warn!("daily window roll needs a start and end less than a day apart; disabled");
            return false;
        }
        true
    }
}
