//! K-way merge of data records across input archives.
//!
//! Each source holds at most one pending item: its next selected record, or a
//! mark once it runs dry. Every step hands out the earliest pending item, ties
//! going to the source listed first, and refills only that source. A mark is
//! never stamped earlier than the latest item already handed out, so the
//! output stays in time order even after [`MergeScheduler::discard_before`].

use crate::error::Result;
use crate::extract::select::Selector;
use crate::log::ArchiveReader;
use crate::record::{ResultRecord, SessionId, Timestamp};
use tracing::debug;

/// A stream of data records in time order.
pub trait RecordSource {
    /// Name used in log messages.
    fn source_name(&self) -> String;

    /// Next data record, or `None` at the end.
    fn next_record(&mut self) -> Result<Option<ResultRecord>>;

    /// Collector session that opened this stream, once seen.
    fn prologue(&self) -> Option<SessionId>;

    /// Collector session of the last prologue/epilogue seen.
    fn epilogue(&self) -> Option<SessionId>;
}

impl RecordSource for ArchiveReader {
    fn source_name(&self) -> String {
        self.name()
    }

    fn next_record(&mut self) -> Result<Option<ResultRecord>> {
        self.next_data()
    }

    fn prologue(&self) -> Option<SessionId> {
        ArchiveReader::prologue(self)
    }

    fn epilogue(&self) -> Option<SessionId> {
        ArchiveReader::epilogue(self)
    }
}

/// A source's next item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    /// A selected data record.
    Record(ResultRecord),
    /// The source is exhausted; a discontinuity at its last emitted time.
    Mark(Timestamp),
}

impl Pending {
    /// Time the item sorts at.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Record(record) => record.timestamp,
            Self::Mark(ts) => *ts,
        }
    }
}

/// What the scheduler hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    /// A data record from source `source`.
    Record {
        /// Index of the source in input order.
        source: usize,
        /// The record.
        record: ResultRecord,
    },
    /// A mark to write for exhausted source `source`.
    Mark {
        /// Index of the source in input order.
        source: usize,
        /// Mark timestamp.
        timestamp: Timestamp,
    },
}

impl Emitted {
    /// Time of the emitted item.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Record { record, .. } => record.timestamp,
            Self::Mark { timestamp, .. } => *timestamp,
        }
    }
}

/// Counters kept while merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Records handed out.
    pub records: u64,
    /// Marks handed out.
    pub marks: u64,
    /// Marks omitted because the next record continues the same collector session.
    pub marks_suppressed: u64,
    /// Marks omitted because no record follows them.
    pub marks_dropped: u64,
    /// Records with nothing left after selection.
    pub filtered: u64,
    /// Records dropped for preceding the window start.
    pub before_window: u64,
}

#[derive(Debug)]
struct Slot<S> {
    source: S,
    pending: Option<Pending>,
    exhausted: bool,
    last_emitted: Option<Timestamp>,
}

/// Merges record sources into one time-ordered stream.
#[derive(Debug)]
pub struct MergeScheduler<S> {
    slots: Vec<Slot<S>>,
    selector: Selector,
    window_start: Option<Timestamp>,
    last_out: Option<Timestamp>,
    stats: MergeStats,
}

impl<S: RecordSource> MergeScheduler<S> {
    /// Creates a scheduler over `sources`, in priority order for ties.
    pub fn new(sources: Vec<S>, selector: Selector, window_start: Option<Timestamp>) -> Self {
        Self {
            slots: sources
                .into_iter()
                .map(|source| Slot {
                    source,
                    pending: None,
                    exhausted: false,
                    last_emitted: None,
                })
                .collect(),
            selector,
            window_start,
            last_out: None,
            stats: MergeStats::default(),
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// The sources, in input order.
    pub fn sources(&self) -> impl Iterator<Item = &S> {
        self.slots.iter().map(|slot| &slot.source)
    }

    /// Moves the window start and drops pending records before it.
    ///
    /// Returns the number of records dropped.
    pub fn discard_before(&mut self, start: Option<Timestamp>) -> u64 {
        self.window_start = start;
        let Some(start) = start else {
            return 0;
        };
        let mut dropped = 0;
        for slot in &mut self.slots {
            if matches!(&slot.pending, Some(Pending::Record(r)) if r.timestamp < start) {
                slot.pending = None;
                dropped += 1;
            }
        }
        self.stats.before_window += dropped;
        dropped
    }

    fn refill(&mut self, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        while slot.pending.is_none() && !slot.exhausted {
            let Some(record) = slot.source.next_record()? else {
                slot.exhausted = true;
                match slot.last_emitted {
                    Some(ts) => {
                        let ts = self.last_out.map_or(ts, |out| ts.max(out));
                        slot.pending = Some(Pending::Mark(ts));
                    }
                    None => debug!("{}: no records, retired", slot.source.source_name()),
                }
                break;
            };
            let Some(record) = self.selector.apply(record) else {
                self.stats.filtered += 1;
                continue;
            };
            if self.window_start.is_some_and(|start| record.timestamp < start) {
                self.stats.before_window += 1;
                continue;
            }
            slot.pending = Some(Pending::Record(record));
        }
        Ok(())
    }

    /// Earliest pending item; ties go to the lower source index.
    fn earliest(&self, records_only: bool, excluding: Option<usize>) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|&(i, _)| Some(i) != excluding)
            .filter_map(|(i, slot)| match &slot.pending {
                Some(Pending::Mark(_)) if records_only => None,
                Some(pending) => Some((pending.timestamp(), i)),
                None => None,
            })
            .min()
            .map(|(_, i)| i)
    }

    /// Hands out the next record or mark, or `None` when every source is done.
    pub fn next(&mut self) -> Result<Option<Emitted>> {
        loop {
            for i in 0..self.slots.len() {
                self.refill(i)?;
            }
            let Some(i) = self.earliest(false, None) else {
                return Ok(None);
            };
            let Some(pending) = self.slots[i].pending.take() else {
                continue;
            };

            match pending {
                Pending::Record(record) => {
                    self.slots[i].last_emitted = Some(record.timestamp);
                    self.last_out = Some(record.timestamp);
                    self.stats.records += 1;
                    return Ok(Some(Emitted::Record { source: i, record }));
                }
                Pending::Mark(timestamp) => {
                    let Some(next) = self.earliest(true, Some(i)) else {
                        self.stats.marks_dropped += 1;
                        debug!("{}: trailing mark dropped", self.slots[i].source.source_name());
                        continue;
                    };
                    let ended = self.slots[i].source.epilogue();
                    if ended.is_some() && ended == self.slots[next].source.prologue() {
                        self.stats.marks_suppressed += 1;
                        debug!(
                            "{}: mark at {timestamp} suppressed, {} continues the session",
                            self.slots[i].source.source_name(),
                            self.slots[next].source.source_name()
                        );
                        continue;
                    }
                    self.stats.marks += 1;
                    self.last_out = Some(timestamp);
                    return Ok(Some(Emitted::Mark {
                        source: i,
                        timestamp,
                    }));
                }
            }
        }
    }
}
