//! Segmented on-disk bar journal
//!
//! Every inserted bar is appended to the current segment and fsynced before
//! `insert_if_new` returns. On open all segments are replayed into an ordered
//! in-memory index, which then serves `exists`, range queries and the
//! uniqueness check. The index has its own lock so readers never wait on a
//! segment fsync.

use super::segment::{SEGMENT_HEADER_SIZE, Segment, SegmentReader};
use super::{CandleStore, InsertOutcome};
use crate::bucket::{BucketKey, SeriesKey};
use crate::candle::Candlestick;
use crate::error::{ChartError, ChartResult};
use crate::timeframe::Timeframe;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use services_common::{Px, Qty, Symbol, TimestampMs};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File extension of journal segments
pub const SEGMENT_EXTENSION: &str = "seg";

/// Persisted form of one finalized bar
///
/// Primary key is (symbol, timeframe code, bucket start); prices and volume
/// are raw fixed-point ticks.
#[allow(missing_docs)] // column names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarRecord {
    pub symbol: String,
    pub timeframe: u32,
    pub timestamp_msec: i64,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
    pub tick_count: u64,
}

impl From<&Candlestick> for BarRecord {
    fn from(bar: &Candlestick) -> Self {
        Self {
            symbol: bar.key.symbol.as_str().to_string(),
            timeframe: bar.key.timeframe.code(),
            timestamp_msec: bar.key.start.as_millis(),
            open: bar.open.as_i64(),
            high: bar.high.as_i64(),
            low: bar.low.as_i64(),
            close: bar.close.as_i64(),
            volume: bar.volume.as_i64(),
            tick_count: bar.tick_count,
        }
    }
}

impl TryFrom<BarRecord> for Candlestick {
    type Error = ChartError;

    fn try_from(record: BarRecord) -> ChartResult<Self> {
        let timeframe = Timeframe::from_code(record.timeframe).ok_or_else(|| {
            ChartError::Corrupt(format!("unknown timeframe code {}", record.timeframe))
        })?;
        let symbol = Symbol::new(&record.symbol)
            .map_err(|e| ChartError::Corrupt(format!("stored symbol: {e}")))?;
        Ok(Self {
            key: BucketKey {
                symbol,
                timeframe,
                start: TimestampMs::from_millis(record.timestamp_msec),
            },
            open: Px::from_i64(record.open),
            high: Px::from_i64(record.high),
            low: Px::from_i64(record.low),
            close: Px::from_i64(record.close),
            volume: Qty::from_i64(record.volume),
            tick_count: record.tick_count,
        })
    }
}

/// Journal statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalStats {
    /// Segment files on disk
    pub segment_count: usize,
    /// Bars in the index
    pub bar_count: usize,
}

type BarIndex = BTreeMap<BucketKey, Candlestick>;

struct JournalWriter {
    dir: PathBuf,
    segment_size: u64,
    segment_counter: u64,
    current: Option<Segment>,
}

impl JournalWriter {
    fn segment_path(&self, counter: u64) -> PathBuf {
        self.dir.join(format!("{counter:010}.{SEGMENT_EXTENSION}"))
    }

    fn rotate_segment(&mut self) -> ChartResult<()> {
        if let Some(segment) = self.current.take() {
            segment.close()?;
        }
        self.segment_counter += 1;
        let path = self.segment_path(self.segment_counter);
        self.current = Some(Segment::create(&path, self.segment_size)?);
        debug!(path = %path.display(), "Rotated to new journal segment");
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> ChartResult<()> {
        if self.current.as_ref().is_none_or(|s| s.is_full(data.len())) {
            self.rotate_segment()?;
        }
        let segment = self
            .current
            .as_mut()
            .ok_or_else(|| ChartError::Logic("journal has no open segment".into()))?;
        segment.append(data)?;
        segment.sync()
    }

    /// Check and append under the writer lock; the index is updated only
    /// after the record is durable
    fn insert_if_new(
        &mut self,
        index: &RwLock<BarIndex>,
        bar: Candlestick,
    ) -> ChartResult<InsertOutcome> {
        if index.read().contains_key(&bar.key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        let data = bincode::serialize(&BarRecord::from(&bar))?;
        if let Err(e) = self.append(&data) {
            // a partial frame may be left behind; continue in a fresh segment
            // so it stays a torn tail
            self.current = None;
            return Err(e);
        }
        index.write().insert(bar.key.clone(), bar);
        Ok(InsertOutcome::Inserted)
    }
}

/// Append-only journal store
#[derive(Clone)]
pub struct JournalStore {
    dir: PathBuf,
    writer: Arc<Mutex<JournalWriter>>,
    index: Arc<RwLock<BarIndex>>,
}

impl std::fmt::Debug for JournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalStore").field("dir", &self.dir).finish()
    }
}

/// Segment files in `dir`, oldest first
pub fn list_segments(dir: &Path) -> ChartResult<Vec<PathBuf>> {
    let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some(SEGMENT_EXTENSION))
        .collect();
    segments.sort();
    Ok(segments)
}

fn segment_number(path: &Path) -> Option<u64> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
}

/// Decode every bar in a journal directory without opening it for writing
pub fn read_journal(dir: &Path) -> ChartResult<Vec<Candlestick>> {
    let mut bars = Vec::new();
    for path in list_segments(dir)? {
        if fs::metadata(&path)?.len() < SEGMENT_HEADER_SIZE {
            continue;
        }
        let mut reader = SegmentReader::open(&path)?;
        while let Some(data) = reader.read_next()? {
            let record: BarRecord = bincode::deserialize(&data)?;
            bars.push(Candlestick::try_from(record)?);
        }
    }
    Ok(bars)
}

impl JournalStore {
    /// Open or create a journal in `dir`, replaying existing segments
    pub fn open(dir: &Path, segment_size: u64) -> ChartResult<Self> {
        fs::create_dir_all(dir)?;

        let mut index = BTreeMap::new();
        let mut segment_counter = 0;
        let mut current = None;
        let segments = list_segments(dir)?;
        let last = segments.len().saturating_sub(1);

        for (i, path) in segments.iter().enumerate() {
            segment_counter = segment_counter.max(segment_number(path).unwrap_or(0));
            if fs::metadata(path)?.len() < SEGMENT_HEADER_SIZE {
                warn!(path = %path.display(), "Removing segment with incomplete header");
                fs::remove_file(path)?;
                continue;
            }

            let mut reader = SegmentReader::open(path)?;
            while let Some(data) = reader.read_next()? {
                let bar = Candlestick::try_from(bincode::deserialize::<BarRecord>(&data)?)?;
                index.entry(bar.key.clone()).or_insert(bar);
            }
            if reader.has_torn_tail() {
                warn!(
                    path = %path.display(),
                    valid_len = reader.valid_len(),
                    "Ignoring torn record at segment tail"
                );
            }
            if i == last && reader.valid_len() < segment_size {
                current = Some(Segment::open_for_append(
                    path,
                    segment_size,
                    reader.valid_len(),
                    reader.records_read(),
                )?);
            }
        }

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            bars = index.len(),
            "Opened bar journal"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            writer: Arc::new(Mutex::new(JournalWriter {
                dir: dir.to_path_buf(),
                segment_size,
                segment_counter,
                current,
            })),
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Journal directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segment and bar counts
    pub fn stats(&self) -> ChartResult<JournalStats> {
        let segment_count = list_segments(&self.dir)?.len();
        Ok(JournalStats {
            segment_count,
            bar_count: self.index.read().len(),
        })
    }

    /// Close the current segment so its header carries the entry count
    pub fn close(&self) -> ChartResult<()> {
        if let Some(segment) = self.writer.lock().current.take() {
            segment.close()?;
        }
        Ok(())
    }
}

#[async_trait]
impl CandleStore for JournalStore {
    async fn insert_if_new(&self, bar: &Candlestick) -> ChartResult<InsertOutcome> {
        let writer = Arc::clone(&self.writer);
        let index = Arc::clone(&self.index);
        let bar = bar.clone();
        tokio::task::spawn_blocking(move || writer.lock().insert_if_new(&index, bar))
            .await
            .map_err(|e| ChartError::StorageUnavailable(format!("journal writer: {e}")))?
    }

    async fn exists(&self, key: &BucketKey) -> ChartResult<bool> {
        Ok(self.index.read().contains_key(key))
    }

    async fn query_range(
        &self,
        series: &SeriesKey,
        from: TimestampMs,
        to: TimestampMs,
    ) -> ChartResult<Vec<Candlestick>> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .index
            .read()
            .range(series.bucket(from)..series.bucket(to))
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    async fn health_check(&self) -> ChartResult<()> {
        match fs::metadata(&self.dir) {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(()),
            Ok(_) => Err(ChartError::StorageUnavailable(format!(
                "{} is not a writable directory",
                self.dir.display()
            ))),
            Err(e) => Err(ChartError::StorageUnavailable(format!(
                "{}: {e}",
                self.dir.display()
            ))),
        }
    }

    fn backend_name(&self) -> &'static str {
        "journal"
    }
}
