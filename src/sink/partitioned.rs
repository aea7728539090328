// =============================================================================
// Partitioned columnar writer — Parquet / Feather part files
// =============================================================================
//
// Records are buffered and written as one self-contained part per rotation:
//
//   <dir>/<stem>.part-<UTC yyyymmddTHHMMSSmmm>-<8 hex>.<ext>
//
// Parts are written to a temp name and renamed into place. Rotation happens
// when the buffer reaches `rotate_rows` or its oldest record is
// `rotate_interval` old; `flush` only checks those limits, `close` always
// cuts the remainder.
//
// The buffer holds one row per key (last write wins). A candle that replaces
// a row already stored in an earlier part is removed from that part when the
// new part lands, so every candle key lives in exactly one part.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::filter_record_batch;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info};

use super::{candle_row_key, ensure_parent, row_key, OutputFormat, OutputSink, RowKey};
use crate::error::WriteError;
use crate::types::{OutputRecord, RecordKind, SeriesKey, Timeframe};

fn candle_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("timeframe", DataType::Utf8, false),
        Field::new("open_time", DataType::Int64, false),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
        Field::new("closed", DataType::Boolean, false),
    ]))
}

fn trade_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("id", DataType::Utf8, true),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("price", DataType::Float64, false),
        Field::new("amount", DataType::Float64, false),
        Field::new("side", DataType::Utf8, false),
    ]))
}

pub struct PartitionedWriter {
    dir: PathBuf,
    stem: String,
    format: OutputFormat,
    kind: RecordKind,
    schema: SchemaRef,
    rotate_rows: usize,
    rotate_interval: Duration,
    buffer: BTreeMap<RowKey, OutputRecord>,
    oldest_buffered: Option<Instant>,
    max_open_time: HashMap<SeriesKey, i64>,
    /// Part file holding each stored candle row.
    stored: HashMap<RowKey, PathBuf>,
    parts_written: usize,
    closed: bool,
}

impl PartitionedWriter {
    pub fn open(
        path: &Path,
        format: OutputFormat,
        kind: RecordKind,
        rotate_rows: usize,
        rotate_interval: Duration,
    ) -> Result<Self, WriteError> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| WriteError::SchemaMismatch(format!("bad output path {}", path.display())))?
            .to_string();

        let mut writer = Self {
            dir,
            stem,
            format,
            kind,
            schema: match kind {
                RecordKind::Candle => candle_schema(),
                RecordKind::Trade => trade_schema(),
            },
            rotate_rows: rotate_rows.max(1),
            rotate_interval,
            buffer: BTreeMap::new(),
            oldest_buffered: None,
            max_open_time: HashMap::new(),
            stored: HashMap::new(),
            parts_written: 0,
            closed: false,
        };

        if kind == RecordKind::Candle {
            writer.scan_existing_parts()?;
        }
        Ok(writer)
    }

    /// Existing parts of this target, oldest first.
    pub fn part_files(&self) -> Result<Vec<PathBuf>, WriteError> {
        let prefix = format!("{}.part-", self.stem);
        let suffix = format!(".{}", self.format.extension());
        let mut parts = Vec::new();
        if !self.dir.exists() {
            return Ok(parts);
        }
        for entry in std::fs::read_dir(&self.dir).map_err(|e| WriteError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| WriteError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(&suffix) {
                parts.push(entry.path());
            }
        }
        parts.sort();
        Ok(parts)
    }

    /// Seed the resume map and the row index from earlier parts.
    fn scan_existing_parts(&mut self) -> Result<(), WriteError> {
        let parts = self.part_files()?;
        for part in &parts {
            for batch in read_part(part, self.format)? {
                for (key, open_time) in candle_rows(&batch)? {
                    self.stored.insert(candle_row_key(&key, open_time), part.clone());
                    let max = self.max_open_time.entry(key).or_insert(open_time);
                    *max = (*max).max(open_time);
                }
            }
        }
        if !parts.is_empty() {
            info!(
                dir = %self.dir.display(),
                stem = %self.stem,
                parts = parts.len(),
                rows = self.stored.len(),
                "scanned existing parts"
            );
        }
        Ok(())
    }

    fn should_rotate(&self) -> bool {
        self.buffer.len() >= self.rotate_rows
            || self
                .oldest_buffered
                .is_some_and(|t| t.elapsed() >= self.rotate_interval)
    }

    fn next_part_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        let uniq = uuid::Uuid::new_v4().simple().to_string();
        self.dir.join(format!(
            "{}.part-{}-{}.{}",
            self.stem,
            stamp,
            &uniq[..8],
            self.format.extension()
        ))
    }

    fn build_batch(&self) -> Result<RecordBatch, WriteError> {
        let columns: Vec<ArrayRef> = match self.kind {
            RecordKind::Candle => {
                let rows: Vec<_> = self
                    .buffer
                    .values()
                    .filter_map(|r| match r {
                        OutputRecord::Candle(c) => Some(c),
                        OutputRecord::Trade(_) => None,
                    })
                    .collect();
                vec![
                    Arc::new(StringArray::from_iter_values(rows.iter().map(|c| c.symbol.as_str()))),
                    Arc::new(StringArray::from_iter_values(rows.iter().map(|c| c.timeframe.label()))),
                    Arc::new(Int64Array::from_iter_values(rows.iter().map(|c| c.open_time))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|c| c.open))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|c| c.high))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|c| c.low))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|c| c.close))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|c| c.volume))),
                    Arc::new(BooleanArray::from(rows.iter().map(|c| c.closed).collect::<Vec<_>>())),
                ]
            }
            RecordKind::Trade => {
                let rows: Vec<_> = self
                    .buffer
                    .values()
                    .filter_map(|r| match r {
                        OutputRecord::Trade(t) => Some(t),
                        OutputRecord::Candle(_) => None,
                    })
                    .collect();
                vec![
                    Arc::new(StringArray::from_iter_values(rows.iter().map(|t| t.symbol.as_str()))),
                    Arc::new(StringArray::from(rows.iter().map(|t| t.id.clone()).collect::<Vec<_>>())),
                    Arc::new(Int64Array::from_iter_values(rows.iter().map(|t| t.timestamp))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|t| t.price))),
                    Arc::new(Float64Array::from_iter_values(rows.iter().map(|t| t.amount))),
                    Arc::new(StringArray::from_iter_values(rows.iter().map(|t| t.side.to_string()))),
                ]
            }
        };
        Ok(RecordBatch::try_new(self.schema.clone(), columns)?)
    }

    fn write_part(&mut self) -> Result<(), WriteError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        ensure_parent(&self.dir.join(&self.stem))?;
        let batch = self.build_batch()?;
        let path = self.next_part_path();
        write_batches(&path, self.format, &self.schema, std::slice::from_ref(&batch))?;
        self.parts_written += 1;
        info!(part = %path.display(), rows = batch.num_rows(), "part written");

        if self.kind == RecordKind::Candle {
            let mut superseded: HashMap<PathBuf, HashSet<RowKey>> = HashMap::new();
            for key in self.buffer.keys() {
                if let Some(old) = self.stored.insert(key.clone(), path.clone()) {
                    superseded.entry(old).or_default().insert(key.clone());
                }
            }
            for (old, keys) in superseded {
                self.prune_part(&old, &keys)?;
            }
        }

        self.buffer.clear();
        self.oldest_buffered = None;
        Ok(())
    }

    /// Rewrite `part` without the rows in `replaced`; remove it when empty.
    fn prune_part(&self, part: &Path, replaced: &HashSet<RowKey>) -> Result<(), WriteError> {
        let mut kept = Vec::new();
        for batch in read_part(part, self.format)? {
            let keep: Vec<bool> = candle_rows(&batch)?
                .iter()
                .map(|(key, open_time)| !replaced.contains(&candle_row_key(key, *open_time)))
                .collect();
            let filtered = filter_record_batch(&batch, &BooleanArray::from(keep))?;
            if filtered.num_rows() > 0 {
                kept.push(filtered);
            }
        }

        if kept.is_empty() {
            std::fs::remove_file(part).map_err(|e| WriteError::io(part, e))?;
            debug!(part = %part.display(), "part fully replaced, removed");
        } else {
            write_batches(part, self.format, &self.schema, &kept)?;
            debug!(part = %part.display(), replaced = replaced.len(), "part rewritten without replaced rows");
        }
        Ok(())
    }
}

impl OutputSink for PartitionedWriter {
    fn record_kind(&self) -> RecordKind {
        self.kind
    }

    fn write(&mut self, record: &OutputRecord) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        if let OutputRecord::Candle(c) = record {
            let max = self.max_open_time.entry(c.series_key()).or_insert(c.open_time);
            *max = (*max).max(c.open_time);
        }
        self.buffer.insert(row_key(record), record.clone());
        self.oldest_buffered.get_or_insert_with(Instant::now);

        if self.should_rotate() {
            debug!(buffered = self.buffer.len(), "rotating part");
            self.write_part()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        if self.should_rotate() {
            self.write_part()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Ok(());
        }
        self.write_part()?;
        self.closed = true;
        info!(dir = %self.dir.display(), stem = %self.stem, parts = self.parts_written, "partitioned writer closed");
        Ok(())
    }

    fn max_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError> {
        Ok(self.max_open_time.get(key).copied())
    }
}

/// Write `batches` to `<path>.tmp` and rename it over `path`.
fn write_batches(
    path: &Path,
    format: OutputFormat,
    schema: &SchemaRef,
    batches: &[RecordBatch],
) -> Result<(), WriteError> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp).map_err(|e| WriteError::io(&tmp, e))?;

    match format {
        OutputFormat::Feather => {
            let mut writer = FileWriter::try_new(file, schema)?;
            for batch in batches {
                writer.write(batch)?;
            }
            writer.finish()?;
        }
        _ => {
            let props = WriterProperties::builder()
                .set_compression(parquet::basic::Compression::SNAPPY)
                .build();
            let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
            for batch in batches {
                writer.write(batch)?;
            }
            writer.close()?;
        }
    }
    std::fs::rename(&tmp, path).map_err(|e| WriteError::io(path, e))
}

fn read_part(path: &Path, format: OutputFormat) -> Result<Vec<RecordBatch>, WriteError> {
    let file = File::open(path).map_err(|e| WriteError::io(path, e))?;
    let mut batches = Vec::new();
    match format {
        OutputFormat::Feather => {
            for batch in FileReader::try_new(file, None)? {
                batches.push(batch?);
            }
        }
        _ => {
            for batch in ParquetRecordBatchReaderBuilder::try_new(file)?.build()? {
                batches.push(batch?);
            }
        }
    }
    Ok(batches)
}

/// (series, open_time) of every row of a candle batch.
fn candle_rows(batch: &RecordBatch) -> Result<Vec<(SeriesKey, i64)>, WriteError> {
    let symbols = column::<StringArray>(batch, "symbol")?;
    let timeframes = column::<StringArray>(batch, "timeframe")?;
    let open_times = column::<Int64Array>(batch, "open_time")?;
    (0..batch.num_rows())
        .map(|i| {
            let tf: Timeframe = timeframes
                .value(i)
                .parse()
                .map_err(|e| WriteError::SchemaMismatch(format!("part timeframe: {e}")))?;
            Ok((SeriesKey::new(symbols.value(i), tf), open_times.value(i)))
        })
        .collect()
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T, WriteError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| WriteError::SchemaMismatch(format!("part is missing column {name}")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    fn bar(open_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: "1m".parse().unwrap(),
            open_time,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close,
            volume: 3.0,
            closed: true,
        }
    }

    fn candle(open_time: i64) -> OutputRecord {
        OutputRecord::Candle(bar(open_time, 1.5))
    }

    /// (open_time, close) of every stored row, across all parts.
    fn stored_rows(w: &PartitionedWriter) -> Vec<(i64, f64)> {
        let mut rows = Vec::new();
        for part in w.part_files().unwrap() {
            for batch in read_part(&part, w.format).unwrap() {
                let open_times = column::<Int64Array>(&batch, "open_time").unwrap();
                let closes = column::<Float64Array>(&batch, "close").unwrap();
                for i in 0..batch.num_rows() {
                    rows.push((open_times.value(i), closes.value(i)));
                }
            }
        }
        rows.sort_by_key(|r| r.0);
        rows
    }

    fn rows_in(path: &Path, format: OutputFormat) -> usize {
        read_part(path, format).unwrap().iter().map(|b| b.num_rows()).sum()
    }

    #[test]
    fn rotates_by_row_count_and_resumes() {
        for format in [OutputFormat::Parquet, OutputFormat::Feather] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join(format!("task.{}", format.extension()));

            let mut w = PartitionedWriter::open(&path, format, RecordKind::Candle, 2, Duration::from_secs(3600)).unwrap();
            for t in [0, 60_000, 120_000] {
                w.write(&candle(t)).unwrap();
            }
            assert_eq!(w.part_files().unwrap().len(), 1);
            w.close().unwrap();

            let parts = w.part_files().unwrap();
            assert_eq!(parts.len(), 2);
            let total: usize = parts.iter().map(|p| rows_in(p, format)).sum();
            assert_eq!(total, 3);
            for p in &parts {
                let name = p.file_name().unwrap().to_string_lossy().to_string();
                assert!(name.starts_with("task.part-"), "{name}");
            }

            let reopened = PartitionedWriter::open(&path, format, RecordKind::Candle, 2, Duration::from_secs(3600)).unwrap();
            let key = SeriesKey::new("BTCUSDT", "1m".parse().unwrap());
            assert_eq!(reopened.max_open_time(&key).unwrap(), Some(120_000));
        }
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idle.parquet");
        let mut w = PartitionedWriter::open(&path, OutputFormat::Parquet, RecordKind::Trade, 10, Duration::from_secs(60)).unwrap();
        w.flush().unwrap();
        w.close().unwrap();
        assert!(w.part_files().unwrap().is_empty());
    }

    #[test]
    fn periodic_flushes_wait_for_rotation_limits() {
        use crate::ledger::Ledger;
        use crate::pipeline::RecordWriter;
        use crate::sink::{SharedSink, Sink};
        use parking_lot::Mutex;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backfill.parquet");
        let writer =
            PartitionedWriter::open(&path, OutputFormat::Parquet, RecordKind::Candle, 50_000, Duration::from_secs(3600))
                .unwrap();
        let sink: SharedSink = Arc::new(Mutex::new(Sink::Partitioned(writer)));

        let mut records = RecordWriter::new(Arc::new(Ledger::new()), sink.clone(), false, 20);
        for i in 0..100 {
            records.write_candle(&bar(i * 60_000, 1.0)).unwrap();
        }
        records.flush().unwrap();
        drop(records);

        let mut guard = sink.lock();
        let Sink::Partitioned(w) = &mut *guard else { unreachable!() };
        assert!(w.part_files().unwrap().is_empty());
        w.close().unwrap();
        assert_eq!(w.part_files().unwrap().len(), 1);
        assert_eq!(stored_rows(w).len(), 100);
    }

    #[test]
    fn rewritten_candle_replaces_buffered_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.feather");
        let mut w =
            PartitionedWriter::open(&path, OutputFormat::Feather, RecordKind::Candle, 100, Duration::from_secs(3600))
                .unwrap();
        w.write(&OutputRecord::Candle(bar(0, 1.0))).unwrap();
        w.write(&OutputRecord::Candle(bar(0, 2.0))).unwrap();
        w.close().unwrap();

        assert_eq!(stored_rows(&w), vec![(0, 2.0)]);
    }

    #[test]
    fn rewritten_candle_leaves_its_earlier_part() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.parquet");
        let mut w =
            PartitionedWriter::open(&path, OutputFormat::Parquet, RecordKind::Candle, 2, Duration::from_secs(3600))
                .unwrap();
        w.write(&OutputRecord::Candle(bar(0, 1.0))).unwrap();
        w.write(&OutputRecord::Candle(bar(60_000, 1.0))).unwrap();
        assert_eq!(w.part_files().unwrap().len(), 1);

        w.write(&OutputRecord::Candle(bar(0, 2.0))).unwrap();
        w.close().unwrap();
        assert_eq!(stored_rows(&w), vec![(0, 2.0), (60_000, 1.0)]);

        // A reopened writer indexes the surviving rows and still replaces them.
        let mut reopened =
            PartitionedWriter::open(&path, OutputFormat::Parquet, RecordKind::Candle, 2, Duration::from_secs(3600))
                .unwrap();
        reopened.write(&OutputRecord::Candle(bar(0, 3.0))).unwrap();
        reopened.write(&OutputRecord::Candle(bar(60_000, 3.0))).unwrap();
        reopened.close().unwrap();
        assert_eq!(stored_rows(&reopened), vec![(0, 3.0), (60_000, 3.0)]);
        assert_eq!(reopened.part_files().unwrap().len(), 1);
    }
}
