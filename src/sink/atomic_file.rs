// =============================================================================
// Atomic file writer — whole-file CSV rewrite via temp file + rename
// =============================================================================
//
// The writer owns the complete content of its file: rows already on disk are
// loaded at open, new rows are merged by key (last write wins), and a swap
// writes the full sorted set to `<file>.tmp` before renaming it over the
// target. Readers see either the previous file or the new one.
//
// A swap rewrites the whole file, so periodic flushes swap at most once per
// `swap_interval`; close always swaps pending rows.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info};

use super::{ensure_parent, row_key, Compression, OutputSink, RowKey};
use crate::error::WriteError;
use crate::types::{Candle, OutputRecord, RecordKind, SeriesKey, Trade};

/// Minimum time between two whole-file swaps triggered by `flush`.
pub const SWAP_INTERVAL: Duration = Duration::from_secs(60);

pub struct AtomicFileWriter {
    path: PathBuf,
    kind: RecordKind,
    compression: Compression,
    rows: BTreeMap<RowKey, OutputRecord>,
    max_open_time: HashMap<SeriesKey, i64>,
    swap_interval: Duration,
    last_swap: Instant,
    dirty: bool,
    closed: bool,
}

impl AtomicFileWriter {
    pub fn open(
        path: &Path,
        kind: RecordKind,
        compression: Compression,
        swap_interval: Duration,
    ) -> Result<Self, WriteError> {
        let mut writer = Self {
            path: path.to_path_buf(),
            kind,
            compression,
            rows: BTreeMap::new(),
            max_open_time: HashMap::new(),
            swap_interval,
            last_swap: Instant::now(),
            dirty: false,
            closed: false,
        };

        if path.exists() {
            let file = File::open(path).map_err(|e| WriteError::io(path, e))?;
            let reader: Box<dyn Read> = match compression {
                Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(file))),
                Compression::None => Box::new(BufReader::new(file)),
            };
            let existing = read_records(reader, kind)?;
            info!(path = %path.display(), rows = existing.len(), "loaded existing CSV rows");
            for record in existing {
                writer.insert(record);
            }
        }

        Ok(writer)
    }

    fn insert(&mut self, record: OutputRecord) {
        if let OutputRecord::Candle(c) = &record {
            let max = self.max_open_time.entry(c.series_key()).or_insert(c.open_time);
            *max = (*max).max(c.open_time);
        }
        self.rows.insert(row_key(&record), record);
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    fn swap(&mut self) -> Result<(), WriteError> {
        if !self.dirty {
            return Ok(());
        }
        ensure_parent(&self.path)?;
        let tmp = self.tmp_path();
        let file = File::create(&tmp).map_err(|e| WriteError::io(&tmp, e))?;

        let file = match self.compression {
            Compression::Gzip => {
                let encoder = GzEncoder::new(BufWriter::new(file), flate2::Compression::default());
                let encoder = write_records(encoder, self.rows.values(), &tmp)?;
                let buffered = encoder.finish().map_err(|e| WriteError::io(&tmp, e))?;
                buffered
                    .into_inner()
                    .map_err(|e| WriteError::io(&tmp, e.into_error()))?
            }
            Compression::None => write_records(BufWriter::new(file), self.rows.values(), &tmp)?
                .into_inner()
                .map_err(|e| WriteError::io(&tmp, e.into_error()))?,
        };
        file.sync_all().map_err(|e| WriteError::io(&tmp, e))?;
        drop(file);

        std::fs::rename(&tmp, &self.path).map_err(|e| WriteError::io(&self.path, e))?;
        self.dirty = false;
        self.last_swap = Instant::now();
        debug!(path = %self.path.display(), rows = self.rows.len(), "CSV swapped in");
        Ok(())
    }
}

impl OutputSink for AtomicFileWriter {
    fn record_kind(&self) -> RecordKind {
        self.kind
    }

    fn write(&mut self, record: &OutputRecord) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.insert(record.clone());
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        if self.last_swap.elapsed() < self.swap_interval {
            return Ok(());
        }
        self.swap()
    }

    fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Ok(());
        }
        self.swap()?;
        self.closed = true;
        Ok(())
    }

    fn max_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError> {
        Ok(self.max_open_time.get(key).copied())
    }
}

fn write_records<'a, W: Write>(
    sink: W,
    rows: impl Iterator<Item = &'a OutputRecord>,
    path: &Path,
) -> Result<W, WriteError> {
    let mut wtr = csv::Writer::from_writer(sink);
    for row in rows {
        match row {
            OutputRecord::Candle(c) => wtr.serialize(c)?,
            OutputRecord::Trade(t) => wtr.serialize(t)?,
        }
    }
    wtr.flush().map_err(|e| WriteError::io(path, e))?;
    wtr.into_inner()
        .map_err(|e| WriteError::io(path, e.into_error()))
}

fn read_records(reader: impl Read, kind: RecordKind) -> Result<Vec<OutputRecord>, WriteError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut out = Vec::new();
    match kind {
        RecordKind::Candle => {
            for row in rdr.deserialize::<Candle>() {
                out.push(OutputRecord::Candle(row?));
            }
        }
        RecordKind::Trade => {
            for row in rdr.deserialize::<Trade>() {
                out.push(OutputRecord::Trade(row?));
            }
        }
    }
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;

    fn candle(open_time: i64, close: f64) -> OutputRecord {
        OutputRecord::Candle(Candle {
            symbol: "BTCUSDT".into(),
            timeframe: "1m".parse().unwrap(),
            open_time,
            open: 1.0,
            high: close.max(1.0),
            low: 1.0,
            close,
            volume: 2.0,
            closed: true,
        })
    }

    #[test]
    fn flush_replaces_file_and_reopen_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("btc.csv");

        let mut w = AtomicFileWriter::open(&path, RecordKind::Candle, Compression::None, SWAP_INTERVAL).unwrap();
        w.write(&candle(120_000, 3.0)).unwrap();
        w.write(&candle(60_000, 2.0)).unwrap();
        w.write(&candle(60_000, 2.5)).unwrap();
        w.close().unwrap();
        assert!(!w.tmp_path().exists());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3, "header + two unique rows: {text}");
        assert!(lines[1].contains(",60000,"));
        assert!(lines[1].contains("2.5"));

        let key = SeriesKey::new("BTCUSDT", "1m".parse().unwrap());
        let reopened = AtomicFileWriter::open(&path, RecordKind::Candle, Compression::None, SWAP_INTERVAL).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.max_open_time(&key).unwrap(), Some(120_000));
    }

    #[test]
    fn gzip_round_trip_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv.gz");
        let trade = OutputRecord::Trade(Trade {
            symbol: "ETHUSDT".into(),
            id: None,
            timestamp: 5,
            price: 10.0,
            amount: 0.5,
            side: TradeSide::Sell,
        });

        let mut w = AtomicFileWriter::open(&path, RecordKind::Trade, Compression::Gzip, SWAP_INTERVAL).unwrap();
        w.write(&trade).unwrap();
        w.write(&trade).unwrap();
        w.close().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);

        let reopened = AtomicFileWriter::open(&path, RecordKind::Trade, Compression::Gzip, SWAP_INTERVAL).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        let mut w = AtomicFileWriter::open(&path, RecordKind::Candle, Compression::None, SWAP_INTERVAL).unwrap();
        w.close().unwrap();
        assert!(matches!(w.write(&candle(0, 1.0)), Err(WriteError::Closed)));
        assert!(w.close().is_ok());
    }

    #[test]
    fn periodic_flush_waits_for_swap_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.csv");
        let mut w = AtomicFileWriter::open(&path, RecordKind::Candle, Compression::None, SWAP_INTERVAL).unwrap();
        for i in 0..50 {
            w.write(&candle(i * 60_000, 1.0)).unwrap();
            w.flush().unwrap();
        }
        assert!(!path.exists());
        w.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 51);

        let eager_path = dir.path().join("eager.csv");
        let mut eager =
            AtomicFileWriter::open(&eager_path, RecordKind::Candle, Compression::None, Duration::ZERO).unwrap();
        eager.write(&candle(0, 1.0)).unwrap();
        eager.flush().unwrap();
        assert!(eager_path.exists());
    }
}
