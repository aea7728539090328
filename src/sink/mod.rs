// =============================================================================
// Output sinks — atomic file, partitioned columnar, upsert store
// =============================================================================
//
// Every sink speaks the same contract (write / flush / close / max_open_time)
// and is selected once, from configuration, as a variant of `Sink`. Sinks are
// shared across tasks of a run through the `SinkRegistry`, one instance per
// output target, behind a mutex.
//
// A `Sink` that is dropped without an explicit close flushes and closes
// itself; errors at that point can only be logged.
// =============================================================================

pub mod atomic_file;
pub mod partitioned;
pub mod upsert;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::WriteError;
use crate::types::{OutputRecord, RecordKind, SeriesKey};

/// (series or symbol, time, discriminator). Sorts rows by series then time;
/// two records with the same key are the same row.
pub(crate) type RowKey = (String, i64, String);

pub(crate) fn candle_row_key(key: &SeriesKey, open_time: i64) -> RowKey {
    (key.to_string(), open_time, String::new())
}

pub(crate) fn row_key(record: &OutputRecord) -> RowKey {
    match record {
        OutputRecord::Candle(c) => candle_row_key(&c.series_key(), c.open_time),
        OutputRecord::Trade(t) => (t.symbol.clone(), t.timestamp, t.dedup_key()),
    }
}

pub use atomic_file::AtomicFileWriter;
pub use partitioned::PartitionedWriter;
pub use upsert::UpsertStore;

// ---------------------------------------------------------------------------
// Configuration-facing types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Parquet,
    Feather,
    Sqlite,
}

impl OutputFormat {
    /// Infer the format from a path extension (`.csv.gz` counts as CSV).
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        let ext = Path::new(name).extension()?.to_str()?;
        match ext {
            "csv" => Some(Self::Csv),
            "parquet" | "pq" => Some(Self::Parquet),
            "feather" | "arrow" | "ipc" => Some(Self::Feather),
            "sqlite" | "sqlite3" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
            Self::Feather => "feather",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn sink_kind(self) -> SinkKind {
        match self {
            Self::Csv => SinkKind::Atomic,
            Self::Parquet | Self::Feather => SinkKind::Partitioned,
            Self::Sqlite => SinkKind::Upsert,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Atomic,
    Partitioned,
    Upsert,
}

/// Fully resolved output target for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSpec {
    pub format: OutputFormat,
    pub path: PathBuf,
    /// SQLite table; ignored by file sinks.
    pub table: String,
    pub compression: Compression,
    /// Partitioned sinks rotate a part after this many buffered records...
    pub rotate_rows: usize,
    /// ...or once the oldest buffered record is this old.
    pub rotate_interval: Duration,
}

impl SinkSpec {
    /// Identity used to share one sink between tasks.
    pub fn target_id(&self) -> String {
        match self.format {
            OutputFormat::Sqlite => format!("{}#{}", self.path.display(), self.table),
            _ => self.path.display().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

pub trait OutputSink: Send {
    fn record_kind(&self) -> RecordKind;

    /// Buffer or persist one record. Records with an already-stored key
    /// replace the stored values.
    fn write(&mut self, record: &OutputRecord) -> Result<(), WriteError>;

    /// Checkpoint. File sinks may hold records back until their own
    /// rotation or swap limits are reached; `close` persists everything.
    fn flush(&mut self) -> Result<(), WriteError>;

    /// Flush and release resources. Idempotent.
    fn close(&mut self) -> Result<(), WriteError>;

    /// Highest persisted (or buffered) `open_time` for `key`.
    fn max_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError>;
}

/// Sink variant chosen at configuration time.
pub enum Sink {
    Atomic(AtomicFileWriter),
    Partitioned(PartitionedWriter),
    Upsert(UpsertStore),
}

impl Sink {
    pub fn open(spec: &SinkSpec, kind: RecordKind) -> Result<Self, WriteError> {
        let sink = match spec.format.sink_kind() {
            SinkKind::Atomic => Self::Atomic(AtomicFileWriter::open(
                &spec.path,
                kind,
                spec.compression,
                atomic_file::SWAP_INTERVAL,
            )?),
            SinkKind::Partitioned => Self::Partitioned(PartitionedWriter::open(
                &spec.path,
                spec.format,
                kind,
                spec.rotate_rows,
                spec.rotate_interval,
            )?),
            SinkKind::Upsert => Self::Upsert(UpsertStore::open(&spec.path, &spec.table, kind)?),
        };
        info!(
            target = %spec.target_id(),
            format = ?spec.format,
            sink = ?sink.kind(),
            kind = ?kind,
            "sink opened"
        );
        Ok(sink)
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            Self::Atomic(_) => SinkKind::Atomic,
            Self::Partitioned(_) => SinkKind::Partitioned,
            Self::Upsert(_) => SinkKind::Upsert,
        }
    }

    fn inner(&self) -> &dyn OutputSink {
        match self {
            Self::Atomic(s) => s,
            Self::Partitioned(s) => s,
            Self::Upsert(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn OutputSink {
        match self {
            Self::Atomic(s) => s,
            Self::Partitioned(s) => s,
            Self::Upsert(s) => s,
        }
    }
}

impl OutputSink for Sink {
    fn record_kind(&self) -> RecordKind {
        self.inner().record_kind()
    }

    fn write(&mut self, record: &OutputRecord) -> Result<(), WriteError> {
        if record.kind() != self.record_kind() {
            return Err(WriteError::SchemaMismatch(format!(
                "{:?} record sent to a {:?} sink",
                record.kind(),
                self.record_kind()
            )));
        }
        self.inner_mut().write(record)
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        self.inner_mut().flush()
    }

    fn close(&mut self) -> Result<(), WriteError> {
        self.inner_mut().close()
    }

    fn max_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError> {
        self.inner().max_open_time(key)
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close sink on drop");
        }
    }
}

pub type SharedSink = Arc<Mutex<Sink>>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One sink per output target for the whole run.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<HashMap<String, (RecordKind, SharedSink)>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sink for `spec`, opened on first use.
    pub fn acquire(&self, spec: &SinkSpec, kind: RecordKind) -> Result<SharedSink, WriteError> {
        let id = spec.target_id();
        let mut sinks = self.sinks.lock();
        if let Some((existing_kind, sink)) = sinks.get(&id) {
            if *existing_kind != kind {
                return Err(WriteError::SchemaMismatch(format!(
                    "{id} already holds {existing_kind:?} records, cannot add {kind:?}"
                )));
            }
            return Ok(sink.clone());
        }
        let sink = Arc::new(Mutex::new(Sink::open(spec, kind)?));
        sinks.insert(id, (kind, sink.clone()));
        Ok(sink)
    }

    /// Close every sink. All are attempted; the failures are returned.
    pub fn close_all(&self) -> Vec<(String, WriteError)> {
        let sinks: Vec<(String, SharedSink)> = self
            .sinks
            .lock()
            .drain()
            .map(|(id, (_, sink))| (id, sink))
            .collect();

        let mut failures = Vec::new();
        for (id, sink) in sinks {
            if let Err(e) = sink.lock().close() {
                error!(target = %id, error = %e, "sink close failed");
                failures.push((id, e));
            }
        }
        failures
    }
}

/// Create the parent directory of `path` if missing.
pub(crate) fn ensure_parent(path: &Path) -> Result<(), WriteError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| WriteError::io(parent, e))?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: PathBuf, format: OutputFormat) -> SinkSpec {
        SinkSpec {
            format,
            path,
            table: "ohlcv_1m".into(),
            compression: Compression::None,
            rotate_rows: 100,
            rotate_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn format_inferred_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a/b.csv")), Some(OutputFormat::Csv));
        assert_eq!(OutputFormat::from_path(Path::new("b.csv.gz")), Some(OutputFormat::Csv));
        assert_eq!(OutputFormat::from_path(Path::new("b.parquet")), Some(OutputFormat::Parquet));
        assert_eq!(OutputFormat::from_path(Path::new("b.feather")), Some(OutputFormat::Feather));
        assert_eq!(OutputFormat::from_path(Path::new("b.db")), Some(OutputFormat::Sqlite));
        assert_eq!(OutputFormat::from_path(Path::new("b.txt")), None);
    }

    #[test]
    fn registry_shares_one_sink_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SinkRegistry::new();
        let s = spec(dir.path().join("out.csv"), OutputFormat::Csv);

        let a = registry.acquire(&s, RecordKind::Candle).unwrap();
        let b = registry.acquire(&s, RecordKind::Candle).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().kind(), SinkKind::Atomic);

        assert!(matches!(
            registry.acquire(&s, RecordKind::Trade),
            Err(WriteError::SchemaMismatch(_))
        ));
        assert!(registry.close_all().is_empty());
    }

    #[test]
    fn sink_rejects_wrong_record_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(&spec(dir.path().join("t.csv"), OutputFormat::Csv), RecordKind::Trade).unwrap();
        let candle = crate::types::Candle {
            symbol: "BTCUSDT".into(),
            timeframe: "1m".parse().unwrap(),
            open_time: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            closed: true,
        };
        assert!(matches!(
            sink.write(&OutputRecord::Candle(candle)),
            Err(WriteError::SchemaMismatch(_))
        ));
    }
}
