// =============================================================================
// Upsert store — SQLite table with a unique key and ON CONFLICT DO UPDATE
// =============================================================================
//
// Candles are keyed by (symbol, timeframe, open_time), trades by
// (symbol, trade_key). Re-emitting a key updates the row in place, which is
// what keeps retries, resumes and ledger overwrites free of duplicates.
// Writes are buffered and committed in one transaction per flush.
// =============================================================================

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::{ensure_parent, OutputSink};
use crate::error::WriteError;
use crate::types::{OutputRecord, RecordKind, SeriesKey};

/// Buffered rows that trigger an implicit flush.
const AUTO_FLUSH_ROWS: usize = 500;

pub struct UpsertStore {
    conn: Connection,
    table: String,
    kind: RecordKind,
    pending: Vec<OutputRecord>,
    closed: bool,
}

impl UpsertStore {
    pub fn open(path: &Path, table: &str, kind: RecordKind) -> Result<Self, WriteError> {
        ensure_parent(path)?;
        let conn = Connection::open(path)?;
        // WAL lets readers follow a live collector.
        if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;") {
            warn!(path = %path.display(), error = %e, "WAL mode unavailable, using default journal");
        }
        info!(path = %path.display(), table = %table, "SQLite store opened");
        Self::with_connection(conn, table, kind)
    }

    pub fn open_in_memory(table: &str, kind: RecordKind) -> Result<Self, WriteError> {
        Self::with_connection(Connection::open_in_memory()?, table, kind)
    }

    fn with_connection(conn: Connection, table: &str, kind: RecordKind) -> Result<Self, WriteError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(WriteError::SchemaMismatch(format!("invalid table name {table:?}")));
        }

        let ddl = match kind {
            RecordKind::Candle => format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    symbol TEXT NOT NULL,
                    timeframe TEXT NOT NULL,
                    open_time INTEGER NOT NULL,
                    open REAL NOT NULL,
                    high REAL NOT NULL,
                    low REAL NOT NULL,
                    close REAL NOT NULL,
                    volume REAL NOT NULL,
                    closed INTEGER NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_unique
                ON {table}(symbol, timeframe, open_time);
                "#
            ),
            RecordKind::Trade => format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    symbol TEXT NOT NULL,
                    trade_key TEXT NOT NULL,
                    trade_id TEXT,
                    timestamp INTEGER NOT NULL,
                    price REAL NOT NULL,
                    amount REAL NOT NULL,
                    side TEXT NOT NULL
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_unique
                ON {table}(symbol, trade_key);
                "#
            ),
        };
        conn.execute_batch(&ddl)?;

        Ok(Self {
            conn,
            table: table.to_string(),
            kind,
            pending: Vec::new(),
            closed: false,
        })
    }

    fn upsert_sql(&self) -> String {
        let t = &self.table;
        match self.kind {
            RecordKind::Candle => format!(
                r#"
                INSERT INTO {t} (symbol, timeframe, open_time, open, high, low, close, volume, closed)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(symbol, timeframe, open_time) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    closed = excluded.closed
                "#
            ),
            RecordKind::Trade => format!(
                r#"
                INSERT INTO {t} (symbol, trade_key, trade_id, timestamp, price, amount, side)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(symbol, trade_key) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    price = excluded.price,
                    amount = excluded.amount,
                    side = excluded.side
                "#
            ),
        }
    }

    /// Rows currently in the table (pending rows excluded).
    #[cfg(test)]
    pub fn row_count(&self) -> Result<i64, WriteError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    #[cfg(test)]
    pub(crate) fn open_times_for_test(&self) -> Vec<i64> {
        let sql = format!("SELECT open_time FROM {} ORDER BY open_time", self.table);
        let mut stmt = self.conn.prepare(&sql).unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }
}

impl OutputSink for UpsertStore {
    fn record_kind(&self) -> RecordKind {
        self.kind
    }

    fn write(&mut self, record: &OutputRecord) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        self.pending.push(record.clone());
        if self.pending.len() >= AUTO_FLUSH_ROWS {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WriteError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let sql = self.upsert_sql();
        let pending = std::mem::take(&mut self.pending);

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for record in &pending {
                match record {
                    OutputRecord::Candle(c) => stmt.execute(params![
                        c.symbol,
                        c.timeframe.label(),
                        c.open_time,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.volume,
                        c.closed,
                    ])?,
                    OutputRecord::Trade(t) => stmt.execute(params![
                        t.symbol,
                        t.dedup_key(),
                        t.id,
                        t.timestamp,
                        t.price,
                        t.amount,
                        t.side.to_string(),
                    ])?,
                };
            }
        }
        tx.commit()?;
        debug!(table = %self.table, rows = pending.len(), "upserted");
        Ok(())
    }

    fn close(&mut self) -> Result<(), WriteError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        Ok(())
    }

    fn max_open_time(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError> {
        if self.kind != RecordKind::Candle {
            return Ok(None);
        }
        let sql = format!(
            "SELECT MAX(open_time) FROM {} WHERE symbol = ?1 AND timeframe = ?2",
            self.table
        );
        let stored: Option<i64> = self
            .conn
            .query_row(&sql, params![key.symbol, key.timeframe.label()], |row| row.get(0))
            .optional()?
            .flatten();

        let buffered = self
            .pending
            .iter()
            .filter_map(|r| match r {
                OutputRecord::Candle(c) if c.symbol == key.symbol && c.timeframe == key.timeframe => {
                    Some(c.open_time)
                }
                _ => None,
            })
            .max();

        Ok(stored.max(buffered))
    }
}
