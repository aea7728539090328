// =============================================================================
// Record writer — ledger admission in front of a shared sink
// =============================================================================
//
// Every producer (range fetcher, stream dispatcher, trade aggregator output)
// persists through a `RecordWriter`. It drops forming candles unless asked to
// keep them, asks the ledger for admission, writes what survives and flushes
// the sink every `flush_every` persisted records. Dropping the writer flushes
// the sink, so every exit path (error, cancellation) leaves it durable.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::WriteError;
use crate::ledger::{Admission, Ledger};
use crate::sink::{OutputSink, SharedSink};
use crate::types::{Candle, OutputRecord, SeriesKey, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Persisted,
    Overwritten,
    Rejected,
    /// Forming candle not eligible for persistence.
    Forming,
    /// Trade already seen.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub persisted: u64,
    pub overwritten: u64,
    pub rejected: u64,
    pub forming_skipped: u64,
    pub duplicates: u64,
}

impl WriteStats {
    pub fn absorb(&mut self, other: WriteStats) {
        self.persisted += other.persisted;
        self.overwritten += other.overwritten;
        self.rejected += other.rejected;
        self.forming_skipped += other.forming_skipped;
        self.duplicates += other.duplicates;
    }
}

pub struct RecordWriter {
    ledger: Arc<Ledger>,
    sink: SharedSink,
    persist_forming: bool,
    flush_every: usize,
    unflushed: usize,
    stats: WriteStats,
}

impl RecordWriter {
    pub fn new(ledger: Arc<Ledger>, sink: SharedSink, persist_forming: bool, flush_every: usize) -> Self {
        Self {
            ledger,
            sink,
            persist_forming,
            flush_every: flush_every.max(1),
            unflushed: 0,
            stats: WriteStats::default(),
        }
    }

    /// Seed the ledger for `key` from what the sink already holds.
    pub fn bootstrap(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError> {
        self.ledger.bootstrap(key, &self.sink)
    }

    pub fn write_candle(&mut self, candle: &Candle) -> Result<Outcome, WriteError> {
        if !candle.closed && !self.persist_forming {
            self.stats.forming_skipped += 1;
            return Ok(Outcome::Forming);
        }

        // Admission and write happen under the sink guard, so writers sharing
        // the sink store candles in the order the ledger admitted them.
        let mut sink = self.sink.lock();
        let outcome = match self.ledger.admit(candle) {
            Admission::Reject => {
                self.stats.rejected += 1;
                return Ok(Outcome::Rejected);
            }
            Admission::Overwrite => {
                self.stats.overwritten += 1;
                Outcome::Overwritten
            }
            Admission::Accept => {
                self.stats.persisted += 1;
                Outcome::Persisted
            }
        };
        sink.write(&OutputRecord::Candle(candle.clone()))?;
        drop(sink);

        self.after_write()?;
        Ok(outcome)
    }

    pub fn write_trade(&mut self, trade: &Trade) -> Result<Outcome, WriteError> {
        let mut sink = self.sink.lock();
        if !self.ledger.admit_trade(trade) {
            self.stats.duplicates += 1;
            return Ok(Outcome::Duplicate);
        }
        sink.write(&OutputRecord::Trade(trade.clone()))?;
        drop(sink);
        self.stats.persisted += 1;
        self.after_write()?;
        Ok(Outcome::Persisted)
    }

    fn after_write(&mut self) -> Result<(), WriteError> {
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), WriteError> {
        if self.unflushed == 0 {
            return Ok(());
        }
        self.sink.lock().flush()?;
        debug!(records = self.unflushed, "sink flushed");
        self.unflushed = 0;
        Ok(())
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "final sink flush failed");
        }
    }
}
