// =============================================================================
// Dedup Ledger — per-series admission pointer and trade dedup window
// =============================================================================
//
// The ledger is the single serialisation point for every candle on its way to
// a sink. Backfill and live tasks may deliver overlapping ranges concurrently;
// ordering per series is decided here by comparing `open_time` against the
// last admitted value.
//
//   open_time <  last  → Reject   (stale or re-delivered)
//   open_time == last  → Overwrite (same bucket, refined values)
//   open_time >  last  → Accept    (pointer advances)
//
// Raw trades are deduplicated per symbol in a bounded FIFO window.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::WriteError;
use crate::sink::{OutputSink, SharedSink};
use crate::types::{Candle, SeriesKey, Trade};

/// Recently admitted open times kept per series.
const RECENT_WINDOW: usize = 64;
/// Trade keys remembered per symbol.
const TRADE_DEDUP_WINDOW: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Overwrite,
    Reject,
}

#[derive(Debug, Default)]
struct LedgerEntry {
    last_open_time: Option<i64>,
    recent: VecDeque<i64>,
    bootstrapped: bool,
}

impl LedgerEntry {
    fn remember(&mut self, open_time: i64) {
        if self.recent.len() == RECENT_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(open_time);
    }
}

#[derive(Debug, Default)]
struct TradeWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl TradeWindow {
    /// `true` if `key` was not in the window (and is now).
    fn insert(&mut self, key: String, capacity: usize) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    series: Mutex<HashMap<SeriesKey, LedgerEntry>>,
    trades: Mutex<HashMap<String, TradeWindow>>,
    trade_window: usize,
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_trade_window(TRADE_DEDUP_WINDOW)
    }

    pub fn with_trade_window(trade_window: usize) -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
            trades: Mutex::new(HashMap::new()),
            trade_window: trade_window.max(1),
        }
    }

    /// Decide what happens to `candle` and advance the series pointer.
    pub fn admit(&self, candle: &Candle) -> Admission {
        let key = candle.series_key();
        let mut series = self.series.lock();
        let entry = series.entry(key).or_default();

        match entry.last_open_time {
            Some(last) if candle.open_time < last => {
                if entry.recent.contains(&candle.open_time) {
                    debug!(
                        symbol = %candle.symbol,
                        tf = %candle.timeframe,
                        open_time = candle.open_time,
                        "duplicate candle rejected"
                    );
                } else {
                    warn!(
                        symbol = %candle.symbol,
                        tf = %candle.timeframe,
                        open_time = candle.open_time,
                        last_open_time = last,
                        "stale candle rejected"
                    );
                }
                Admission::Reject
            }
            Some(last) if candle.open_time == last => Admission::Overwrite,
            _ => {
                entry.last_open_time = Some(candle.open_time);
                entry.remember(candle.open_time);
                Admission::Accept
            }
        }
    }

    pub fn last_open_time(&self, key: &SeriesKey) -> Option<i64> {
        self.series.lock().get(key).and_then(|e| e.last_open_time)
    }

    /// Raise the pointer for `key` to at least `open_time`.
    pub fn seed(&self, key: &SeriesKey, open_time: Option<i64>) {
        let mut series = self.series.lock();
        let entry = series.entry(key.clone()).or_default();
        entry.bootstrapped = true;
        if let Some(t) = open_time {
            if entry.last_open_time.map_or(true, |last| t > last) {
                entry.last_open_time = Some(t);
                entry.remember(t);
            }
        }
    }

    /// Seed `key` from the maximum `open_time` already persisted in `sink`.
    /// The sink is consulted once per series per run.
    pub fn bootstrap(&self, key: &SeriesKey, sink: &SharedSink) -> Result<Option<i64>, WriteError> {
        {
            let series = self.series.lock();
            if let Some(entry) = series.get(key).filter(|e| e.bootstrapped) {
                return Ok(entry.last_open_time);
            }
        }

        // Query without holding the ledger lock.
        let persisted = sink.lock().max_open_time(key)?;
        self.seed(key, persisted);
        let last = self.last_open_time(key);
        info!(series = %key, persisted = ?persisted, last_open_time = ?last, "ledger bootstrapped");
        Ok(last)
    }

    /// `true` the first time a trade is seen within the dedup window.
    pub fn admit_trade(&self, trade: &Trade) -> bool {
        let mut trades = self.trades.lock();
        let window = trades.entry(trade.symbol.clone()).or_default();
        window.insert(trade.dedup_key(), self.trade_window)
    }
}
