// =============================================================================
// Trade Aggregator — raw trades into OHLCV buckets, one open bucket per symbol
// =============================================================================
//
// bucket = floor(timestamp / tf) * tf
//
// A trade for a later bucket closes the open one and seeds the next. A trade
// for an earlier bucket cannot be applied (nothing older than the open bucket
// is kept) and is dropped, counted and logged at warn. Flushing closes buckets
// whose interval has elapsed by wall clock, so a quiet symbol still gets its
// candle; trades for a bucket closed that way are late as well.
// =============================================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{Candle, Timeframe, Trade};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub trades: u64,
    pub candles_closed: u64,
    pub late_dropped: u64,
}

/// Result of a periodic flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushOutput {
    /// Buckets closed because their interval elapsed.
    pub closed: Vec<Candle>,
    /// Snapshots of the still-open buckets (`closed == false`).
    pub forming: Vec<Candle>,
}

pub struct TradeAggregator {
    timeframe: Timeframe,
    open: HashMap<String, Candle>,
    /// open_time of the last bucket closed per symbol.
    last_closed: HashMap<String, i64>,
    stats: AggregatorStats,
}

impl TradeAggregator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            open: HashMap::new(),
            last_closed: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    /// Apply one trade. Returns the bucket it closed, if any.
    pub fn ingest(&mut self, trade: &Trade) -> Option<Candle> {
        let bucket = self.timeframe.bucket_start(trade.timestamp);

        let late = match self.open.get(&trade.symbol) {
            Some(current) => bucket < current.open_time,
            None => self
                .last_closed
                .get(&trade.symbol)
                .is_some_and(|closed| bucket <= *closed),
        };
        if late {
            self.stats.late_dropped += 1;
            warn!(
                symbol = %trade.symbol,
                timestamp = trade.timestamp,
                bucket,
                dropped_total = self.stats.late_dropped,
                "trade behind open bucket dropped"
            );
            return None;
        }
        self.stats.trades += 1;

        if let Some(current) = self.open.get_mut(&trade.symbol) {
            if current.open_time == bucket {
                current.high = current.high.max(trade.price);
                current.low = current.low.min(trade.price);
                current.close = trade.price;
                current.volume += trade.amount;
                return None;
            }
        }

        // New bucket: close the previous one, if any.
        let fresh = Candle {
            symbol: trade.symbol.clone(),
            timeframe: self.timeframe.clone(),
            open_time: bucket,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.amount,
            closed: false,
        };
        let previous = self.open.insert(trade.symbol.clone(), fresh);
        previous.map(|prev| self.close_bucket(prev))
    }

    fn close_bucket(&mut self, mut candle: Candle) -> Candle {
        candle.closed = true;
        self.stats.candles_closed += 1;
        self.last_closed.insert(candle.symbol.clone(), candle.open_time);
        debug!(symbol = %candle.symbol, open_time = candle.open_time, "bucket closed");
        candle
    }

    /// Close every bucket whose interval has elapsed at `now_ms` and snapshot
    /// the rest.
    pub fn flush(&mut self, now_ms: i64) -> FlushOutput {
        let elapsed: Vec<String> = self
            .open
            .iter()
            .filter(|(_, c)| c.is_elapsed_at(now_ms))
            .map(|(s, _)| s.clone())
            .collect();

        let mut out = FlushOutput::default();
        for symbol in elapsed {
            if let Some(candle) = self.open.remove(&symbol) {
                out.closed.push(self.close_bucket(candle));
            }
        }
        out.closed.sort_by(|a, b| (a.open_time, &a.symbol).cmp(&(b.open_time, &b.symbol)));

        out.forming = self.open.values().cloned().collect();
        out.forming.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Current open bucket for `symbol`.
    pub fn current(&self, symbol: &str) -> Option<&Candle> {
        self.open.get(symbol)
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }
}
