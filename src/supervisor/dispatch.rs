// =============================================================================
// Stream dispatch — route pushed events to their consumer
// =============================================================================
//
//   Candle    → RecordWriter (ledger decides accept / overwrite / reject)
//   Trade     → ledger dedup → TradeAggregator → closed candles → RecordWriter
//               (or straight to the writer when trades are persisted raw)
//   OrderBook → SnapshotBoard (spread / imbalance, logged only)
//   Ticker    → SnapshotBoard
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::aggregator::{AggregatorStats, TradeAggregator};
use crate::error::WriteError;
use crate::ledger::Ledger;
use crate::pipeline::{RecordWriter, WriteStats};
use crate::types::{BookTop, Candle, SeriesKey, StreamEvent, TickerUpdate, Timeframe, Trade};

// ---------------------------------------------------------------------------
// Snapshot board
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub spread_bps: f64,
    /// (bid_depth - ask_depth) / total, in [-1, 1].
    pub imbalance: f64,
    pub last_update_id: u64,
}

impl BookSnapshot {
    fn from_top(top: &BookTop) -> Self {
        let mid = (top.best_bid + top.best_ask) / 2.0;
        let spread_bps = if mid > 0.0 {
            ((top.best_ask - top.best_bid) / mid) * 10_000.0
        } else {
            0.0
        };

        let total_depth = top.bid_depth + top.ask_depth;
        let imbalance = if total_depth > 0.0 {
            (top.bid_depth - top.ask_depth) / total_depth
        } else {
            0.0
        };

        Self {
            symbol: top.symbol.clone(),
            best_bid: top.best_bid,
            best_ask: top.best_ask,
            bid_depth: top.bid_depth,
            ask_depth: top.ask_depth,
            spread_bps,
            imbalance,
            last_update_id: top.update_id,
        }
    }
}

/// Latest book top and ticker per symbol, shared by every subscription task
/// of one stream run.
#[derive(Default)]
pub struct SnapshotBoard {
    books: RwLock<HashMap<String, BookSnapshot>>,
    tickers: RwLock<HashMap<String, TickerUpdate>>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_book(&self, top: &BookTop) {
        let mut books = self.books.write();
        // Out-of-order pushes carry an older update id.
        if let Some(existing) = books.get(&top.symbol) {
            if top.update_id != 0 && top.update_id < existing.last_update_id {
                return;
            }
        }
        books.insert(top.symbol.clone(), BookSnapshot::from_top(top));
    }

    pub fn update_ticker(&self, ticker: &TickerUpdate) {
        self.tickers.write().insert(ticker.symbol.clone(), ticker.clone());
    }

    pub fn book(&self, symbol: &str) -> Option<BookSnapshot> {
        self.books.read().get(symbol).cloned()
    }

    pub fn ticker(&self, symbol: &str) -> Option<TickerUpdate> {
        self.tickers.read().get(symbol).cloned()
    }

    pub fn log(&self, symbols: &[String]) {
        for symbol in symbols {
            if let Some(b) = self.book(symbol) {
                info!(
                    symbol = %symbol,
                    bid = b.best_bid,
                    ask = b.best_ask,
                    spread_bps = format!("{:.2}", b.spread_bps),
                    imbalance = format!("{:.3}", b.imbalance),
                    "book"
                );
            }
            if let Some(t) = self.ticker(symbol) {
                info!(symbol = %symbol, last = t.last, event_time = t.event_time, "ticker");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Settings the dispatcher needs from the stream configuration.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub trade_to_candle: bool,
    pub timeframe: Timeframe,
    pub persist_forming: bool,
    /// Trades ingested between aggregator flushes.
    pub flush_every: usize,
}

pub struct Dispatcher {
    ledger: Arc<Ledger>,
    writer: Option<RecordWriter>,
    aggregator: Option<TradeAggregator>,
    board: Arc<SnapshotBoard>,
    persist_forming: bool,
    flush_every: usize,
    since_flush: usize,
}

impl Dispatcher {
    /// `writer` is `None` for channels that persist nothing.
    pub fn new(
        ledger: Arc<Ledger>,
        writer: Option<RecordWriter>,
        board: Arc<SnapshotBoard>,
        opts: &DispatchOptions,
    ) -> Self {
        let aggregator = opts
            .trade_to_candle
            .then(|| TradeAggregator::new(opts.timeframe.clone()));
        Self {
            ledger,
            writer,
            aggregator,
            board,
            persist_forming: opts.persist_forming,
            flush_every: opts.flush_every.max(1),
            since_flush: 0,
        }
    }

    pub fn dispatch(&mut self, event: StreamEvent, now_ms: i64) -> Result<(), WriteError> {
        match event {
            StreamEvent::Candle(candle) => self.persist(&candle),
            StreamEvent::Trade(trade) => self.on_trade(&trade, now_ms),
            StreamEvent::OrderBook(top) => {
                self.board.update_book(&top);
                Ok(())
            }
            StreamEvent::Ticker(ticker) => {
                self.board.update_ticker(&ticker);
                Ok(())
            }
        }
    }

    fn on_trade(&mut self, trade: &Trade, now_ms: i64) -> Result<(), WriteError> {
        let Some(aggregator) = self.aggregator.as_mut() else {
            if let Some(writer) = self.writer.as_mut() {
                writer.write_trade(trade)?;
            }
            return Ok(());
        };

        if !self.ledger.admit_trade(trade) {
            debug!(symbol = %trade.symbol, key = %trade.dedup_key(), "duplicate trade skipped");
            return Ok(());
        }
        if let Some(closed) = aggregator.ingest(trade) {
            self.persist(&closed)?;
        }

        self.since_flush += 1;
        if self.since_flush >= self.flush_every {
            self.flush_aggregator(now_ms)?;
        }
        Ok(())
    }

    fn persist(&mut self, candle: &Candle) -> Result<(), WriteError> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_candle(candle).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Close elapsed aggregator buckets; forming buckets are persisted only
    /// when configured, otherwise just logged for liveness.
    fn flush_aggregator(&mut self, now_ms: i64) -> Result<(), WriteError> {
        self.since_flush = 0;
        let Some(aggregator) = self.aggregator.as_mut() else {
            return Ok(());
        };
        let out = aggregator.flush(now_ms);
        for candle in &out.closed {
            self.persist(candle)?;
        }
        for candle in &out.forming {
            if self.persist_forming {
                self.persist(candle)?;
            } else {
                debug!(
                    symbol = %candle.symbol,
                    open_time = candle.open_time,
                    close = candle.close,
                    volume = candle.volume,
                    "forming bucket"
                );
            }
        }
        Ok(())
    }

    /// Periodic tick: aggregator flush plus a sink flush.
    pub fn tick(&mut self, now_ms: i64) -> Result<(), WriteError> {
        self.flush_aggregator(now_ms)?;
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Seed the ledger from the sink for a series this stream persists.
    pub fn bootstrap(&self, key: &SeriesKey) -> Result<Option<i64>, WriteError> {
        match self.writer.as_ref() {
            Some(writer) => writer.bootstrap(key),
            None => Ok(None),
        }
    }

    pub fn board(&self) -> &Arc<SnapshotBoard> {
        &self.board
    }

    pub fn write_stats(&self) -> WriteStats {
        self.writer.as_ref().map(RecordWriter::stats).unwrap_or_default()
    }

    pub fn aggregator_stats(&self) -> AggregatorStats {
        self.aggregator
            .as_ref()
            .map(TradeAggregator::stats)
            .unwrap_or_default()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{OutputSink, SharedSink, Sink, UpsertStore};
    use crate::types::{RecordKind, TradeSide};
    use parking_lot::Mutex;

    fn trade(id: &str, ts: i64, price: f64) -> StreamEvent {
        StreamEvent::Trade(Trade {
            symbol: "BTCUSDT".into(),
            id: Some(id.into()),
            timestamp: ts,
            price,
            amount: 1.0,
            side: TradeSide::Sell,
        })
    }

    fn setup(persist_forming: bool) -> (Dispatcher, SharedSink) {
        let ledger = Arc::new(Ledger::new());
        let sink: SharedSink = Arc::new(Mutex::new(Sink::Upsert(
            UpsertStore::open_in_memory("ohlcv_1m", RecordKind::Candle).unwrap(),
        )));
        let writer = RecordWriter::new(ledger.clone(), sink.clone(), persist_forming, 1);
        let opts = DispatchOptions {
            trade_to_candle: true,
            timeframe: "1m".parse().unwrap(),
            persist_forming,
            flush_every: 1_000,
        };
        let d = Dispatcher::new(ledger, Some(writer), Arc::new(SnapshotBoard::new()), &opts);
        (d, sink)
    }

    fn open_times(sink: &SharedSink) -> Vec<i64> {
        let mut guard = sink.lock();
        guard.flush().unwrap();
        match &*guard {
            Sink::Upsert(s) => s.open_times_for_test(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn trades_aggregate_into_closed_candles() {
        let (mut d, sink) = setup(false);
        d.dispatch(trade("1", 1_000, 100.0), 1_000).unwrap();
        d.dispatch(trade("2", 2_000, 101.0), 2_000).unwrap();
        d.dispatch(trade("3", 61_000, 102.0), 61_000).unwrap();
        assert_eq!(open_times(&sink), vec![0]);
        assert_eq!(d.aggregator_stats().candles_closed, 1);
    }

    #[test]
    fn duplicate_trades_are_not_aggregated_twice() {
        let (mut d, _sink) = setup(false);
        d.dispatch(trade("1", 1_000, 100.0), 1_000).unwrap();
        d.dispatch(trade("1", 1_000, 100.0), 1_000).unwrap();
        assert_eq!(d.aggregator_stats().trades, 1);
    }

    #[test]
    fn tick_closes_elapsed_and_persists_forming_only_when_enabled() {
        let (mut quiet, sink) = setup(false);
        quiet.dispatch(trade("1", 1_000, 100.0), 1_000).unwrap();
        quiet.tick(30_000).unwrap();
        assert!(open_times(&sink).is_empty());
        quiet.tick(60_000).unwrap();
        assert_eq!(open_times(&sink), vec![0]);

        let (mut eager, sink) = setup(true);
        eager.dispatch(trade("1", 1_000, 100.0), 1_000).unwrap();
        eager.tick(30_000).unwrap();
        assert_eq!(open_times(&sink), vec![0]);
        eager.tick(60_000).unwrap();
        assert_eq!(eager.write_stats().overwritten, 1);
    }

    #[test]
    fn book_updates_compute_spread_and_imbalance() {
        let board = Arc::new(SnapshotBoard::new());
        let ledger = Arc::new(Ledger::new());
        let opts = DispatchOptions {
            trade_to_candle: false,
            timeframe: "1m".parse().unwrap(),
            persist_forming: false,
            flush_every: 1,
        };
        let mut d = Dispatcher::new(ledger, None, board.clone(), &opts);
        let top = |id| BookTop {
            symbol: "BTCUSDT".into(),
            best_bid: 99.0,
            best_ask: 101.0,
            bid_depth: 30.0,
            ask_depth: 10.0,
            update_id: id,
        };
        d.dispatch(StreamEvent::OrderBook(top(5)), 0).unwrap();

        let snap = board.book("BTCUSDT").unwrap();
        assert!((snap.spread_bps - 200.0).abs() < 1e-9);
        assert!((snap.imbalance - 0.5).abs() < 1e-9);

        let mut stale = top(4);
        stale.best_bid = 1.0;
        d.dispatch(StreamEvent::OrderBook(stale), 0).unwrap();
        assert_eq!(board.book("BTCUSDT").unwrap().best_bid, 99.0);

        d.dispatch(
            StreamEvent::Ticker(TickerUpdate {
                symbol: "BTCUSDT".into(),
                last: 100.5,
                event_time: 7,
            }),
            0,
        )
        .unwrap();
        assert_eq!(d.board().ticker("BTCUSDT").unwrap().last, 100.5);
    }
}
