// =============================================================================
// Shared types used across the Aurora market-data collector
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Known bucket durations, in seconds. `1M` is treated as a flat 30 days.
const TIMEFRAME_TABLE: &[(&str, i64)] = &[
    ("15s", 15),
    ("30s", 30),
    ("1m", 60),
    ("3m", 180),
    ("5m", 300),
    ("15m", 900),
    ("30m", 1_800),
    ("1h", 3_600),
    ("2h", 7_200),
    ("4h", 14_400),
    ("6h", 21_600),
    ("8h", 28_800),
    ("12h", 43_200),
    ("1d", 86_400),
    ("3d", 259_200),
    ("1w", 604_800),
    ("1M", 2_592_000),
];

/// A candle bucket duration, keeping the provider-facing label alongside the
/// duration in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    label: String,
    ms: i64,
}

impl Timeframe {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn as_millis(&self) -> i64 {
        self.ms
    }

    /// Start of the bucket containing `ts_ms`.
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.ms) * self.ms
    }

    /// Closing boundary (exclusive) of the bucket opening at `open_time`.
    pub fn bucket_end(&self, open_time: i64) -> i64 {
        open_time + self.ms
    }
}

impl Default for Timeframe {
    /// One minute.
    fn default() -> Self {
        Self {
            label: "1m".to_string(),
            ms: 60_000,
        }
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim();
        TIMEFRAME_TABLE
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(l, secs)| Timeframe {
                label: (*l).to_string(),
                ms: secs * 1_000,
            })
            .ok_or_else(|| ValidationError::UnknownTimeframe(s.to_string()))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

// ---------------------------------------------------------------------------
// Series identity
// ---------------------------------------------------------------------------

/// Unit of resume and dedup tracking: one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// Candle / Trade
// ---------------------------------------------------------------------------

/// A single OHLCV candle. `open_time` is the bucket start in epoch millis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub closed: bool,
}

impl Candle {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe.clone())
    }

    pub fn close_boundary(&self) -> i64 {
        self.timeframe.bucket_end(self.open_time)
    }

    /// Whether the bucket has fully elapsed at `now_ms`.
    pub fn is_elapsed_at(&self, now_ms: i64) -> bool {
        self.close_boundary() <= now_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// An observed trade. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub id: Option<String>,
    pub timestamp: i64,
    pub price: f64,
    pub amount: f64,
    pub side: TradeSide,
}

impl Trade {
    /// Identity used for dedup: the provider trade id when present, otherwise
    /// the full observed tuple.
    pub fn dedup_key(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{id}", self.symbol),
            None => format!(
                "{}:{}:{}:{}:{}",
                self.symbol, self.timestamp, self.side, self.price, self.amount
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Live-only updates (not persisted)
// ---------------------------------------------------------------------------

/// Top of book for a symbol, derived from a partial-depth push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub update_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub symbol: String,
    pub last: f64,
    pub event_time: i64,
}

/// Anything a push subscription can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Candle(Candle),
    Trade(Trade),
    Ticker(TickerUpdate),
    OrderBook(BookTop),
}

// ---------------------------------------------------------------------------
// Channels and market options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Candle,
    Trade,
    Orderbook,
    Ticker,
}

impl Default for Channel {
    fn default() -> Self {
        Self::Candle
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candle => write!(f, "candle"),
            Self::Trade => write!(f, "trade"),
            Self::Orderbook => write!(f, "orderbook"),
            Self::Ticker => write!(f, "ticker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Swap,
    Future,
    Margin,
    Option,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Spot
    }
}

/// Which price series a candle is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Last,
    Mark,
    Index,
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Last => write!(f, "last"),
            Self::Mark => write!(f, "mark"),
            Self::Index => write!(f, "index"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output records
// ---------------------------------------------------------------------------

/// What a sink instance stores. Fixed at sink creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Candle,
    Trade,
}

/// Sink-agnostic record written through the append/upsert contract.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    Candle(Candle),
    Trade(Trade),
}

impl OutputRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Candle(_) => RecordKind::Candle,
            Self::Trade(_) => RecordKind::Trade,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
