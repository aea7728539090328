// =============================================================================
// Batch Configuration — task list with shared defaults, loaded from JSON
// =============================================================================
//
// File shape:
//
//   {
//     "max_concurrent_fetches": 4,
//     "defaults": { "exchange": "binance", "timeframe": "1m", ... },
//     "tasks": [ { "name": "btc-backfill", "mode": "historical", ... }, ... ]
//   }
//
// Each task is the shallow merge `defaults ⊕ task` (task keys win), then
// deserialised into a typed `TaskConfig`. Every field carries a serde default
// so a task only states what differs.
//
// Credentials never come from this file: `api_key`, `secret` and `password`
// keys fail validation. Providers read them from the environment.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::backoff::BackoffPolicy;
use crate::context::DEFAULT_MAX_CONCURRENT_FETCHES;
use crate::error::ValidationError;
use crate::fetcher::FetchRequest;
use crate::provider::ExchangeSettings;
use crate::sink::{Compression, OutputFormat, SinkSpec};
use crate::supervisor::StreamConfig;
use crate::types::{Channel, PriceSource, RecordKind, Timeframe};

/// Environment variable naming the batch file.
pub const CONFIG_PATH_ENV: &str = "AURORA_BATCH_CONFIG";
/// Optional comma list restricting which tasks run.
pub const TASK_FILTER_ENV: &str = "AURORA_TASKS";
pub const DEFAULT_CONFIG_PATH: &str = "batch.json";

const CREDENTIAL_KEYS: &[&str] = &["api_key", "apikey", "secret", "password", "uid"];

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_flush_every() -> usize {
    20
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_stability_window_secs() -> u64 {
    60
}

fn default_rotate_rows() -> usize {
    50_000
}

fn default_rotate_interval_secs() -> u64 {
    3_600
}

fn default_max_concurrent_fetches() -> usize {
    DEFAULT_MAX_CONCURRENT_FETCHES
}

// =============================================================================
// Task configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Bounded REST backfill.
    #[default]
    #[serde(alias = "rest")]
    Historical,
    Stream,
}

/// Where and how a task persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Inferred from the path extension when absent, CSV otherwise.
    #[serde(default)]
    pub format: Option<OutputFormat>,

    /// Defaults to `data/<task name>.<ext>`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// SQLite table. Defaults to `ohlcv_<timeframe>` or `trades`.
    #[serde(default)]
    pub table: Option<String>,

    #[serde(default)]
    pub compression: Compression,

    #[serde(default = "default_rotate_rows")]
    pub rotate_rows: usize,

    #[serde(default = "default_rotate_interval_secs")]
    pub rotate_interval_secs: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: None,
            path: None,
            table: None,
            compression: Compression::None,
            rotate_rows: default_rotate_rows(),
            rotate_interval_secs: default_rotate_interval_secs(),
        }
    }
}

/// One task after the defaults merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub mode: TaskMode,

    // --- Venue ----------------------------------------------------------------

    #[serde(flatten)]
    pub exchange: ExchangeSettings,

    // --- Series ---------------------------------------------------------------

    /// Single symbol shorthand; merged in front of `symbols`.
    #[serde(default)]
    pub symbol: Option<String>,

    #[serde(default)]
    pub symbols: Vec<String>,

    /// Defaults to 1m.
    #[serde(default)]
    pub timeframe: Timeframe,

    #[serde(default)]
    pub price_source: Option<PriceSource>,

    // --- Historical -----------------------------------------------------------

    /// RFC 3339 or `YYYY-MM-DD` (UTC midnight).
    #[serde(default)]
    pub start: Option<String>,

    /// Exclusive. Defaults to now.
    #[serde(default)]
    pub end: Option<String>,

    #[serde(default)]
    pub page_limit: Option<u32>,

    /// Keep the still-forming candle (historical) / persist forming candles
    /// (stream).
    #[serde(default)]
    pub keep_forming: bool,

    // --- Stream ---------------------------------------------------------------

    #[serde(default)]
    pub channel: Channel,

    #[serde(default)]
    pub trade_to_candle: bool,

    /// Order book levels for the orderbook channel.
    #[serde(default)]
    pub depth: Option<u32>,

    /// Unset or zero runs until interrupted.
    #[serde(default)]
    pub duration_secs: Option<u64>,

    #[serde(default)]
    pub max_messages: Option<u64>,

    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Continuous subscription time after which the reconnect counter resets.
    #[serde(default = "default_stability_window_secs")]
    pub stability_window_secs: u64,

    // --- Shared ---------------------------------------------------------------

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl TaskConfig {
    /// `symbol` followed by `symbols`, trimmed, empties and repeats removed.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in self.symbol.iter().chain(self.symbols.iter()) {
            for part in s.split(',') {
                let part = part.trim();
                if !part.is_empty() && !out.iter().any(|x| x == part) {
                    out.push(part.to_string());
                }
            }
        }
        out
    }

    /// What this task writes, if anything.
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self.mode {
            TaskMode::Historical => Some(RecordKind::Candle),
            TaskMode::Stream => self.stream_config().record_kind(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.symbols().is_empty() {
            return Err(ValidationError::MissingField("symbols"));
        }
        if self.flush_every == 0 {
            return Err(ValidationError::Invalid("flush_every must be positive".into()));
        }
        self.exchange
            .preset()
            .check_price_source(&self.exchange.id, self.price_source)?;

        match self.mode {
            TaskMode::Historical => {
                // "now" is not known yet; an open end only has to be past start.
                self.fetch_requests(i64::MAX)?;
            }
            TaskMode::Stream => {
                if self.trade_to_candle && self.channel != Channel::Trade {
                    return Err(ValidationError::Invalid(format!(
                        "trade_to_candle needs the trade channel, got {}",
                        self.channel
                    )));
                }
                if self.max_messages == Some(0) {
                    return Err(ValidationError::Invalid("max_messages must be positive".into()));
                }
            }
        }

        if self.record_kind().is_some() {
            self.sink_spec()?;
        }
        Ok(())
    }

    /// One backfill request per symbol. `now_ms` stands in for a missing end.
    pub fn fetch_requests(&self, now_ms: i64) -> Result<Vec<FetchRequest>, ValidationError> {
        let start = self
            .start
            .as_deref()
            .ok_or(ValidationError::MissingField("start"))
            .and_then(parse_timestamp)?;
        let end = match self.end.as_deref() {
            Some(s) => parse_timestamp(s)?,
            None => now_ms,
        };

        let requests: Vec<FetchRequest> = self
            .symbols()
            .into_iter()
            .map(|symbol| FetchRequest {
                symbol,
                timeframe: self.timeframe.clone(),
                start,
                end,
                page_limit: self.page_limit,
                keep_forming: self.keep_forming,
                price_source: self.price_source,
            })
            .collect();
        for r in &requests {
            r.validate()?;
        }
        Ok(requests)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            symbols: self.symbols(),
            channel: self.channel,
            timeframe: self.timeframe.clone(),
            depth: self.depth,
            trade_to_candle: self.trade_to_candle,
            persist_forming: self.keep_forming,
            duration: self
                .duration_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_messages: self.max_messages,
            flush_every: self.flush_every,
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            metrics_interval: Duration::from_secs(self.metrics_interval_secs.max(1)),
            stability_window: Duration::from_secs(self.stability_window_secs),
            backoff: self.backoff.clone(),
        }
    }

    /// Resolved output target: format, default path and default table.
    pub fn sink_spec(&self) -> Result<SinkSpec, ValidationError> {
        let out = &self.output;
        let format = out
            .format
            .or_else(|| out.path.as_deref().and_then(OutputFormat::from_path))
            .unwrap_or(OutputFormat::Csv);

        if out.compression == Compression::Gzip && format != OutputFormat::Csv {
            return Err(ValidationError::Invalid(format!(
                "gzip compression applies to csv output only, not {}",
                format.extension()
            )));
        }

        let path = match &out.path {
            Some(p) => p.clone(),
            None => {
                let ext = match (format, out.compression) {
                    (OutputFormat::Csv, Compression::Gzip) => "csv.gz",
                    (f, _) => f.extension(),
                };
                Path::new("data").join(format!("{}.{ext}", file_stem(&self.name)))
            }
        };

        let table = match &out.table {
            Some(t) => t.clone(),
            None if self.record_kind() == Some(RecordKind::Trade) => "trades".to_string(),
            None => format!("ohlcv_{}", self.timeframe.label()),
        };

        Ok(SinkSpec {
            format,
            path,
            table,
            compression: out.compression,
            rotate_rows: out.rotate_rows.max(1),
            rotate_interval: Duration::from_secs(out.rotate_interval_secs.max(1)),
        })
    }
}

fn file_stem(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or `YYYY-MM-DD` (UTC midnight), to
/// epoch milliseconds.
pub fn parse_timestamp(s: &str) -> Result<i64, ValidationError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
        .ok_or_else(|| ValidationError::BadTimestamp(s.to_string()))
}

// =============================================================================
// Batch file
// =============================================================================

#[derive(Debug, Deserialize)]
struct BatchFile {
    #[serde(default)]
    defaults: Map<String, Value>,

    tasks: Vec<Map<String, Value>>,

    #[serde(default = "default_max_concurrent_fetches")]
    max_concurrent_fetches: usize,
}

/// Validated batch, ready to run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub tasks: Vec<TaskConfig>,
    pub max_concurrent_fetches: usize,
}

fn reject_inline_credentials(map: &Map<String, Value>) -> Result<(), ValidationError> {
    match CREDENTIAL_KEYS.iter().find(|k| map.contains_key(**k)) {
        Some(key) => Err(ValidationError::InlineCredentials((*key).to_string())),
        None => Ok(()),
    }
}

/// `defaults ⊕ task`, task keys win. Nested objects are replaced, not merged.
fn merge_defaults(defaults: &Map<String, Value>, task: Map<String, Value>) -> Map<String, Value> {
    let mut out = defaults.clone();
    out.extend(task);
    out
}

impl BatchConfig {
    /// Load and validate the batch at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read batch config from {}", path.display()))?;

        let config = Self::from_json(&content)
            .with_context(|| format!("invalid batch config {}", path.display()))?;

        info!(
            path = %path.display(),
            tasks = config.tasks.len(),
            max_concurrent_fetches = config.max_concurrent_fetches,
            "batch config loaded"
        );

        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: BatchFile = serde_json::from_str(content).context("failed to parse batch JSON")?;
        reject_inline_credentials(&file.defaults)?;

        let mut tasks = Vec::with_capacity(file.tasks.len());
        for (index, raw) in file.tasks.into_iter().enumerate() {
            reject_inline_credentials(&raw)
                .with_context(|| format!("task #{index}"))?;
            let merged = merge_defaults(&file.defaults, raw);

            let task: TaskConfig = serde_json::from_value(Value::Object(merged))
                .with_context(|| format!("task #{index} does not match the task schema"))?;
            task.validate()
                .with_context(|| format!("task #{index} ({:?}) is invalid", task.name))?;
            tasks.push(task);
        }

        if let Some(dup) = tasks
            .iter()
            .enumerate()
            .find(|(i, t)| tasks[..*i].iter().any(|o| o.name == t.name))
            .map(|(_, t)| t.name.clone())
        {
            return Err(ValidationError::Invalid(format!("duplicate task name {dup:?}")).into());
        }

        Ok(Self {
            tasks,
            max_concurrent_fetches: file.max_concurrent_fetches.max(1),
        })
    }

    /// Keep only the named tasks. Unknown names are an error.
    pub fn select(&mut self, names: &[String]) -> Result<(), ValidationError> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(missing) = names.iter().find(|n| !self.tasks.iter().any(|t| &t.name == *n)) {
            return Err(ValidationError::Invalid(format!("no task named {missing:?}")));
        }
        self.tasks.retain(|t| names.contains(&t.name));
        Ok(())
    }
}

/// Parse the `AURORA_TASKS` comma list.
pub fn task_filter(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;

    const BATCH: &str = r#"{
        "defaults": {
            "exchange": "binance",
            "timeframe": "1h",
            "output": { "format": "sqlite", "path": "data/all.sqlite" }
        },
        "tasks": [
            {
                "name": "btc-backfill",
                "mode": "rest",
                "symbol": "BTCUSDT",
                "start": "2024-01-01",
                "end": "2024-01-02T00:00:00Z"
            },
            {
                "name": "majors-live",
                "mode": "stream",
                "symbols": ["BTCUSDT", "ETHUSDT"],
                "timeframe": "1m",
                "market_type": "swap",
                "channel": "trade",
                "trade_to_candle": true,
                "duration_secs": 120,
                "output": { "path": "data/live.parquet" }
            }
        ]
    }"#;

    #[test]
    fn defaults_merge_shallowly_with_task_precedence() {
        let cfg = BatchConfig::from_json(BATCH).unwrap();
        assert_eq!(cfg.tasks.len(), 2);
        assert_eq!(cfg.max_concurrent_fetches, DEFAULT_MAX_CONCURRENT_FETCHES);

        let backfill = &cfg.tasks[0];
        assert_eq!(backfill.mode, TaskMode::Historical);
        assert_eq!(backfill.timeframe.label(), "1h");
        assert_eq!(backfill.exchange.id, "binance");
        let spec = backfill.sink_spec().unwrap();
        assert_eq!(spec.format, OutputFormat::Sqlite);
        assert_eq!(spec.table, "ohlcv_1h");

        let live = &cfg.tasks[1];
        assert_eq!(live.mode, TaskMode::Stream);
        assert_eq!(live.timeframe.label(), "1m");
        assert_eq!(live.exchange.market_type, MarketType::Swap);
        // `output` replaced wholesale: format comes from the new path.
        assert_eq!(live.sink_spec().unwrap().format, OutputFormat::Parquet);

        let stream = live.stream_config();
        assert_eq!(stream.duration, Some(Duration::from_secs(120)));
        assert_eq!(stream.record_kind(), Some(RecordKind::Candle));
        assert_eq!(stream.flush_every, 20);
    }

    #[test]
    fn historical_requests_one_per_symbol() {
        let cfg = BatchConfig::from_json(BATCH).unwrap();
        let reqs = cfg.tasks[0].fetch_requests(1).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].start, 1_704_067_200_000);
        assert_eq!(reqs[0].end, 1_704_153_600_000);
        assert!(!reqs[0].keep_forming);
    }

    #[test]
    fn inline_credentials_are_rejected() {
        let json = r#"{ "tasks": [ { "name": "t", "symbol": "BTCUSDT",
            "start": "2024-01-01", "api_key": "abc" } ] }"#;
        let err = BatchConfig::from_json(json).unwrap_err();
        let root = err.root_cause().downcast_ref::<ValidationError>();
        assert!(matches!(root, Some(ValidationError::InlineCredentials(k)) if k == "api_key"));

        let json = r#"{ "defaults": { "secret": "s" }, "tasks": [] }"#;
        assert!(BatchConfig::from_json(json).is_err());
    }

    #[test]
    fn default_output_path_and_tables() {
        let json = r#"{ "tasks": [
            { "name": "raw trades", "mode": "stream", "symbol": "BTCUSDT",
              "channel": "trade", "output": { "format": "sqlite" } },
            { "name": "gz", "symbol": "BTCUSDT", "start": "2024-01-01",
              "output": { "compression": "gzip" } }
        ] }"#;
        let cfg = BatchConfig::from_json(json).unwrap();

        let trades = cfg.tasks[0].sink_spec().unwrap();
        assert_eq!(trades.path, PathBuf::from("data/raw_trades.sqlite"));
        assert_eq!(trades.table, "trades");

        let gz = cfg.tasks[1].sink_spec().unwrap();
        assert_eq!(gz.format, OutputFormat::Csv);
        assert_eq!(gz.path, PathBuf::from("data/gz.csv.gz"));
    }

    #[test]
    fn invalid_tasks_fail_validation() {
        let cases = [
            // unknown timeframe
            r#"{ "tasks": [ { "name": "a", "symbol": "X", "start": "2024-01-01", "timeframe": "7m" } ] }"#,
            // historical without start
            r#"{ "tasks": [ { "name": "a", "symbol": "X" } ] }"#,
            // inverted range
            r#"{ "tasks": [ { "name": "a", "symbol": "X", "start": "2024-02-01", "end": "2024-01-01" } ] }"#,
            // price source not served by the venue
            r#"{ "tasks": [ { "name": "a", "symbol": "X", "start": "2024-01-01", "exchange": "kraken", "price_source": "mark" } ] }"#,
            // aggregation needs the trade channel
            r#"{ "tasks": [ { "name": "a", "mode": "stream", "symbol": "X", "trade_to_candle": true } ] }"#,
            // no symbols
            r#"{ "tasks": [ { "name": "a", "start": "2024-01-01" } ] }"#,
            // duplicate names
            r#"{ "tasks": [ { "name": "a", "mode": "stream", "symbol": "X" }, { "name": "a", "mode": "stream", "symbol": "Y" } ] }"#,
        ];
        for json in cases {
            assert!(BatchConfig::from_json(json).is_err(), "accepted: {json}");
        }
    }

    #[test]
    fn timestamps_accept_three_shapes() {
        assert_eq!(parse_timestamp("1970-01-02").unwrap(), 86_400_000);
        assert_eq!(parse_timestamp("1970-01-01 00:01:00").unwrap(), 60_000);
        assert_eq!(parse_timestamp("1970-01-01T01:00:00+01:00").unwrap(), 0);
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(ValidationError::BadTimestamp(_))
        ));
    }

    #[test]
    fn selection_and_filter() {
        let mut cfg = BatchConfig::from_json(BATCH).unwrap();
        let names = task_filter(Some(" majors-live , "));
        assert_eq!(names, vec!["majors-live".to_string()]);
        cfg.select(&names).unwrap();
        assert_eq!(cfg.tasks.len(), 1);
        assert!(cfg.select(&["missing".to_string()]).is_err());
        assert!(task_filter(None).is_empty());
    }

    #[test]
    fn symbol_lists_are_normalised() {
        let task: TaskConfig = serde_json::from_str(
            r#"{ "name": "t", "symbol": "BTCUSDT", "symbols": ["ETHUSDT, BTCUSDT", " SOLUSDT "] }"#,
        )
        .unwrap();
        assert_eq!(task.symbols(), vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    }
}
