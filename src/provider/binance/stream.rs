// =============================================================================
// Binance WebSocket streams — kline, aggTrade, partial depth, 24h ticker
// =============================================================================
//
// A single symbol uses the raw endpoint `/ws/<stream>`; several symbols use
// the combined endpoint `/stream?streams=a/b/c`, whose payloads arrive wrapped
// in `{ "stream": ..., "data": ... }`. Both shapes are parsed by the same code.
// =============================================================================

use std::sync::Arc;

use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::rest::parse_str_f64;
use crate::clock::Clock;
use crate::error::ProviderError;
use crate::provider::{EventStream, SubscriptionRequest};
use crate::types::{BookTop, Candle, Channel, StreamEvent, TickerUpdate, Timeframe, Trade, TradeSide};

/// Binance refuses combined connections with more streams than this.
pub const MAX_STREAMS_PER_CONNECTION: usize = 1024;

/// Kline intervals the Binance stream and REST API understand.
const SUPPORTED_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

pub fn interval_supported(tf: &Timeframe) -> bool {
    SUPPORTED_INTERVALS.contains(&tf.label())
}

/// Stream name for one symbol on one channel.
pub fn stream_name(symbol: &str, request: &SubscriptionRequest) -> String {
    let lower = symbol.to_lowercase();
    match request.channel {
        Channel::Candle => format!("{lower}@kline_{}", request.timeframe),
        Channel::Trade => format!("{lower}@aggTrade"),
        Channel::Orderbook => {
            let levels = match request.depth.unwrap_or(20) {
                0..=5 => 5,
                6..=10 => 10,
                _ => 20,
            };
            format!("{lower}@depth{levels}@100ms")
        }
        Channel::Ticker => format!("{lower}@ticker"),
    }
}

/// Build the connection URL for `request`.
pub fn build_url(ws_base: &str, request: &SubscriptionRequest) -> String {
    let streams: Vec<String> = request
        .symbols
        .iter()
        .map(|s| stream_name(s, request))
        .collect();
    if streams.len() == 1 {
        format!("{ws_base}/ws/{}", streams[0])
    } else {
        format!("{ws_base}/stream?streams={}", streams.join("/"))
    }
}

/// Open the WebSocket and turn its frames into [`StreamEvent`]s.
///
/// The returned stream yields an error when the server closes the socket or a
/// read fails; the supervisor decides what to do with it.
pub async fn open(
    ws_base: &str,
    request: &SubscriptionRequest,
    clock: Arc<dyn Clock>,
) -> Result<EventStream, ProviderError> {
    let url = build_url(ws_base, request);
    info!(url = %url, channel = %request.channel, symbols = request.symbols.len(), "connecting to WebSocket");

    let (ws_stream, _response) = connect_async(&url).await?;
    info!(channel = %request.channel, symbols = ?request.symbols, "WebSocket connected");

    // Raw single-stream depth payloads carry no symbol.
    let single_symbol = (request.symbols.len() == 1).then(|| request.symbols[0].clone());

    let events = ws_stream.filter_map(move |frame| {
        let out = match frame {
            Ok(Message::Text(text)) => match parse_message(&text, single_symbol.as_deref(), clock.now_ms()) {
                Ok(Some(ev)) => Some(Ok(ev)),
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "failed to parse stream message");
                    None
                }
            },
            Ok(Message::Close(frame)) => Some(Err(ProviderError::Connection(format!(
                "server closed the stream: {frame:?}"
            )))),
            // tungstenite answers pings itself.
            Ok(_) => None,
            Err(e) => Some(Err(ProviderError::from(e))),
        };
        futures_util::future::ready(out)
    });

    Ok(Box::pin(events))
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse one text frame. `Ok(None)` for frames that carry no market data
/// (subscription acks and the like).
pub fn parse_message(
    text: &str,
    single_symbol: Option<&str>,
    now_ms: i64,
) -> Result<Option<StreamEvent>, ProviderError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ProviderError::Parse(format!("invalid stream JSON: {e}")))?;

    // Combined-stream envelope or direct single-stream payload.
    let (data, stream) = match root.get("data") {
        Some(data) => (data, root["stream"].as_str()),
        None => (&root, None),
    };

    match data["e"].as_str() {
        Some("kline") => parse_kline(data, now_ms).map(|c| Some(StreamEvent::Candle(c))),
        Some("aggTrade") | Some("trade") => parse_trade(data).map(|t| Some(StreamEvent::Trade(t))),
        Some("24hrTicker") => parse_ticker(data).map(|t| Some(StreamEvent::Ticker(t))),
        Some("depthUpdate") => {
            let symbol = required_str(data, "s")?.to_uppercase();
            parse_depth(data, &symbol, "b", "a", "u").map(|b| Some(StreamEvent::OrderBook(b)))
        }
        Some(other) => {
            debug!(event = %other, "ignoring unhandled stream event");
            Ok(None)
        }
        None if data.get("lastUpdateId").is_some() => {
            let symbol = stream
                .and_then(|s| s.split('@').next())
                .map(str::to_uppercase)
                .or_else(|| single_symbol.map(str::to_string))
                .ok_or_else(|| ProviderError::Parse("depth payload without symbol".into()))?;
            parse_depth(data, &symbol, "bids", "asks", "lastUpdateId")
                .map(|b| Some(StreamEvent::OrderBook(b)))
        }
        None => Ok(None),
    }
}

fn required_str<'a>(v: &'a serde_json::Value, field: &str) -> Result<&'a str, ProviderError> {
    v[field]
        .as_str()
        .ok_or_else(|| ProviderError::Parse(format!("missing field {field}")))
}

fn required_i64(v: &serde_json::Value, field: &str) -> Result<i64, ProviderError> {
    v[field]
        .as_i64()
        .ok_or_else(|| ProviderError::Parse(format!("missing field {field}")))
}

/// Expected shape:
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": 1700000000000, "i": "1m", "o": "...", "x": false, ... } }
/// ```
fn parse_kline(data: &serde_json::Value, now_ms: i64) -> Result<Candle, ProviderError> {
    let symbol = required_str(data, "s")?.to_uppercase();
    let k = &data["k"];
    let timeframe: Timeframe = required_str(k, "i")?
        .parse()
        .map_err(|e| ProviderError::Parse(format!("kline interval: {e}")))?;
    let open_time = required_i64(k, "t")?;

    let mut candle = Candle {
        symbol,
        timeframe,
        open_time,
        open: parse_str_f64(&k["o"])?,
        high: parse_str_f64(&k["h"])?,
        low: parse_str_f64(&k["l"])?,
        close: parse_str_f64(&k["c"])?,
        volume: parse_str_f64(&k["v"])?,
        closed: k["x"].as_bool().unwrap_or(false),
    };
    // Binance sets `x` on the final update; wall clock settles late arrivals.
    candle.closed = candle.closed || candle.is_elapsed_at(now_ms);
    Ok(candle)
}

/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "a": 26129, "p": "37000.00", "q": "0.123", "T": 1700000000000, "m": true }
/// ```
fn parse_trade(data: &serde_json::Value) -> Result<Trade, ProviderError> {
    let id = data
        .get("a")
        .or_else(|| data.get("t"))
        .and_then(|v| v.as_i64())
        .map(|v| v.to_string());
    // Buyer is maker => the aggressor sold.
    let side = if data["m"].as_bool().unwrap_or(false) {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };

    Ok(Trade {
        symbol: required_str(data, "s")?.to_uppercase(),
        id,
        timestamp: required_i64(data, "T")?,
        price: parse_str_f64(&data["p"])?,
        amount: parse_str_f64(&data["q"])?,
        side,
    })
}

fn parse_ticker(data: &serde_json::Value) -> Result<TickerUpdate, ProviderError> {
    Ok(TickerUpdate {
        symbol: required_str(data, "s")?.to_uppercase(),
        last: parse_str_f64(&data["c"])?,
        event_time: required_i64(data, "E")?,
    })
}

fn parse_depth(
    data: &serde_json::Value,
    symbol: &str,
    bids_field: &str,
    asks_field: &str,
    id_field: &str,
) -> Result<BookTop, ProviderError> {
    let update_id = data[id_field]
        .as_u64()
        .ok_or_else(|| ProviderError::Parse(format!("missing field {id_field}")))?;
    let side = |field: &str| -> Result<(f64, f64), ProviderError> {
        let levels = data[field]
            .as_array()
            .ok_or_else(|| ProviderError::Parse(format!("missing field {field}")))?;
        let best = levels
            .first()
            .and_then(|l| l.get(0))
            .map(parse_str_f64)
            .transpose()?
            .unwrap_or(0.0);
        let mut depth = 0.0;
        for level in levels {
            if let Some(q) = level.get(1) {
                depth += parse_str_f64(q)?;
            }
        }
        Ok((best, depth))
    };
    let (best_bid, bid_depth) = side(bids_field)?;
    let (best_ask, ask_depth) = side(asks_field)?;

    Ok(BookTop {
        symbol: symbol.to_string(),
        best_bid,
        best_ask,
        bid_depth,
        ask_depth,
        update_id,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(symbols: &[&str], channel: Channel) -> SubscriptionRequest {
        SubscriptionRequest {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            channel,
            timeframe: "1m".parse().unwrap(),
            depth: None,
        }
    }

    #[test]
    fn build_url_single_and_combined() {
        let single = build_url("wss://stream.binance.com:9443", &request(&["BTCUSDT"], Channel::Candle));
        assert_eq!(single, "wss://stream.binance.com:9443/ws/btcusdt@kline_1m");

        let combined = build_url(
            "wss://stream.binance.com:9443",
            &request(&["BTCUSDT", "ETHUSDT"], Channel::Trade),
        );
        assert!(combined.starts_with("wss://stream.binance.com:9443/stream?streams="));
        assert!(combined.contains("btcusdt@aggTrade/ethusdt@aggTrade"));
    }

    #[test]
    fn depth_levels_snap_to_supported() {
        let mut req = request(&["BTCUSDT"], Channel::Orderbook);
        req.depth = Some(7);
        assert_eq!(stream_name("BTCUSDT", &req), "btcusdt@depth10@100ms");
    }

    #[test]
    fn parse_combined_kline() {
        let json = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline",
                "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000, "T": 1700000059999, "i": "1m",
                    "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
                    "v": "123.456", "n": 1500, "x": false
                }
            }
        }"#;
        let ev = parse_message(json, None, 1_700_000_030_000).unwrap().unwrap();
        let StreamEvent::Candle(c) = ev else { panic!("expected candle") };
        assert_eq!(c.symbol, "BTCUSDT");
        assert_eq!(c.open_time, 1_700_000_000_000);
        assert!((c.close - 37_020.0).abs() < f64::EPSILON);
        assert!(!c.closed);

        // Same payload observed after the bucket elapsed counts as closed.
        let ev = parse_message(json, None, 1_700_000_060_000).unwrap().unwrap();
        let StreamEvent::Candle(c) = ev else { panic!("expected candle") };
        assert!(c.closed);
    }

    #[test]
    fn parse_agg_trade_side() {
        let json = r#"{ "e": "aggTrade", "s": "BTCUSDT", "a": 42, "p": "37000.00", "q": "0.5", "T": 1000, "m": true }"#;
        let StreamEvent::Trade(t) = parse_message(json, None, 0).unwrap().unwrap() else {
            panic!("expected trade")
        };
        assert_eq!(t.id.as_deref(), Some("42"));
        assert_eq!(t.side, TradeSide::Sell);
        assert_eq!(t.timestamp, 1000);
    }

    #[test]
    fn parse_partial_depth_uses_stream_or_hint() {
        let raw = r#"{ "lastUpdateId": 7, "bids": [["100.0", "2.0"], ["99.5", "1.0"]], "asks": [["100.5", "1.5"]] }"#;
        let StreamEvent::OrderBook(b) = parse_message(raw, Some("BTCUSDT"), 0).unwrap().unwrap() else {
            panic!("expected book")
        };
        assert_eq!(b.symbol, "BTCUSDT");
        assert!((b.bid_depth - 3.0).abs() < f64::EPSILON);
        assert!((b.best_ask - 100.5).abs() < f64::EPSILON);

        let wrapped = format!(r#"{{ "stream": "ethusdt@depth20@100ms", "data": {raw} }}"#);
        let StreamEvent::OrderBook(b) = parse_message(&wrapped, None, 0).unwrap().unwrap() else {
            panic!("expected book")
        };
        assert_eq!(b.symbol, "ETHUSDT");

        assert!(parse_message(raw, None, 0).is_err());
    }

    #[test]
    fn acks_are_ignored() {
        assert_eq!(parse_message(r#"{ "result": null, "id": 1 }"#, None, 0).unwrap(), None);
    }
}
