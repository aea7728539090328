// =============================================================================
// Binance REST — public klines and exchangeInfo
// =============================================================================
//
// Only public market-data endpoints are used. When an API key is present in
// the environment it is passed through as `X-MBX-APIKEY` and never logged.
// =============================================================================

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use super::Endpoints;
use crate::error::ProviderError;
use crate::provider::PageQuery;
use crate::types::{Candle, PriceSource};

/// Weight Binance charges for a klines call with `limit` rows.
fn klines_weight(limit: u32) -> u32 {
    match limit {
        0..=99 => 1,
        100..=499 => 2,
        500..=1000 => 5,
        _ => 10,
    }
}

/// Binance error code for an unknown symbol.
const CODE_INVALID_SYMBOL: i64 = -1121;
/// Binance error code for an unknown kline interval.
const CODE_BAD_INTERVAL: i64 = -1120;

pub struct BinanceRest {
    client: reqwest::Client,
    endpoints: Endpoints,
    rate_limit: RateLimitTracker,
}

impl BinanceRest {
    pub fn new(
        endpoints: Endpoints,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut default_headers = HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            if let Ok(val) = HeaderValue::from_str(key) {
                default_headers.insert("X-MBX-APIKEY", val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Connection(format!("failed to build http client: {e}")))?;

        debug!(base_url = %endpoints.rest_base, "Binance REST client initialised");

        Ok(Self {
            client,
            endpoints,
            rate_limit: RateLimitTracker::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET klines (or mark/index-price klines on derivatives).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self, query), fields(symbol = %query.symbol, tf = %query.timeframe, since = query.since), name = "binance::get_klines")]
    pub async fn get_klines(&self, query: &PageQuery, now_ms: i64) -> Result<Vec<Candle>, ProviderError> {
        let (path, symbol_param) = match query.price_source {
            Some(PriceSource::Mark) if self.endpoints.derivatives => ("markPriceKlines", "symbol"),
            Some(PriceSource::Index) if self.endpoints.derivatives => ("indexPriceKlines", "pair"),
            _ => ("klines", "symbol"),
        };

        let mut url = format!(
            "{}{}/{}?{}={}&interval={}&startTime={}&limit={}",
            self.endpoints.rest_base,
            self.endpoints.rest_prefix,
            path,
            symbol_param,
            query.symbol,
            query.timeframe,
            query.since,
            query.limit
        );
        if let Some(until) = query.until {
            // Binance endTime is inclusive.
            url.push_str(&format!("&endTime={}", until - 1));
        }

        let body = self.get_json(&url, klines_weight(query.limit)).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ProviderError::Parse("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else {
                return Err(ProviderError::Parse("kline entry is not an array".into()));
            };
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time = arr[0]
                .as_i64()
                .ok_or_else(|| ProviderError::Parse("kline open time is not an integer".into()))?;
            let mut candle = Candle {
                symbol: query.symbol.clone(),
                timeframe: query.timeframe.clone(),
                open_time,
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                closed: false,
            };
            candle.closed = candle.is_elapsed_at(now_ms);
            candles.push(candle);
        }

        debug!(count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// Whether `symbol` is listed on this market.
    #[instrument(skip(self), name = "binance::symbol_exists")]
    pub async fn symbol_exists(&self, symbol: &str) -> Result<bool, ProviderError> {
        if self.endpoints.derivatives {
            // The futures exchangeInfo endpoint has no symbol filter.
            let url = format!("{}{}/exchangeInfo", self.endpoints.rest_base, self.endpoints.rest_prefix);
            let body = self.get_json(&url, 1).await?;
            let found = body["symbols"]
                .as_array()
                .map(|arr| arr.iter().any(|s| s["symbol"].as_str() == Some(symbol)))
                .unwrap_or(false);
            return Ok(found);
        }

        let url = format!(
            "{}{}/exchangeInfo?symbol={}",
            self.endpoints.rest_base, self.endpoints.rest_prefix, symbol
        );
        match self.get_json(&url, 2).await {
            Ok(body) => Ok(body["symbols"].as_array().is_some_and(|a| !a.is_empty())),
            Err(ProviderError::UnknownSymbol(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str, weight: u32) -> Result<serde_json::Value, ProviderError> {
        if let Err(wait) = self.rate_limit.try_acquire(weight) {
            return Err(ProviderError::RateLimited {
                message: "local request-weight cap reached".into(),
                retry_after: Some(wait),
            });
        }

        let resp = self.client.get(url).send().await?;
        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await?;

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(body) if status.is_success() => Ok(body),
            Ok(body) => Err(classify_failure(status, &body, retry_after)),
            Err(e) if status.is_success() => {
                Err(ProviderError::Parse(format!("invalid JSON from {url}: {e}")))
            }
            // Gateways answer 5xx with HTML; classify on status alone.
            Err(_) => Err(classify_failure(status, &serde_json::Value::Null, retry_after)),
        }
    }
}

/// Map a non-2xx Binance response to the error taxonomy.
pub(crate) fn classify_failure(
    status: StatusCode,
    body: &serde_json::Value,
    retry_after: Option<Duration>,
) -> ProviderError {
    let code = body["code"].as_i64().unwrap_or(0);
    let msg = body["msg"].as_str().unwrap_or("").to_string();
    let detail = format!("HTTP {status} code={code} {msg}");

    match status.as_u16() {
        429 | 418 => ProviderError::RateLimited {
            message: detail,
            retry_after,
        },
        401 | 403 => ProviderError::Authentication(detail),
        408 => ProviderError::Timeout(detail),
        500..=599 => ProviderError::Unavailable(detail),
        _ if code == CODE_INVALID_SYMBOL => ProviderError::UnknownSymbol(detail),
        _ if code == CODE_BAD_INTERVAL => ProviderError::UnsupportedTimeframe(detail),
        _ => ProviderError::Rejected(detail),
    }
}

/// Binance sends numeric values as JSON strings.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64, ProviderError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| ProviderError::Parse(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(ProviderError::Parse(format!("expected string or number, got: {val}")))
    }
}

impl std::fmt::Debug for BinanceRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRest")
            .field("base_url", &self.endpoints.rest_base)
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use serde_json::json;

    #[test]
    fn classifies_http_failures() {
        let e = classify_failure(StatusCode::TOO_MANY_REQUESTS, &json!({}), Some(Duration::from_secs(5)));
        assert!(e.is_transient());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(5)));

        let e = classify_failure(
            StatusCode::BAD_REQUEST,
            &json!({ "code": -1121, "msg": "Invalid symbol." }),
            None,
        );
        assert!(matches!(e, ProviderError::UnknownSymbol(_)));
        assert_eq!(e.category(), ErrorCategory::Permanent);

        let e = classify_failure(
            StatusCode::BAD_REQUEST,
            &json!({ "code": -1120, "msg": "Invalid interval." }),
            None,
        );
        assert!(matches!(e, ProviderError::UnsupportedTimeframe(_)));

        let e = classify_failure(StatusCode::BAD_GATEWAY, &json!({}), None);
        assert!(e.is_transient());

        let e = classify_failure(StatusCode::UNAUTHORIZED, &json!({ "code": -2015 }), None);
        assert!(matches!(e, ProviderError::Authentication(_)));
    }

    #[test]
    fn klines_weight_tiers() {
        assert_eq!(klines_weight(50), 1);
        assert_eq!(klines_weight(500), 5);
        assert_eq!(klines_weight(1000), 5);
        assert_eq!(klines_weight(1500), 10);
    }

    #[test]
    fn parse_str_f64_accepts_both_forms() {
        assert_eq!(parse_str_f64(&json!("1.5")).unwrap(), 1.5);
        assert_eq!(parse_str_f64(&json!(2.0)).unwrap(), 2.0);
        assert!(parse_str_f64(&json!(null)).is_err());
    }
}
