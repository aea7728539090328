// =============================================================================
// Market Data Provider — capability interface consumed by the collector core
// =============================================================================
//
// The core never branches on provider identity, only on the capabilities a
// provider advertises (grouped subscribe, page size, price sources).
// =============================================================================

pub mod binance;
pub mod presets;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::clock::Clock;
use crate::error::{ProviderError, ValidationError};
use crate::types::{Candle, Channel, PriceSource, StreamEvent, Timeframe};

pub use presets::{ExchangePreset, ExchangeSettings};

/// Features a provider may or may not offer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCapabilities {
    pub supports_grouped_subscribe: bool,
    pub max_page_limit: u32,
    pub price_source_options: Vec<PriceSource>,
    pub supports_margin_mode: bool,
    pub supports_until: bool,
}

/// One paged historical query.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub since: i64,
    pub limit: u32,
    /// Exclusive upper bound hint, forwarded only when the provider supports it.
    pub until: Option<i64>,
    pub price_source: Option<PriceSource>,
}

/// One push subscription: grouped when `symbols.len() > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub symbols: Vec<String>,
    pub channel: Channel,
    pub timeframe: Timeframe,
    pub depth: Option<u32>,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Ordered candles with `open_time >= query.since`, at most `query.limit`.
    async fn fetch_candles(&self, query: &PageQuery) -> Result<Vec<Candle>, ProviderError>;

    /// Open a push subscription. Ends (`None`) on clean disconnect.
    async fn subscribe(&self, request: &SubscriptionRequest) -> Result<EventStream, ProviderError>;
}

/// Construct the provider selected by `settings`.
pub fn connect(
    settings: &ExchangeSettings,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn MarketDataProvider>> {
    match settings.id.trim().to_lowercase().as_str() {
        "binance" => Ok(Arc::new(binance::BinanceProvider::new(settings, clock)?)),
        other => Err(ValidationError::UnknownExchange(other.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_exchange_is_rejected() {
        let settings = ExchangeSettings {
            id: "nowhere".into(),
            ..ExchangeSettings::default()
        };
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let err = connect(&settings, clock).err().unwrap();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }
}
