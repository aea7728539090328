// =============================================================================
// Binance market-data provider (spot + USDⓈ-M futures)
// =============================================================================
//
// Historical candles come from the REST `klines` family, live data from the
// public WebSocket streams. Spot and margin share the spot endpoints; swap and
// future share the fapi endpoints. Options are not served.
// =============================================================================

pub mod rate_limit;
pub mod rest;
pub mod stream;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use self::rest::BinanceRest;
use super::{
    EventStream, ExchangeSettings, MarketDataProvider, PageQuery, ProviderCapabilities,
    SubscriptionRequest,
};
use crate::clock::Clock;
use crate::error::{ProviderError, ValidationError};
use crate::types::{Candle, Channel, MarketType};

/// Base URLs for one market.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub rest_base: String,
    /// `/api/v3` or `/fapi/v1`.
    pub rest_prefix: String,
    pub ws_base: String,
    /// Mark/index-price klines exist only here.
    pub derivatives: bool,
}

impl Endpoints {
    pub fn for_market(market_type: MarketType, sandbox: bool) -> Result<Self, ValidationError> {
        let (rest_base, rest_prefix, ws_base, derivatives) = match (market_type, sandbox) {
            (MarketType::Spot | MarketType::Margin, false) => (
                "https://api.binance.com",
                "/api/v3",
                "wss://stream.binance.com:9443",
                false,
            ),
            (MarketType::Spot | MarketType::Margin, true) => (
                "https://testnet.binance.vision",
                "/api/v3",
                "wss://testnet.binance.vision",
                false,
            ),
            (MarketType::Swap | MarketType::Future, false) => (
                "https://fapi.binance.com",
                "/fapi/v1",
                "wss://fstream.binance.com",
                true,
            ),
            (MarketType::Swap | MarketType::Future, true) => (
                "https://testnet.binancefuture.com",
                "/fapi/v1",
                "wss://stream.binancefuture.com",
                true,
            ),
            (MarketType::Option, _) => {
                return Err(ValidationError::Invalid(
                    "binance options market is not supported".into(),
                ))
            }
        };
        Ok(Self {
            rest_base: rest_base.into(),
            rest_prefix: rest_prefix.into(),
            ws_base: ws_base.into(),
            derivatives,
        })
    }
}

pub struct BinanceProvider {
    rest: BinanceRest,
    endpoints: Endpoints,
    settings: ExchangeSettings,
    clock: Arc<dyn Clock>,
    /// Symbols confirmed by exchangeInfo.
    known_symbols: RwLock<HashSet<String>>,
}

impl BinanceProvider {
    /// Build from settings. The API key, if any, is read from
    /// `<EXCHANGE>_API_KEY`; public market data needs none.
    pub fn new(settings: &ExchangeSettings, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let endpoints = Endpoints::for_market(settings.market_type, settings.sandbox)?;
        let api_key = std::env::var(format!("{}_API_KEY", settings.credential_prefix())).ok();
        if settings.sub_type.is_some() {
            warn!(sub_type = ?settings.sub_type, "sub type has no effect on Binance public data");
        }
        if let Some(mode) = settings.effective_margin_mode() {
            info!(margin_mode = %mode, "margin mode has no effect on public market data");
        }

        let rest = BinanceRest::new(
            endpoints.clone(),
            api_key.as_deref(),
            Duration::from_millis(settings.timeout_ms),
        )?;

        info!(
            market_type = ?settings.market_type,
            sandbox = settings.sandbox,
            authenticated = api_key.is_some(),
            "Binance provider ready"
        );

        Ok(Self {
            rest,
            endpoints,
            settings: settings.clone(),
            clock,
            known_symbols: RwLock::new(HashSet::new()),
        })
    }

    async fn ensure_symbol(&self, symbol: &str) -> Result<(), ProviderError> {
        if self.known_symbols.read().contains(symbol) {
            return Ok(());
        }
        if !self.rest.symbol_exists(symbol).await? {
            return Err(ProviderError::UnknownSymbol(format!(
                "{symbol} is not listed on binance {:?}",
                self.settings.market_type
            )));
        }
        self.known_symbols.write().insert(symbol.to_string());
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for BinanceProvider {
    fn name(&self) -> &str {
        "binance"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        let preset = self.settings.preset();
        ProviderCapabilities {
            supports_grouped_subscribe: true,
            max_page_limit: preset.max_page_limit,
            price_source_options: preset.price_sources.to_vec(),
            supports_margin_mode: preset.supports_margin_mode,
            supports_until: preset.supports_until,
        }
    }

    async fn fetch_candles(&self, query: &PageQuery) -> Result<Vec<Candle>, ProviderError> {
        if !stream::interval_supported(&query.timeframe) {
            return Err(ProviderError::UnsupportedTimeframe(query.timeframe.to_string()));
        }
        self.ensure_symbol(&query.symbol).await?;
        self.rest.get_klines(query, self.clock.now_ms()).await
    }

    async fn subscribe(&self, request: &SubscriptionRequest) -> Result<EventStream, ProviderError> {
        if request.symbols.len() > stream::MAX_STREAMS_PER_CONNECTION {
            return Err(ProviderError::GroupedUnsupported(format!(
                "{} streams exceed the per-connection limit of {}",
                request.symbols.len(),
                stream::MAX_STREAMS_PER_CONNECTION
            )));
        }
        if request.channel == Channel::Candle && !stream::interval_supported(&request.timeframe) {
            return Err(ProviderError::UnsupportedTimeframe(request.timeframe.to_string()));
        }
        let grouped = request.symbols.len() > 1;
        for symbol in &request.symbols {
            match self.ensure_symbol(symbol).await {
                Ok(()) => {}
                // Split mode isolates the bad symbol from the rest of the group.
                Err(ProviderError::UnknownSymbol(msg)) if grouped => {
                    return Err(ProviderError::GroupedUnsupported(msg));
                }
                Err(e) => return Err(e),
            }
        }
        stream::open(&self.endpoints.ws_base, request, self.clock.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_per_market() {
        let spot = Endpoints::for_market(MarketType::Spot, false).unwrap();
        assert_eq!(spot.rest_prefix, "/api/v3");
        assert!(!spot.derivatives);

        let swap = Endpoints::for_market(MarketType::Swap, false).unwrap();
        assert_eq!(swap.rest_base, "https://fapi.binance.com");
        assert!(swap.derivatives);

        let test = Endpoints::for_market(MarketType::Future, true).unwrap();
        assert!(test.rest_base.contains("testnet"));

        assert!(Endpoints::for_market(MarketType::Option, false).is_err());
    }

    #[tokio::test]
    async fn oversized_group_is_capability_rejection() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let provider = BinanceProvider::new(&ExchangeSettings::default(), clock).unwrap();
        let request = SubscriptionRequest {
            symbols: (0..1025).map(|i| format!("SYM{i}USDT")).collect(),
            channel: Channel::Trade,
            timeframe: "1m".parse().unwrap(),
            depth: None,
        };
        let err = provider.subscribe(&request).await.err().unwrap();
        assert_eq!(err.category(), crate::error::ErrorCategory::CapabilityUnsupported);
    }

    #[test]
    fn margin_mode_is_accepted_for_public_data() {
        let settings = ExchangeSettings {
            margin_mode: Some("isolated".into()),
            market_type: MarketType::Swap,
            ..ExchangeSettings::default()
        };
        assert_eq!(settings.effective_margin_mode(), Some("isolated"));
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        assert!(BinanceProvider::new(&settings, clock).is_ok());
    }
}
