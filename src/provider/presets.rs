// =============================================================================
// Exchange presets — per-venue protocol quirks expressed as data
// =============================================================================
//
// Unknown venues fall back to the conservative `*` preset: page size 1000, no
// price-source parameter, no `until` parameter, no margin mode.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ValidationError;
use crate::types::{MarketType, PriceSource};

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePreset {
    pub id: &'static str,
    pub max_page_limit: u32,
    pub price_sources: &'static [PriceSource],
    pub supports_until: bool,
    pub supports_margin_mode: bool,
}

const PRESETS: &[ExchangePreset] = &[
    ExchangePreset {
        id: "binance",
        max_page_limit: 1000,
        price_sources: &[PriceSource::Last, PriceSource::Mark, PriceSource::Index],
        supports_until: true,
        supports_margin_mode: true,
    },
    ExchangePreset {
        id: "bybit",
        max_page_limit: 1000,
        price_sources: &[PriceSource::Last, PriceSource::Mark, PriceSource::Index],
        supports_until: false,
        supports_margin_mode: true,
    },
    ExchangePreset {
        id: "okx",
        max_page_limit: 300,
        price_sources: &[PriceSource::Mark, PriceSource::Index],
        supports_until: true,
        supports_margin_mode: true,
    },
    ExchangePreset {
        id: "kucoin",
        max_page_limit: 1500,
        price_sources: &[],
        supports_until: false,
        supports_margin_mode: true,
    },
    ExchangePreset {
        id: "kraken",
        max_page_limit: 720,
        price_sources: &[],
        supports_until: false,
        supports_margin_mode: false,
    },
    ExchangePreset {
        id: "gateio",
        max_page_limit: 1000,
        price_sources: &[],
        supports_until: true,
        supports_margin_mode: true,
    },
];

const FALLBACK: ExchangePreset = ExchangePreset {
    id: "*",
    max_page_limit: 1000,
    price_sources: &[],
    supports_until: false,
    supports_margin_mode: false,
};

impl ExchangePreset {
    pub fn for_exchange(id: &str) -> &'static ExchangePreset {
        let id = id.trim().to_lowercase();
        PRESETS.iter().find(|p| p.id == id).unwrap_or(&FALLBACK)
    }

    /// Validate an optional price source against the venue. `Last` is always
    /// acceptable since it is what every venue serves by default.
    pub fn check_price_source(
        &self,
        exchange: &str,
        source: Option<PriceSource>,
    ) -> Result<Option<PriceSource>, ValidationError> {
        match source {
            None | Some(PriceSource::Last) => Ok(source),
            Some(s) if self.price_sources.contains(&s) => Ok(Some(s)),
            Some(s) => Err(ValidationError::UnsupportedPriceSource {
                exchange: exchange.to_string(),
                price_source: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ExchangeSettings (config block)
// ---------------------------------------------------------------------------

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Venue selection and market options for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    #[serde(default = "default_exchange", rename = "exchange")]
    pub id: String,

    #[serde(default)]
    pub market_type: MarketType,

    #[serde(default)]
    pub sub_type: Option<String>,

    /// Passed through only where the venue supports it.
    #[serde(default)]
    pub margin_mode: Option<String>,

    #[serde(default)]
    pub sandbox: bool,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            id: default_exchange(),
            market_type: MarketType::default(),
            sub_type: None,
            margin_mode: None,
            sandbox: false,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl ExchangeSettings {
    pub fn preset(&self) -> &'static ExchangePreset {
        ExchangePreset::for_exchange(&self.id)
    }

    /// Margin mode to forward, or `None` (with a warning) when the venue has
    /// no notion of it.
    pub fn effective_margin_mode(&self) -> Option<&str> {
        let mode = self.margin_mode.as_deref()?;
        if self.preset().supports_margin_mode {
            Some(mode)
        } else {
            warn!(exchange = %self.id, margin_mode = %mode, "margin mode ignored: not supported by venue");
            None
        }
    }

    /// Environment variable prefix for credentials, e.g. `BINANCE`.
    pub fn credential_prefix(&self) -> String {
        self.id.trim().to_uppercase().replace(['-', ' '], "_")
    }
}
