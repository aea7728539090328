// =============================================================================
// Error taxonomy — transient vs permanent vs capability, write and validation
// =============================================================================
//
// Recoverable errors (transient provider failures, capability rejections) are
// handled inside the fetcher and supervisor. Everything else bubbles up as a
// per-task failure and is aggregated into the run's exit status.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// How the owning task must react to a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry with backoff.
    Transient,
    /// Fatal for the owning task, no retry.
    Permanent,
    /// Grouped subscription refused: downgrade to split mode.
    CapabilityUnsupported,
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("unsupported timeframe: {0}")]
    UnsupportedTimeframe(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("malformed payload: {0}")]
    Parse(String),

    #[error("grouped subscription unsupported: {0}")]
    GroupedUnsupported(String),
}

impl ProviderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::Connection(_)
            | Self::Unavailable(_) => ErrorCategory::Transient,
            Self::Authentication(_)
            | Self::UnknownSymbol(_)
            | Self::UnsupportedTimeframe(_)
            | Self::Rejected(_)
            | Self::Parse(_) => ErrorCategory::Permanent,
            Self::GroupedUnsupported(_) => ErrorCategory::CapabilityUnsupported,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Provider-suggested wait, if it sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProviderError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
                Self::Authentication(format!("websocket handshake returned {}", resp.status()))
            }
            WsError::Http(resp) if resp.status().as_u16() == 429 => Self::RateLimited {
                message: "websocket handshake throttled".to_string(),
                retry_after: None,
            },
            other => Self::Connection(other.to_string()),
        }
    }
}

/// Persistence failure. Fatal for the owning task.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("record does not match sink schema: {0}")]
    SchemaMismatch(String),

    #[error("sink already closed")]
    Closed,
}

impl WriteError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Rejected before any network activity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown timeframe {0:?}")]
    UnknownTimeframe(String),

    #[error("end ({end}) must be strictly after start ({start})")]
    EmptyRange { start: i64, end: i64 },

    #[error("invalid timestamp {0:?} (expected RFC 3339 or YYYY-MM-DD)")]
    BadTimestamp(String),

    #[error("missing required field {0:?}")]
    MissingField(&'static str),

    #[error("page limit must be positive")]
    ZeroPageLimit,

    #[error("unknown exchange {0:?}")]
    UnknownExchange(String),

    #[error("price source {price_source} not supported by {exchange}")]
    UnsupportedPriceSource {
        exchange: String,
        price_source: String,
    },

    #[error("credentials must come from the environment, found {0:?} in config")]
    InlineCredentials(String),

    #[error("{0}")]
    Invalid(String),
}

/// Terminal outcome of one task (or one series inside a task).
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("task panicked or was aborted: {0}")]
    Join(String),
}

impl From<ProviderError> for TaskError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}
