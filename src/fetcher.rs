// =============================================================================
// Range Fetcher — bounded, resumable historical backfill
// =============================================================================
//
// Pages through `[start, end)` for one series:
//
//   1. effective start = max(start, last persisted + tf)
//   2. request a page at the cursor; drop anything at or past `end`, and the
//      still-forming candle unless asked to keep it
//   3. cursor = last seen open_time + tf
//   4. stop on a short page, when the cursor reaches `end`, or when the
//      provider stops advancing
//
// Transient failures back off and retry up to the policy's attempt bound.
// Anything else ends the series immediately.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backoff::{sleep_cancellable, BackoffPolicy};
use crate::context::RunContext;
use crate::error::{ProviderError, TaskError, ValidationError};
use crate::pipeline::{Outcome, RecordWriter};
use crate::provider::{MarketDataProvider, PageQuery};
use crate::types::{Candle, PriceSource, SeriesKey, Timeframe};

/// One series to backfill.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: i64,
    /// Exclusive.
    pub end: i64,
    pub page_limit: Option<u32>,
    pub keep_forming: bool,
    pub price_source: Option<PriceSource>,
}

impl FetchRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.end <= self.start {
            return Err(ValidationError::EmptyRange {
                start: self.start,
                end: self.end,
            });
        }
        if self.page_limit == Some(0) {
            return Err(ValidationError::ZeroPageLimit);
        }
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::MissingField("symbol"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub effective_start: i64,
    pub resumed_from: Option<i64>,
    pub pages: u32,
    pub persisted: u64,
    pub overwritten: u64,
    pub rejected: u64,
    pub forming_dropped: u64,
    pub cancelled: bool,
}

pub struct RangeFetcher {
    provider: Arc<dyn MarketDataProvider>,
    ctx: RunContext,
    backoff: BackoffPolicy,
}

impl RangeFetcher {
    pub fn new(provider: Arc<dyn MarketDataProvider>, ctx: RunContext, backoff: BackoffPolicy) -> Self {
        Self { provider, ctx, backoff }
    }

    pub async fn fetch_range(
        &self,
        req: &FetchRequest,
        writer: &mut RecordWriter,
    ) -> Result<FetchReport, TaskError> {
        req.validate()?;

        let caps = self.provider.capabilities();
        let limit = req
            .page_limit
            .unwrap_or(caps.max_page_limit)
            .min(caps.max_page_limit)
            .max(1);
        let tf_ms = req.timeframe.as_millis();
        let key = SeriesKey::new(req.symbol.clone(), req.timeframe.clone());

        let mut report = FetchReport::default();

        let _permit = tokio::select! {
            _ = self.ctx.cancel.cancelled() => {
                report.cancelled = true;
                return Ok(report);
            }
            permit = self.ctx.fetch_permits.acquire() => permit
                .map_err(|_| TaskError::Join("fetch permits closed".into()))?,
        };

        let resumed = writer.bootstrap(&key)?;
        let effective_start = match resumed {
            Some(last) => req.start.max(last + tf_ms),
            None => req.start,
        };
        report.effective_start = effective_start;
        report.resumed_from = resumed;

        if effective_start >= req.end {
            info!(series = %key, last = ?resumed, "range already complete");
            return Ok(report);
        }
        info!(
            series = %key,
            start = effective_start,
            end = req.end,
            limit,
            resumed = resumed.is_some(),
            "starting backfill"
        );

        let mut cursor = effective_start;
        loop {
            if self.ctx.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let query = PageQuery {
                symbol: req.symbol.clone(),
                timeframe: req.timeframe.clone(),
                since: cursor,
                limit,
                until: caps.supports_until.then_some(req.end),
                price_source: req.price_source,
            };
            let Some(page) = self.fetch_page(&query).await? else {
                report.cancelled = true;
                break;
            };
            report.pages += 1;
            let page_len = page.len();
            if page.is_empty() {
                break;
            }

            let now = self.ctx.now_ms();
            let mut last_seen: Option<i64> = None;
            let mut reached_end = false;

            for mut candle in page {
                if candle.open_time < cursor {
                    continue;
                }
                if candle.open_time >= req.end {
                    reached_end = true;
                    break;
                }
                candle.closed = candle.is_elapsed_at(now);
                if !candle.closed && !req.keep_forming {
                    // Only the newest candle can be forming.
                    report.forming_dropped += 1;
                    reached_end = true;
                    break;
                }
                last_seen = Some(candle.open_time);
                self.persist(&candle, writer, &mut report)?;
            }
            writer.flush()?;

            let Some(last) = last_seen else { break };
            let next = last + tf_ms;
            if next <= cursor {
                warn!(series = %key, cursor, "provider did not advance, stopping");
                break;
            }
            cursor = next;
            debug!(series = %key, cursor, page_len, "page done");

            if reached_end || page_len < limit as usize || cursor >= req.end {
                break;
            }
        }

        info!(
            series = %key,
            pages = report.pages,
            persisted = report.persisted,
            overwritten = report.overwritten,
            rejected = report.rejected,
            cancelled = report.cancelled,
            "backfill finished"
        );
        Ok(report)
    }

    fn persist(&self, candle: &Candle, writer: &mut RecordWriter, report: &mut FetchReport) -> Result<(), TaskError> {
        match writer.write_candle(candle)? {
            Outcome::Persisted => report.persisted += 1,
            Outcome::Overwritten => report.overwritten += 1,
            Outcome::Rejected => report.rejected += 1,
            Outcome::Forming => report.forming_dropped += 1,
            Outcome::Duplicate => {}
        }
        Ok(())
    }

    /// One page with retry. `Ok(None)` when cancelled.
    async fn fetch_page(&self, query: &PageQuery) -> Result<Option<Vec<Candle>>, TaskError> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Ok(None),
                r = self.provider.fetch_candles(query) => r,
            };

            let err = match result {
                Ok(page) => return Ok(Some(page)),
                Err(e) if e.is_transient() => e,
                Err(e) => {
                    warn!(symbol = %query.symbol, error = %e, "permanent provider error");
                    return Err(e.into());
                }
            };

            attempt += 1;
            if attempt >= self.backoff.max_attempts {
                return Err(TaskError::RetriesExhausted { attempts: attempt, last: err });
            }
            let delay = retry_delay(&self.backoff, attempt - 1, &err);
            warn!(
                symbol = %query.symbol,
                attempt,
                max_attempts = self.backoff.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "fetch_candles failed, retrying"
            );
            if !sleep_cancellable(delay, &self.ctx.cancel).await {
                return Ok(None);
            }
        }
    }
}

/// Backoff delay, stretched to honour a provider `Retry-After`.
fn retry_delay(policy: &BackoffPolicy, attempt: u32, err: &ProviderError) -> std::time::Duration {
    let delay = policy.delay(attempt);
    err.retry_after().map_or(delay, |hint| delay.max(hint))
}
