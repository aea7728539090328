// =============================================================================
// Batch Runner — every configured task concurrently, isolated from each other
// =============================================================================
//
// Historical tasks fan out into one range fetch per symbol (bounded run-wide
// by the context's fetch permits). Stream tasks hand their symbols to a
// `StreamSupervisor`. A failing task is reported and never stops its
// siblings. Sinks are closed once every task has ended.
// =============================================================================

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::context::RunContext;
use crate::error::{TaskError, WriteError};
use crate::fetcher::{FetchReport, RangeFetcher};
use crate::pipeline::RecordWriter;
use crate::provider::{self, ExchangeSettings, MarketDataProvider};
use crate::runtime_config::{BatchConfig, TaskConfig, TaskMode};
use crate::sink::SharedSink;
use crate::supervisor::{StreamReport, StreamSupervisor};

/// Builds the provider a task talks to.
pub type ProviderFactory = Arc<
    dyn Fn(&ExchangeSettings, Arc<dyn Clock>) -> anyhow::Result<Arc<dyn MarketDataProvider>> + Send + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    /// Stopped by an external cancel before finishing.
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
pub enum TaskDetail {
    Historical(Vec<(String, Result<FetchReport, TaskError>)>),
    Stream(StreamReport),
    NotStarted,
}

#[derive(Debug)]
pub struct TaskReport {
    pub name: String,
    pub mode: TaskMode,
    pub status: TaskStatus,
    pub detail: TaskDetail,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub reports: Vec<TaskReport>,
    pub close_errors: Vec<(String, WriteError)>,
}

impl BatchOutcome {
    /// 0 when every task succeeded (or was cancelled cleanly), 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        let failed = self
            .reports
            .iter()
            .any(|r| matches!(r.status, TaskStatus::Failed(_)));
        if failed || !self.close_errors.is_empty() {
            1
        } else {
            0
        }
    }
}

pub struct BatchRunner {
    ctx: RunContext,
    factory: ProviderFactory,
}

impl BatchRunner {
    pub fn new(ctx: RunContext) -> Self {
        let factory: ProviderFactory =
            Arc::new(|settings: &ExchangeSettings, clock: Arc<dyn Clock>| provider::connect(settings, clock));
        Self::with_provider_factory(ctx, factory)
    }

    pub fn with_provider_factory(ctx: RunContext, factory: ProviderFactory) -> Self {
        Self { ctx, factory }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub async fn run(&self, batch: &BatchConfig) -> BatchOutcome {
        let mut set = JoinSet::new();
        for (index, task) in batch.tasks.iter().enumerate() {
            let ctx = self.ctx.clone();
            let factory = self.factory.clone();
            let task = task.clone();
            set.spawn(async move { (index, run_task(ctx, factory, task).await) });
        }

        let mut slots: Vec<Option<TaskReport>> = batch.tasks.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => error!(error = %e, "task aborted"),
            }
        }

        let reports: Vec<TaskReport> = slots
            .into_iter()
            .zip(batch.tasks.iter())
            .map(|(slot, task)| {
                slot.unwrap_or_else(|| TaskReport {
                    name: task.name.clone(),
                    mode: task.mode,
                    status: TaskStatus::Failed("task aborted".into()),
                    detail: TaskDetail::NotStarted,
                })
            })
            .collect();

        let close_errors = self.ctx.sinks.close_all();

        for r in &reports {
            match &r.status {
                TaskStatus::Failed(reason) => error!(task = %r.name, reason = %reason, "task failed"),
                status => info!(task = %r.name, status = ?status, "task finished"),
            }
        }

        BatchOutcome { reports, close_errors }
    }
}

async fn run_task(ctx: RunContext, factory: ProviderFactory, task: TaskConfig) -> TaskReport {
    info!(
        task = %task.name,
        mode = ?task.mode,
        exchange = %task.exchange.id,
        symbols = ?task.symbols(),
        timeframe = %task.timeframe,
        "task starting"
    );

    let prepared = factory(&task.exchange, ctx.clock.clone()).and_then(|provider| {
        let sink = match task.record_kind() {
            Some(kind) => Some(ctx.sinks.acquire(&task.sink_spec()?, kind)?),
            None => None,
        };
        Ok((provider, sink))
    });

    let (provider, sink) = match prepared {
        Ok(p) => p,
        Err(e) => {
            return TaskReport {
                name: task.name,
                mode: task.mode,
                status: TaskStatus::Failed(format!("{e:#}")),
                detail: TaskDetail::NotStarted,
            };
        }
    };

    match task.mode {
        TaskMode::Historical => run_historical(ctx, provider, sink, task).await,
        TaskMode::Stream => run_stream(ctx, provider, sink, task).await,
    }
}

async fn run_historical(
    ctx: RunContext,
    provider: Arc<dyn MarketDataProvider>,
    sink: Option<SharedSink>,
    task: TaskConfig,
) -> TaskReport {
    let failed = |reason: String| TaskReport {
        name: task.name.clone(),
        mode: task.mode,
        status: TaskStatus::Failed(reason),
        detail: TaskDetail::NotStarted,
    };

    let Some(sink) = sink else {
        return failed("historical task without an output".into());
    };
    let requests = match task.fetch_requests(ctx.now_ms()) {
        Ok(r) => r,
        Err(e) => return failed(e.to_string()),
    };

    let mut set = JoinSet::new();
    for req in requests {
        let fetcher = RangeFetcher::new(provider.clone(), ctx.clone(), task.backoff.clone());
        let mut writer = RecordWriter::new(ctx.ledger.clone(), sink.clone(), req.keep_forming, task.flush_every);
        set.spawn(async move {
            let result = fetcher.fetch_range(&req, &mut writer).await;
            (req.symbol, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((symbol, result)) => {
                match &result {
                    Ok(r) => info!(
                        task = %task.name,
                        symbol = %symbol,
                        pages = r.pages,
                        persisted = r.persisted,
                        resumed_from = ?r.resumed_from,
                        cancelled = r.cancelled,
                        "series done"
                    ),
                    Err(e) => warn!(task = %task.name, symbol = %symbol, error = %e, "series failed"),
                }
                results.push((symbol, result));
            }
            Err(e) => results.push(("?".into(), Err(TaskError::Join(e.to_string())))),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));

    let failures: Vec<String> = results
        .iter()
        .filter_map(|(s, r)| r.as_ref().err().map(|e| format!("{s}: {e}")))
        .collect();
    let cancelled = results
        .iter()
        .any(|(_, r)| r.as_ref().is_ok_and(|rep| rep.cancelled));

    let status = if !failures.is_empty() {
        TaskStatus::Failed(failures.join("; "))
    } else if cancelled {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Succeeded
    };

    TaskReport {
        name: task.name,
        mode: task.mode,
        status,
        detail: TaskDetail::Historical(results),
    }
}

async fn run_stream(
    ctx: RunContext,
    provider: Arc<dyn MarketDataProvider>,
    sink: Option<SharedSink>,
    task: TaskConfig,
) -> TaskReport {
    let cancelled_before = ctx.is_cancelled();
    let supervisor = StreamSupervisor::new(provider, ctx.clone(), task.stream_config(), sink);
    let report = supervisor.run().await;

    let status = if !report.failures.is_empty() {
        let reasons: Vec<String> = report
            .failures
            .iter()
            .map(|(label, e)| format!("{label}: {e}"))
            .collect();
        TaskStatus::Failed(reasons.join("; "))
    } else if cancelled_before || ctx.is_cancelled() {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Succeeded
    };

    TaskReport {
        name: task.name,
        mode: task.mode,
        status,
        detail: TaskDetail::Stream(report),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use crate::clock::FixedClock;
    use crate::error::{ProviderError, ValidationError};
    use crate::provider::{EventStream, PageQuery, ProviderCapabilities, SubscriptionRequest};
    use crate::sink::UpsertStore;
    use crate::types::{Candle, RecordKind, StreamEvent};

    const MIN: i64 = 60_000;

    /// Serves a flat minute series for any symbol except `BADUSDT`.
    struct FlatMarket;

    #[async_trait]
    impl MarketDataProvider for FlatMarket {
        fn name(&self) -> &str {
            "flat"
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities {
                supports_grouped_subscribe: false,
                max_page_limit: 5,
                price_source_options: vec![],
                supports_margin_mode: false,
                supports_until: false,
            }
        }

        async fn fetch_candles(&self, query: &PageQuery) -> Result<Vec<Candle>, ProviderError> {
            if query.symbol == "BADUSDT" {
                return Err(ProviderError::UnknownSymbol(query.symbol.clone()));
            }
            Ok((0..query.limit as i64)
                .map(|i| query.since + i * MIN)
                .filter(|t| *t < 30 * MIN)
                .map(|open_time| Candle {
                    symbol: query.symbol.clone(),
                    timeframe: query.timeframe.clone(),
                    open_time,
                    open: 1.0,
                    high: 1.0,
                    low: 1.0,
                    close: 1.0,
                    volume: 1.0,
                    closed: true,
                })
                .collect())
        }

        async fn subscribe(&self, request: &SubscriptionRequest) -> Result<EventStream, ProviderError> {
            let events: Vec<Result<StreamEvent, ProviderError>> = (0..3)
                .map(|i| {
                    Ok(StreamEvent::Candle(Candle {
                        symbol: request.symbols[0].clone(),
                        timeframe: request.timeframe.clone(),
                        open_time: 40 * MIN + i * MIN,
                        open: 1.0,
                        high: 1.0,
                        low: 1.0,
                        close: 1.0,
                        volume: 1.0,
                        closed: true,
                    }))
                })
                .collect();
            Ok(futures_util::stream::iter(events)
                .chain(futures_util::stream::pending())
                .boxed())
        }
    }

    fn runner() -> BatchRunner {
        let ctx = RunContext::new(Arc::new(FixedClock::new(60 * MIN)), 2);
        let factory: ProviderFactory = Arc::new(
            |settings: &ExchangeSettings, _clock: Arc<dyn Clock>| -> anyhow::Result<Arc<dyn MarketDataProvider>> {
                if settings.id == "broken" {
                    return Err(ValidationError::UnknownExchange(settings.id.clone()).into());
                }
                Ok(Arc::new(FlatMarket))
            },
        );
        BatchRunner::with_provider_factory(ctx, factory)
    }

    fn row_count(path: &std::path::Path) -> i64 {
        UpsertStore::open(path, "ohlcv_1m", RecordKind::Candle)
            .unwrap()
            .row_count()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tasks_do_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("out.sqlite");
        let json = format!(
            r#"{{
                "defaults": {{ "start": "1970-01-01", "end": "1970-01-01T00:30:00Z",
                               "output": {{ "path": {db:?} }} }},
                "tasks": [
                    {{ "name": "ok", "symbols": ["BTCUSDT", "ETHUSDT"] }},
                    {{ "name": "bad-symbol", "symbol": "BADUSDT" }},
                    {{ "name": "bad-exchange", "symbol": "BTCUSDT", "exchange": "broken" }}
                ]
            }}"#,
            db = db.display().to_string()
        );
        let batch = BatchConfig::from_json(&json).unwrap();
        let outcome = runner().run(&batch).await;

        assert_eq!(outcome.reports.len(), 3);
        assert_eq!(outcome.reports[0].status, TaskStatus::Succeeded);
        assert!(matches!(outcome.reports[1].status, TaskStatus::Failed(_)));
        assert!(matches!(outcome.reports[2].status, TaskStatus::Failed(_)));
        assert!(matches!(outcome.reports[2].detail, TaskDetail::NotStarted));
        assert_eq!(outcome.exit_code(), 1);

        // 30 minutes for each of the two good symbols.
        assert_eq!(row_count(&db), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_is_idempotent_and_stream_shares_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("out.sqlite");
        let json = format!(
            r#"{{
                "defaults": {{ "output": {{ "path": {db:?} }} }},
                "tasks": [
                    {{ "name": "backfill", "symbol": "BTCUSDT",
                       "start": "1970-01-01", "end": "1970-01-01T00:30:00Z" }},
                    {{ "name": "live", "mode": "stream", "symbol": "ETHUSDT", "duration_secs": 5 }}
                ]
            }}"#,
            db = db.display().to_string()
        );
        let batch = BatchConfig::from_json(&json).unwrap();

        let first = runner().run(&batch).await;
        assert_eq!(first.exit_code(), 0);
        assert_eq!(row_count(&db), 33);

        let second = runner().run(&batch).await;
        assert_eq!(second.exit_code(), 0);
        assert_eq!(row_count(&db), 33);
        match &second.reports[0].detail {
            TaskDetail::Historical(results) => {
                let report = results[0].1.as_ref().unwrap();
                assert_eq!(report.resumed_from, Some(29 * MIN));
                assert_eq!(report.pages, 0);
            }
            other => panic!("unexpected detail {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_run_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("live.sqlite");
        let json = format!(
            r#"{{ "tasks": [ {{ "name": "live", "mode": "stream", "symbol": "BTCUSDT",
                               "output": {{ "path": {db:?} }} }} ] }}"#,
            db = db.display().to_string()
        );
        let batch = BatchConfig::from_json(&json).unwrap();
        let runner = runner();
        let cancel = runner.context().cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            cancel.cancel();
        });

        let outcome = runner.run(&batch).await;
        assert_eq!(outcome.reports[0].status, TaskStatus::Cancelled);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(row_count(&db), 3);
    }
}
