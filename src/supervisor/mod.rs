// =============================================================================
// Stream Supervisor — reconnecting push subscriptions with grouped→split fallback
// =============================================================================
//
// One run:
//
//   1. If the provider advertises grouped subscribe and there is more than one
//      symbol, run a single grouped subscription task.
//   2. If that task ends on a capability rejection, downgrade for the rest of
//      the run: one split task per symbol, concurrently, each with its own
//      state machine and backoff counter. Grouped mode is never retried.
//   3. A finite duration cancels every task once elapsed; an external cancel
//      does the same at any time.
//
// A split task that fails permanently is reported and leaves its siblings
// running.
// =============================================================================

pub mod dispatch;
pub mod metrics;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregatorStats;
use crate::backoff::{sleep_cancellable, BackoffPolicy};
use crate::context::RunContext;
use crate::error::{ProviderError, TaskError, WriteError};
use crate::pipeline::{RecordWriter, WriteStats};
use crate::provider::{EventStream, MarketDataProvider, SubscriptionRequest};
use crate::sink::SharedSink;
use crate::types::{Channel, RecordKind, SeriesKey, Timeframe};

use dispatch::{DispatchOptions, Dispatcher, SnapshotBoard};
use metrics::{StreamCounters, StreamMetrics};
use state::{Action, SubEvent, SubscriptionHandle};

pub use state::SubscriptionMode;

/// Everything one streaming task needs to know.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub symbols: Vec<String>,
    pub channel: Channel,
    pub timeframe: Timeframe,
    pub depth: Option<u32>,
    /// Aggregate the trade channel into candles instead of persisting trades.
    pub trade_to_candle: bool,
    pub persist_forming: bool,
    /// `None` runs until cancelled.
    pub duration: Option<Duration>,
    /// Per subscription task.
    pub max_messages: Option<u64>,
    pub flush_every: usize,
    pub flush_interval: Duration,
    pub metrics_interval: Duration,
    pub stability_window: Duration,
    pub backoff: BackoffPolicy,
}

impl StreamConfig {
    /// What this stream persists, if anything.
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self.channel {
            Channel::Candle => Some(RecordKind::Candle),
            Channel::Trade if self.trade_to_candle => Some(RecordKind::Candle),
            Channel::Trade => Some(RecordKind::Trade),
            Channel::Orderbook | Channel::Ticker => None,
        }
    }

    fn request(&self, symbols: &[String]) -> SubscriptionRequest {
        SubscriptionRequest {
            symbols: symbols.to_vec(),
            channel: self.channel,
            timeframe: self.timeframe.clone(),
            depth: self.depth,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamReport {
    pub mode: Option<SubscriptionMode>,
    pub grouped_attempts: u32,
    pub split_tasks: usize,
    pub counters: StreamCounters,
    pub writes: WriteStats,
    pub aggregation: AggregatorStats,
    /// Subscriptions that ended on a permanent failure, by label.
    pub failures: Vec<(String, TaskError)>,
}

impl StreamReport {
    fn absorb(&mut self, result: TaskResult) {
        self.counters.absorb(result.counters);
        self.writes.absorb(result.writes);
        self.aggregation.trades += result.aggregation.trades;
        self.aggregation.candles_closed += result.aggregation.candles_closed;
        self.aggregation.late_dropped += result.aggregation.late_dropped;
        if let TaskEnd::Failed(e) = result.end {
            self.failures.push((result.label, e));
        }
    }
}

pub struct StreamSupervisor {
    provider: Arc<dyn MarketDataProvider>,
    ctx: RunContext,
    config: Arc<StreamConfig>,
    sink: Option<SharedSink>,
    board: Arc<SnapshotBoard>,
}

impl StreamSupervisor {
    /// `sink` must be present whenever `config.record_kind()` is.
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        ctx: RunContext,
        config: StreamConfig,
        sink: Option<SharedSink>,
    ) -> Self {
        Self {
            provider,
            ctx,
            config: Arc::new(config),
            sink,
            board: Arc::new(SnapshotBoard::new()),
        }
    }

    pub fn board(&self) -> &Arc<SnapshotBoard> {
        &self.board
    }

    pub async fn run(&self) -> StreamReport {
        let stop = self.ctx.cancel.child_token();

        let work = self.run_modes(stop.clone());
        tokio::pin!(work);

        let report = match self.config.duration {
            Some(duration) => {
                tokio::select! {
                    report = &mut work => report,
                    _ = tokio::time::sleep(duration) => {
                        info!(duration_secs = duration.as_secs(), "stream duration elapsed, stopping");
                        stop.cancel();
                        work.await
                    }
                }
            }
            None => work.await,
        };
        stop.cancel();

        info!(
            mode = ?report.mode,
            messages = report.counters.messages,
            errors = report.counters.errors,
            reconnects = report.counters.reconnects,
            persisted = report.writes.persisted,
            failures = report.failures.len(),
            "stream run finished"
        );
        report
    }

    async fn run_modes(&self, stop: CancellationToken) -> StreamReport {
        let mut report = StreamReport::default();
        let symbols = &self.config.symbols;

        if symbols.len() > 1 && self.provider.capabilities().supports_grouped_subscribe {
            report.grouped_attempts = 1;
            report.mode = Some(SubscriptionMode::Grouped);

            let result = self
                .task(symbols.clone(), SubscriptionMode::Grouped, stop.clone())
                .run()
                .await;
            if !matches!(result.end, TaskEnd::Fallback) {
                report.absorb(result);
                return report;
            }
            warn!(
                provider = self.provider.name(),
                symbols = symbols.len(),
                "grouped subscription rejected, falling back to split mode for this run"
            );
            report.absorb(result);
        }

        report.mode = Some(SubscriptionMode::Split);
        report.split_tasks = symbols.len();

        let mut tasks = JoinSet::new();
        for symbol in symbols {
            let task = self.task(vec![symbol.clone()], SubscriptionMode::Split, stop.clone());
            tasks.spawn(task.run());
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    if let TaskEnd::Failed(e) = &result.end {
                        error!(subscription = %result.label, error = %e, "subscription failed");
                    }
                    report.absorb(result);
                }
                Err(e) => {
                    error!(error = %e, "subscription task aborted");
                    report.failures.push(("split".into(), TaskError::Join(e.to_string())));
                }
            }
        }
        report
    }

    fn task(&self, symbols: Vec<String>, mode: SubscriptionMode, stop: CancellationToken) -> SubscriptionTask {
        SubscriptionTask {
            provider: self.provider.clone(),
            ctx: self.ctx.clone(),
            config: self.config.clone(),
            sink: self.sink.clone(),
            board: self.board.clone(),
            stop,
            handle: SubscriptionHandle::new(symbols, mode),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription task
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum TaskEnd {
    Completed,
    Fallback,
    Failed(TaskError),
}

struct TaskResult {
    label: String,
    end: TaskEnd,
    counters: StreamCounters,
    writes: WriteStats,
    aggregation: AggregatorStats,
}

struct SubscriptionTask {
    provider: Arc<dyn MarketDataProvider>,
    ctx: RunContext,
    config: Arc<StreamConfig>,
    sink: Option<SharedSink>,
    board: Arc<SnapshotBoard>,
    stop: CancellationToken,
    handle: SubscriptionHandle,
}

impl SubscriptionTask {
    async fn run(mut self) -> TaskResult {
        let label = self.handle.label();
        let mut metrics = StreamMetrics::new(label.clone());

        let writer = self.sink.clone().map(|sink| {
            RecordWriter::new(
                self.ctx.ledger.clone(),
                sink,
                self.config.persist_forming,
                self.config.flush_every,
            )
        });
        let opts = DispatchOptions {
            trade_to_candle: self.config.trade_to_candle,
            timeframe: self.config.timeframe.clone(),
            persist_forming: self.config.persist_forming,
            flush_every: self.config.flush_every,
        };
        let mut dispatcher = Dispatcher::new(self.ctx.ledger.clone(), writer, self.board.clone(), &opts);

        let end = match self.bootstrap(&dispatcher) {
            Ok(()) => self.drive(&mut dispatcher, &mut metrics).await,
            Err(e) => TaskEnd::Failed(e.into()),
        };

        // Only elapsed buckets close here; forming ones follow `persist_forming`.
        let end = match (dispatcher.tick(self.ctx.now_ms()), end) {
            (Err(e), TaskEnd::Completed) => TaskEnd::Failed(e.into()),
            (Err(e), other) => {
                error!(subscription = %label, error = %e, "final flush failed");
                other
            }
            (Ok(()), other) => other,
        };
        metrics.log();
        debug!(subscription = %label, end = ?end, "subscription task finished");

        TaskResult {
            label,
            end,
            counters: metrics.counters(),
            writes: dispatcher.write_stats(),
            aggregation: dispatcher.aggregator_stats(),
        }
    }

    fn bootstrap(&self, dispatcher: &Dispatcher) -> Result<(), WriteError> {
        if self.config.record_kind() != Some(RecordKind::Candle) {
            return Ok(());
        }
        for symbol in &self.handle.symbols {
            let key = SeriesKey::new(symbol.clone(), self.config.timeframe.clone());
            if let Some(last) = dispatcher.bootstrap(&key)? {
                debug!(series = %key, last_open_time = last, "stream resumes after persisted candle");
            }
        }
        Ok(())
    }

    /// Run the state machine until it reaches `Stopped`.
    async fn drive(&mut self, dispatcher: &mut Dispatcher, metrics: &mut StreamMetrics) -> TaskEnd {
        let label = self.handle.label();
        let request = self.config.request(&self.handle.symbols);
        let mut stream: Option<EventStream> = None;
        let mut last_error: Option<ProviderError> = None;
        let mut event = SubEvent::Start;

        loop {
            let from = self.handle.state;
            let action = self.handle.step(event);
            debug!(subscription = %label, from = %from, to = %self.handle.state, action = ?action, "transition");

            event = match action {
                Action::Connect => self.connect(&request, &mut stream, &mut last_error).await,
                Action::Consume => match stream.take() {
                    Some(s) => match self.consume(s, dispatcher, metrics, &mut last_error).await {
                        Ok(next) => next,
                        Err(e) => return TaskEnd::Failed(e.into()),
                    },
                    None => SubEvent::StreamEnded,
                },
                Action::Sleep => {
                    let delay = self.config.backoff.delay(self.handle.attempt);
                    self.handle.attempt = self.handle.attempt.saturating_add(1);
                    metrics.reconnect();
                    warn!(
                        subscription = %label,
                        attempt = self.handle.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                        "reconnecting after backoff"
                    );
                    if sleep_cancellable(delay, &self.stop).await {
                        SubEvent::BackoffElapsed
                    } else {
                        SubEvent::Stop
                    }
                }
                Action::Fallback => return TaskEnd::Fallback,
                Action::Fail => {
                    let e = last_error
                        .take()
                        .unwrap_or_else(|| ProviderError::Rejected("subscription failed".into()));
                    return TaskEnd::Failed(e.into());
                }
                Action::Exit => return TaskEnd::Completed,
                Action::Ignore => {
                    warn!(subscription = %label, state = %self.handle.state, event = ?event, "unexpected event");
                    return TaskEnd::Completed;
                }
            };
        }
    }

    async fn connect(
        &self,
        request: &SubscriptionRequest,
        stream: &mut Option<EventStream>,
        last_error: &mut Option<ProviderError>,
    ) -> SubEvent {
        let label = self.handle.label();
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => SubEvent::Stop,
            result = self.provider.subscribe(request) => match result {
                Ok(s) => {
                    info!(
                        subscription = %label,
                        mode = %self.handle.mode,
                        channel = %request.channel,
                        symbols = request.symbols.len(),
                        "subscribed"
                    );
                    *stream = Some(s);
                    SubEvent::Connected
                }
                Err(e) => {
                    let category = self.handle.classify(e.category());
                    warn!(subscription = %label, error = %e, category = ?category, "subscribe failed");
                    *last_error = Some(e);
                    SubEvent::ConnectFailed(category)
                }
            },
        }
    }

    async fn consume(
        &mut self,
        mut stream: EventStream,
        dispatcher: &mut Dispatcher,
        metrics: &mut StreamMetrics,
        last_error: &mut Option<ProviderError>,
    ) -> Result<SubEvent, WriteError> {
        let label = self.handle.label();

        let flush_period = self.config.flush_interval.max(Duration::from_millis(10));
        let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_period, flush_period);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let metrics_period = self.config.metrics_interval.max(Duration::from_secs(1));
        let mut metrics_tick = tokio::time::interval_at(Instant::now() + metrics_period, metrics_period);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stable = tokio::time::sleep(self.config.stability_window);
        tokio::pin!(stable);
        let mut stable_reached = false;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(SubEvent::Stop),
                _ = &mut stable, if !stable_reached => {
                    stable_reached = true;
                    if self.handle.attempt > 0 {
                        info!(subscription = %label, attempts = self.handle.attempt, "connection stable, backoff reset");
                        self.handle.attempt = 0;
                    }
                }
                _ = flush_tick.tick() => dispatcher.tick(self.ctx.now_ms())?,
                _ = metrics_tick.tick() => {
                    metrics.log();
                    dispatcher.board().log(&self.handle.symbols);
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let seen = metrics.message();
                        dispatcher.dispatch(event, self.ctx.now_ms())?;
                        if self.config.max_messages.is_some_and(|max| seen >= max) {
                            info!(subscription = %label, messages = seen, "message cap reached");
                            return Ok(SubEvent::Stop);
                        }
                    }
                    Some(Err(e)) => {
                        metrics.error();
                        let category = self.handle.classify(e.category());
                        warn!(subscription = %label, error = %e, category = ?category, "stream error");
                        *last_error = Some(e);
                        return Ok(SubEvent::StreamFailed(category));
                    }
                    None => {
                        warn!(subscription = %label, "stream closed by server");
                        return Ok(SubEvent::StreamEnded);
                    }
                },
            }
        }
    }
}
