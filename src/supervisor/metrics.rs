// Per-subscription counters, logged at a fixed cadence and summed into the
// task report.

use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
}

impl StreamCounters {
    pub fn absorb(&mut self, other: StreamCounters) {
        self.messages += other.messages;
        self.errors += other.errors;
        self.reconnects += other.reconnects;
    }
}

pub struct StreamMetrics {
    label: String,
    started: Instant,
    counters: StreamCounters,
    messages_at_last_log: u64,
    last_log: Instant,
}

impl StreamMetrics {
    pub fn new(label: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            label: label.into(),
            started: now,
            counters: StreamCounters::default(),
            messages_at_last_log: 0,
            last_log: now,
        }
    }

    pub fn message(&mut self) -> u64 {
        self.counters.messages += 1;
        self.counters.messages
    }

    pub fn error(&mut self) {
        self.counters.errors += 1;
    }

    pub fn reconnect(&mut self) {
        self.counters.reconnects += 1;
    }

    pub fn counters(&self) -> StreamCounters {
        self.counters
    }

    pub fn log(&mut self) {
        let now = Instant::now();
        let window = now.duration_since(self.last_log).max(Duration::from_millis(1));
        let delta = self.counters.messages - self.messages_at_last_log;
        let rate = delta as f64 / window.as_secs_f64();

        info!(
            subscription = %self.label,
            messages = self.counters.messages,
            errors = self.counters.errors,
            reconnects = self.counters.reconnects,
            msg_per_sec = format!("{rate:.2}"),
            uptime_secs = now.duration_since(self.started).as_secs(),
            "stream metrics"
        );

        self.messages_at_last_log = self.counters.messages;
        self.last_log = now;
    }
}
