// =============================================================================
// Run context — state shared by every task of one batch run
// =============================================================================
//
// Passed explicitly to the fetcher, supervisor and runner so several runs can
// live in one process (tests do exactly that). Cloning is cheap.
// =============================================================================

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::ledger::Ledger;
use crate::sink::SinkRegistry;

/// Historical fetches allowed in flight at once, run-wide.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 4;

#[derive(Clone)]
pub struct RunContext {
    pub ledger: Arc<Ledger>,
    pub sinks: Arc<SinkRegistry>,
    pub cancel: CancellationToken,
    pub clock: Arc<dyn Clock>,
    pub fetch_permits: Arc<Semaphore>,
}

impl RunContext {
    pub fn new(clock: Arc<dyn Clock>, max_concurrent_fetches: usize) -> Self {
        Self {
            ledger: Arc::new(Ledger::new()),
            sinks: Arc::new(SinkRegistry::new()),
            cancel: CancellationToken::new(),
            clock,
            fetch_permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), DEFAULT_MAX_CONCURRENT_FETCHES)
    }
}
