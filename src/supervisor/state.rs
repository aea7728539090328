// =============================================================================
// Subscription state machine — explicit states, events and transition table
// =============================================================================
//
//   Disconnected ─Start─▶ Connecting ─Connected─▶ Subscribed
//        ▲                  │  ▲                      │
//        │        transient │  │ BackoffElapsed       │ error / end
//        │                  ▼  │                      │
//        │                Backoff ◀───────────────────┘
//        │
//   any ─Stop─▶ Stopped      capability rejection ─▶ Stopped (fallback)
//                            permanent error      ─▶ Stopped (fail)
//
// `transition` is pure; the task loop performs the returned action and feeds
// the resulting event back in.
// =============================================================================

use std::fmt;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Disconnected,
    Connecting,
    Subscribed,
    Backoff,
    Stopped,
}

impl fmt::Display for SubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubEvent {
    Start,
    Connected,
    ConnectFailed(ErrorCategory),
    StreamFailed(ErrorCategory),
    /// Server closed the stream cleanly.
    StreamEnded,
    BackoffElapsed,
    /// Cancellation, duration expiry or message cap.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Connect,
    Consume,
    Sleep,
    /// Give up on grouped mode; the supervisor goes split.
    Fallback,
    /// Permanent failure of this subscription.
    Fail,
    Exit,
    /// Event not meaningful in this state.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Grouped,
    Split,
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grouped => write!(f, "grouped"),
            Self::Split => write!(f, "split"),
        }
    }
}

fn on_error(category: ErrorCategory) -> (SubState, Action) {
    match category {
        ErrorCategory::Transient => (SubState::Backoff, Action::Sleep),
        ErrorCategory::CapabilityUnsupported => (SubState::Stopped, Action::Fallback),
        ErrorCategory::Permanent => (SubState::Stopped, Action::Fail),
    }
}

pub fn transition(state: SubState, event: SubEvent) -> (SubState, Action) {
    use SubEvent as E;
    use SubState as S;

    match (state, event) {
        (S::Stopped, _) => (S::Stopped, Action::Ignore),
        (_, E::Stop) => (S::Stopped, Action::Exit),

        (S::Disconnected, E::Start) => (S::Connecting, Action::Connect),

        (S::Connecting, E::Connected) => (S::Subscribed, Action::Consume),
        (S::Connecting, E::ConnectFailed(c)) => on_error(c),

        (S::Subscribed, E::StreamFailed(c)) => on_error(c),
        (S::Subscribed, E::StreamEnded) => (S::Backoff, Action::Sleep),

        (S::Backoff, E::BackoffElapsed) => (S::Connecting, Action::Connect),

        (s, _) => (s, Action::Ignore),
    }
}

/// One live subscription and its reconnect bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionHandle {
    pub symbols: Vec<String>,
    pub mode: SubscriptionMode,
    pub state: SubState,
    /// Consecutive reconnect attempts since the last stable period.
    pub attempt: u32,
}

impl SubscriptionHandle {
    pub fn new(symbols: Vec<String>, mode: SubscriptionMode) -> Self {
        Self {
            symbols,
            mode,
            state: SubState::Disconnected,
            attempt: 0,
        }
    }

    /// Apply `event`, returning the action to perform.
    pub fn step(&mut self, event: SubEvent) -> Action {
        let (next, action) = transition(self.state, event);
        self.state = next;
        action
    }

    /// Errors are classified relative to the mode: a capability rejection in
    /// split mode has nowhere to fall back to and is permanent.
    pub fn classify(&self, category: ErrorCategory) -> ErrorCategory {
        match (category, self.mode) {
            (ErrorCategory::CapabilityUnsupported, SubscriptionMode::Split) => ErrorCategory::Permanent,
            (c, _) => c,
        }
    }

    pub fn label(&self) -> String {
        match self.symbols.as_slice() {
            [one] => one.clone(),
            many => format!("{}[{}]", self.mode, many.len()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_reconnect() {
        let mut h = SubscriptionHandle::new(vec!["BTCUSDT".into()], SubscriptionMode::Split);
        assert_eq!(h.step(SubEvent::Start), Action::Connect);
        assert_eq!(h.step(SubEvent::Connected), Action::Consume);
        assert_eq!(h.state, SubState::Subscribed);

        assert_eq!(h.step(SubEvent::StreamFailed(ErrorCategory::Transient)), Action::Sleep);
        assert_eq!(h.state, SubState::Backoff);
        assert_eq!(h.step(SubEvent::BackoffElapsed), Action::Connect);
        assert_eq!(h.step(SubEvent::ConnectFailed(ErrorCategory::Transient)), Action::Sleep);
        assert_eq!(h.step(SubEvent::BackoffElapsed), Action::Connect);
        assert_eq!(h.step(SubEvent::Connected), Action::Consume);
        assert_eq!(h.step(SubEvent::StreamEnded), Action::Sleep);
    }

    #[test]
    fn stop_wins_from_every_live_state() {
        for state in [
            SubState::Disconnected,
            SubState::Connecting,
            SubState::Subscribed,
            SubState::Backoff,
        ] {
            assert_eq!(transition(state, SubEvent::Stop), (SubState::Stopped, Action::Exit));
        }
        assert_eq!(
            transition(SubState::Stopped, SubEvent::Start),
            (SubState::Stopped, Action::Ignore)
        );
    }

    #[test]
    fn capability_rejection_falls_back_only_when_grouped() {
        let grouped = SubscriptionHandle::new(vec!["A".into(), "B".into()], SubscriptionMode::Grouped);
        let split = SubscriptionHandle::new(vec!["A".into()], SubscriptionMode::Split);

        let c = ErrorCategory::CapabilityUnsupported;
        assert_eq!(
            transition(SubState::Connecting, SubEvent::ConnectFailed(grouped.classify(c))),
            (SubState::Stopped, Action::Fallback)
        );
        assert_eq!(
            transition(SubState::Connecting, SubEvent::ConnectFailed(split.classify(c))),
            (SubState::Stopped, Action::Fail)
        );
    }

    #[test]
    fn permanent_error_fails() {
        assert_eq!(
            transition(SubState::Subscribed, SubEvent::StreamFailed(ErrorCategory::Permanent)),
            (SubState::Stopped, Action::Fail)
        );
    }

    #[test]
    fn unexpected_events_are_ignored() {
        assert_eq!(
            transition(SubState::Subscribed, SubEvent::BackoffElapsed),
            (SubState::Subscribed, Action::Ignore)
        );
    }

    #[test]
    fn labels() {
        let h = SubscriptionHandle::new(vec!["A".into(), "B".into()], SubscriptionMode::Grouped);
        assert_eq!(h.label(), "grouped[2]");
    }
}
