// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Two-state circuit breaker guarding the collector.
//!
//! ```text
//!            failures >= max_failures
//!   Closed ───────────────────────────> Open
//!     ^                                   │
//!     │   is_open() after open_duration   │
//!     └───────────────────────────────────┘
//!         record_success() from any state
//! ```
//!
//! There is no half-open probe state. Healing happens lazily inside [`CircuitBreaker::is_open`],
//! so the breaker needs no timer of its own and piggybacks on the scheduler tick.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Sends permitted.
    Closed,
    /// Sends suppressed until the cool-down elapses.
    Open,
}

/// Point-in-time view of the breaker for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Only set while `state` is [`CircuitState::Open`].
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    max_failures: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(max_failures: u32, open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            max_failures: max_failures.max(1),
            open_duration,
        }
    }

    /// Asks for permission to send.
    ///
    /// Heals the breaker as a side effect once the cool-down has elapsed.
    pub fn is_open(&mut self, now: Instant) -> bool {
        if self.state == CircuitState::Closed {
            return false;
        }

        let elapsed = self
            .opened_at
            .map_or(self.open_duration, |opened_at| {
                now.saturating_duration_since(opened_at)
            });
        if elapsed >= self.open_duration {
            info!(
                "BREAKER | Cool-down of {} ms elapsed, closing circuit",
                self.open_duration.as_millis()
            );
            self.close();
            return false;
        }

        true
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.state == CircuitState::Closed && self.consecutive_failures >= self.max_failures {
            warn!(
                "BREAKER | Opening circuit after {} consecutive failures, pausing sends for {} ms",
                self.consecutive_failures,
                self.open_duration.as_millis()
            );
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }

    /// A single success fully heals the breaker.
    pub fn record_success(&mut self) {
        if self.state == CircuitState::Open {
            info!("BREAKER | Send succeeded, closing circuit");
        }
        self.close();
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }
}
