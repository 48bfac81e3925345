// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic batch delivery.
//!
//! Every `batch_interval` the scheduler spawns a tick. A tick claims up to `batch_size`
//! entries from the head of the queue, hands them to the [`Transport`] and, once the send
//! resolves, removes them or records the failure. At most one batch is on the wire at any
//! time: a tick that fires while a previous send is still pending returns
//! [`TickOutcome::InFlight`] without touching the transport.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::TransportError;
use crate::queue::ReliabilityQueue;
use crate::transport::Transport;

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous batch is still being sent.
    InFlight,
    /// The breaker is open; nothing was sent.
    CircuitOpen,
    /// Nothing queued.
    Idle,
    /// The collector answered; `count` entries left the queue.
    Delivered { count: usize, status: u16 },
    /// Network error or timeout; the batch stays queued.
    Failed,
    /// The batch could not be encoded and was discarded.
    Dropped { count: usize },
}

#[derive(Clone)]
pub struct BatchScheduler {
    queue: ReliabilityQueue,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    #[must_use]
    pub fn new(queue: ReliabilityQueue, transport: Arc<dyn Transport>) -> Self {
        Self { queue, transport }
    }

    #[must_use]
    pub fn queue(&self) -> &ReliabilityQueue {
        &self.queue
    }

    /// Attempts one batch.
    ///
    /// Dropping the returned future mid-send releases the in-flight flag and leaves the
    /// batch queued.
    pub async fn tick(&self) -> TickOutcome {
        let batch = match self.queue.begin_batch(Instant::now()) {
            Ok(batch) => batch,
            Err(skipped) => {
                match skipped {
                    TickOutcome::InFlight => {
                        debug!("SCHEDULER | Previous batch still in flight, skipping tick");
                    }
                    TickOutcome::CircuitOpen => {
                        debug!("SCHEDULER | Circuit open, skipping tick");
                    }
                    _ => {}
                }
                return skipped;
            }
        };

        let timeout = self.queue.config().send_timeout;
        debug!("SCHEDULER | Sending batch of {} entries", batch.entries.len());
        let result = match tokio::time::timeout(timeout, self.transport.send(&batch.entries)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        self.queue.complete_batch(batch, result, Instant::now())
    }

    /// Sends batches back to back until the queue is empty or a tick stops making
    /// progress (breaker open, send failure, batch in flight). Returns the number of
    /// entries that left the queue.
    pub async fn flush(&self) -> usize {
        let mut removed = 0;
        loop {
            match self.tick().await {
                TickOutcome::Delivered { count, .. } | TickOutcome::Dropped { count }
                    if count > 0 =>
                {
                    removed += count;
                }
                _ => break,
            }
        }
        removed
    }

    /// Drives ticks every `batch_interval` until `cancel_token` fires, then waits for the
    /// pending send and flushes what is left.
    pub async fn run(self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.queue.config().batch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        let mut ticks: JoinSet<TickOutcome> = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    break;
                }
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    ticks.spawn(async move { scheduler.tick().await });
                }
                Some(joined) = ticks.join_next() => {
                    log_tick(joined);
                }
            }
        }

        info!("SCHEDULER | Shutting down, flushing pending entries");
        while let Some(joined) = ticks.join_next().await {
            log_tick(joined);
        }
        let removed = self.flush().await;
        let remaining = self.queue.len();
        if remaining > 0 {
            info!(
                "SCHEDULER | Final flush sent {} entries, {} left for the next start",
                removed, remaining
            );
        } else {
            debug!("SCHEDULER | Final flush sent {} entries", removed);
        }
    }
}

fn log_tick(joined: Result<TickOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => debug!("SCHEDULER | Tick finished: {:?}", outcome),
        Err(e) => error!("SCHEDULER | Tick task failed: {}", e),
    }
}
