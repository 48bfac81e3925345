// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The reliability queue: the single entry point producers talk to.
//!
//! # Ownership
//!
//! ```text
//!   ReliabilityQueue (cloneable handle)
//!        │  Arc<Mutex<_>>
//!        v
//!   QueueState ──┬── Deduplicator
//!                ├── DurableStore ──> KeyValueStore
//!                ├── CircuitBreaker
//!                └── in_flight flag
//! ```
//!
//! The mutex is only ever held for synchronous bookkeeping, never across an `.await`.
//! [`ReliabilityQueue::enqueue`] therefore never waits on the network and is safe to
//! call from a panic hook or an error handler: it cannot panic, and a poisoned lock is
//! recovered rather than propagated.

use std::cell::Cell;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::QueueConfig;
use crate::dedup::Deduplicator;
use crate::entry::Entry;
use crate::error::TransportError;
use crate::scheduler::TickOutcome;
use crate::store::{DurableStore, KeyValueStore};
use crate::transport::Delivery;

thread_local! {
    static IN_ENQUEUE: Cell<bool> = const { Cell::new(false) };
}

/// What happened to an entry handed to [`ReliabilityQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued (and written to the console), even if persisting it failed.
    Accepted,
    /// Same signature seen inside the dedup window; dropped.
    Duplicate,
    /// Produced while this thread was already inside `enqueue`, typically by a log
    /// subscriber forwarding the queue's own console output. Dropped to break the loop;
    /// the original entry is already in the console.
    Reentrant,
}

/// Diagnostics snapshot of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: bool,
    pub accepted: u64,
    pub duplicates: u64,
    pub evicted: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed_sends: u64,
    pub breaker: BreakerSnapshot,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    accepted: u64,
    duplicates: u64,
    delivered: u64,
    dropped: u64,
    failed_sends: u64,
}

#[derive(Debug)]
pub(crate) struct QueueState {
    dedup: Deduplicator,
    store: DurableStore,
    breaker: CircuitBreaker,
    in_flight: bool,
    counters: Counters,
}

/// Handle to the queue. Clones share the same state.
#[derive(Debug, Clone)]
pub struct ReliabilityQueue {
    state: Arc<Mutex<QueueState>>,
    config: Arc<QueueConfig>,
}

impl ReliabilityQueue {
    /// Builds the queue and hydrates it from whatever `backend` holds under the
    /// configured storage key. Zero sizes and durations in `config` are raised to their
    /// minimum, see [`QueueConfig::clamped`].
    #[must_use]
    pub fn new(config: QueueConfig, backend: Arc<dyn KeyValueStore>) -> Self {
        let requested = config;
        let config = requested.clone().clamped();
        if config != requested {
            warn!(
                "QUEUE | Configuration had zero values, using batch size {}, interval {:?}, send timeout {:?}",
                config.batch_size, config.batch_interval, config.send_timeout
            );
        }

        let store = DurableStore::load(backend, config.storage_key.clone(), config.max_queue_size);
        let state = QueueState {
            dedup: Deduplicator::new(config.dedup_window),
            store,
            breaker: CircuitBreaker::new(config.max_failures, config.circuit_open_duration),
            in_flight: false,
            counters: Counters::default(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
        }
    }

    /// Accepts an entry for delivery. Synchronous, never blocks on I/O other than the
    /// local persist, never panics.
    pub fn enqueue(&self, entry: Entry) -> EnqueueOutcome {
        let Some(_reentrancy) = ReentrancyGuard::enter() else {
            return EnqueueOutcome::Reentrant;
        };

        let now = Instant::now();
        let mut state = self.lock();

        if state.dedup.is_duplicate(&entry, now) {
            state.counters.duplicates += 1;
            debug!("QUEUE | Dropping duplicate entry: {}", entry.message);
            return EnqueueOutcome::Duplicate;
        }

        if let Err(e) = state.store.append(entry) {
            error!(
                "QUEUE | Failed to persist queue, keeping {} entries in memory: {}",
                state.store.len(),
                e
            );
        }
        state.counters.accepted += 1;
        EnqueueOutcome::Accepted
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.store.len(),
            in_flight: state.in_flight,
            accepted: state.counters.accepted,
            duplicates: state.counters.duplicates,
            evicted: state.store.evicted(),
            delivered: state.counters.delivered,
            dropped: state.counters.dropped,
            failed_sends: state.counters.failed_sends,
            breaker: state.breaker.snapshot(),
        }
    }

    /// Clones of the pending entries in send order.
    #[must_use]
    pub fn pending(&self) -> Vec<Entry> {
        self.lock().store.entries().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().store.is_empty()
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Claims the head of the queue for one send.
    ///
    /// Checks, in order: a batch already in flight, the breaker (which may heal here),
    /// an empty queue.
    pub(crate) fn begin_batch(&self, now: Instant) -> Result<Batch, TickOutcome> {
        let mut state = self.lock();

        if state.in_flight {
            return Err(TickOutcome::InFlight);
        }
        if state.breaker.is_open(now) {
            return Err(TickOutcome::CircuitOpen);
        }
        if state.store.is_empty() {
            return Err(TickOutcome::Idle);
        }

        state.in_flight = true;
        Ok(Batch {
            entries: state.store.head(self.config.batch_size),
            evicted_at_start: state.store.evicted(),
            guard: InFlightGuard {
                state: Arc::clone(&self.state),
                armed: true,
            },
        })
    }

    /// Applies the result of a send and releases the in-flight flag.
    pub(crate) fn complete_batch(
        &self,
        batch: Batch,
        result: Result<Delivery, TransportError>,
        now: Instant,
    ) -> TickOutcome {
        let Batch {
            entries,
            evicted_at_start,
            mut guard,
        } = batch;
        guard.disarm();

        let mut state = self.lock();
        state.in_flight = false;
        let sent = entries.len();

        match result {
            Ok(delivery) => {
                remove_delivered(&mut state.store, sent, evicted_at_start);
                state.breaker.record_success();
                state.counters.delivered += sent as u64;
                TickOutcome::Delivered {
                    count: sent,
                    status: delivery.status,
                }
            }
            Err(TransportError::Payload(msg)) => {
                error!(
                    "QUEUE | Failed to prepare payload. {} entries dropped: {}",
                    sent, msg
                );
                remove_delivered(&mut state.store, sent, evicted_at_start);
                state.counters.dropped += sent as u64;
                TickOutcome::Dropped { count: sent }
            }
            Err(e) => {
                warn!(
                    "QUEUE | Failed to send batch of {} entries, will retry: {}",
                    sent, e
                );
                state.breaker.record_failure(now);
                state.counters.failed_sends += 1;
                TickOutcome::Failed
            }
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the `sent` head entries, minus any that were evicted while the batch was in
/// flight (those are already gone and must not take newer entries with them).
fn remove_delivered(store: &mut DurableStore, sent: usize, evicted_at_start: u64) {
    let evicted_since = store.evicted().saturating_sub(evicted_at_start);
    let to_remove = sent.saturating_sub(usize::try_from(evicted_since).unwrap_or(usize::MAX));
    if let Err(e) = store.remove_sent(to_remove) {
        error!(
            "QUEUE | Failed to persist queue after removing {} sent entries: {}",
            to_remove, e
        );
    }
}

/// A claimed slice of the queue head.
#[derive(Debug)]
pub(crate) struct Batch {
    pub(crate) entries: Vec<Entry>,
    evicted_at_start: u64,
    guard: InFlightGuard,
}

/// Releases the in-flight flag if a send is abandoned (task aborted, future dropped).
#[derive(Debug)]
struct InFlightGuard {
    state: Arc<Mutex<QueueState>>,
    armed: bool,
}

impl InFlightGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("QUEUE | Batch abandoned before completion, releasing in-flight flag");
            lock_state(&self.state).in_flight = false;
        }
    }
}

/// Marks the current thread as inside `enqueue`.
struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        IN_ENQUEUE.with(|flag| {
            if flag.replace(true) {
                None
            } else {
                Some(ReentrancyGuard)
            }
        })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        IN_ENQUEUE.with(|flag| flag.set(false));
    }
}
