// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Telemetry Queue
//!
//! A durable, rate-limited, failure-aware queue that captures client errors and ships
//! them to a remote collector without amplifying an outage or losing diagnostic data
//! across restarts.
//!
//! ## Pipeline
//!
//! ```text
//!   producer ──> Deduplicator ──(new)──> DurableStore ──> persisted JSON array
//!                     │                       │
//!                  (dup) drop                 │  every batch_interval
//!                                             v
//!                                      BatchScheduler ──> CircuitBreaker open? skip
//!                                             │
//!                                             v
//!                                        Transport ──> collector
//! ```
//!
//! - [`queue`]: the [`ReliabilityQueue`] façade, the single producer entry point
//! - [`dedup`]: suppression of repeated errors inside a time window
//! - [`store`]: the persisted pending-entry list and its key/value backends
//! - [`circuit_breaker`]: two-state breaker halting sends after repeated failures
//! - [`scheduler`]: the periodic batch sender with its in-flight guard
//! - [`transport`]: the collector boundary and its HTTP implementation

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod dedup;
pub mod entry;
pub mod error;
pub mod http;
pub mod logger;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use config::QueueConfig;
pub use entry::{Entry, Level};
pub use queue::{EnqueueOutcome, QueueStats, ReliabilityQueue};
pub use scheduler::{BatchScheduler, TickOutcome};
pub use transport::{Delivery, HttpTransport, Transport};
