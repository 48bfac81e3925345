// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults for the queue pipeline.
//!
//! Every value here can be overridden through [`crate::config::QueueConfig`].

/// Entries shipped per transport call.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Scheduler tick period in milliseconds.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 5_000;

/// Consecutive transport failures that open the circuit.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// How long the circuit stays open before the next permission check heals it.
pub const DEFAULT_CIRCUIT_OPEN_DURATION_MS: u64 = 30_000;

/// Window inside which identical signatures collapse to one entry.
pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;

/// Maximum pending entries kept before the oldest is evicted.
///
/// Assuming entries of a few kilobytes each, 1,000 entries keeps the persisted value
/// well under a megabyte while still covering several minutes of a noisy outage.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 1_000;

/// Upper bound on a single transport call, in milliseconds.
///
/// A hung request must resolve as a failure, otherwise the in-flight guard would
/// starve every following tick.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;

/// Storage key holding the JSON array of pending entries.
pub const DEFAULT_STORAGE_KEY: &str = "telemetry.pending-entries";

/// Characters of a stack trace kept in `stackTracePrefix`.
pub const STACK_TRACE_PREFIX_CHARS: usize = 100;
