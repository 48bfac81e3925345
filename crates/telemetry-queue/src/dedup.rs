// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Suppression of repeated errors inside a sliding time window.
//!
//! A render error firing every frame would otherwise fill the queue with copies of the
//! same record. Entries are compared by a derived signature, never by timestamp.
//!
//! The index is pruned lazily on every check: signatures not seen for twice the window
//! are evicted, which is the only place the index size is bounded.

use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use tokio::time::Instant;

use crate::entry::Entry;

/// Builds the identity of an entry from the fields that make two errors "the same".
///
/// Each segment is length-prefixed (`{len}:{value}|`), so a `|` inside a message cannot
/// shift a field boundary. Missing fields contribute an empty segment, so `None` and
/// `Some("")` collide; both mean "no detail".
#[must_use]
pub fn signature(entry: &Entry) -> String {
    let status = entry
        .status_code
        .map(|code| code.to_string())
        .unwrap_or_default();
    let segments = [
        entry.message.as_str(),
        entry.exception_message.as_deref().unwrap_or_default(),
        status.as_str(),
        entry.request_url.as_deref().unwrap_or_default(),
        entry.stack_trace_prefix.as_deref().unwrap_or_default(),
    ];

    let mut signature = String::new();
    for segment in segments {
        // Writing into a String cannot fail.
        let _ = write!(signature, "{}:{}|", segment.len(), segment);
    }
    signature
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl Deduplicator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Returns `true` if the entry's signature was recorded within the window.
    ///
    /// A duplicate does not refresh the recorded instant, so a continuous error loop
    /// still lets one entry through per window.
    pub fn is_duplicate(&mut self, entry: &Entry, now: Instant) -> bool {
        self.prune(now);

        let signature = signature(entry);
        if let Some(seen) = self.last_seen.get(&signature) {
            if now.saturating_duration_since(*seen) < self.window {
                return true;
            }
        }

        self.last_seen.insert(signature, now);
        false
    }

    /// Evicts signatures last seen more than twice the window ago.
    pub fn prune(&mut self, now: Instant) {
        let horizon = self.window.saturating_mul(2);
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) <= horizon);
    }

    /// Number of signatures currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}
