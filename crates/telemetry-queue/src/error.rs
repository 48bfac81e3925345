// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for each internal boundary of the queue.
//!
//! None of these cross [`crate::ReliabilityQueue::enqueue`]; they exist so persistence
//! and transport failures can be matched on and tested instead of inferred from logs.

use std::time::Duration;

/// Failures of the durable key/value backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend refused the operation (quota exceeded, storage disabled).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a batch send.
///
/// Only `Network` and `Timeout` count against the circuit breaker. An HTTP response of
/// any status is a [`crate::Delivery`], not an error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The batch could not be encoded. Retrying would fail the same way.
    #[error("failed to prepare payload: {0}")]
    Payload(String),
}

/// Every reqwest failure is retryable. A builder error (bad endpoint URL, bad proxy)
/// says nothing about the batch, so it must keep the batch queued and count against the
/// breaker like any other connection fault.
impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Network(err.to_string())
    }
}

/// Invalid configuration values.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
