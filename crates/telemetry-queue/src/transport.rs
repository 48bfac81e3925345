// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The collector boundary.
//!
//! A batch is POSTed as a JSON array of entries. Any HTTP response counts as delivered,
//! whatever its status: a collector rejecting a malformed batch must not open the
//! circuit. Only connection-level failures and timeouts are errors.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, warn};
use zstd::stream::write::Encoder;

use crate::entry::Entry;
use crate::error::TransportError;
use crate::http::get_client;

/// Outcome of a batch that reached the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// HTTP status returned by the collector.
    pub status: u16,
}

impl Delivery {
    /// Whether the collector answered 2xx. Only used to pick the log level: the queue
    /// treats every `Delivery`, whatever its status, as delivered.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Ships one batch to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, entries: &[Entry]) -> Result<Delivery, TransportError>;
}

/// reqwest-based transport posting JSON arrays to a collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    /// zstd level, `None` sends the JSON uncompressed.
    compression_level: Option<i32>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration, https_proxy: Option<&str>) -> Self {
        Self::with_client(get_client(timeout, https_proxy), endpoint, timeout)
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
            compression_level: None,
        }
    }

    /// Compresses request bodies with zstd at the given level.
    #[must_use]
    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn encode(&self, entries: &[Entry]) -> Result<Vec<u8>, TransportError> {
        let json =
            serde_json::to_vec(entries).map_err(|e| TransportError::Payload(e.to_string()))?;

        let Some(level) = self.compression_level else {
            return Ok(json);
        };

        let compress = || -> std::io::Result<Vec<u8>> {
            let mut encoder = Encoder::new(Vec::new(), level)?;
            encoder.write_all(&json)?;
            encoder.finish()
        };
        compress().map_err(|e| TransportError::Payload(format!("failed to compress batch: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, entries: &[Entry]) -> Result<Delivery, TransportError> {
        let body = self.encode(entries)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json");
        if self.compression_level.is_some() {
            request = request.header(CONTENT_ENCODING, "zstd");
        }

        match request.body(body).send().await {
            Ok(response) => {
                let delivery = Delivery {
                    status: response.status().as_u16(),
                };
                if delivery.is_success() {
                    debug!(
                        "TRANSPORT | Collector accepted {} entries with status {}",
                        entries.len(),
                        delivery.status
                    );
                } else {
                    // Delivered as far as the queue is concerned; the collector decided.
                    warn!(
                        "TRANSPORT | {}: Collector rejected batch of {} entries: {:?}",
                        delivery.status,
                        entries.len(),
                        response.text().await.unwrap_or_default()
                    );
                }
                Ok(delivery)
            }
            Err(e) if e.is_timeout() => Err(TransportError::Timeout(self.timeout)),
            Err(e) => Err(e.into()),
        }
    }
}
