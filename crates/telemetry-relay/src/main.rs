// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, path::Path, sync::Arc};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_queue::{
    config::RelayConfig,
    logger::Formatter,
    store::{KeyValueStore, MemoryStore, SledStore},
    BatchScheduler, Entry, HttpTransport, Level, ReliabilityQueue,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TELEMETRY_LOG_LEVEL")
        .map(|val| val.trim().to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match RelayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on telemetry relay startup: {e}");
            return;
        }
    };

    let backend = open_backend(config.storage_path.as_deref());
    let queue = ReliabilityQueue::new(config.queue.clone(), backend);

    let mut transport = HttpTransport::new(
        config.collector_url.clone(),
        config.queue.send_timeout,
        config.https_proxy.as_deref(),
    );
    if config.use_compression {
        transport = transport.with_compression(config.compression_level);
    }

    let scheduler = BatchScheduler::new(queue.clone(), Arc::new(transport));
    let cancel_token = CancellationToken::new();
    let scheduler_handle = tokio::spawn(scheduler.run(cancel_token.clone()));

    info!(
        "RELAY | Shipping entries to {} every {:?}, {} pending from previous runs",
        config.collector_url,
        config.queue.batch_interval,
        queue.len()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut lines = BufReader::new(stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(entry) = parse_line(&line) {
                        queue.enqueue(entry);
                    }
                }
                Ok(None) => {
                    info!("RELAY | Input closed");
                    break;
                }
                Err(e) => {
                    error!("RELAY | Failed to read input: {e}");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("RELAY | Interrupted");
                break;
            }
        }
    }

    cancel_token.cancel();
    if let Err(e) = scheduler_handle.await {
        error!("RELAY | Scheduler task failed: {e}");
    }

    let stats = queue.stats();
    info!(
        "RELAY | Stopped: {} accepted, {} duplicates, {} delivered, {} pending",
        stats.accepted, stats.duplicates, stats.delivered, stats.pending
    );
}

/// Opens the sled backend, or an in-memory one if sled cannot be opened so entries are
/// still shipped for the lifetime of the process.
fn open_backend(path: Option<&Path>) -> Arc<dyn KeyValueStore> {
    let opened = match path {
        Some(path) => SledStore::open(path),
        None => SledStore::open_ephemeral(),
    };

    match opened {
        Ok(store) => {
            debug!("RELAY | Pending queue stored at {}", store.path().display());
            Arc::new(store)
        }
        Err(e) => {
            error!("RELAY | Failed to open storage, queue will not survive restarts: {e}");
            Arc::new(MemoryStore::new())
        }
    }
}

/// One input line to one entry. Lines that are not JSON entries are still reported.
fn parse_line(line: &str) -> Option<Entry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_str::<Entry>(line) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("RELAY | Input line is not a JSON entry, forwarding as text: {e}");
            Some(Entry::new(Level::Error, line).with_source_context("stdin"))
        }
    }
}
