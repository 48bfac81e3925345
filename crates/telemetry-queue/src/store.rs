// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable storage for the pending-entry list.
//!
//! The whole queue lives under a single key as a JSON array and is overwritten on every
//! mutation; there is no incremental format. The in-memory copy is authoritative: if a
//! write fails the entry stays queued for this process and the error is reported to the
//! caller, who logs it.
//!
//! # Backends
//!
//! - [`SledStore`]: sled database on disk (or a temporary one), survives restarts
//! - [`MemoryStore`]: process-local map, with injectable write failures
//!
//! # Guarantees
//!
//! An entry leaves the store only through [`DurableStore::remove_sent`] after a
//! delivery, or through drop-oldest eviction once `max_entries` is reached. Every
//! appended entry is first written to the local diagnostic console (a `tracing` event
//! at the entry's severity), so it is visible even if persistence and transport both
//! fail afterwards.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sled::{Config as SledConfig, Db, IVec};
use tracing::{debug, error, info, warn};

use crate::entry::{Entry, Level};
use crate::error::StoreError;

/// Minimal key/value contract the queue needs from durable storage.
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the value stored under `key`. Must be durable when it returns `Ok`.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// sled-backed store.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: Db,
    path: PathBuf,
}

impl SledStore {
    /// Opens (or creates) a store at the provided path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }

        let db = SledConfig::new().path(&path).open()?;
        Ok(Self { db, path })
    }

    /// Opens an in-memory store (ephemeral across restarts).
    pub fn open_ephemeral() -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        Ok(Self {
            db,
            path: PathBuf::new(),
        })
    }

    /// Returns the filesystem path backing the store.
    ///
    /// Ephemeral stores return an empty path because data resides in memory only.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?.map(ivec_to_vec))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }
}

/// Converts sled's owned buffer type into a plain `Vec<u8>`.
fn ivec_to_vec(value: IVec) -> Vec<u8> {
    value.as_ref().to_vec()
}

/// Process-local store.
///
/// Used by hosts without a writable disk and by tests, which can make every write fail
/// to simulate an exhausted storage quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a raw value, bypassing failure injection.
    #[must_use]
    pub fn with_value(self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let values = self
            .values
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("storage quota exceeded".to_string()));
        }
        let mut values = self
            .values
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The pending-entry list, mirrored to a [`KeyValueStore`] after every mutation.
#[derive(Debug)]
pub struct DurableStore {
    backend: Arc<dyn KeyValueStore>,
    key: String,
    entries: VecDeque<Entry>,
    max_entries: usize,
    /// Monotonic count of entries evicted from the head.
    evicted: u64,
}

impl DurableStore {
    /// Restores the queue persisted under `key`.
    ///
    /// Never fails: a missing value, an unreadable backend, or a value that does not
    /// parse all start an empty queue.
    pub fn load(backend: Arc<dyn KeyValueStore>, key: impl Into<String>, max_entries: usize) -> Self {
        let key = key.into();
        let max_entries = max_entries.max(1);

        let mut entries = match backend.get(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<VecDeque<Entry>>(&bytes) {
                Ok(entries) => {
                    info!("STORE | Restored {} pending entries", entries.len());
                    entries
                }
                Err(e) => {
                    error!("STORE | Persisted queue is corrupt, starting empty: {}", e);
                    VecDeque::new()
                }
            },
            Ok(None) => {
                debug!("STORE | No persisted queue under key {}", key);
                VecDeque::new()
            }
            Err(e) => {
                error!("STORE | Failed to read persisted queue, starting empty: {}", e);
                VecDeque::new()
            }
        };

        let mut evicted = 0;
        if entries.len() > max_entries {
            let excess = entries.len() - max_entries;
            warn!(
                "STORE | Persisted queue holds {} entries, dropping the {} oldest",
                entries.len(),
                excess
            );
            entries.drain(..excess);
            evicted = excess as u64;
        }

        Self {
            backend,
            key,
            entries,
            max_entries,
            evicted,
        }
    }

    /// Adds an entry at the tail and persists the whole queue.
    ///
    /// The entry is written to the diagnostic console first. On `Err` the entry is
    /// still queued in memory.
    pub fn append(&mut self, entry: Entry) -> Result<(), StoreError> {
        log_to_console(&entry);

        while self.entries.len() >= self.max_entries {
            if let Some(dropped) = self.entries.pop_front() {
                self.evicted += 1;
                warn!(
                    "STORE | Queue full ({} entries), evicting oldest entry: {}",
                    self.max_entries, dropped.message
                );
            }
        }
        self.entries.push_back(entry);

        self.persist()
    }

    /// Drops the first `count` entries, the ones just delivered, and persists.
    pub fn remove_sent(&mut self, count: usize) -> Result<(), StoreError> {
        let count = count.min(self.entries.len());
        if count == 0 {
            return Ok(());
        }
        self.entries.drain(..count);
        self.persist()
    }

    /// Clones of the oldest `n` entries, in send order.
    #[must_use]
    pub fn head(&self, n: usize) -> Vec<Entry> {
        self.entries.iter().take(n).cloned().collect()
    }

    /// Writes the full queue under the store key.
    pub fn persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.entries)?;
        self.backend.set(&self.key, &bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

/// Local diagnostic sink: every accepted entry shows up in the process log.
fn log_to_console(entry: &Entry) {
    let source = entry.source_context.as_deref().unwrap_or("unknown");
    let exception = entry.exception_message.as_deref().unwrap_or_default();
    match entry.level {
        Level::Critical | Level::Error => {
            error!(source, exception, "CONSOLE | [{}] {}", entry.level, entry.message);
        }
        Level::Warning => {
            warn!(source, exception, "CONSOLE | [{}] {}", entry.level, entry.message);
        }
        Level::Info => {
            info!(source, exception, "CONSOLE | [{}] {}", entry.level, entry.message);
        }
        Level::Debug => {
            debug!(source, exception, "CONSOLE | [{}] {}", entry.level, entry.message);
        }
    }
}
