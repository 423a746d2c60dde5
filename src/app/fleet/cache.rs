//! Refresh-ahead cache in front of discovery.
//!
//! Entries are one [`FleetSnapshot`] per scope key, held zstd-compressed in a
//! `moka::sync::Cache`. Reads are classified by age:
//!
//! - **fresh** (age < ttl): served from memory, no backend call
//! - **stale** (ttl <= age < hard expiry): served from memory, and a single detached
//!   refresh is scheduled for the key
//! - **miss** (absent, past hard expiry, or undecodable): discovery runs synchronously,
//!   bounded by the miss timeout; failure yields [`CacheResponse::Unavailable`]
//!
//! A failed refresh leaves the previous entry in place, so the last good payload keeps
//! being served until the hard expiry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::FleetError;
use super::state::FleetSnapshot;
use crate::app::fleet_config::CacheSettings;

/// Produces a fresh snapshot for a scope key.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn load(&self, key: &str) -> Result<FleetSnapshot, FleetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Fresh,
    Stale,
    Miss,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Fresh => "fresh",
            CacheState::Stale => "stale",
            CacheState::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CacheResponse {
    Fresh {
        payload: FleetSnapshot,
        age: Duration,
    },
    Stale {
        payload: FleetSnapshot,
        age: Duration,
        /// False when a refresh for this key was already in flight
        refresh_scheduled: bool,
    },
    /// A miss satisfied by synchronous discovery
    Loaded { payload: FleetSnapshot },
    /// A miss that could not be satisfied in time
    Unavailable { reason: String },
}

impl CacheResponse {
    pub fn state(&self) -> CacheState {
        match self {
            CacheResponse::Fresh { .. } => CacheState::Fresh,
            CacheResponse::Stale { .. } => CacheState::Stale,
            CacheResponse::Loaded { .. } | CacheResponse::Unavailable { .. } => CacheState::Miss,
        }
    }

    pub fn payload(&self) -> Option<&FleetSnapshot> {
        match self {
            CacheResponse::Fresh { payload, .. }
            | CacheResponse::Stale { payload, .. }
            | CacheResponse::Loaded { payload } => Some(payload),
            CacheResponse::Unavailable { .. } => None,
        }
    }

    pub fn into_payload(self) -> Option<FleetSnapshot> {
        match self {
            CacheResponse::Fresh { payload, .. }
            | CacheResponse::Stale { payload, .. }
            | CacheResponse::Loaded { payload } => Some(payload),
            CacheResponse::Unavailable { .. } => None,
        }
    }
}

/// Memory statistics from the cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entry_count: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub refreshes_in_flight: usize,
    /// Discovery invocations made by the cache, misses and refreshes together
    pub backend_loads: u64,
}

struct CompressedPayload {
    data: Vec<u8>,
    uncompressed_size: usize,
}

impl CompressedPayload {
    fn compress(snapshot: &FleetSnapshot) -> Result<Self> {
        let serialized = serde_json::to_vec(snapshot).context("JSON serialization failed")?;
        let mut encoder =
            zstd::Encoder::new(Vec::new(), 13).context("zstd encoder creation failed")?;
        encoder
            .write_all(&serialized)
            .context("zstd compression failed")?;
        let data = encoder.finish().context("zstd finish failed")?;
        Ok(Self {
            data,
            uncompressed_size: serialized.len(),
        })
    }

    fn decompress(&self) -> Result<FleetSnapshot> {
        let mut decoder =
            zstd::Decoder::new(&self.data[..]).context("zstd decoder creation failed")?;
        let mut decompressed = Vec::with_capacity(self.uncompressed_size);
        decoder
            .read_to_end(&mut decompressed)
            .context("zstd decompression failed")?;
        serde_json::from_slice(&decompressed).context("JSON deserialization failed")
    }
}

#[derive(Clone)]
struct CachedEntry {
    payload: Arc<CompressedPayload>,
    fetched_at: DateTime<Utc>,
    loaded_at: Instant,
}

/// Removes a key from the in-flight set when the refresh task ends, however it ends.
struct RefreshGuard {
    key: String,
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        lock(&self.refreshing).remove(&self.key);
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct DiscoveryCache {
    source: Arc<dyn DiscoverySource>,
    ttl: Duration,
    hard_expiry: Duration,
    miss_timeout: Duration,
    refresh_timeout: Duration,
    entries: Cache<String, CachedEntry>,
    refreshing: Arc<Mutex<HashSet<String>>>,
    backend_loads: Arc<AtomicU64>,
}

impl DiscoveryCache {
    /// `refresh_timeout` bounds detached refreshes; the fleet service passes the
    /// discovery run timeout.
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        settings: &CacheSettings,
        refresh_timeout: Duration,
    ) -> Self {
        let entries = Cache::builder()
            .max_capacity(settings.max_entries)
            .time_to_live(settings.hard_expiry())
            .eviction_listener(|key, _value, cause| {
                debug!("Discovery cache evicted '{}': {:?}", key, cause);
            })
            .build();

        Self {
            source,
            ttl: settings.ttl(),
            hard_expiry: settings.hard_expiry(),
            miss_timeout: settings.miss_timeout(),
            refresh_timeout,
            entries,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            backend_loads: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self, key: &str) -> CacheResponse {
        if let Some(entry) = self.entries.get(key) {
            let age = entry.loaded_at.elapsed();
            if age >= self.hard_expiry {
                debug!("Cache entry '{}' past hard expiry ({:?})", key, age);
                self.entries.invalidate(key);
            } else {
                match entry.payload.decompress() {
                    Ok(payload) if age < self.ttl => {
                        debug!("Cache hit '{}' (fresh, age {:?})", key, age);
                        return CacheResponse::Fresh { payload, age };
                    }
                    Ok(payload) => {
                        let refresh_scheduled = self.schedule_refresh(key);
                        debug!(
                            "Cache hit '{}' (stale, age {:?}, fetched {}), refresh scheduled: {}",
                            key, age, entry.fetched_at, refresh_scheduled
                        );
                        return CacheResponse::Stale {
                            payload,
                            age,
                            refresh_scheduled,
                        };
                    }
                    Err(e) => {
                        warn!("Dropping undecodable cache entry '{}': {:#}", key, e);
                        self.entries.invalidate(key);
                    }
                }
            }
        }

        debug!("Cache miss '{}', running discovery", key);
        self.backend_loads.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.miss_timeout, self.source.load(key)).await {
            Ok(Ok(payload)) => {
                if payload.run.all_units_failed() {
                    warn!(
                        "Discovery for '{}' failed on every unit, not caching the result",
                        key
                    );
                } else {
                    store_entry(&self.entries, key, &payload);
                }
                CacheResponse::Loaded { payload }
            }
            Ok(Err(e)) => {
                warn!("Discovery for '{}' failed on cache miss: {}", key, e);
                CacheResponse::Unavailable {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    "Discovery for '{}' exceeded the {}s miss timeout",
                    key,
                    self.miss_timeout.as_secs()
                );
                CacheResponse::Unavailable {
                    reason: format!(
                        "discovery did not complete within {}s",
                        self.miss_timeout.as_secs()
                    ),
                }
            }
        }
    }

    /// Start a detached refresh of `key` unless one is already running.
    fn schedule_refresh(&self, key: &str) -> bool {
        if !lock(&self.refreshing).insert(key.to_string()) {
            return false;
        }
        let guard = RefreshGuard {
            key: key.to_string(),
            refreshing: Arc::clone(&self.refreshing),
        };

        let source = Arc::clone(&self.source);
        let entries = self.entries.clone();
        let backend_loads = Arc::clone(&self.backend_loads);
        let timeout = self.refresh_timeout;
        let key = key.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            backend_loads.fetch_add(1, Ordering::Relaxed);
            match tokio::time::timeout(timeout, source.load(&key)).await {
                Ok(Ok(payload)) if payload.run.all_units_failed() => warn!(
                    "Background refresh of '{}' failed on all {} units, serving previous entry",
                    key,
                    payload.run.units_attempted.len()
                ),
                Ok(Ok(payload)) => {
                    store_entry(&entries, &key, &payload);
                    debug!("Background refresh of '{}' completed", key);
                }
                Ok(Err(e)) => {
                    warn!("Background refresh of '{}' failed, serving previous entry: {}", key, e)
                }
                Err(_) => warn!(
                    "Background refresh of '{}' exceeded {}s, serving previous entry",
                    key,
                    timeout.as_secs()
                ),
            }
        });
        true
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        lock(&self.refreshing).contains(key)
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(key);
    }

    /// Insert a snapshot as if it had just been discovered.
    pub fn prime(&self, key: &str, snapshot: &FleetSnapshot) {
        store_entry(&self.entries, key, snapshot);
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            refreshes_in_flight: lock(&self.refreshing).len(),
            backend_loads: self.backend_loads.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (_, entry) in self.entries.iter() {
            stats.entry_count += 1;
            stats.compressed_bytes += entry.payload.data.len() as u64;
            stats.uncompressed_bytes += entry.payload.uncompressed_size as u64;
        }
        stats
    }
}

fn store_entry(entries: &Cache<String, CachedEntry>, key: &str, snapshot: &FleetSnapshot) {
    match CompressedPayload::compress(snapshot) {
        Ok(payload) => {
            debug!(
                "Cache insert '{}': {} instances, {}KB -> {}KB",
                key,
                snapshot.instance_count(),
                payload.uncompressed_size / 1024,
                payload.data.len() / 1024
            );
            entries.insert(
                key.to_string(),
                CachedEntry {
                    payload: Arc::new(payload),
                    fetched_at: snapshot.run.timestamp,
                    loaded_at: Instant::now(),
                },
            );
        }
        Err(e) => warn!("Not caching '{}': {:#}", key, e),
    }
}
