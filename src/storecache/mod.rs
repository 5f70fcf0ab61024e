//! Storecache
//!
//! A local byte cache standing between the application and one or more
//! StoreServers:
//! - an on-disk LRU with a byte cap and an access log replayed on
//!   restart
//! - writethrough mode (Put synchronously upstream, cache successes)
//!   or writeback mode (acknowledge Puts locally; a durable queue
//!   ships the bytes upstream later)
//! - per-endpoint retry scheduling for writebacks, recovered from the
//!   hard-link directory after a crash

mod cache;
mod accesslog;
mod server;
pub(crate) mod writeback;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::bind::Switch;
use crate::errors::{Error, Result};
use crate::service::{Context, StoreDialer, StoreServer};
use crate::storecache::cache::DiskCache;
use crate::storecache::writeback::Writeback;
use crate::types::{Endpoint, Location};

pub use server::{CachingStore, HEALTH_RESPONSE};

/// Storecache construction options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCacheConfig {
    /// Root of the on-disk cache.
    pub cache_root: PathBuf,

    /// Root of the writeback hard-link directory.
    pub writeback_root: PathBuf,

    /// Byte cap enforced by LRU eviction.
    pub max_bytes: u64,

    /// Put synchronously upstream instead of queueing writebacks.
    pub writethrough: bool,

    /// How often buffered access-log appends are flushed.
    pub flush_period: Duration,

    /// How long a successful upstream ping is answered locally.
    pub ping_freshness: Duration,

    /// Probe cadence for endpoints with failed or unproven writebacks.
    pub poll_interval: Duration,
}

impl Default for StoreCacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("storecache/cache"),
            writeback_root: PathBuf::from("storecache/writeback"),
            max_bytes: 4 * 1024 * 1024 * 1024,
            writethrough: false,
            flush_period: Duration::from_secs(60),
            ping_freshness: Duration::from_secs(15 * 60),
            poll_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl StoreCacheConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::invalid("storecache.config", e.to_string()).with_path(path))
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::internal("storecache.config", e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// The cache proper: disk state, background tasks, and the writeback
/// queue. Hand out per-endpoint fronts with [`StoreCache::store_for`]
/// or register [`StoreCache::dialer`] with a binding switch.
pub struct StoreCache {
    pub(crate) ctx: Context,
    pub(crate) switch: Arc<Switch>,
    pub(crate) disk: Arc<DiskCache>,
    pub(crate) writeback: Option<Arc<Writeback>>,
    pub(crate) writethrough: bool,
    pub(crate) ping_freshness: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreCache {
    /// Open the cache: scan and replay the on-disk state, start the
    /// log flusher, and (in writeback mode) recover and restart the
    /// writeback queue.
    pub async fn open(
        ctx: Context,
        switch: Arc<Switch>,
        config: StoreCacheConfig,
    ) -> Result<Arc<Self>> {
        let disk = Arc::new(DiskCache::open(
            &config.cache_root,
            &config.writeback_root,
            config.max_bytes,
        )?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flusher = {
            let disk = disk.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            let period = config.flush_period;
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await; // first tick is immediate
                loop {
                    tokio::select! {
                        _ = ticker.tick() => disk.flush_log(),
                        _ = shutdown_rx.changed() => {
                            disk.flush_log();
                            return;
                        }
                    }
                }
            })
        };

        let writeback = if config.writethrough {
            None
        } else {
            let recovered = disk.recover_writebacks()?;
            if !recovered.is_empty() {
                log::debug!("recovered {} pending writebacks", recovered.len());
            }
            Some(Writeback::start(
                disk.clone(),
                switch.clone(),
                ctx.clone(),
                config.poll_interval,
                shutdown_rx,
                recovered,
            ))
        };

        Ok(Arc::new(Self {
            ctx,
            switch,
            disk,
            writeback,
            writethrough: config.writethrough,
            ping_freshness: config.ping_freshness,
            shutdown_tx,
            tasks: Mutex::new(vec![flusher]),
        }))
    }

    /// A StoreServer front for one remote endpoint, backed by this
    /// cache.
    pub fn store_for(self: &Arc<Self>, endpoint: &Endpoint) -> Arc<CachingStore> {
        Arc::new(CachingStore::new(self.clone(), endpoint.clone()))
    }

    /// A dialer that answers every endpoint with a caching front.
    /// Register it with a binding switch to put the cache in front of
    /// a transport.
    pub fn dialer(self: &Arc<Self>) -> Arc<dyn StoreDialer> {
        Arc::new(CacheDialer {
            cache: self.clone(),
        })
    }

    /// Block until the writeback queue is empty (no location) or a
    /// specific reference has been written back. A writethrough cache
    /// returns immediately.
    pub async fn flush(&self, location: Option<&Location>) {
        if let Some(writeback) = &self.writeback {
            writeback.flush(location).await;
        }
    }

    /// Number of uploads not yet completed.
    pub fn pending_writebacks(&self) -> usize {
        self.writeback.as_ref().map_or(0, |wb| wb.pending_count())
    }

    /// Total cached bytes.
    pub fn bytes_in_use(&self) -> u64 {
        self.disk.bytes_in_use()
    }

    /// Stop all background tasks and flush the access log. Blocks
    /// until every task has terminated.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(writeback) = &self.writeback {
            writeback.join().await;
        }
        self.disk.flush_log();
    }
}

struct CacheDialer {
    cache: Arc<StoreCache>,
}

#[async_trait::async_trait]
impl StoreDialer for CacheDialer {
    async fn dial(
        &self,
        _ctx: &Context,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn StoreServer>> {
        Ok(self.cache.store_for(endpoint))
    }
}
