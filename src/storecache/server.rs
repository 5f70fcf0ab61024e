//! Caching StoreServer front
//!
//! A [`CachingStore`] stands in for one remote StoreServer endpoint,
//! answering Gets from the on-disk cache and writing through or
//! writing back Puts according to the cache's mode.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Duration};

use crate::bind::Switch;
use crate::client::fetch_location;
use crate::errors::{Error, Result};
use crate::service::{Context, Service, StoreGet, StoreServer};
use crate::storecache::StoreCache;
use crate::types::{Endpoint, Location, Refdata, Reference};

/// Fixed diagnostic answered for the health-check reference.
pub const HEALTH_RESPONSE: &[u8] = b"cache is live";

/// Attempts at an upstream fetch whose failures are all transient.
const MAX_FETCH_ATTEMPTS: u32 = 3;
const FETCH_BACKOFF: Duration = Duration::from_millis(250);

/// One remote endpoint seen through the cache.
pub struct CachingStore {
    cache: Arc<StoreCache>,
    endpoint: Endpoint,
    /// Last successful upstream ping, answered locally while fresh.
    last_ping: Mutex<Option<Instant>>,
}

impl CachingStore {
    pub(crate) fn new(cache: Arc<StoreCache>, endpoint: Endpoint) -> Self {
        Self {
            cache,
            endpoint,
            last_ping: Mutex::new(None),
        }
    }

    fn writeback_put(&self) -> Result<&crate::storecache::writeback::Writeback> {
        match self.cache.writeback.as_deref() {
            Some(wb) => Ok(wb),
            None => Err(Error::internal(
                "storecache.put",
                "writeback queue missing in writeback mode",
            )),
        }
    }
}

/// Chase redirects from the endpoint, retrying a bounded number of
/// times when every failure was of the transient "service
/// unavailable" class.
async fn fetch_with_retry(
    switch: &Switch,
    ctx: &Context,
    location: Location,
) -> Result<(Vec<u8>, Refdata)> {
    let mut attempt = 1;
    loop {
        match fetch_location(switch, ctx, &location).await {
            Ok(found) => return Ok(found),
            Err(e) if e.is_transient() && attempt < MAX_FETCH_ATTEMPTS => {
                log::debug!(
                    "transient failure fetching {location} (attempt {attempt}): {e}"
                );
                attempt += 1;
                sleep(FETCH_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl Service for CachingStore {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn ping(&self) -> bool {
        if let Some(last) = *self.last_ping.lock() {
            if last.elapsed() < self.cache.ping_freshness {
                return true;
            }
        }
        let alive = match self
            .cache
            .switch
            .store_server(&self.cache.ctx, &self.endpoint)
            .await
        {
            Ok(store) => store.ping().await,
            Err(_) => false,
        };
        if alive {
            *self.last_ping.lock() = Some(Instant::now());
        }
        alive
    }

    async fn close(&self) {}
}

#[async_trait]
impl StoreServer for CachingStore {
    async fn get(&self, reference: &Reference) -> Result<StoreGet> {
        if reference.as_str() == Reference::HEALTH_METADATA {
            return Ok(StoreGet::bytes(
                HEALTH_RESPONSE.to_vec(),
                Refdata::volatile(reference.clone()),
            ));
        }
        if reference.as_str() == Reference::FLUSH_WRITEBACKS {
            self.cache.flush(None).await;
            return Ok(StoreGet::bytes(Vec::new(), Refdata::volatile(reference.clone())));
        }

        let switch = self.cache.switch.clone();
        let ctx = self.cache.ctx.clone();
        let location = Location::new(self.endpoint.clone(), reference.clone());
        let (data, refdata) = self
            .cache
            .disk
            .get_or_fetch(&self.endpoint, reference, move || async move {
                fetch_with_retry(&switch, &ctx, location).await
            })
            .await?;
        Ok(StoreGet::bytes(data, refdata))
    }

    async fn put(&self, data: &[u8]) -> Result<Refdata> {
        if self.cache.writethrough {
            let store = self
                .cache
                .switch
                .store_server(&self.cache.ctx, &self.endpoint)
                .await?;
            let refdata = store.put(data).await?;
            if !refdata.volatile {
                // A failure to cache is not a failure to store.
                if let Err(e) = self
                    .cache
                    .disk
                    .put_local(&self.endpoint, &refdata.reference, data, false)
                    .await
                {
                    log::warn!("failed to cache stored blob {}: {e}", refdata.reference);
                }
            }
            return Ok(refdata);
        }

        let reference = Reference::for_data(data);
        self.cache
            .disk
            .put_local(&self.endpoint, &reference, data, true)
            .await?;
        self.writeback_put()?
            .enqueue(self.endpoint.clone(), reference.clone());
        Ok(Refdata::cacheable(reference))
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        let store = self
            .cache
            .switch
            .store_server(&self.cache.ctx, &self.endpoint)
            .await?;
        store.delete(reference).await?;
        self.cache.disk.delete_local(&self.endpoint, reference);
        Ok(())
    }
}
