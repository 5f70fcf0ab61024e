//! Binding switch
//!
//! Turns `(context, endpoint)` into a ready-to-use KeyServer,
//! StoreServer, or DirServer with process-wide deduplication:
//! - per-transport dialer registries, one per service kind
//! - a dialed-service pool keyed by `(user, endpoint)` with
//!   ping-validated freshness
//! - single-flight dialing: concurrent binds for one key share one dial
//!
//! A process normally uses the default switch through the module-level
//! functions; tests construct private [`Switch`] instances.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::errors::{Error, Result};
use crate::service::{
    Context, DirDialer, DirServer, KeyDialer, KeyServer, Service, StoreDialer, StoreServer,
};
use crate::types::{Endpoint, Transport, UserName};

/// How long a cached service stays fresh before its next use must be
/// preceded by a successful ping.
pub const PING_FRESHNESS: Duration = Duration::from_secs(15 * 60);

/// Bound on cache-loop restarts; exceeding it means a dialer or ping
/// implementation is misbehaving pathologically.
const MAX_RESTARTS: usize = 100;

/// Cache key: two binds with equal keys share one underlying service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DialKey {
    user: UserName,
    endpoint: Endpoint,
}

struct CachedService<S: ?Sized> {
    service: Arc<S>,
    last_ping: Instant,
}

struct Pool<S: ?Sized> {
    cache: HashMap<DialKey, CachedService<S>>,
    /// Reverse lookup from service identity to key; together with
    /// `cache` this forms the bidirectional map, both sides guarded by
    /// the one switch mutex.
    inverse: HashMap<usize, DialKey>,
    /// In-flight dials; waiters subscribe and re-enter the cache loop
    /// when the dial completes.
    inflight: HashMap<DialKey, watch::Receiver<bool>>,
}

impl<S: ?Sized> Default for Pool<S> {
    fn default() -> Self {
        Self {
            cache: HashMap::new(),
            inverse: HashMap::new(),
            inflight: HashMap::new(),
        }
    }
}

fn ptr_key<S: ?Sized>(service: &Arc<S>) -> usize {
    Arc::as_ptr(service).cast::<()>() as usize
}

struct Inner {
    caching: bool,
    key_dialers: HashMap<Transport, Arc<dyn KeyDialer>>,
    store_dialers: HashMap<Transport, Arc<dyn StoreDialer>>,
    dir_dialers: HashMap<Transport, Arc<dyn DirDialer>>,
    keys: Pool<dyn KeyServer>,
    stores: Pool<dyn StoreServer>,
    dirs: Pool<dyn DirServer>,
}

fn keys_pool(inner: &mut Inner) -> &mut Pool<dyn KeyServer> {
    &mut inner.keys
}

fn stores_pool(inner: &mut Inner) -> &mut Pool<dyn StoreServer> {
    &mut inner.stores
}

fn dirs_pool(inner: &mut Inner) -> &mut Pool<dyn DirServer> {
    &mut inner.dirs
}

/// The binding switch: transport registries plus the dialed-service
/// pool. One mutex guards all of its state; the mutex is never held
/// across a dial or a ping.
pub struct Switch {
    inner: Mutex<Inner>,
    ping_freshness: Duration,
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

impl Switch {
    /// An empty switch with the default ping freshness.
    pub fn new() -> Self {
        Self::with_ping_freshness(PING_FRESHNESS)
    }

    /// An empty switch with an explicit ping freshness, used by tests
    /// that exercise revalidation.
    pub fn with_ping_freshness(ping_freshness: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                caching: true,
                key_dialers: HashMap::new(),
                store_dialers: HashMap::new(),
                dir_dialers: HashMap::new(),
                keys: Pool::default(),
                stores: Pool::default(),
                dirs: Pool::default(),
            }),
            ping_freshness,
        }
    }

    /// Disable the dialed-service cache. Every bind dials afresh.
    /// Testing and debugging only.
    pub fn no_cache(&self) {
        self.inner.lock().caching = false;
    }

    /// Register the KeyServer dialer for a transport. Fails if the
    /// transport already has one.
    pub fn register_key_server(
        &self,
        transport: Transport,
        dialer: Arc<dyn KeyDialer>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.key_dialers.contains_key(&transport) {
            return Err(duplicate_registration("bind.register_key_server", transport));
        }
        inner.key_dialers.insert(transport, dialer);
        Ok(())
    }

    /// Register the StoreServer dialer for a transport. Fails if the
    /// transport already has one.
    pub fn register_store_server(
        &self,
        transport: Transport,
        dialer: Arc<dyn StoreDialer>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.store_dialers.contains_key(&transport) {
            return Err(duplicate_registration("bind.register_store_server", transport));
        }
        inner.store_dialers.insert(transport, dialer);
        Ok(())
    }

    /// Register the DirServer dialer for a transport. Fails if the
    /// transport already has one.
    pub fn register_dir_server(
        &self,
        transport: Transport,
        dialer: Arc<dyn DirDialer>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.dir_dialers.contains_key(&transport) {
            return Err(duplicate_registration("bind.register_dir_server", transport));
        }
        inner.dir_dialers.insert(transport, dialer);
        Ok(())
    }

    /// A live KeyServer at `endpoint` for the calling context.
    pub async fn key_server(&self, ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn KeyServer>> {
        const OP: &str = "bind.key_server";
        let dialer = {
            let inner = self.inner.lock();
            dialer_for(OP, &inner.key_dialers, endpoint)?
        };
        let user = ctx.user_name.clone();
        let dial_ctx = ctx.clone();
        let ep = endpoint.clone();
        self.service_of(OP, &user, endpoint, keys_pool, move || {
            let dialer = dialer.clone();
            let ctx = dial_ctx.clone();
            let ep = ep.clone();
            async move { dialer.dial(&ctx, &ep).await }
        })
        .await
    }

    /// A live StoreServer at `endpoint` for the calling context.
    pub async fn store_server(
        &self,
        ctx: &Context,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn StoreServer>> {
        const OP: &str = "bind.store_server";
        let dialer = {
            let inner = self.inner.lock();
            dialer_for(OP, &inner.store_dialers, endpoint)?
        };
        let user = ctx.user_name.clone();
        let dial_ctx = ctx.clone();
        let ep = endpoint.clone();
        self.service_of(OP, &user, endpoint, stores_pool, move || {
            let dialer = dialer.clone();
            let ctx = dial_ctx.clone();
            let ep = ep.clone();
            async move { dialer.dial(&ctx, &ep).await }
        })
        .await
    }

    /// A live DirServer at `endpoint` for the calling context.
    pub async fn dir_server(&self, ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
        const OP: &str = "bind.dir_server";
        let dialer = {
            let inner = self.inner.lock();
            dialer_for(OP, &inner.dir_dialers, endpoint)?
        };
        let user = ctx.user_name.clone();
        let dial_ctx = ctx.clone();
        let ep = endpoint.clone();
        self.service_of(OP, &user, endpoint, dirs_pool, move || {
            let dialer = dialer.clone();
            let ctx = dial_ctx.clone();
            let ep = ep.clone();
            async move { dialer.dial(&ctx, &ep).await }
        })
        .await
    }

    /// The DirServer serving `user`'s tree. With no user given, binds
    /// the caller's default dir endpoint; otherwise consults the
    /// KeyServer and tries the user's `dirs` endpoints in order.
    pub async fn dir_server_for(
        &self,
        ctx: &Context,
        user: Option<&UserName>,
    ) -> Result<Arc<dyn DirServer>> {
        const OP: &str = "bind.dir_server_for";
        let user = match user {
            None => return self.dir_server(ctx, &ctx.dir_endpoint).await,
            Some(u) if u == &ctx.user_name => {
                return self.dir_server(ctx, &ctx.dir_endpoint).await
            }
            Some(u) => u,
        };
        let keys = self.key_server(ctx, &ctx.key_endpoint).await?;
        let record = keys.lookup(user).await?;
        if record.dirs.is_empty() {
            return Err(
                Error::not_exist(OP, "user record has no directory endpoints")
                    .with_path(user.as_str()),
            );
        }
        let mut last_err = None;
        for endpoint in &record.dirs {
            match self.dir_server(ctx, endpoint).await {
                Ok(dir) => return Ok(dir),
                Err(e) => {
                    log::debug!("dir endpoint {endpoint} for {user} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::internal(OP, "no endpoint attempted").with_path(user.as_str())
        }))
    }

    /// Remove a KeyServer from the pool and close it.
    pub async fn release_key_server(&self, service: &Arc<dyn KeyServer>) -> Result<()> {
        self.release_in("bind.release_key_server", service, keys_pool)
            .await
    }

    /// Remove a StoreServer from the pool and close it.
    pub async fn release_store_server(&self, service: &Arc<dyn StoreServer>) -> Result<()> {
        self.release_in("bind.release_store_server", service, stores_pool)
            .await
    }

    /// Remove a DirServer from the pool and close it.
    pub async fn release_dir_server(&self, service: &Arc<dyn DirServer>) -> Result<()> {
        self.release_in("bind.release_dir_server", service, dirs_pool)
            .await
    }

    /// The `ServiceOf` cache loop, generic over the service kind.
    async fn service_of<S, D, Fut>(
        &self,
        op: &'static str,
        user: &UserName,
        endpoint: &Endpoint,
        pool_of: fn(&mut Inner) -> &mut Pool<S>,
        dial: D,
    ) -> Result<Arc<S>>
    where
        S: Service + ?Sized,
        D: Fn() -> Fut,
        Fut: Future<Output = Result<Arc<S>>>,
    {
        if endpoint.transport == Transport::Unassigned {
            return Err(Error::invalid(op, "unassigned endpoint is never dialed")
                .with_path(endpoint.to_string()));
        }
        let key = DialKey {
            user: user.clone(),
            endpoint: endpoint.clone(),
        };

        if !self.inner.lock().caching {
            let service = dial().await?;
            if !service.ping().await {
                return Err(ping_failure(op, endpoint));
            }
            return Ok(service);
        }

        enum Step<S: ?Sized> {
            Use(Arc<S>),
            Revalidate(Arc<S>),
            Dial(watch::Sender<bool>),
            Wait(watch::Receiver<bool>),
        }

        for _ in 0..MAX_RESTARTS {
            let step = {
                let mut inner = self.inner.lock();
                let ping_freshness = self.ping_freshness;
                let pool = pool_of(&mut inner);
                if let Some(cached) = pool.cache.get(&key) {
                    if cached.last_ping.elapsed() < ping_freshness {
                        Step::Use(cached.service.clone())
                    } else {
                        Step::Revalidate(cached.service.clone())
                    }
                } else if let Some(rx) = pool.inflight.get(&key) {
                    Step::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(false);
                    pool.inflight.insert(key.clone(), rx);
                    Step::Dial(tx)
                }
            };

            match step {
                Step::Use(service) => return Ok(service),
                Step::Revalidate(service) => {
                    if service.ping().await {
                        let mut inner = self.inner.lock();
                        let pool = pool_of(&mut inner);
                        if let Some(cached) = pool.cache.get_mut(&key) {
                            if ptr_key(&cached.service) == ptr_key(&service) {
                                cached.last_ping = Instant::now();
                            }
                        }
                        return Ok(service);
                    }
                    // Dead: evict and restart the loop to redial.
                    log::warn!("{op}: cached service at {endpoint} failed ping, evicting");
                    let evicted = {
                        let mut inner = self.inner.lock();
                        let pool = pool_of(&mut inner);
                        match pool.cache.get(&key) {
                            Some(cached) if ptr_key(&cached.service) == ptr_key(&service) => {
                                pool.inverse.remove(&ptr_key(&service));
                                pool.cache.remove(&key).is_some()
                            }
                            _ => false,
                        }
                    };
                    if evicted {
                        service.close().await;
                    }
                }
                Step::Wait(mut rx) => {
                    // Wakes when the in-flight dial publishes its result
                    // (or is abandoned); adopt it from the cache.
                    let _ = rx.changed().await;
                }
                Step::Dial(tx) => {
                    log::debug!("{op}: dialing {endpoint} for {user}");
                    let dialed = dial().await;
                    let dialed = match dialed {
                        Ok(service) => {
                            if service.ping().await {
                                Ok(service)
                            } else {
                                Err(ping_failure(op, endpoint))
                            }
                        }
                        Err(e) => Err(e),
                    };
                    let mut inner = self.inner.lock();
                    let pool = pool_of(&mut inner);
                    pool.inflight.remove(&key);
                    let result = match dialed {
                        Ok(service) => {
                            pool.inverse.insert(ptr_key(&service), key.clone());
                            pool.cache.insert(
                                key.clone(),
                                CachedService {
                                    service: service.clone(),
                                    last_ping: Instant::now(),
                                },
                            );
                            Ok(service)
                        }
                        Err(e) => Err(e),
                    };
                    let _ = tx.send(true);
                    return result;
                }
            }
        }
        Err(Error::internal(op, "service cache loop did not settle")
            .with_path(endpoint.to_string()))
    }

    async fn release_in<S>(
        &self,
        op: &'static str,
        service: &Arc<S>,
        pool_of: fn(&mut Inner) -> &mut Pool<S>,
    ) -> Result<()>
    where
        S: Service + ?Sized,
    {
        let found = {
            let mut inner = self.inner.lock();
            let pool = pool_of(&mut inner);
            match pool.inverse.remove(&ptr_key(service)) {
                Some(key) => {
                    pool.cache.remove(&key);
                    true
                }
                None => false,
            }
        };
        if !found {
            return Err(Error::not_exist(op, "service is not in the cache"));
        }
        service.close().await;
        Ok(())
    }
}

fn duplicate_registration(op: &'static str, transport: Transport) -> Error {
    Error::invalid(op, format!("a dialer is already registered for transport {transport}"))
}

fn ping_failure(op: &str, endpoint: &Endpoint) -> Error {
    Error::io(op, "service did not answer ping").with_path(endpoint.to_string())
}

fn dialer_for<D: ?Sized>(
    op: &'static str,
    dialers: &HashMap<Transport, Arc<D>>,
    endpoint: &Endpoint,
) -> Result<Arc<D>> {
    if endpoint.transport == Transport::Unassigned {
        return Err(Error::invalid(op, "unassigned endpoint is never dialed")
            .with_path(endpoint.to_string()));
    }
    dialers.get(&endpoint.transport).cloned().ok_or_else(|| {
        Error::invalid(op, format!("no dialer registered for transport {}", endpoint.transport))
    })
}

static DEFAULT: Lazy<Arc<Switch>> = Lazy::new(|| Arc::new(Switch::new()));

/// The process-wide default switch.
pub fn default_switch() -> Arc<Switch> {
    DEFAULT.clone()
}

/// Register a KeyServer dialer with the default switch.
pub fn register_key_server(transport: Transport, dialer: Arc<dyn KeyDialer>) -> Result<()> {
    DEFAULT.register_key_server(transport, dialer)
}

/// Register a StoreServer dialer with the default switch.
pub fn register_store_server(transport: Transport, dialer: Arc<dyn StoreDialer>) -> Result<()> {
    DEFAULT.register_store_server(transport, dialer)
}

/// Register a DirServer dialer with the default switch.
pub fn register_dir_server(transport: Transport, dialer: Arc<dyn DirDialer>) -> Result<()> {
    DEFAULT.register_dir_server(transport, dialer)
}

/// Bind a KeyServer through the default switch.
pub async fn key_server(ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn KeyServer>> {
    DEFAULT.key_server(ctx, endpoint).await
}

/// Bind a StoreServer through the default switch.
pub async fn store_server(ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
    DEFAULT.store_server(ctx, endpoint).await
}

/// Bind a DirServer through the default switch.
pub async fn dir_server(ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
    DEFAULT.dir_server(ctx, endpoint).await
}

/// Bind the DirServer for a user through the default switch.
pub async fn dir_server_for(ctx: &Context, user: Option<&UserName>) -> Result<Arc<dyn DirServer>> {
    DEFAULT.dir_server_for(ctx, user).await
}

/// Release a StoreServer bound through the default switch.
pub async fn release_store_server(service: &Arc<dyn StoreServer>) -> Result<()> {
    DEFAULT.release_store_server(service).await
}

/// Release a DirServer bound through the default switch.
pub async fn release_dir_server(service: &Arc<dyn DirServer>) -> Result<()> {
    DEFAULT.release_dir_server(service).await
}

/// Release a KeyServer bound through the default switch.
pub async fn release_key_server(service: &Arc<dyn KeyServer>) -> Result<()> {
    DEFAULT.release_key_server(service).await
}
