//! Permission gate
//!
//! Wraps a StoreServer so that Put and Delete are allowed only for
//! writers named by the Group file `<owner>/Group/StoreWriters` on the
//! owner's DirServer, while Get passes through. A background updater
//! resolves the writer set; until the first resolution completes, all
//! mutations block.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::access::{self, WriterSet};
use crate::bind::Switch;
use crate::client::Client;
use crate::errors::{Error, ErrorKind, Result};
use crate::service::{Context, Service, StoreDialer, StoreGet, StoreServer};
use crate::types::{Endpoint, PathName, Refdata, Reference, UserName};

/// Name of the Group file that enumerates allowed writers, relative to
/// the owner's tree.
pub const WRITERS_GROUP_FILE: &str = "Group/StoreWriters";

/// Cadence of the permission updater.
#[derive(Debug, Clone)]
pub struct PermConfig {
    /// Steady-state refresh interval.
    pub poll_interval: Duration,
    /// Refresh interval after a failed resolution.
    pub retry_interval: Duration,
}

impl Default for PermConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2 * 60),
            retry_interval: Duration::from_secs(10),
        }
    }
}

struct GateShared {
    /// The server's own identity, used to read the Group file.
    ctx: Context,
    /// Owner of the wrapped store; their tree holds the Group file.
    target_user: UserName,
    switch: Arc<Switch>,
    /// `None` means no Group file exists: everyone is allowed. An
    /// empty set allows no one.
    writers: RwLock<Option<WriterSet>>,
    /// Becomes true once the first resolution completes.
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl GateShared {
    fn group_path(&self) -> PathName {
        PathName::new(format!("{}/{WRITERS_GROUP_FILE}", self.target_user))
    }

    /// One resolution attempt: expand the Group file, or conclude no
    /// file exists.
    async fn resolve(&self) -> Result<Option<WriterSet>> {
        let client = Arc::new(Client::with_switch(self.ctx.clone(), self.switch.clone()));
        let fetch = move |path: PathName| {
            let client = client.clone();
            let fut: futures::future::BoxFuture<'static, Result<Vec<u8>>> =
                Box::pin(async move {
                    let entry = client.lookup_path(&path).await?;
                    client.read_all(&entry).await
                });
            fut
        };
        match access::expand(&self.group_path(), fetch).await {
            Ok(set) => Ok(Some(set)),
            Err(e) if e.is(ErrorKind::NotExist) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve and commit; returns whether the resolution succeeded.
    /// The first successful commit releases the first-run gate.
    async fn refresh(&self) -> Result<()> {
        let resolved = self.resolve().await?;
        match &resolved {
            None => log::debug!("{}: no writers group, everyone allowed", self.target_user),
            Some(set) if set.is_empty() => {
                log::debug!("{}: empty writer set, no one allowed", self.target_user)
            }
            Some(_) => log::debug!("{}: writer set updated", self.target_user),
        }
        *self.writers.write() = resolved;
        let _ = self.ready_tx.send(true);
        Ok(())
    }

    async fn wait_first_run(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return Err(Error::internal("perm.wait", "permission updater is gone"));
            }
        }
        Ok(())
    }

    fn allowed(&self, user: &UserName) -> bool {
        match &*self.writers.read() {
            None => true,
            Some(set) => set.allows(user),
        }
    }
}

/// A StoreServer wrapper enforcing the writer allowlist. Each dialed
/// clone carries the dialing user and shares the resolved set.
pub struct WritersGate {
    user: UserName,
    inner: Arc<dyn StoreServer>,
    shared: Arc<GateShared>,
}

impl WritersGate {
    /// Wrap `inner`, whose owner is `target_user`, and start the
    /// background updater. `ctx` is the identity used to read the
    /// Group file; `switch` is used to reach the owner's DirServer.
    pub fn new(
        ctx: Context,
        target_user: UserName,
        inner: Arc<dyn StoreServer>,
        switch: Arc<Switch>,
        config: PermConfig,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = Arc::new(GateShared {
            ctx,
            target_user,
            switch,
            writers: RwLock::new(None),
            ready_tx,
            ready_rx,
            shutdown_tx,
            updater: Mutex::new(None),
        });

        let updater_shared = shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = match updater_shared.refresh().await {
                    Ok(()) => config.poll_interval,
                    Err(e) => {
                        log::warn!(
                            "writers group for {} not resolved: {e}",
                            updater_shared.target_user
                        );
                        config.retry_interval
                    }
                };
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
        *shared.updater.lock() = Some(handle);

        let user = shared.ctx.user_name.clone();
        Arc::new(Self {
            user,
            inner,
            shared,
        })
    }

    /// Force an immediate refresh of the writer set.
    pub async fn update_now(&self) -> Result<()> {
        self.shared.refresh().await
    }

    /// A dialer handing out clones of this gate that carry the dialing
    /// user, sharing the resolved writer set.
    pub fn dialer(self: &Arc<Self>) -> Arc<dyn StoreDialer> {
        Arc::new(GateDialer {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        })
    }

    /// Stop the background updater and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(true);
        let handle = self.shared.updater.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn check_writer(&self, op: &'static str) -> Result<()> {
        self.shared.wait_first_run().await?;
        if self.shared.allowed(&self.user) {
            Ok(())
        } else {
            Err(Error::permission(op, "user is not a permitted writer")
                .with_path(self.user.as_str()))
        }
    }
}

#[async_trait]
impl Service for WritersGate {
    fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[async_trait]
impl StoreServer for WritersGate {
    async fn get(&self, reference: &Reference) -> Result<StoreGet> {
        self.inner.get(reference).await
    }

    async fn put(&self, data: &[u8]) -> Result<Refdata> {
        self.check_writer("perm.put").await?;
        self.inner.put(data).await
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        self.check_writer("perm.delete").await?;
        self.inner.delete(reference).await
    }
}

struct GateDialer {
    inner: Arc<dyn StoreServer>,
    shared: Arc<GateShared>,
}

#[async_trait]
impl StoreDialer for GateDialer {
    async fn dial(&self, ctx: &Context, _endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
        Ok(Arc::new(WritersGate {
            user: ctx.user_name.clone(),
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }))
    }
}
