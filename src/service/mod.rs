//! Service interfaces
//!
//! The three remote service kinds the runtime composes (KeyServer,
//! StoreServer, and DirServer) expose different operation sets over a
//! shared base capability: endpoint, ping, close. Implementations are
//! supplied per transport by dialers registered with the binding
//! switch; this module only defines the contracts the core consumes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{
    DirEntry, Endpoint, Location, Packing, PathName, Refdata, Reference, UserName, UserRecord,
};

/// Caller configuration threaded through every operation.
///
/// Identifies the calling user and names the default service endpoints
/// the user's client binds to.
#[derive(Debug, Clone)]
pub struct Context {
    /// The calling user.
    pub user_name: UserName,
    /// The KeyServer endpoint used for user lookups.
    pub key_endpoint: Endpoint,
    /// The caller's default DirServer endpoint.
    pub dir_endpoint: Endpoint,
    /// The caller's default StoreServer endpoint.
    pub store_endpoint: Endpoint,
    /// Default packing for content the caller writes.
    pub packing: Packing,
    /// Symmetric secret feeding the sealed packer, when present.
    pub secret: Option<[u8; 32]>,
}

impl Context {
    /// A context for `user` with all endpoints unassigned.
    pub fn new(user_name: UserName) -> Self {
        Self {
            user_name,
            key_endpoint: Endpoint::unassigned(),
            dir_endpoint: Endpoint::unassigned(),
            store_endpoint: Endpoint::unassigned(),
            packing: Packing::Plain,
            secret: None,
        }
    }

    /// Set the KeyServer endpoint.
    pub fn with_key_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.key_endpoint = endpoint;
        self
    }

    /// Set the default DirServer endpoint.
    pub fn with_dir_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.dir_endpoint = endpoint;
        self
    }

    /// Set the default StoreServer endpoint.
    pub fn with_store_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.store_endpoint = endpoint;
        self
    }

    /// Set the default packing.
    pub fn with_packing(mut self, packing: Packing) -> Self {
        self.packing = packing;
        self
    }

    /// Set the sealed-packer secret.
    pub fn with_secret(mut self, secret: [u8; 32]) -> Self {
        self.secret = Some(secret);
        self
    }
}

/// Base capability shared by every service kind.
#[async_trait]
pub trait Service: Send + Sync {
    /// The endpoint the service was dialed at.
    fn endpoint(&self) -> Endpoint;

    /// Liveness probe. A false return marks the service dead.
    async fn ping(&self) -> bool;

    /// Release any resources held for the connection. The handle must
    /// not be used afterwards.
    async fn close(&self);
}

/// What a StoreServer Get answered with. `data` and `locations` are
/// mutually exclusive: a conforming server returns bytes with no
/// redirects, or redirects with no bytes.
#[derive(Debug, Clone)]
pub struct StoreGet {
    /// The blob's bytes, when the server holds them.
    pub data: Option<Vec<u8>>,
    /// Metadata about the reference.
    pub refdata: Refdata,
    /// Alternative locations to try instead of bytes.
    pub locations: Vec<Location>,
}

impl StoreGet {
    /// An answer carrying bytes.
    pub fn bytes(data: Vec<u8>, refdata: Refdata) -> Self {
        Self {
            data: Some(data),
            refdata,
            locations: Vec::new(),
        }
    }

    /// An answer redirecting the caller elsewhere.
    pub fn redirect(reference: Reference, locations: Vec<Location>) -> Self {
        Self {
            data: None,
            refdata: Refdata::cacheable(reference),
            locations,
        }
    }
}

/// Directory of user records.
#[async_trait]
pub trait KeyServer: Service {
    /// Fetch the record for a user.
    async fn lookup(&self, user: &UserName) -> Result<UserRecord>;

    /// Store or update a user record.
    async fn put(&self, record: &UserRecord) -> Result<()>;
}

/// Content-addressed byte blob store.
#[async_trait]
pub trait StoreServer: Service {
    /// Fetch a blob, or redirects to stores that may hold it.
    async fn get(&self, reference: &Reference) -> Result<StoreGet>;

    /// Store a blob, returning the reference it now lives under.
    async fn put(&self, data: &[u8]) -> Result<Refdata>;

    /// Delete a blob.
    async fn delete(&self, reference: &Reference) -> Result<()>;
}

/// Per-user file-tree metadata server.
///
/// Any operation may return the follow-link continuation
/// ([`crate::errors::Error::follow_link`]) carrying a link entry; the
/// read pipeline performs the traversal.
#[async_trait]
pub trait DirServer: Service {
    /// Fetch the entry for a path.
    async fn lookup(&self, name: &PathName) -> Result<DirEntry>;

    /// Store or update an entry, returning the stored form.
    async fn put(&self, entry: &DirEntry) -> Result<DirEntry>;

    /// Enumerate entries matching a glob pattern.
    async fn glob(&self, pattern: &str) -> Result<Vec<DirEntry>>;

    /// Delete the entry for a path, returning the deleted entry.
    async fn delete(&self, name: &PathName) -> Result<DirEntry>;

    /// The Access file governing a path.
    async fn which_access(&self, name: &PathName) -> Result<DirEntry>;

    /// Create a directory.
    async fn make_directory(&self, name: &PathName) -> Result<DirEntry>;
}

/// Dials KeyServers for one transport.
#[async_trait]
pub trait KeyDialer: Send + Sync {
    /// Produce a ready-to-ping KeyServer at `endpoint` on behalf of the
    /// calling context.
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn KeyServer>>;
}

/// Dials StoreServers for one transport.
#[async_trait]
pub trait StoreDialer: Send + Sync {
    /// Produce a ready-to-ping StoreServer at `endpoint` on behalf of
    /// the calling context.
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>>;
}

/// Dials DirServers for one transport.
#[async_trait]
pub trait DirDialer: Send + Sync {
    /// Produce a ready-to-ping DirServer at `endpoint` on behalf of the
    /// calling context.
    async fn dial(&self, ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn DirServer>>;
}
