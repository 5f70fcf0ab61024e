// Shared in-memory service fixtures for the integration tests. All
// three service kinds are implemented over concurrent maps and served
// through the inprocess transport.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::{sleep, Duration};

use lattice::bind::Switch;
use lattice::errors::{Error, Result};
use lattice::pack;
use lattice::service::{
    Context, DirDialer, DirServer, KeyDialer, KeyServer, Service, StoreDialer, StoreGet,
    StoreServer,
};
use lattice::types::{
    Attribute, DirBlock, DirEntry, Endpoint, Location, Packing, Parsed, PathName, Refdata,
    Reference, Transport, UserName, UserRecord,
};

pub fn user(s: &str) -> UserName {
    UserName::parse(s).unwrap()
}

pub fn inprocess(addr: &str) -> Endpoint {
    Endpoint::new(Transport::InProcess, addr)
}

// ---------------------------------------------------------------------
// StoreServer fixture
// ---------------------------------------------------------------------

pub struct TestStore {
    endpoint: Endpoint,
    blobs: DashMap<Reference, Vec<u8>>,
    redirects: DashMap<Reference, Vec<Location>>,
    pub ping_ok: AtomicBool,
    /// When set, every Get/Put/Delete fails with a transient error.
    pub unavailable: AtomicBool,
    pub closed: AtomicBool,
    pub puts: AtomicUsize,
}

impl TestStore {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            blobs: DashMap::new(),
            redirects: DashMap::new(),
            ping_ok: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
        })
    }

    /// Store bytes under their content reference.
    pub fn insert(&self, data: &[u8]) -> Reference {
        let reference = Reference::for_data(data);
        self.blobs.insert(reference.clone(), data.to_vec());
        reference
    }

    /// Answer `from` with redirects instead of bytes.
    pub fn redirect(&self, from: Reference, to: Vec<Location>) {
        self.redirects.insert(from, to);
    }

    pub fn contains(&self, reference: &Reference) -> bool {
        self.blobs.contains_key(reference)
    }

    fn check_available(&self, op: &'static str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::unavailable(op, "service unavailable")
                .with_path(self.endpoint.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Service for TestStore {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn ping(&self) -> bool {
        self.ping_ok.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreServer for TestStore {
    async fn get(&self, reference: &Reference) -> Result<StoreGet> {
        self.check_available("teststore.get")?;
        if let Some(data) = self.blobs.get(reference) {
            return Ok(StoreGet::bytes(
                data.clone(),
                Refdata::cacheable(reference.clone()),
            ));
        }
        if let Some(locations) = self.redirects.get(reference) {
            return Ok(StoreGet::redirect(reference.clone(), locations.clone()));
        }
        Err(Error::not_exist("teststore.get", "no such reference")
            .with_path(reference.as_str()))
    }

    async fn put(&self, data: &[u8]) -> Result<Refdata> {
        self.check_available("teststore.put")?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(Refdata::cacheable(self.insert(data)))
    }

    async fn delete(&self, reference: &Reference) -> Result<()> {
        self.check_available("teststore.delete")?;
        self.blobs
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| {
                Error::not_exist("teststore.delete", "no such reference")
                    .with_path(reference.as_str())
            })
    }
}

pub struct TestStoreDialer {
    stores: DashMap<String, Arc<TestStore>>,
    pub dials: AtomicUsize,
    /// Artificial dial latency, for overlap in concurrency tests.
    pub delay_ms: AtomicU64,
}

impl TestStoreDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stores: DashMap::new(),
            dials: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        })
    }

    pub fn add(&self, store: Arc<TestStore>) {
        self.stores.insert(store.endpoint.net_addr.clone(), store);
    }

    /// Replace the store served at an address, simulating a restarted
    /// server behind the same endpoint.
    pub fn replace(&self, store: Arc<TestStore>) {
        self.add(store);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreDialer for TestStoreDialer {
    async fn dial(&self, _ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn StoreServer>> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.stores
            .get(&endpoint.net_addr)
            .map(|s| Arc::clone(&*s) as Arc<dyn StoreServer>)
            .ok_or_else(|| {
                Error::not_exist("teststore.dial", "no store at endpoint")
                    .with_path(endpoint.to_string())
            })
    }
}

// ---------------------------------------------------------------------
// DirServer fixture
// ---------------------------------------------------------------------

pub struct TestDir {
    endpoint: Endpoint,
    entries: DashMap<PathName, DirEntry>,
    pub ping_ok: AtomicBool,
}

impl TestDir {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            entries: DashMap::new(),
            ping_ok: AtomicBool::new(true),
        })
    }

    pub fn put_entry(&self, entry: DirEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn remove_entry(&self, name: &PathName) {
        self.entries.remove(name);
    }

    /// A link answered for a lookup at or below its path. With
    /// `include_final` false only intermediate links count, matching
    /// operations like Delete that act on a terminal link itself.
    fn link_in_path(&self, parsed: &Parsed, include_final: bool) -> Option<DirEntry> {
        let last = if include_final {
            parsed.nelem()
        } else {
            parsed.nelem().saturating_sub(1)
        };
        for n in 1..=last {
            let prefix = parsed.first_n(n).path();
            if let Some(entry) = self.entries.get(&prefix) {
                if entry.attr == Attribute::Link {
                    return Some(entry.clone());
                }
            }
        }
        None
    }

    fn resolve(&self, op: &'static str, name: &PathName) -> Result<DirEntry> {
        let parsed = Parsed::parse(name)?;
        let canonical = parsed.path();
        if let Some(link) = self.link_in_path(&parsed, true) {
            return Err(Error::follow_link(op, Some(link)));
        }
        self.entries
            .get(&canonical)
            .map(|e| e.clone())
            .ok_or_else(|| Error::not_exist(op, "no such entry").with_path(canonical.as_str()))
    }
}

#[async_trait]
impl Service for TestDir {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn ping(&self) -> bool {
        self.ping_ok.load(Ordering::SeqCst)
    }

    async fn close(&self) {}
}

#[async_trait]
impl DirServer for TestDir {
    async fn lookup(&self, name: &PathName) -> Result<DirEntry> {
        self.resolve("testdir.lookup", name)
    }

    async fn put(&self, entry: &DirEntry) -> Result<DirEntry> {
        self.entries.insert(entry.name.clone(), entry.clone());
        Ok(entry.clone())
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<DirEntry>> {
        let prefix = pattern.trim_end_matches("/*");
        let mut found: Vec<DirEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().as_str().starts_with(prefix))
            .map(|e| e.value().clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn delete(&self, name: &PathName) -> Result<DirEntry> {
        const OP: &str = "testdir.delete";
        let parsed = Parsed::parse(name)?;
        let canonical = parsed.path();
        // A terminal link is deleted itself; only intermediate links
        // redirect the caller.
        if let Some(link) = self.link_in_path(&parsed, false) {
            return Err(Error::follow_link(OP, Some(link)));
        }
        self.entries
            .remove(&canonical)
            .map(|(_, entry)| entry)
            .ok_or_else(|| Error::not_exist(OP, "no such entry").with_path(canonical.as_str()))
    }

    async fn which_access(&self, name: &PathName) -> Result<DirEntry> {
        let parsed = Parsed::parse(name)?;
        for n in (0..=parsed.nelem()).rev() {
            let candidate = PathName::new(format!(
                "{}/Access",
                parsed.first_n(n).path().as_str().trim_end_matches('/')
            ));
            if let Some(entry) = self.entries.get(&candidate) {
                return Ok(entry.clone());
            }
        }
        Err(Error::not_exist("testdir.which_access", "no Access file")
            .with_path(name.as_str()))
    }

    async fn make_directory(&self, name: &PathName) -> Result<DirEntry> {
        let parsed = Parsed::parse(name)?;
        let entry = DirEntry::directory(parsed.path(), parsed.user().clone());
        self.entries.insert(entry.name.clone(), entry.clone());
        Ok(entry)
    }
}

pub struct TestDirDialer {
    dirs: DashMap<String, Arc<TestDir>>,
    pub dials: AtomicUsize,
}

impl TestDirDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dirs: DashMap::new(),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn add(&self, dir: Arc<TestDir>) {
        self.dirs.insert(dir.endpoint.net_addr.clone(), dir);
    }
}

#[async_trait]
impl DirDialer for TestDirDialer {
    async fn dial(&self, _ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn DirServer>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.dirs
            .get(&endpoint.net_addr)
            .map(|d| Arc::clone(&*d) as Arc<dyn DirServer>)
            .ok_or_else(|| {
                Error::not_exist("testdir.dial", "no dir at endpoint")
                    .with_path(endpoint.to_string())
            })
    }
}

// ---------------------------------------------------------------------
// KeyServer fixture
// ---------------------------------------------------------------------

pub struct TestKey {
    endpoint: Endpoint,
    records: DashMap<UserName, UserRecord>,
}

impl TestKey {
    pub fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            records: DashMap::new(),
        })
    }

    pub fn add_user(&self, record: UserRecord) {
        self.records.insert(record.name.clone(), record);
    }
}

#[async_trait]
impl Service for TestKey {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

#[async_trait]
impl KeyServer for TestKey {
    async fn lookup(&self, user: &UserName) -> Result<UserRecord> {
        self.records
            .get(user)
            .map(|r| r.clone())
            .ok_or_else(|| {
                Error::not_exist("testkey.lookup", "no such user").with_path(user.as_str())
            })
    }

    async fn put(&self, record: &UserRecord) -> Result<()> {
        self.records.insert(record.name.clone(), record.clone());
        Ok(())
    }
}

pub struct TestKeyDialer {
    keys: DashMap<String, Arc<TestKey>>,
}

impl TestKeyDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: DashMap::new(),
        })
    }

    pub fn add(&self, key: Arc<TestKey>) {
        self.keys.insert(key.endpoint.net_addr.clone(), key);
    }
}

#[async_trait]
impl KeyDialer for TestKeyDialer {
    async fn dial(&self, _ctx: &Context, endpoint: &Endpoint) -> Result<Arc<dyn KeyServer>> {
        self.keys
            .get(&endpoint.net_addr)
            .map(|k| Arc::clone(&*k) as Arc<dyn KeyServer>)
            .ok_or_else(|| {
                Error::not_exist("testkey.dial", "no key server at endpoint")
                    .with_path(endpoint.to_string())
            })
    }
}

// ---------------------------------------------------------------------
// Wired-up environment
// ---------------------------------------------------------------------

/// One switch with all three inprocess services registered, plus a
/// context for the named user.
pub struct TestEnv {
    pub switch: Arc<Switch>,
    pub ctx: Context,
    pub store: Arc<TestStore>,
    pub store_dialer: Arc<TestStoreDialer>,
    pub dir: Arc<TestDir>,
    pub dir_dialer: Arc<TestDirDialer>,
    pub key: Arc<TestKey>,
}

impl TestEnv {
    pub fn new(user_name: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let store_ep = inprocess("store1");
        let dir_ep = inprocess("dir1");
        let key_ep = inprocess("key1");

        let store = TestStore::new(store_ep.clone());
        let store_dialer = TestStoreDialer::new();
        store_dialer.add(store.clone());

        let dir = TestDir::new(dir_ep.clone());
        let dir_dialer = TestDirDialer::new();
        dir_dialer.add(dir.clone());

        let key = TestKey::new(key_ep.clone());
        let key_dialer = TestKeyDialer::new();
        key_dialer.add(key.clone());

        let switch = Arc::new(Switch::new());
        switch
            .register_store_server(Transport::InProcess, store_dialer.clone())
            .unwrap();
        switch
            .register_dir_server(Transport::InProcess, dir_dialer.clone())
            .unwrap();
        switch
            .register_key_server(Transport::InProcess, key_dialer.clone())
            .unwrap();

        let owner = user(user_name);
        key.add_user(UserRecord {
            name: owner.clone(),
            dirs: vec![dir_ep.clone()],
            stores: vec![store_ep.clone()],
            public_key: String::new(),
        });

        let ctx = Context::new(owner)
            .with_key_endpoint(key_ep)
            .with_dir_endpoint(dir_ep)
            .with_store_endpoint(store_ep);

        Self {
            switch,
            ctx,
            store,
            store_dialer,
            dir,
            dir_dialer,
            key,
        }
    }

    /// Pack `data` as a single plain block, store the ciphertext, and
    /// record the entry in the directory.
    pub fn write_file(&self, name: &str, data: &[u8]) -> DirEntry {
        let name = PathName::new(name);
        let owner = Parsed::parse(&name).unwrap().user().clone();
        let packer = pack::lookup(Packing::Plain).unwrap();
        let (ciphertext, packdata) = packer.pack_block(&self.ctx, data).unwrap();
        let reference = self.store.insert(&ciphertext);

        let mut entry = DirEntry::regular(name, owner, Packing::Plain);
        entry.blocks.push(DirBlock {
            offset: 0,
            size: data.len() as i64,
            location: Location::new(self.store.endpoint(), reference),
            packdata,
        });
        self.dir.put_entry(entry.clone());
        entry
    }
}
