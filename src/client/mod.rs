//! Read pipeline
//!
//! Resolves a file's manifest to concrete bytes:
//! - [`Client::read_all`] unpacks an entry's blocks in order
//! - [`fetch_location`] chases store-server redirects breadth-first
//!   across unknown numbers of hops
//! - [`Client::lookup`] drives a directory operation across link
//!   boundaries, bounded by [`MAX_LINK_HOPS`]

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::bind::Switch;
use crate::errors::{Error, ErrorKind, Result};
use crate::pack;
use crate::service::{Context, DirServer};
use crate::types::{DirEntry, Location, Parsed, PathName, Refdata};

/// Bound on link traversals in one lookup. Exceeding it reports a link
/// loop.
pub const MAX_LINK_HOPS: usize = 20;

/// Resolve a location to bytes, chasing redirects breadth-first.
///
/// Maintains a FIFO work list seeded with `location` and a set of
/// visited locations, so no store is asked twice and the chase
/// terminates. The first error observed is remembered and returned if
/// no candidate yields bytes; it is marked transient only when every
/// failure along the way was transient.
pub async fn fetch_location(
    switch: &Switch,
    ctx: &Context,
    location: &Location,
) -> Result<(Vec<u8>, Refdata)> {
    const OP: &str = "client.fetch_location";

    let mut work = VecDeque::new();
    let mut visited = HashSet::new();
    work.push_back(location.clone());
    visited.insert(location.clone());

    let mut first_err: Option<Error> = None;
    let mut all_transient = true;
    let record = |err: Error, first_err: &mut Option<Error>, all_transient: &mut bool| {
        *all_transient = *all_transient && err.is_transient();
        if first_err.is_none() {
            *first_err = Some(err);
        }
    };

    while let Some(next) = work.pop_front() {
        let store = match switch.store_server(ctx, &next.endpoint).await {
            Ok(store) => store,
            Err(e) => {
                record(e, &mut first_err, &mut all_transient);
                continue;
            }
        };
        match store.get(&next.reference).await {
            Ok(got) => {
                if let Some(data) = got.data {
                    return Ok((data, got.refdata));
                }
                if got.locations.is_empty() {
                    record(
                        Error::internal(OP, "store returned neither bytes nor redirects")
                            .with_path(next.to_string()),
                        &mut first_err,
                        &mut all_transient,
                    );
                    continue;
                }
                for loc in got.locations {
                    if visited.insert(loc.clone()) {
                        work.push_back(loc);
                    }
                }
            }
            Err(e) => record(e, &mut first_err, &mut all_transient),
        }
    }

    match first_err {
        Some(e) => Err(e.with_transient(all_transient)),
        None => Err(Error::io(OP, "data not found on any store server")
            .with_path(location.to_string())),
    }
}

/// The client half of the runtime: read and lookup operations bound to
/// one caller context.
pub struct Client {
    ctx: Context,
    switch: Arc<Switch>,
}

impl Client {
    /// A client over the process-wide default switch.
    pub fn new(ctx: Context) -> Self {
        Self::with_switch(ctx, crate::bind::default_switch())
    }

    /// A client over an explicit switch, used by tests and by the
    /// storecache.
    pub fn with_switch(ctx: Context, switch: Arc<Switch>) -> Self {
        Self { ctx, switch }
    }

    /// The caller context the client operates under.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Read and decode the full contents named by an entry.
    pub async fn read_all(&self, entry: &DirEntry) -> Result<Vec<u8>> {
        const OP: &str = "client.read_all";

        if entry.is_link() {
            return Err(Error::invalid(OP, "cannot read the contents of a link")
                .with_path(entry.name.as_str()));
        }
        if entry.is_incomplete() {
            return Err(Error::permission(OP, "entry blocks are withheld")
                .with_path(entry.name.as_str()));
        }
        let parsed = Parsed::parse(&entry.name)?;
        if entry.name.is_access_controlled() && &entry.writer != parsed.user() {
            return Err(Error::invalid(OP, "access-control file not written by tree owner")
                .with_path(entry.name.as_str()));
        }

        let packer = pack::lookup(entry.packing)?;
        let mut unpacker = packer.unpack(&self.ctx, entry)?;
        let mut data = Vec::new();
        while let Some(block) = unpacker.next_block() {
            let (ciphertext, _) = fetch_location(&self.switch, &self.ctx, &block.location).await?;
            data.extend(unpacker.unpack(&ciphertext)?);
        }
        Ok(data)
    }

    /// Resolve a location to bytes through this client's switch.
    pub async fn read_location(&self, location: &Location) -> Result<Vec<u8>> {
        fetch_location(&self.switch, &self.ctx, location)
            .await
            .map(|(data, _)| data)
    }

    /// Drive a directory operation across links.
    ///
    /// Calls `op` against the DirServer for the query's user. A
    /// follow-link answer substitutes the link target for the matched
    /// prefix and retries, up to [`MAX_LINK_HOPS`] hops. With
    /// `follow_final` false a terminal link is returned as-is rather
    /// than dereferenced. Returns the operation's result together with
    /// the entry naming the last query visited; the caller's entry is
    /// never mutated.
    pub async fn lookup<F>(
        &self,
        entry: &DirEntry,
        op: F,
        follow_final: bool,
    ) -> Result<(DirEntry, DirEntry)>
    where
        F: Fn(Arc<dyn DirServer>, DirEntry) -> BoxFuture<'static, Result<DirEntry>>,
    {
        const OP: &str = "client.lookup";

        let mut current = entry.clone();
        let mut seen_link: Option<PathName> = None;

        for _ in 0..MAX_LINK_HOPS {
            let parsed = Parsed::parse(&current.name)?;
            let dir = self
                .switch
                .dir_server_for(&self.ctx, Some(parsed.user()))
                .await?;
            match op(dir, current.clone()).await {
                Ok(result) => return Ok((result, current)),
                Err(e) if e.is_follow_link() => {
                    let link_entry = match e.into_link_entry() {
                        Some(link_entry) => link_entry,
                        None => {
                            return Err(Error::internal(
                                OP,
                                "server signalled a link without an entry",
                            )
                            .with_path(current.name.as_str()))
                        }
                    };
                    if !follow_final && link_entry.name == current.name {
                        return Ok((link_entry, current));
                    }
                    let parsed_link = Parsed::parse(&link_entry.name)?;
                    if !parsed.has_prefix(&parsed_link) {
                        return Err(Error::internal(OP, "link entry does not prefix the query")
                            .with_path(link_entry.name.as_str()));
                    }
                    let target = link_entry.link.clone().ok_or_else(|| {
                        Error::internal(OP, "link entry carries no target")
                            .with_path(link_entry.name.as_str())
                    })?;
                    let tail = parsed.elems()[parsed_link.nelem()..].to_vec();
                    current.name = Parsed::parse(&target)?.with_suffix(&tail).path();
                    seen_link = Some(link_entry.name);
                }
                Err(e) => {
                    if e.is(ErrorKind::NotExist) {
                        if let Some(link) = seen_link {
                            return Err(Error::broken_link(OP, link.as_str()));
                        }
                    }
                    return Err(e);
                }
            }
        }
        Err(Error::io(OP, "link loop").with_path(entry.name.as_str()))
    }

    /// Look up the entry for a path, dereferencing links.
    pub async fn lookup_path(&self, name: &PathName) -> Result<DirEntry> {
        let probe = self.probe(name);
        let (entry, _) = self
            .lookup(
                &probe,
                |dir, e| Box::pin(async move { dir.lookup(&e.name).await }),
                true,
            )
            .await?;
        Ok(entry)
    }

    /// Delete the entry for a path. A terminal link is deleted itself,
    /// not its target.
    pub async fn delete(&self, name: &PathName) -> Result<DirEntry> {
        let probe = self.probe(name);
        let (entry, _) = self
            .lookup(
                &probe,
                |dir, e| Box::pin(async move { dir.delete(&e.name).await }),
                false,
            )
            .await?;
        Ok(entry)
    }

    /// The Access file governing a path.
    pub async fn which_access(&self, name: &PathName) -> Result<DirEntry> {
        let probe = self.probe(name);
        let (entry, _) = self
            .lookup(
                &probe,
                |dir, e| Box::pin(async move { dir.which_access(&e.name).await }),
                true,
            )
            .await?;
        Ok(entry)
    }

    fn probe(&self, name: &PathName) -> DirEntry {
        DirEntry::regular(name.clone(), self.ctx.user_name.clone(), self.ctx.packing)
    }
}
