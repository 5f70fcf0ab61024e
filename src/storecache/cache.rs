//! On-disk LRU byte cache
//!
//! Cached blobs live under `{cache_root}/{endpoint}/{ref[:2]}/{ref}`.
//! An in-memory LRU keyed by that relative path orders eviction; a
//! byte counter enforces the cap. Writeback hard links under the
//! writeback root share the blob's inode, so a cached byte survives
//! until both paths are unlinked.
//!
//! Lock order is strictly `state` (the LRU and byte counter) then the
//! per-entry mutex. No upstream call happens under either lock.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::errors::{Error, Result};
use crate::storecache::accesslog::AccessLog;
use crate::types::{Endpoint, Refdata, Reference};

/// State of one cache slot.
///
/// If `busy`, exactly one task owns the slot and peers wait on `done`.
/// `valid=false, busy=false` marks a placeholder left by a failed
/// attempt; the next caller claims and retries it.
pub(crate) struct CacheEntry {
    size: u64,
    valid: bool,
    busy: bool,
    /// Set by eviction on a busy slot; the owner removes the file when
    /// it finishes instead of publishing it.
    remove_on_idle: bool,
    done: Option<watch::Sender<bool>>,
}

impl CacheEntry {
    fn busy() -> Self {
        Self {
            size: 0,
            valid: false,
            busy: true,
            remove_on_idle: false,
            done: Some(watch::channel(false).0),
        }
    }

    fn valid(size: u64) -> Self {
        Self {
            size,
            valid: true,
            busy: false,
            remove_on_idle: false,
            done: None,
        }
    }
}

struct LruState {
    lru: LruCache<String, Arc<Mutex<CacheEntry>>>,
    in_use: u64,
}

enum Claim {
    Hit,
    Wait(watch::Receiver<bool>),
    Own(Arc<Mutex<CacheEntry>>),
}

pub(crate) struct DiskCache {
    cache_root: PathBuf,
    wb_root: PathBuf,
    max_bytes: u64,
    state: Mutex<LruState>,
    log: Mutex<AccessLog>,
}

/// References usable as cache file names. Synthetic references and
/// anything that would escape the fan-out directory are served without
/// caching.
fn cacheable_reference(reference: &Reference) -> bool {
    let s = reference.as_str();
    !s.is_empty() && !reference.is_metadata() && !s.contains('/') && !s.starts_with('.')
}

fn fan(reference: &Reference) -> &str {
    let s = reference.as_str();
    &s[..s.len().min(2)]
}

impl DiskCache {
    /// Open the cache, replaying the access log into LRU order,
    /// appending any orphan files at the MRU end, and rewriting the
    /// log compactly.
    pub fn open(cache_root: &Path, wb_root: &Path, max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(cache_root)?;
        std::fs::create_dir_all(wb_root)?;

        let mut log = AccessLog::open(&cache_root.join("store.log"))?;
        let replayed = log.replay()?;
        let on_disk = scan_files(cache_root)?;

        let mut lru = LruCache::unbounded();
        let mut in_use: u64 = 0;
        for line in &replayed {
            match on_disk.get(line.as_str()) {
                Some(&size) => {
                    if lru.contains(line.as_str()) {
                        lru.get(line.as_str());
                    } else {
                        lru.put(line.clone(), Arc::new(Mutex::new(CacheEntry::valid(size))));
                        in_use += size;
                    }
                }
                None => continue,
            }
        }
        let mut orphans: Vec<_> = on_disk
            .iter()
            .filter(|(rel, _)| !lru.contains(rel.as_str()))
            .collect();
        orphans.sort();
        for (rel, &size) in orphans {
            lru.put(rel.clone(), Arc::new(Mutex::new(CacheEntry::valid(size))));
            in_use += size;
        }

        let lines: Vec<String> = lru.iter().map(|(k, _)| k.clone()).collect();
        log.rewrite(lines.iter().rev().map(|s| s.as_str()))?;
        log.flush()?;

        Ok(Self {
            cache_root: cache_root.to_path_buf(),
            wb_root: wb_root.to_path_buf(),
            max_bytes,
            state: Mutex::new(LruState { lru, in_use }),
            log: Mutex::new(log),
        })
    }

    fn rel_path(endpoint: &Endpoint, reference: &Reference) -> String {
        format!("{endpoint}/{}/{reference}", fan(reference))
    }

    fn cache_path(&self, rel: &str) -> PathBuf {
        self.cache_root.join(rel)
    }

    fn wb_path(&self, endpoint: &Endpoint, reference: &Reference) -> PathBuf {
        self.wb_root.join(Self::rel_path(endpoint, reference))
    }

    /// Total cached bytes.
    pub fn bytes_in_use(&self) -> u64 {
        self.state.lock().in_use
    }

    /// Fetch a reference through the cache. On a hit the bytes come
    /// from disk; on a miss exactly one caller runs `fetch` while
    /// concurrent callers for the same reference wait and then adopt
    /// the slot. Volatile results are returned without caching.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        endpoint: &Endpoint,
        reference: &Reference,
        fetch: F,
    ) -> Result<(Vec<u8>, Refdata)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Vec<u8>, Refdata)>>,
    {
        if !cacheable_reference(reference) {
            return fetch().await;
        }
        let rel = Self::rel_path(endpoint, reference);
        let mut fetch = Some(fetch);

        loop {
            let claim = self.claim(&rel);
            match claim {
                Claim::Hit => match std::fs::read(self.cache_path(&rel)) {
                    Ok(data) => {
                        self.log_access(&rel)?;
                        return Ok((data, Refdata::cacheable(reference.clone())));
                    }
                    Err(_) => {
                        // File vanished under the slot; drop it and retry.
                        self.drop_slot(&rel);
                        continue;
                    }
                },
                Claim::Wait(mut rx) => {
                    let _ = rx.changed().await;
                    continue;
                }
                Claim::Own(entry) => {
                    let fetch = fetch
                        .take()
                        .ok_or_else(|| Error::internal("storecache.get", "slot claimed twice"))?;
                    return match fetch().await {
                        Ok((data, refdata)) => {
                            if refdata.volatile {
                                self.finish_discard(&rel, &entry);
                            } else {
                                if let Err(e) = self.write_blob(&rel, &data) {
                                    log::warn!("failed to cache {rel}: {e}");
                                    self.finish_discard(&rel, &entry);
                                    return Ok((data, refdata));
                                }
                                self.commit(&rel, &entry, data.len() as u64);
                                self.log_access(&rel)?;
                            }
                            Ok((data, refdata))
                        }
                        Err(e) => {
                            self.finish_failed(&entry);
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Store bytes in the cache. With `link_writeback`, a hard link is
    /// created under the writeback root before the slot is published,
    /// making the pending upload durable.
    pub async fn put_local(
        &self,
        endpoint: &Endpoint,
        reference: &Reference,
        data: &[u8],
        link_writeback: bool,
    ) -> Result<()> {
        const OP: &str = "storecache.put";
        if !cacheable_reference(reference) {
            return Err(Error::invalid(OP, "reference is not cacheable")
                .with_path(reference.as_str()));
        }
        let rel = Self::rel_path(endpoint, reference);

        loop {
            match self.claim(&rel) {
                Claim::Hit => {
                    // Same content already cached; only the writeback
                    // link may be missing.
                    if link_writeback {
                        self.link_writeback(&rel, endpoint, reference)?;
                    }
                    self.log_access(&rel)?;
                    return Ok(());
                }
                Claim::Wait(mut rx) => {
                    let _ = rx.changed().await;
                    continue;
                }
                Claim::Own(entry) => {
                    let install: Result<()> = (|| {
                        self.write_blob(&rel, data)?;
                        if link_writeback {
                            self.link_writeback(&rel, endpoint, reference)?;
                        }
                        Ok(())
                    })();
                    return match install {
                        Ok(()) => {
                            self.commit(&rel, &entry, data.len() as u64);
                            self.log_access(&rel)?;
                            Ok(())
                        }
                        Err(e) => {
                            self.finish_failed(&entry);
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    /// Remove a reference from the cache, skipping busy slots. The
    /// writeback link, if any, is left alone.
    pub fn delete_local(&self, endpoint: &Endpoint, reference: &Reference) {
        let rel = Self::rel_path(endpoint, reference);
        let mut state = self.state.lock();
        let Some(entry) = state.lru.peek(&rel).cloned() else {
            return;
        };
        {
            let e = entry.lock();
            if e.busy {
                return;
            }
            if e.valid {
                state.in_use = state.in_use.saturating_sub(e.size);
            }
        }
        state.lru.pop(&rel);
        drop(state);
        let _ = std::fs::remove_file(self.cache_path(&rel));
    }

    /// Read the bytes of a pending writeback from its hard link.
    pub fn read_writeback(&self, endpoint: &Endpoint, reference: &Reference) -> Result<Vec<u8>> {
        std::fs::read(self.wb_path(endpoint, reference)).map_err(|e| {
            Error::io("storecache.writeback", format!("pending writeback unreadable: {e}"))
                .with_path(reference.as_str())
        })
    }

    /// Drop a completed writeback's hard link.
    pub fn unlink_writeback(&self, endpoint: &Endpoint, reference: &Reference) {
        let _ = std::fs::remove_file(self.wb_path(endpoint, reference));
    }

    /// Walk the writeback root after a restart. Every file found is a
    /// pending upload; cache files missing their inode are re-created
    /// as hard links so the Get path still finds the bytes.
    pub fn recover_writebacks(&self) -> Result<Vec<(Endpoint, Reference)>> {
        let mut pending = Vec::new();
        for (rel, _) in scan_files(&self.wb_root)? {
            let (ep_str, reference) = match rel.split_once('/') {
                Some((ep, rest)) => match rest.split_once('/') {
                    Some((_, name)) => (ep, Reference::new(name)),
                    None => continue,
                },
                None => continue,
            };
            let endpoint = match Endpoint::parse(ep_str) {
                Ok(ep) => ep,
                Err(e) => {
                    log::warn!("ignoring writeback under malformed endpoint {ep_str:?}: {e}");
                    continue;
                }
            };
            let cache_path = self.cache_path(&rel);
            if !cache_path.exists() {
                if let Some(parent) = cache_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::hard_link(self.wb_path(&endpoint, &reference), &cache_path)?;
                let size = std::fs::metadata(&cache_path)?.len();
                let mut state = self.state.lock();
                if state.lru.put(rel.clone(), Arc::new(Mutex::new(CacheEntry::valid(size)))).is_none() {
                    state.in_use += size;
                }
            }
            pending.push((endpoint, reference));
        }
        Ok(pending)
    }

    /// Flush buffered access-log appends.
    pub fn flush_log(&self) {
        if let Err(e) = self.log.lock().flush() {
            log::error!("access log flush failed: {e}");
        }
    }

    /// Decide what to do with the slot for `rel`, installing a busy
    /// placeholder when the caller becomes the owner.
    fn claim(&self, rel: &str) -> Claim {
        let mut state = self.state.lock();
        match state.lru.get(rel).cloned() {
            Some(entry) => {
                let mut e = entry.lock();
                if e.busy {
                    let rx = e
                        .done
                        .get_or_insert_with(|| watch::channel(false).0)
                        .subscribe();
                    Claim::Wait(rx)
                } else if e.valid {
                    Claim::Hit
                } else {
                    e.busy = true;
                    e.remove_on_idle = false;
                    e.done = Some(watch::channel(false).0);
                    drop(e);
                    Claim::Own(entry)
                }
            }
            None => {
                let entry = Arc::new(Mutex::new(CacheEntry::busy()));
                state.lru.put(rel.to_string(), entry.clone());
                Claim::Own(entry)
            }
        }
    }

    fn write_blob(&self, rel: &str, data: &[u8]) -> Result<()> {
        let path = self.cache_path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(())
    }

    fn link_writeback(&self, rel: &str, endpoint: &Endpoint, reference: &Reference) -> Result<()> {
        let wb = self.wb_path(endpoint, reference);
        if wb.exists() {
            return Ok(());
        }
        if let Some(parent) = wb.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::hard_link(self.cache_path(rel), &wb) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish an owned slot: make room, account the bytes, wake
    /// waiters. A slot evicted while busy is removed instead.
    fn commit(&self, rel: &str, entry: &Arc<Mutex<CacheEntry>>, size: u64) {
        let mut state = self.state.lock();
        self.make_room(&mut state, size, rel);
        let mut e = entry.lock();
        if e.remove_on_idle {
            e.busy = false;
            e.valid = false;
            if let Some(tx) = e.done.take() {
                let _ = tx.send(true);
            }
            drop(e);
            drop(state);
            let _ = std::fs::remove_file(self.cache_path(rel));
            return;
        }
        e.size = size;
        e.valid = true;
        e.busy = false;
        if let Some(tx) = e.done.take() {
            let _ = tx.send(true);
        }
        state.in_use += size;
    }

    /// Leave a failed slot as a retryable placeholder.
    fn finish_failed(&self, entry: &Arc<Mutex<CacheEntry>>) {
        let mut e = entry.lock();
        e.busy = false;
        e.valid = false;
        if let Some(tx) = e.done.take() {
            let _ = tx.send(true);
        }
    }

    /// Remove an owned placeholder entirely (volatile or uncacheable
    /// results).
    fn finish_discard(&self, rel: &str, entry: &Arc<Mutex<CacheEntry>>) {
        let mut state = self.state.lock();
        state.lru.pop(rel);
        let mut e = entry.lock();
        e.busy = false;
        e.valid = false;
        if let Some(tx) = e.done.take() {
            let _ = tx.send(true);
        }
    }

    fn drop_slot(&self, rel: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.lru.pop(rel) {
            let e = entry.lock();
            if e.valid {
                state.in_use = state.in_use.saturating_sub(e.size);
            }
        }
    }

    /// Evict from the LRU tail until `incoming` more bytes fit. Busy
    /// tails are marked for removal on idle and skipped rather than
    /// waited for; `keep` is never evicted.
    fn make_room(&self, state: &mut LruState, incoming: u64, keep: &str) {
        while state.in_use + incoming > self.max_bytes {
            let Some(tail) = state.lru.peek_lru().map(|(k, _)| k.clone()) else {
                break;
            };
            if tail == keep {
                break;
            }
            let Some(entry) = state.lru.pop(&tail) else {
                break;
            };
            let mut e = entry.lock();
            if e.busy {
                e.remove_on_idle = true;
                continue;
            }
            if e.valid {
                state.in_use = state.in_use.saturating_sub(e.size);
                drop(e);
                let _ = std::fs::remove_file(self.cache_path(&tail));
            }
        }
    }

    fn log_access(&self, rel: &str) -> Result<()> {
        let needs_compaction = {
            let mut log = self.log.lock();
            log.append(rel)?;
            log.needs_compaction()
        };
        if needs_compaction {
            self.compact_log()?;
        }
        Ok(())
    }

    /// Rewrite the log from the live LRU, least recently used first.
    fn compact_log(&self) -> Result<()> {
        let state = self.state.lock();
        let lines: Vec<String> = state.lru.iter().map(|(k, _)| k.clone()).collect();
        let mut log = self.log.lock();
        log.rewrite(lines.iter().rev().map(|s| s.as_str()))
    }
}

/// Map of `endpoint/fan/name` relative paths to file sizes under a
/// root.
fn scan_files(root: &Path) -> Result<HashMap<String, u64>> {
    let mut files = HashMap::new();
    if !root.exists() {
        return Ok(files);
    }
    for ep_entry in std::fs::read_dir(root)? {
        let ep_entry = ep_entry?;
        if !ep_entry.file_type()?.is_dir() {
            continue; // store.log and friends
        }
        let ep_name = ep_entry.file_name().to_string_lossy().into_owned();
        for fan_entry in std::fs::read_dir(ep_entry.path())? {
            let fan_entry = fan_entry?;
            if !fan_entry.file_type()?.is_dir() {
                continue;
            }
            let fan_name = fan_entry.file_name().to_string_lossy().into_owned();
            for file_entry in std::fs::read_dir(fan_entry.path())? {
                let file_entry = file_entry?;
                if !file_entry.file_type()?.is_file() {
                    continue;
                }
                let name = file_entry.file_name().to_string_lossy().into_owned();
                let size = file_entry.metadata()?.len();
                files.insert(format!("{ep_name}/{fan_name}/{name}"), size);
            }
        }
    }
    Ok(files)
}
