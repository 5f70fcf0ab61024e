//! Writeback queue
//!
//! Durably uploads locally-Put references to their endpoints. All
//! queue state is owned by a single scheduler task; writers pull work
//! from a bounded `ready` channel and report results back as events.
//! Requests for one endpoint complete in FIFO order; endpoints are
//! independent. Every endpoint starts untrusted and is probed with a
//! single request until a success marks it live.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::bind::Switch;
use crate::errors::{Error, Result};
use crate::service::Context;
use crate::storecache::cache::DiskCache;
use crate::types::{Endpoint, Location, Reference};

/// Target number of writer tasks, and the ceiling for the adaptive
/// parallelism counter.
const NUM_WRITERS: usize = 20;

/// One pending upload. Persisted on disk as the writeback hard link;
/// this record only schedules it.
#[derive(Debug)]
struct WritebackRequest {
    endpoint: Endpoint,
    reference: Reference,
    attempts: u32,
}

enum Event {
    New(WritebackRequest),
    Done(WritebackRequest, Option<Error>),
    Retry(Endpoint),
}

struct EndpointQueue {
    queue: VecDeque<WritebackRequest>,
    live: bool,
    /// A single probe request is in flight for a not-live endpoint.
    probing: bool,
    retry_scheduled: bool,
}

impl EndpointQueue {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            live: false,
            probing: false,
            retry_scheduled: false,
        }
    }
}

/// Scheduler state, owned by the scheduler task. Writers never touch
/// it; they communicate through `ready` and `Done` events.
struct Scheduler {
    queues: HashMap<Endpoint, EndpointQueue>,
    /// Requests handed to writers and not yet reported done.
    outstanding: usize,
    /// Adaptive concurrency: grows by one per success up to
    /// [`NUM_WRITERS`], halves on failure.
    parallelism: usize,
    ready_tx: mpsc::Sender<WritebackRequest>,
    events_tx: mpsc::UnboundedSender<Event>,
    retry_interval: Duration,
}

impl Scheduler {
    fn handle(&mut self, event: Event) {
        match event {
            Event::New(req) => {
                let endpoint = req.endpoint.clone();
                let q = self
                    .queues
                    .entry(endpoint.clone())
                    .or_insert_with(EndpointQueue::new);
                q.queue.push_back(req);
                if !q.live && !q.probing && !q.retry_scheduled {
                    // Untrusted endpoint: probe it now.
                    self.schedule_retry(endpoint, Duration::ZERO);
                }
            }
            Event::Done(req, None) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                self.parallelism = (self.parallelism + 1).min(NUM_WRITERS);
                if let Some(q) = self.queues.get_mut(&req.endpoint) {
                    q.live = true;
                    q.probing = false;
                }
            }
            Event::Done(req, Some(err)) => {
                log::warn!(
                    "writeback of {} to {} failed (attempt {}): {err}",
                    req.reference,
                    req.endpoint,
                    req.attempts + 1
                );
                self.outstanding = self.outstanding.saturating_sub(1);
                self.parallelism = (self.parallelism / 2).max(1);
                let endpoint = req.endpoint.clone();
                let q = self
                    .queues
                    .entry(endpoint.clone())
                    .or_insert_with(EndpointQueue::new);
                q.live = false;
                q.probing = false;
                let mut req = req;
                req.attempts += 1;
                q.queue.push_front(req);
                self.schedule_retry(endpoint, self.retry_interval);
            }
            Event::Retry(endpoint) => {
                let probe = {
                    let Some(q) = self.queues.get_mut(&endpoint) else {
                        return;
                    };
                    q.retry_scheduled = false;
                    if q.live || q.probing {
                        return;
                    }
                    match q.queue.pop_front() {
                        Some(req) => {
                            q.probing = true;
                            Some(req)
                        }
                        None => None,
                    }
                };
                if let Some(req) = probe {
                    if !self.dispatch(req) {
                        if let Some(q) = self.queues.get_mut(&endpoint) {
                            q.probing = false;
                        }
                        self.schedule_retry(endpoint, self.retry_interval);
                    }
                }
            }
        }
    }

    /// Feed live endpoints into `ready` up to the parallelism target.
    fn drain(&mut self) {
        let endpoints: Vec<Endpoint> = self
            .queues
            .iter()
            .filter(|(_, q)| q.live && !q.queue.is_empty())
            .map(|(e, _)| e.clone())
            .collect();
        'outer: loop {
            let mut progressed = false;
            for endpoint in &endpoints {
                if self.outstanding >= self.parallelism {
                    break 'outer;
                }
                let req = {
                    let Some(q) = self.queues.get_mut(endpoint) else {
                        continue;
                    };
                    if !q.live {
                        continue;
                    }
                    match q.queue.pop_front() {
                        Some(req) => req,
                        None => continue,
                    }
                };
                if self.dispatch(req) {
                    progressed = true;
                } else {
                    break 'outer;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Hand one request to the writers. On a full channel the request
    /// goes back to the head of its queue.
    fn dispatch(&mut self, req: WritebackRequest) -> bool {
        match self.ready_tx.try_send(req) {
            Ok(()) => {
                self.outstanding += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(req)) => {
                let endpoint = req.endpoint.clone();
                if let Some(q) = self.queues.get_mut(&endpoint) {
                    q.queue.push_front(req);
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn schedule_retry(&mut self, endpoint: Endpoint, delay: Duration) {
        let Some(q) = self.queues.get_mut(&endpoint) else {
            return;
        };
        if q.retry_scheduled {
            return;
        }
        q.retry_scheduled = true;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let _ = events_tx.send(Event::Retry(endpoint));
        });
    }

    async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                event = events_rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => return,
                },
            }
            self.drain();
        }
    }
}

/// The writeback queue: scheduler, writers, and the pending set used
/// by flush.
pub(crate) struct Writeback {
    events_tx: mpsc::UnboundedSender<Event>,
    pending: Arc<Mutex<HashSet<(Endpoint, Reference)>>>,
    version_tx: Arc<watch::Sender<u64>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Writeback {
    /// Start the scheduler and writer tasks, re-enqueueing the
    /// requests recovered from disk.
    pub fn start(
        disk: Arc<DiskCache>,
        switch: Arc<Switch>,
        ctx: Context,
        retry_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
        recovered: Vec<(Endpoint, Reference)>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::channel(NUM_WRITERS);
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let version_tx = Arc::new(watch::channel(0u64).0);

        let mut handles = Vec::with_capacity(NUM_WRITERS + 1);
        let scheduler = Scheduler {
            queues: HashMap::new(),
            outstanding: 0,
            parallelism: 1,
            ready_tx,
            events_tx: events_tx.clone(),
            retry_interval,
        };
        handles.push(tokio::spawn(
            scheduler.run(events_rx, shutdown_rx.clone()),
        ));

        let ready_rx = Arc::new(AsyncMutex::new(ready_rx));
        for _ in 0..NUM_WRITERS {
            handles.push(tokio::spawn(writer(
                disk.clone(),
                switch.clone(),
                ctx.clone(),
                ready_rx.clone(),
                events_tx.clone(),
                pending.clone(),
                version_tx.clone(),
                shutdown_rx.clone(),
            )));
        }

        let writeback = Arc::new(Self {
            events_tx,
            pending,
            version_tx,
            handles: Mutex::new(handles),
        });
        for (endpoint, reference) in recovered {
            writeback.enqueue(endpoint, reference);
        }
        writeback
    }

    /// Schedule an upload of a reference already written to the cache
    /// and hard-linked under the writeback root.
    pub fn enqueue(&self, endpoint: Endpoint, reference: Reference) {
        self.pending
            .lock()
            .insert((endpoint.clone(), reference.clone()));
        let _ = self.events_tx.send(Event::New(WritebackRequest {
            endpoint,
            reference,
            attempts: 0,
        }));
    }

    /// Number of uploads not yet completed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Block until nothing is pending (no location), or until the
    /// given location's reference has been written back.
    pub async fn flush(&self, location: Option<&Location>) {
        let mut rx = self.version_tx.subscribe();
        loop {
            let satisfied = {
                let pending = self.pending.lock();
                match location {
                    None => pending.is_empty(),
                    Some(l) => !pending.contains(&(l.endpoint.clone(), l.reference.clone())),
                }
            };
            if satisfied {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the scheduler and writer tasks to exit. Call after the
    /// shared shutdown signal has fired.
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// One writer task: pull a request, upload, report.
#[allow(clippy::too_many_arguments)]
async fn writer(
    disk: Arc<DiskCache>,
    switch: Arc<Switch>,
    ctx: Context,
    ready_rx: Arc<AsyncMutex<mpsc::Receiver<WritebackRequest>>>,
    events_tx: mpsc::UnboundedSender<Event>,
    pending: Arc<Mutex<HashSet<(Endpoint, Reference)>>>,
    version_tx: Arc<watch::Sender<u64>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let req = {
            let mut rx = ready_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            }
        };
        match upload(&disk, &switch, &ctx, &req).await {
            Ok(()) => {
                disk.unlink_writeback(&req.endpoint, &req.reference);
                pending
                    .lock()
                    .remove(&(req.endpoint.clone(), req.reference.clone()));
                version_tx.send_modify(|v| *v += 1);
                log::debug!("wrote back {} to {}", req.reference, req.endpoint);
                let _ = events_tx.send(Event::Done(req, None));
            }
            Err(e) => {
                let _ = events_tx.send(Event::Done(req, Some(e)));
            }
        }
    }
}

async fn upload(
    disk: &DiskCache,
    switch: &Switch,
    ctx: &Context,
    req: &WritebackRequest,
) -> Result<()> {
    const OP: &str = "storecache.writeback";
    let data = disk.read_writeback(&req.endpoint, &req.reference)?;
    let store = switch.store_server(ctx, &req.endpoint).await?;
    let refdata = store.put(&data).await?;
    if refdata.reference != req.reference {
        return Err(Error::internal(
            OP,
            format!(
                "store answered reference {} for {}",
                refdata.reference, req.reference
            ),
        ));
    }
    Ok(())
}
