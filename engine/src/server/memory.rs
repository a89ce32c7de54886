//! In-process document server.
//!
//! A [`MemoryDocServer`] is one client connection to a shared in-memory
//! update log. [`MemoryDocServer::peer`] opens another connection to the
//! same log, so several engines can sync through it. Each connection can
//! simulate an unreachable server, failing or rejected requests and
//! latency, and records every call it serves.

use super::{DocServer, PullResult, ServerUpdate};
use crate::clock::ServerClock;
use crate::error::Result;
use crate::{DocId, Error};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_PAGE_SIZE: usize = 50;
const SUBSCRIPTION_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A request served by a [`MemoryDocServer`] connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCall {
    WaitForConnection,
    Push(DocId),
    Pull(DocId),
    LoadServerClocks,
    Subscribe,
}

#[derive(Debug, Default)]
struct HubState {
    clock: u64,
    docs: HashMap<DocId, Vec<(u64, Vec<u8>)>>,
    subscribers: Vec<(u64, mpsc::Sender<ServerUpdate>)>,
}

#[derive(Debug, Default)]
struct Hub {
    state: Mutex<HubState>,
    next_connection: AtomicU64,
}

#[derive(Debug, Default)]
struct Faults {
    offline: AtomicBool,
    failing_pushes: AtomicU32,
    failing_pulls: AtomicU32,
    rejecting_pushes: AtomicU32,
    lost_push_responses: AtomicU32,
    rejected_docs: Mutex<HashSet<DocId>>,
    latency_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct Activity {
    calls: Mutex<Vec<ServerCall>>,
    in_flight: Mutex<HashMap<DocId, usize>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    violations: AtomicUsize,
}

/// Marks a document request as in flight until dropped.
struct InFlight<'a> {
    activity: &'a Activity,
    doc_id: String,
}

impl<'a> InFlight<'a> {
    fn enter(activity: &'a Activity, doc_id: &str) -> Self {
        {
            let mut in_flight = lock(&activity.in_flight);
            let count = in_flight.entry(doc_id.to_string()).or_default();
            if *count > 0 {
                activity.violations.fetch_add(1, Ordering::SeqCst);
            }
            *count += 1;
        }
        let active = activity.active.fetch_add(1, Ordering::SeqCst) + 1;
        activity.max_active.fetch_max(active, Ordering::SeqCst);
        Self {
            activity,
            doc_id: doc_id.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.activity.active.fetch_sub(1, Ordering::SeqCst);
        let mut in_flight = lock(&self.activity.in_flight);
        if let Some(count) = in_flight.get_mut(&self.doc_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// One connection to an in-memory update log.
#[derive(Debug)]
pub struct MemoryDocServer {
    hub: Arc<Hub>,
    connection_id: u64,
    page_size: AtomicUsize,
    supports_clocks: AtomicBool,
    supports_subscription: AtomicBool,
    faults: Faults,
    activity: Activity,
}

impl Default for MemoryDocServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocServer {
    /// Create an empty server and connect to it.
    pub fn new() -> Self {
        Self::connect(Arc::new(Hub::default()))
    }

    fn connect(hub: Arc<Hub>) -> Self {
        let connection_id = hub.next_connection.fetch_add(1, Ordering::SeqCst);
        Self {
            hub,
            connection_id,
            page_size: AtomicUsize::new(DEFAULT_PAGE_SIZE),
            supports_clocks: AtomicBool::new(true),
            supports_subscription: AtomicBool::new(true),
            faults: Faults::default(),
            activity: Activity::default(),
        }
    }

    /// Open another connection to the same update log.
    pub fn peer(&self) -> Self {
        Self::connect(self.hub.clone())
    }

    // Behaviour

    pub fn set_page_size(&self, page_size: usize) {
        self.page_size.store(page_size.max(1), Ordering::SeqCst);
    }

    pub fn set_supports_clocks(&self, supported: bool) {
        self.supports_clocks.store(supported, Ordering::SeqCst);
    }

    pub fn set_supports_subscription(&self, supported: bool) {
        self.supports_subscription.store(supported, Ordering::SeqCst);
    }

    // Fault injection

    /// Fail every request with a network error while `true`.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next_pushes(&self, count: u32) {
        self.faults.failing_pushes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_pulls(&self, count: u32) {
        self.faults.failing_pulls.store(count, Ordering::SeqCst);
    }

    /// Store the next `count` pushes but answer them with a network error.
    pub fn lose_next_push_responses(&self, count: u32) {
        self.faults.lost_push_responses.store(count, Ordering::SeqCst);
    }

    pub fn reject_next_pushes(&self, count: u32) {
        self.faults.rejecting_pushes.store(count, Ordering::SeqCst);
    }

    /// Reject every push for `doc_id` while `rejected`.
    pub fn set_rejecting(&self, doc_id: &str, rejected: bool) {
        let mut docs = lock(&self.faults.rejected_docs);
        if rejected {
            docs.insert(doc_id.to_string());
        } else {
            docs.remove(doc_id);
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        let ms = latency.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.faults.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Close every subscription of this connection.
    pub fn drop_subscriptions(&self) {
        let mut state = lock(&self.hub.state);
        state.subscribers.retain(|(id, _)| *id != self.connection_id);
    }

    // Inspection

    pub fn calls(&self) -> Vec<ServerCall> {
        lock(&self.activity.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.activity.calls).len()
    }

    pub fn push_count(&self, doc_id: &str) -> usize {
        self.count_calls(|call| matches!(call, ServerCall::Push(id) if id == doc_id))
    }

    pub fn pull_count(&self, doc_id: &str) -> usize {
        self.count_calls(|call| matches!(call, ServerCall::Pull(id) if id == doc_id))
    }

    fn count_calls(&self, pred: impl Fn(&ServerCall) -> bool) -> usize {
        lock(&self.activity.calls).iter().filter(|call| pred(call)).count()
    }

    /// Doc ids in the order their first push or pull started.
    pub fn first_touch_order(&self) -> Vec<DocId> {
        let mut order: Vec<DocId> = Vec::new();
        for call in lock(&self.activity.calls).iter() {
            if let ServerCall::Push(id) | ServerCall::Pull(id) = call {
                if !order.contains(id) {
                    order.push(id.clone());
                }
            }
        }
        order
    }

    /// Times a push or pull started while another one for the same document
    /// was still running on this connection.
    pub fn single_flight_violations(&self) -> usize {
        self.activity.violations.load(Ordering::SeqCst)
    }

    /// Highest number of document requests running at once.
    pub fn max_concurrent_requests(&self) -> usize {
        self.activity.max_active.load(Ordering::SeqCst)
    }

    /// Updates stored for `doc_id`, in clock order.
    pub fn stored_updates(&self, doc_id: &str) -> Vec<Vec<u8>> {
        let state = lock(&self.hub.state);
        state
            .docs
            .get(doc_id)
            .map(|updates| updates.iter().map(|(_, data)| data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn latest_clock(&self, doc_id: &str) -> Option<ServerClock> {
        let state = lock(&self.hub.state);
        state
            .docs
            .get(doc_id)
            .and_then(|updates| updates.last())
            .map(|(clock, _)| ServerClock::new(*clock))
    }

    /// Store an update as if another client pushed it, notifying every
    /// subscriber.
    pub async fn inject_update(&self, doc_id: &str, update: &[u8]) -> ServerClock {
        let (clock, _) = self.store(doc_id, update, None).await;
        clock
    }

    async fn store(&self, doc_id: &str, update: &[u8], from: Option<u64>) -> (ServerClock, bool) {
        let (clock, subscribers) = {
            let mut state = lock(&self.hub.state);
            let existing = state
                .docs
                .get(doc_id)
                .and_then(|updates| updates.iter().find(|(_, data)| data == update))
                .map(|(clock, _)| *clock);
            if let Some(clock) = existing {
                return (ServerClock::new(clock), false);
            }

            state.clock += 1;
            let clock = state.clock;
            state
                .docs
                .entry(doc_id.to_string())
                .or_default()
                .push((clock, update.to_vec()));
            state.subscribers.retain(|(_, tx)| !tx.is_closed());
            let subscribers: Vec<_> = state
                .subscribers
                .iter()
                .filter(|(id, _)| Some(*id) != from)
                .map(|(_, tx)| tx.clone())
                .collect();
            (clock, subscribers)
        };

        let notification = ServerUpdate {
            doc_id: doc_id.to_string(),
            update: update.to_vec(),
            clock: ServerClock::new(clock),
        };
        for subscriber in subscribers {
            let _ = subscriber.send(notification.clone()).await;
        }
        (ServerClock::new(clock), true)
    }

    fn record(&self, call: ServerCall) {
        lock(&self.activity.calls).push(call);
    }

    async fn simulate(&self, failing: Option<&AtomicU32>) -> Result<()> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.faults.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("server unreachable".into()));
        }
        if let Some(counter) = failing {
            if take_one(counter) {
                return Err(Error::Network("connection reset".into()));
            }
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DocServer for MemoryDocServer {
    async fn wait_for_connection(&self) -> Result<()> {
        self.record(ServerCall::WaitForConnection);
        self.simulate(None).await
    }

    async fn push(&self, doc_id: &str, update: &[u8], _since: Option<ServerClock>) -> Result<ServerClock> {
        self.record(ServerCall::Push(doc_id.to_string()));
        let _in_flight = InFlight::enter(&self.activity, doc_id);
        self.simulate(Some(&self.faults.failing_pushes)).await?;

        if take_one(&self.faults.rejecting_pushes) || lock(&self.faults.rejected_docs).contains(doc_id) {
            return Err(Error::ServerRejected(format!("push to {doc_id} refused")));
        }

        let (clock, accepted) = self.store(doc_id, update, Some(self.connection_id)).await;
        tracing::trace!(doc_id, %clock, accepted, "memory server push");
        if take_one(&self.faults.lost_push_responses) {
            return Err(Error::Network("connection reset after push".into()));
        }
        Ok(clock)
    }

    async fn pull(&self, doc_id: &str, since: Option<ServerClock>) -> Result<PullResult> {
        self.record(ServerCall::Pull(doc_id.to_string()));
        let _in_flight = InFlight::enter(&self.activity, doc_id);
        self.simulate(Some(&self.faults.failing_pulls)).await?;

        let since = since.unwrap_or_default().value();
        let page_size = self.page_size.load(Ordering::SeqCst);
        let state = lock(&self.hub.state);
        let newer: Vec<&(u64, Vec<u8>)> = state
            .docs
            .get(doc_id)
            .map(|updates| updates.iter().filter(|(clock, _)| *clock > since).collect())
            .unwrap_or_default();

        let page = &newer[..newer.len().min(page_size)];
        let clock = page.last().map(|(clock, _)| *clock).unwrap_or(since);
        Ok(PullResult {
            updates: page.iter().map(|(_, data)| data.clone()).collect(),
            clock: ServerClock::new(clock),
            has_more: newer.len() > page.len(),
        })
    }

    async fn load_server_clocks(
        &self,
        after: Option<ServerClock>,
    ) -> Result<Option<HashMap<DocId, ServerClock>>> {
        self.record(ServerCall::LoadServerClocks);
        self.simulate(None).await?;
        if !self.supports_clocks.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let after = after.unwrap_or_default();
        let state = lock(&self.hub.state);
        let clocks = state
            .docs
            .iter()
            .filter_map(|(doc_id, updates)| {
                let (clock, _) = updates.last()?;
                let clock = ServerClock::new(*clock);
                (clock > after).then(|| (doc_id.clone(), clock))
            })
            .collect();
        Ok(Some(clocks))
    }

    async fn subscribe(&self) -> Result<Option<mpsc::Receiver<ServerUpdate>>> {
        self.record(ServerCall::Subscribe);
        self.simulate(None).await?;
        if !self.supports_subscription.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        lock(&self.hub.state).subscribers.push((self.connection_id, tx));
        Ok(Some(rx))
    }

    async fn disconnect(&self) {
        self.drop_subscriptions();
    }
}
