//! Deduplicating async priority queue of document ids.
//!
//! Higher priority pops first; equal priorities pop in the order ids were
//! first seen by the queue. Pushing an id that is already queued is a no-op,
//! and changing the priority of a queued id reorders it. Replaced heap
//! entries are discarded lazily on pop.

use crate::Priority;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: Priority,
    order: u64,
    version: u64,
    id: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    /// Queued ids and the version of their live heap entry
    members: HashMap<String, u64>,
    priorities: HashMap<String, Priority>,
    order: HashMap<String, u64>,
    next_order: u64,
    next_version: u64,
}

impl QueueState {
    fn order_of(&mut self, id: &str) -> u64 {
        if let Some(order) = self.order.get(id) {
            return *order;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.order.insert(id.to_string(), order);
        order
    }

    fn enqueue(&mut self, id: &str) {
        let order = self.order_of(id);
        let priority = self.priorities.get(id).copied().unwrap_or_default();
        let version = self.next_version;
        self.next_version += 1;
        self.members.insert(id.to_string(), version);
        self.heap.push(Entry {
            priority,
            order,
            version,
            id: id.to_string(),
        });
    }
}

/// Priority queue shared between producers and async consumers.
#[derive(Debug, Default)]
pub struct AsyncPriorityQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl AsyncPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `id`. Returns false when it was already queued.
    pub fn push(&self, id: &str) -> bool {
        {
            let mut state = self.state();
            if state.members.contains_key(id) {
                return false;
            }
            state.enqueue(id);
        }
        self.notify.notify_one();
        true
    }

    /// Set the priority used for `id` from now on, reordering it if queued.
    pub fn set_priority(&self, id: &str, priority: Priority) {
        let mut state = self.state();
        state.order_of(id);
        state.priorities.insert(id.to_string(), priority);
        if state.members.contains_key(id) {
            state.enqueue(id);
        }
    }

    pub fn priority(&self, id: &str) -> Priority {
        self.state().priorities.get(id).copied().unwrap_or_default()
    }

    /// Drop `id` from the queue. Its priority and registration order are kept.
    pub fn remove(&self, id: &str) -> bool {
        self.state().members.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state().members.contains_key(id)
    }

    /// Pop the highest priority id, if any.
    pub fn try_pop(&self) -> Option<String> {
        let mut state = self.state();
        while let Some(entry) = state.heap.pop() {
            if state.members.get(&entry.id) == Some(&entry.version) {
                state.members.remove(&entry.id);
                return Some(entry.id);
            }
        }
        None
    }

    /// Wait for and pop the highest priority id.
    ///
    /// Cancel safe: dropping the future never loses a queued id.
    pub async fn next(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(id) = self.try_pop() {
                return id;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued id.
    pub fn clear(&self) {
        let mut state = self.state();
        state.members.clear();
        state.heap.clear();
    }
}
