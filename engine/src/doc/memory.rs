//! In-memory reference document.
//!
//! A last-writer-wins map built on an operation log. Each client numbers its
//! own operations 1, 2, 3...; a state vector (client -> highest integrated
//! number) is the state marker, so a diff since a marker is every operation
//! above the vector. Operations arriving ahead of a gap wait in a pending set
//! until the gap is filled. Concurrent writes to a key are ordered by
//! Lamport timestamp, then client id.

use super::{DocDiff, SubDocObserver, SyncDoc, UpdateObserver, UpdateOrigin};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

type StateVector = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapOp {
    client: String,
    seq: u64,
    lamport: u64,
    key: String,
    /// `None` deletes the key
    value: Option<Value>,
}

#[derive(Debug, Clone)]
struct Winner {
    lamport: u64,
    client: String,
    value: Option<Value>,
}

#[derive(Debug, Default)]
struct DocState {
    lamport: u64,
    state_vector: StateVector,
    ops: BTreeMap<(String, u64), MapOp>,
    pending: BTreeMap<(String, u64), MapOp>,
    values: BTreeMap<String, Winner>,
}

impl DocState {
    fn next_seq(&self, client: &str) -> u64 {
        self.state_vector.get(client).copied().unwrap_or(0) + 1
    }

    /// Returns true when the op (or a pending op it unblocked) was new.
    fn integrate(&mut self, op: MapOp) -> bool {
        let known = self.state_vector.get(&op.client).copied().unwrap_or(0);
        if op.seq <= known || self.pending.contains_key(&(op.client.clone(), op.seq)) {
            return false;
        }
        if op.seq > known + 1 {
            self.pending.insert((op.client.clone(), op.seq), op);
            return false;
        }

        let client = op.client.clone();
        self.integrate_in_order(op);
        loop {
            let next = self.next_seq(&client);
            match self.pending.remove(&(client.clone(), next)) {
                Some(op) => self.integrate_in_order(op),
                None => break,
            }
        }
        true
    }

    fn integrate_in_order(&mut self, op: MapOp) {
        self.lamport = self.lamport.max(op.lamport);
        self.state_vector.insert(op.client.clone(), op.seq);

        let wins = match self.values.get(&op.key) {
            Some(current) => (op.lamport, op.client.as_str()) > (current.lamport, current.client.as_str()),
            None => true,
        };
        if wins {
            self.values.insert(
                op.key.clone(),
                Winner {
                    lamport: op.lamport,
                    client: op.client.clone(),
                    value: op.value.clone(),
                },
            );
        }
        self.ops.insert((op.client.clone(), op.seq), op);
    }

    fn marker(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state_vector)?)
    }
}

/// In-memory document implementing [`SyncDoc`].
pub struct MemoryDoc {
    guid: String,
    client_id: String,
    state: Mutex<DocState>,
    observers: Mutex<Vec<UpdateObserver>>,
    sub_docs: Mutex<Vec<Arc<MemoryDoc>>>,
    sub_doc_observers: Mutex<Vec<SubDocObserver>>,
}

impl std::fmt::Debug for MemoryDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDoc")
            .field("guid", &self.guid)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl MemoryDoc {
    /// Create an empty document with a random client id.
    pub fn new(guid: impl Into<String>) -> Self {
        Self::with_client_id(guid, uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty document writing as `client_id`.
    pub fn with_client_id(guid: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            client_id: client_id.into(),
            state: Mutex::new(DocState::default()),
            observers: Mutex::new(Vec::new()),
            sub_docs: Mutex::new(Vec::new()),
            sub_doc_observers: Mutex::new(Vec::new()),
        }
    }

    /// Client id used for local writes.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Set a key.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.write(key.into(), Some(value.into()));
    }

    /// Delete a key.
    pub fn delete(&self, key: impl Into<String>) {
        self.write(key.into(), None);
    }

    /// Current value of a key.
    pub fn get(&self, key: &str) -> Option<Value> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.values.get(key).and_then(|w| w.value.clone())
    }

    /// All live entries.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .values
            .iter()
            .filter_map(|(key, winner)| winner.value.clone().map(|v| (key.clone(), v)))
            .collect()
    }

    /// Number of operations waiting for a missing predecessor.
    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).pending.len()
    }

    /// Create a sub-document and notify sub-document observers.
    pub fn create_sub_doc(&self, guid: impl Into<String>) -> Arc<MemoryDoc> {
        let doc = Arc::new(MemoryDoc::with_client_id(guid, self.client_id.clone()));
        self.add_sub_doc(doc.clone());
        doc
    }

    /// Attach an existing document as a sub-document.
    pub fn add_sub_doc(&self, doc: Arc<MemoryDoc>) {
        self.sub_docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(doc.clone());

        let observers = self
            .sub_doc_observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(vec![doc.clone() as Arc<dyn SyncDoc>]);
        }
    }

    fn write(&self, key: String, value: Option<Value>) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let op = MapOp {
                client: self.client_id.clone(),
                seq: state.next_seq(&self.client_id),
                lamport: state.lamport + 1,
                key,
                value,
            };
            state.integrate(op);
        }
        self.notify(UpdateOrigin::Local);
    }

    fn notify(&self, origin: UpdateOrigin) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(&self.guid, origin);
        }
    }
}

fn decode_ops(update: &[u8]) -> Result<Vec<MapOp>> {
    if update.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(update)?)
}

impl SyncDoc for MemoryDoc {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn state_marker(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.marker().unwrap_or_default()
    }

    fn encode_diff(&self, since: Option<&[u8]>) -> Result<DocDiff> {
        let since: StateVector = match since {
            Some(marker) if !marker.is_empty() => serde_json::from_slice(marker)?,
            _ => StateVector::new(),
        };

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ops: Vec<&MapOp> = state
            .ops
            .values()
            .filter(|op| op.seq > since.get(&op.client).copied().unwrap_or(0))
            .chain(state.pending.values())
            .collect();

        Ok(DocDiff {
            is_empty: ops.is_empty(),
            update: serde_json::to_vec(&ops)?,
            marker: state.marker()?,
        })
    }

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let ops = decode_ops(update)?;
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut changed = false;
            for op in ops {
                changed |= state.integrate(op);
            }
            changed
        };
        if changed {
            self.notify(origin);
        }
        Ok(())
    }

    fn merge_updates(&self, updates: &[&[u8]]) -> Result<Vec<u8>> {
        let mut merged: BTreeMap<(String, u64), MapOp> = BTreeMap::new();
        for update in updates {
            for op in decode_ops(update)? {
                merged.entry((op.client.clone(), op.seq)).or_insert(op);
            }
        }
        let ops: Vec<MapOp> = merged.into_values().collect();
        Ok(serde_json::to_vec(&ops)?)
    }

    fn observe_updates(&self, observer: UpdateObserver) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn sub_docs(&self) -> Vec<Arc<dyn SyncDoc>> {
        self.sub_docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|doc| doc.clone() as Arc<dyn SyncDoc>)
            .collect()
    }

    fn observe_sub_docs(&self, observer: SubDocObserver) {
        self.sub_doc_observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sync_into(from: &MemoryDoc, to: &MemoryDoc) {
        let diff = from.encode_diff(Some(&to.state_marker())).unwrap();
        to.apply_update(&diff.update, UpdateOrigin::Remote).unwrap();
    }

    #[test]
    fn set_and_get() {
        let doc = MemoryDoc::with_client_id("doc-1", "a");
        doc.set("title", "Hello");
        doc.set("count", 3);
        assert_eq!(doc.get("title"), Some(json!("Hello")));
        assert_eq!(doc.entries().len(), 2);

        doc.delete("title");
        assert_eq!(doc.get("title"), None);
        assert_eq!(doc.entries().len(), 1);
    }

    #[test]
    fn full_state_roundtrip() {
        let doc = MemoryDoc::with_client_id("doc-1", "a");
        doc.set("title", "Hello");
        doc.set("body", json!({"blocks": [1, 2]}));

        let copy = MemoryDoc::with_client_id("doc-1", "b");
        let state = doc.encode_diff(None).unwrap();
        assert!(!state.is_empty);
        copy.apply_update(&state.update, UpdateOrigin::Storage).unwrap();

        assert_eq!(copy.entries(), doc.entries());
        assert_eq!(copy.state_marker(), doc.state_marker());
    }

    #[test]
    fn diff_since_marker_only_contains_new_ops() {
        let doc = MemoryDoc::with_client_id("doc-1", "a");
        doc.set("x", 1);
        let marker = doc.state_marker();

        let empty = doc.encode_diff(Some(&marker)).unwrap();
        assert!(empty.is_empty);

        doc.set("y", 2);
        let diff = doc.encode_diff(Some(&marker)).unwrap();
        assert!(!diff.is_empty);

        let peer = MemoryDoc::with_client_id("doc-1", "b");
        peer.apply_update(&diff.update, UpdateOrigin::Remote).unwrap();
        // "x" is missing, so "y" waits behind the gap
        assert_eq!(peer.get("y"), None);
        assert_eq!(peer.pending_len(), 1);

        let full = doc.encode_diff(None).unwrap();
        peer.apply_update(&full.update, UpdateOrigin::Remote).unwrap();
        assert_eq!(peer.get("x"), Some(json!(1)));
        assert_eq!(peer.get("y"), Some(json!(2)));
        assert_eq!(peer.pending_len(), 0);
    }

    #[test]
    fn concurrent_writes_converge() {
        let a = MemoryDoc::with_client_id("doc-1", "a");
        let b = MemoryDoc::with_client_id("doc-1", "b");

        a.set("title", "from a");
        b.set("title", "from b");

        sync_into(&a, &b);
        sync_into(&b, &a);

        assert_eq!(a.entries(), b.entries());
        // equal lamport, "b" > "a"
        assert_eq!(a.get("title"), Some(json!("from b")));
    }

    #[test]
    fn later_write_wins_after_sync() {
        let a = MemoryDoc::with_client_id("doc-1", "z");
        let b = MemoryDoc::with_client_id("doc-1", "a");

        a.set("title", "first");
        sync_into(&a, &b);
        b.set("title", "second");
        sync_into(&b, &a);

        assert_eq!(a.get("title"), Some(json!("second")));
        assert_eq!(b.get("title"), Some(json!("second")));
    }

    #[test]
    fn applying_twice_is_a_noop() {
        let a = MemoryDoc::with_client_id("doc-1", "a");
        a.set("k", "v");
        let update = a.encode_diff(None).unwrap().update;

        let b = MemoryDoc::with_client_id("doc-1", "b");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        b.observe_updates(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        b.apply_update(&update, UpdateOrigin::Remote).unwrap();
        b.apply_update(&update, UpdateOrigin::Remote).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn merge_updates_deduplicates() {
        let a = MemoryDoc::with_client_id("doc-1", "a");
        a.set("x", 1);
        let first = a.encode_diff(None).unwrap().update;
        a.set("y", 2);
        let second = a.encode_diff(None).unwrap().update;

        let merged = a.merge_updates(&[&first, &second]).unwrap();
        let ops: Vec<MapOp> = serde_json::from_slice(&merged).unwrap();
        assert_eq!(ops.len(), 2);

        let copy = MemoryDoc::new("doc-1");
        copy.apply_update(&merged, UpdateOrigin::Storage).unwrap();
        assert_eq!(copy.entries(), a.entries());
    }

    #[test]
    fn observers_receive_origin() {
        let doc = MemoryDoc::with_client_id("doc-1", "a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        doc.observe_updates(Arc::new(move |guid, origin| {
            sink.lock().unwrap().push((guid.to_string(), origin));
        }));

        doc.set("k", "v");
        let other = MemoryDoc::with_client_id("doc-1", "b");
        other.set("j", "w");
        let update = other.encode_diff(None).unwrap().update;
        doc.apply_update(&update, UpdateOrigin::Remote).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("doc-1".to_string(), UpdateOrigin::Local),
                ("doc-1".to_string(), UpdateOrigin::Remote),
            ]
        );
    }

    #[test]
    fn sub_doc_observers_fire() {
        let root = MemoryDoc::new("root");
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = added.clone();
        root.observe_sub_docs(Arc::new(move |docs| {
            let mut sink = sink.lock().unwrap();
            sink.extend(docs.iter().map(|d| d.guid().to_string()));
        }));

        root.create_sub_doc("page-1");
        root.create_sub_doc("page-2");

        assert_eq!(*added.lock().unwrap(), vec!["page-1", "page-2"]);
        assert_eq!(root.sub_docs().len(), 2);
    }

    #[test]
    fn rejects_garbage_update() {
        let doc = MemoryDoc::new("doc-1");
        let err = doc.apply_update(b"not json", UpdateOrigin::Remote).unwrap_err();
        assert!(matches!(err, crate::Error::Doc(_)));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_converges_regardless_of_delivery_order(
                writes in proptest::collection::vec((0usize..3, 0u8..4, 0i64..100), 1..24),
                order in proptest::collection::vec(0usize..3, 3),
            ) {
                let replicas: Vec<MemoryDoc> = ["a", "b", "c"]
                    .iter()
                    .map(|client| MemoryDoc::with_client_id("doc", *client))
                    .collect();

                for (replica, key, value) in &writes {
                    replicas[*replica].set(format!("k{key}"), *value);
                }

                let updates: Vec<Vec<u8>> = replicas
                    .iter()
                    .map(|r| r.encode_diff(None).unwrap().update)
                    .collect();

                let target = MemoryDoc::with_client_id("doc", "target");
                for index in &order {
                    target.apply_update(&updates[*index], UpdateOrigin::Remote).unwrap();
                }
                for update in &updates {
                    target.apply_update(update, UpdateOrigin::Remote).unwrap();
                }

                let reference = MemoryDoc::with_client_id("doc", "reference");
                for update in updates.iter().rev() {
                    reference.apply_update(update, UpdateOrigin::Remote).unwrap();
                }

                prop_assert_eq!(target.entries(), reference.entries());
                prop_assert_eq!(target.pending_len(), 0);
            }
        }
    }
}
