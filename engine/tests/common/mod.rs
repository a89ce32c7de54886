//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use docsync_engine::{
    BackoffConfig, DocEngine, DocServer, DocStorage, EngineConfig, MemoryDoc, MemoryDocServer,
    MemoryDocStorage,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Config with millisecond backoff so retries happen within a test.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        },
        request_timeout: Duration::from_secs(2),
        storage_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

pub fn engine(storage: &Arc<MemoryDocStorage>, server: &Arc<MemoryDocServer>) -> DocEngine {
    engine_with(storage, server, fast_config())
}

pub fn engine_with(
    storage: &Arc<MemoryDocStorage>,
    server: &Arc<MemoryDocServer>,
    config: EngineConfig,
) -> DocEngine {
    let storage: Arc<dyn DocStorage> = storage.clone();
    let server: Arc<dyn DocServer> = server.clone();
    DocEngine::new(storage, Some(server), config).expect("valid config")
}

pub fn local_engine(storage: &Arc<MemoryDocStorage>) -> DocEngine {
    let storage: Arc<dyn DocStorage> = storage.clone();
    DocEngine::local_only(storage, fast_config()).expect("valid config")
}

pub fn doc_with(guid: &str, entries: &[(&str, &str)]) -> Arc<MemoryDoc> {
    let doc = Arc::new(MemoryDoc::new(guid));
    for (key, value) in entries {
        doc.set(*key, *value);
    }
    doc
}

/// Await `fut`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("timed out waiting")
}

/// Poll `cond` until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub async fn synced(engine: &DocEngine) {
    within(engine.wait_for_synced())
        .await
        .expect("engine stopped while waiting for sync");
}

pub async fn saved(engine: &DocEngine) {
    within(engine.wait_for_saved())
        .await
        .expect("engine stopped while waiting for save");
}

pub async fn ready(engine: &DocEngine, doc_id: &str) {
    within(engine.wait_for_ready(doc_id))
        .await
        .expect("engine stopped while waiting for load");
}

pub fn value(doc: &MemoryDoc, key: &str) -> Option<String> {
    doc.get(key).and_then(|v| v.as_str().map(str::to_string))
}
