//! End-to-end scenarios for the doc engine
//!
//! Every test wires real local and remote parts to the in-memory storage and
//! server and drives them through connection loss, restarts and failures.

mod common;

use common::*;
use docsync_engine::server::ServerCall;
use docsync_engine::{DocStorage, EngineConfig, MemoryDoc, MemoryDocServer, MemoryDocStorage, SyncDoc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

fn setup() -> (Arc<MemoryDocStorage>, Arc<MemoryDocServer>) {
    (Arc::new(MemoryDocStorage::new()), Arc::new(MemoryDocServer::new()))
}

/// A second client with its own storage and connection to the same server.
fn second_client(server: &MemoryDocServer) -> (Arc<MemoryDocStorage>, Arc<MemoryDocServer>) {
    (Arc::new(MemoryDocStorage::new()), Arc::new(server.peer()))
}

// ============================================================================
// Basic Sync
// ============================================================================

#[tokio::test]
async fn cold_start_pushes_and_second_client_pulls() {
    let (storage, server) = setup();
    let engine = engine(&storage, &server);
    let doc = doc_with("page", &[("title", "Hello")]);
    engine.add_doc(doc.clone(), false);
    engine.start().await;
    synced(&engine).await;

    assert!(!server.stored_updates("page").is_empty());
    assert!(storage.raw_doc("page").is_some());

    let (storage_b, server_b) = second_client(&server);
    let engine_b = common::engine(&storage_b, &server_b);
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_b.add_doc(doc_b.clone(), false);
    engine_b.start().await;
    synced(&engine_b).await;

    assert_eq!(value(&doc_b, "title").as_deref(), Some("Hello"));
}

#[tokio::test]
async fn live_edits_reach_subscribed_client() {
    let (storage, server) = setup();
    let (storage_b, server_b) = second_client(&server);
    let engine_a = engine(&storage, &server);
    let engine_b = engine(&storage_b, &server_b);
    let doc_a = Arc::new(MemoryDoc::new("page"));
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_a.add_doc(doc_a.clone(), false);
    engine_b.add_doc(doc_b.clone(), false);
    engine_a.start().await;
    engine_b.start().await;
    synced(&engine_a).await;
    synced(&engine_b).await;

    doc_a.set("body", "typed on a");
    eventually(|| value(&doc_b, "body").is_some()).await;
    assert_eq!(value(&doc_b, "body").as_deref(), Some("typed on a"));

    // and back
    doc_b.set("footer", "typed on b");
    eventually(|| value(&doc_a, "footer").is_some()).await;
    synced(&engine_a).await;
    synced(&engine_b).await;
    assert_eq!(doc_a.entries(), doc_b.entries());
}

#[tokio::test]
async fn polling_picks_up_changes_without_subscription() {
    let (storage, server) = setup();
    let (storage_b, server_b) = second_client(&server);
    server_b.set_supports_subscription(false);

    let engine_a = engine(&storage, &server);
    let engine_b = engine_with(
        &storage_b,
        &server_b,
        EngineConfig {
            pull_interval: Some(Duration::from_millis(20)),
            ..fast_config()
        },
    );
    let doc_a = Arc::new(MemoryDoc::new("page"));
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_a.add_doc(doc_a.clone(), false);
    engine_b.add_doc(doc_b.clone(), false);
    engine_a.start().await;
    engine_b.start().await;
    synced(&engine_b).await;

    doc_a.set("title", "polled");
    eventually(|| value(&doc_b, "title").is_some()).await;
    assert!(server_b.calls().iter().filter(|c| **c == ServerCall::LoadServerClocks).count() > 1);
}

#[tokio::test]
async fn edits_from_another_engine_on_shared_storage_are_applied() {
    let storage = Arc::new(MemoryDocStorage::new());
    let server = Arc::new(MemoryDocServer::new());
    let engine_a = engine(&storage, &server);
    let engine_b = local_engine(&storage);
    let doc_a = Arc::new(MemoryDoc::new("page"));
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_a.add_doc(doc_a.clone(), false);
    engine_b.add_doc(doc_b.clone(), false);
    engine_a.start().await;
    engine_b.start().await;
    ready(&engine_a, "page").await;
    ready(&engine_b, "page").await;

    doc_b.set("title", "from b");
    saved(&engine_b).await;
    eventually(|| value(&doc_a, "title").is_some()).await;
    assert_eq!(value(&doc_a, "title").as_deref(), Some("from b"));
}

// ============================================================================
// Durability and Restart
// ============================================================================

#[tokio::test]
async fn saved_edits_survive_restart() {
    let storage = Arc::new(MemoryDocStorage::new());
    let engine = local_engine(&storage);
    let doc = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(doc.clone(), false);
    engine.start().await;
    ready(&engine, "page").await;

    doc.set("title", "durable");
    doc.set("body", "text");
    saved(&engine).await;
    engine.stop().await;
    drop(engine);

    let engine = local_engine(&storage);
    let reloaded = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(reloaded.clone(), false);
    engine.start().await;
    ready(&engine, "page").await;

    assert_eq!(reloaded.entries(), doc.entries());
}

#[tokio::test]
async fn stored_doc_is_loaded_before_ready() {
    let storage = Arc::new(MemoryDocStorage::new());
    let source = doc_with("doc-1", &[("title", "on disk"), ("body", "text")]);
    storage
        .doc()
        .set("doc-1", source.encode_diff(None).unwrap().update)
        .await
        .unwrap();
    storage.set_latency(Some(Duration::from_millis(50)));

    let engine = local_engine(&storage);
    let doc = Arc::new(MemoryDoc::new("doc-1"));
    engine.add_doc(doc.clone(), false);
    assert!(!engine.doc_state("doc-1").unwrap().ready);

    engine.start().await;
    assert!(!engine.doc_state("doc-1").unwrap().ready);
    assert!(doc.entries().is_empty());

    ready(&engine, "doc-1").await;
    assert_eq!(doc.entries(), source.entries());
}

#[tokio::test]
async fn edits_before_load_are_saved_and_pushed() {
    let (storage, server) = setup();
    let engine = common::engine(&storage, &server);
    let doc = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(doc.clone(), false);
    doc.set("title", "typed early");
    assert!(!engine.doc_state("page").unwrap().ready);

    engine.start().await;
    synced(&engine).await;
    assert!(!server.stored_updates("page").is_empty());

    let (storage_b, server_b) = second_client(&server);
    let engine_b = common::engine(&storage_b, &server_b);
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_b.add_doc(doc_b.clone(), false);
    engine_b.start().await;
    synced(&engine_b).await;
    assert_eq!(value(&doc_b, "title").as_deref(), Some("typed early"));
}

#[tokio::test]
async fn edits_while_loading_are_saved() {
    let storage = Arc::new(MemoryDocStorage::new());
    storage.set_latency(Some(Duration::from_millis(30)));
    let engine = local_engine(&storage);
    let doc = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(doc.clone(), false);
    engine.start().await;

    doc.set("title", "mid load");
    saved(&engine).await;
    assert!(engine.doc_state("page").unwrap().ready);
    engine.stop().await;
    storage.set_latency(None);

    let engine = local_engine(&storage);
    let reloaded = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(reloaded.clone(), false);
    engine.start().await;
    ready(&engine, "page").await;
    assert_eq!(value(&reloaded, "title").as_deref(), Some("mid load"));
}

#[tokio::test]
async fn offline_edits_are_pushed_after_restart() {
    let (storage, server) = setup();
    server.set_offline(true);

    let engine = common::engine(&storage, &server);
    let doc = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(doc.clone(), false);
    engine.start().await;
    ready(&engine, "page").await;
    doc.set("title", "written offline");
    saved(&engine).await;

    eventually(|| engine.engine_state().error_message.is_some()).await;
    assert_eq!(engine.engine_state().syncing_count, 1);
    engine.stop().await;
    drop(engine);
    assert!(server.stored_updates("page").is_empty());

    server.set_offline(false);
    let engine = common::engine(&storage, &server);
    let reopened = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(reopened.clone(), false);
    engine.start().await;
    synced(&engine).await;
    assert_eq!(engine.engine_state().error_message, None);

    let (storage_c, server_c) = second_client(&server);
    let engine_c = common::engine(&storage_c, &server_c);
    let doc_c = Arc::new(MemoryDoc::new("page"));
    engine_c.add_doc(doc_c.clone(), false);
    engine_c.start().await;
    synced(&engine_c).await;
    assert_eq!(value(&doc_c, "title").as_deref(), Some("written offline"));
}

#[tokio::test]
async fn reconnecting_session_resumes_sync() {
    let (storage, server) = setup();
    server.set_offline(true);
    let engine = common::engine(&storage, &server);
    let doc = doc_with("page", &[("title", "queued")]);
    engine.add_doc(doc.clone(), false);
    engine.start().await;

    let mut watcher = engine.watch_state();
    within(watcher.wait_for(|s| s.retrying_count == 1 && s.error_message.is_some()))
        .await
        .unwrap();

    server.set_offline(false);
    synced(&engine).await;
    let state = engine.engine_state();
    assert_eq!(state.retrying_count, 0);
    assert_eq!(state.error_message, None);
    assert_eq!(server.stored_updates("page").len(), 1);
}

#[tokio::test]
async fn dropped_subscription_starts_new_session() {
    let (storage, server) = setup();
    let (storage_b, server_b) = second_client(&server);
    let engine_a = engine(&storage, &server);
    let engine_b = engine(&storage_b, &server_b);
    let doc_a = Arc::new(MemoryDoc::new("page"));
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_a.add_doc(doc_a.clone(), false);
    engine_b.add_doc(doc_b.clone(), false);
    engine_a.start().await;
    engine_b.start().await;
    synced(&engine_b).await;

    let subscribes = || server_b.calls().iter().filter(|c| **c == ServerCall::Subscribe).count();
    assert_eq!(subscribes(), 1);
    server_b.drop_subscriptions();
    eventually(|| subscribes() == 2).await;

    doc_a.set("title", "after reconnect");
    eventually(|| value(&doc_b, "title").is_some()).await;
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn transient_push_failures_are_retried() {
    let (storage, server) = setup();
    server.fail_next_pushes(2);
    let engine = common::engine(&storage, &server);
    let doc = doc_with("page", &[("title", "flaky")]);
    engine.add_doc(doc.clone(), false);

    let mut watcher = engine.watch_state();
    let saw_retry = tokio::spawn(async move { watcher.wait_for(|s| s.retrying_count > 0).await.is_ok() });

    engine.start().await;
    synced(&engine).await;

    assert!(within(saw_retry).await.unwrap());
    assert_eq!(server.push_count("page"), 3);
    assert_eq!(server.stored_updates("page").len(), 1);
    let state = engine.doc_state("page").unwrap();
    assert!(!state.retrying);
    assert_eq!(state.error_message, None);
}

#[tokio::test]
async fn lost_push_response_does_not_duplicate_update() {
    let (storage, server) = setup();
    server.lose_next_push_responses(1);
    let engine = common::engine(&storage, &server);
    let doc = doc_with("page", &[("title", "once")]);
    engine.add_doc(doc.clone(), false);
    engine.start().await;
    synced(&engine).await;

    assert_eq!(server.push_count("page"), 2);
    assert_eq!(server.stored_updates("page").len(), 1);
}

#[tokio::test]
async fn rejected_doc_parks_until_it_changes() {
    let (storage, server) = setup();
    server.set_rejecting("page", true);
    let engine = common::engine(&storage, &server);
    let doc = doc_with("page", &[("title", "refused")]);
    engine.add_doc(doc.clone(), false);
    engine.start().await;

    let mut watcher = engine.watch_state();
    let state = within(watcher.wait_for_doc("page", |d| d.error_message.is_some() && !d.retrying))
        .await
        .unwrap();
    assert!(state.syncing);

    // parked: no further attempts
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.push_count("page"), 3);
    assert!(engine.engine_state().error_message.is_some());

    server.set_rejecting("page", false);
    doc.set("title", "accepted");
    synced(&engine).await;
    assert_eq!(engine.doc_state("page").unwrap().error_message, None);
    assert!(!server.stored_updates("page").is_empty());
}

#[tokio::test]
async fn stop_mid_sync_leaves_no_background_work() {
    let (storage, server) = setup();
    server.set_latency(Some(Duration::from_millis(100)));
    let engine = common::engine(&storage, &server);
    for id in ["a", "b", "c"] {
        engine.add_doc(doc_with(id, &[("title", id)]), false);
    }
    engine.start().await;

    eventually(|| !server.first_touch_order().is_empty()).await;
    within(engine.stop()).await;
    assert!(!engine.is_running());

    let calls = server.call_count();
    let operations = storage.operation_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.call_count(), calls);
    assert_eq!(storage.operation_count(), operations);

    let state = engine.engine_state();
    assert_eq!(state.syncing_count, 3);
    assert_eq!(state.retrying_count, 0);
}

#[tokio::test]
async fn stop_waits_for_writes_after_push() {
    let (storage, server) = setup();
    storage.set_latency(Some(Duration::from_millis(40)));
    let engine = common::engine(&storage, &server);
    engine.add_doc(doc_with("page", &[("title", "slow disk")]), false);
    engine.start().await;

    eventually(|| server.push_count("page") >= 1).await;
    within(engine.stop()).await;

    let operations = storage.operation_count();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(storage.operation_count(), operations);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn higher_priority_docs_sync_first() {
    let (storage, server) = setup();
    let engine = engine_with(
        &storage,
        &server,
        EngineConfig {
            concurrency: 1,
            ..fast_config()
        },
    );
    engine.add_doc_with_priority(doc_with("low", &[("k", "v")]), 0, false);
    engine.add_doc_with_priority(doc_with("mid", &[("k", "v")]), 5, false);
    engine.add_doc_with_priority(doc_with("high", &[("k", "v")]), 10, false);
    engine.start().await;
    synced(&engine).await;

    assert_eq!(server.first_touch_order(), vec!["high", "mid", "low"]);
}

#[tokio::test]
async fn set_priority_before_start_reorders() {
    let (storage, server) = setup();
    let engine = engine_with(
        &storage,
        &server,
        EngineConfig {
            concurrency: 1,
            ..fast_config()
        },
    );
    for id in ["a", "b", "c"] {
        engine.add_doc(doc_with(id, &[("k", "v")]), false);
    }
    engine.set_priority("c", 10);
    engine.start().await;
    synced(&engine).await;

    assert_eq!(server.first_touch_order().first().map(String::as_str), Some("c"));
}

#[tokio::test]
async fn one_request_per_doc_under_churn() {
    let (storage, server) = setup();
    server.set_latency(Some(Duration::from_millis(2)));
    let engine = common::engine(&storage, &server);
    let doc = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(doc.clone(), false);
    engine.start().await;
    ready(&engine, "page").await;

    let other = MemoryDoc::new("page");
    for i in 0..20 {
        doc.set(format!("local-{i}"), i);
        other.set(format!("remote-{i}"), i);
        let update = other.encode_diff(None).unwrap();
        server.inject_update("page", &update.update).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    synced(&engine).await;
    eventually(|| doc.get("remote-19").is_some()).await;

    assert_eq!(server.single_flight_violations(), 0);
    assert!(doc.get("local-19").is_some());
    assert!(server.max_concurrent_requests() <= engine.config().concurrency);
}

#[tokio::test]
async fn concurrency_limits_parallel_requests() {
    let (storage, server) = setup();
    server.set_latency(Some(Duration::from_millis(10)));
    let engine = engine_with(
        &storage,
        &server,
        EngineConfig {
            concurrency: 2,
            ..fast_config()
        },
    );
    for i in 0..8 {
        engine.add_doc(doc_with(&format!("doc-{i}"), &[("k", "v")]), false);
    }
    engine.start().await;
    synced(&engine).await;

    assert!(server.max_concurrent_requests() <= 2);
    assert_eq!(server.first_touch_order().len(), 8);
}

// ============================================================================
// State Reporting
// ============================================================================

#[tokio::test]
async fn aggregate_always_matches_doc_states() {
    let (storage, server) = setup();
    server.fail_next_pushes(3);
    server.set_latency(Some(Duration::from_millis(2)));
    let engine = common::engine(&storage, &server);

    let mut watcher = engine.watch_state();
    let checker = tokio::spawn(async move {
        loop {
            let (state, docs) = watcher.snapshot();
            assert_eq!(state.total_doc_count, docs.len());
            assert_eq!(state.saving_count, docs.values().filter(|d| d.saving).count());
            assert_eq!(state.syncing_count, docs.values().filter(|d| d.syncing).count());
            assert_eq!(state.retrying_count, docs.values().filter(|d| d.retrying).count());
            if watcher.changed().await.is_err() {
                return;
            }
        }
    });

    let docs: Vec<Arc<MemoryDoc>> = (0..5).map(|i| Arc::new(MemoryDoc::new(format!("doc-{i}")))).collect();
    for doc in &docs {
        engine.add_doc(doc.clone(), false);
    }
    engine.start().await;
    for round in 0..5 {
        for doc in &docs {
            doc.set("round", round);
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    synced(&engine).await;

    checker.abort();
    if let Err(err) = checker.await {
        assert!(!err.is_panic(), "aggregate drifted from doc states");
    }
}

#[tokio::test]
async fn wait_for_saved_resolves_immediately_when_idle() {
    let storage = Arc::new(MemoryDocStorage::new());
    let engine = local_engine(&storage);
    within(engine.wait_for_saved()).await.unwrap();
    within(engine.wait_for_synced()).await.unwrap();
}

#[tokio::test]
async fn local_only_engine_tracks_saving() {
    let storage = Arc::new(MemoryDocStorage::new());
    let engine = local_engine(&storage);
    let doc = Arc::new(MemoryDoc::new("page"));
    engine.add_doc(doc.clone(), false);
    engine.add_doc(doc.clone(), false);
    assert_eq!(engine.engine_state().total_doc_count, 1);
    assert!(engine.remote().is_none());

    engine.start().await;
    ready(&engine, "page").await;
    doc.set("title", "local");
    let state = engine.doc_state("page").unwrap();
    assert_eq!(state.syncing, state.saving);

    synced(&engine).await;
    let state = engine.doc_state("page").unwrap();
    assert!(!state.saving);
    assert!(!state.syncing);
    assert_eq!(state.server_clock, None);
}

#[tokio::test]
async fn state_streams_emit_distinct_states() {
    let storage = Arc::new(MemoryDocStorage::new());
    let engine = local_engine(&storage);
    let mut engine_states = engine.engine_state_stream();
    let mut page_states = engine.doc_state_stream("page");

    let first = within(engine_states.next()).await.unwrap();
    assert_eq!(first.total_doc_count, 0);
    assert_eq!(within(page_states.next()).await.unwrap(), None);

    engine.add_doc(Arc::new(MemoryDoc::new("page")), false);
    let next = within(engine_states.next()).await.unwrap();
    assert_eq!(next.total_doc_count, 1);
    let page = within(page_states.next()).await.unwrap();
    assert!(page.is_some_and(|state| !state.ready));
}

#[tokio::test]
async fn server_clock_is_reported_per_doc() {
    let (storage, server) = setup();
    let engine = common::engine(&storage, &server);
    engine.add_doc(doc_with("page", &[("title", "clocked")]), false);
    engine.start().await;
    synced(&engine).await;

    let state = engine.doc_state("page").unwrap();
    assert_eq!(state.server_clock, server.latest_clock("page"));
    assert!(state.server_clock.is_some());
}

// ============================================================================
// Engine Lifecycle
// ============================================================================

#[tokio::test]
async fn restart_replaces_running_loops() {
    let (storage, server) = setup();
    let engine = common::engine(&storage, &server);
    engine.add_doc(doc_with("page", &[("title", "x")]), false);

    engine.start().await;
    engine.start().await;
    assert!(engine.is_running());
    synced(&engine).await;

    engine.stop().await;
    assert!(!engine.is_running());
    // stopping twice is fine
    engine.stop().await;
}

#[tokio::test]
async fn reset_sync_status_resyncs_from_scratch() {
    let (storage, server) = setup();
    let engine = common::engine(&storage, &server);
    engine.add_doc(doc_with("page", &[("title", "reset me")]), false);
    engine.start().await;
    synced(&engine).await;

    assert!(!storage.raw_sync_metadata_keys().is_empty());
    assert!(storage.raw_server_clock_count() > 0);
    let pulls = server.pull_count("page");

    within(engine.reset_sync_status()).await.unwrap();
    assert!(!engine.is_running());
    assert!(storage.raw_sync_metadata_keys().is_empty());
    assert_eq!(storage.raw_server_clock_count(), 0);
    assert!(storage.raw_doc("page").is_some());
    assert_eq!(engine.engine_state().syncing_count, 1);
    assert_eq!(engine.doc_state("page").unwrap().server_clock, None);

    engine.start().await;
    synced(&engine).await;
    assert!(server.pull_count("page") > pulls);
    assert_eq!(server.stored_updates("page").len(), 1);
}

#[tokio::test]
async fn reset_during_push_leaves_no_metadata_behind() {
    let (storage, server) = setup();
    storage.set_latency(Some(Duration::from_millis(30)));
    let engine = common::engine(&storage, &server);
    let doc = doc_with("page", &[("title", "reset mid push")]);
    engine.add_doc(doc.clone(), false);
    engine.start().await;

    eventually(|| server.push_count("page") >= 1).await;
    within(engine.reset_sync_status()).await.unwrap();
    assert!(storage.raw_sync_metadata_keys().is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(storage.raw_sync_metadata_keys().is_empty());
    assert_eq!(storage.raw_server_clock_count(), 0);

    storage.set_latency(None);
    engine.start().await;
    doc.set("title", "after reset");
    synced(&engine).await;
    assert_eq!(engine.doc_state("page").unwrap().server_clock, server.latest_clock("page"));

    let (storage_b, server_b) = second_client(&server);
    let engine_b = common::engine(&storage_b, &server_b);
    let doc_b = Arc::new(MemoryDoc::new("page"));
    engine_b.add_doc(doc_b.clone(), false);
    engine_b.start().await;
    synced(&engine_b).await;
    assert_eq!(value(&doc_b, "title").as_deref(), Some("after reset"));
}

#[tokio::test]
async fn sub_docs_are_registered_below_parent() {
    let (storage, server) = setup();
    let engine = common::engine(&storage, &server);
    let root = Arc::new(MemoryDoc::new("root"));
    let early = root.create_sub_doc("early");
    early.set("k", "before add");

    engine.add_doc_with_priority(root.clone(), 3, true);
    assert!(engine.doc_state("early").is_some());

    engine.start().await;
    let late = root.create_sub_doc("late");
    assert!(engine.doc_state("late").is_some());
    ready(&engine, "late").await;
    late.set("k", "after add");
    synced(&engine).await;

    assert!(!server.stored_updates("early").is_empty());
    assert!(!server.stored_updates("late").is_empty());

    let remote = engine.remote().unwrap().snapshot();
    assert_eq!(remote.docs["early"].priority, 2);
    assert_eq!(remote.docs["late"].priority, 2);
}

#[tokio::test]
async fn sub_docs_are_ignored_unless_requested() {
    let storage = Arc::new(MemoryDocStorage::new());
    let engine = local_engine(&storage);
    let root = Arc::new(MemoryDoc::new("root"));
    root.create_sub_doc("child");
    engine.add_doc(root.clone(), false);
    root.create_sub_doc("later");

    assert_eq!(engine.engine_state().total_doc_count, 1);
    assert!(engine.doc_state("child").is_none());
}
