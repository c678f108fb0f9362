//! End-to-end behaviour of an instance following its rules collection

use std::sync::Arc;

use pretty_assertions::assert_eq;
use ruleflow_core::RuleId;
use ruleflow_store::{MemoryStore, ResourceStore};
use ruleflow_test_utils::{
    eventually, job_rule, marker_path, path, publish_rule, reindex_rule, seed_item, settle,
    start_instance, start_memory_instance, test_config, FaultyStore,
};
use serde_json::{json, Value};

fn foo_rule() -> Value {
    reindex_rule(
        "/docs",
        json!({"type": "object", "required": ["foo"]}),
        "/out/{{foo}}",
    )
}

async fn exists(store: &MemoryStore, at: &str) -> bool {
    store.head(&path(at)).await.unwrap()
}

async fn queue_len(store: &MemoryStore, service: &str) -> usize {
    store
        .get(&path(&format!("/bookmarks/services/{service}/jobs")))
        .await
        .ok()
        .and_then(|q| q.as_object().map(|m| m.keys().filter(|k| !k.starts_with('_')).count()))
        .unwrap_or(0)
}

#[tokio::test]
async fn reindex_links_matching_item() {
    let store = MemoryStore::new();
    let config = test_config();
    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    publish_rule(&store, &config, "r1", foo_rule()).await;

    let running = start_memory_instance(config.clone(), &store);
    let marker = marker_path(&config, "/x1", "r1");
    assert!(eventually(|| async { store.head(&marker).await.unwrap() }).await);

    let out = store.get(&path("/out/bar")).await.unwrap();
    assert_eq!(out["x1"], json!({"_id": "x1"}));
    assert_eq!(store.get(&marker).await.unwrap(), json!({"_rev": 1}));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn job_is_created_and_queued() {
    let store = MemoryStore::new();
    let config = test_config();
    publish_rule(
        &store,
        &config,
        "r2",
        job_rule("/docs", json!({}), "svc1", "/target"),
    )
    .await;
    let running = start_memory_instance(config.clone(), &store);
    seed_item(&store, "/docs", "x2", json!({"kind": "scan"})).await;

    assert!(eventually(|| async { queue_len(&store, "svc1").await == 1 }).await);
    let queue = store.get(&path("/bookmarks/services/svc1/jobs")).await.unwrap();
    let (entry_key, entry) = queue
        .as_object()
        .unwrap()
        .iter()
        .find(|(k, _)| !k.starts_with('_'))
        .unwrap();
    let job_id = entry["_id"].as_str().unwrap();
    assert_eq!(job_id.rsplit('/').next().unwrap(), entry_key);

    let job = store.get(&path(&format!("/{job_id}"))).await.unwrap();
    assert_eq!(job["service"], "svc1");
    assert_eq!(job["config"]["target"]["_id"], "x2");
    assert!(eventually(|| async { store.head(&marker_path(&config, "/x2", "r2")).await.unwrap() }).await);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn schema_mismatch_is_skipped_until_item_matches() {
    let store = MemoryStore::new();
    let config = test_config();
    seed_item(&store, "/docs", "x3", json!({"other": 1})).await;
    publish_rule(&store, &config, "r1", foo_rule()).await;
    let running = start_memory_instance(config.clone(), &store);

    let id = RuleId::new("r1");
    assert!(
        eventually(|| async {
            running
                .instance
                .registry()
                .stats(&id)
                .is_some_and(|s| s.skipped() >= 1)
        })
        .await
    );
    assert!(!exists(&store, "/out").await);
    assert!(!store.head(&marker_path(&config, "/x3", "r1")).await.unwrap());

    // A change that still does not match is skipped as well
    store.put(&path("/x3"), json!({"other": 2}), None).await.unwrap();
    assert!(
        eventually(|| async {
            running
                .instance
                .registry()
                .stats(&id)
                .is_some_and(|s| s.skipped() >= 2)
        })
        .await
    );
    assert!(!exists(&store, "/out").await);

    store.put(&path("/x3"), json!({"foo": "baz"}), None).await.unwrap();
    assert!(eventually(|| async { exists(&store, "/out/baz/x3").await }).await);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn redelivered_items_are_not_applied_twice() {
    let store = MemoryStore::new();
    let config = test_config();
    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    publish_rule(&store, &config, "r1", foo_rule()).await;

    let running = start_memory_instance(config.clone(), &store);
    let id = RuleId::new("r1");
    let stats = loop {
        if let Some(stats) = running.instance.registry().stats(&id) {
            break stats;
        }
        tokio::task::yield_now().await;
    };
    assert!(eventually(|| async { stats.applied() == 1 }).await);

    // Content change without marker removal
    store.put(&path("/x1"), json!({"touched": true}), None).await.unwrap();
    assert!(eventually(|| async { stats.marker_hits() >= 2 }).await);
    settle().await;
    assert_eq!(stats.applied(), 1);
    running.stop().await.unwrap();

    // A fresh instance replays the list and finds the marker
    let restarted = start_memory_instance(config.clone(), &store);
    assert!(
        eventually(|| async {
            restarted
                .instance
                .registry()
                .stats(&id)
                .is_some_and(|s| s.marker_hits() >= 1)
        })
        .await
    );
    settle().await;
    let stats = restarted.instance.registry().stats(&id).unwrap();
    assert_eq!(stats.applied(), 0);
    restarted.stop().await.unwrap();
}

#[tokio::test]
async fn added_items_skip_marker_check_when_disabled() {
    let store = MemoryStore::new();
    let config = test_config();
    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    publish_rule(&store, &config, "r1", foo_rule()).await;

    let first = start_memory_instance(config.clone(), &store);
    let marker = marker_path(&config, "/x1", "r1");
    assert!(eventually(|| async { store.head(&marker).await.unwrap() }).await);
    first.stop().await.unwrap();

    let unchecked = start_memory_instance(config.clone().with_check_marker_on_add(false), &store);
    let id = RuleId::new("r1");
    assert!(
        eventually(|| async {
            unchecked
                .instance
                .registry()
                .stats(&id)
                .is_some_and(|s| s.applied() == 1)
        })
        .await
    );
    unchecked.stop().await.unwrap();
}

#[tokio::test]
async fn removed_rule_stops_processing() {
    let store = MemoryStore::new();
    let config = test_config();
    publish_rule(&store, &config, "r1", foo_rule()).await;
    let running = start_memory_instance(config.clone(), &store);

    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    assert!(eventually(|| async { exists(&store, "/out/bar/x1").await }).await);

    store.delete(&config.rules_path.child("r1")).unwrap();
    let id = RuleId::new("r1");
    assert!(eventually(|| async { !running.instance.registry().contains(&id) }).await);

    seed_item(&store, "/docs", "x5", json!({"foo": "bar"})).await;
    settle().await;
    assert!(!exists(&store, "/out/bar/x5").await);
    assert!(!store.head(&marker_path(&config, "/x5", "r1")).await.unwrap());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn edited_rule_replaces_previous_definition() {
    let store = MemoryStore::new();
    let config = test_config();
    publish_rule(&store, &config, "r1", foo_rule()).await;
    let running = start_memory_instance(config.clone(), &store);

    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    assert!(eventually(|| async { exists(&store, "/out/bar/x1").await }).await);

    store
        .put(
            &config.rules_path.child("r1"),
            json!({"destination": "/moved/{{foo}}"}),
            None,
        )
        .await
        .unwrap();
    // Wait for the replacement watcher to take over the list
    settle().await;
    seed_item(&store, "/docs", "x7", json!({"foo": "qux"})).await;
    assert!(eventually(|| async { exists(&store, "/moved/qux/x7").await }).await);

    // Already-marked items are not re-run under the new definition
    settle().await;
    assert!(!exists(&store, "/moved/bar").await);
    assert_eq!(running.instance.registry().len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_edit_keeps_rule_running() {
    let store = MemoryStore::new();
    let config = test_config();
    publish_rule(&store, &config, "r1", foo_rule()).await;
    let running = start_memory_instance(config.clone(), &store);

    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    assert!(eventually(|| async { exists(&store, "/out/bar/x1").await }).await);

    store
        .put(
            &config.rules_path.child("r1"),
            json!({"type": "teleport"}),
            None,
        )
        .await
        .unwrap();
    settle().await;
    assert!(running.instance.registry().contains(&RuleId::new("r1")));

    seed_item(&store, "/docs", "x2", json!({"foo": "baz"})).await;
    assert!(eventually(|| async { exists(&store, "/out/baz/x2").await }).await);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_rule_is_rejected_and_others_keep_running() {
    let store = MemoryStore::new();
    let config = test_config();
    publish_rule(
        &store,
        &config,
        "bad",
        json!({"list": "/docs", "schema": {}, "type": "teleport"}),
    )
    .await;
    publish_rule(&store, &config, "r1", foo_rule()).await;
    let running = start_memory_instance(config.clone(), &store);

    seed_item(&store, "/docs", "x1", json!({"foo": "bar"})).await;
    assert!(eventually(|| async { exists(&store, "/out/bar/x1").await }).await);
    assert_eq!(running.instance.registry().rule_ids(), vec![RuleId::new("r1")]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn nested_items_are_followed() {
    let store = MemoryStore::new();
    let config = test_config();
    let mut rule = reindex_rule("/days", json!({}), "/by-kind/{{kind}}");
    rule["itemsPath"] = json!("/*/*");
    publish_rule(&store, &config, "daily", rule).await;
    let running = start_memory_instance(config.clone(), &store);

    seed_item(&store, "/days/2024-01-01", "x1", json!({"kind": "scan"})).await;
    assert!(eventually(|| async { exists(&store, "/by-kind/scan/x1").await }).await);
    assert!(store.head(&marker_path(&config, "/x1", "daily")).await.unwrap());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn failed_marker_write_reruns_job() {
    let store = MemoryStore::new();
    let config = test_config();
    let faulty = Arc::new(FaultyStore::new(Arc::new(store.clone())));
    publish_rule(
        &store,
        &config,
        "r2",
        job_rule("/docs", json!({}), "svc1", "/target"),
    )
    .await;

    faulty.fail_meta_writes(true);
    let running = start_instance(config.clone(), faulty.clone(), &store);
    seed_item(&store, "/docs", "x2", json!({})).await;
    assert!(eventually(|| async { queue_len(&store, "svc1").await == 1 }).await);
    settle().await;
    assert!(!store.head(&marker_path(&config, "/x2", "r2")).await.unwrap());

    // Jobs are not idempotent: the next event for the unmarked item queues
    // a second job
    faulty.heal();
    store.put(&path("/x2"), json!({"retry": 1}), None).await.unwrap();
    assert!(eventually(|| async { store.head(&marker_path(&config, "/x2", "r2")).await.unwrap() }).await);
    assert_eq!(queue_len(&store, "svc1").await, 2);

    settle().await;
    assert_eq!(queue_len(&store, "svc1").await, 2);
    running.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_releases_every_watch() {
    let store = MemoryStore::new();
    let config = test_config();
    publish_rule(&store, &config, "r1", foo_rule()).await;
    publish_rule(
        &store,
        &config,
        "r2",
        job_rule("/docs", json!({}), "svc1", "/target"),
    )
    .await;
    let running = start_memory_instance(config, &store);
    assert!(eventually(|| async { running.instance.registry().len() == 2 }).await);
    assert_eq!(store.watch_count(), 3);

    let instance = Arc::clone(&running.instance);
    running.stop().await.unwrap();
    assert!(instance.registry().is_empty());
    assert_eq!(store.watch_count(), 0);
}
