//! Registry and watcher behaviour driven without the rules loop

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use ruleflow_core::RuleId;
use ruleflow_engine::{Instance, RegistryError};
use ruleflow_store::{MemoryStore, ResourceStore};
use ruleflow_test_utils::{
    eventually, marker_path, path, reindex_rule, seed_item, settle, test_config, CountingStore,
};
use serde_json::json;

fn instance_over(store: &MemoryStore, counting: &Arc<CountingStore>) -> Instance {
    Instance::new(test_config(), counting.clone(), Arc::new(store.clone()))
}

async fn count_markers(store: &MemoryStore, ids: &[String], rule: &str) -> usize {
    let config = test_config();
    let mut n = 0;
    for id in ids {
        if store
            .head(&marker_path(&config, &format!("/{id}"), rule))
            .await
            .unwrap()
        {
            n += 1;
        }
    }
    n
}

async fn seed_many(store: &MemoryStore, n: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = format!("item{i}");
        seed_item(store, "/docs", &id, json!({"foo": "bar", "n": i})).await;
        ids.push(id);
    }
    ids
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_execution_at_a_time_per_rule() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(
        Arc::new(store.clone()),
        Duration::from_millis(2),
    ));
    let ids = seed_many(&store, 8).await;
    let instance = instance_over(&store, &counting);

    instance
        .registry()
        .register(RuleId::new("r1"), &reindex_rule("/docs", json!({}), "/out/{{foo}}"))
        .await
        .unwrap();
    assert!(eventually(|| async { count_markers(&store, &ids, "r1").await == ids.len() }).await);

    assert_eq!(counting.max_in_flight(), 1);
    instance.registry().stop_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rules_run_independently() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(
        Arc::new(store.clone()),
        Duration::from_millis(20),
    ));
    let ids = seed_many(&store, 4).await;
    let instance = instance_over(&store, &counting);

    for rule in ["a", "b"] {
        instance
            .registry()
            .register(
                RuleId::new(rule),
                &reindex_rule("/docs", json!({}), &format!("/{rule}")),
            )
            .await
            .unwrap();
    }
    assert!(
        eventually(|| async {
            count_markers(&store, &ids, "a").await == ids.len()
                && count_markers(&store, &ids, "b").await == ids.len()
        })
        .await
    );

    assert!(counting.max_in_flight() >= 2);
    instance.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn unregister_drops_queued_work() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(
        Arc::new(store.clone()),
        Duration::from_millis(25),
    ));
    let ids = seed_many(&store, 20).await;
    let instance = instance_over(&store, &counting);
    let id = RuleId::new("r1");

    instance
        .registry()
        .register(id.clone(), &reindex_rule("/docs", json!({}), "/out"))
        .await
        .unwrap();
    let stats = instance.registry().stats(&id).unwrap();
    assert!(eventually(|| async { stats.applied() >= 1 }).await);

    assert!(instance.registry().unregister(&id).await.unwrap());
    let finished = stats.executions();
    assert!(finished < ids.len() as u64);

    settle().await;
    assert_eq!(stats.executions(), finished);
    assert_eq!(store.watch_count(), 0);
    assert!(count_markers(&store, &ids, "r1").await < ids.len());
}

#[tokio::test]
async fn register_replaces_running_rule() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(Arc::new(store.clone()), Duration::ZERO));
    let instance = instance_over(&store, &counting);
    let id = RuleId::new("r1");

    instance
        .registry()
        .register(id.clone(), &reindex_rule("/docs", json!({}), "/first"))
        .await
        .unwrap();
    instance
        .registry()
        .register(id.clone(), &reindex_rule("/docs", json!({}), "/second"))
        .await
        .unwrap();
    assert_eq!(instance.registry().len(), 1);
    assert_eq!(store.watch_count(), 1);

    seed_item(&store, "/docs", "x1", json!({})).await;
    assert!(eventually(|| async { store.head(&path("/second/x1")).await.unwrap() }).await);
    assert!(!store.head(&path("/first")).await.unwrap());

    instance.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn invalid_replacement_keeps_previous_definition() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(Arc::new(store.clone()), Duration::ZERO));
    let instance = instance_over(&store, &counting);
    let id = RuleId::new("r1");

    instance
        .registry()
        .register(id.clone(), &reindex_rule("/docs", json!({}), "/out"))
        .await
        .unwrap();

    let err = instance
        .registry()
        .register(
            id.clone(),
            &reindex_rule("/docs", json!({"type": "not-a-type"}), "/elsewhere"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Schema(_)));
    assert!(err.is_config_error());

    let err = instance
        .registry()
        .register(id.clone(), &json!({"list": "/docs", "schema": {}, "type": "teleport"}))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidRule(_)));

    assert!(instance.registry().contains(&id));
    assert_eq!(store.watch_count(), 1);

    seed_item(&store, "/docs", "x1", json!({})).await;
    assert!(eventually(|| async { store.head(&path("/out/x1")).await.unwrap() }).await);
    assert!(!store.head(&path("/elsewhere")).await.unwrap());

    instance.registry().stop_all().await.unwrap();
}

#[tokio::test]
async fn invalid_new_rule_is_not_registered() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(Arc::new(store.clone()), Duration::ZERO));
    let instance = instance_over(&store, &counting);
    let id = RuleId::new("r1");

    let err = instance
        .registry()
        .register(
            id.clone(),
            &reindex_rule("/docs", json!({"type": "not-a-type"}), "/out"),
        )
        .await
        .unwrap_err();
    assert!(err.is_config_error());
    assert!(!instance.registry().contains(&id));
    assert_eq!(store.watch_count(), 0);

    seed_item(&store, "/docs", "x1", json!({})).await;
    settle().await;
    assert!(!store.head(&path("/out")).await.unwrap());
}

#[tokio::test]
async fn bad_destination_template_is_rejected() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(Arc::new(store.clone()), Duration::ZERO));
    let instance = instance_over(&store, &counting);

    let err = instance
        .registry()
        .register(
            RuleId::new("r1"),
            &reindex_rule("/docs", json!({}), "/out/{{nope foo}}"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Template(_)));
    assert!(instance.registry().is_empty());
}

#[tokio::test]
async fn unregister_unknown_rule_is_a_noop() {
    let store = MemoryStore::new();
    let counting = Arc::new(CountingStore::new(Arc::new(store.clone()), Duration::ZERO));
    let instance = instance_over(&store, &counting);

    assert!(!instance
        .registry()
        .unregister(&RuleId::new("ghost"))
        .await
        .unwrap());
}
