use serde_json::json;

use super::{SqliteStore, Store, glob_to_like, set_at_path, value_at_path};

#[test]
fn dotted_paths_address_objects_and_arrays() {
    let doc = json!({ "steps": [{ "status": "pending" }, { "status": "running" }] });
    assert_eq!(value_at_path(&doc, "steps.1.status"), Some(&json!("running")));
    assert_eq!(value_at_path(&doc, "steps.5.status"), None);
    assert_eq!(value_at_path(&doc, "missing"), None);
}

#[test]
fn set_at_path_creates_intermediate_objects() {
    let mut doc = json!({});
    set_at_path(&mut doc, "used.llm_tokens", json!(42)).unwrap();
    assert_eq!(doc, json!({ "used": { "llm_tokens": 42 } }));

    let mut doc = json!({ "items": [1] });
    set_at_path(&mut doc, "items.1", json!(2)).unwrap();
    assert_eq!(doc, json!({ "items": [1, 2] }));
    assert!(set_at_path(&mut doc, "items.9", json!(3)).is_err());
}

#[test]
fn glob_patterns_escape_like_metacharacters() {
    assert_eq!(glob_to_like("scheduled:*"), "scheduled:%");
    assert_eq!(glob_to_like("a_b?"), "a\\_b_");
}

#[tokio::test]
async fn documents_support_partial_get_and_set() {
    let store = SqliteStore::in_memory().unwrap();
    store
        .set("task:1", None, json!({ "status": "pending", "steps": [] }))
        .await
        .unwrap();
    store
        .set("task:1", Some("status"), json!("executing"))
        .await
        .unwrap();

    assert_eq!(
        store.get("task:1", Some("status")).await.unwrap(),
        Some(json!("executing"))
    );
    assert!(store.exists("task:1").await.unwrap());
    assert!(!store.exists("task:2").await.unwrap());
    assert_eq!(store.get("task:2", None).await.unwrap(), None);
}

#[tokio::test]
async fn set_if_absent_only_writes_once() {
    let store = SqliteStore::in_memory().unwrap();
    assert!(store.set_if_absent("k", json!({ "v": 1 })).await.unwrap());
    assert!(!store.set_if_absent("k", json!({ "v": 2 })).await.unwrap());
    assert_eq!(store.get("k", Some("v")).await.unwrap(), Some(json!(1)));
}

#[tokio::test]
async fn compare_and_set_rejects_stale_expectation() {
    let store = SqliteStore::in_memory().unwrap();
    store.set("approval:a", None, json!({ "status": "pending" })).await.unwrap();

    let first = store
        .compare_and_set("approval:a", "status", &json!("pending"), json!("approved"))
        .await
        .unwrap();
    let second = store
        .compare_and_set("approval:a", "status", &json!("pending"), json!("rejected"))
        .await
        .unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(
        store.get("approval:a", Some("status")).await.unwrap(),
        Some(json!("approved"))
    );
}

#[tokio::test]
async fn key_enumeration_matches_glob() {
    let store = SqliteStore::in_memory().unwrap();
    for key in ["scheduled:a", "scheduled:b", "task:a"] {
        store.set(key, None, json!({})).await.unwrap();
    }
    let keys = store.keys("scheduled:*").await.unwrap();
    assert_eq!(keys, vec!["scheduled:a".to_string(), "scheduled:b".to_string()]);
    assert!(store.delete("scheduled:a").await.unwrap());
    assert_eq!(store.keys("scheduled:*").await.unwrap().len(), 1);
}

#[tokio::test]
async fn bounded_increment_never_passes_limit() {
    let store = SqliteStore::in_memory().unwrap();
    store
        .set("budget:run:r1", None, json!({ "limits": { "t": 10 }, "used": { "t": 0 } }))
        .await
        .unwrap();

    let a = store.increment_bounded("budget:run:r1", "used.t", "limits.t", 7).await.unwrap();
    let b = store.increment_bounded("budget:run:r1", "used.t", "limits.t", 4).await.unwrap();
    let c = store.increment_bounded("budget:run:r1", "used.t", "limits.t", 3).await.unwrap();

    assert!(a.applied);
    assert!(!b.applied);
    assert_eq!(b.value, 7);
    assert!(c.applied);
    assert_eq!(c.value, 10);
}

#[tokio::test]
async fn concurrent_bounded_increments_do_not_lose_updates() {
    let store = std::sync::Arc::new(SqliteStore::in_memory().unwrap());
    store
        .set("budget:run:r1", None, json!({ "limits": { "t": 25 }, "used": { "t": 0 } }))
        .await
        .unwrap();

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..40 {
        let store = store.clone();
        set.spawn(async move {
            store
                .increment_bounded("budget:run:r1", "used.t", "limits.t", 1)
                .await
                .unwrap()
                .applied
        });
    }
    let mut applied = 0;
    while let Some(res) = set.join_next().await {
        if res.unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, 25);
    assert_eq!(
        store.get("budget:run:r1", Some("used.t")).await.unwrap(),
        Some(json!(25))
    );
}

#[tokio::test]
async fn sorted_set_ranges_by_score_with_paging() {
    let store = SqliteStore::in_memory().unwrap();
    store.zadd("due", "a", 30.0).await.unwrap();
    store.zadd("due", "b", 10.0).await.unwrap();
    store.zadd("due", "c", 20.0).await.unwrap();
    store.zadd("due", "b", 40.0).await.unwrap();

    let all = store.zrange_by_score("due", 0.0, 100.0, 0, 10).await.unwrap();
    let members: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
    assert_eq!(members, vec!["c", "a", "b"]);

    let page = store.zrange_by_score("due", 0.0, 35.0, 1, 1).await.unwrap();
    assert_eq!(page, vec![("a".to_string(), 30.0)]);

    assert!(store.zrem("due", "a").await.unwrap());
    assert_eq!(store.zscore("due", "a").await.unwrap(), None);
    assert_eq!(store.zscore("due", "c").await.unwrap(), Some(20.0));
}

#[tokio::test]
async fn consumer_groups_read_independently_and_redeliver_unacked() {
    let store = SqliteStore::in_memory().unwrap();
    for i in 0..3 {
        store.append("stream:x", json!({ "n": i })).await.unwrap();
    }

    let first = store.read_group("stream:x", "g1", "c1", 2).await.unwrap();
    assert_eq!(first.len(), 2);

    // Unacked entries come back first.
    let again = store.read_group("stream:x", "g1", "c1", 5).await.unwrap();
    assert_eq!(again.len(), 3);
    assert_eq!(again[0].id, first[0].id);

    let ids: Vec<i64> = again.iter().map(|e| e.id).collect();
    assert_eq!(store.ack("stream:x", "g1", &ids).await.unwrap(), 3);
    assert!(store.read_group("stream:x", "g1", "c1", 5).await.unwrap().is_empty());

    // A second group starts from the beginning.
    let other = store.read_group("stream:x", "g2", "c1", 5).await.unwrap();
    assert_eq!(other.len(), 3);

    let tail = store.range("stream:x", first[0].id, 10).await.unwrap();
    assert_eq!(tail.len(), 2);
}

#[tokio::test]
async fn tail_returns_the_newest_entries_in_order() {
    let store = SqliteStore::in_memory().unwrap();
    for i in 0..5 {
        store.append("stream:x", json!({ "n": i })).await.unwrap();
    }
    store.append("stream:y", json!({ "n": 99 })).await.unwrap();

    let last: Vec<_> = store
        .tail("stream:x", 2)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.payload["n"].clone())
        .collect();
    assert_eq!(last, vec![json!(3), json!(4)]);
    assert_eq!(store.tail("stream:x", 50).await.unwrap().len(), 5);
    assert!(store.tail("stream:z", 5).await.unwrap().is_empty());
}
