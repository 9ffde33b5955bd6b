use std::collections::HashSet;
use std::time::{Duration, Instant};

use trawl_core::store::SharedStore;

use crate::common::setup_test_store;

#[tokio::test]
async fn hash_operations() {
    let (store, _container) = setup_test_store().await;

    store.hset("h", "a", "1").await.unwrap();
    store.hset("h", "b", "2").await.unwrap();
    store.hset("h", "a", "3").await.unwrap();

    assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("3"));
    assert_eq!(store.hget("h", "missing").await.unwrap(), None);

    let mut all = store.hgetall("h").await.unwrap();
    all.sort();
    assert_eq!(
        all,
        vec![("a".to_string(), "3".to_string()), ("b".to_string(), "2".to_string())]
    );

    assert!(store.hdel("h", "a").await.unwrap());
    assert!(!store.hdel("h", "a").await.unwrap());
    assert!(store.hgetall("nothing").await.unwrap().is_empty());
}

#[tokio::test]
async fn list_operations() {
    let (store, _container) = setup_test_store().await;

    for value in ["x", "y", "x", "z"] {
        store.rpush("l", value).await.unwrap();
    }
    assert_eq!(store.llen("l").await.unwrap(), 4);
    assert_eq!(store.lrem("l", "x").await.unwrap(), 2);
    assert_eq!(store.llen("l").await.unwrap(), 2);
    assert_eq!(store.lrem("l", "x").await.unwrap(), 0);
}

#[tokio::test]
async fn set_operations() {
    let (store, _container) = setup_test_store().await;

    store.sadd("s", "w1").await.unwrap();
    store.sadd("s", "w1").await.unwrap();
    store.sadd("s", "w2").await.unwrap();

    let members: HashSet<_> = store.smembers("s").await.unwrap().into_iter().collect();
    assert_eq!(members, HashSet::from(["w1".to_string(), "w2".to_string()]));
    assert!(store.srem("s", "w1").await.unwrap());
    assert!(!store.srem("s", "w1").await.unwrap());
}

#[tokio::test]
async fn blpop_respects_key_order() {
    let (store, _container) = setup_test_store().await;
    let keys = vec!["q:high".to_string(), "q:low".to_string()];

    store.rpush("q:low", "l1").await.unwrap();
    store.rpush("q:high", "h1").await.unwrap();

    let first = store.blpop(&keys, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first, Some(("q:high".to_string(), "h1".to_string())));
    let second = store.blpop(&keys, Duration::ZERO).await.unwrap();
    assert_eq!(second, Some(("q:low".to_string(), "l1".to_string())));
    assert_eq!(store.blpop(&keys, Duration::ZERO).await.unwrap(), None);
}

#[tokio::test]
async fn blpop_times_out_on_empty_lists() {
    let (store, _container) = setup_test_store().await;
    let keys = vec!["empty".to_string()];

    let started = Instant::now();
    assert_eq!(store.blpop(&keys, Duration::from_secs(1)).await.unwrap(), None);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn blpop_with_sub_millisecond_timeout_never_blocks() {
    let (store, _container) = setup_test_store().await;
    let keys = vec!["empty".to_string()];

    let popped = tokio::time::timeout(
        Duration::from_secs(2),
        store.blpop(&keys, Duration::from_micros(400)),
    )
    .await
    .expect("blpop blocked past its deadline");
    assert_eq!(popped.unwrap(), None);

    store.rpush("empty", "v").await.unwrap();
    let popped = store.blpop(&keys, Duration::from_micros(400)).await.unwrap();
    assert_eq!(popped, Some(("empty".to_string(), "v".to_string())));
}

#[tokio::test]
async fn blpop_wakes_on_push_without_blocking_other_commands() {
    let (store, _container) = setup_test_store().await;
    let keys = vec!["wake".to_string()];

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.blpop(&keys, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The shared connection stays usable while the pop is waiting.
    store.hset("side", "k", "v").await.unwrap();
    store.rpush("wake", "job-1").await.unwrap();

    let popped = waiter.await.unwrap().unwrap();
    assert_eq!(popped, Some(("wake".to_string(), "job-1".to_string())));
}

#[tokio::test]
async fn concurrent_blpop_hands_each_value_out_once() {
    let (store, _container) = setup_test_store().await;
    for i in 0..50 {
        store.rpush("shared", &i.to_string()).await.unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let keys = vec!["shared".to_string()];
            let mut got = Vec::new();
            while let Some((_, value)) = store.blpop(&keys, Duration::from_millis(200)).await.unwrap() {
                got.push(value);
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for value in task.await.unwrap() {
            assert!(seen.insert(value), "value popped twice");
        }
    }
    assert_eq!(seen.len(), 50);
}
