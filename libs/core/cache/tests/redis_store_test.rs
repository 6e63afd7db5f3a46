//! Redis binding tests against a real server (testcontainers).

use cache_store::{CacheStore, RedisCacheStore, connect};
use std::time::Duration;
use test_utils::TestRedis;

async fn store(redis: &TestRedis) -> RedisCacheStore {
    RedisCacheStore::new(connect(redis.connection_string()).await.unwrap())
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_string_roundtrip_and_get_del() {
    let redis = TestRedis::new().await;
    let store = store(&redis).await;

    store.set_ex("delivery:pending:m1", "{\"a\":1}", Duration::from_secs(30)).await.unwrap();
    assert!(store.exists("delivery:pending:m1").await.unwrap());

    assert_eq!(
        store.get_del("delivery:pending:m1").await.unwrap().as_deref(),
        Some("{\"a\":1}")
    );
    assert_eq!(store.get_del("delivery:pending:m1").await.unwrap(), None);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_list_window() {
    let redis = TestRedis::new().await;
    let store = store(&redis).await;
    let items: Vec<String> = (0..5).map(|i| format!("i{i}")).collect();

    assert_eq!(store.list_push("jobs:job:1:data", &items).await.unwrap(), 5);
    assert_eq!(store.list_range("jobs:job:1:data", 3, 10).await.unwrap(), vec!["i3", "i4"]);
    assert_eq!(store.list_len("jobs:job:1:data").await.unwrap(), 5);
    assert!(store.expire("jobs:job:1:data", Duration::from_secs(60)).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn test_scan_and_delete() {
    let redis = TestRedis::new().await;
    let store = store(&redis).await;

    store
        .set_many_ex(
            &[
                ("query:a:1".to_string(), "x".to_string()),
                ("query:a:2".to_string(), "y".to_string()),
                ("query:b:1".to_string(), "z".to_string()),
            ],
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let keys = store.scan_keys("query:a:*").await.unwrap();
    assert_eq!(keys, vec!["query:a:1", "query:a:2"]);
    assert_eq!(store.del(&keys).await.unwrap(), 2);

    let values = store
        .get_many(&["query:a:1".to_string(), "query:b:1".to_string()])
        .await
        .unwrap();
    assert_eq!(values, vec![None, Some("z".to_string())]);
}
