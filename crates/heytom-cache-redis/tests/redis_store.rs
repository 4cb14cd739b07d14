//! Integration tests for the Redis far-tier adapter.
//!
//! These exercise the full stack: the adapter's command mapping, the
//! coordinator's dual-write and invalidation flow across two instances,
//! and the mutex scripts. Tests use testcontainers to spin up a real
//! Redis instance shared across the suite.

use std::sync::Arc;
use std::time::Duration;

use heytom_cache::{
    CacheConfig, Expiration, FarMutex, FarStore, HybridCache, RetryPolicy, sliding_metadata_key,
};
use heytom_cache_redis::RedisFarStore;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests.
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container.
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{host_port}");
            (container, url)
        })
        .await;
    url.clone()
}

async fn connect_store() -> Arc<RedisFarStore> {
    let url = get_redis_url().await;
    Arc::new(
        RedisFarStore::builder(url)
            .pool_size(5)
            .build()
            .expect("build redis store"),
    )
}

async fn build_cache(instance: &str) -> (HybridCache, Arc<RedisFarStore>) {
    let store = connect_store().await;
    let config = CacheConfig {
        far_url: get_redis_url().await,
        instance_name: Some(instance.to_string()),
        ..CacheConfig::default()
    };
    let far: Arc<dyn FarStore> = Arc::clone(&store) as Arc<dyn FarStore>;
    let cache = HybridCache::builder()
        .far_store(far)
        .config(config)
        .build()
        .await
        .expect("build cache");
    (cache, store)
}

fn unique_key(prefix: &str) -> String {
    format!("{prefix}:{}", uuid::Uuid::new_v4())
}

#[tokio::test]
async fn test_store_get_set_remove() {
    let store = connect_store().await;
    let key = unique_key("kv");

    assert_eq!(store.get(&key).await.unwrap(), None);
    store.set(&key, b"value", None).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap(), Some(b"value".to_vec()));
    assert_eq!(store.remove(&[&key]).await.unwrap(), 1);
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_store_ttl_expires() {
    let store = connect_store().await;
    let key = unique_key("ttl");

    store
        .set(&key, b"v", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(store.get(&key).await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_store_list_is_fifo() {
    let store = connect_store().await;
    let key = unique_key("list");

    store.list_push(&key, b"a").await.unwrap();
    store.list_push(&key, b"b").await.unwrap();
    assert_eq!(store.list_len(&key).await.unwrap(), 2);
    assert_eq!(store.list_pop(&key).await.unwrap(), Some(b"a".to_vec()));
    assert_eq!(store.list_pop(&key).await.unwrap(), Some(b"b".to_vec()));
    assert_eq!(store.list_pop(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_store_set_membership() {
    let store = connect_store().await;
    let key = unique_key("set");

    assert!(store.set_add(&key, b"m").await.unwrap());
    assert!(!store.set_add(&key, b"m").await.unwrap());
    assert_eq!(store.set_members(&key).await.unwrap().len(), 1);
    assert!(store.set_remove(&key, b"m").await.unwrap());
}

#[tokio::test]
async fn test_store_sorted_set_ascending() {
    let store = connect_store().await;
    let key = unique_key("zset");

    store.sorted_add(&key, b"late", 30.0).await.unwrap();
    store.sorted_add(&key, b"early", 10.0).await.unwrap();
    store.sorted_add(&key, b"mid", 20.0).await.unwrap();

    let range = store.sorted_range_by_score(&key, 5.0, 25.0).await.unwrap();
    assert_eq!(range, vec![b"early".to_vec(), b"mid".to_vec()]);
}

#[tokio::test]
async fn test_store_hash_roundtrip() {
    let store = connect_store().await;
    let key = unique_key("hash");

    store.hash_set(&key, "f1", b"1").await.unwrap();
    store.hash_set(&key, "f2", b"2").await.unwrap();
    assert_eq!(store.hash_get(&key, "f1").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.hash_get_all(&key).await.unwrap().len(), 2);
    assert!(store.hash_delete(&key, "f1").await.unwrap());
    assert!(!store.hash_delete(&key, "f1").await.unwrap());
}

#[tokio::test]
async fn test_store_pubsub_fidelity() {
    let store = connect_store().await;
    let channel = unique_key("chan");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut sub = store
        .subscribe(
            &channel,
            Arc::new(move |payload| sink.lock().unwrap().push(payload)),
        )
        .await
        .unwrap();

    // Give the dedicated subscriber connection time to attach.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let receivers = store.publish(&channel, &[0x01, 0x02]).await.unwrap();
    assert_eq!(receivers, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(seen.lock().unwrap().as_slice(), &[vec![0x01, 0x02]]);

    sub.close().await.unwrap();
    assert!(!sub.is_active());
}

#[tokio::test]
async fn test_cache_roundtrip_through_redis() {
    let (cache, _store) = build_cache("it-roundtrip").await;
    let key = unique_key("cache");

    cache
        .set(&key, vec![0x01, 0x02, 0x03], Expiration::none())
        .await
        .unwrap();
    assert_eq!(
        cache.get(&key).await.unwrap(),
        Some(Arc::new(vec![0x01, 0x02, 0x03]))
    );

    cache.remove(&key).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_sliding_metadata_shares_ttl() {
    let (cache, store) = build_cache("it-sliding").await;
    let key = unique_key("sliding");

    cache
        .set(&key, b"v".to_vec(), Expiration::sliding(Duration::from_secs(30)))
        .await
        .unwrap();

    let mut conn = store.pool().get().await.unwrap();
    let primary_ttl: i64 = redis::cmd("PTTL")
        .arg(&key)
        .query_async(&mut *conn)
        .await
        .unwrap();
    let metadata_ttl: i64 = redis::cmd("PTTL")
        .arg(sliding_metadata_key(&key))
        .query_async(&mut *conn)
        .await
        .unwrap();

    assert!(primary_ttl > 0, "primary key must carry a TTL");
    assert!(metadata_ttl > 0, "metadata key must carry a TTL");
    assert!(
        (primary_ttl - metadata_ttl).abs() < 1000,
        "primary and metadata TTLs must match (got {primary_ttl} vs {metadata_ttl})"
    );

    // Refresh pushes both TTLs back out to the sliding window.
    tokio::time::sleep(Duration::from_millis(500)).await;
    cache.refresh(&key).await.unwrap();
    let refreshed_ttl: i64 = redis::cmd("PTTL")
        .arg(&key)
        .query_async(&mut *conn)
        .await
        .unwrap();
    assert!(refreshed_ttl > primary_ttl - 1000);
}

#[tokio::test]
async fn test_two_instances_invalidate_over_redis() {
    let (instance_a, _store_a) = build_cache("node-a").await;
    let (instance_b, _store_b) = build_cache("node-b").await;
    let key = unique_key("shared");

    // Let both invalidation subscriptions attach.
    tokio::time::sleep(Duration::from_millis(300)).await;

    instance_a
        .set(&key, vec![0x00], Expiration::none())
        .await
        .unwrap();
    assert_eq!(
        instance_b.get(&key).await.unwrap(),
        Some(Arc::new(vec![0x00]))
    );
    assert!(instance_b.near_contains(&key));

    instance_a
        .set(&key, vec![0x01], Expiration::none())
        .await
        .unwrap();

    // Wait for the invalidation event to reach B.
    let mut dropped = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !instance_b.near_contains(&key) {
            dropped = true;
            break;
        }
    }
    assert!(dropped, "B's near entry must be invalidated");
    assert_eq!(
        instance_b.get(&key).await.unwrap(),
        Some(Arc::new(vec![0x01]))
    );
}

#[tokio::test]
async fn test_mutex_exclusivity_across_stores() {
    let resource = unique_key("job");
    let first = FarMutex::new(connect_store().await, &resource).unwrap();
    let second = FarMutex::new(connect_store().await, &resource).unwrap();

    let first_won = first.acquire(Duration::from_secs(10)).await.unwrap();
    let second_won = second.acquire(Duration::from_secs(10)).await.unwrap();
    assert!(first_won ^ second_won, "exactly one holder may win");

    let (winner, loser) = if first_won {
        (&first, &second)
    } else {
        (&second, &first)
    };
    assert!(winner.release().await.unwrap());
    assert!(loser.acquire(Duration::from_secs(10)).await.unwrap());
    assert!(loser.release().await.unwrap());
}

#[tokio::test]
async fn test_mutex_scripted_release_ignores_non_owner() {
    let store = connect_store().await;
    let resource = unique_key("guarded");
    let owner_far: Arc<dyn FarStore> = Arc::clone(&store) as Arc<dyn FarStore>;
    let owner = FarMutex::new(owner_far, &resource).unwrap();

    assert!(owner.acquire(Duration::from_secs(10)).await.unwrap());

    // A stranger's token must not delete the owner's entry.
    assert!(
        !store
            .compare_and_delete(owner.key(), b"wrong-token")
            .await
            .unwrap()
    );
    assert!(store.get(owner.key()).await.unwrap().is_some());

    // Extend with the wrong token is refused the same way.
    assert!(
        !store
            .compare_and_expire(owner.key(), b"wrong-token", Duration::from_secs(60))
            .await
            .unwrap()
    );

    assert!(owner.release().await.unwrap());
    assert_eq!(store.get(owner.key()).await.unwrap(), None);
}

#[tokio::test]
async fn test_degrades_to_near_tier_when_redis_unreachable() {
    let store = RedisFarStore::builder("redis://127.0.0.1:1")
        .pool_size(2)
        .build()
        .unwrap();
    let config = CacheConfig {
        far_url: "redis://127.0.0.1:1".to_string(),
        far_timeout: Duration::from_millis(500),
        instance_name: Some("it-degraded".to_string()),
        ..CacheConfig::default()
    };
    let cache = HybridCache::builder()
        .far_store(Arc::new(store))
        .config(config)
        .retry_policy(RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        })
        .build()
        .await
        .unwrap();

    // Writes land in the near tier and reads serve them back.
    cache.set("k", vec![0xAB], Expiration::none()).await.unwrap();
    assert_eq!(cache.get("k").await.unwrap(), Some(Arc::new(vec![0xAB])));
}
