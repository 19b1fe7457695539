//! Integration tests against a live Redis.
//!
//! Requires a reachable server. Run with:
//!   REDIS_URL="redis://127.0.0.1:6379" cargo test -p gpufleet_redis -- --ignored

use std::time::Duration;

use gpufleet_core::ports::KvBackend;
use gpufleet_redis::RedisBackend;

async fn backend() -> RedisBackend {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for integration tests");
    RedisBackend::connect(&url)
        .await
        .expect("failed to connect to redis")
}

#[tokio::test]
#[ignore]
async fn string_round_trip_with_ttl() {
    let kv = backend().await;
    let key = "gpufleet:test:string";
    kv.set(key, "value", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(kv.get(key).await.unwrap().as_deref(), Some("value"));
    assert!(kv.ttl(key).await.unwrap().is_some());
    kv.del(key).await.unwrap();
    assert_eq!(kv.get(key).await.unwrap(), None);
}

#[tokio::test]
#[ignore]
async fn set_nx_is_atomic() {
    let kv = backend().await;
    let key = "gpufleet:test:nx";
    kv.del(key).await.unwrap();
    assert!(kv.set_nx(key, "a", Some(Duration::from_secs(5))).await.unwrap());
    assert!(!kv.set_nx(key, "b", Some(Duration::from_secs(5))).await.unwrap());
    assert_eq!(kv.get(key).await.unwrap().as_deref(), Some("a"));
    kv.del(key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn zpopmin_claims_lowest_score() {
    let kv = backend().await;
    let key = "gpufleet:test:zset";
    kv.del(key).await.unwrap();
    kv.zadd(key, 3.0, "c").await.unwrap();
    kv.zadd(key, 1.0, "a").await.unwrap();
    kv.zadd(key, 2.0, "b").await.unwrap();

    let (member, score) = kv.zpopmin(key).await.unwrap().unwrap();
    assert_eq!(member, "a");
    assert_eq!(score, 1.0);
    assert_eq!(kv.zcard(key).await.unwrap(), 2);
    kv.del(key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn zrange_by_score_with_infinities() {
    let kv = backend().await;
    let key = "gpufleet:test:range";
    kv.del(key).await.unwrap();
    for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
        kv.zadd(key, score, member).await.unwrap();
    }
    let all = kv
        .zrange_by_score(key, f64::MIN, f64::MAX, None)
        .await
        .unwrap();
    assert_eq!(all, vec!["a", "b", "c"]);
    let bounded = kv.zrange_by_score(key, 2.0, 3.0, Some(1)).await.unwrap();
    assert_eq!(bounded, vec!["b"]);
    kv.del(key).await.unwrap();
}
