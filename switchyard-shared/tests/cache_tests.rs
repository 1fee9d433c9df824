/// Integration tests for the shared cache across clients
///
/// Two `CacheClient`s on one Redis stand in for two processes.
/// Run with: cargo test --test cache_tests -- --ignored

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_shared::cache::{CacheClient, CacheClientConfig, CacheSource, TtlControl};

struct Prices {
    calls: Arc<AtomicU32>,
    ttl_override: Option<Duration>,
}

#[async_trait]
impl CacheSource for Prices {
    type Input = String;
    type Output = u64;

    fn hash(&self, sku: &String) -> String {
        sku.clone()
    }

    async fn provide(&self, sku: &String, ttl: &TtlControl) -> anyhow::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(t) = self.ttl_override {
            ttl.set_ttl(t);
        }
        Ok(sku.len() as u64 * 100)
    }

    fn tags(&self, _price: &u64, sku: &String) -> Vec<String> {
        vec![format!("sku:{}", sku), "prices".to_string()]
    }
}

fn config(version: &str) -> CacheClientConfig {
    CacheClientConfig {
        version: version.to_string(),
        ..CacheClientConfig::default()
    }
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_second_process_reads_remote_entry() {
    let version = common::unique("v");
    let a = CacheClient::new(common::connect().await, config(&version));
    let b = CacheClient::new(common::connect().await, config(&version));
    let calls = Arc::new(AtomicU32::new(0));

    let prices_a = a.cache("prices", Duration::from_secs(60), Prices { calls: calls.clone(), ttl_override: None });
    let prices_b = b.cache("prices", Duration::from_secs(60), Prices { calls: calls.clone(), ttl_override: None });

    assert_eq!(prices_a.run("apple".to_string()).await.unwrap(), 500);
    assert_eq!(prices_b.run("apple".to_string()).await.unwrap(), 500);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_clear_by_tag_reaches_other_process_local_tier() {
    let version = common::unique("v");
    let a = CacheClient::new(common::connect().await, config(&version));
    let b = CacheClient::new(common::connect().await, config(&version));
    let calls = Arc::new(AtomicU32::new(0));

    let prices_a = a.cache("prices", Duration::from_secs(60), Prices { calls: calls.clone(), ttl_override: None });
    let prices_b = b.cache("prices", Duration::from_secs(60), Prices { calls: calls.clone(), ttl_override: None });

    // Give both invalidation listeners time to subscribe
    tokio::time::sleep(Duration::from_millis(200)).await;

    prices_a.run("pear".to_string()).await.unwrap();
    prices_b.run("pear".to_string()).await.unwrap();
    let key = prices_b.key_for(&"pear".to_string());
    assert!(b.local().get::<u64>(&key).await.is_some());

    assert_eq!(a.clear_by_tag("prices").await.unwrap(), 1);

    let mut evicted = false;
    for _ in 0..20 {
        if b.local().get::<u64>(&key).await.is_none() {
            evicted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(evicted, "remote clear did not evict the local entry");

    prices_b.run("pear".to_string()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_provider_ttl_override_is_persisted() {
    let redis = common::connect().await;
    let client = CacheClient::new(redis.clone(), config(&common::unique("v")));
    let calls = Arc::new(AtomicU32::new(0));
    let prices = client.cache(
        "prices",
        Duration::from_secs(60),
        Prices {
            calls,
            ttl_override: Some(Duration::from_secs(5)),
        },
    );

    prices.run("fig".to_string()).await.unwrap();

    let mut conn = redis.get_connection();
    let ttl: i64 = redis::cmd("TTL")
        .arg(prices.key_for(&"fig".to_string()))
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl > 0 && ttl <= 5, "unexpected ttl {}", ttl);
}

#[tokio::test]
#[ignore] // Requires running Redis instance
async fn test_fractional_ttl_is_kept_by_value_and_tags() {
    let redis = common::connect().await;
    let client = CacheClient::new(redis.clone(), config(&common::unique("v")));
    let prices = client.cache(
        "prices",
        Duration::from_millis(2500),
        Prices {
            calls: Arc::new(AtomicU32::new(0)),
            ttl_override: None,
        },
    );

    prices.run("kiwi".to_string()).await.unwrap();

    let mut conn = redis.get_connection();
    let value_ttl: i64 = redis::cmd("PTTL")
        .arg(prices.key_for(&"kiwi".to_string()))
        .query_async(&mut conn)
        .await
        .unwrap();
    let tag_ttl: i64 = redis::cmd("PTTL")
        .arg(client.keys().tag("sku:kiwi"))
        .query_async(&mut conn)
        .await
        .unwrap();

    assert!(value_ttl > 2000 && value_ttl <= 2500, "value ttl {}ms", value_ttl);
    assert!(tag_ttl > 2000 && tag_ttl <= 2500, "tag ttl {}ms", tag_ttl);
    assert!((tag_ttl - value_ttl).abs() < 200, "tiers drifted apart");

    let _: () = redis::cmd("DEL")
        .arg(client.keys().tag("sku:kiwi"))
        .arg(client.keys().tag("prices"))
        .query_async(&mut conn)
        .await
        .unwrap();
}
