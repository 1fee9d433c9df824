/// Two-tier cache client and per-source shared caches
///
/// `CacheClient` owns everything caches created from it share: the Redis
/// handle, the local tier, the error reporter and the invalidation
/// subscription. Create one per process and hand out clones.

use super::invalidation::{self, Invalidation};
use super::keys::CacheKeys;
use super::local::{LocalStore, DEFAULT_LOCAL_CAPACITY};
use super::single_flight::SingleFlight;
use super::tags::{ttl_millis, TagScripts};
use super::{CacheError, CacheSource, TtlControl};
use crate::codec;
use crate::config::env_parse;
use crate::redis::client::{RedisClient, RedisClientError, RedisConfig};
use crate::report::{default_reporter, BackgroundTask, SharedReporter};
use redis::AsyncCommands;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

/// What tag registration does about members whose value has expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaleTagPolicy {
    /// Leave them; they are dropped when the tag is cleared or expires
    #[default]
    Ignore,

    /// Drop them whenever a new member is registered under the tag
    Sweep,
}

impl FromStr for StaleTagPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(StaleTagPolicy::Ignore),
            "sweep" => Ok(StaleTagPolicy::Sweep),
            other => Err(format!("unknown stale tag policy '{}'", other)),
        }
    }
}

/// Cache client configuration
#[derive(Debug, Clone)]
pub struct CacheClientConfig {
    /// Key-space version; bump to orphan every existing entry
    pub version: String,

    /// Entries kept in the local tier
    pub local_capacity: u64,

    /// Publish and apply cross-process local evictions
    pub broadcast_invalidations: bool,

    /// Stale tag member handling
    pub stale_tags: StaleTagPolicy,
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            broadcast_invalidations: true,
            stale_tags: StaleTagPolicy::Ignore,
        }
    }
}

impl CacheClientConfig {
    /// Loads configuration from environment variables
    ///
    /// Reads `CACHE_VERSION`, `CACHE_LOCAL_CAPACITY`,
    /// `CACHE_BROADCAST_INVALIDATIONS` and `CACHE_STALE_TAGS`; anything unset
    /// keeps its default.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Self {
            version: env_parse("CACHE_VERSION", defaults.version),
            local_capacity: env_parse("CACHE_LOCAL_CAPACITY", defaults.local_capacity),
            broadcast_invalidations: env_parse(
                "CACHE_BROADCAST_INVALIDATIONS",
                defaults.broadcast_invalidations,
            ),
            stale_tags: env_parse("CACHE_STALE_TAGS", defaults.stale_tags),
        }
    }
}

struct ClientInner {
    redis: RedisClient,
    local: LocalStore,
    keys: CacheKeys,
    scripts: TagScripts,
    config: CacheClientConfig,
    reporter: SharedReporter,
    origin: String,
    _listener: Option<DropGuard>,
}

/// Handle shared by every cache of a process
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

impl CacheClient {
    /// Creates a client on an existing connection
    ///
    /// Errors from best-effort work go to the tracing reporter. Must be called
    /// inside a Tokio runtime when invalidation broadcasting is enabled.
    pub fn new(redis: RedisClient, config: CacheClientConfig) -> Self {
        Self::with_reporter(redis, config, default_reporter())
    }

    /// Creates a client that sends best-effort failures to `reporter`
    pub fn with_reporter(redis: RedisClient, config: CacheClientConfig, reporter: SharedReporter) -> Self {
        let local = LocalStore::new(config.local_capacity);
        let keys = CacheKeys::new(config.version.clone());
        let origin = Uuid::new_v4().to_string();

        let listener = if config.broadcast_invalidations {
            let token = CancellationToken::new();
            tokio::spawn(invalidation::listen(
                redis.clone(),
                keys.invalidation_channel(),
                origin.clone(),
                local.clone(),
                token.clone(),
            ));
            Some(token.drop_guard())
        } else {
            None
        };

        tracing::info!(
            version = %config.version,
            local_capacity = config.local_capacity,
            broadcast = config.broadcast_invalidations,
            "Cache client ready"
        );

        Self {
            inner: Arc::new(ClientInner {
                redis,
                local,
                keys,
                scripts: TagScripts::new(),
                config,
                reporter,
                origin,
                _listener: listener,
            }),
        }
    }

    /// Connects to `redis` eagerly and creates a client
    ///
    /// # Errors
    ///
    /// Returns the connection error.
    pub async fn connect(redis: RedisConfig, config: CacheClientConfig) -> Result<Self, RedisClientError> {
        let redis = RedisClient::new(redis).await?;
        Ok(Self::new(redis, config))
    }

    /// Creates a shared cache named `name` over `source`
    pub fn cache<S: CacheSource>(&self, name: impl Into<String>, ttl: Duration, source: S) -> SharedCache<S> {
        SharedCache {
            name: name.into(),
            ttl,
            source: Arc::new(source),
            client: self.clone(),
            flights: SingleFlight::new(),
        }
    }

    /// Deletes every entry filed under `tag`, then the tag itself
    ///
    /// Each member is deleted independently; a failed delete is reported and
    /// the rest still go. Returns how many value keys were actually removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag cannot be read or deleted.
    pub async fn clear_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
        let tag_key = self.inner.keys.tag(tag);
        let mut conn = self.inner.redis.get_connection();

        let members: Vec<String> = conn.smembers(&tag_key).await?;
        let mut removed = 0;

        for member in &members {
            match conn.del::<_, usize>(member).await {
                Ok(count) => removed += count,
                Err(e) => self.report(e.into(), "cache.clear_by_tag.member"),
            }
            self.inner.local.invalidate(member).await;
        }

        conn.del::<_, ()>(&tag_key).await?;
        self.broadcast(members).await;

        tracing::debug!(tag = %tag, removed, "Cleared cache tag");
        Ok(removed)
    }

    /// `clear_by_tag` in the background; failures are reported
    pub fn clear_by_tag_background(&self, tag: impl Into<String>) -> JoinHandle<()> {
        let client = self.clone();
        let tag = tag.into();
        BackgroundTask::spawn(self.reporter(), "cache.clear_by_tag", async move {
            client.clear_by_tag(&tag).await.map(|_| ())
        })
    }

    /// Drops members of `tag` whose value has expired
    ///
    /// Returns the number of members dropped. A tag left empty is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn sweep_tag(&self, tag: &str) -> Result<u64, CacheError> {
        let mut conn = self.inner.redis.get_connection();
        let swept = self.inner.scripts.sweep(&mut conn, &self.inner.keys.tag(tag)).await?;

        if swept > 0 {
            tracing::debug!(tag = %tag, swept, "Swept stale tag members");
        }
        Ok(swept)
    }

    /// The local tier
    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    /// Key layout in use
    pub fn keys(&self) -> &CacheKeys {
        &self.inner.keys
    }

    /// Client configuration
    pub fn config(&self) -> &CacheClientConfig {
        &self.inner.config
    }

    fn reporter(&self) -> SharedReporter {
        Arc::clone(&self.inner.reporter)
    }

    fn report(&self, error: anyhow::Error, context: &str) {
        self.inner.reporter.report(&error, context);
    }

    /// Tells other processes to evict `keys` from their local tier
    async fn broadcast(&self, keys: Vec<String>) {
        if !self.inner.config.broadcast_invalidations || keys.is_empty() {
            return;
        }

        let message = Invalidation {
            origin: self.inner.origin.clone(),
            keys,
        };
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => return self.report(e.into(), "cache.broadcast"),
        };

        let mut conn = self.inner.redis.get_connection();
        if let Err(e) = conn
            .publish::<_, _, ()>(self.inner.keys.invalidation_channel(), payload)
            .await
        {
            self.report(e.into(), "cache.broadcast");
        }
    }
}

/// Cache of one `CacheSource`, backed by Redis and the local tier
pub struct SharedCache<S: CacheSource> {
    name: String,
    ttl: Duration,
    source: Arc<S>,
    client: CacheClient,
    flights: SingleFlight<S::Output>,
}

impl<S: CacheSource> Clone for SharedCache<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            ttl: self.ttl,
            source: Arc::clone(&self.source),
            client: self.client.clone(),
            flights: self.flights.clone(),
        }
    }
}

impl<S: CacheSource> SharedCache<S> {
    /// Returns the cached result for `input`, computing it at most once per
    /// process at a time
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Redis` when Redis cannot be read or written: an
    /// unreadable cache cannot tell a miss from an outage. Provider errors are
    /// returned as `CacheError::Provider`. Both are shared with every caller
    /// waiting on the same key.
    pub async fn run(&self, input: S::Input) -> Result<S::Output, CacheError> {
        let key = self.key_for(&input);

        if let Some(flight) = self.flights.join(&key) {
            return flight.await;
        }

        if let Some(hit) = self.client.inner.local.get::<S::Output>(&key).await {
            tracing::debug!(cache = %self.name, key = %key, "Local cache hit");
            return Ok(hit);
        }

        let load = Load {
            name: self.name.clone(),
            key: key.clone(),
            ttl: self.ttl,
            source: Arc::clone(&self.source),
            client: self.client.clone(),
        };
        self.flights.run(&key, load.run(input)).await
    }

    /// Removes the cached result for `input` from both tiers and its tags
    ///
    /// Tag cleanup needs the stored value to know its tags; if the value has
    /// already expired the memberships are left for `sweep_tag` or tag expiry.
    /// Each tag is cleaned independently and failures are reported, not
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be read or deleted.
    pub async fn clear(&self, input: &S::Input) -> Result<(), CacheError> {
        let key = self.key_for(input);
        let inner = &self.client.inner;
        let mut conn = inner.redis.get_connection();

        let stored: Option<String> = conn.get(&key).await?;
        conn.del::<_, ()>(&key).await?;
        inner.local.invalidate(&key).await;

        if let Some(raw) = stored {
            match codec::decode::<S::Output>(&raw) {
                Ok(value) => {
                    for tag in self.source.tags(&value, input) {
                        if let Err(e) = conn.srem::<_, _, ()>(inner.keys.tag(&tag), &key).await {
                            self.client.report(e.into(), "cache.clear.tag");
                        }
                    }
                }
                Err(e) => self.client.report(e.into(), "cache.clear.decode"),
            }
        }

        self.client.broadcast(vec![key]).await;
        Ok(())
    }

    /// `clear` in the background; failures are reported
    pub fn clear_background(&self, input: S::Input) -> JoinHandle<()> {
        let cache = self.clone();
        BackgroundTask::spawn(self.client.reporter(), "cache.clear", async move {
            cache.clear(&input).await
        })
    }

    /// Same as `CacheClient::clear_by_tag`
    ///
    /// # Errors
    ///
    /// Returns an error if the tag cannot be read or deleted.
    pub async fn clear_by_tag(&self, tag: &str) -> Result<usize, CacheError> {
        self.client.clear_by_tag(tag).await
    }

    /// Same as `CacheClient::clear_by_tag_background`
    pub fn clear_by_tag_background(&self, tag: impl Into<String>) -> JoinHandle<()> {
        self.client.clear_by_tag_background(tag)
    }

    /// Same as `CacheClient::sweep_tag`
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn sweep_tag(&self, tag: &str) -> Result<u64, CacheError> {
        self.client.sweep_tag(tag).await
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Redis key holding the result for `input`
    pub fn key_for(&self, input: &S::Input) -> String {
        self.client.inner.keys.value(&self.name, &self.source.hash(input))
    }
}

/// One remote read-through, run inside a flight
struct Load<S: CacheSource> {
    name: String,
    key: String,
    ttl: Duration,
    source: Arc<S>,
    client: CacheClient,
}

impl<S: CacheSource> Load<S> {
    async fn run(self, input: S::Input) -> Result<S::Output, CacheError> {
        let inner = &self.client.inner;
        let mut conn = inner.redis.get_connection();

        let (stored, pttl): (Option<String>, i64) = redis::pipe()
            .get(&self.key)
            .pttl(&self.key)
            .query_async(&mut conn)
            .await?;

        if let Some(raw) = stored {
            match codec::decode::<S::Output>(&raw) {
                Ok(value) => {
                    let remaining = if pttl > 0 {
                        Duration::from_millis(pttl as u64)
                    } else {
                        self.ttl
                    };
                    inner.local.insert(self.key.clone(), value.clone(), remaining).await;

                    tracing::debug!(cache = %self.name, key = %self.key, "Remote cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(
                        cache = %self.name,
                        key = %self.key,
                        error = %e,
                        "Undecodable cache entry, recomputing"
                    );
                }
            }
        }

        tracing::debug!(cache = %self.name, key = %self.key, "Cache miss");

        let ttl = TtlControl::new(self.ttl);
        let value = self.source.provide(&input, &ttl).await?;
        let ttl = ttl.ttl();
        let millis = ttl_millis(ttl);
        let ttl = Duration::from_millis(millis);

        let encoded = codec::encode(&value)?;
        redis::cmd("SET")
            .arg(&self.key)
            .arg(encoded)
            .arg("PX")
            .arg(millis)
            .query_async::<_, ()>(&mut conn)
            .await?;

        let tags = self.source.tags(&value, &input);
        if !tags.is_empty() {
            let tag_keys: Vec<String> = tags.iter().map(|tag| inner.keys.tag(tag)).collect();
            let sweep = inner.config.stale_tags == StaleTagPolicy::Sweep;
            inner
                .scripts
                .register(&mut conn, &tag_keys, &self.key, ttl, sweep)
                .await?;
        }

        inner
            .local
            .insert(self.key.clone(), value.clone(), ttl)
            .await;

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::client::test_url;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        id: u64,
        generated_at: chrono::DateTime<chrono::Utc>,
    }

    struct Reports {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CacheSource for Reports {
        type Input = u64;
        type Output = Report;

        fn hash(&self, id: &u64) -> String {
            id.to_string()
        }

        async fn provide(&self, id: &u64, _ttl: &TtlControl) -> anyhow::Result<Report> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(Report {
                id: *id,
                generated_at: chrono::Utc::now(),
            })
        }

        fn tags(&self, report: &Report, _id: &u64) -> Vec<String> {
            vec!["reports".to_string(), format!("report:{}", report.id)]
        }
    }

    async fn client() -> CacheClient {
        let redis = RedisClient::new(RedisConfig::new(test_url())).await.unwrap();
        let config = CacheClientConfig {
            version: format!("test-{}", Uuid::new_v4()),
            ..CacheClientConfig::default()
        };
        CacheClient::new(redis, config)
    }

    fn reports(client: &CacheClient) -> (SharedCache<Reports>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = client.cache("reports", Duration::from_secs(5), Reports { calls: calls.clone() });
        (cache, calls)
    }

    #[test]
    fn test_stale_tag_policy_parse() {
        assert_eq!("ignore".parse::<StaleTagPolicy>(), Ok(StaleTagPolicy::Ignore));
        assert_eq!("SWEEP".parse::<StaleTagPolicy>(), Ok(StaleTagPolicy::Sweep));
        assert!("sometimes".parse::<StaleTagPolicy>().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = CacheClientConfig::default();
        assert_eq!(config.version, "v1");
        assert_eq!(config.local_capacity, 10_000);
        assert!(config.broadcast_invalidations);
        assert_eq!(config.stale_tags, StaleTagPolicy::Ignore);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_parallel_runs_share_one_provider_call() {
        let client = client().await;
        let (cache, calls) = reports(&client);

        let (a, b) = tokio::join!(cache.run(1), cache.run(1));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_remote_hit_after_local_eviction() {
        let client = client().await;
        let (cache, calls) = reports(&client);

        let first = cache.run(2).await.unwrap();
        client.local().clear().await;
        let second = cache.run(2).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_clear_by_tag_removes_members_and_tag() {
        let client = client().await;
        let (cache, calls) = reports(&client);

        let a = cache.key_for(&3);
        let b = cache.key_for(&4);
        cache.run(3).await.unwrap();
        cache.run(4).await.unwrap();

        let removed = client.clear_by_tag("reports").await.unwrap();
        assert_eq!(removed, 2);

        let mut conn = client.inner.redis.get_connection();
        let exists: usize = conn.exists(vec![a.clone(), b.clone()]).await.unwrap();
        let tag_exists: bool = conn.exists(client.keys().tag("reports")).await.unwrap();
        assert_eq!(exists, 0);
        assert!(!tag_exists);
        assert_eq!(client.local().get::<Report>(&a).await, None);
        assert_eq!(client.local().get::<Report>(&b).await, None);

        cache.run(3).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_clear_removes_value_and_memberships() {
        let client = client().await;
        let (cache, _calls) = reports(&client);

        cache.run(5).await.unwrap();
        cache.clear(&5).await.unwrap();

        let mut conn = client.inner.redis.get_connection();
        let members: Vec<String> = conn.smembers(client.keys().tag("report:5")).await.unwrap();
        let value: Option<String> = conn.get(cache.key_for(&5)).await.unwrap();

        assert!(members.is_empty());
        assert!(value.is_none());
    }
}
