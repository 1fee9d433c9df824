/// Event stream bus on Redis Streams
///
/// A `StreamBus` publishes domain events to one stream and creates
/// consumer-group receivers for it (see `stream_receiver`).
///
/// # Architecture
///
/// ```text
/// send(payload)
///     │  encode ── XADD <stream> * payload <envelope>
///     │  arm trim timer (at most one pending per bus)
///     ▼
/// Redis Stream ──> group A ──> consumer-1, consumer-2 ...
///              └─> group B ──> consumer-3 ...
///
/// trim timer ── sleep(trim_delay) ── XTRIM <stream> MAXLEN ~ max_len
/// ```
///
/// Publishing uses its own lazily opened connection. Trimming is best effort:
/// failures go to the error reporter and never reach `send`.
///
/// # Example
///
/// ```no_run
/// use serde::{Deserialize, Serialize};
/// use switchyard_shared::redis::client::{LazyRedis, RedisConfig};
/// use switchyard_shared::redis::stream_bus::{StreamBus, StreamConfig};
///
/// #[derive(Serialize, Deserialize)]
/// struct SessionClosed {
///     session_id: String,
/// }
///
/// # async fn example() -> anyhow::Result<()> {
/// let redis = LazyRedis::new(RedisConfig::from_env()?);
/// let bus = StreamBus::new(redis, StreamConfig::from_env("sessions"));
///
/// let id = bus.send(&SessionClosed { session_id: "s-1".into() }).await?;
/// println!("Published {}", id);
/// # Ok(())
/// # }
/// ```

use crate::codec::{self, CodecError};
use crate::config::env_parse;
use crate::redis::client::{LazyRedis, RedisClientError};
use crate::report::{default_reporter, BackgroundTask, SharedReporter};
use redis::streams::StreamMaxlen;
use redis::{AsyncCommands, RedisError};
use serde::Serialize;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Field holding the encoded payload of every entry
pub const PAYLOAD_FIELD: &str = "payload";

/// Stream bus errors
#[derive(Error, Debug)]
pub enum StreamError {
    /// Connection could not be established
    #[error("Redis connection error: {0}")]
    Connection(#[from] RedisClientError),

    /// Raw Redis error
    #[error("Redis command error: {0}")]
    Redis(#[from] RedisError),

    /// Payload could not be encoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Write failed after retries
    #[error("Failed to append to stream after {attempts} attempts: {last_error}")]
    WriteFailed { attempts: u32, last_error: String },
}

/// Stream configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream key
    pub name: String,

    /// Redis URL for this stream; the process-wide connection when unset
    pub redis_url: Option<String>,

    /// Approximate length the stream is trimmed to
    pub max_len: usize,

    /// Delay between the first send and the trim it triggers
    pub trim_delay: Duration,

    /// XREADGROUP BLOCK timeout in milliseconds
    pub block_ms: usize,

    /// Entries read per iteration
    pub batch_size: usize,

    /// Idle time after which another consumer may claim a pending entry
    pub claim_idle_ms: u64,

    /// XADD retries after the first attempt
    pub max_retries: u32,

    /// Base delay between XADD retries in milliseconds
    pub base_retry_delay_ms: u64,

    /// Maximum delay between XADD retries in milliseconds
    pub max_retry_delay_ms: u64,
}

impl StreamConfig {
    /// Creates a configuration for stream `name` with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            redis_url: None,
            max_len: 100_000,
            trim_delay: Duration::from_secs(60),
            block_ms: 1000,
            batch_size: 20,
            claim_idle_ms: 60_000,
            max_retries: 3,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 5000,
        }
    }

    /// Loads configuration for stream `name` from environment variables
    ///
    /// Reads `STREAM_REDIS_URL`, `STREAM_MAX_LEN`, `STREAM_TRIM_DELAY_SECS`,
    /// `STREAM_BLOCK_MS`, `STREAM_BATCH_SIZE` and `STREAM_CLAIM_IDLE_MS`.
    pub fn from_env(name: impl Into<String>) -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::new(name);
        Self {
            redis_url: env::var("STREAM_REDIS_URL").ok().filter(|url| !url.is_empty()),
            max_len: env_parse("STREAM_MAX_LEN", defaults.max_len),
            trim_delay: Duration::from_secs(env_parse(
                "STREAM_TRIM_DELAY_SECS",
                defaults.trim_delay.as_secs(),
            )),
            block_ms: env_parse("STREAM_BLOCK_MS", defaults.block_ms),
            batch_size: env_parse("STREAM_BATCH_SIZE", defaults.batch_size),
            claim_idle_ms: env_parse("STREAM_CLAIM_IDLE_MS", defaults.claim_idle_ms),
            ..defaults
        }
    }
}

pub(crate) struct BusInner {
    pub(crate) config: StreamConfig,
    pub(crate) redis: LazyRedis,
    publisher: LazyRedis,
    pub(crate) reporter: SharedReporter,
    trim_armed: AtomicBool,
}

/// Publisher and receiver factory for one stream
#[derive(Clone)]
pub struct StreamBus {
    pub(crate) inner: Arc<BusInner>,
}

impl StreamBus {
    /// Creates a bus; nothing connects until first use
    ///
    /// `redis` is the process-wide connection. When `config.redis_url` is set
    /// the bus connects there instead.
    pub fn new(redis: LazyRedis, config: StreamConfig) -> Self {
        Self::with_reporter(redis, config, default_reporter())
    }

    /// Creates a bus that sends best-effort failures to `reporter`
    pub fn with_reporter(redis: LazyRedis, config: StreamConfig, reporter: SharedReporter) -> Self {
        let redis = match &config.redis_url {
            Some(url) => LazyRedis::new(redis.config().with_url(url.clone())),
            None => redis,
        };
        let publisher = LazyRedis::new(redis.config().clone());

        Self {
            inner: Arc::new(BusInner {
                config,
                redis,
                publisher,
                reporter,
                trim_armed: AtomicBool::new(false),
            }),
        }
    }

    /// Appends `payload` to the stream
    ///
    /// Returns the entry id. The first send after a trim has run arms the next
    /// trim.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded, the publishing
    /// connection cannot be opened, or XADD keeps failing after retries.
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<String, StreamError> {
        let encoded = codec::encode(payload)?;

        let stream_id = self
            .xadd_with_retry(&encoded)
            .await
            .map_err(|e| match e {
                StreamError::Redis(e) => StreamError::WriteFailed {
                    attempts: self.inner.config.max_retries + 1,
                    last_error: e.to_string(),
                },
                other => other,
            })?;

        tracing::debug!(
            stream = %self.inner.config.name,
            stream_id = %stream_id,
            "Published message to Redis Stream"
        );

        self.arm_trim();
        Ok(stream_id)
    }

    /// Trims the stream now to about `max_len` entries
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn trim(&self) -> Result<usize, StreamError> {
        trim(&self.inner).await
    }

    /// Number of entries in the stream
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn len(&self) -> Result<usize, StreamError> {
        let client = self.inner.redis.get().await?;
        let mut conn = client.get_connection();
        Ok(conn.xlen(&self.inner.config.name).await?)
    }

    /// Whether a trim timer is pending
    pub fn trim_pending(&self) -> bool {
        self.inner.trim_armed.load(Ordering::Acquire)
    }

    /// Stream configuration
    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Internal: XADD with exponential backoff between attempts
    async fn xadd_with_retry(&self, encoded: &str) -> Result<String, StreamError> {
        let config = &self.inner.config;
        let client = self.inner.publisher.get().await?;
        let items = vec![(PAYLOAD_FIELD, encoded)];

        let mut attempt = 0;
        loop {
            let mut conn = client.get_connection();
            match conn.xadd(&config.name, "*", &items).await {
                Ok(id) => return Ok(id),
                Err(e) if attempt < config.max_retries => {
                    let delay = retry_delay(config, attempt);
                    tracing::warn!(
                        stream = %config.name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "XADD failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Installs the trim timer unless one is already pending
    fn arm_trim(&self) {
        if self.inner.trim_armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        BackgroundTask::spawn(Arc::clone(&self.inner.reporter), "stream.trim", async move {
            tokio::time::sleep(inner.config.trim_delay).await;
            inner.trim_armed.store(false, Ordering::Release);
            trim(&inner).await.map(|_| ())
        });
    }
}

async fn trim(inner: &BusInner) -> Result<usize, StreamError> {
    let client = inner.redis.get().await?;
    let mut conn = client.get_connection();

    let removed: usize = conn
        .xtrim(&inner.config.name, StreamMaxlen::Approx(inner.config.max_len))
        .await?;

    tracing::debug!(
        stream = %inner.config.name,
        removed,
        max_len = inner.config.max_len,
        "Trimmed Redis Stream"
    );
    Ok(removed)
}

fn retry_delay(config: &StreamConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    let millis = config
        .base_retry_delay_ms
        .saturating_mul(factor)
        .min(config.max_retry_delay_ms);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::client::{test_url, RedisConfig};
    use crate::report::testing::RecordingReporter;
    use uuid::Uuid;

    fn test_bus(name: &str, trim_delay: Duration) -> StreamBus {
        let mut config = StreamConfig::new(name);
        config.trim_delay = trim_delay;
        StreamBus::new(LazyRedis::new(RedisConfig::new(test_url())), config)
    }

    #[test]
    fn test_config_defaults() {
        let config = StreamConfig::new("events");

        assert_eq!(config.name, "events");
        assert!(config.redis_url.is_none());
        assert_eq!(config.max_len, 100_000);
        assert_eq!(config.trim_delay, Duration::from_secs(60));
        assert_eq!(config.block_ms, 1000);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.claim_idle_ms, 60_000);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = StreamConfig::new("events");

        assert_eq!(retry_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(retry_delay(&config, 10), Duration::from_millis(5000));
    }

    #[test]
    fn test_explicit_url_overrides_process_connection() {
        let process = LazyRedis::new(RedisConfig::new("redis://process:6379"));
        let mut config = StreamConfig::new("events");
        config.redis_url = Some("redis://streams:6379".to_string());

        let bus = StreamBus::new(process, config);

        assert_eq!(bus.inner.redis.config().url, "redis://streams:6379");
        assert_eq!(bus.inner.publisher.config().url, "redis://streams:6379");
        assert!(!bus.inner.publisher.is_connected());
    }

    #[tokio::test]
    async fn test_send_failure_does_not_arm_trim() {
        let mut redis = RedisConfig::new("redis://127.0.0.1:1");
        redis.connection_timeout_secs = 1;
        let bus = StreamBus::new(LazyRedis::new(redis), StreamConfig::new("events"));

        let result = bus.send(&"hello").await;

        assert!(matches!(result, Err(StreamError::Connection(_))));
        assert!(!bus.trim_pending());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_send_appends_envelope() {
        let name = format!("test:stream:{}", Uuid::new_v4());
        let bus = test_bus(&name, Duration::from_secs(60));

        let id = bus.send(&serde_json::json!({"event": "x"})).await.unwrap();

        assert!(id.contains('-'));
        assert_eq!(bus.len().await.unwrap(), 1);
        assert!(bus.trim_pending());

        let client = bus.inner.redis.get().await.unwrap();
        let _: () = client.get_connection().del(&name).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires running Redis instance
    async fn test_one_trim_timer_per_bus() {
        let name = format!("test:stream:{}", Uuid::new_v4());
        let recorder = Arc::new(RecordingReporter::default());
        let mut config = StreamConfig::new(&name);
        config.trim_delay = Duration::from_millis(100);
        config.max_len = 1;
        let bus = StreamBus::with_reporter(
            LazyRedis::new(RedisConfig::new(test_url())),
            config,
            recorder.clone(),
        );

        for i in 0..3 {
            bus.send(&i).await.unwrap();
            assert!(bus.trim_pending());
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!bus.trim_pending());
        assert!(recorder.reports.lock().unwrap().is_empty());

        bus.send(&4).await.unwrap();
        assert!(bus.trim_pending());

        let client = bus.inner.redis.get().await.unwrap();
        let _: () = client.get_connection().del(&name).await.unwrap();
    }
}
