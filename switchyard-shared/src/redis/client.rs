/// Redis connection provider
///
/// This module owns the process's Redis handles:
/// - A shared multiplexed connection via `redis::aio::ConnectionManager`
/// - Isolated connections for long blocking reads (XREADGROUP BLOCK, BLMOVE)
/// - Dedicated pub/sub connections
/// - A background supervisor that logs transport failures and recovery
///
/// Two acquisition styles are offered. `RedisClient::new` connects eagerly and
/// returns the handle. `LazyRedis` connects on first use and memoizes the
/// handle for every later call.
///
/// # Example
///
/// ```no_run
/// use switchyard_shared::redis::client::{LazyRedis, RedisClient, RedisConfig};
///
/// # async fn example() -> anyhow::Result<()> {
/// // Eager
/// let client = RedisClient::new(RedisConfig::from_env()?).await?;
/// assert!(client.ping().await?);
///
/// // Lazy: nothing happens until the first `get`
/// let lazy = LazyRedis::new(RedisConfig::from_env()?);
/// let same = lazy.get().await?;
/// # Ok(())
/// # }
/// ```

use redis::aio::{ConnectionManager, MultiplexedConnection, PubSub};
use redis::{Client, RedisError};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Redis client errors
#[derive(Error, Debug)]
pub enum RedisClientError {
    /// Connection error
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    /// Command execution error
    #[error("Redis command error: {0}")]
    CommandError(String),

    /// Configuration error
    #[error("Redis configuration error: {0}")]
    ConfigError(String),

    /// Health check failed
    #[error("Redis health check failed: {0}")]
    HealthCheckFailed(String),
}

impl From<RedisError> for RedisClientError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            return RedisClientError::ConnectionError(format!("IO error: {}", err));
        }
        match err.kind() {
            redis::ErrorKind::ResponseError => {
                RedisClientError::CommandError(format!("Response error: {}", err))
            }
            _ => RedisClientError::CommandError(err.to_string()),
        }
    }
}

/// Redis configuration
///
/// Can be loaded from environment variables or constructed manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    ///
    /// Format: redis://[username:password@]host:port[/db]
    pub url: String,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Command timeout in seconds (health checks)
    pub command_timeout_secs: u64,

    /// Interval between supervisor health probes in seconds
    pub health_interval_secs: u64,
}

impl RedisConfig {
    /// Creates a configuration for `url` with default timeouts
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_timeout_secs: 5,
            command_timeout_secs: 10,
            health_interval_secs: 15,
        }
    }

    /// Creates a new Redis configuration from environment variables
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (required)
    /// - `REDIS_CONNECTION_TIMEOUT_SECS`: Connection timeout (default: 5)
    /// - `REDIS_COMMAND_TIMEOUT_SECS`: Command timeout (default: 10)
    /// - `REDIS_HEALTH_INTERVAL_SECS`: Supervisor probe interval (default: 15)
    ///
    /// # Errors
    ///
    /// Returns an error if REDIS_URL is not set.
    pub fn from_env() -> Result<Self, RedisClientError> {
        // Load .env if present
        dotenvy::dotenv().ok();

        let url = env::var("REDIS_URL").map_err(|_| {
            RedisClientError::ConfigError("REDIS_URL environment variable is required".to_string())
        })?;

        let defaults = Self::new(url);

        Ok(Self {
            connection_timeout_secs: crate::config::env_parse(
                "REDIS_CONNECTION_TIMEOUT_SECS",
                defaults.connection_timeout_secs,
            ),
            command_timeout_secs: crate::config::env_parse(
                "REDIS_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout_secs,
            ),
            health_interval_secs: crate::config::env_parse(
                "REDIS_HEALTH_INTERVAL_SECS",
                defaults.health_interval_secs,
            ),
            ..defaults
        })
    }

    /// Returns a copy pointing at a different server, keeping the timeouts
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }
}

/// Shared Redis handle
///
/// Cloning is cheap: every clone shares the same multiplexed connection and
/// supervisor. The supervisor stops once the last clone is dropped.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
    config: Arc<RedisConfig>,
    _supervisor: Arc<DropGuard>,
}

impl RedisClient {
    /// Connects immediately and returns the handle
    ///
    /// Connection failures are logged and returned to the caller. There is no
    /// retry here; callers that need one re-enter their own loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server cannot be reached
    /// within `connection_timeout_secs`.
    pub async fn new(config: RedisConfig) -> Result<Self, RedisClientError> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            tracing::error!(url = %sanitize_url(&config.url), error = %e, "Invalid Redis URL");
            RedisClientError::ConfigError(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_secs),
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| {
            tracing::error!(url = %sanitize_url(&config.url), "Redis connection timed out");
            RedisClientError::ConnectionError("Connection timed out".to_string())
        })?
        .map_err(|e| {
            tracing::error!(url = %sanitize_url(&config.url), error = %e, "Failed to connect to Redis");
            RedisClientError::ConnectionError(format!("Failed to connect to Redis: {}", e))
        })?;

        tracing::info!(
            "Redis client connected successfully to {}",
            sanitize_url(&config.url)
        );

        let config = Arc::new(config);
        let token = CancellationToken::new();
        tokio::spawn(supervise(manager.clone(), Arc::clone(&config), token.clone()));

        Ok(Self {
            client,
            manager,
            config,
            _supervisor: Arc::new(token.drop_guard()),
        })
    }

    /// Performs a health check by sending a PING command
    ///
    /// # Errors
    ///
    /// Returns an error if the PING command fails or times out.
    pub async fn ping(&self) -> Result<bool, RedisClientError> {
        let mut conn = self.manager.clone();
        ping_once(&mut conn, self.config.command_timeout_secs).await
    }

    /// Gets the shared multiplexed connection
    ///
    /// Never issue blocking commands on this handle; they would stall every
    /// other user of the connection. Use `isolated_connection` for those.
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Opens a dedicated connection for long blocking reads
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn isolated_connection(&self) -> Result<MultiplexedConnection, RedisClientError> {
        tokio::time::timeout(
            Duration::from_secs(self.config.connection_timeout_secs),
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| RedisClientError::ConnectionError("Connection timed out".to_string()))?
        .map_err(|e| {
            tracing::warn!(error = %e, "Failed to open isolated Redis connection");
            RedisClientError::from(e)
        })
    }

    /// Opens a dedicated pub/sub connection
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn pubsub(&self) -> Result<PubSub, RedisClientError> {
        let conn = self.client.get_async_connection().await?;
        Ok(conn.into_pubsub())
    }

    /// Gets the Redis configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Gets connection statistics
    pub async fn stats(&self) -> RedisStats {
        let healthy = self.ping().await.unwrap_or(false);

        RedisStats {
            healthy,
            url: sanitize_url(&self.config.url),
        }
    }
}

/// Lazily connected, memoized Redis handle
///
/// The first successful `get` connects; later calls return the same client.
/// A failed attempt is not memoized, so the next call tries again.
#[derive(Clone)]
pub struct LazyRedis {
    config: Arc<RedisConfig>,
    cell: Arc<OnceCell<RedisClient>>,
}

impl LazyRedis {
    /// Creates an accessor; no connection is made yet
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config: Arc::new(config),
            cell: Arc::new(OnceCell::new()),
        }
    }

    /// Wraps an already connected client
    pub fn ready(client: RedisClient) -> Self {
        Self {
            config: Arc::new(client.config().clone()),
            cell: Arc::new(OnceCell::new_with(Some(client))),
        }
    }

    /// Returns the memoized client, connecting on first use
    ///
    /// # Errors
    ///
    /// Returns the connection error of this attempt.
    pub async fn get(&self) -> Result<RedisClient, RedisClientError> {
        self.cell
            .get_or_try_init(|| RedisClient::new((*self.config).clone()))
            .await
            .cloned()
    }

    /// Whether a connection has been established
    pub fn is_connected(&self) -> bool {
        self.cell.initialized()
    }

    /// Configuration this accessor connects with
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// Redis connection statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStats {
    /// Whether Redis is healthy (responds to PING)
    pub healthy: bool,

    /// Sanitized Redis URL (credentials removed)
    pub url: String,
}

async fn ping_once(
    conn: &mut ConnectionManager,
    timeout_secs: u64,
) -> Result<bool, RedisClientError> {
    let result: Result<String, RedisError> = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        redis::cmd("PING").query_async(conn),
    )
    .await
    .map_err(|_| RedisClientError::HealthCheckFailed("PING command timed out".to_string()))?;

    match result {
        Ok(pong) if pong == "PONG" => Ok(true),
        Ok(other) => {
            tracing::warn!("Redis health check: unexpected response: {}", other);
            Ok(false)
        }
        Err(e) => Err(RedisClientError::HealthCheckFailed(e.to_string())),
    }
}

/// Logs transport failures and recoveries; never touches callers
async fn supervise(mut conn: ConnectionManager, config: Arc<RedisConfig>, token: CancellationToken) {
    let url = sanitize_url(&config.url);
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.health_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        match ping_once(&mut conn, config.command_timeout_secs).await {
            Ok(true) => {
                if failures > 0 {
                    tracing::info!(url = %url, failures, "Redis connection recovered");
                }
                failures = 0;
            }
            Ok(false) => {}
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!(
                    url = %url,
                    attempt = failures,
                    error = %e,
                    "Redis transport error, connection manager reconnecting"
                );
            }
        }
    }

    tracing::debug!(url = %url, "Redis supervisor stopped");
}

/// Sanitizes a Redis URL by removing credentials
///
/// Replaces username:password with ***:*** for logging.
pub fn sanitize_url(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end + 3];
            let host = &url[at_pos + 1..];
            return format!("{}***:***@{}", scheme, host);
        }
    }
    url.to_string()
}

#[cfg(test)]
pub(crate) fn test_url() -> String {
    env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}
