/// Redis integration: connections and the event stream bus
///
/// This module provides:
/// - Eager and lazily memoized connections with a reconnect supervisor
/// - Isolated connections for long blocking reads
/// - The stream bus: publishing with deferred trimming
/// - Consumer-group receivers with idle-entry reclamation
///
/// # Architecture
///
/// ```text
/// ┌─────────────┐
/// │  Service A  │ ──XADD──> <stream> ──XTRIM MAXLEN ~ (deferred)
/// └─────────────┘              │
///                              │ XREADGROUP (isolated connection, BLOCK)
///                              ▼
/// ┌─────────────┐      group "billing": consumer-1, consumer-2
/// │  Service B  │ <──  XACK / XAUTOCLAIM (shared connection)
/// └─────────────┘
/// ```
///
/// # Example
///
/// ```no_run
/// use switchyard_shared::redis::client::{RedisClient, RedisConfig};
///
/// # async fn example() -> anyhow::Result<()> {
/// // Create Redis client
/// let config = RedisConfig::from_env()?;
/// let client = RedisClient::new(config).await?;
///
/// // Health check
/// let healthy = client.ping().await?;
/// println!("Redis healthy: {}", healthy);
/// # Ok(())
/// # }
/// ```

pub mod client;
pub mod stream_bus;
pub mod stream_receiver;

// Re-export common types for convenience
pub use client::{LazyRedis, RedisClient, RedisClientError, RedisConfig, RedisStats};
pub use stream_bus::{StreamBus, StreamConfig, StreamError};
pub use stream_receiver::{
    processor_fn, ReceiverHandle, ReceiverOptions, StartFrom, StreamMessage, StreamProcessor,
};
