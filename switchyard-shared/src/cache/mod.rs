/// Shared cache with single-flight computation and tag invalidation
///
/// This module memoizes expensive reads across every process that shares a
/// Redis instance.
///
/// # Architecture
///
/// ```text
/// run(input)
///   │
///   ├─ in-flight for key? ──────────── join it
///   ├─ local tier hit? ─────────────── return (no round-trip)
///   └─ new flight
///        ├─ Redis GET+PTTL hit ─────── fill local tier, return
///        └─ miss ── provide() ── SET PX ── tag sets ── local tier
/// ```
///
/// - **Single-flight**: at most one computation per key per process; every
///   concurrent caller shares its result, including its error.
/// - **Two tiers**: a bounded process-local store in front of Redis. Local
///   entries expire no later than the Redis entry they were read from.
/// - **Tags**: each tag is a Redis set of value keys; `clear_by_tag` deletes
///   every member and then the set itself.
///
/// There is no cross-process lock. Two processes missing the same key both
/// compute and both write; providers are expected to be idempotent.
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use std::time::Duration;
/// use switchyard_shared::cache::{CacheClient, CacheClientConfig, CacheSource, TtlControl};
/// use switchyard_shared::redis::{RedisClient, RedisConfig};
///
/// struct Profiles;
///
/// #[async_trait]
/// impl CacheSource for Profiles {
///     type Input = u64;
///     type Output = String;
///
///     fn hash(&self, id: &u64) -> String {
///         id.to_string()
///     }
///
///     async fn provide(&self, id: &u64, _ttl: &TtlControl) -> anyhow::Result<String> {
///         Ok(format!("profile-{}", id))
///     }
///
///     fn tags(&self, _profile: &String, id: &u64) -> Vec<String> {
///         vec![format!("user:{}", id)]
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let redis = RedisClient::new(RedisConfig::new("redis://localhost:6379")).await?;
/// let client = CacheClient::new(redis, CacheClientConfig::default());
/// let profiles = client.cache("profiles", Duration::from_secs(60), Profiles);
///
/// let profile = profiles.run(7).await?;
/// client.clear_by_tag("user:7").await?;
/// # Ok(())
/// # }
/// ```

pub mod invalidation;
pub mod keys;
pub mod local;
pub mod shared;
pub mod single_flight;
pub mod tags;

use crate::codec::CodecError;
use async_trait::async_trait;
use redis::RedisError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Re-export common types
pub use keys::CacheKeys;
pub use local::{LocalCache, LocalStore};
pub use shared::{CacheClient, CacheClientConfig, SharedCache, StaleTagPolicy};
pub use single_flight::SingleFlight;

/// Cache errors
///
/// Cloneable so that one failed flight can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Redis unreachable or command failed
    #[error("Redis error: {0}")]
    Redis(Arc<RedisError>),

    /// Value could not be encoded
    #[error("Codec error: {0}")]
    Codec(Arc<CodecError>),

    /// The provider failed
    #[error("Provider error: {0:#}")]
    Provider(Arc<anyhow::Error>),

    /// The computation panicked or was cancelled
    #[error("Computation aborted: {0}")]
    Aborted(String),
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        CacheError::Redis(Arc::new(err))
    }
}

impl From<CodecError> for CacheError {
    fn from(err: CodecError) -> Self {
        CacheError::Codec(Arc::new(err))
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Provider(Arc::new(err))
    }
}

/// Something whose results are worth caching
#[async_trait]
pub trait CacheSource: Send + Sync + 'static {
    /// Argument of a computation
    type Input: Send + Sync + 'static;

    /// Result of a computation; must survive an encode/decode round trip
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Stable identity of `input` within this cache
    fn hash(&self, input: &Self::Input) -> String;

    /// Performs the expensive computation
    ///
    /// The provider may shorten or extend the lifetime of its own result
    /// through `ttl` before returning.
    async fn provide(&self, input: &Self::Input, ttl: &TtlControl) -> anyhow::Result<Self::Output>;

    /// Tags the result is filed under
    fn tags(&self, _output: &Self::Output, _input: &Self::Input) -> Vec<String> {
        Vec::new()
    }
}

/// TTL handle passed to a provider
#[derive(Debug)]
pub struct TtlControl {
    millis: AtomicU64,
}

impl TtlControl {
    /// Creates a handle holding `default`
    pub fn new(default: Duration) -> Self {
        Self {
            millis: AtomicU64::new(default.as_millis() as u64),
        }
    }

    /// Overrides the TTL of the value being computed
    pub fn set_ttl(&self, ttl: Duration) {
        self.millis.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    /// Current TTL
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }
}

/// SHA-256 hex digest of the JSON form of `input`
///
/// Convenient default for `CacheSource::hash` when the input is serializable.
/// Map ordering matters, so prefer ordered maps in hashed inputs.
pub fn hash_input<T: Serialize + ?Sized>(input: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(input)?;
    Ok(hex::encode(Sha256::digest(&json)))
}
