/// Process-local cache tier and the Local-Only Cache
///
/// `LocalStore` is a bounded in-memory map (moka) whose entries each carry
/// their own expiry. Values are stored type-erased; a read with the wrong
/// type is a miss. Eviction under capacity pressure follows moka's
/// frequency-aware policy, which approximates recency-based eviction.
///
/// `LocalCache` is the Local-Only Cache: the same single-flight and TTL
/// semantics as `SharedCache`, with no Redis tier and no tags.

use super::single_flight::SingleFlight;
use super::{CacheError, CacheSource, TtlControl};
use moka::future::Cache;
use moka::Expiry;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of entries kept in a local tier
pub const DEFAULT_LOCAL_CAPACITY: u64 = 10_000;

#[derive(Clone)]
struct LocalEntry {
    value: Arc<dyn Any + Send + Sync>,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, entry: &LocalEntry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Bounded, expiring, type-erased local store
#[derive(Clone)]
pub struct LocalStore {
    entries: Cache<String, LocalEntry>,
    capacity: u64,
}

impl LocalStore {
    /// Creates a store holding at most `capacity` entries
    pub fn new(capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .expire_after(EntryExpiry)
            .build();

        Self { entries, capacity }
    }

    /// Reads `key` as a `T`
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.entries.get(key).await?;
        entry.value.downcast_ref::<T>().cloned()
    }

    /// Stores `value` under `key` for `ttl`
    ///
    /// A zero TTL stores nothing.
    pub async fn insert<T>(&self, key: String, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        if ttl.is_zero() {
            return;
        }

        let entry = LocalEntry {
            value: Arc::new(value),
            ttl,
        };
        self.entries.insert(key, entry).await;
    }

    /// Drops `key`
    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    /// Drops every entry
    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    /// Number of live entries
    pub async fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_CAPACITY)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

/// Single-flight cache kept entirely in process memory
pub struct LocalCache<S: CacheSource> {
    name: String,
    ttl: Duration,
    source: Arc<S>,
    store: LocalStore,
    flights: SingleFlight<S::Output>,
}

impl<S: CacheSource> LocalCache<S> {
    /// Creates a cache named `name` holding at most `capacity` results
    pub fn new(name: impl Into<String>, ttl: Duration, capacity: u64, source: S) -> Self {
        Self {
            name: name.into(),
            ttl,
            source: Arc::new(source),
            store: LocalStore::new(capacity),
            flights: SingleFlight::new(),
        }
    }

    /// Returns the cached result for `input`, computing it at most once
    ///
    /// # Errors
    ///
    /// Returns the provider's error; it is shared with every concurrent caller
    /// for the same input and nothing is stored.
    pub async fn run(&self, input: S::Input) -> Result<S::Output, CacheError> {
        let key = self.key_for(&input);

        if let Some(flight) = self.flights.join(&key) {
            return flight.await;
        }

        if let Some(hit) = self.store.get::<S::Output>(&key).await {
            tracing::debug!(cache = %self.name, key = %key, "Local cache hit");
            return Ok(hit);
        }

        let source = Arc::clone(&self.source);
        let store = self.store.clone();
        let default_ttl = self.ttl;
        let entry_key = key.clone();

        self.flights
            .run(&key, async move {
                let ttl = TtlControl::new(default_ttl);
                let value = source.provide(&input, &ttl).await?;
                store.insert(entry_key, value.clone(), ttl.ttl()).await;
                Ok(value)
            })
            .await
    }

    /// Forgets the cached result for `input`
    pub async fn clear(&self, input: &S::Input) {
        self.store.invalidate(&self.key_for(input)).await;
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    fn key_for(&self, input: &S::Input) -> String {
        format!("{}:{}", self.name, self.source.hash(input))
    }
}
