/// Per-key single-flight execution
///
/// The first caller for a key spawns the computation; callers arriving while
/// it runs receive a clone of the same shared future. The key is removed from
/// the registry when the computation settles, whether it succeeded, failed,
/// or panicked, so the next caller after that starts a fresh one.
///
/// The computation runs on its own task: a caller that stops waiting does not
/// cancel it for the others. The caller's execution context is carried into
/// that task.

use super::CacheError;
use crate::context::{current_context, with_context};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared handle to an in-flight computation
pub type Flight<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

type Registry<T> = Arc<Mutex<HashMap<String, Flight<T>>>>;

/// Registry of in-flight computations
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: Registry<T>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the computation running for `key`, if any
    pub fn join(&self, key: &str) -> Option<Flight<T>> {
        lock(&self.inflight).get(key).cloned()
    }

    /// Joins the computation for `key`, starting `work` if none is running
    ///
    /// `work` is dropped unpolled when a computation already exists.
    pub fn run<F>(&self, key: &str, work: F) -> Flight<T>
    where
        F: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let mut inflight = lock(&self.inflight);
        if let Some(existing) = inflight.get(key) {
            return existing.clone();
        }

        let deregister = Deregister {
            registry: Arc::clone(&self.inflight),
            key: key.to_string(),
        };
        let context = current_context();

        let handle = tokio::spawn(async move {
            let _deregister = deregister;
            match context {
                Some(ctx) => with_context(ctx, work).await,
                None => work.await,
            }
        });

        let flight = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CacheError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        inflight.insert(key.to_string(), flight.clone());
        flight
    }

    /// Number of computations currently running
    pub fn len(&self) -> usize {
        lock(&self.inflight).len()
    }

    /// Whether nothing is running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

/// Removes a key from the registry when the computation task ends
struct Deregister<T: Clone + Send + Sync + 'static> {
    registry: Registry<T>,
    key: String,
}

impl<T: Clone + Send + Sync + 'static> Drop for Deregister<T> {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.key);
    }
}

fn lock<T: Clone + Send + Sync + 'static>(
    registry: &Registry<T>,
) -> MutexGuard<'_, HashMap<String, Flight<T>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
