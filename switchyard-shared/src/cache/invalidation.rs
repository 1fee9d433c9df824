/// Cross-process eviction of local-tier entries
///
/// Deleting a value from Redis does not reach the local tiers of other
/// processes; they would keep serving it until it expires locally. Clearing
/// publishes the removed keys on the cache's invalidation channel and every
/// subscribed `CacheClient` evicts them from its own store.
///
/// Delivery is best effort. A process that misses a message still drops the
/// entry when its local TTL (never longer than the remote one) runs out.

use super::local::LocalStore;
use crate::redis::client::RedisClient;
use crate::retry::{compute_retry_backoff_ms, sleep_or_shutdown, RECONNECT_BACKOFF_MS};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Message published on the invalidation channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Client that performed the clear
    pub origin: String,

    /// Value keys that were removed
    pub keys: Vec<String>,
}

/// Subscribes to `channel` until `shutdown` fires, evicting announced keys
///
/// Messages from `origin` itself are skipped: the publisher already evicted
/// them. The subscription is reopened with backoff when the connection drops.
pub async fn listen(
    redis: RedisClient,
    channel: String,
    origin: String,
    local: LocalStore,
    shutdown: CancellationToken,
) {
    let mut failure_streak: u32 = 0;

    loop {
        let opened = tokio::select! {
            _ = shutdown.cancelled() => return,
            opened = redis.pubsub() => opened,
        };

        match opened {
            Ok(mut pubsub) => match pubsub.subscribe(&channel).await {
                Ok(()) => {
                    tracing::debug!(channel = %channel, "Subscribed to cache invalidations");
                    failure_streak = 0;

                    let mut messages = pubsub.on_message();
                    loop {
                        let msg = tokio::select! {
                            _ = shutdown.cancelled() => return,
                            msg = messages.next() => msg,
                        };

                        let Some(msg) = msg else { break };
                        match msg.get_payload::<String>() {
                            Ok(payload) => apply(&payload, &origin, &local).await,
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Unreadable invalidation message");
                            }
                        }
                    }

                    tracing::warn!(channel = %channel, "Invalidation subscription closed, resubscribing");
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Failed to subscribe to cache invalidations");
                }
            },
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Failed to open pub/sub connection");
            }
        }

        failure_streak = failure_streak.saturating_add(1);
        sleep_or_shutdown(&shutdown, compute_retry_backoff_ms(RECONNECT_BACKOFF_MS, failure_streak)).await;
        if shutdown.is_cancelled() {
            return;
        }
    }
}

/// Evicts the keys in `payload` unless it was sent by `origin`
pub async fn apply(payload: &str, origin: &str, local: &LocalStore) {
    let message: Invalidation = match serde_json::from_str(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed invalidation payload");
            return;
        }
    };

    if message.origin == origin {
        return;
    }

    for key in &message.keys {
        local.invalidate(key).await;
    }

    tracing::debug!(
        origin = %message.origin,
        count = message.keys.len(),
        "Evicted local entries on remote invalidation"
    );
}
