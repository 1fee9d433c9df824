/// Consumer-group receivers for a `StreamBus`
///
/// # Protocol
///
/// ```text
/// XGROUP CREATE <stream> <group> 0 MKSTREAM      (BUSYGROUP tolerated)
/// loop
///   XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >
///   every 50..=100 iterations (random):
///     XAUTOCLAIM <stream> <group> <consumer> <idle> <cursor> COUNT n
///   for each entry: wait for a free slot, process, XACK on success
/// ```
///
/// Blocking reads run on an isolated connection; acknowledgments and claims
/// use the shared one, so a pending read never delays them.
///
/// # Delivery
///
/// At least once, in approximate arrival order per group. Entries are
/// processed concurrently (up to `concurrency` at a time) and may complete out
/// of order; there is no per-key ordering. An entry whose processor fails
/// stays pending and is re-delivered to whichever consumer claims it after
/// `claim_idle_ms`. Entries that cannot be decoded are reported and
/// acknowledged so they do not circulate forever.
///
/// # Example
///
/// ```no_run
/// use serde::{Deserialize, Serialize};
/// use switchyard_shared::redis::client::{LazyRedis, RedisConfig};
/// use switchyard_shared::redis::stream_bus::{StreamBus, StreamConfig};
/// use switchyard_shared::redis::stream_receiver::{processor_fn, ReceiverOptions, StreamMessage};
///
/// #[derive(Serialize, Deserialize)]
/// struct SessionClosed {
///     session_id: String,
/// }
///
/// # async fn example() -> anyhow::Result<()> {
/// let bus = StreamBus::new(LazyRedis::new(RedisConfig::from_env()?), StreamConfig::new("sessions"));
///
/// let handle = bus
///     .create_receiver(
///         ReceiverOptions::new("billing").concurrency(4),
///         processor_fn(|msg: StreamMessage<SessionClosed>| async move {
///             println!("closing {}", msg.payload.session_id);
///             Ok::<(), anyhow::Error>(())
///         }),
///     )
///     .await?;
/// # handle.abort();
/// # Ok(())
/// # }
/// ```

use super::client::RedisClient;
use super::stream_bus::{BusInner, StreamBus, StreamError, PAYLOAD_FIELD};
use crate::codec;
use crate::retry::{compute_retry_backoff_ms, sleep_or_shutdown, RECONNECT_BACKOFF_MS};
use async_trait::async_trait;
use rand::Rng;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, RedisResult, Value};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CLAIM_EVERY_MIN: u64 = 50;
const CLAIM_EVERY_MAX: u64 = 100;

/// Where a newly created group starts reading
///
/// Only consulted when the group is created. An existing group keeps its own
/// position, so restarting a receiver never replays acknowledged entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Every entry still in the stream, including ones sent before the
    /// first receiver of the group was created
    #[default]
    Beginning,

    /// Only entries appended after the group is created
    Latest,
}

impl StartFrom {
    fn as_id(self) -> &'static str {
        match self {
            StartFrom::Latest => "$",
            StartFrom::Beginning => "0",
        }
    }
}

/// Receiver options
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Consumer group; one per logical subscriber
    pub group_id: String,

    /// Consumer name within the group; `consumer-<uuid>` when unset
    pub consumer_id: Option<String>,

    /// Entries processed at the same time
    pub concurrency: usize,

    /// Entries read per iteration; the stream's `batch_size` when unset
    pub batch_size: Option<usize>,

    /// Starting point used when the group does not exist yet
    pub start_from: StartFrom,
}

impl ReceiverOptions {
    /// Options for group `group_id` with defaults
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            consumer_id: None,
            concurrency: 10,
            batch_size: None,
            start_from: StartFrom::default(),
        }
    }

    /// Sets the consumer name
    pub fn consumer_id(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    /// Sets the processing width (at least one)
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the read batch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }

    /// Sets where a new group starts
    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }
}

/// A decoded stream entry
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage<T> {
    /// Stream entry id
    pub id: String,

    /// Decoded payload
    pub payload: T,
}

/// Handles messages delivered to a receiver
#[async_trait]
pub trait StreamProcessor<T>: Send + Sync + 'static {
    /// Processes one message; `Ok` acknowledges it
    async fn process(&self, message: StreamMessage<T>) -> anyhow::Result<()>;
}

/// Processor backed by an async closure
pub struct FnProcessor<F> {
    f: F,
}

/// Wraps an async closure as a `StreamProcessor`
pub fn processor_fn<F>(f: F) -> FnProcessor<F> {
    FnProcessor { f }
}

#[async_trait]
impl<T, F, Fut> StreamProcessor<T> for FnProcessor<F>
where
    T: Send + 'static,
    F: Fn(StreamMessage<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn process(&self, message: StreamMessage<T>) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

/// Running receiver
///
/// Dropping the handle leaves the receiver running for the life of the
/// process; `abort` stops it.
pub struct ReceiverHandle {
    consumer_id: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    /// Consumer name this receiver reads as
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Stops reading; messages already dispatched still finish
    pub fn abort(&self) {
        self.shutdown.cancel();
    }

    /// Waits until the read loop and its in-flight messages are done
    pub async fn stopped(self) {
        if let Err(e) = self.task.await {
            tracing::error!(consumer = %self.consumer_id, error = %e, "Receiver task failed");
        }
    }

    /// Whether the read loop has ended
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl StreamBus {
    /// Joins `options.group_id` and starts delivering messages to `processor`
    ///
    /// Returns once the group exists, so a message sent after this call is
    /// seen by the group.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis cannot be reached or the group cannot be
    /// created for any reason other than already existing.
    pub async fn create_receiver<T, P>(
        &self,
        options: ReceiverOptions,
        processor: P,
    ) -> Result<ReceiverHandle, StreamError>
    where
        T: DeserializeOwned + Send + 'static,
        P: StreamProcessor<T>,
    {
        let client = self.inner.redis.get().await?;
        let consumer_id = options
            .consumer_id
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        let mut conn = client.get_connection();
        ensure_group(&mut conn, &self.inner.config.name, &options.group_id, options.start_from).await?;

        let shutdown = CancellationToken::new();
        let receiver = Receiver {
            dispatch: Arc::new(Dispatch {
                bus: Arc::clone(&self.inner),
                client: client.clone(),
                group_id: options.group_id.clone(),
                consumer_id: consumer_id.clone(),
                processor,
                _payload: PhantomData,
            }),
            batch_size: options.batch_size.unwrap_or(self.inner.config.batch_size),
            concurrency: options.concurrency.max(1),
            start_from: options.start_from,
        };

        tracing::info!(
            stream = %self.inner.config.name,
            group = %options.group_id,
            consumer = %consumer_id,
            concurrency = receiver.concurrency,
            "Stream receiver started"
        );

        let task = tokio::spawn(receiver.run(shutdown.clone()));

        Ok(ReceiverHandle {
            consumer_id,
            shutdown,
            task,
        })
    }
}

/// Creates the group, treating "already exists" as success
async fn ensure_group<C: ConnectionLike + Send>(
    conn: &mut C,
    stream: &str,
    group: &str,
    start_from: StartFrom,
) -> RedisResult<()> {
    let created: RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(group)
        .arg(start_from.as_id())
        .arg("MKSTREAM")
        .query_async(conn)
        .await;

    match created {
        Ok(()) => {
            tracing::info!(stream = %stream, group = %group, "Consumer group created");
            Ok(())
        }
        Err(e) if is_busy_group(&e) => {
            tracing::trace!(stream = %stream, group = %group, "Consumer group already exists");
            Ok(())
        }
        Err(e) => {
            tracing::error!(stream = %stream, group = %group, error = %e, "Failed to create consumer group");
            Err(e)
        }
    }
}

fn is_busy_group(error: &RedisError) -> bool {
    error.code() == Some("BUSYGROUP") || error.to_string().contains("BUSYGROUP")
}

/// Entry as read from Redis; `fields` is `None` when the entry was deleted
/// while pending
#[derive(Debug)]
struct RawEntry {
    id: String,
    fields: Option<HashMap<String, String>>,
}

struct Receiver<T, P> {
    dispatch: Arc<Dispatch<T, P>>,
    batch_size: usize,
    concurrency: usize,
    start_from: StartFrom,
}

impl<T, P> Receiver<T, P>
where
    T: DeserializeOwned + Send + 'static,
    P: StreamProcessor<T>,
{
    async fn run(self, shutdown: CancellationToken) {
        let dispatch = &self.dispatch;
        let stream = dispatch.bus.config.name.clone();
        let permits = permit_count(self.concurrency);
        let semaphore = Arc::new(Semaphore::new(permits as usize));

        let mut reader: Option<MultiplexedConnection> = None;
        let mut failure_streak: u32 = 0;
        let mut iteration: u64 = 0;
        let mut next_claim = next_claim_after(0);
        let mut claim_cursor = "0-0".to_string();

        while !shutdown.is_cancelled() {
            if reader.is_none() {
                match dispatch.client.isolated_connection().await {
                    Ok(conn) => reader = Some(conn),
                    Err(e) => {
                        failure_streak += 1;
                        let backoff = compute_retry_backoff_ms(RECONNECT_BACKOFF_MS, failure_streak);
                        tracing::warn!(
                            stream = %stream,
                            consumer = %dispatch.consumer_id,
                            retry_backoff_ms = backoff,
                            error = %e,
                            "Failed to open stream reader connection"
                        );
                        sleep_or_shutdown(&shutdown, backoff).await;
                        continue;
                    }
                }
            }
            let Some(conn) = reader.as_mut() else { continue };

            let read = tokio::select! {
                _ = shutdown.cancelled() => break,
                read = read_new(conn, dispatch, self.batch_size) => read,
            };

            let mut batch = match read {
                Ok(batch) => {
                    if failure_streak > 0 {
                        tracing::info!(stream = %stream, consumer = %dispatch.consumer_id, "Stream reader recovered");
                    }
                    failure_streak = 0;
                    batch
                }
                Err(e) => {
                    failure_streak += 1;
                    let backoff = compute_retry_backoff_ms(RECONNECT_BACKOFF_MS, failure_streak);
                    tracing::warn!(
                        stream = %stream,
                        consumer = %dispatch.consumer_id,
                        failure_streak,
                        retry_backoff_ms = backoff,
                        error = %e,
                        "Stream read failed, reconnecting"
                    );
                    reader = None;
                    sleep_or_shutdown(&shutdown, backoff).await;

                    // The stream or group may have been deleted underneath us
                    let mut control = dispatch.client.get_connection();
                    if let Err(e) = ensure_group(&mut control, &stream, &dispatch.group_id, self.start_from).await {
                        tracing::warn!(stream = %stream, error = %e, "Could not re-create consumer group");
                    }
                    continue;
                }
            };

            iteration += 1;
            if iteration >= next_claim {
                next_claim = next_claim_after(iteration);
                match claim_idle(dispatch, &claim_cursor, self.batch_size).await {
                    Ok((cursor, claimed)) => {
                        if !claimed.is_empty() {
                            tracing::info!(
                                stream = %stream,
                                consumer = %dispatch.consumer_id,
                                count = claimed.len(),
                                "Claimed idle pending entries"
                            );
                        }
                        claim_cursor = cursor;
                        batch.extend(claimed);
                    }
                    Err(e) => {
                        tracing::warn!(stream = %stream, error = %e, "XAUTOCLAIM failed");
                    }
                }
            }

            for entry in batch {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => permit,
                };
                let Ok(permit) = permit else { break };

                let dispatch = Arc::clone(dispatch);
                tokio::spawn(async move {
                    dispatch.handle(entry).await;
                    drop(permit);
                });
            }
        }

        // Let dispatched messages finish before reporting the receiver stopped
        if let Err(e) = semaphore.acquire_many(permits).await {
            tracing::warn!(
                stream = %stream,
                consumer = %dispatch.consumer_id,
                error = %e,
                "Could not wait for in-flight messages"
            );
        }
        tracing::info!(stream = %stream, consumer = %dispatch.consumer_id, "Stream receiver stopped");
    }
}

/// Semaphore width for `concurrency`, saturating at what `acquire_many` can
/// take in one call
fn permit_count(concurrency: usize) -> u32 {
    match u32::try_from(concurrency.clamp(1, Semaphore::MAX_PERMITS)) {
        Ok(permits) => permits,
        Err(e) => {
            tracing::warn!(concurrency, error = %e, "Receiver concurrency too large, capping");
            u32::MAX
        }
    }
}

/// State shared by the read loop and every in-flight message
struct Dispatch<T, P> {
    bus: Arc<BusInner>,
    client: RedisClient,
    group_id: String,
    consumer_id: String,
    processor: P,
    _payload: PhantomData<fn() -> T>,
}

impl<T, P> Dispatch<T, P>
where
    T: DeserializeOwned + Send + 'static,
    P: StreamProcessor<T>,
{
    async fn handle(&self, entry: RawEntry) {
        let stream = &self.bus.config.name;

        let Some(fields) = entry.fields else {
            tracing::debug!(stream = %stream, stream_id = %entry.id, "Claimed entry was deleted, acknowledging");
            self.ack(&entry.id).await;
            return;
        };

        let decoded = match fields.get(PAYLOAD_FIELD) {
            Some(raw) => codec::decode::<T>(raw).map_err(anyhow::Error::from),
            None => Err(anyhow::anyhow!("entry has no '{}' field", PAYLOAD_FIELD)),
        };

        let payload = match decoded {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(stream = %stream, stream_id = %entry.id, error = %e, "Undecodable stream entry, dropping");
                self.report(e.context(format!("decode {} {}", stream, entry.id)), "stream.decode");
                self.ack(&entry.id).await;
                return;
            }
        };

        let message = StreamMessage {
            id: entry.id.clone(),
            payload,
        };

        match self.processor.process(message).await {
            Ok(()) => self.ack(&entry.id).await,
            Err(e) => {
                tracing::warn!(
                    stream = %stream,
                    stream_id = %entry.id,
                    group = %self.group_id,
                    error = %e,
                    "Stream processor failed, entry stays pending"
                );
                self.report(e, "stream.process");
            }
        }
    }

    async fn ack(&self, id: &str) {
        let mut conn = self.client.get_connection();
        let acked: RedisResult<usize> = conn.xack(&self.bus.config.name, &self.group_id, &[id]).await;
        if let Err(e) = acked {
            self.report(e.into(), "stream.ack");
        }
    }

    fn report(&self, error: anyhow::Error, context: &str) {
        self.bus.reporter.report(&error, context);
    }
}

async fn read_new<T, P>(
    conn: &mut MultiplexedConnection,
    dispatch: &Dispatch<T, P>,
    batch_size: usize,
) -> RedisResult<Vec<RawEntry>> {
    let opts = StreamReadOptions::default()
        .group(&dispatch.group_id, &dispatch.consumer_id)
        .count(batch_size)
        .block(dispatch.bus.config.block_ms);

    let reply: Option<StreamReadReply> = conn
        .xread_options(&[&dispatch.bus.config.name], &[">"], &opts)
        .await?;

    let mut entries = Vec::new();
    for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
        for stream_id in stream_key.ids {
            let fields = stream_id
                .map
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), redis::from_redis_value::<String>(v).ok()?)))
                .collect();
            entries.push(RawEntry {
                id: stream_id.id,
                fields: Some(fields),
            });
        }
    }
    Ok(entries)
}

/// Takes over entries idle longer than `claim_idle_ms`, resuming at `cursor`
async fn claim_idle<T, P>(
    dispatch: &Dispatch<T, P>,
    cursor: &str,
    count: usize,
) -> RedisResult<(String, Vec<RawEntry>)> {
    let mut conn = dispatch.client.get_connection();
    let reply: Value = redis::cmd("XAUTOCLAIM")
        .arg(&dispatch.bus.config.name)
        .arg(&dispatch.group_id)
        .arg(&dispatch.consumer_id)
        .arg(dispatch.bus.config.claim_idle_ms)
        .arg(cursor)
        .arg("COUNT")
        .arg(count)
        .query_async(&mut conn)
        .await?;

    parse_autoclaim(reply)
}

fn parse_autoclaim(reply: Value) -> RedisResult<(String, Vec<RawEntry>)> {
    let items = match reply {
        Value::Bulk(items) if items.len() >= 2 => items,
        other => {
            return Err(RedisError::from((
                redis::ErrorKind::TypeError,
                "unexpected XAUTOCLAIM reply",
                format!("{:?}", other),
            )))
        }
    };

    let cursor: String = redis::from_redis_value(&items[0])?;
    let claimed: Vec<(String, Option<HashMap<String, String>>)> = redis::from_redis_value(&items[1])?;

    let entries = claimed
        .into_iter()
        .map(|(id, fields)| RawEntry { id, fields })
        .collect();
    Ok((cursor, entries))
}

fn next_claim_after(iteration: u64) -> u64 {
    iteration + rand::thread_rng().gen_range(CLAIM_EVERY_MIN..=CLAIM_EVERY_MAX)
}
