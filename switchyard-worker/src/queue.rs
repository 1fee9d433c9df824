/// Producer side of the work queue
///
/// # Architecture
///
/// ```text
/// QueueClient (one per process, shares a RedisClient)
///   └─> WorkQueue<T> (one per queue name)
///         ├─> add / add_many / add_many_with_opts ──> add_jobs.lua
///         └─> process(handler) ──> QueueProcessor ──start()──> WorkerHandle
/// ```
///
/// Adding a job captures the caller's current `ExecutionContext` and stores it
/// next to the payload, so the worker can run the handler under a context
/// pointing back at whatever caused the job.
///
/// # Example
///
/// ```no_run
/// use serde::{Deserialize, Serialize};
/// use switchyard_shared::redis::RedisConfig;
/// use switchyard_worker::options::{AddOptions, QueueOptions};
/// use switchyard_worker::queue::QueueClient;
///
/// #[derive(Serialize, Deserialize)]
/// struct Welcome {
///     user_id: u64,
/// }
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = QueueClient::connect(RedisConfig::from_env()?).await?;
/// let emails = client.queue::<Welcome>(QueueOptions::new("emails")).await?;
///
/// let job = emails.add(&Welcome { user_id: 7 }, AddOptions::default()).await?;
/// job.wait_until_finished(Some(std::time::Duration::from_secs(30))).await?;
/// # Ok(())
/// # }
/// ```

use crate::job::{JobData, JobRef};
use crate::keys::QueueKeys;
use crate::options::{AddOptions, QueueOptions};
use crate::scripts::{NewJob, QueueScripts};
use chrono::Utc;
use redis::{AsyncCommands, RedisError};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use switchyard_shared::codec::CodecError;
use switchyard_shared::context::current_context;
use switchyard_shared::redis::{RedisClient, RedisClientError, RedisConfig};
use switchyard_shared::report::{default_reporter, SharedReporter};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

/// Queue error types
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] RedisClientError),

    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid queue options: {0}")]
    InvalidOptions(String),

    #[error("Job {job_id} did not finish within {timeout:?}")]
    WaitTimeout { job_id: String, timeout: Duration },

    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("Unexpected reply from Redis: {0}")]
    UnexpectedReply(String),
}

/// State shared by every queue created from one client
pub(crate) struct ClientState {
    /// Flips to true once any processor of this client starts
    pub started: watch::Sender<bool>,
}

/// Entry point for creating queues
#[derive(Clone)]
pub struct QueueClient {
    redis: RedisClient,
    reporter: SharedReporter,
    state: Arc<ClientState>,
}

impl QueueClient {
    /// Creates a client on an existing connection
    pub fn new(redis: RedisClient) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            redis,
            reporter: default_reporter(),
            state: Arc::new(ClientState { started }),
        }
    }

    /// Connects and creates a client
    ///
    /// # Errors
    ///
    /// Returns an error if Redis cannot be reached.
    pub async fn connect(config: RedisConfig) -> Result<Self, QueueError> {
        Ok(Self::new(RedisClient::new(config).await?))
    }

    /// Routes job failures and maintenance errors to `reporter`
    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Opens queue `options.name`
    ///
    /// A queue with its own `redis_url` gets its own connection; otherwise the
    /// client's connection is shared.
    ///
    /// # Errors
    ///
    /// - `InvalidOptions` for an empty name, zero attempts or zero concurrency
    /// - Connection errors when a dedicated URL cannot be reached
    pub async fn queue<T>(&self, options: QueueOptions) -> Result<WorkQueue<T>, QueueError> {
        validate(&options)?;

        let redis = match &options.redis_url {
            Some(url) => RedisClient::new(self.redis.config().with_url(url.as_str())).await?,
            None => self.redis.clone(),
        };

        tracing::info!(queue = %options.name, prefix = %options.queue.prefix, "Queue opened");

        Ok(WorkQueue {
            inner: Arc::new(QueueInner {
                keys: QueueKeys::new(&options.queue.prefix, &options.name),
                options,
                redis,
                scripts: QueueScripts::new(),
                reporter: self.reporter.clone(),
                client_state: Arc::clone(&self.state),
            }),
            _payload: PhantomData,
        })
    }
}

fn validate(options: &QueueOptions) -> Result<(), QueueError> {
    if options.name.is_empty() {
        return Err(QueueError::InvalidOptions("queue name is empty".to_string()));
    }
    if options.job.attempts == 0 {
        return Err(QueueError::InvalidOptions("attempts must be at least 1".to_string()));
    }
    if options.worker.concurrency == 0 {
        return Err(QueueError::InvalidOptions("concurrency must be at least 1".to_string()));
    }
    Ok(())
}

pub(crate) struct QueueInner {
    pub options: QueueOptions,
    pub keys: QueueKeys,
    pub redis: RedisClient,
    pub scripts: QueueScripts,
    pub reporter: SharedReporter,
    pub client_state: Arc<ClientState>,
}

impl QueueInner {
    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn events_max_len(&self) -> usize {
        self.options.queue.events_max_len
    }
}

/// Number of jobs per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
}

/// Durable queue of `T` payloads
pub struct WorkQueue<T> {
    pub(crate) inner: Arc<QueueInner>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _payload: PhantomData,
        }
    }
}

impl<T> WorkQueue<T> {
    /// Queue name
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Options the queue was opened with
    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Handle to an already submitted job
    ///
    /// Waiting on it scans the retained event stream from the start.
    pub fn job(&self, id: impl Into<String>) -> JobRef {
        JobRef::new(
            id.into(),
            false,
            "0-0".to_string(),
            self.inner.keys.clone(),
            self.inner.redis.clone(),
        )
    }

    /// Jobs waiting, active and delayed right now
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        let keys = &self.inner.keys;
        let mut conn = self.inner.redis.get_connection();

        let (waiting, active, delayed): (u64, u64, u64) = redis::pipe()
            .llen(keys.wait())
            .llen(keys.active())
            .zcard(keys.delayed())
            .query_async(&mut conn)
            .await?;

        Ok(JobCounts {
            waiting,
            active,
            delayed,
        })
    }

    /// Failure reasons recorded for a job, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn logs(&self, id: &str) -> Result<Vec<String>, QueueError> {
        let mut conn = self.inner.redis.get_connection();
        Ok(conn.lrange(self.inner.keys.logs(id), 0, -1).await?)
    }
}

impl<T: Serialize> WorkQueue<T> {
    /// Submits one job
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or Redis is
    /// unavailable.
    pub async fn add(&self, payload: &T, options: AddOptions) -> Result<JobRef, QueueError> {
        let mut refs = self.submit(vec![(payload, options)]).await?;
        refs.pop()
            .ok_or_else(|| QueueError::UnexpectedReply("no job returned".to_string()))
    }

    /// Submits several jobs with the same options in one atomic call
    ///
    /// # Errors
    ///
    /// - `InvalidOptions` if `options` carries an id or deduplication, which
    ///   cannot be shared by several jobs
    /// - Encoding or Redis errors; nothing is added then
    pub async fn add_many(&self, payloads: &[T], options: AddOptions) -> Result<Vec<JobRef>, QueueError> {
        if options.id.is_some() || options.deduplication.is_some() {
            return Err(QueueError::InvalidOptions(
                "add_many options cannot carry a job id or deduplication".to_string(),
            ));
        }

        self.submit(payloads.iter().map(|p| (p, options.clone())).collect())
            .await
    }

    /// Submits several jobs, each with its own options, in one atomic call
    ///
    /// # Errors
    ///
    /// Encoding or Redis errors; nothing is added then.
    pub async fn add_many_with_opts(&self, jobs: Vec<(T, AddOptions)>) -> Result<Vec<JobRef>, QueueError> {
        self.submit(jobs.iter().map(|(p, o)| (p, o.clone())).collect())
            .await
    }

    async fn submit(&self, jobs: Vec<(&T, AddOptions)>) -> Result<Vec<JobRef>, QueueError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let inner = &self.inner;
        let context = current_context();
        let defaults = &inner.options.job;
        let backoff = match &defaults.backoff {
            Some(b) => serde_json::to_string(b).map_err(CodecError::from)?,
            None => String::new(),
        };

        let batch = jobs
            .into_iter()
            .map(|(payload, opts)| {
                let dedup = opts.deduplication;
                Ok(NewJob {
                    id: opts.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    data: JobData::encode(payload, context.clone())?,
                    attempts: defaults.attempts,
                    backoff: backoff.clone(),
                    remove_on_complete: flag(defaults.remove_on_complete),
                    remove_on_fail: flag(defaults.remove_on_fail),
                    keep_logs: defaults.keep_logs,
                    delay: opts.delay.map(|d| d.as_millis() as u64).unwrap_or(0),
                    dedup_ttl: dedup
                        .as_ref()
                        .and_then(|d| d.ttl)
                        .map(|ttl| ttl.as_millis() as u64),
                    dedup_id: dedup.map(|d| d.id),
                })
            })
            .collect::<Result<Vec<_>, CodecError>>()?;

        let mut conn = inner.redis.get_connection();
        let added = inner
            .scripts
            .add_jobs(
                &mut conn,
                &inner.keys,
                Utc::now().timestamp_millis(),
                inner.events_max_len(),
                &batch,
            )
            .await?;

        Ok(added
            .into_iter()
            .map(|a| {
                if a.created {
                    tracing::debug!(queue = %inner.name(), job_id = %a.id, "Job added");
                } else {
                    tracing::debug!(queue = %inner.name(), job_id = %a.id, "Job already present, not added");
                }
                JobRef::new(a.id, a.created, a.events_from, inner.keys.clone(), inner.redis.clone())
            })
            .collect())
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}
