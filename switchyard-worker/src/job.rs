/// Jobs as stored, as seen by handlers, and as seen by producers
///
/// The `data` field of a job hash holds a `JobData` document: the payload in
/// the tagged envelope plus the execution context captured at enqueue time.
/// Producers get a `JobRef` back from `add` and can wait on it.

use crate::keys::QueueKeys;
use crate::queue::QueueError;
use chrono::{DateTime, TimeZone, Utc};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use switchyard_shared::codec::{self, CodecError};
use switchyard_shared::context::ExecutionContext;
use switchyard_shared::redis::RedisClient;

/// How long one XREAD waits on the events stream
const EVENTS_BLOCK_MS: usize = 5000;

/// Document stored in a job's `data` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// Encoded payload
    pub payload: String,

    /// Context the job was enqueued under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
}

impl JobData {
    /// Wraps `payload` with the enqueuing context
    pub fn encode<T: Serialize>(payload: &T, context: Option<ExecutionContext>) -> Result<String, CodecError> {
        let data = JobData {
            payload: codec::encode(payload)?,
            context,
        };
        Ok(serde_json::to_string(&data)?)
    }

    /// Unwraps a stored `data` field
    ///
    /// Data written without the wrapper is decoded as a bare payload with no
    /// context.
    pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<(T, Option<ExecutionContext>), CodecError> {
        match serde_json::from_str::<JobData>(raw) {
            Ok(data) => Ok((codec::decode(&data.payload)?, data.context)),
            Err(_) => Ok((codec::decode(raw)?, None)),
        }
    }
}

/// A job as handed to a handler
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    /// Job id
    pub id: String,

    /// Queue name
    pub queue: String,

    /// This attempt, starting at 1
    pub attempt: u32,

    /// Attempts allowed in total
    pub max_attempts: u32,

    /// When the job was added
    pub enqueued_at: DateTime<Utc>,

    /// Context the handler runs under
    pub context: ExecutionContext,
}

impl JobInfo {
    /// Whether a failure now would be the last one
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// State of a job as recorded in its hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Whether the job will not run again
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Lifecycle event on a queue's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Added,
    Delayed,
    Waiting,
    Active,
    Deduplicated,
    Stalled,
    Retrying { attempt: u32, reason: String },
    Completed,
    Failed { reason: String },
}

impl QueueEvent {
    /// Parses an event entry; returns the job id it concerns
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<(String, QueueEvent)> {
        let job_id = fields.get("jobId")?.clone();
        let reason = || fields.get("reason").cloned().unwrap_or_default();

        let event = match fields.get("event")?.as_str() {
            "added" => QueueEvent::Added,
            "delayed" => QueueEvent::Delayed,
            "waiting" => QueueEvent::Waiting,
            "active" => QueueEvent::Active,
            "deduplicated" => QueueEvent::Deduplicated,
            "stalled" => QueueEvent::Stalled,
            "retrying" => QueueEvent::Retrying {
                attempt: fields.get("attempt").and_then(|a| a.parse().ok()).unwrap_or(0),
                reason: reason(),
            },
            "completed" => QueueEvent::Completed,
            "failed" => QueueEvent::Failed { reason: reason() },
            _ => return None,
        };
        Some((job_id, event))
    }
}

/// Handle to a submitted job
#[derive(Clone)]
pub struct JobRef {
    id: String,
    created: bool,
    events_from: String,
    keys: QueueKeys,
    redis: RedisClient,
}

impl std::fmt::Debug for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRef")
            .field("id", &self.id)
            .field("created", &self.created)
            .field("events_from", &self.events_from)
            .finish()
    }
}

impl JobRef {
    pub(crate) fn new(id: String, created: bool, events_from: String, keys: QueueKeys, redis: RedisClient) -> Self {
        Self {
            id,
            created,
            events_from,
            keys,
            redis,
        }
    }

    /// Job id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// False when the add returned an existing or deduplicated job
    pub fn is_new(&self) -> bool {
        self.created
    }

    /// Current state, or `None` once the job has been removed
    ///
    /// # Errors
    ///
    /// Returns an error if Redis is unavailable.
    pub async fn state(&self) -> Result<Option<JobState>, QueueError> {
        let mut conn = self.redis.get_connection();
        let state: Option<String> = conn.hget(self.keys.job(&self.id), "state").await?;
        Ok(state.as_deref().and_then(JobState::parse))
    }

    /// Waits until the job completes or fails for good
    ///
    /// Watches the queue's event stream from the position recorded when the
    /// job was added. On timeout the wait ends with `WaitTimeout`; the job
    /// itself keeps running.
    ///
    /// # Errors
    ///
    /// - `JobFailed` if the job failed for good
    /// - `WaitTimeout` if `timeout` elapsed first
    /// - Redis errors
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> Result<(), QueueError> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.watch())
                .await
                .map_err(|_| QueueError::WaitTimeout {
                    job_id: self.id.clone(),
                    timeout: limit,
                })?,
            None => self.watch().await,
        }
    }

    async fn watch(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.get_connection();
        let (state, reason): (Option<String>, Option<String>) = conn
            .hget(self.keys.job(&self.id), &["state", "failed_reason"])
            .await?;

        match state.as_deref().and_then(JobState::parse) {
            Some(JobState::Completed) => return Ok(()),
            Some(JobState::Failed) => return Err(self.failed(reason.unwrap_or_default())),
            _ => {}
        }

        let events = self.keys.events();
        let mut reader = self.redis.isolated_connection().await?;
        let mut last_id = self.events_from.clone();

        loop {
            let opts = StreamReadOptions::default().count(100).block(EVENTS_BLOCK_MS);
            let reply: Option<StreamReadReply> = reader
                .xread_options(&[&events], &[&last_id], &opts)
                .await?;

            for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
                for entry in stream_key.ids {
                    last_id = entry.id.clone();

                    let fields: HashMap<String, String> = entry
                        .map
                        .iter()
                        .filter_map(|(k, v)| Some((k.clone(), redis::from_redis_value::<String>(v).ok()?)))
                        .collect();

                    match QueueEvent::from_fields(&fields) {
                        Some((job_id, QueueEvent::Completed)) if job_id == self.id => return Ok(()),
                        Some((job_id, QueueEvent::Failed { reason })) if job_id == self.id => {
                            return Err(self.failed(reason));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn failed(&self, reason: String) -> QueueError {
        QueueError::JobFailed {
            job_id: self.id.clone(),
            reason,
        }
    }
}

/// A job loaded by the activate script
#[derive(Debug, Clone)]
pub(crate) struct ActiveJob {
    pub id: String,
    pub data: String,
    pub attempts_made: u32,
    pub attempts: u32,
    pub backoff: Option<crate::options::Backoff>,
    pub enqueued_at: DateTime<Utc>,
}

impl ActiveJob {
    pub(crate) fn from_fields(id: String, fields: (String, u32, u32, String, i64)) -> Self {
        let (data, attempts_made, attempts, backoff, timestamp) = fields;
        Self {
            id,
            data,
            attempts_made,
            attempts,
            backoff: serde_json::from_str(&backoff).ok(),
            enqueued_at: Utc.timestamp_millis_opt(timestamp).single().unwrap_or_else(Utc::now),
        }
    }

    /// This attempt, starting at 1
    pub(crate) fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }
}
