/// Queue, job and worker options
///
/// Defaults keep jobs around only as long as they are useful: ten attempts,
/// completed and failed jobs removed, the last ten failure reasons kept.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay between a failed attempt and the next one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "delay_ms", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(u64),

    /// `delay * 2^(attempt - 1)` before retry number `attempt`
    Exponential(u64),
}

impl Backoff {
    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(ms) => Duration::from_millis(ms),
            Backoff::Exponential(ms) => {
                let shift = attempt.saturating_sub(1).min(32);
                Duration::from_millis(ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

/// Retry and retention policy applied to every job of a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Attempts before a job is given up on
    pub attempts: u32,

    /// Delay between attempts; retry immediately when unset
    pub backoff: Option<Backoff>,

    /// Delete the job once it completes
    pub remove_on_complete: bool,

    /// Delete the job once it has failed for good
    pub remove_on_fail: bool,

    /// Failure reasons kept per job
    pub keep_logs: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: None,
            remove_on_complete: true,
            remove_on_fail: true,
            keep_logs: 10,
        }
    }
}

/// Queue-level settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Namespace of every key the queue owns
    pub prefix: String,

    /// Approximate length of the queue's event stream
    pub events_max_len: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "queue".to_string(),
            events_max_len: 10_000,
        }
    }
}

/// Worker-side settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs processed at the same time
    pub concurrency: usize,

    /// Lifetime of a job lock; renewed every half period while the handler runs
    pub lock_duration: Duration,

    /// How often active jobs without a lock are looked for
    pub stalled_interval: Duration,

    /// Stalls tolerated before a job fails for good
    pub max_stalled_count: u32,

    /// How long one claim blocks waiting for a job
    pub claim_timeout: Duration,

    /// How often due delayed jobs are moved to the wait list
    pub delayed_poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 50,
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            claim_timeout: Duration::from_secs(5),
            delayed_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue name
    pub name: String,

    /// Redis URL for this queue; the client's connection when unset
    pub redis_url: Option<String>,

    /// Retry and retention policy
    pub job: JobOptions,

    /// Key namespace and event retention
    pub queue: QueueSettings,

    /// Worker settings
    pub worker: WorkerOptions,
}

impl QueueOptions {
    /// Options for queue `name` with defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            redis_url: None,
            job: JobOptions::default(),
            queue: QueueSettings::default(),
            worker: WorkerOptions::default(),
        }
    }
}

/// Collapses repeated submissions of the same logical job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deduplication {
    /// Deduplication key
    pub id: String,

    /// How long the key holds; until the job finishes when unset
    pub ttl: Option<Duration>,
}

/// Per-submission options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Hold the job back for this long
    pub delay: Option<Duration>,

    /// Explicit job id; adding an id that exists returns the existing job
    pub id: Option<String>,

    /// Deduplication; while the key holds, adds return the first job
    pub deduplication: Option<Deduplication>,
}

impl AddOptions {
    /// Delayed submission
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Submission with an explicit job id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Submission deduplicated on `id`
    pub fn deduplicated(id: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            deduplication: Some(Deduplication { id: id.into(), ttl }),
            ..Self::default()
        }
    }
}
