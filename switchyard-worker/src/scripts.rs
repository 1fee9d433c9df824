/// Lua scripts behind every queue state transition
///
/// Each transition runs as one script so a crash between two Redis commands
/// can never leave a job half-moved. The script sources live in `scripts/`
/// and document their KEYS and ARGV; the wrappers here fix the argument order
/// and turn the replies into types.

use crate::keys::QueueKeys;
use crate::queue::QueueError;
use redis::aio::ConnectionLike;
use redis::{RedisResult, Script};
use serde::Serialize;

/// A job as submitted to `add_jobs.lua`
#[derive(Debug, Clone, Serialize)]
pub(crate) struct NewJob {
    pub id: String,
    pub data: String,
    pub attempts: u32,
    /// Backoff JSON, empty for immediate retry
    pub backoff: String,
    pub remove_on_complete: &'static str,
    pub remove_on_fail: &'static str,
    pub keep_logs: u32,
    pub delay: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_ttl: Option<u64>,
}

/// Outcome of one submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Added {
    pub id: String,
    pub created: bool,
    pub events_from: String,
}

/// What `fail.lua` did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOutcome {
    Retrying,
    Failed,
    LockLost,
    Missing,
}

impl FailOutcome {
    fn from_code(code: i64) -> Result<Self, QueueError> {
        match code {
            0 => Ok(FailOutcome::Retrying),
            1 => Ok(FailOutcome::Failed),
            -1 => Ok(FailOutcome::LockLost),
            -2 => Ok(FailOutcome::Missing),
            other => Err(QueueError::UnexpectedReply(format!("fail script returned {}", other))),
        }
    }
}

/// Fields returned by `activate.lua`
pub(crate) type ActivatedFields = (String, u32, u32, String, i64);

pub(crate) struct QueueScripts {
    add_jobs: Script,
    activate: Script,
    complete: Script,
    fail: Script,
    promote_delayed: Script,
    recover_stalled: Script,
    extend_lock: Script,
}

impl QueueScripts {
    pub fn new() -> Self {
        Self {
            add_jobs: Script::new(include_str!("../scripts/add_jobs.lua")),
            activate: Script::new(include_str!("../scripts/activate.lua")),
            complete: Script::new(include_str!("../scripts/complete.lua")),
            fail: Script::new(include_str!("../scripts/fail.lua")),
            promote_delayed: Script::new(include_str!("../scripts/promote_delayed.lua")),
            recover_stalled: Script::new(include_str!("../scripts/recover_stalled.lua")),
            extend_lock: Script::new(include_str!("../scripts/extend_lock.lua")),
        }
    }

    /// Submits `jobs` atomically
    pub async fn add_jobs<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        now_ms: i64,
        max_len: usize,
        jobs: &[NewJob],
    ) -> Result<Vec<Added>, QueueError> {
        let batch = serde_json::to_string(jobs).map_err(switchyard_shared::codec::CodecError::from)?;

        let flat: Vec<String> = self
            .add_jobs
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.events())
            .arg(keys.prefix())
            .arg(now_ms)
            .arg(max_len)
            .arg(batch)
            .invoke_async(conn)
            .await?;

        parse_added(flat, jobs.len())
    }

    /// Locks a claimed job; `None` when it vanished in the meantime
    #[allow(clippy::too_many_arguments)]
    pub async fn activate<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        id: &str,
        token: &str,
        lock_ms: u64,
        now_ms: i64,
        max_len: usize,
    ) -> RedisResult<Option<ActivatedFields>> {
        self.activate
            .key(keys.job(id))
            .key(keys.lock(id))
            .key(keys.active())
            .key(keys.events())
            .arg(id)
            .arg(token)
            .arg(lock_ms)
            .arg(now_ms)
            .arg(max_len)
            .invoke_async(conn)
            .await
    }

    /// Marks a job completed; false when the lock was lost
    pub async fn complete<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        id: &str,
        token: &str,
        now_ms: i64,
        max_len: usize,
    ) -> RedisResult<bool> {
        let code: i64 = self
            .complete
            .key(keys.job(id))
            .key(keys.lock(id))
            .key(keys.active())
            .key(keys.events())
            .key(keys.logs(id))
            .arg(id)
            .arg(token)
            .arg(now_ms)
            .arg(max_len)
            .invoke_async(conn)
            .await?;
        Ok(code == 1)
    }

    /// Records a failed attempt
    #[allow(clippy::too_many_arguments)]
    pub async fn fail<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        id: &str,
        token: &str,
        now_ms: i64,
        reason: &str,
        retry_delay_ms: u64,
        unrecoverable: bool,
        max_len: usize,
    ) -> Result<FailOutcome, QueueError> {
        let code: i64 = self
            .fail
            .key(keys.job(id))
            .key(keys.lock(id))
            .key(keys.active())
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.events())
            .key(keys.logs(id))
            .arg(id)
            .arg(token)
            .arg(now_ms)
            .arg(reason)
            .arg(retry_delay_ms)
            .arg(if unrecoverable { "1" } else { "0" })
            .arg(max_len)
            .invoke_async(conn)
            .await?;
        FailOutcome::from_code(code)
    }

    /// Moves up to `limit` due delayed jobs to the wait list
    pub async fn promote_delayed<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        now_ms: i64,
        limit: usize,
        max_len: usize,
    ) -> RedisResult<u64> {
        self.promote_delayed
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.events())
            .arg(now_ms)
            .arg(keys.prefix())
            .arg(limit)
            .arg(max_len)
            .invoke_async(conn)
            .await
    }

    /// Returns stalled jobs to the wait list; yields (recovered, failed) ids
    pub async fn recover_stalled<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        max_stalled: u32,
        now_ms: i64,
        max_len: usize,
    ) -> RedisResult<(Vec<String>, Vec<String>)> {
        self.recover_stalled
            .key(keys.stalled())
            .key(keys.active())
            .key(keys.wait())
            .key(keys.events())
            .arg(keys.prefix())
            .arg(max_stalled)
            .arg(now_ms)
            .arg(max_len)
            .invoke_async(conn)
            .await
    }

    /// Pushes a lock's expiry out; false when the lock is no longer ours
    pub async fn extend_lock<C: ConnectionLike>(
        &self,
        conn: &mut C,
        keys: &QueueKeys,
        id: &str,
        token: &str,
        lock_ms: u64,
    ) -> RedisResult<bool> {
        let extended: i64 = self
            .extend_lock
            .key(keys.lock(id))
            .arg(token)
            .arg(lock_ms)
            .invoke_async(conn)
            .await?;
        Ok(extended == 1)
    }
}

impl Default for QueueScripts {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_added(flat: Vec<String>, expected: usize) -> Result<Vec<Added>, QueueError> {
    if flat.len() != expected * 3 {
        return Err(QueueError::UnexpectedReply(format!(
            "add script returned {} fields for {} jobs",
            flat.len(),
            expected
        )));
    }

    Ok(flat
        .chunks_exact(3)
        .map(|chunk| Added {
            id: chunk[0].clone(),
            created: chunk[1] == "1",
            events_from: chunk[2].clone(),
        })
        .collect())
}
