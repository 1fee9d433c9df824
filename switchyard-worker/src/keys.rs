/// Redis key layout of one queue
///
/// ```text
/// <prefix>:<name>:wait        list of job ids, LPUSH in, BLMOVE RIGHT out
/// <prefix>:<name>:active      list of job ids being processed
/// <prefix>:<name>:delayed     zset of job ids scored by ready-at (ms)
/// <prefix>:<name>:stalled     set of stalled-check candidates
/// <prefix>:<name>:events      stream of job lifecycle events
/// <prefix>:<name>:job:<id>    hash with the job's data and bookkeeping
/// <prefix>:<name>:lock:<id>   worker lock token, PX lock_duration
/// <prefix>:<name>:logs:<id>   list of recent failure reasons
/// <prefix>:<name>:de:<id>     deduplication key holding the first job id
/// ```

/// Key builder for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    /// Keys for queue `name` under `prefix`
    pub fn new(prefix: &str, name: &str) -> Self {
        Self {
            base: format!("{}:{}:", prefix, name),
        }
    }

    /// Prefix shared by every key, ending in `:`
    pub fn prefix(&self) -> &str {
        &self.base
    }

    /// List of job ids ready to be claimed
    pub fn wait(&self) -> String {
        format!("{}wait", self.base)
    }

    /// List of job ids currently held by a worker
    pub fn active(&self) -> String {
        format!("{}active", self.base)
    }

    /// Sorted set of delayed job ids, scored by ready-at millis
    pub fn delayed(&self) -> String {
        format!("{}delayed", self.base)
    }

    /// Set of active job ids the next stalled check will inspect
    pub fn stalled(&self) -> String {
        format!("{}stalled", self.base)
    }

    /// Stream of lifecycle events (`added`, `completed`, `failed`, ...)
    pub fn events(&self) -> String {
        format!("{}events", self.base)
    }

    /// Hash holding the payload and bookkeeping of job `id`
    pub fn job(&self, id: &str) -> String {
        format!("{}job:{}", self.base, id)
    }

    /// Lock token of job `id` while a worker processes it
    pub fn lock(&self, id: &str) -> String {
        format!("{}lock:{}", self.base, id)
    }

    /// Recent failure reasons of job `id`, oldest first
    pub fn logs(&self, id: &str) -> String {
        format!("{}logs:{}", self.base, id)
    }

    /// Deduplication marker for `id`, holding the id of the job it admitted
    pub fn dedup(&self, id: &str) -> String {
        format!("{}de:{}", self.base, id)
    }
}
