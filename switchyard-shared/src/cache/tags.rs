/// Tag membership scripts
///
/// A tag is a Redis set of value keys. Its expiry tracks its longest-lived
/// member: registering a key only ever raises the set's TTL. Members may
/// outlive the values they name; removing or reading such a member is a
/// no-op.

use redis::aio::ConnectionLike;
use redis::{RedisResult, Script};
use std::time::Duration;

/// Adds ARGV[1] to every tag in KEYS and raises each tag's TTL to ARGV[2]
/// milliseconds. When ARGV[3] is "1", members whose value key is gone are dropped
/// first.
const REGISTER_SCRIPT: &str = r#"
local member = ARGV[1]
local ttl = tonumber(ARGV[2])
local sweep = ARGV[3] == '1'
local swept = 0

for _, tag in ipairs(KEYS) do
  if sweep then
    for _, existing in ipairs(redis.call('SMEMBERS', tag)) do
      if redis.call('EXISTS', existing) == 0 then
        redis.call('SREM', tag, existing)
        swept = swept + 1
      end
    end
  end

  redis.call('SADD', tag, member)

  local current = redis.call('PTTL', tag)
  if current < ttl then
    redis.call('PEXPIRE', tag, ttl)
  end
end

return swept
"#;

/// Drops members of KEYS[1] whose value key no longer exists; deletes the tag
/// when nothing is left.
const SWEEP_SCRIPT: &str = r#"
local swept = 0
for _, member in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  if redis.call('EXISTS', member) == 0 then
    redis.call('SREM', KEYS[1], member)
    swept = swept + 1
  end
end
if redis.call('SCARD', KEYS[1]) == 0 then
  redis.call('DEL', KEYS[1])
end
return swept
"#;

/// Loaded tag scripts
pub struct TagScripts {
    register: Script,
    sweep: Script,
}

impl TagScripts {
    /// Prepares the scripts (hashes are computed once)
    pub fn new() -> Self {
        Self {
            register: Script::new(REGISTER_SCRIPT),
            sweep: Script::new(SWEEP_SCRIPT),
        }
    }

    /// Files `member` under every tag key in `tag_keys`
    ///
    /// Returns how many dead members were swept along the way.
    pub async fn register<C: ConnectionLike>(
        &self,
        conn: &mut C,
        tag_keys: &[String],
        member: &str,
        ttl: Duration,
        sweep: bool,
    ) -> RedisResult<u64> {
        if tag_keys.is_empty() {
            return Ok(0);
        }

        let mut invocation = self.register.prepare_invoke();
        for tag_key in tag_keys {
            invocation.key(tag_key);
        }
        invocation
            .arg(member)
            .arg(ttl_millis(ttl))
            .arg(if sweep { "1" } else { "0" })
            .invoke_async(conn)
            .await
    }

    /// Drops dead members of one tag
    pub async fn sweep<C: ConnectionLike>(&self, conn: &mut C, tag_key: &str) -> RedisResult<u64> {
        self.sweep.key(tag_key).invoke_async(conn).await
    }
}

impl Default for TagScripts {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds for PX/PEXPIRE, never below one
///
/// Values, tag sets and the local tier all expire from this one number.
pub fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
