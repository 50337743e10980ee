//! Lua scripts executed atomically by the Redis server.

use std::time::Duration;

use redis::{Script, ScriptInvocation};

use limits_core::domain::{KeyPrefix, expiry_seconds};

/// Keys deleted per `DEL` call by the bulk evictor.
pub const EVICTION_BATCH_SIZE: usize = 5000;

/// Increment and set the TTL only when the increment created the key.
/// KEYS[1] counter, ARGV[1] amount, ARGV[2] ttl seconds.
const INCR_EXPIRE: &str = r#"
local current = redis.call('INCRBY', KEYS[1], ARGV[1])
if tonumber(current) == tonumber(ARGV[1]) then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return current
"#;

/// Count live entries from the head of the log, stopping at the first stale
/// one. The oldest live entry is returned as stored, since Lua numbers are
/// truncated to integers in replies.
/// KEYS[1] log, ARGV[1] threshold (now - expiry), ARGV[2] limit.
const MOVING_WINDOW: &str = r#"
local items = redis.call('LRANGE', KEYS[1], 0, tonumber(ARGV[2]) - 1)
local threshold = tonumber(ARGV[1])
local count = 0
local oldest = false
for idx = 1, #items do
    if tonumber(items[idx]) >= threshold then
        count = count + 1
        oldest = items[idx]
    else
        break
    end
end
return {oldest, count}
"#;

/// Reject when the entry at slot limit - 1 is still live, otherwise admit
/// and (unless no_add) prepend now, cap the log at limit and refresh its TTL.
/// KEYS[1] log, ARGV[1] now, ARGV[2] limit, ARGV[3] expiry,
/// ARGV[4] ttl seconds, ARGV[5] no_add.
const ACQUIRE_ENTRY: &str = r#"
local timestamp = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local expiry = tonumber(ARGV[3])
local entry = redis.call('LINDEX', KEYS[1], limit - 1)
if entry and tonumber(entry) >= timestamp - expiry then
    return 0
end
if tonumber(ARGV[5]) == 0 then
    redis.call('LPUSH', KEYS[1], ARGV[1])
    redis.call('LTRIM', KEYS[1], 0, limit - 1)
    redis.call('EXPIRE', KEYS[1], ARGV[4])
end
return 1
"#;

/// Delete every key matching ARGV[1], ARGV[2] keys per DEL.
const CLEAR_KEYS: &str = r#"
local keys = redis.call('KEYS', ARGV[1])
local batch = tonumber(ARGV[2])
local deleted = 0
for i = 1, #keys, batch do
    deleted = deleted + redis.call('DEL', unpack(keys, i, math.min(i + batch - 1, #keys)))
end
return deleted
"#;

/// Compiled scripts, invoked by SHA with a transparent load on cache miss.
pub struct Scripts {
    incr_expire: Script,
    moving_window: Script,
    acquire_entry: Script,
    clear_keys: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            incr_expire: Script::new(INCR_EXPIRE),
            moving_window: Script::new(MOVING_WINDOW),
            acquire_entry: Script::new(ACQUIRE_ENTRY),
            clear_keys: Script::new(CLEAR_KEYS),
        }
    }

    pub fn incr_expire(&self, key: &str, amount: u64, expiry: Duration) -> ScriptInvocation<'_> {
        let mut invocation = self.incr_expire.prepare_invoke();
        invocation
            .key(key)
            .arg(amount)
            .arg(expiry_seconds(expiry));
        invocation
    }

    pub fn moving_window(&self, key: &str, threshold: f64, limit: u64) -> ScriptInvocation<'_> {
        let mut invocation = self.moving_window.prepare_invoke();
        invocation.key(key).arg(threshold).arg(limit);
        invocation
    }

    pub fn acquire_entry(
        &self,
        key: &str,
        now: f64,
        limit: u64,
        expiry: Duration,
        no_add: bool,
    ) -> ScriptInvocation<'_> {
        let mut invocation = self.acquire_entry.prepare_invoke();
        invocation
            .key(key)
            .arg(now)
            .arg(limit)
            .arg(expiry.as_secs_f64())
            .arg(expiry_seconds(expiry))
            .arg(u8::from(no_add));
        invocation
    }

    pub fn clear_keys(&self, prefix: &KeyPrefix) -> ScriptInvocation<'_> {
        let mut invocation = self.clear_keys.prepare_invoke();
        invocation.arg(prefix.glob()).arg(EVICTION_BATCH_SIZE);
        invocation
    }
}
