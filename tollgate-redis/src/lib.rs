//! Redis bucket store for `tollgate` (companion crate).
//! Bring your own connection; buckets are hashes (`tokens`, `ts`) updated by one Lua script.

use async_trait::async_trait;
use redis::aio::ConnectionLike;
use redis::{ErrorKind, RedisError, Script, Value};
use std::sync::Arc;
use tollgate::rate_limit::{BucketStore, StoreError, TakeRequest};

/// Refill, take, persist, and expire in one server-side step. Returns 1 when admitted.
const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
if tokens > capacity then tokens = capacity end
if tokens < 0 then tokens = 0 end

local elapsed = math.max(0, now - ts)
local refill = math.floor(elapsed * rate / 1000)
if refill > 0 then
  tokens = math.min(capacity, tokens + refill)
  ts = now
end

local admitted = 0
if tokens >= cost then
  tokens = tokens - cost
  admitted = 1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(ts))
redis.call('EXPIRE', key, ttl)
return admitted
"#;

/// [`BucketStore`] over any async redis connection (`MultiplexedConnection`,
/// `ConnectionManager`, ...). Clones of the connection are used per call.
#[derive(Clone)]
pub struct RedisBucketStore<C> {
    conn: C,
    script: Arc<Script>,
}

impl<C> std::fmt::Debug for RedisBucketStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("conn", &"<redis connection>")
            .field("script", &self.script.get_hash())
            .finish()
    }
}

impl<C> RedisBucketStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub fn new(conn: C) -> Self {
        Self { conn, script: Arc::new(Script::new(TAKE_SCRIPT)) }
    }
}

#[async_trait]
impl<C> BucketStore for RedisBucketStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn take(&self, key: &str, req: TakeRequest) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Value = self
            .script
            .key(key)
            .arg(req.now_millis)
            .arg(req.capacity)
            .arg(req.refill_per_sec)
            .arg(req.cost)
            .arg(req.ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        flag(reply)
    }

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("SISMEMBER")
            .arg(set_key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        flag(reply)
    }
}

fn flag(reply: Value) -> Result<bool, StoreError> {
    match reply {
        Value::Int(1) => Ok(true),
        Value::Int(0) => Ok(false),
        other => Err(StoreError::Malformed(format!("{other:?}"))),
    }
}

fn store_error(err: RedisError) -> StoreError {
    match err.kind() {
        ErrorKind::TypeError | ErrorKind::ResponseError => StoreError::Malformed(err.to_string()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}
