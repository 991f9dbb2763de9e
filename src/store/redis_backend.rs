use std::time::Duration;

use async_trait::async_trait;
use redis::{
    FromRedisValue,
    Script,
    aio::ConnectionManager,
};

use crate::store::{
    Counter,
    CounterStore,
    StoreError,
    StoreOp,
    StoreReply,
    StoreResult,
    WindowAdmission,
    duration_to_millis,
};

const INCR_WITH_EXPIRY_LUA: &str = r#"
local key = KEYS[1]
local ttl_ms = tonumber(ARGV[1])

local count = redis.call('INCR', key)
local ttl = redis.call('PTTL', key)
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', key, ttl_ms)
  ttl = ttl_ms
end

return {count, ttl}
"#;

const COMPARE_AND_SET_LUA: &str = r#"
local key = KEYS[1]
local has_expected = ARGV[1] == '1'
local expected = ARGV[2]
local value = ARGV[3]
local ttl_ms = tonumber(ARGV[4])

local current = redis.call('GET', key)
if has_expected then
  if current ~= expected then
    return 0
  end
elseif current then
  return 0
end

redis.call('SET', key, value, 'PX', ttl_ms)
return 1
"#;

const WINDOW_ADMIT_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now_ms, member)
  redis.call('PEXPIRE', key, window_ms)
  count = count + 1
  admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {admitted, count, oldest[2] or false}
"#;

/// Counter store backed by a shared Redis instance.
///
/// Multi-command atomicity comes from Lua scripts for the conditional
/// primitives and `MULTI`/`EXEC` for pipelines.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    key_prefix: String,
    incr_script: Script,
    cas_script: Script,
    window_script: Script,
}

impl RedisCounterStore {
    pub async fn new(url: String, key_prefix: String) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            incr_script: Script::new(INCR_WITH_EXPIRY_LUA),
            cas_script: Script::new(COMPARE_AND_SET_LUA),
            window_script: Script::new(WINDOW_ADMIT_LUA),
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.key_prefix, key)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let mut conn = self.manager.clone();
        let (value, ttl_ms): (i64, i64) = self
            .incr_script
            .key(self.key(key))
            .arg(duration_to_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(Counter {
            value,
            ttl: u64::try_from(ttl_ms).ok().map(Duration::from_millis),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(duration_to_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let written: i64 = self
            .cas_script
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .arg(duration_to_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> StoreResult<WindowAdmission> {
        let mut conn = self.manager.clone();
        let (admitted, count, oldest): (i64, i64, Option<String>) = self
            .window_script
            .key(self.key(key))
            .arg(now_ms)
            .arg(duration_to_millis(window))
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowAdmission {
            admitted: admitted == 1,
            count: u64::try_from(count).unwrap_or(0),
            oldest_ms: parse_score(key, oldest.as_deref())?,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.manager.clone();
        let ttl_ms: i64 = redis::cmd("PTTL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(u64::try_from(ttl_ms).ok().map(Duration::from_millis))
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            let key = self.key(op.key());
            match op {
                StoreOp::Incr { .. } => {
                    pipe.cmd("INCR").arg(key);
                }
                StoreOp::Expire { ttl, .. } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(duration_to_millis(*ttl));
                }
                StoreOp::Get { .. } => {
                    pipe.cmd("GET").arg(key);
                }
                StoreOp::Delete { .. } => {
                    pipe.cmd("DEL").arg(key);
                }
                StoreOp::ZAdd { score, member, .. } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                StoreOp::ZRem { member, .. } => {
                    pipe.cmd("ZREM").arg(key).arg(member);
                }
                StoreOp::ZRemRangeByScore { min, max, .. } => {
                    pipe.cmd("ZREMRANGEBYSCORE")
                        .arg(key)
                        .arg(score_bound(*min))
                        .arg(score_bound(*max));
                }
                StoreOp::ZCard { .. } => {
                    pipe.cmd("ZCARD").arg(key);
                }
                StoreOp::ZOldest { .. } => {
                    pipe.cmd("ZRANGE").arg(key).arg(0).arg(0).arg("WITHSCORES");
                }
            }
        }

        let mut conn = self.manager.clone();
        let raw: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        if raw.len() != ops.len() {
            return Err(StoreError::Unavailable(format!(
                "pipeline returned {} replies for {} commands",
                raw.len(),
                ops.len()
            )));
        }

        ops.iter()
            .zip(raw.iter())
            .map(|(op, value)| decode_reply(op, value))
            .collect()
    }
}

fn score_bound(score: i64) -> String {
    match score {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        other => other.to_string(),
    }
}

fn decode_reply(op: &StoreOp, value: &redis::Value) -> StoreResult<StoreReply> {
    let reply = match op {
        StoreOp::Get { .. } => StoreReply::Value(Option::<String>::from_redis_value(value)?),
        StoreOp::ZOldest { .. } => {
            let pair: Vec<String> = Vec::from_redis_value(value)?;
            StoreReply::Score(parse_score(op.key(), pair.get(1).map(String::as_str))?)
        }
        _ => StoreReply::Int(i64::from_redis_value(value)?),
    };
    Ok(reply)
}

fn parse_score(key: &str, raw: Option<&str>) -> StoreResult<Option<i64>> {
    raw.map(|raw| raw.parse::<f64>())
        .transpose()
        .map(|score| score.map(|s| s as i64))
        .map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.code() == Some("WRONGTYPE") {
            return Self::WrongType {
                key: err.detail().unwrap_or_default().to_string(),
            };
        }
        Self::Unavailable(err.to_string())
    }
}
