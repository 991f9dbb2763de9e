//! Counter store contract shared by every rate-limit strategy.
//!
//! Implementations must make each method, and each `pipeline` call as a
//! whole, atomic with respect to concurrent callers on the same keys. The
//! strategies rely on that and never read state and write it back in two
//! unguarded steps.

pub mod in_memory;
pub mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },
    #[error("key {key} holds corrupt state: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result of an atomic increment: the new value and the remaining TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: i64,
    pub ttl: Option<Duration>,
}

/// One command inside an atomic [`CounterStore::pipeline`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Incr { key: String },
    Expire { key: String, ttl: Duration },
    Get { key: String },
    Delete { key: String },
    ZAdd { key: String, score: i64, member: String },
    ZRem { key: String, member: String },
    ZRemRangeByScore { key: String, min: i64, max: i64 },
    ZCard { key: String },
    /// Lowest score in the set, if any.
    ZOldest { key: String },
}

impl StoreOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Incr { key }
            | Self::Expire { key, .. }
            | Self::Get { key }
            | Self::Delete { key }
            | Self::ZAdd { key, .. }
            | Self::ZRem { key, .. }
            | Self::ZRemRangeByScore { key, .. }
            | Self::ZCard { key }
            | Self::ZOldest { key } => key,
        }
    }
}

/// Outcome of [`CounterStore::window_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdmission {
    pub admitted: bool,
    /// Entries in the window after this call, including the new one if
    /// it was admitted.
    pub count: u64,
    /// Lowest surviving score, in milliseconds.
    pub oldest_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreReply {
    Int(i64),
    Value(Option<String>),
    Score(Option<i64>),
}

impl StoreReply {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Self::Value(value) => value.as_deref(),
            _ => None,
        }
    }

    pub fn as_score(&self) -> Option<i64> {
        match self {
            Self::Score(score) => *score,
            _ => None,
        }
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` and, if this call created it (or it carries no
    /// expiry), sets its expiry to `ttl`. Returns the new value together
    /// with the TTL observed in the same atomic step.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Writes `value` only if the current value equals `expected`
    /// (`None` meaning the key must not exist). Returns whether it wrote.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Sliding window log step as one atomic operation: drop members with
    /// a score at or below `now_ms - window`, count the rest, and only if
    /// that count is below `limit` add `member` at `now_ms` and refresh the
    /// key's expiry to `window`.
    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> StoreResult<WindowAdmission>;

    /// Executes every op as one atomic batch and returns one reply per op.
    async fn pipeline(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>>;

    async fn zadd(&self, key: &str, score: i64, member: &str) -> StoreResult<i64> {
        let replies = self
            .pipeline(vec![StoreOp::ZAdd {
                key: key.to_string(),
                score,
                member: member.to_string(),
            }])
            .await?;
        single_int(key, &replies)
    }

    async fn zcard(&self, key: &str) -> StoreResult<i64> {
        let replies = self
            .pipeline(vec![StoreOp::ZCard {
                key: key.to_string(),
            }])
            .await?;
        single_int(key, &replies)
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> StoreResult<i64> {
        let replies = self
            .pipeline(vec![StoreOp::ZRemRangeByScore {
                key: key.to_string(),
                min,
                max,
            }])
            .await?;
        single_int(key, &replies)
    }
}

fn single_int(key: &str, replies: &[StoreReply]) -> StoreResult<i64> {
    replies
        .first()
        .and_then(StoreReply::as_int)
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: "expected an integer reply".to_string(),
        })
}

pub(crate) fn duration_to_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}
