use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    clock::{Clock, SystemClock},
    store::{
        Counter,
        CounterStore,
        StoreError,
        StoreOp,
        StoreReply,
        StoreResult,
        WindowAdmission,
        duration_to_millis,
    },
};

/// Single-process counter store.
///
/// Every key lives in its own slot behind an async mutex; multi-key
/// pipelines lock their slots in sorted key order so batches never
/// deadlock against each other. Expiry is lazy, checked against the
/// injected clock on access, with [`purge_expired`](Self::purge_expired)
/// reclaiming idle slots.
pub struct InMemoryCounterStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Slot {
    value: Option<Value>,
    expires_at: Option<DateTime<Utc>>,
}

enum Value {
    Scalar(String),
    Sorted(HashMap<String, i64>),
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(key) {
            return slot.clone();
        }
        self.slots.entry(key.to_string()).or_default().clone()
    }

    /// Drops slots that are empty or expired and not currently referenced.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => !guard.is_vacant(now),
                Err(_) => true,
            }
        });
        before.saturating_sub(self.slots.len())
    }

    /// Runs [`purge_expired`](Self::purge_expired) every `every` until the
    /// store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = store.len(), "purged idle rate limit slots");
                }
            }
        })
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    fn expire_if_due(&mut self, now: DateTime<Utc>) {
        if self.expires_at.is_some_and(|at| at <= now) {
            self.value = None;
            self.expires_at = None;
        }
    }

    fn is_vacant(&self, now: DateTime<Utc>) -> bool {
        self.value.is_none() || self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.value.as_ref()?;
        self.expires_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    fn clear(&mut self) -> bool {
        self.expires_at = None;
        self.value.take().is_some()
    }

    fn scalar(&self, key: &str) -> StoreResult<Option<&str>> {
        match &self.value {
            None => Ok(None),
            Some(Value::Scalar(value)) => Ok(Some(value)),
            Some(Value::Sorted(_)) => Err(wrong_type(key)),
        }
    }

    fn incr(&mut self, key: &str) -> StoreResult<i64> {
        let current = match self.scalar(key)? {
            None => 0,
            Some(raw) => raw.parse::<i64>().map_err(|_| wrong_type(key))?,
        };
        let next = current.saturating_add(1);
        self.value = Some(Value::Scalar(next.to_string()));
        Ok(next)
    }

    fn sorted_mut(&mut self, key: &str) -> StoreResult<&mut HashMap<String, i64>> {
        if self.value.is_none() {
            self.value = Some(Value::Sorted(HashMap::new()));
        }
        match &mut self.value {
            Some(Value::Sorted(set)) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    fn sorted(&self, key: &str) -> StoreResult<Option<&HashMap<String, i64>>> {
        match &self.value {
            None => Ok(None),
            Some(Value::Sorted(set)) => Ok(Some(set)),
            Some(Value::Scalar(_)) => Err(wrong_type(key)),
        }
    }

    fn drop_if_empty_set(&mut self) {
        if matches!(&self.value, Some(Value::Sorted(set)) if set.is_empty()) {
            self.clear();
        }
    }

    fn apply(&mut self, op: &StoreOp, now: DateTime<Utc>) -> StoreResult<StoreReply> {
        self.expire_if_due(now);

        match op {
            StoreOp::Incr { key } => self.incr(key).map(StoreReply::Int),
            StoreOp::Expire { ttl, .. } => {
                if self.value.is_none() {
                    return Ok(StoreReply::Int(0));
                }
                self.expires_at = Some(expiry(now, *ttl));
                Ok(StoreReply::Int(1))
            }
            StoreOp::Get { key } => Ok(StoreReply::Value(self.scalar(key)?.map(str::to_string))),
            StoreOp::Delete { .. } => Ok(StoreReply::Int(i64::from(self.clear()))),
            StoreOp::ZAdd { key, score, member } => {
                let set = self.sorted_mut(key)?;
                let added = set.insert(member.clone(), *score).is_none();
                Ok(StoreReply::Int(i64::from(added)))
            }
            StoreOp::ZRem { key, member } => {
                let removed = self.sorted(key)?.is_some()
                    && self.sorted_mut(key)?.remove(member).is_some();
                self.drop_if_empty_set();
                Ok(StoreReply::Int(i64::from(removed)))
            }
            StoreOp::ZRemRangeByScore { key, min, max } => {
                let mut removed = 0;
                if self.sorted(key)?.is_some() {
                    let set = self.sorted_mut(key)?;
                    let before = set.len();
                    set.retain(|_, score| *score < *min || *score > *max);
                    removed = before - set.len();
                }
                self.drop_if_empty_set();
                Ok(StoreReply::Int(removed as i64))
            }
            StoreOp::ZCard { key } => Ok(StoreReply::Int(
                self.sorted(key)?.map_or(0, |set| set.len() as i64),
            )),
            StoreOp::ZOldest { key } => Ok(StoreReply::Score(
                self.sorted(key)?.and_then(|set| set.values().min().copied()),
            )),
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        let now = self.clock.now();
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.expire_if_due(now);

        let value = slot.incr(key)?;
        if value == 1 || slot.expires_at.is_none() {
            slot.expires_at = Some(expiry(now, ttl));
        }

        Ok(Counter {
            value,
            ttl: slot.remaining(now),
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.expire_if_due(now);
        Ok(slot.scalar(key)?.map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.value = Some(Value::Scalar(value.to_string()));
        slot.expires_at = Some(expiry(now, ttl));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.expire_if_due(now);

        if slot.scalar(key)? != expected {
            return Ok(false);
        }

        slot.value = Some(Value::Scalar(value.to_string()));
        slot.expires_at = Some(expiry(now, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        Ok(slot.clear())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.clock.now();
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.expire_if_due(now);
        Ok(slot.remaining(now))
    }

    async fn window_admit(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        limit: u64,
        member: &str,
    ) -> StoreResult<WindowAdmission> {
        let now = self.clock.now();
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        slot.expire_if_due(now);

        let floor = now_ms.saturating_sub(duration_to_millis(window));
        let set = slot.sorted_mut(key)?;
        set.retain(|_, score| *score > floor);

        let count = set.len() as u64;
        let admitted = count < limit;
        if admitted {
            set.insert(member.to_string(), now_ms);
        }
        let count = set.len() as u64;
        let oldest_ms = set.values().min().copied();

        if admitted {
            slot.expires_at = Some(expiry(now, window));
        }
        slot.drop_if_empty_set();

        Ok(WindowAdmission {
            admitted,
            count,
            oldest_ms,
        })
    }

    async fn pipeline(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<StoreReply>> {
        let now = self.clock.now();

        let mut keys: Vec<&str> = ops.iter().map(StoreOp::key).collect();
        keys.sort_unstable();
        keys.dedup();

        let mut guards = HashMap::with_capacity(keys.len());
        for key in keys {
            let slot = self.slot(key);
            guards.insert(key, slot.lock_owned().await);
        }

        ops.iter()
            .map(|op| {
                let slot = guards.get_mut(op.key()).ok_or_else(|| {
                    StoreError::Unavailable(format!("slot for {} was not locked", op.key()))
                })?;
                slot.apply(op, now)
            })
            .collect()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}
