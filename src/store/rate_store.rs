use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::PrismError;

/// Result of one sliding-window admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub admitted: bool,
    /// Entries in the window after the attempt.
    pub count: u32,
    /// Oldest entry still in the window.
    pub oldest: Option<DateTime<Utc>>,
}

/// Atomic counters and timestamp windows shared by engine instances.
#[async_trait]
pub trait RateStore: Send + Sync {
    async fn incr(&self, key: &str) -> Result<i64, PrismError>;

    async fn decr(&self, key: &str) -> Result<i64, PrismError>;

    /// Increment only while the counter is below `max`, as one atomic step.
    /// Returns whether the increment happened and the resulting value.
    async fn incr_if_below(&self, key: &str, max: i64) -> Result<(bool, i64), PrismError>;

    /// Counter value; missing keys read as zero.
    async fn get(&self, key: &str) -> Result<i64, PrismError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PrismError>;

    async fn delete(&self, key: &str) -> Result<(), PrismError>;

    /// Prune entries at or before `now - window`, then record `now` if fewer
    /// than `limit` remain. Executes as one atomic step.
    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> Result<WindowDecision, PrismError>;
}

#[derive(Debug, Default)]
struct Entry {
    counter: i64,
    window: VecDeque<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local [`RateStore`].
pub struct InMemoryRateStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn with_entry<T>(&self, key: &str, f: impl FnOnce(&mut Entry) -> T) -> T {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now)
        {
            entries.remove(key);
        }
        f(entries.entry(key.to_string()).or_default())
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration, PrismError> {
    chrono::Duration::from_std(d).map_err(|e| PrismError::Store(format!("bad duration: {e}")))
}

#[async_trait]
impl RateStore for InMemoryRateStore {
    async fn incr(&self, key: &str) -> Result<i64, PrismError> {
        Ok(self.with_entry(key, |e| {
            e.counter += 1;
            e.counter
        }))
    }

    async fn decr(&self, key: &str) -> Result<i64, PrismError> {
        Ok(self.with_entry(key, |e| {
            e.counter -= 1;
            e.counter
        }))
    }

    async fn incr_if_below(&self, key: &str, max: i64) -> Result<(bool, i64), PrismError> {
        Ok(self.with_entry(key, |e| {
            if e.counter >= max {
                return (false, e.counter);
            }
            e.counter += 1;
            (true, e.counter)
        }))
    }

    async fn get(&self, key: &str) -> Result<i64, PrismError> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
            .map_or(0, |e| e.counter))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PrismError> {
        let at = self.clock.now() + to_chrono(ttl)?;
        self.with_entry(key, |e| e.expires_at = Some(at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PrismError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn window_admit(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        limit: u32,
    ) -> Result<WindowDecision, PrismError> {
        let window = to_chrono(window)?;
        let cutoff = now - window;
        Ok(self.with_entry(key, |e| {
            while e.window.front().is_some_and(|ts| *ts <= cutoff) {
                e.window.pop_front();
            }
            let admitted = (e.window.len() as u64) < u64::from(limit);
            if admitted {
                e.window.push_back(now);
                e.expires_at = Some(now + window);
            }
            WindowDecision {
                admitted,
                count: e.window.len() as u32,
                oldest: e.window.front().copied(),
            }
        }))
    }
}
