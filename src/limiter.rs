//! Per-client admission control.
//!
//! Two independent checks guard every generation request: a sliding request
//! window and a counter of in-flight generations. Both live in a
//! [`RateStore`] so several engine instances share one view of each client.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::error::PrismError;
use crate::store::RateStore;

/// Outcome of one request-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request was recorded in the window.
    pub allowed: bool,
    /// Requests still available in the current window.
    pub remaining: u32,
    /// When the oldest recorded request leaves the window.
    pub reset_at: DateTime<Utc>,
}

/// Snapshot of a client's in-flight counter against its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyDecision {
    /// Whether another slot could be reserved right now.
    pub allowed: bool,
    /// Generations currently in flight.
    pub current: i64,
    /// Configured `max_concurrent`.
    pub max: u32,
}

/// Per-client request window and concurrency counter over a [`RateStore`].
///
/// Clients in the allowlist skip the request window but still count
/// against the concurrency limit.
pub struct RateLimiter {
    store: Arc<dyn RateStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    allowlist: HashSet<String>,
}

fn window_key(client: &str) -> String {
    format!("ratelimit:{client}")
}

fn concurrency_key(client: &str) -> String {
    format!("concurrent:{client}")
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateStore>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        let allowlist = config.allowlist.iter().cloned().collect();
        Self {
            store,
            clock,
            config,
            allowlist,
        }
    }

    /// Record a request in the client's window if there is room.
    pub async fn check_request_rate(&self, client: &str) -> Result<RateDecision, PrismError> {
        let now = self.clock.now();
        let window = self.config.window();
        let limit = self.config.requests_per_window;

        if self.allowlist.contains(client) {
            return Ok(RateDecision {
                allowed: true,
                remaining: limit,
                reset_at: now,
            });
        }

        let decision = self
            .store
            .window_admit(&window_key(client), now, window, limit)
            .await?;

        let span = chrono::Duration::from_std(window)
            .map_err(|e| PrismError::Config(format!("rate window out of range: {e}")))?;
        let reset_at = decision.oldest.map_or(now + span, |oldest| oldest + span);

        Ok(RateDecision {
            allowed: decision.admitted,
            remaining: limit.saturating_sub(decision.count),
            reset_at,
        })
    }

    /// Whether the client could start another generation. Read-only; use
    /// [`RateLimiter::acquire`] to reserve a slot.
    pub async fn check_concurrency(&self, client: &str) -> Result<ConcurrencyDecision, PrismError> {
        let current = self.store.get(&concurrency_key(client)).await?;
        let max = self.config.max_concurrent;
        Ok(ConcurrencyDecision {
            allowed: current < i64::from(max),
            current,
            max,
        })
    }

    /// Record the request in the window, then reserve a concurrency slot.
    ///
    /// The slot is taken in the same step that compares against
    /// `max_concurrent`, so two requests racing for the last slot cannot both
    /// pass. The caller owns the returned slot for the rest of the request.
    pub async fn admit(self: &Arc<Self>, client: &str) -> Result<ConcurrencySlot, PrismError> {
        let rate = self.check_request_rate(client).await?;
        if !rate.allowed {
            warn!(client, reset_at = %rate.reset_at, "request rate exceeded");
            return Err(PrismError::RateLimited {
                client: client.to_string(),
                reset_at: rate.reset_at,
            });
        }
        self.acquire(client).await
    }

    /// Reserve one in-flight generation for `client`, refusing at
    /// `max_concurrent`.
    pub async fn acquire(self: &Arc<Self>, client: &str) -> Result<ConcurrencySlot, PrismError> {
        let max = self.config.max_concurrent;
        let (acquired, current) = self
            .store
            .incr_if_below(&concurrency_key(client), i64::from(max))
            .await?;
        if !acquired {
            warn!(client, current, max, "concurrent job limit reached");
            return Err(PrismError::ConcurrencyLimited {
                client: client.to_string(),
                current,
                max,
            });
        }
        debug!(client, in_flight = current, "concurrency slot acquired");
        Ok(ConcurrencySlot {
            limiter: Arc::clone(self),
            client: client.to_string(),
            released: false,
        })
    }

    /// Decrement the in-flight count; the key is removed at zero.
    pub async fn release(&self, client: &str) -> Result<i64, PrismError> {
        let key = concurrency_key(client);
        let current = self.store.decr(&key).await?;
        if current <= 0 {
            self.store.delete(&key).await?;
            debug!(client, in_flight = 0, "concurrency slot released");
            return Ok(0);
        }
        debug!(client, in_flight = current, "concurrency slot released");
        Ok(current)
    }

    /// Current in-flight count, never negative.
    pub async fn in_flight(&self, client: &str) -> Result<i64, PrismError> {
        Ok(self.store.get(&concurrency_key(client)).await?.max(0))
    }
}

/// One counted in-flight generation.
///
/// Call [`ConcurrencySlot::release`] on every exit path. A slot dropped
/// without release schedules the decrement on the current runtime.
pub struct ConcurrencySlot {
    limiter: Arc<RateLimiter>,
    client: String,
    released: bool,
}

impl std::fmt::Debug for ConcurrencySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencySlot")
            .field("client", &self.client)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ConcurrencySlot {
    /// Client key the slot is counted against.
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Give the slot back, returning the client's remaining in-flight count.
    pub async fn release(mut self) -> Result<i64, PrismError> {
        self.released = true;
        self.limiter.release(&self.client).await
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let limiter = Arc::clone(&self.limiter);
        let client = std::mem::take(&mut self.client);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = limiter.release(&client).await {
                        warn!(client = %client, error = %err, "failed to release dropped concurrency slot");
                    }
                });
            }
            Err(_) => warn!(client = %client, "concurrency slot dropped outside a runtime"),
        }
    }
}
