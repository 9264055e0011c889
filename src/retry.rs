//! Bounded exponential-backoff resubmission of backend tasks.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::backend::{GenerationBackend, GenerationSpec};
use crate::config::RetryConfig;
use crate::error::GenerationError;

/// What one submission attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Submitted {
        task_id: String,
    },
    Failed {
        code: String,
        retryable: bool,
        /// Sleep before the next attempt; `None` when no further attempt follows.
        next_delay: Option<Duration>,
    },
}

/// One submission attempt, as reported to an [`AttemptObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
    pub seed: u64,
    pub outcome: AttemptOutcome,
}

/// Receives one record per submission attempt.
pub trait AttemptObserver: Send + Sync {
    fn on_attempt(&self, record: &AttemptRecord);
}

/// An accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Backend task id of the accepted attempt.
    pub task_id: String,
    /// Attempts made, including the accepted one.
    pub attempts: u32,
}

/// Submission that never got a task id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{last} (after {attempts} attempt(s))")]
pub struct SubmitError {
    /// Error from the final attempt.
    pub last: GenerationError,
    pub attempts: u32,
}

/// Wraps a [`GenerationBackend`] so transient submit failures are retried.
///
/// Attempt `n` that fails with a retryable error sleeps
/// `min(base_delay_ms * 2^(n - 1), max_delay_ms)` before attempt `n + 1`.
/// Only submission is retried; polling and downloads are not.
pub struct RetryAdapter {
    backend: Arc<dyn GenerationBackend>,
    config: RetryConfig,
    observer: Option<Arc<dyn AttemptObserver>>,
}

impl RetryAdapter {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: RetryConfig) -> Self {
        Self {
            backend,
            config,
            observer: None,
        }
    }

    /// Report every attempt to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn observe(&self, record: AttemptRecord) {
        if let Some(observer) = &self.observer {
            observer.on_attempt(&record);
        }
    }

    /// Submit `spec`, resubmitting retryable failures until the attempt
    /// budget is spent. Non-retryable failures end the loop at once.
    pub async fn submit(&self, spec: &GenerationSpec) -> Result<Submission, SubmitError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.backend.submit(spec).await {
                Ok(task_id) => {
                    if attempt > 1 {
                        info!(attempt, seed = spec.seed, task_id = %task_id, "submission succeeded after retry");
                    }
                    self.observe(AttemptRecord {
                        attempt,
                        max_attempts,
                        seed: spec.seed,
                        outcome: AttemptOutcome::Submitted {
                            task_id: task_id.clone(),
                        },
                    });
                    return Ok(Submission {
                        task_id,
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    let code = err.classify().code;
                    let exhausted = attempt >= max_attempts;
                    let next_delay =
                        (retryable && !exhausted).then(|| self.config.delay_for_attempt(attempt));

                    self.observe(AttemptRecord {
                        attempt,
                        max_attempts,
                        seed: spec.seed,
                        outcome: AttemptOutcome::Failed {
                            code: code.clone(),
                            retryable,
                            next_delay,
                        },
                    });

                    let Some(delay) = next_delay else {
                        if retryable {
                            warn!(attempt, max_attempts, seed = spec.seed, error_code = %code, error = %err, "submission retries exhausted");
                        } else {
                            warn!(attempt, seed = spec.seed, error_code = %code, error = %err, "non-retryable submission failure");
                        }
                        return Err(SubmitError {
                            last: err,
                            attempts: attempt,
                        });
                    };

                    warn!(
                        attempt,
                        max_attempts,
                        seed = spec.seed,
                        error_code = %code,
                        delay_ms = delay.as_millis() as u64,
                        "submission failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
