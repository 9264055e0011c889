use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{GenerationBackend, GenerationSpec, PollOutcome};
use crate::error::GenerationError;

/// Offline backend that settles every task successfully after `latency`.
///
/// Used by the CLI when no API key is configured.
pub struct SimulatedBackend {
    latency: Duration,
    next_task: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            next_task: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl GenerationBackend for SimulatedBackend {
    async fn submit(&self, spec: &GenerationSpec) -> Result<String, GenerationError> {
        if spec.prompt.trim().is_empty() {
            return Err(GenerationError::Backend {
                status: 400,
                message: "prompt must not be empty".into(),
            });
        }
        let n = self.next_task.fetch_add(1, Ordering::Relaxed);
        Ok(format!("sim-{n:04}-seed{}", spec.seed))
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome, GenerationError> {
        sleep(self.latency).await;
        Ok(PollOutcome::Succeeded {
            result_ref: format!("sim://{task_id}.mp4"),
        })
    }

    async fn download(&self, result_ref: &str) -> Result<String, GenerationError> {
        Ok(result_ref.replacen("sim://", "simulated/", 1))
    }
}
