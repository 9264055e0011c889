//! Generation backend seam.
//!
//! A backend accepts one shot at a time, hands back a task id, and is polled
//! until the task settles. Finished results are downloaded to a local ref that
//! the media splitter can read.

pub mod client;
pub mod simulated;
pub mod types;

use async_trait::async_trait;

pub use client::WanClient;
pub use simulated::SimulatedBackend;

use crate::error::GenerationError;
use crate::state_machine::ShotRequest;

/// Everything the backend needs to render one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSpec {
    pub prompt: String,
    pub negative_prompt: String,
    pub size: String,
    pub duration_s: u32,
    pub seed: u64,
    pub prompt_extend: bool,
    pub watermark: bool,
}

impl GenerationSpec {
    /// Candidate spec for `request` at `size` with `seed`.
    pub fn for_candidate(request: &ShotRequest, size: &str, seed: u64) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            size: size.to_string(),
            duration_s: request.params.duration_s,
            seed,
            prompt_extend: request.params.prompt_extend,
            watermark: request.params.watermark,
        }
    }
}

/// Settled state of a backend task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded { result_ref: String },
    Failed {
        code: Option<String>,
        message: String,
    },
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submit one candidate, returning the backend task id.
    async fn submit(&self, spec: &GenerationSpec) -> Result<String, GenerationError>;

    /// Wait until the task settles.
    async fn poll(&self, task_id: &str) -> Result<PollOutcome, GenerationError>;

    /// Fetch a finished result, returning a local ref.
    async fn download(&self, result_ref: &str) -> Result<String, GenerationError>;
}
