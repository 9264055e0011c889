//! Wire types for the asynchronous video-synthesis API.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub model: String,
    pub input: SynthesisInput,
    pub parameters: SynthesisParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub negative_prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisParameters {
    pub size: String,
    pub duration: u32,
    pub seed: u64,
    pub prompt_extend: bool,
    pub watermark: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskOutput {
    pub task_id: String,
    pub task_status: TaskStatus,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskResponse {
    pub output: TaskOutput,
    #[serde(default)]
    pub request_id: Option<String>,
}
