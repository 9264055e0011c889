use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

use super::types::{
    SynthesisInput, SynthesisParameters, SynthesisRequest, TaskOutput, TaskResponse, TaskStatus,
};
use super::{GenerationBackend, GenerationSpec, PollOutcome};
use crate::config::BackendConfig;
use crate::error::{GenerationError, PrismError};

const SYNTHESIS_PATH: &str = "/services/aigc/video-generation/video-synthesis";

/// Client for the asynchronous text-to-video synthesis API.
pub struct WanClient {
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
    poll_interval: Duration,
    max_poll_attempts: u32,
    download_dir: PathBuf,
}

impl WanClient {
    pub fn new(config: &BackendConfig) -> Result<Self, PrismError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_poll_attempts: config.max_poll_attempts.max(1),
            download_dir: PathBuf::from(&config.download_dir),
        })
    }

    async fn fetch_task(&self, task_id: &str) -> Result<TaskOutput, GenerationError> {
        let response = self
            .client
            .get(format!("{}/tasks/{task_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let body = check_status(response).await?.json::<TaskResponse>().await?;
        Ok(body.output)
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerationError::NetworkTimeout(err.to_string())
        } else if let Some(status) = err.status() {
            GenerationError::Backend {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            GenerationError::Other(format!("malformed backend response: {err}"))
        } else {
            GenerationError::Network(err.to_string())
        }
    }
}

async fn check_status(response: Response) -> Result<Response, GenerationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(GenerationError::Backend {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl GenerationBackend for WanClient {
    async fn submit(&self, spec: &GenerationSpec) -> Result<String, GenerationError> {
        let body = SynthesisRequest {
            model: self.model.clone(),
            input: SynthesisInput {
                prompt: spec.prompt.clone(),
                negative_prompt: spec.negative_prompt.clone(),
            },
            parameters: SynthesisParameters {
                size: spec.size.clone(),
                duration: spec.duration_s,
                seed: spec.seed,
                prompt_extend: spec.prompt_extend,
                watermark: spec.watermark,
            },
        };

        let response = self
            .client
            .post(format!("{}{SYNTHESIS_PATH}", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-DashScope-Async", "enable")
            .json(&body)
            .send()
            .await?;
        let task = check_status(response).await?.json::<TaskResponse>().await?;
        debug!(task_id = %task.output.task_id, seed = spec.seed, "task submitted");
        Ok(task.output.task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome, GenerationError> {
        for attempt in 1..=self.max_poll_attempts {
            let output = self.fetch_task(task_id).await?;
            match output.task_status {
                TaskStatus::Succeeded => {
                    let result_ref = output.video_url.ok_or_else(|| {
                        GenerationError::Other(format!("task {task_id} succeeded without a video url"))
                    })?;
                    return Ok(PollOutcome::Succeeded { result_ref });
                }
                TaskStatus::Failed | TaskStatus::Canceled => {
                    let code = output.code.or_else(|| {
                        (output.task_status == TaskStatus::Canceled).then(|| "CANCELED".to_string())
                    });
                    return Ok(PollOutcome::Failed {
                        code,
                        message: output.message.unwrap_or_else(|| "task failed".to_string()),
                    });
                }
                TaskStatus::Pending | TaskStatus::Running | TaskStatus::Unknown => {
                    debug!(task_id, attempt, status = ?output.task_status, "task not settled");
                    if attempt < self.max_poll_attempts {
                        sleep(self.poll_interval).await;
                    }
                }
            }
        }
        Err(GenerationError::NetworkTimeout(format!(
            "task {task_id} did not settle after {} polls",
            self.max_poll_attempts
        )))
    }

    async fn download(&self, result_ref: &str) -> Result<String, GenerationError> {
        let response = self.client.get(result_ref).send().await?;
        let bytes = check_status(response).await?.bytes().await?;

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| GenerationError::Other(format!("cannot create download dir: {e}")))?;
        let path = self.download_dir.join(format!("{}.mp4", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| GenerationError::Other(format!("cannot write {}: {e}", path.display())))?;

        debug!(path = %path.display(), bytes = bytes.len(), "result downloaded");
        Ok(path.to_string_lossy().into_owned())
    }
}
