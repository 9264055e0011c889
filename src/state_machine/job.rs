use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobState, StateMachine};
use crate::error::{ErrorDetails, PrismError};
use crate::matcher::Intent;

/// Backend parameters for one shot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotParams {
    /// Backend size string, `W*H`.
    pub size: String,
    pub duration_s: u32,
    pub seed: u64,
    #[serde(default)]
    pub prompt_extend: bool,
    #[serde(default)]
    pub watermark: bool,
}

/// Compiled, backend-ready request for one shot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotRequest {
    pub shot_id: u32,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub params: ShotParams,
}

/// A generated, downloaded, and split candidate for one shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotAsset {
    pub shot_id: u32,
    pub seed: u64,
    pub task_id: String,
    /// Downloaded file before splitting.
    pub raw_ref: String,
    pub video_ref: String,
    /// `None` when the splitter was unavailable and the raw file was kept.
    pub audio_ref: Option<String>,
    pub duration_s: f64,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
    pub event: String,
}

impl StateTransition {
    pub fn new(state: JobState, timestamp: DateTime<Utc>, event: &str) -> Self {
        let event = if event.is_empty() {
            "state_updated".to_string()
        } else {
            event.to_string()
        };
        Self {
            state,
            timestamp,
            event,
        }
    }
}

/// One generation request and everything recorded about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub state: JobState,
    pub quality_mode: String,
    #[serde(default)]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_version: Option<String>,
    pub shot_requests: Vec<ShotRequest>,
    #[serde(default)]
    pub shot_assets: Vec<ShotAsset>,
    #[serde(default)]
    pub preview_shot_assets: Vec<ShotAsset>,
    /// shot_id → seed chosen for finalization.
    #[serde(default)]
    pub selected_seeds: BTreeMap<u32, u64>,
    #[serde(default)]
    pub external_task_ids: Vec<String>,
    #[serde(default)]
    pub error_details: Option<ErrorDetails>,
    pub state_transitions: Vec<StateTransition>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub revision_of: Option<String>,
    #[serde(default)]
    pub targeted_fields: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub succeeded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A CREATED job whose log already holds its creation entry.
    pub fn new(quality_mode: &str, shot_requests: Vec<ShotRequest>, at: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            state: JobState::Created,
            quality_mode: quality_mode.to_string(),
            intent: None,
            template_id: None,
            template_version: None,
            shot_requests,
            shot_assets: Vec::new(),
            preview_shot_assets: Vec::new(),
            selected_seeds: BTreeMap::new(),
            external_task_ids: Vec::new(),
            error_details: None,
            state_transitions: vec![StateTransition::new(
                JobState::Created,
                at,
                "job_created",
            )],
            retry_count: 0,
            revision_of: None,
            targeted_fields: Vec::new(),
            created_at: at,
            updated_at: at,
            submitted_at: None,
            running_at: None,
            succeeded_at: None,
            failed_at: None,
        }
    }

    /// Validate and apply one transition, updating the state, the log, and
    /// the milestone timestamp for the target state.
    pub fn apply_transition(&mut self, entry: StateTransition) -> Result<(), PrismError> {
        StateMachine::validate(self.state, entry.state)?;
        let at = entry.timestamp;
        match entry.state {
            JobState::Submitted => self.submitted_at = Some(at),
            JobState::Running => self.running_at = Some(at),
            JobState::Succeeded => self.succeeded_at = Some(at),
            JobState::Failed => self.failed_at = Some(at),
            JobState::Created => {}
        }
        self.state = entry.state;
        self.updated_at = at;
        self.state_transitions.push(entry);
        Ok(())
    }

    /// Request for `shot_id`, if the job has one.
    pub fn shot_request(&self, shot_id: u32) -> Option<&ShotRequest> {
        self.shot_requests.iter().find(|r| r.shot_id == shot_id)
    }

    /// Seeds generated as previews for `shot_id`.
    pub fn preview_seeds(&self, shot_id: u32) -> Vec<u64> {
        self.preview_shot_assets
            .iter()
            .filter(|a| a.shot_id == shot_id)
            .map(|a| a.seed)
            .collect()
    }
}

/// Summary of a job printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub state: JobState,
    pub quality_mode: String,
    pub template: Option<String>,
    pub transitions: Vec<String>,
    pub shots_requested: usize,
    pub shots_with_assets: usize,
    pub asset_count: usize,
    pub preview_count: usize,
    pub retry_count: u32,
    pub revision_of: Option<String>,
    pub error_code: Option<String>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        let mut with_assets: Vec<u32> = job.shot_assets.iter().map(|a| a.shot_id).collect();
        with_assets.sort_unstable();
        with_assets.dedup();

        let template = match (&job.template_id, &job.template_version) {
            (Some(id), Some(version)) => Some(format!("{id}@{version}")),
            (Some(id), None) => Some(id.clone()),
            _ => None,
        };

        Self {
            job_id: job.job_id.clone(),
            state: job.state,
            quality_mode: job.quality_mode.clone(),
            template,
            transitions: job
                .state_transitions
                .iter()
                .map(|t| format!("{} ({})", t.state, t.event))
                .collect(),
            shots_requested: job.shot_requests.len(),
            shots_with_assets: with_assets.len(),
            asset_count: job.shot_assets.len(),
            preview_count: job.preview_shot_assets.len(),
            retry_count: job.retry_count,
            revision_of: job.revision_of.clone(),
            error_code: job.error_details.as_ref().map(|d| d.code.clone()),
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}
