//! Per-shot fan-out of backend work.
//!
//! Every shot runs as its own task; a shot's candidates run in order inside
//! it. A failed candidate is recorded and the rest carry on, so one bad shot
//! never cancels another.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{GenerationBackend, GenerationSpec, PollOutcome};
use crate::error::{ErrorDetails, GenerationError, PrismError};
use crate::media::{MediaSplitter, SplitRequest};
use crate::retry::RetryAdapter;
use crate::state_machine::{ShotAsset, ShotRequest};
use crate::validator::normalize_resolution;

/// Candidates to render for one shot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShotWork {
    pub request: ShotRequest,
    /// One candidate per seed, rendered in this order.
    pub seeds: Vec<u64>,
    /// Backend size string, `W*H`.
    pub size: String,
}

impl ShotWork {
    /// `count` preview candidates seeded `seed, seed + 1, ...`.
    pub fn previews(request: ShotRequest, count: u32) -> Self {
        let base = request.params.seed;
        let seeds = (0..u64::from(count.max(1))).map(|i| base + i).collect();
        let size = request.params.size.clone();
        Self {
            request,
            seeds,
            size,
        }
    }

    /// One candidate at a fixed seed and size.
    pub fn single(request: ShotRequest, seed: u64, size: &str) -> Self {
        Self {
            request,
            seeds: vec![seed],
            size: size.to_string(),
        }
    }
}

/// A candidate that produced no asset.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFailure {
    pub shot_id: u32,
    pub seed: u64,
    /// Set when the backend accepted the task before it failed.
    pub task_id: Option<String>,
    pub error: GenerationError,
}

impl CandidateFailure {
    /// Taxonomy entry for the failure.
    pub fn details(&self) -> ErrorDetails {
        self.error.classify()
    }
}

/// Settled outcome of one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateResult {
    Produced(ShotAsset),
    Failed(CandidateFailure),
}

#[derive(Debug, Clone, PartialEq)]
struct CandidateRun {
    result: CandidateResult,
    attempts: u32,
}

/// Outcome of one coordinated generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationReport {
    /// In shot order, then candidate order.
    pub assets: Vec<ShotAsset>,
    pub failures: Vec<CandidateFailure>,
    /// Every task id the backend accepted.
    pub task_ids: Vec<String>,
    /// Submissions beyond the first, summed over candidates.
    pub retries: u32,
}

impl GenerationReport {
    /// Every candidate failed and nothing was produced.
    pub fn is_total_failure(&self) -> bool {
        self.assets.is_empty() && !self.failures.is_empty()
    }
}

/// Renders [`ShotWork`] against a backend: submit with retry, poll,
/// download, then split into video and audio.
#[derive(Clone)]
pub struct ShotCoordinator {
    backend: Arc<dyn GenerationBackend>,
    retry: Arc<RetryAdapter>,
    splitter: Arc<dyn MediaSplitter>,
}

impl ShotCoordinator {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        retry: RetryAdapter,
        splitter: Arc<dyn MediaSplitter>,
    ) -> Self {
        Self {
            backend,
            retry: Arc::new(retry),
            splitter,
        }
    }

    /// Render every shot concurrently and wait for all of them.
    ///
    /// Errors only when a shot task itself dies; candidate failures are
    /// reported in the returned [`GenerationReport`].
    pub async fn generate(
        &self,
        job_id: &str,
        work: Vec<ShotWork>,
    ) -> Result<GenerationReport, PrismError> {
        let mut tasks = JoinSet::new();
        for (index, item) in work.into_iter().enumerate() {
            let this = self.clone();
            let job_id = job_id.to_string();
            tasks.spawn(async move { (index, this.run_shot(&job_id, item).await) });
        }

        let mut shots = Vec::new();
        let mut aborted = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(shot) => shots.push(shot),
                Err(err) => {
                    error!(job_id, error = %err, "shot task aborted");
                    aborted.push(err.to_string());
                }
            }
        }
        if let Some(first) = aborted.into_iter().next() {
            return Err(GenerationError::Other(format!("shot task aborted: {first}")).into());
        }

        shots.sort_by_key(|(index, _)| *index);
        let mut report = GenerationReport::default();
        for run in shots.into_iter().flat_map(|(_, runs)| runs) {
            report.retries += run.attempts.saturating_sub(1);
            match run.result {
                CandidateResult::Produced(asset) => {
                    report.task_ids.push(asset.task_id.clone());
                    report.assets.push(asset);
                }
                CandidateResult::Failed(failure) => {
                    if let Some(task_id) = &failure.task_id {
                        report.task_ids.push(task_id.clone());
                    }
                    report.failures.push(failure);
                }
            }
        }
        Ok(report)
    }

    async fn run_shot(&self, job_id: &str, work: ShotWork) -> Vec<CandidateRun> {
        let mut runs = Vec::with_capacity(work.seeds.len());
        for &seed in &work.seeds {
            runs.push(self.run_candidate(job_id, &work.request, seed, &work.size).await);
        }
        runs
    }

    async fn run_candidate(
        &self,
        job_id: &str,
        request: &ShotRequest,
        seed: u64,
        size: &str,
    ) -> CandidateRun {
        let shot_id = request.shot_id;
        let failed = |task_id: Option<String>, error: GenerationError, attempts: u32| {
            let details = error.classify();
            warn!(
                job_id,
                shot_id,
                seed,
                task_id = task_id.as_deref().unwrap_or("-"),
                error_code = %details.code,
                retryable = details.retryable,
                "candidate failed"
            );
            CandidateRun {
                result: CandidateResult::Failed(CandidateFailure {
                    shot_id,
                    seed,
                    task_id,
                    error,
                }),
                attempts,
            }
        };

        let spec = GenerationSpec::for_candidate(request, size, seed);
        let submission = match self.retry.submit(&spec).await {
            Ok(submission) => submission,
            Err(err) => return failed(None, err.last, err.attempts),
        };
        let attempts = submission.attempts;
        let task_id = submission.task_id;

        let result_ref = match self.backend.poll(&task_id).await {
            Ok(PollOutcome::Succeeded { result_ref }) => result_ref,
            Ok(PollOutcome::Failed { code, message }) => {
                return failed(
                    Some(task_id),
                    GenerationError::TaskFailed { code, message },
                    attempts,
                );
            }
            Err(err) => return failed(Some(task_id), err, attempts),
        };

        let raw_ref = match self.backend.download(&result_ref).await {
            Ok(local) => local,
            Err(err) => return failed(Some(task_id), err, attempts),
        };

        let split = SplitRequest {
            raw_ref: raw_ref.clone(),
            job_id: job_id.to_string(),
            shot_id,
            seed,
        };
        let (video_ref, audio_ref, duration_s) = self
            .split_or_keep_raw(split, f64::from(request.params.duration_s))
            .await;

        info!(job_id, shot_id, seed, task_id = %task_id, "candidate produced");
        CandidateRun {
            result: CandidateResult::Produced(ShotAsset {
                shot_id,
                seed,
                task_id,
                raw_ref,
                video_ref,
                audio_ref,
                duration_s,
                resolution: normalize_resolution(size),
            }),
            attempts,
        }
    }

    /// Split on the blocking pool; on any failure keep the raw clip as the
    /// video with no audio and the requested duration.
    async fn split_or_keep_raw(
        &self,
        request: SplitRequest,
        requested_duration_s: f64,
    ) -> (String, Option<String>, f64) {
        let splitter = Arc::clone(&self.splitter);
        let raw_ref = request.raw_ref.clone();
        let (job_id, shot_id, seed) = (request.job_id.clone(), request.shot_id, request.seed);

        match tokio::task::spawn_blocking(move || splitter.split(&request)).await {
            Ok(Ok(output)) => {
                debug!(job_id = %job_id, shot_id, seed, "candidate split");
                (output.video_ref, Some(output.audio_ref), output.duration_s)
            }
            Ok(Err(err)) => {
                warn!(job_id = %job_id, shot_id, seed, error_code = %err.code, error = %err.message, "split failed, keeping raw clip");
                (raw_ref, None, requested_duration_s)
            }
            Err(err) => {
                warn!(job_id = %job_id, shot_id, seed, error = %err, "split task failed, keeping raw clip");
                (raw_ref, None, requested_duration_s)
            }
        }
    }
}
