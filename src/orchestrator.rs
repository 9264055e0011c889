use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::QualityPreset;
use crate::coordinator::{ShotCoordinator, ShotWork};
use crate::error::PrismError;
use crate::limiter::{ConcurrencySlot, RateLimiter};
use crate::matcher::{Intent, Template, TemplateCatalog, TemplateMatcher};
use crate::planner::{Planner, ShotPlan, apply_feedback};
use crate::state_machine::{Job, JobState, ShotAsset, ShotRequest, StateMachine};
use crate::store::JobStore;
use crate::validator::{Validator, backend_size, is_supported_resolution};

/// Which workflow is driving a job; picks the event names it logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Generation,
    Planning,
    Finalization,
    Revision,
}

impl Phase {
    fn submitted(self) -> &'static str {
        match self {
            Phase::Generation | Phase::Finalization => "workflow_submitted",
            Phase::Planning => "planning_submitted",
            Phase::Revision => "revision_submitted",
        }
    }

    fn started(self) -> &'static str {
        match self {
            Phase::Generation => "generation_started",
            Phase::Planning => "planning_started",
            Phase::Finalization => "finalization_started",
            Phase::Revision => "revision_started",
        }
    }

    fn complete(self) -> &'static str {
        match self {
            Phase::Generation => "generation_complete",
            Phase::Planning => "planning_complete",
            Phase::Finalization => "finalization_complete",
            Phase::Revision => "revision_complete",
        }
    }

    fn failed(self) -> &'static str {
        match self {
            Phase::Generation => "generation_failed",
            Phase::Planning => "planning_failed",
            Phase::Finalization => "finalization_failed",
            Phase::Revision => "revision_failed",
        }
    }
}

/// Output of the pre-execution pipeline. Nothing is persisted yet.
struct Prepared {
    intent: Intent,
    template: Template,
    requests: Vec<ShotRequest>,
}

/// Collaborators an orchestrator is built from.
pub struct OrchestratorParts {
    pub store: Arc<dyn JobStore>,
    pub limiter: Arc<RateLimiter>,
    pub matcher: TemplateMatcher,
    pub planner: Arc<dyn Planner>,
    pub coordinator: ShotCoordinator,
    pub catalog: Arc<TemplateCatalog>,
    pub quality_modes: BTreeMap<String, QualityPreset>,
    pub clock: Arc<dyn Clock>,
}

/// Drives jobs from request to assets through the state machine.
///
/// Throttling, clarification, and validation failures are returned before a
/// job exists. Once a job is stored, every failure lands on the job as
/// `FAILED` with classified error details.
///
/// Client-facing operations hold one concurrency slot from admission until
/// they return, whatever the outcome.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    matcher: TemplateMatcher,
    planner: Arc<dyn Planner>,
    coordinator: ShotCoordinator,
    catalog: Arc<TemplateCatalog>,
    quality_modes: BTreeMap<String, QualityPreset>,
    clock: Arc<dyn Clock>,
}

impl JobOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        Self {
            store: parts.store,
            limiter: parts.limiter,
            matcher: parts.matcher,
            planner: parts.planner,
            coordinator: parts.coordinator,
            catalog: parts.catalog,
            quality_modes: parts.quality_modes,
            clock: parts.clock,
        }
    }

    /// Plan and render preview candidates for a new request.
    pub async fn create_job(
        &self,
        text: &str,
        quality_mode: &str,
        client_key: &str,
    ) -> Result<Job, PrismError> {
        self.admitted(client_key, async {
            let prepared = self.prepare(text, quality_mode).await?;
            let preset = self.preset(quality_mode)?;
            let work = preview_work(&prepared.requests, preset);

            let job = self.record_job(prepared, quality_mode).await?;
            info!(job_id = %job.job_id, client = client_key, quality_mode, "job created");
            self.execute(&job.job_id, Phase::Generation, work).await
        })
        .await
    }

    /// Plan a request without rendering it.
    pub async fn plan_job(
        &self,
        text: &str,
        quality_mode: &str,
        client_key: &str,
    ) -> Result<Job, PrismError> {
        self.admitted(client_key, async {
            let prepared = self.prepare(text, quality_mode).await?;
            let job = self.record_job(prepared, quality_mode).await?;
            let job_id = job.job_id.clone();
            info!(job_id = %job_id, client = client_key, quality_mode, "job planned");

            let phase = Phase::Planning;
            let result = async {
                self.transition(&job_id, JobState::Submitted, phase.submitted())
                    .await?;
                self.transition(&job_id, JobState::Running, phase.started())
                    .await?;
                self.transition(&job_id, JobState::Succeeded, phase.complete())
                    .await
            }
            .await;

            if let Err(err) = &result {
                self.record_failure(&job_id, phase, err).await;
            }
            result
        })
        .await
    }

    /// Render preview candidates for a job planned earlier.
    pub async fn render_existing_job(&self, job_id: &str, client_key: &str) -> Result<Job, PrismError> {
        self.admitted(client_key, self.render_admitted(job_id)).await
    }

    async fn render_admitted(&self, job_id: &str) -> Result<Job, PrismError> {
        let job = self.get_job_status(job_id).await?;

        if matches!(job.state, JobState::Running | JobState::Failed) {
            return Err(PrismError::InvalidTransition {
                from: job.state,
                to: JobState::Running,
            });
        }
        if job.shot_requests.is_empty() {
            return Err(PrismError::InvalidRequest(format!(
                "job {job_id} has no shot requests"
            )));
        }
        if !job.shot_assets.is_empty() || !job.preview_shot_assets.is_empty() {
            return Err(PrismError::InvalidRequest(format!(
                "job {job_id} already has rendered assets"
            )));
        }

        let preset = self.preset(&job.quality_mode)?;
        let work = preview_work(&job.shot_requests, preset);
        self.execute(job_id, Phase::Generation, work).await
    }

    /// Re-render selected preview seeds at `target_resolution`.
    ///
    /// Final assets replace `shot_assets`; previews are kept.
    pub async fn finalize_job(
        &self,
        job_id: &str,
        selection: &BTreeMap<u32, u64>,
        target_resolution: &str,
        client_key: &str,
    ) -> Result<Job, PrismError> {
        self.admitted(
            client_key,
            self.finalize_admitted(job_id, selection, target_resolution),
        )
        .await
    }

    async fn finalize_admitted(
        &self,
        job_id: &str,
        selection: &BTreeMap<u32, u64>,
        target_resolution: &str,
    ) -> Result<Job, PrismError> {
        let mut job = self.get_job_status(job_id).await?;

        if job.state != JobState::Succeeded {
            return Err(PrismError::InvalidTransition {
                from: job.state,
                to: JobState::Running,
            });
        }
        if job.preview_shot_assets.is_empty() {
            return Err(PrismError::InvalidRequest(format!(
                "job {job_id} has no preview assets to finalize"
            )));
        }
        Validator::validate_seed_selection(&job, selection)?;
        if !is_supported_resolution(target_resolution) {
            return Err(PrismError::validation(format!(
                "unsupported resolution {target_resolution}"
            )));
        }

        let size = backend_size(target_resolution);
        let work = selection
            .iter()
            .filter_map(|(shot_id, seed)| {
                job.shot_request(*shot_id)
                    .map(|request| ShotWork::single(request.clone(), *seed, &size))
            })
            .collect();

        job.selected_seeds = selection.clone();
        self.store.save(&job).await?;
        info!(job_id, shots = selection.len(), resolution = target_resolution, "finalizing job");

        self.execute(job_id, Phase::Finalization, work).await
    }

    /// New job derived from a finished one, re-rendering only shots whose
    /// compiled request changed under `feedback`.
    pub async fn revise_job(&self, parent_job_id: &str, feedback: &str) -> Result<Job, PrismError> {
        let parent = self.get_job_status(parent_job_id).await?;
        if parent.state != JobState::Succeeded {
            return Err(PrismError::InvalidRequest(format!(
                "job {parent_job_id} is {}; only SUCCEEDED jobs can be revised",
                parent.state
            )));
        }
        let intent = parent.intent.clone().ok_or_else(|| {
            PrismError::InvalidRequest(format!("job {parent_job_id} has no recorded intent"))
        })?;
        let template = self.parent_template(&parent)?.clone();
        let preset = self.preset(&parent.quality_mode)?;

        let parsed = self.planner.parse_feedback(feedback, &intent).await?;
        Validator::validate_refinement(feedback, &parsed.targeted_fields)?;
        let revised = apply_feedback(&intent, &parsed);

        let plan = self.planner.instantiate(&revised, &template).await?;
        Validator::validate_plan(&plan, preset)?;
        let requests = self.compile_all(&plan, &revised, &template, preset).await?;

        let mut job = Job::new(&parent.quality_mode, Vec::new(), self.clock.now());
        let mut work = Vec::new();
        let mut reused = 0;
        for request in requests {
            match parent.shot_request(request.shot_id) {
                Some(previous) if *previous == request => {
                    reused += 1;
                    let id = request.shot_id;
                    job.shot_assets.extend(assets_for(&parent.shot_assets, id));
                    job.preview_shot_assets
                        .extend(assets_for(&parent.preview_shot_assets, id));
                    if let Some(seed) = parent.selected_seeds.get(&id) {
                        job.selected_seeds.insert(id, *seed);
                    }
                    job.shot_requests.push(previous.clone());
                }
                _ => {
                    work.push(ShotWork::previews(request.clone(), preset.preview_seeds));
                    job.shot_requests.push(request);
                }
            }
        }
        let regenerated = work.len();

        job.intent = Some(revised);
        job.template_id = Some(template.template_id.clone());
        job.template_version = Some(template.version.clone());
        job.revision_of = Some(parent_job_id.to_string());
        job.targeted_fields = parsed.targeted_fields;
        let job = self.store.create(job).await?;
        info!(
            job_id = %job.job_id,
            parent = parent_job_id,
            targeted = ?job.targeted_fields,
            reused,
            regenerated,
            "revision created"
        );

        let job = self.execute(&job.job_id, Phase::Revision, work).await?;
        info!(job_id = %job.job_id, parent = parent_job_id, reused, regenerated, "revision complete");
        Ok(job)
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Job, PrismError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| PrismError::JobNotFound(job_id.to_string()))
    }

    fn preset(&self, quality_mode: &str) -> Result<&QualityPreset, PrismError> {
        self.quality_modes
            .get(quality_mode)
            .ok_or_else(|| PrismError::UnknownQualityMode(quality_mode.to_string()))
    }

    fn parent_template(&self, parent: &Job) -> Result<&Template, PrismError> {
        let (Some(id), Some(version)) = (&parent.template_id, &parent.template_version) else {
            return Err(PrismError::InvalidRequest(format!(
                "job {} has no template",
                parent.job_id
            )));
        };
        self.catalog.get(id, version).ok_or_else(|| {
            PrismError::InvalidRequest(format!("template {id}:{version} is no longer in the catalog"))
        })
    }

    /// Intent, template match, plan, validation, and compilation.
    async fn prepare(&self, text: &str, quality_mode: &str) -> Result<Prepared, PrismError> {
        let preset = self.preset(quality_mode)?;
        let intent = self.planner.parse_intent(text, quality_mode).await?;

        let Some(matched) = self.matcher.match_intent(&intent, &self.catalog).await else {
            info!(topic = %intent.topic, "no template matched, asking for clarification");
            return Err(PrismError::ClarificationNeeded);
        };
        let template = matched.template;

        let plan = self.planner.instantiate(&intent, &template).await?;
        Validator::validate_plan(&plan, preset)?;
        let requests = self.compile_all(&plan, &intent, &template, preset).await?;

        Ok(Prepared {
            intent,
            template,
            requests,
        })
    }

    async fn compile_all(
        &self,
        plan: &ShotPlan,
        intent: &Intent,
        template: &Template,
        preset: &QualityPreset,
    ) -> Result<Vec<ShotRequest>, PrismError> {
        let mut requests = Vec::with_capacity(plan.shots.len());
        for shot in &plan.shots {
            requests.push(
                self.planner
                    .compile_shot(shot, plan, intent, template, preset)
                    .await?,
            );
        }
        Ok(requests)
    }

    async fn record_job(&self, prepared: Prepared, quality_mode: &str) -> Result<Job, PrismError> {
        let mut job = Job::new(quality_mode, prepared.requests, self.clock.now());
        job.template_id = Some(prepared.template.template_id);
        job.template_version = Some(prepared.template.version);
        job.intent = Some(prepared.intent);
        self.store.create(job).await
    }

    async fn transition(&self, job_id: &str, to: JobState, event: &str) -> Result<Job, PrismError> {
        StateMachine::transition(self.store.as_ref(), job_id, to, event, self.clock.now()).await
    }

    /// Admit `client_key`, run `work`, and give the slot back on every path.
    async fn admitted<T, F>(&self, client_key: &str, work: F) -> Result<T, PrismError>
    where
        F: Future<Output = Result<T, PrismError>>,
    {
        let slot = self.limiter.admit(client_key).await?;
        let result = work.await;
        release_slot(slot).await;
        result
    }

    /// Run `work` for a stored job and settle it.
    async fn execute(&self, job_id: &str, phase: Phase, work: Vec<ShotWork>) -> Result<Job, PrismError> {
        let started = Instant::now();
        let shot_count = work.len();

        match self.drive(job_id, phase, work).await {
            Ok(job) => {
                info!(
                    job_id,
                    phase = ?phase,
                    duration_ms = started.elapsed().as_millis() as u64,
                    shot_count,
                    quality_mode = %job.quality_mode,
                    assets = job.shot_assets.len(),
                    "generation finished"
                );
                Ok(job)
            }
            Err(err) => {
                self.record_failure(job_id, phase, &err).await;
                Err(err)
            }
        }
    }

    async fn drive(&self, job_id: &str, phase: Phase, work: Vec<ShotWork>) -> Result<Job, PrismError> {
        let mut job = self.get_job_status(job_id).await?;
        if job.state == JobState::Created {
            job = self
                .transition(job_id, JobState::Submitted, phase.submitted())
                .await?;
        }
        if job.state != JobState::Running {
            self.transition(job_id, JobState::Running, phase.started())
                .await?;
        }

        let report = self.coordinator.generate(job_id, work).await?;

        let mut job = self.get_job_status(job_id).await?;
        job.external_task_ids.extend(report.task_ids.iter().cloned());
        job.retry_count += report.retries;
        if report.is_total_failure() {
            warn!(
                job_id,
                phase = ?phase,
                failures = report.failures.len(),
                "every candidate failed"
            );
        }

        match phase {
            Phase::Finalization => job.shot_assets = report.assets,
            Phase::Generation | Phase::Planning | Phase::Revision => {
                job.preview_shot_assets.extend(report.assets.iter().cloned());
                job.shot_assets.extend(report.assets);
                job.preview_shot_assets.sort_by_key(|a| a.shot_id);
                job.shot_assets.sort_by_key(|a| a.shot_id);
            }
        }
        self.store.save(&job).await?;

        self.transition(job_id, JobState::Succeeded, phase.complete())
            .await
    }

    /// Store classified error details and move the job to FAILED when the
    /// current state allows it.
    async fn record_failure(&self, job_id: &str, phase: Phase, err: &PrismError) {
        let details = err.classify();
        warn!(
            job_id,
            phase = ?phase,
            error_code = %details.code,
            classification = ?details.classification,
            retryable = details.retryable,
            error = %err,
            "job failed"
        );

        let recorded = async {
            let mut job = self.get_job_status(job_id).await?;
            let state = job.state;
            job.error_details = Some(details);
            self.store.save(&job).await?;
            if state.can_transition_to(JobState::Failed) {
                self.transition(job_id, JobState::Failed, phase.failed())
                    .await?;
            }
            Ok::<_, PrismError>(())
        }
        .await;

        if let Err(record_err) = recorded {
            error!(job_id, error = %record_err, "could not record job failure");
        }
    }
}

async fn release_slot(slot: ConcurrencySlot) {
    let client = slot.client().to_string();
    if let Err(err) = slot.release().await {
        warn!(client = %client, error = %err, "failed to release concurrency slot");
    }
}

fn preview_work(requests: &[ShotRequest], preset: &QualityPreset) -> Vec<ShotWork> {
    requests
        .iter()
        .map(|request| ShotWork::previews(request.clone(), preset.preview_seeds))
        .collect()
}

fn assets_for(assets: &[ShotAsset], shot_id: u32) -> impl Iterator<Item = ShotAsset> + '_ {
    assets
        .iter()
        .filter(move |a| a.shot_id == shot_id)
        .cloned()
}
