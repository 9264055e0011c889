//! Shared test doubles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::backend::{GenerationBackend, GenerationSpec, PollOutcome};
use crate::config::QualityPreset;
use crate::error::{GenerationError, PrismError, codes};
use crate::matcher::{Intent, ShotSkeleton, Template, TemplateCatalog, TemplateConstraints, TemplateTags};
use crate::media::{MediaSplitter, SplitError, SplitOutput, SplitRequest};
use crate::planner::{Feedback, PlannedShot, Planner, ShotPlan, emotion_at};
use crate::state_machine::{Job, ShotParams, ShotRequest, StateTransition};
use crate::store::{InMemoryJobStore, JobStore};

pub fn spec(seed: u64) -> GenerationSpec {
    GenerationSpec {
        prompt: "a lighthouse at dusk".into(),
        negative_prompt: String::new(),
        size: "1280*720".into(),
        duration_s: 4,
        seed,
        prompt_extend: false,
        watermark: false,
    }
}

fn skeleton(shot_id: u32, duration_s: u32, visual: &str, camera: &str) -> ShotSkeleton {
    ShotSkeleton {
        shot_id,
        duration_s,
        visual: visual.into(),
        camera_motion: camera.into(),
        narration: None,
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Two templates: a three-shot product launch and a two-shot city walk.
pub fn fixture_catalog() -> TemplateCatalog {
    TemplateCatalog::new(vec![
        Template {
            template_id: "product_launch".into(),
            version: "1.0".into(),
            tags: TemplateTags {
                topic: strings(&["product launch"]),
                tone: strings(&["bright"]),
                style: strings(&["sleek", "modern"]),
                emotion: strings(&["curious", "excited"]),
            },
            emotion_curve: strings(&["curious", "excited"]),
            constraints: TemplateConstraints::default(),
            shot_skeletons: vec![
                skeleton(1, 4, "product silhouette in shadow", "slow push in"),
                skeleton(2, 4, "hands unboxing the product", "handheld"),
                skeleton(3, 4, "hero shot on a turntable", "orbit"),
            ],
            negative_prompt_base: "blurry, low quality".into(),
        },
        Template {
            template_id: "city_walk".into(),
            version: "1.0".into(),
            tags: TemplateTags {
                topic: strings(&["city walk", "travel"]),
                tone: strings(&["warm"]),
                style: strings(&["cinematic", "vlog"]),
                emotion: strings(&["nostalgic", "calm"]),
            },
            emotion_curve: strings(&["calm", "nostalgic"]),
            constraints: TemplateConstraints::default(),
            shot_skeletons: vec![
                skeleton(1, 5, "street crossing from above", "static"),
                skeleton(2, 5, "walking past shop windows", "tracking"),
            ],
            negative_prompt_base: String::new(),
        },
    ])
}

/// Intent that matches `product_launch` with the keyword scorer.
pub fn launch_intent(quality_mode: &str) -> Intent {
    let mut intent = Intent::new("product launch", quality_mode);
    intent.emotion_curve = strings(&["curious", "excited"]);
    intent.style.visual = "sleek".into();
    intent.style.color_tone = "bright".into();
    intent
}

/// Backend whose failures are scripted per seed.
#[derive(Default)]
pub struct ScriptedBackend {
    submit_failures: Mutex<HashMap<u64, VecDeque<GenerationError>>>,
    poll_failures: Mutex<HashSet<u64>>,
    download_failures: Mutex<HashSet<u64>>,
    tasks: Mutex<HashMap<String, u64>>,
    submitted: Mutex<Vec<GenerationSpec>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next submits for `seed` with `errors`, in order.
    pub fn fail_submit(&self, seed: u64, errors: Vec<GenerationError>) {
        self.submit_failures
            .lock()
            .unwrap()
            .entry(seed)
            .or_default()
            .extend(errors);
    }

    pub fn fail_poll(&self, seed: u64) {
        self.poll_failures.lock().unwrap().insert(seed);
    }

    pub fn fail_download(&self, seed: u64) {
        self.download_failures.lock().unwrap().insert(seed);
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn submitted(&self) -> Vec<GenerationSpec> {
        self.submitted.lock().unwrap().clone()
    }

    fn seed_of(&self, task_id: &str) -> Result<u64, GenerationError> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .copied()
            .ok_or_else(|| GenerationError::Backend {
                status: 404,
                message: format!("unknown task {task_id}"),
            })
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn submit(&self, spec: &GenerationSpec) -> Result<String, GenerationError> {
        let n = {
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(spec.clone());
            submitted.len()
        };
        if let Some(err) = self
            .submit_failures
            .lock()
            .unwrap()
            .get_mut(&spec.seed)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let task_id = format!("task-{}-{n}", spec.seed);
        self.tasks.lock().unwrap().insert(task_id.clone(), spec.seed);
        Ok(task_id)
    }

    async fn poll(&self, task_id: &str) -> Result<PollOutcome, GenerationError> {
        let seed = self.seed_of(task_id)?;
        if self.poll_failures.lock().unwrap().contains(&seed) {
            return Ok(PollOutcome::Failed {
                code: Some("DataInspectionFailed".into()),
                message: "content rejected".into(),
            });
        }
        Ok(PollOutcome::Succeeded {
            result_ref: format!("https://cdn.test/{task_id}.mp4"),
        })
    }

    async fn download(&self, result_ref: &str) -> Result<String, GenerationError> {
        let task_id = result_ref
            .trim_start_matches("https://cdn.test/")
            .trim_end_matches(".mp4");
        let seed = self.seed_of(task_id)?;
        if self.download_failures.lock().unwrap().contains(&seed) {
            return Err(GenerationError::Network("download interrupted".into()));
        }
        Ok(format!("/tmp/prism/{task_id}.mp4"))
    }
}

/// Splitter that either always succeeds or always reports missing tooling.
#[derive(Default)]
pub struct FakeSplitter {
    pub fail: bool,
    calls: AtomicUsize,
}

impl FakeSplitter {
    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MediaSplitter for FakeSplitter {
    fn split(&self, request: &SplitRequest) -> Result<SplitOutput, SplitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SplitError::new(codes::FFMPEG_NOT_FOUND, "ffmpeg not found"));
        }
        Ok(SplitOutput {
            video_ref: format!("{}.video.mp4", request.raw_ref),
            audio_ref: format!("{}.audio.m4a", request.raw_ref),
            duration_s: 4.0,
        })
    }
}

/// Planner returning a fixed intent and fixed feedback.
///
/// Shot `n` compiles with seed `n * 100`; prompts carry camera, lighting,
/// and the shot's point on the emotion curve.
pub struct StaticPlanner {
    pub intent: Intent,
    pub feedback: Feedback,
}

impl StaticPlanner {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            feedback: Feedback::default(),
        }
    }

    pub fn with_feedback(mut self, feedback: Feedback) -> Self {
        self.feedback = feedback;
        self
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn parse_intent(&self, _text: &str, quality_mode: &str) -> Result<Intent, PrismError> {
        tokio::task::yield_now().await;
        let mut intent = self.intent.clone();
        intent.quality_mode = quality_mode.to_string();
        Ok(intent)
    }

    async fn instantiate(&self, intent: &Intent, template: &Template) -> Result<ShotPlan, PrismError> {
        Ok(ShotPlan {
            template_id: template.template_id.clone(),
            template_version: template.version.clone(),
            subtitle_policy: intent.subtitle_policy.clone(),
            resolution: intent.resolution.clone(),
            shots: template
                .shot_skeletons
                .iter()
                .map(|s| PlannedShot {
                    shot_id: s.shot_id,
                    duration_s: s.duration_s,
                    visual: s.visual.clone(),
                    camera_motion: if intent.scene.camera_motion.is_empty() {
                        s.camera_motion.clone()
                    } else {
                        intent.scene.camera_motion.clone()
                    },
                    narration: None,
                })
                .collect(),
        })
    }

    async fn compile_shot(
        &self,
        shot: &PlannedShot,
        plan: &ShotPlan,
        intent: &Intent,
        _template: &Template,
        preset: &QualityPreset,
    ) -> Result<ShotRequest, PrismError> {
        let index = plan
            .shots
            .iter()
            .position(|s| s.shot_id == shot.shot_id)
            .unwrap_or(0);
        let mood = emotion_at(&intent.emotion_curve, index, plan.shots.len()).unwrap_or("");
        Ok(ShotRequest {
            shot_id: shot.shot_id,
            prompt: format!(
                "{}; camera {}; lighting {}; mood {mood}",
                shot.visual, shot.camera_motion, intent.style.lighting
            ),
            negative_prompt: String::new(),
            params: ShotParams {
                size: preset.preview_size.clone(),
                duration_s: shot.duration_s,
                seed: u64::from(shot.shot_id) * 100,
                prompt_extend: false,
                watermark: false,
            },
        })
    }

    async fn parse_feedback(&self, _feedback: &str, _intent: &Intent) -> Result<Feedback, PrismError> {
        Ok(self.feedback.clone())
    }
}

/// In-memory job store whose next `save` calls can be made to fail.
pub struct FlakyJobStore {
    inner: InMemoryJobStore,
    failing_saves: AtomicUsize,
}

impl FlakyJobStore {
    pub fn new(inner: InMemoryJobStore) -> Self {
        Self {
            inner,
            failing_saves: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for FlakyJobStore {
    async fn create(&self, job: Job) -> Result<Job, PrismError> {
        self.inner.create(job).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PrismError> {
        self.inner.get(job_id).await
    }

    async fn save(&self, job: &Job) -> Result<Job, PrismError> {
        let failed = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PrismError::Store("write rejected".into()));
        }
        self.inner.save(job).await
    }

    async fn append_transition(
        &self,
        job_id: &str,
        entry: StateTransition,
    ) -> Result<Job, PrismError> {
        self.inner.append_transition(job_id, entry).await
    }

    async fn list(&self) -> Result<Vec<Job>, PrismError> {
        self.inner.list().await
    }
}
