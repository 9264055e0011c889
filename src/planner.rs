//! Planning collaborator: intent parsing, template instantiation, shot
//! compilation, and feedback parsing.
//!
//! Production deployments back [`Planner`] with a language model. The
//! [`HeuristicPlanner`] here reads requests with keyword tables, which is
//! enough to drive the engine offline and in the CLI demo.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::QualityPreset;
use crate::error::PrismError;
use crate::matcher::{Intent, Template, TemplateCatalog, tokenize_phrase};
use crate::state_machine::{ShotParams, ShotRequest};

/// Fields a revision may target.
pub const REFINABLE_FIELDS: [&str; 5] = ["camera", "narration", "lighting", "emotion", "pacing"];

const BASE_SEED: u64 = 12345;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedShot {
    pub shot_id: u32,
    pub duration_s: u32,
    pub visual: String,
    pub camera_motion: String,
    #[serde(default)]
    pub narration: Option<String>,
}

/// A template instantiated for one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotPlan {
    pub template_id: String,
    pub template_version: String,
    pub subtitle_policy: String,
    pub resolution: String,
    pub shots: Vec<PlannedShot>,
}

impl ShotPlan {
    pub fn total_duration_s(&self) -> u32 {
        self.shots.iter().map(|s| s.duration_s).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackChanges {
    #[serde(default)]
    pub camera_motion: Option<String>,
    #[serde(default)]
    pub narration_tone: Option<String>,
    #[serde(default)]
    pub lighting: Option<String>,
    #[serde(default)]
    pub emotion_curve: Option<Vec<String>>,
    #[serde(default)]
    pub duration_s: Option<u32>,
}

/// Structured reading of revision feedback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub targeted_fields: Vec<String>,
    pub changes: FeedbackChanges,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn parse_intent(&self, text: &str, quality_mode: &str) -> Result<Intent, PrismError>;

    async fn instantiate(&self, intent: &Intent, template: &Template) -> Result<ShotPlan, PrismError>;

    async fn compile_shot(
        &self,
        shot: &PlannedShot,
        plan: &ShotPlan,
        intent: &Intent,
        template: &Template,
        preset: &QualityPreset,
    ) -> Result<ShotRequest, PrismError>;

    async fn parse_feedback(&self, feedback: &str, intent: &Intent) -> Result<Feedback, PrismError>;
}

/// Copy of `intent` with the targeted changes applied.
pub fn apply_feedback(intent: &Intent, feedback: &Feedback) -> Intent {
    let mut next = intent.clone();
    let changes = &feedback.changes;
    for field in &feedback.targeted_fields {
        match field.as_str() {
            "camera" => {
                if let Some(motion) = &changes.camera_motion {
                    next.scene.camera_motion = motion.clone();
                }
            }
            "narration" => {
                if let Some(tone) = &changes.narration_tone {
                    next.narration_tone = tone.clone();
                }
            }
            "lighting" => {
                if let Some(lighting) = &changes.lighting {
                    next.style.lighting = lighting.clone();
                }
            }
            "emotion" => {
                if let Some(curve) = &changes.emotion_curve {
                    next.emotion_curve = curve.clone();
                }
            }
            "pacing" => {
                if let Some(duration) = changes.duration_s {
                    next.duration_preference_s = Some(duration);
                }
            }
            _ => {}
        }
    }
    next
}

const EMOTIONS: &[&str] = &[
    "calm", "curious", "excited", "joyful", "happy", "hopeful", "inspired", "nostalgic",
    "tense", "sad", "serene", "playful", "confident", "proud", "relaxed", "energetic",
];
const VISUAL_STYLES: &[&str] = &[
    "cinematic", "minimal", "sleek", "vintage", "documentary", "anime", "modern", "dreamy",
    "retro", "noir",
];
const COLOR_TONES: &[&str] = &["warm", "cool", "bright", "muted", "pastel", "neon", "golden"];
const LIGHTING: &[&str] = &["soft", "dramatic", "natural", "moody", "backlit", "studio"];
const TIMES: &[&str] = &["dawn", "morning", "noon", "afternoon", "sunset", "dusk", "night"];
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "for", "and", "with", "about", "video", "make", "create", "me",
    "please", "show", "to", "in", "at", "on", "my", "our", "some", "short", "clip",
];

fn first_in<'a>(tokens: &[String], vocabulary: &[&'a str]) -> Option<&'a str> {
    tokens
        .iter()
        .find_map(|t| vocabulary.iter().find(|v| **v == t.as_str()).copied())
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_any(tokens: &[String], needles: &[&str]) -> bool {
    tokens.iter().any(|t| needles.contains(&t.as_str()))
}

/// Seconds mentioned as `12s`, `12 sec`, or `12 seconds`.
fn parse_duration(tokens: &[String]) -> Option<u32> {
    tokens.iter().enumerate().find_map(|(i, token)| {
        if let Some(number) = token.strip_suffix('s')
            && let Ok(n) = number.parse::<u32>()
        {
            return Some(n);
        }
        let n = token.parse::<u32>().ok()?;
        let unit = tokens.get(i + 1)?;
        matches!(unit.as_str(), "s" | "sec" | "secs" | "second" | "seconds").then_some(n)
    })
}

/// Keyword planner over a template catalog's vocabulary.
pub struct HeuristicPlanner {
    catalog: Arc<TemplateCatalog>,
}

impl HeuristicPlanner {
    pub fn new(catalog: Arc<TemplateCatalog>) -> Self {
        Self { catalog }
    }

    fn topic_for(&self, tokens: &[String]) -> Option<String> {
        let present: BTreeSet<&str> = tokens.iter().map(String::as_str).collect();
        self.catalog
            .iter()
            .flat_map(|t| t.tags.topic.iter())
            .find(|topic| {
                let needed = tokenize_phrase(topic);
                !needed.is_empty() && needed.iter().all(|w| present.contains(w.as_str()))
            })
            .map(|topic| topic.to_lowercase())
    }

    fn emotions_for(&self, tokens: &[String]) -> Vec<String> {
        let catalog_emotions: BTreeSet<String> = self
            .catalog
            .iter()
            .flat_map(|t| t.tags.emotion.iter().chain(t.emotion_curve.iter()))
            .map(|e| e.to_lowercase())
            .collect();
        let mut seen = BTreeSet::new();
        tokens
            .iter()
            .filter(|t| EMOTIONS.contains(&t.as_str()) || catalog_emotions.contains(t.as_str()))
            .filter(|t| seen.insert(t.as_str().to_string()))
            .cloned()
            .collect()
    }
}

/// Emotion for shot `index` out of `count`, spread along the curve.
pub(crate) fn emotion_at(curve: &[String], index: usize, count: usize) -> Option<&str> {
    if curve.is_empty() || count == 0 {
        return None;
    }
    curve.get(index * curve.len() / count).map(String::as_str)
}

#[async_trait]
impl Planner for HeuristicPlanner {
    async fn parse_intent(&self, text: &str, quality_mode: &str) -> Result<Intent, PrismError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PrismError::InvalidRequest(
                "request text must not be empty".into(),
            ));
        }
        let tokens = words(text);

        let topic = self.topic_for(&tokens).unwrap_or_else(|| {
            tokens
                .iter()
                .filter(|t| !STOPWORDS.contains(&t.as_str()) && t.parse::<u32>().is_err())
                .take(4)
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")
        });

        let mut intent = Intent::new(&topic, quality_mode);
        intent.intent = text
            .split(['.', '!', '?'])
            .next()
            .unwrap_or(text)
            .chars()
            .take(120)
            .collect();
        intent.emotion_curve = self.emotions_for(&tokens);
        intent.style.visual = first_in(&tokens, VISUAL_STYLES).unwrap_or_default().to_string();
        intent.style.color_tone = first_in(&tokens, COLOR_TONES).unwrap_or_default().to_string();
        intent.style.lighting = first_in(&tokens, LIGHTING).unwrap_or_default().to_string();
        intent.scene.time = first_in(&tokens, TIMES).unwrap_or_default().to_string();
        intent.duration_preference_s = parse_duration(&tokens);
        if tokens.iter().any(|t| t == "1080p" || t == "1080" || t == "1920x1080") {
            intent.resolution = "1920x1080".to_string();
        }
        if has_any(&tokens, &["subtitle", "subtitles", "caption", "captions"]) {
            intent.subtitle_policy = if has_any(&tokens, &["no", "without"]) {
                "none".to_string()
            } else {
                "auto".to_string()
            };
        }
        Ok(intent)
    }

    async fn instantiate(&self, intent: &Intent, template: &Template) -> Result<ShotPlan, PrismError> {
        if template.shot_skeletons.is_empty() {
            return Err(PrismError::Planner(format!(
                "template {} has no shots",
                template.key()
            )));
        }

        let skeleton_total: u32 = template.shot_skeletons.iter().map(|s| s.duration_s).sum();
        let scale = |duration: u32| match intent.duration_preference_s {
            Some(target) if skeleton_total > 0 => {
                let scaled = f64::from(duration) * f64::from(target) / f64::from(skeleton_total);
                (scaled.round() as u32).max(1)
            }
            _ => duration,
        };

        let setting: Vec<&str> = [intent.scene.location.as_str(), intent.scene.time.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();

        let shots = template
            .shot_skeletons
            .iter()
            .map(|skeleton| {
                let visual = if setting.is_empty() {
                    skeleton.visual.clone()
                } else {
                    format!("{}, {}", skeleton.visual, setting.join(" at "))
                };
                let camera_motion = if intent.scene.camera_motion.is_empty() {
                    skeleton.camera_motion.clone()
                } else {
                    intent.scene.camera_motion.clone()
                };
                PlannedShot {
                    shot_id: skeleton.shot_id,
                    duration_s: scale(skeleton.duration_s),
                    visual,
                    camera_motion,
                    narration: skeleton.narration.clone(),
                }
            })
            .collect();

        Ok(ShotPlan {
            template_id: template.template_id.clone(),
            template_version: template.version.clone(),
            subtitle_policy: template
                .constraints
                .subtitle_policy
                .clone()
                .unwrap_or_else(|| intent.subtitle_policy.clone()),
            resolution: intent.resolution.clone(),
            shots,
        })
    }

    async fn compile_shot(
        &self,
        shot: &PlannedShot,
        plan: &ShotPlan,
        intent: &Intent,
        template: &Template,
        preset: &QualityPreset,
    ) -> Result<ShotRequest, PrismError> {
        let index = plan
            .shots
            .iter()
            .position(|s| s.shot_id == shot.shot_id)
            .unwrap_or(0);
        let emotion = emotion_at(&intent.emotion_curve, index, plan.shots.len());

        let mut parts = vec![shot.visual.clone()];
        if !intent.style.visual.is_empty() {
            parts.push(format!("{} style", intent.style.visual));
        }
        if !intent.style.color_tone.is_empty() {
            parts.push(format!("{} color tones", intent.style.color_tone));
        }
        if !intent.style.lighting.is_empty() {
            parts.push(format!("{} lighting", intent.style.lighting));
        }
        if !shot.camera_motion.is_empty() {
            parts.push(format!("camera: {}", shot.camera_motion));
        }
        if let Some(emotion) = emotion {
            parts.push(format!("mood: {emotion}"));
        }
        if let Some(line) = &shot.narration {
            let tone = if intent.narration_tone.is_empty() {
                String::new()
            } else {
                format!(" ({} tone)", intent.narration_tone)
            };
            parts.push(format!("narration{tone}: \"{line}\""));
        }

        Ok(ShotRequest {
            shot_id: shot.shot_id,
            prompt: parts.join(", "),
            negative_prompt: template.negative_prompt_base.clone(),
            params: ShotParams {
                size: preset.preview_size.clone(),
                duration_s: shot.duration_s,
                seed: BASE_SEED + u64::from(shot.shot_id) * 1000,
                prompt_extend: template.constraints.prompt_extend,
                watermark: template.constraints.watermark,
            },
        })
    }

    async fn parse_feedback(&self, feedback: &str, intent: &Intent) -> Result<Feedback, PrismError> {
        let tokens = words(feedback);
        let mut out = Feedback::default();

        if has_any(
            &tokens,
            &["camera", "shake", "shaky", "pan", "zoom", "static", "handheld", "tracking"],
        ) {
            out.targeted_fields.push("camera".into());
            let motion = if has_any(&tokens, &["shake", "shaky", "static", "steady", "stable"]) {
                "static, stabilized"
            } else if has_any(&tokens, &["zoom"]) {
                "slow zoom in"
            } else if has_any(&tokens, &["pan"]) {
                "slow pan"
            } else {
                "smooth tracking"
            };
            out.changes.camera_motion = Some(motion.into());
        }

        if has_any(
            &tokens,
            &["light", "lighting", "bright", "brighter", "dark", "darker", "moody", "exposure"],
        ) {
            out.targeted_fields.push("lighting".into());
            let lighting = if has_any(&tokens, &["bright", "brighter", "exposure"]) {
                "bright"
            } else if has_any(&tokens, &["dark", "darker"]) {
                "low-key"
            } else if has_any(&tokens, &["moody"]) {
                "moody"
            } else {
                "natural"
            };
            out.changes.lighting = Some(lighting.into());
        }

        if has_any(&tokens, &["narration", "narrator", "voice", "voiceover"]) {
            out.targeted_fields.push("narration".into());
            let tone = if has_any(&tokens, &["calm", "calmer", "softer", "gentle"]) {
                "calm"
            } else if has_any(&tokens, &["energetic", "upbeat", "excited", "louder"]) {
                "energetic"
            } else {
                "warm"
            };
            out.changes.narration_tone = Some(tone.into());
        }

        let emotions = self.emotions_for(&tokens);
        if has_any(&tokens, &["emotion", "mood", "feel", "feeling"]) || !emotions.is_empty() {
            out.targeted_fields.push("emotion".into());
            if !emotions.is_empty() {
                out.changes.emotion_curve = Some(emotions);
            }
        }

        if has_any(
            &tokens,
            &["pace", "pacing", "faster", "slower", "shorter", "longer", "quicker"],
        ) {
            out.targeted_fields.push("pacing".into());
            let current = f64::from(intent.duration_preference_s.unwrap_or(10));
            let factor = if has_any(&tokens, &["faster", "shorter", "quicker"]) {
                0.8
            } else {
                1.2
            };
            out.changes.duration_s = Some((current * factor).round() as u32);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_quality_modes;
    use crate::testing::fixture_catalog;

    fn planner() -> HeuristicPlanner {
        HeuristicPlanner::new(Arc::new(fixture_catalog()))
    }

    #[tokio::test]
    async fn parses_topic_emotions_and_style() {
        let intent = planner()
            .parse_intent(
                "A sleek product launch video, curious then excited, warm tones at sunset. 12 seconds",
                "balanced",
            )
            .await
            .unwrap();
        assert_eq!(intent.topic, "product launch");
        assert_eq!(intent.emotion_curve, vec!["curious", "excited"]);
        assert_eq!(intent.style.visual, "sleek");
        assert_eq!(intent.style.color_tone, "warm");
        assert_eq!(intent.scene.time, "sunset");
        assert_eq!(intent.duration_preference_s, Some(12));
        assert_eq!(intent.quality_mode, "balanced");
        assert_eq!(intent.resolution, "1280x720");
    }

    #[tokio::test]
    async fn unknown_topic_uses_leading_words() {
        let intent = planner()
            .parse_intent("make a video about deep sea creatures glowing", "fast")
            .await
            .unwrap();
        assert_eq!(intent.topic, "deep sea creatures glowing");
    }

    #[tokio::test]
    async fn empty_request_is_rejected() {
        let err = planner().parse_intent("   ", "fast").await.unwrap_err();
        assert!(matches!(err, PrismError::InvalidRequest(_)));
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration(&words("about 8s long")), Some(8));
        assert_eq!(parse_duration(&words("make it 9 sec")), Some(9));
        assert_eq!(parse_duration(&words("three shots")), None);
    }

    #[tokio::test]
    async fn instantiate_scales_to_preferred_duration() {
        let catalog = fixture_catalog();
        let template = catalog.get("product_launch", "1.0").unwrap();
        let mut intent = Intent::new("product launch", "balanced");
        intent.duration_preference_s = Some(24);

        let plan = planner().instantiate(&intent, template).await.unwrap();
        assert_eq!(plan.shots.len(), template.shot_skeletons.len());
        // Skeletons are 4 + 4 + 4.
        assert!(plan.shots.iter().all(|s| s.duration_s == 8));
        assert_eq!(plan.total_duration_s(), 24);
    }

    #[tokio::test]
    async fn compile_uses_preview_size_and_stable_seed() {
        let catalog = fixture_catalog();
        let template = catalog.get("product_launch", "1.0").unwrap();
        let mut intent = Intent::new("product launch", "balanced");
        intent.style.lighting = "soft".into();
        intent.emotion_curve = vec!["curious".into(), "excited".into()];
        let planner = planner();
        let plan = planner.instantiate(&intent, template).await.unwrap();
        let preset = &builtin_quality_modes()["balanced"];

        let first = planner
            .compile_shot(&plan.shots[0], &plan, &intent, template, preset)
            .await
            .unwrap();
        let again = planner
            .compile_shot(&plan.shots[0], &plan, &intent, template, preset)
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(first.params.size, "1280*720");
        assert_eq!(first.params.seed, BASE_SEED + 1000);
        assert!(first.prompt.contains("soft lighting"));
        assert!(first.prompt.contains("mood: curious"));
        assert_eq!(first.negative_prompt, template.negative_prompt_base);

        let last = planner
            .compile_shot(&plan.shots[2], &plan, &intent, template, preset)
            .await
            .unwrap();
        assert!(last.prompt.contains("mood: excited"));
    }

    #[tokio::test]
    async fn feedback_targets_camera_and_lighting() {
        let intent = Intent::new("product launch", "balanced");
        let feedback = planner()
            .parse_feedback("Less camera shake and brighter lighting please", &intent)
            .await
            .unwrap();
        assert_eq!(feedback.targeted_fields, vec!["camera", "lighting"]);
        assert_eq!(feedback.changes.camera_motion.as_deref(), Some("static, stabilized"));
        assert_eq!(feedback.changes.lighting.as_deref(), Some("bright"));
    }

    #[tokio::test]
    async fn pacing_feedback_adjusts_duration() {
        let mut intent = Intent::new("product launch", "balanced");
        intent.duration_preference_s = Some(10);
        let feedback = planner()
            .parse_feedback("make the pacing faster", &intent)
            .await
            .unwrap();
        assert_eq!(feedback.targeted_fields, vec!["pacing"]);
        assert_eq!(feedback.changes.duration_s, Some(8));
    }

    #[test]
    fn apply_feedback_maps_fields() {
        let intent = Intent::new("product launch", "balanced");
        let feedback = Feedback {
            targeted_fields: vec![
                "camera".into(),
                "narration".into(),
                "lighting".into(),
                "emotion".into(),
                "pacing".into(),
            ],
            changes: FeedbackChanges {
                camera_motion: Some("slow pan".into()),
                narration_tone: Some("calm".into()),
                lighting: Some("golden".into()),
                emotion_curve: Some(vec!["hopeful".into()]),
                duration_s: Some(9),
            },
        };
        let revised = apply_feedback(&intent, &feedback);
        assert_eq!(revised.scene.camera_motion, "slow pan");
        assert_eq!(revised.narration_tone, "calm");
        assert_eq!(revised.style.lighting, "golden");
        assert_eq!(revised.emotion_curve, vec!["hopeful"]);
        assert_eq!(revised.duration_preference_s, Some(9));
        assert_eq!(revised.topic, intent.topic);
    }

    #[test]
    fn apply_feedback_ignores_untargeted_changes() {
        let intent = Intent::new("product launch", "balanced");
        let feedback = Feedback {
            targeted_fields: vec!["camera".into()],
            changes: FeedbackChanges {
                lighting: Some("dark".into()),
                ..Default::default()
            },
        };
        assert_eq!(apply_feedback(&intent, &feedback), intent);
    }
}
