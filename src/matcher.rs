//! Intent → template matching.
//!
//! The primary path blends semantic similarity from a [`SemanticIndex`] with
//! tag overlap. When no index is configured or the index is unavailable, a
//! keyword-overlap scorer ranks the whole catalog instead.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::MatcherConfig;
use crate::error::PrismError;

const SEMANTIC_WEIGHT: f64 = 0.7;
const TAG_WEIGHT: f64 = 0.3;
const TOPIC_WEIGHT: f64 = 0.6;
const EMOTION_WEIGHT: f64 = 0.2;
const STYLE_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleHints {
    #[serde(default)]
    pub visual: String,
    #[serde(default)]
    pub color_tone: String,
    #[serde(default)]
    pub lighting: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneHints {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub camera_motion: String,
}

/// Structured reading of a free-text request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub topic: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub style: StyleHints,
    #[serde(default)]
    pub scene: SceneHints,
    #[serde(default)]
    pub emotion_curve: Vec<String>,
    #[serde(default = "default_subtitle_policy")]
    pub subtitle_policy: String,
    #[serde(default)]
    pub narration_tone: String,
    #[serde(default)]
    pub duration_preference_s: Option<u32>,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    pub quality_mode: String,
}

fn default_subtitle_policy() -> String {
    "none".to_string()
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

impl Intent {
    pub fn new(topic: &str, quality_mode: &str) -> Self {
        Self {
            topic: topic.to_string(),
            intent: String::new(),
            style: StyleHints::default(),
            scene: SceneHints::default(),
            emotion_curve: Vec::new(),
            subtitle_policy: default_subtitle_policy(),
            narration_tone: String::new(),
            duration_preference_s: None,
            resolution: default_resolution(),
            quality_mode: quality_mode.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTags {
    #[serde(default)]
    pub topic: Vec<String>,
    #[serde(default)]
    pub tone: Vec<String>,
    #[serde(default)]
    pub style: Vec<String>,
    #[serde(default)]
    pub emotion: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConstraints {
    #[serde(default)]
    pub subtitle_policy: Option<String>,
    #[serde(default)]
    pub watermark: bool,
    #[serde(default)]
    pub prompt_extend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotSkeleton {
    pub shot_id: u32,
    pub duration_s: u32,
    pub visual: String,
    #[serde(default)]
    pub camera_motion: String,
    #[serde(default)]
    pub narration: Option<String>,
}

/// Reusable multi-shot structure keyed by `(template_id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub version: String,
    #[serde(default)]
    pub tags: TemplateTags,
    #[serde(default)]
    pub emotion_curve: Vec<String>,
    #[serde(default)]
    pub constraints: TemplateConstraints,
    pub shot_skeletons: Vec<ShotSkeleton>,
    #[serde(default)]
    pub negative_prompt_base: String,
}

impl Template {
    /// Index key, `template_id:version`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.template_id, self.version)
    }

    /// Text embedded into a semantic index for this template.
    pub fn search_text(&self) -> String {
        let tags = &self.tags;
        [&tags.topic, &tags.tone, &tags.style, &tags.emotion, &self.emotion_curve]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateCatalog {
    #[serde(default, rename = "template")]
    templates: Vec<Template>,
}

impl TemplateCatalog {
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    /// Parse a catalog of `[[template]]` tables.
    pub fn from_toml(contents: &str) -> Result<Self, PrismError> {
        let catalog: TemplateCatalog = toml::from_str(contents)?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, PrismError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn get(&self, template_id: &str, version: &str) -> Option<&Template> {
        self.templates
            .iter()
            .find(|t| t.template_id == template_id && t.version == version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Template> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.templates.iter().position(|t| t.key() == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("semantic index unavailable: {0}")]
    Unavailable(String),
}

/// Nearest-neighbour search over template embeddings.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Up to `top_k` `(template key, distance)` pairs, distance in `[0, 2]`.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<(String, f64)>, IndexError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Semantic,
    Keyword,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateMatch {
    pub template_id: String,
    pub version: String,
    pub confidence: f64,
    pub method: MatchMethod,
    pub components: BTreeMap<&'static str, f64>,
    #[serde(skip)]
    pub template: Template,
}

/// Lowercased tag with separators removed: `"Product_Launch "` → `"productlaunch"`.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect()
}

/// Lowercased word tokens of a phrase, splitting on punctuation, `_`, and whitespace.
pub fn tokenize_phrase(phrase: &str) -> BTreeSet<String> {
    phrase
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// `|A ∩ B| / |A ∪ B|`, zero when both sets are empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn normalized<'a>(tags: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|t| normalize_tag(t))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Free-text query sent to the semantic index.
pub fn query_text(intent: &Intent) -> String {
    let mut parts: Vec<String> = Vec::new();
    let topic = intent.topic.trim();
    if !topic.is_empty() {
        parts.push(topic.to_string());
        let variant = if topic.contains('_') {
            topic.replace('_', " ")
        } else {
            topic.replace(' ', "_")
        };
        if variant != topic {
            parts.push(variant);
        }
    }
    let extras = [
        &intent.intent,
        &intent.style.visual,
        &intent.style.color_tone,
        &intent.style.lighting,
        &intent.scene.location,
        &intent.scene.time,
    ];
    parts.extend(
        extras
            .into_iter()
            .chain(intent.emotion_curve.iter())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    );
    parts.join(" ")
}

fn intent_tags(intent: &Intent) -> BTreeSet<String> {
    normalized(
        [
            &intent.topic,
            &intent.style.visual,
            &intent.style.color_tone,
            &intent.style.lighting,
            &intent.scene.location,
            &intent.scene.time,
        ]
        .into_iter()
        .chain(intent.emotion_curve.iter()),
    )
}

fn template_tags(template: &Template) -> BTreeSet<String> {
    let tags = &template.tags;
    normalized(
        [&tags.topic, &tags.tone, &tags.style, &tags.emotion, &template.emotion_curve]
            .into_iter()
            .flatten(),
    )
}

pub struct TemplateMatcher {
    index: Option<Arc<dyn SemanticIndex>>,
    config: MatcherConfig,
}

impl TemplateMatcher {
    pub fn new(index: Option<Arc<dyn SemanticIndex>>, config: MatcherConfig) -> Self {
        Self { index, config }
    }

    /// Best template for `intent`, or `None` when nothing clears the threshold.
    pub async fn match_intent(
        &self,
        intent: &Intent,
        catalog: &TemplateCatalog,
    ) -> Option<TemplateMatch> {
        let ranked = match &self.index {
            Some(index) => match index.search(&query_text(intent), self.config.top_k).await {
                Ok(hits) if hits.is_empty() => {
                    info!(topic = %intent.topic, "semantic index returned no candidates");
                    return None;
                }
                Ok(hits) => Self::rank_semantic(intent, catalog, &hits),
                Err(err) => {
                    warn!(error = %err, "semantic index unavailable, using keyword matching");
                    Self::rank_keywords(intent, catalog)
                }
            },
            None => Self::rank_keywords(intent, catalog),
        };

        let best = select_best(ranked)?;
        if best.confidence < self.config.min_confidence {
            info!(
                template_id = %best.template_id,
                confidence = best.confidence,
                threshold = self.config.min_confidence,
                "best template below confidence threshold"
            );
            return None;
        }

        info!(
            template_id = %best.template_id,
            version = %best.version,
            confidence = best.confidence,
            method = ?best.method,
            components = ?best.components,
            "template matched"
        );
        Some(best)
    }

    /// Score semantic hits, in catalog order. Unknown keys are skipped.
    pub fn rank_semantic(
        intent: &Intent,
        catalog: &TemplateCatalog,
        hits: &[(String, f64)],
    ) -> Vec<TemplateMatch> {
        let query_tags = intent_tags(intent);
        let mut positioned: Vec<(usize, TemplateMatch)> = hits
            .iter()
            .filter_map(|(key, distance)| {
                let Some(pos) = catalog.position(key) else {
                    debug!(key = %key, "semantic hit not in catalog");
                    return None;
                };
                let template = &catalog.templates[pos];
                let cosine = (1.0 - distance / 2.0).clamp(0.0, 1.0);
                let overlap = jaccard(&query_tags, &template_tags(template));
                let confidence = SEMANTIC_WEIGHT * cosine + TAG_WEIGHT * overlap;
                Some((
                    pos,
                    TemplateMatch {
                        template_id: template.template_id.clone(),
                        version: template.version.clone(),
                        confidence,
                        method: MatchMethod::Semantic,
                        components: BTreeMap::from([("cosine", cosine), ("jaccard", overlap)]),
                        template: template.clone(),
                    },
                ))
            })
            .collect();
        positioned.sort_by_key(|(pos, _)| *pos);
        positioned.into_iter().map(|(_, m)| m).collect()
    }

    /// Keyword-overlap score for every template, in catalog order.
    pub fn rank_keywords(intent: &Intent, catalog: &TemplateCatalog) -> Vec<TemplateMatch> {
        let topic_key = normalize_tag(&intent.topic);
        let topic = tokenize_phrase(&intent.topic);
        let emotions = normalized(&intent.emotion_curve);
        let style = normalized([
            &intent.style.visual,
            &intent.style.color_tone,
            &intent.style.lighting,
        ]);

        catalog
            .iter()
            .map(|template| {
                let tags = &template.tags;
                let topic_overlap = topic_score(&topic_key, &topic, &tags.topic);
                let emotion_overlap = jaccard(&emotions, &normalized(&tags.emotion));
                let style_overlap = jaccard(&style, &normalized(&tags.style));
                let confidence = TOPIC_WEIGHT * topic_overlap
                    + EMOTION_WEIGHT * emotion_overlap
                    + STYLE_WEIGHT * style_overlap;
                TemplateMatch {
                    template_id: template.template_id.clone(),
                    version: template.version.clone(),
                    confidence,
                    method: MatchMethod::Keyword,
                    components: BTreeMap::from([
                        ("topic", topic_overlap),
                        ("emotion", emotion_overlap),
                        ("style", style_overlap),
                    ]),
                    template: template.clone(),
                }
            })
            .collect()
    }
}

/// 1.0 when any template topic normalizes to the intent topic, else the best
/// token overlap against a single template topic.
fn topic_score(key: &str, tokens: &BTreeSet<String>, topics: &[String]) -> f64 {
    if !key.is_empty() && topics.iter().any(|t| normalize_tag(t) == key) {
        return 1.0;
    }
    topics
        .iter()
        .map(|t| jaccard(tokens, &tokenize_phrase(t)))
        .fold(0.0, f64::max)
}

/// Highest confidence wins; ties keep the first candidate.
fn select_best(candidates: Vec<TemplateMatch>) -> Option<TemplateMatch> {
    candidates.into_iter().fold(None, |best, candidate| match best {
        Some(b) if b.confidence >= candidate.confidence => Some(b),
        _ => Some(candidate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture_catalog;

    struct FixedIndex(Result<Vec<(String, f64)>, IndexError>);

    #[async_trait]
    impl SemanticIndex for FixedIndex {
        async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<(String, f64)>, IndexError> {
            self.0.clone()
        }
    }

    fn matcher(index: Option<FixedIndex>, min_confidence: f64) -> TemplateMatcher {
        TemplateMatcher::new(
            index.map(|i| Arc::new(i) as Arc<dyn SemanticIndex>),
            MatcherConfig {
                min_confidence,
                top_k: 3,
            },
        )
    }

    fn launch_intent() -> Intent {
        let mut intent = Intent::new("product launch", "balanced");
        intent.emotion_curve = vec!["curious".into(), "excited".into()];
        intent.style.visual = "sleek".into();
        intent.style.color_tone = "bright".into();
        intent
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_tag("  Product_Launch "), "productlaunch");
        assert_eq!(normalize_tag("warm  glow"), "warmglow");
    }

    #[test]
    fn tokenize_splits_on_punctuation_and_underscores() {
        let tokens = tokenize_phrase("Golden-hour city_walk, at dusk!");
        let expected: BTreeSet<String> = ["golden", "hour", "city", "walk", "at", "dusk"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(tokens, expected);
    }

    #[test]
    fn jaccard_edges() {
        let a = tokenize_phrase("a b");
        let b = tokenize_phrase("b c");
        assert!(approx(jaccard(&a, &b), 1.0 / 3.0));
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn query_includes_topic_variant() {
        let intent = launch_intent();
        let query = query_text(&intent);
        assert!(query.starts_with("product launch product_launch"));
        assert!(query.contains("excited"));
    }

    #[test]
    fn keyword_score_is_one_on_full_overlap() {
        let template = Template {
            template_id: "launch".into(),
            version: "1.0".into(),
            tags: TemplateTags {
                topic: vec!["product launch".into()],
                tone: vec![],
                style: vec!["sleek".into(), "bright".into()],
                emotion: vec!["curious".into(), "excited".into()],
            },
            emotion_curve: vec![],
            constraints: TemplateConstraints::default(),
            shot_skeletons: vec![],
            negative_prompt_base: String::new(),
        };
        let catalog = TemplateCatalog::new(vec![template]);
        let ranked = TemplateMatcher::rank_keywords(&launch_intent(), &catalog);
        assert!(approx(ranked[0].confidence, 1.0), "{}", ranked[0].confidence);
    }

    #[test]
    fn style_and_emotion_compare_whole_tags() {
        let template = Template {
            template_id: "launch".into(),
            version: "1.0".into(),
            tags: TemplateTags {
                topic: vec!["product launch".into()],
                tone: vec!["soft light".into()],
                style: vec!["soft focus".into()],
                emotion: vec!["calm".into()],
            },
            emotion_curve: vec!["excited".into()],
            constraints: TemplateConstraints::default(),
            shot_skeletons: vec![],
            negative_prompt_base: String::new(),
        };
        let mut intent = Intent::new("product launch", "balanced");
        intent.emotion_curve = vec!["calm".into()];
        intent.style.visual = "soft light".into();

        let ranked = TemplateMatcher::rank_keywords(&intent, &TemplateCatalog::new(vec![template]));
        assert_eq!(ranked[0].components["style"], 0.0);
        assert_eq!(ranked[0].components["emotion"], 1.0);
        assert!(approx(ranked[0].confidence, 0.8), "{}", ranked[0].confidence);
    }

    #[test]
    fn exact_topic_scores_one_among_several() {
        let topics = vec!["Product_Launch".to_string(), "product reveal".to_string()];
        let key = normalize_tag("product launch");
        assert_eq!(topic_score(&key, &tokenize_phrase("product launch"), &topics), 1.0);

        let partial = topic_score("productdemo", &tokenize_phrase("product demo"), &topics);
        assert!(approx(partial, 1.0 / 3.0));
    }

    #[test]
    fn keyword_score_is_zero_when_disjoint() {
        let mut intent = Intent::new("underwater documentary", "fast");
        intent.emotion_curve = vec!["serene".into()];
        intent.style.visual = "grainy".into();
        let ranked = TemplateMatcher::rank_keywords(&intent, &fixture_catalog());
        assert!(ranked.iter().all(|m| m.confidence == 0.0));
    }

    #[tokio::test]
    async fn below_threshold_is_no_match() {
        let mut intent = Intent::new("underwater documentary", "fast");
        intent.emotion_curve = vec!["excited".into()];
        let matcher = matcher(None, 0.5);
        assert!(matcher.match_intent(&intent, &fixture_catalog()).await.is_none());
    }

    #[tokio::test]
    async fn fallback_used_without_index() {
        let matcher = matcher(None, 0.5);
        let m = matcher
            .match_intent(&launch_intent(), &fixture_catalog())
            .await
            .unwrap();
        assert_eq!(m.template_id, "product_launch");
        assert_eq!(m.method, MatchMethod::Keyword);
    }

    #[tokio::test]
    async fn fallback_used_when_index_unavailable() {
        let matcher = matcher(
            Some(FixedIndex(Err(IndexError::Unavailable("connection refused".into())))),
            0.5,
        );
        let m = matcher
            .match_intent(&launch_intent(), &fixture_catalog())
            .await
            .unwrap();
        assert_eq!(m.method, MatchMethod::Keyword);
        assert_eq!(m.template_id, "product_launch");
    }

    #[tokio::test]
    async fn semantic_score_blends_cosine_and_tags() {
        let matcher = matcher(
            Some(FixedIndex(Ok(vec![
                ("city_walk:1.0".into(), 1.2),
                ("product_launch:1.0".into(), 0.2),
                ("unknown:9".into(), 0.0),
            ]))),
            0.5,
        );
        let m = matcher
            .match_intent(&launch_intent(), &fixture_catalog())
            .await
            .unwrap();
        assert_eq!(m.template_id, "product_launch");
        assert_eq!(m.method, MatchMethod::Semantic);
        assert!(approx(m.components["cosine"], 0.9));
        let expected = 0.7 * 0.9 + 0.3 * m.components["jaccard"];
        assert!(approx(m.confidence, expected));
    }

    #[tokio::test]
    async fn empty_semantic_result_is_no_match() {
        let matcher = matcher(Some(FixedIndex(Ok(vec![]))), 0.0);
        assert!(
            matcher
                .match_intent(&launch_intent(), &fixture_catalog())
                .await
                .is_none()
        );
    }

    #[test]
    fn ties_keep_catalog_order() {
        let catalog = fixture_catalog();
        let hits = vec![
            ("city_walk:1.0".to_string(), 2.0),
            ("product_launch:1.0".to_string(), 2.0),
        ];
        let intent = Intent::new("nothing shared", "fast");
        let ranked = TemplateMatcher::rank_semantic(&intent, &catalog, &hits);
        assert_eq!(ranked[0].template_id, "product_launch");
        let best = select_best(ranked).unwrap();
        assert_eq!(best.template_id, "product_launch");
        assert_eq!(best.confidence, 0.0);
    }

    #[test]
    fn catalog_parses_from_toml() {
        let catalog = TemplateCatalog::from_toml(
            r#"
            [[template]]
            template_id = "teaser"
            version = "2.1"
            negative_prompt_base = "blurry"

            [template.tags]
            topic = ["movie teaser"]

            [[template.shot_skeletons]]
            shot_id = 1
            duration_s = 3
            visual = "title card"
        "#,
        )
        .unwrap();
        assert_eq!(catalog.len(), 1);
        let t = catalog.get("teaser", "2.1").unwrap();
        assert_eq!(t.key(), "teaser:2.1");
        assert_eq!(t.shot_skeletons[0].camera_motion, "");
        assert!(catalog.get("teaser", "1.0").is_none());
    }
}
