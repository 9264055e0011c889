//! Engine configuration loaded from `prism.toml`.
//!
//! Every field has a default, so a missing file or a partial file both load.
//! `DASHSCOPE_API_KEY` takes precedence over the file for the backend key.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PrismConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub matcher: MatcherConfig,

    /// Presets by name. Built-ins are merged under user entries on load.
    #[serde(default)]
    pub quality_modes: BTreeMap<String, QualityPreset>,

    /// TOML template catalog; the binary falls back to its bundled catalog.
    #[serde(default)]
    pub catalog_path: Option<String>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PrismConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            matcher: MatcherConfig::default(),
            quality_modes: builtin_quality_modes(),
            catalog_path: None,
            log_level: default_log_level(),
        }
    }
}

impl PrismConfig {
    /// Load from `$PRISM_CONFIG`, else `./prism.toml`, else defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("PRISM_CONFIG").unwrap_or_else(|_| "prism.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("DASHSCOPE_API_KEY")
            && !key.is_empty()
        {
            config.backend.api_key = key;
        }

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let mut config: PrismConfig = toml::from_str(contents)?;
        for (name, preset) in builtin_quality_modes() {
            config.quality_modes.entry(name).or_insert(preset);
        }
        Ok(config)
    }
}

/// HTTP generation backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/api/v1".to_string()
}

fn default_model() -> String {
    "wan2.6-t2v".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_poll_attempts() -> u32 {
    120
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_download_dir() -> String {
    "./data/downloads".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            download_dir: default_download_dir(),
        }
    }
}

/// Per-client admission limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Client keys exempt from the request-rate window.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

fn default_requests_per_window() -> u32 {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_concurrent() -> u32 {
    5
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            max_concurrent: default_max_concurrent(),
            allowlist: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Backend submission retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total submissions per candidate, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    20_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based):
    /// `min(base_delay_ms * 2^(attempt - 1), max_delay_ms)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatcherConfig {
    /// Matches below this confidence ask the caller for clarification.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_top_k() -> usize {
    3
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Loose,
    Standard,
    Strict,
}

impl Strictness {
    /// Allowed overshoot of the total duration, as a fraction.
    pub fn tolerance(self) -> f64 {
        match self {
            Strictness::Loose => 0.20,
            Strictness::Standard => 0.10,
            Strictness::Strict => 0.05,
        }
    }
}

/// Generation and validation parameters for one quality mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub preview_size: String,
    pub preview_seeds: u32,
    pub final_size: String,
    pub validation_strictness: Strictness,
    pub max_shots: usize,
    pub min_shot_duration_s: u32,
    pub max_shot_duration_s: u32,
    pub max_total_duration_s: u32,
}

pub fn builtin_quality_modes() -> BTreeMap<String, QualityPreset> {
    let preset = |seeds, strictness, max_shots, max_shot| QualityPreset {
        preview_size: "1280*720".to_string(),
        preview_seeds: seeds,
        final_size: "1920*1080".to_string(),
        validation_strictness: strictness,
        max_shots,
        min_shot_duration_s: 2,
        max_shot_duration_s: max_shot,
        max_total_duration_s: max_shot,
    };
    BTreeMap::from([
        ("fast".to_string(), preset(1, Strictness::Loose, 3, 10)),
        ("balanced".to_string(), preset(2, Strictness::Standard, 6, 12)),
        ("high".to_string(), preset(3, Strictness::Strict, 8, 15)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = PrismConfig::default();
        assert_eq!(config.rate_limit.requests_per_window, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.rate_limit.max_concurrent, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.matcher.min_confidence, 0.5);
        assert_eq!(config.backend.model, "wan2.6-t2v");
        assert!(config.backend.api_key.is_empty());
        assert_eq!(config.quality_modes.len(), 3);
    }

    #[test]
    fn deserialize_partial_toml() {
        let config = PrismConfig::from_toml(
            r#"
            [rate_limit]
            requests_per_window = 3

            [quality_modes.draft]
            preview_size = "1280*720"
            preview_seeds = 1
            final_size = "1280*720"
            validation_strictness = "loose"
            max_shots = 2
            min_shot_duration_s = 2
            max_shot_duration_s = 5
            max_total_duration_s = 8
        "#,
        )
        .unwrap();
        assert_eq!(config.rate_limit.requests_per_window, 3);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.quality_modes["draft"].max_shots, 2);
        assert_eq!(config.quality_modes["balanced"].preview_seeds, 2);
    }

    #[test]
    fn user_preset_overrides_builtin() {
        let config = PrismConfig::from_toml(
            r#"
            [quality_modes.fast]
            preview_size = "1280*720"
            preview_seeds = 4
            final_size = "1920*1080"
            validation_strictness = "strict"
            max_shots = 3
            min_shot_duration_s = 2
            max_shot_duration_s = 10
            max_total_duration_s = 10
        "#,
        )
        .unwrap();
        assert_eq!(config.quality_modes["fast"].preview_seeds, 4);
    }

    #[test]
    fn builtin_presets_match_modes() {
        let modes = builtin_quality_modes();
        assert_eq!(modes["fast"].preview_seeds, 1);
        assert_eq!(modes["fast"].max_shots, 3);
        assert_eq!(modes["balanced"].validation_strictness, Strictness::Standard);
        assert_eq!(modes["high"].max_shot_duration_s, 15);
        assert_eq!(modes["high"].final_size, "1920*1080");
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(20_000));
        assert_eq!(config.delay_for_attempt(80), Duration::from_millis(20_000));
    }

    #[test]
    fn strictness_tolerances() {
        assert_eq!(Strictness::Loose.tolerance(), 0.20);
        assert_eq!(Strictness::Standard.tolerance(), 0.10);
        assert_eq!(Strictness::Strict.tolerance(), 0.05);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PrismConfig::load_from(&dir.path().join("prism.toml")).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
