use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state_machine::JobState;

/// Stable error codes recorded on failed jobs.
pub mod codes {
    pub const NETWORK_TIMEOUT: &str = "NETWORK_TIMEOUT";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const AUTH: &str = "AUTH";
    pub const RATE_LIMIT: &str = "RATE_LIMIT";
    pub const INVALID_PARAM: &str = "INVALID_PARAM";
    pub const BACKEND_TIMEOUT: &str = "BACKEND_TIMEOUT";
    pub const TASK_FAILED: &str = "TASK_FAILED";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const UNKNOWN: &str = "UNKNOWN";

    pub const FFMPEG_NOT_FOUND: &str = "FFMPEG_NOT_FOUND";
    pub const INPUT_FILE_NOT_FOUND: &str = "INPUT_FILE_NOT_FOUND";
    pub const EXTRACTION_FAILED: &str = "EXTRACTION_FAILED";
    pub const AUDIO_STREAM_MISSING: &str = "AUDIO_STREAM_MISSING";
}

/// Failure raised by a generation collaborator (backend, splitter, validator).
///
/// The variant is chosen where the failure originates; callers never inspect
/// message text to decide how to handle it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("request timed out: {0}")]
    NetworkTimeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("backend returned status {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("backend task failed: {message}")]
    TaskFailed {
        code: Option<String>,
        message: String,
    },

    #[error("media processing failed ({code}): {message}")]
    MediaProcessing { code: String, message: String },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        suggestions: Vec<String>,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Retryable,
    NonRetryable,
}

/// Classified failure stored on a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub classification: Classification,
    pub retryable: bool,
    pub suggested_modifications: Vec<String>,
}

impl ErrorDetails {
    fn new(code: &str, message: String, retryable: bool, suggestions: &[&str]) -> Self {
        Self::with_suggestions(
            code,
            message,
            retryable,
            suggestions.iter().map(|s| (*s).to_string()).collect(),
        )
    }

    fn with_suggestions(
        code: &str,
        message: String,
        retryable: bool,
        suggested_modifications: Vec<String>,
    ) -> Self {
        let classification = if retryable {
            Classification::Retryable
        } else {
            Classification::NonRetryable
        };
        Self {
            code: code.to_string(),
            message,
            classification,
            retryable,
            suggested_modifications,
        }
    }
}

impl GenerationError {
    /// Whether the retry adapter may resubmit after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::NetworkTimeout(_) | GenerationError::Network(_) => true,
            GenerationError::Backend { status, .. } => *status == 429 || *status >= 500,
            GenerationError::TaskFailed { .. }
            | GenerationError::MediaProcessing { .. }
            | GenerationError::Validation { .. }
            | GenerationError::Other(_) => false,
        }
    }

    /// Map the failure to its taxonomy entry.
    pub fn classify(&self) -> ErrorDetails {
        match self {
            GenerationError::NetworkTimeout(msg) => ErrorDetails::new(
                codes::NETWORK_TIMEOUT,
                format!("Request timed out: {msg}"),
                true,
                &["Try again in a few minutes"],
            ),
            GenerationError::Network(msg) => ErrorDetails::new(
                codes::NETWORK_ERROR,
                format!("Network connection failed: {msg}"),
                true,
                &["Check network connectivity and try again"],
            ),
            GenerationError::Backend { status, message } => classify_status(*status, message),
            GenerationError::TaskFailed { code, message } => {
                let text = match code {
                    Some(code) => format!("Generation task failed ({code}): {message}"),
                    None => format!("Generation task failed: {message}"),
                };
                ErrorDetails::new(
                    codes::TASK_FAILED,
                    text,
                    false,
                    &["Rephrase the shot description and try again"],
                )
            }
            GenerationError::MediaProcessing { code, message } => ErrorDetails::new(
                code,
                message.clone(),
                false,
                media_suggestions(code),
            ),
            GenerationError::Validation {
                message,
                suggestions,
            } => {
                let suggestions = if suggestions.is_empty() {
                    validation_suggestions(message)
                } else {
                    suggestions.clone()
                };
                ErrorDetails::with_suggestions(
                    codes::VALIDATION_FAILED,
                    message.clone(),
                    false,
                    suggestions,
                )
            }
            GenerationError::Other(msg) => unknown(msg),
        }
    }
}

fn classify_status(status: u16, message: &str) -> ErrorDetails {
    match status {
        401 => ErrorDetails::new(
            codes::AUTH,
            format!("Authentication failed: {message}"),
            false,
            &["Verify API key"],
        ),
        429 => ErrorDetails::new(
            codes::RATE_LIMIT,
            format!("Backend rate limit exceeded: {message}"),
            true,
            &["Wait a few minutes and try again"],
        ),
        400..=499 => ErrorDetails::new(
            codes::INVALID_PARAM,
            format!("Invalid request parameters: {message}"),
            false,
            &["Check request parameters and try again"],
        ),
        500..=599 => ErrorDetails::new(
            codes::BACKEND_TIMEOUT,
            format!("Backend temporarily unavailable ({status}): {message}"),
            true,
            &["Try again in a few minutes"],
        ),
        _ => unknown(&format!("unexpected status {status}: {message}")),
    }
}

fn media_suggestions(code: &str) -> &'static [&'static str] {
    match code {
        codes::FFMPEG_NOT_FOUND => &["Install FFmpeg and ensure it is on PATH"],
        codes::INPUT_FILE_NOT_FOUND => &["Regenerate the shot; the downloaded file is missing"],
        codes::EXTRACTION_FAILED => &["Check that the downloaded file is a valid video"],
        codes::AUDIO_STREAM_MISSING => &["Regenerate the shot with audio enabled"],
        _ => &["Please try again or contact support"],
    }
}

/// Suggestions for a validation message, keyed on the dimension it names.
pub fn validation_suggestions(message: &str) -> Vec<String> {
    let lower = message.to_lowercase();
    let mut suggestions = Vec::new();
    if lower.contains("duration") {
        suggestions.push("Adjust video duration to be between 2-15 seconds".to_string());
    }
    if lower.contains("resolution") {
        suggestions.push("Use supported resolution: 1280x720 or 1920x1080".to_string());
    }
    if lower.contains("subtitle") {
        suggestions.push("Review subtitle policy requirements".to_string());
    }
    if suggestions.is_empty() {
        suggestions.push("Review the request parameters".to_string());
    }
    suggestions
}

fn unknown(message: &str) -> ErrorDetails {
    ErrorDetails::new(
        codes::UNKNOWN,
        message.to_string(),
        false,
        &["Please try again or contact support"],
    )
}

#[derive(Debug, Error)]
pub enum PrismError {
    #[error("Rate limit exceeded for {client}; next request allowed at {reset_at}")]
    RateLimited {
        client: String,
        reset_at: DateTime<Utc>,
    },

    #[error("Concurrent job limit reached for {client} ({current}/{max})")]
    ConcurrencyLimited {
        client: String,
        current: i64,
        max: u32,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("No matching template found. Please provide more details.")]
    ClarificationNeeded,

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        suggestions: Vec<String>,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown quality mode: {0}")]
    UnknownQualityMode(String),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl PrismError {
    /// Build a validation error; suggestions come from the message.
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        let suggestions = validation_suggestions(&message);
        PrismError::Validation {
            message,
            suggestions,
        }
    }

    /// Whether the request was refused by the limiter.
    pub fn is_throttled(&self) -> bool {
        matches!(
            self,
            PrismError::RateLimited { .. } | PrismError::ConcurrencyLimited { .. }
        )
    }

    /// Classification recorded on a job that failed with this error.
    pub fn classify(&self) -> ErrorDetails {
        match self {
            PrismError::Generation(err) => err.classify(),
            PrismError::Validation {
                message,
                suggestions,
            } => ErrorDetails::with_suggestions(
                codes::VALIDATION_FAILED,
                message.clone(),
                false,
                suggestions.clone(),
            ),
            other => unknown(&other.to_string()),
        }
    }
}
