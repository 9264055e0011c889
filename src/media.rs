//! Media splitting seam.
//!
//! A splitter separates a downloaded clip into a silent video track and an
//! audio track. Implementations shell out to external tools, so the contract
//! is synchronous and callers run it on the blocking pool.

use thiserror::Error;

use crate::error::{GenerationError, codes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitRequest {
    pub raw_ref: String,
    pub job_id: String,
    pub shot_id: u32,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitOutput {
    pub video_ref: String,
    pub audio_ref: String,
    pub duration_s: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct SplitError {
    pub code: String,
    pub message: String,
}

impl SplitError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<SplitError> for GenerationError {
    fn from(err: SplitError) -> Self {
        GenerationError::MediaProcessing {
            code: err.code,
            message: err.message,
        }
    }
}

pub trait MediaSplitter: Send + Sync {
    fn split(&self, request: &SplitRequest) -> Result<SplitOutput, SplitError>;
}

/// Splitter for deployments without media tooling; every clip is kept whole.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSplitter;

impl MediaSplitter for NoSplitter {
    fn split(&self, _request: &SplitRequest) -> Result<SplitOutput, SplitError> {
        Err(SplitError::new(
            codes::FFMPEG_NOT_FOUND,
            "no media splitter configured",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_splitter_reports_missing_tooling() {
        let err = NoSplitter
            .split(&SplitRequest {
                raw_ref: "raw.mp4".into(),
                job_id: "j".into(),
                shot_id: 1,
                seed: 1,
            })
            .unwrap_err();
        assert_eq!(err.code, codes::FFMPEG_NOT_FOUND);
        assert_eq!(err.to_string(), "FFMPEG_NOT_FOUND: no media splitter configured");
    }

    #[test]
    fn split_error_becomes_media_processing() {
        let err: GenerationError = SplitError::new(codes::EXTRACTION_FAILED, "bad stream").into();
        assert_eq!(err.classify().code, codes::EXTRACTION_FAILED);
    }
}
