//! Pre-execution checks. A failure here rejects the request before any job
//! or backend task exists.

use std::collections::BTreeMap;

use crate::config::QualityPreset;
use crate::error::PrismError;
use crate::planner::{REFINABLE_FIELDS, ShotPlan};
use crate::state_machine::Job;

pub const SUPPORTED_RESOLUTIONS: [&str; 2] = ["1280x720", "1920x1080"];
pub const SUBTITLE_POLICIES: [&str; 3] = ["none", "allowed", "auto"];
pub const MIN_TOTAL_DURATION_S: u32 = 2;
pub const MIN_FEEDBACK_CHARS: usize = 5;

/// `1920*1080` and `1920x1080` both normalize to `1920x1080`.
pub fn normalize_resolution(resolution: &str) -> String {
    resolution.trim().to_lowercase().replace('*', "x")
}

/// Backend size string for a resolution: `1920x1080` → `1920*1080`.
pub fn backend_size(resolution: &str) -> String {
    normalize_resolution(resolution).replace('x', "*")
}

pub fn is_supported_resolution(resolution: &str) -> bool {
    SUPPORTED_RESOLUTIONS.contains(&normalize_resolution(resolution).as_str())
}

pub struct Validator;

impl Validator {
    /// Check a plan against its quality preset; every violation is reported.
    pub fn validate_plan(plan: &ShotPlan, preset: &QualityPreset) -> Result<(), PrismError> {
        let mut problems = Vec::new();

        if plan.shots.is_empty() {
            problems.push("plan has no shots".to_string());
        }
        if plan.shots.len() > preset.max_shots {
            problems.push(format!(
                "shot count {} exceeds the mode limit of {}",
                plan.shots.len(),
                preset.max_shots
            ));
        }

        let total = plan.total_duration_s();
        let max_total =
            f64::from(preset.max_total_duration_s) * (1.0 + preset.validation_strictness.tolerance());
        if total < MIN_TOTAL_DURATION_S {
            problems.push(format!(
                "total duration {total}s is below the minimum of {MIN_TOTAL_DURATION_S}s"
            ));
        } else if f64::from(total) > max_total {
            problems.push(format!(
                "total duration {total}s exceeds the limit of {max_total:.1}s"
            ));
        }

        for shot in &plan.shots {
            if shot.duration_s < preset.min_shot_duration_s
                || shot.duration_s > preset.max_shot_duration_s
            {
                problems.push(format!(
                    "shot {} duration {}s is outside {}-{}s",
                    shot.shot_id,
                    shot.duration_s,
                    preset.min_shot_duration_s,
                    preset.max_shot_duration_s
                ));
            }
        }

        if !is_supported_resolution(&plan.resolution) {
            problems.push(format!("unsupported resolution {}", plan.resolution));
        }
        if !SUBTITLE_POLICIES.contains(&plan.subtitle_policy.as_str()) {
            problems.push(format!("unknown subtitle policy {}", plan.subtitle_policy));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(PrismError::validation(problems.join("; ")))
        }
    }

    /// Check that revision feedback is usable.
    pub fn validate_refinement(feedback: &str, targeted_fields: &[String]) -> Result<(), PrismError> {
        if feedback.trim().chars().count() < MIN_FEEDBACK_CHARS {
            return Err(PrismError::InvalidRequest(format!(
                "feedback must be at least {MIN_FEEDBACK_CHARS} characters"
            )));
        }
        if targeted_fields.is_empty() {
            return Err(PrismError::InvalidRequest(format!(
                "feedback does not target any refinable field ({})",
                REFINABLE_FIELDS.join(", ")
            )));
        }
        if let Some(field) = targeted_fields
            .iter()
            .find(|f| !REFINABLE_FIELDS.contains(&f.as_str()))
        {
            return Err(PrismError::InvalidRequest(format!(
                "field {field} cannot be refined"
            )));
        }
        Ok(())
    }

    /// Check a finalization selection against the job's previews.
    pub fn validate_seed_selection(
        job: &Job,
        selection: &BTreeMap<u32, u64>,
    ) -> Result<(), PrismError> {
        if selection.is_empty() {
            return Err(PrismError::InvalidRequest("no shots selected".into()));
        }
        for (shot_id, seed) in selection {
            let seeds = job.preview_seeds(*shot_id);
            if seeds.is_empty() {
                return Err(PrismError::InvalidRequest(format!(
                    "shot {shot_id} has no preview candidates"
                )));
            }
            if !seeds.contains(seed) {
                return Err(PrismError::InvalidRequest(format!(
                    "seed {seed} is not a preview of shot {shot_id}"
                )));
            }
            if job.shot_request(*shot_id).is_none() {
                return Err(PrismError::InvalidRequest(format!(
                    "shot {shot_id} has no request"
                )));
            }
        }
        Ok(())
    }
}
