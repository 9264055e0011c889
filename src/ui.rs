//! Terminal progress for the CLI: an `indicatif` spinner per workflow step
//! and `console` colours for outcomes.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::PrismError;
use crate::matcher::TemplateMatch;
use crate::state_machine::{JobReport, JobState};

pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    pub fn start(step: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(step.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn step(&self, step: &str) {
        self.pb.set_message(step.to_string());
    }

    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.dim.apply_to("·")));
    }

    /// Stop the spinner and print the outcome of one step.
    pub fn finish(&self, step: &str, result: Result<&JobReport, &PrismError>) {
        self.pb.finish_and_clear();
        match result {
            Ok(report) if report.state == JobState::Failed => {
                println!("  {} {step}: job {} failed", self.red.apply_to("✗"), report.job_id);
            }
            Ok(report) => println!(
                "  {} {step}: {} asset(s) across {}/{} shot(s)",
                self.green.apply_to("✓"),
                report.asset_count,
                report.shots_with_assets,
                report.shots_requested
            ),
            Err(err) if err.is_throttled() => {
                println!("  {} {step}: {err}", self.yellow.apply_to("⏳"));
            }
            Err(err) => println!("  {} {step}: {err}", self.red.apply_to("✗")),
        }
    }

    pub fn print_match(&self, matched: Option<&TemplateMatch>) {
        self.pb.finish_and_clear();
        match matched {
            Some(m) => {
                println!(
                    "  {} {}:{} ({:?}, confidence {:.2})",
                    self.green.apply_to("✓"),
                    m.template_id,
                    m.version,
                    m.method,
                    m.confidence
                );
                println!("{}", serde_json::to_string_pretty(m).unwrap_or_default());
            }
            None => println!(
                "  {} {}",
                self.yellow.apply_to("?"),
                PrismError::ClarificationNeeded
            ),
        }
    }

    pub fn print_report(&self, report: &JobReport) {
        self.pb.finish_and_clear();
        let style = match report.state {
            JobState::Succeeded => &self.green,
            JobState::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Job Report ───"));
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }
}
