//! Command-line surface of `prism`, built on clap.

use clap::{Parser, Subcommand, ValueEnum};

/// Prism: turn a content request into rendered video shots.
#[derive(Debug, Parser)]
#[command(name = "prism", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a prism.toml; defaults to $PRISM_CONFIG or ./prism.toml.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Client key used for rate and concurrency limits.
    #[arg(long, global = true, default_value = "cli")]
    pub client: String,

    /// Log at debug level.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QualityArg {
    Fast,
    Balanced,
    High,
}

impl QualityArg {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityArg::Fast => "fast",
            QualityArg::Balanced => "balanced",
            QualityArg::High => "high",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan a request and render its preview candidates.
    Generate {
        prompt: String,

        #[arg(long, short, value_enum, default_value_t = QualityArg::Balanced)]
        quality: QualityArg,
    },

    /// Plan a request without rendering.
    Plan {
        prompt: String,

        #[arg(long, short, value_enum, default_value_t = QualityArg::Balanced)]
        quality: QualityArg,
    },

    /// Show which template a request matches.
    Match { prompt: String },

    /// Plan, render, finalize, and revise a built-in request.
    Demo {
        #[arg(long, short, value_enum, default_value_t = QualityArg::Fast)]
        quality: QualityArg,
    },
}
