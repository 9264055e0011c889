mod cli;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use prism::backend::{GenerationBackend, SimulatedBackend, WanClient};
use prism::clock::{Clock, SystemClock};
use prism::config::PrismConfig;
use prism::coordinator::ShotCoordinator;
use prism::error::PrismError;
use prism::limiter::RateLimiter;
use prism::matcher::{TemplateCatalog, TemplateMatcher};
use prism::media::NoSplitter;
use prism::orchestrator::{JobOrchestrator, OrchestratorParts};
use prism::planner::{HeuristicPlanner, Planner};
use prism::retry::RetryAdapter;
use prism::state_machine::{Job, JobReport};
use prism::store::{InMemoryJobStore, InMemoryRateStore};
use prism::ui::JobProgress;
use prism::logging;

use cli::{Cli, Command};

const BUNDLED_CATALOG: &str = include_str!("../demos/catalog.toml");
const DEMO_REQUEST: &str = "A sleek product launch video, curious then excited, bright tones";
const DEMO_FEEDBACK: &str = "make the ending feel calm";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PrismConfig::load_from(Path::new(path))?,
        None => PrismConfig::load()?,
    };
    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    logging::init(level, cli.json_logs);

    let catalog = Arc::new(load_catalog(&config)?);
    let planner: Arc<dyn Planner> = Arc::new(HeuristicPlanner::new(Arc::clone(&catalog)));

    match cli.command {
        Command::Generate { prompt, quality } => {
            let engine = build_engine(&config, catalog, planner)?;
            let job = run_step(
                "generate",
                engine.create_job(&prompt, quality.as_str(), &cli.client),
            )
            .await?;
            JobProgress::start("report").print_report(&JobReport::from_job(&job));
        }
        Command::Plan { prompt, quality } => {
            let engine = build_engine(&config, catalog, planner)?;
            let job = run_step("plan", engine.plan_job(&prompt, quality.as_str(), &cli.client))
                .await?;
            let progress = JobProgress::start("report");
            progress.print_report(&JobReport::from_job(&job));
            println!("{}", serde_json::to_string_pretty(&job.shot_requests)?);
        }
        Command::Match { prompt } => {
            let progress = JobProgress::start("matching");
            let intent = planner.parse_intent(&prompt, "balanced").await?;
            let matcher = TemplateMatcher::new(None, config.matcher.clone());
            let matched = matcher.match_intent(&intent, &catalog).await;
            progress.print_match(matched.as_ref());
        }
        Command::Demo { quality } => {
            let engine = build_engine(&config, catalog, planner)?;
            demo(&engine, quality.as_str(), &cli.client).await?;
        }
    }

    Ok(())
}

fn load_catalog(config: &PrismConfig) -> Result<TemplateCatalog> {
    let catalog = match &config.catalog_path {
        Some(path) => TemplateCatalog::load(Path::new(path))
            .with_context(|| format!("failed to load template catalog {path}"))?,
        None => TemplateCatalog::from_toml(BUNDLED_CATALOG).context("bundled catalog is invalid")?,
    };
    info!(templates = catalog.len(), "template catalog loaded");
    Ok(catalog)
}

fn build_engine(
    config: &PrismConfig,
    catalog: Arc<TemplateCatalog>,
    planner: Arc<dyn Planner>,
) -> Result<JobOrchestrator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let backend: Arc<dyn GenerationBackend> = if config.backend.api_key.is_empty() {
        info!("no API key configured, using the simulated backend");
        Arc::new(SimulatedBackend::new(Duration::from_millis(300)))
    } else {
        info!(model = %config.backend.model, "using the video synthesis API");
        Arc::new(WanClient::new(&config.backend)?)
    };

    let retry = RetryAdapter::new(Arc::clone(&backend), config.retry.clone());
    let coordinator = ShotCoordinator::new(backend, retry, Arc::new(NoSplitter));
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(InMemoryRateStore::new(Arc::clone(&clock))),
        Arc::clone(&clock),
        config.rate_limit.clone(),
    ));

    Ok(JobOrchestrator::new(OrchestratorParts {
        store: Arc::new(InMemoryJobStore::new(Arc::clone(&clock))),
        limiter,
        matcher: TemplateMatcher::new(None, config.matcher.clone()),
        planner,
        coordinator,
        catalog,
        quality_modes: config.quality_modes.clone(),
        clock,
    }))
}

/// Run one workflow step under a spinner and print its outcome.
async fn run_step<F>(step: &str, work: F) -> Result<Job>
where
    F: Future<Output = Result<Job, PrismError>>,
{
    let progress = JobProgress::start(step);
    let result = work.await;
    match &result {
        Ok(job) => progress.finish(step, Ok(&JobReport::from_job(job))),
        Err(err) => progress.finish(step, Err(err)),
    }
    Ok(result?)
}

/// Plan, render, finalize the first preview of every shot, then revise.
async fn demo(engine: &JobOrchestrator, quality: &str, client: &str) -> Result<()> {
    println!("Request: {DEMO_REQUEST}");
    let planned = run_step("plan", engine.plan_job(DEMO_REQUEST, quality, client)).await?;
    let rendered = run_step(
        "render previews",
        engine.render_existing_job(&planned.job_id, client),
    )
    .await?;

    let mut selection = BTreeMap::new();
    for asset in &rendered.preview_shot_assets {
        selection.entry(asset.shot_id).or_insert(asset.seed);
    }
    let finalized = run_step(
        "finalize at 1920x1080",
        engine.finalize_job(&rendered.job_id, &selection, "1920x1080", client),
    )
    .await?;

    println!("Feedback: {DEMO_FEEDBACK}");
    let revision = run_step(
        "revise",
        engine.revise_job(&finalized.job_id, DEMO_FEEDBACK),
    )
    .await?;

    let progress = JobProgress::start("report");
    progress.print_report(&JobReport::from_job(&finalized));
    progress.print_report(&JobReport::from_job(&revision));
    Ok(())
}
