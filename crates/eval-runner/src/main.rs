//! Command-line runner for ensemble evaluation runs
//!
//! # Usage
//!
//! ```bash
//! # Estimate cost and duration before spending anything
//! eval-runner estimate --dataset evaluation --model gpt-4o --model claude-sonnet-4
//!
//! # Dry run with simulated backends
//! eval-runner run --dataset evaluation --model m1 --model m2 --simulate
//!
//! # Real run with task export
//! ENSEMBLE_CONFIG=./ensemble.toml eval-runner run --dataset evaluation \
//!     --model gpt-4o --mode production --export results.jsonl
//! ```
//!
//! Ctrl-C cancels the run; tasks still open are recorded as cancelled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use orchestrator::config::{ModelConfig, OrchestratorConfig, SimulatedConfig, MODE_TESTING};
use orchestrator::dataset::DirectoryDatasets;
use orchestrator::ensemble::{LaunchRequest, RunCoordinator};
use orchestrator::state::{ModelId, RunStatus, SharedRunArchive};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (overrides ENSEMBLE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Dataset root directory (overrides ENSEMBLE_DATASET_DIR)
    #[arg(long, global = true)]
    dataset_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a run and follow its progress to the end
    Run {
        #[command(flatten)]
        target: Target,

        /// Write one JSON line per task here once the run ends
        #[arg(long)]
        export: Option<PathBuf>,

        /// RocksDB directory to archive the run in (needs the heavy-state feature)
        #[arg(long)]
        archive: Option<PathBuf>,
    },

    /// Print the cost and duration estimate of a run
    Estimate {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args, Debug)]
struct Target {
    /// Dataset reference under the dataset root
    #[arg(long)]
    dataset: String,

    /// Model id; repeat for an ensemble
    #[arg(long = "model", required = true)]
    models: Vec<String>,

    /// Execution mode
    #[arg(long, default_value = MODE_TESTING)]
    mode: String,

    /// Serve every listed model from the simulated backend
    #[arg(long, default_value_t = false)]
    simulate: bool,
}

impl Target {
    fn request(&self) -> LaunchRequest {
        LaunchRequest::new(&self.dataset, self.models.iter().map(String::as_str), &self.mode)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Estimate { target } => {
            simulate_models(&mut config, &target);
            let coordinator = build_coordinator(config, None)?;
            let estimate = coordinator.estimate(&target.request()).await?;
            println!("{}", serde_json::to_string_pretty(&estimate)?);
            Ok(())
        }
        Command::Run {
            target,
            export,
            archive,
        } => {
            simulate_models(&mut config, &target);
            let archive_path = archive.or_else(|| config.archive_path.clone());
            let archive = open_archive(archive_path.as_deref())?;
            let coordinator = build_coordinator(config, archive)?;
            run(coordinator, &target, export.as_deref()).await
        }
    }
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => OrchestratorConfig::from_env().context("Failed to load config")?,
    };
    if let Some(dir) = &cli.dataset_dir {
        config.dataset_dir = Some(dir.clone());
    }
    Ok(config)
}

/// Swap the target's models for simulated ones, keeping configured pricing
fn simulate_models(config: &mut OrchestratorConfig, target: &Target) {
    if !target.simulate {
        return;
    }
    for id in &target.models {
        let id = ModelId::from(id.as_str());
        let pricing = config.models.get(&id).and_then(|m| m.pricing);
        let mut model = ModelConfig::simulated(SimulatedConfig::default());
        model.pricing = pricing;
        config.models.insert(id, model);
    }
}

#[cfg(feature = "heavy-state")]
fn open_archive(path: Option<&Path>) -> Result<Option<SharedRunArchive>> {
    use orchestrator::state::RocksArchive;

    path.map(|p| {
        RocksArchive::open(p)
            .map(|a| Arc::new(a) as SharedRunArchive)
            .with_context(|| format!("Failed to open archive at {}", p.display()))
    })
    .transpose()
}

#[cfg(not(feature = "heavy-state"))]
fn open_archive(path: Option<&Path>) -> Result<Option<SharedRunArchive>> {
    if let Some(p) = path {
        bail!(
            "cannot archive to {}: built without the heavy-state feature",
            p.display()
        );
    }
    Ok(None)
}

fn build_coordinator(
    config: OrchestratorConfig,
    archive: Option<SharedRunArchive>,
) -> Result<Arc<RunCoordinator>> {
    let root = config
        .dataset_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("datasets"));
    let datasets = Arc::new(DirectoryDatasets::new(root));

    let mut coordinator = RunCoordinator::from_config(config, datasets)
        .context("Failed to build model backends")?;
    if let Some(archive) = archive {
        coordinator = coordinator.with_archive(archive);
    }
    Ok(coordinator.shared())
}

async fn run(coordinator: Arc<RunCoordinator>, target: &Target, export: Option<&Path>) -> Result<()> {
    let request = target.request();

    let estimate = coordinator.estimate(&request).await?;
    info!(
        tasks = estimate.task_count,
        workers = estimate.concurrency,
        low_usd = estimate.low,
        high_usd = estimate.high,
        expected_seconds = estimate.expected_seconds.round(),
        "Estimate"
    );
    if estimate.exceeds_ceiling {
        warn!(
            mode = %estimate.mode,
            high_usd = estimate.high,
            "Estimate exceeds the mode's cost ceiling; the run will pause when it is reached"
        );
    }

    let run_id = coordinator.launch(request).await?;
    let mut progress = coordinator.subscribe(&run_id)?;

    let interrupt = {
        let coordinator = Arc::clone(&coordinator);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(run_id = %run_id, "Interrupted, cancelling run");
                let _ = coordinator.cancel(&run_id);
            }
        })
    };

    while let Some(view) = progress.next().await {
        info!(
            run_id = %view.run_id,
            status = %view.status,
            completed = view.completed,
            total = view.total,
            success_rate = %format!("{:.3}", view.success_rate),
            cost_usd = %format!("{:.4}", view.running_cost),
            eta_seconds = ?view.eta_seconds.map(f64::round),
            "Progress"
        );
        if view.status == RunStatus::Paused {
            warn!(run_id = %view.run_id, "Run paused; Ctrl-C to cancel");
        }
    }
    interrupt.abort();

    let view = coordinator.wait(&run_id).await?;
    let summary = coordinator.puzzle_summary(&run_id)?;
    info!(
        run_id = %run_id,
        puzzles = summary.total_puzzles,
        solved = summary.solved,
        solve_rate = %format!("{:.3}", summary.solve_rate()),
        cost_usd = %format!("{:.4}", view.running_cost),
        "Run summary"
    );
    for (model, stats) in &summary.per_model {
        info!(
            model = %model,
            completed = stats.completed,
            correct = stats.correct,
            failed = stats.failed,
            cost_usd = %format!("{:.4}", stats.cost),
            "Model summary"
        );
    }

    if let Some(path) = export {
        let rows = coordinator.export_tasks(&run_id)?;
        tokio::fs::write(path, rows)
            .await
            .with_context(|| format!("Failed to write export to {}", path.display()))?;
        info!(path = %path.display(), "Tasks exported");
    }

    match view.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => bail!("run {run_id} was cancelled"),
        status => {
            let run = coordinator.get_run(&run_id)?;
            bail!(
                "run {run_id} ended {status}: {}",
                run.error.unwrap_or_default()
            )
        }
    }
}
