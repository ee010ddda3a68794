mod compose;
mod config;
mod engine;
mod process;
mod runner;
mod scheduler;
mod sink;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use autotest_common::{RunSettings, TestMatrix};
use bollard::Docker;
use clap::Parser;
use config::ServiceCatalog;
use process::SystemRunner;
use runner::CaseRunner;
use scheduler::{Scheduler, Verdict};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "autotest-runner")]
#[command(about = "Run a matrix of containerized integration-test cases", long_about = None)]
struct Cli {
    /// Matrix document (`-` reads stdin)
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Service catalog JSON; the built-in catalog is used when omitted
    #[arg(short, long)]
    services: Option<PathBuf>,

    /// Directory for per-case logs
    #[arg(long, default_value = autotest_common::config::DEFAULT_LOGS_DIR)]
    logs_dir: PathBuf,

    /// Run only these tests (repeatable)
    #[arg(short, long = "test")]
    tests: Vec<String>,
}

fn read_matrix(input: &str) -> Result<TestMatrix> {
    if input == "-" {
        return Ok(TestMatrix::from_reader(io::stdin().lock())?);
    }
    let file = File::open(input).with_context(|| format!("Failed to open matrix {}", input))?;
    Ok(TestMatrix::from_reader(io::BufReader::new(file))?)
}

async fn run(cli: Cli) -> Result<Verdict> {
    let settings = RunSettings {
        logs_dir: cli.logs_dir,
        ..RunSettings::from_env()?
    };

    let catalog = ServiceCatalog::load_or_default(cli.services.as_deref()).map_err(|e| {
        error!("Failed to load service catalog: {:#}", e);
        e
    })?;

    let matrix = read_matrix(&cli.input)?;
    let cases = matrix.cases()?;
    info!(cases = cases.len(), images = matrix.images.len(), "Loaded test matrix");

    let mut case_runner = CaseRunner::new(Arc::new(SystemRunner), Arc::new(catalog));
    match Docker::connect_with_local_defaults() {
        Ok(docker) => case_runner = case_runner.with_image_probe(docker),
        Err(e) => warn!(error = %e, "Engine API unavailable, skipping image probes"),
    }

    let scheduler = Scheduler::new(Arc::new(case_runner), settings, cli.tests);
    scheduler.run(cases, &matrix.images).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let verdict = match run(cli).await {
        Ok(verdict) => verdict,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    match &verdict {
        Verdict::Passed => info!("All cases passed"),
        Verdict::Failed { failed } => error!(?failed, "Cases failed"),
        Verdict::FailFast { case_id } => error!(case_id = %case_id, "Stopped after first failure"),
        Verdict::DeadlineExceeded { outstanding } => error!(?outstanding, "Deadline exceeded"),
    }

    if verdict.abandons_running_cases() {
        warn!("Abandoning cases that are still running");
    }

    // Exit right away: cases still running are abandoned, not awaited
    std::process::exit(verdict.exit_code());
}
