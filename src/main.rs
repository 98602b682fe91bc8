use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};

use common::{Configuration, load_subjects};
use orchestrator::ProductionPipeline;

#[derive(Parser)]
#[command(
    name = "datascrub",
    version,
    about = "Masks subjects' identifying data across the relational, search and analytics stores",
    group(ArgGroup::new("mode").required(true).args(["dry_run", "execute"]))
)]
struct Cli {
    /// CSV of subjects to erase (columns: subject_id, email, display_name).
    #[arg(long)]
    csv: PathBuf,

    /// Configuration file (defaults to datascrub.toml in the working directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resolve and report targets without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Perform the masking.
    #[arg(long)]
    execute: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => Configuration::load_path(path),
        None => Configuration::load(),
    }
    .context("Failed to load configuration")?;

    let subjects = load_subjects(&cli.csv)
        .with_context(|| format!("Failed to load subjects from {}", cli.csv.display()))?;
    if subjects.is_empty() {
        bail!("No usable subject rows in {}", cli.csv.display());
    }

    log::info!(
        "Processing {} subjects ({})",
        subjects.len(),
        if cli.dry_run { "dry run" } else { "execute" }
    );

    let pipeline = ProductionPipeline::from_config(&config, cli.dry_run)
        .context("Failed to initialize store clients")?;
    let stats = pipeline.run(subjects).await;

    println!("{}", stats.summary());

    // Degraded per-store numbers are a summary, not a crash; the exit status
    // only reflects whether the run itself completed.
    if stats.total_failures() > 0 {
        log::error!(
            "Run finished with {} failed operations",
            stats.total_failures()
        );
    } else {
        log::info!("Run finished with no failed operations");
    }
    Ok(())
}
