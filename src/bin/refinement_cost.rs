//! Refinement cost command line
//!
//! # CLI Commands
//!
//! - `estimate` - Calibrate, count and assemble a cost matrix from traces
//! - `assemble` - Assemble a cost matrix from previously written raw counts
//! - `check-config` - Validate configuration file
//!
//! # Configuration
//!
//! Configuration is read from:
//! 1. `--config` on the command line
//! 2. `REFCOST_CONFIG` environment variable (path to TOML file)
//! 3. `./refinement_cost.toml` in current directory
//! 4. Default configuration
//!
//! `REFCOST_*` environment variables override values from any source.

use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use refinement_cost::{
    config::Config,
    cost_matrix::{CostMatrix, RawCountArtifact},
    packet::load_trace,
    query::standard_workload,
    CostEstimator, MinuteBucket,
};

const DEFAULT_CONFIG_FILE: &str = "refinement_cost.toml";

// =============================================================================
// CLI Definition
// =============================================================================

/// Refinement cost - cost matrices for refined telemetry queries
#[derive(Parser)]
#[command(name = "refinement-cost")]
#[command(version)]
#[command(about = "Estimate per-stage costs of telemetry queries across refinement levels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (overrides REFCOST_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run calibration and transit counting over traces, then assemble
    Estimate {
        /// Minute bucket and trace file, as MINUTE:PATH (repeatable)
        #[arg(short, long = "trace", value_parser = parse_trace_arg, required = true)]
        traces: Vec<(MinuteBucket, PathBuf)>,

        /// Where to write the cost matrix (defaults to storage.matrix_path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the matrix as JSON rows
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Assemble a cost matrix from raw count artifacts
    Assemble {
        /// Artifact directory (defaults to storage.artifact_dir)
        #[arg(short, long)]
        artifacts: Option<PathBuf>,

        /// Where to write the cost matrix (defaults to storage.matrix_path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the matrix as JSON rows
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Validate configuration file and print the effective settings
    CheckConfig,
}

fn parse_trace_arg(raw: &str) -> Result<(MinuteBucket, PathBuf), String> {
    let (minute, path) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected MINUTE:PATH, got '{}'", raw))?;
    let minute = minute
        .parse::<MinuteBucket>()
        .map_err(|e| format!("invalid minute '{}': {}", minute, e))?;
    if path.is_empty() {
        return Err(format!("missing trace path in '{}'", raw));
    }
    Ok((minute, PathBuf::from(path)))
}

// =============================================================================
// Configuration and Logging
// =============================================================================

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("REFCOST_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        });

    let config = match path {
        Some(path) => Config::from_file_with_env(&path)?,
        None => Config::from_env(),
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Run the full pipeline over every trace
fn cmd_estimate(
    config: &Config,
    traces: &[(MinuteBucket, PathBuf)],
    output: Option<&Path>,
    json: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let estimator = CostEstimator::from_config(config, standard_workload()?)?;
    info!(traces = traces.len(), estimator = ?estimator, "Starting estimation");

    let start = std::time::Instant::now();
    let mut artifacts = Vec::new();
    for (minute, path) in traces {
        let packets = load_trace(path, config.trace)?;
        if packets.is_empty() {
            warn!(minute, path = %path.display(), "Trace holds no packets");
        }
        let run = estimator.run_minute(*minute, &packets)?;
        estimator.write_artifacts(&run, &config.storage.artifact_dir)?;
        artifacts.extend(run.artifacts);
    }

    let matrix = estimator.assemble(&artifacts)?;
    write_matrix(config, &matrix, output, json)?;

    println!("Estimation complete in {:?}", start.elapsed());
    println!("  Minutes: {}", matrix.minutes().len());
    println!("  Artifacts: {}", artifacts.len());
    println!("  Cost records: {}", matrix.len());
    Ok(())
}

/// Assemble a matrix from artifacts already on disk
fn cmd_assemble(
    config: &Config,
    artifacts: Option<&Path>,
    output: Option<&Path>,
    json: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = artifacts.unwrap_or(config.storage.artifact_dir.as_path());
    let loaded = RawCountArtifact::load_dir(dir)?;
    if loaded.is_empty() {
        warn!(dir = %dir.display(), "No raw count artifacts found");
    }

    let estimator = CostEstimator::from_config(config, standard_workload()?)?;
    let matrix = estimator.assemble(&loaded)?;
    write_matrix(config, &matrix, output, json)?;

    println!("Assembled {} artifacts from {:?}", loaded.len(), dir);
    println!("  Minutes: {}", matrix.minutes().len());
    println!("  Cost records: {}", matrix.len());
    Ok(())
}

fn write_matrix(
    config: &Config,
    matrix: &CostMatrix,
    output: Option<&Path>,
    json: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = output.unwrap_or(config.storage.matrix_path.as_path());
    matrix.save(output)?;
    println!("Wrote cost matrix to {:?}", output);

    if let Some(json) = json {
        std::fs::write(json, matrix.to_json()?)?;
        println!("Wrote JSON rows to {:?}", json);
    }
    Ok(())
}

/// Validate configuration and print summary
fn cmd_check_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let hierarchy = config.hierarchy()?;

    println!("Configuration is valid!");
    println!();
    println!("Refinement:");
    println!("  Levels: {:?}", hierarchy.levels());
    if config.refinement.reference_levels.is_empty() {
        println!("  Reference levels: all");
    } else {
        println!("  Reference levels: {:?}", config.refinement.reference_levels);
    }
    println!();
    println!("Calibration:");
    println!("  Estimator: {:?}", config.estimator());
    println!("  Percentile overrides: {}", config.calibration.percentiles.len());
    println!();
    println!("Performance:");
    println!("  Worker threads: {}", config.performance.worker_threads);
    println!("  Morsel size: {}", config.performance.morsel_size);
    println!();
    println!("Storage:");
    match &config.storage.checkpoint_dir {
        Some(dir) => println!("  Checkpoints: {:?}", dir),
        None => println!("  Checkpoints: in memory"),
    }
    println!("  Keep checkpoints: {}", config.storage.keep_checkpoints);
    println!("  Artifacts: {:?}", config.storage.artifact_dir);
    println!("  Cost matrix: {:?}", config.storage.matrix_path);
    println!();
    println!("Monitoring:");
    println!("  Log level: {}", config.monitoring.log_level);

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let Some(command) = &cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = load_config(&cli)?;
    if let Commands::CheckConfig = command {
        return cmd_check_config(&config);
    }

    init_tracing(&config.monitoring.log_level);

    match command {
        Commands::Estimate {
            traces,
            output,
            json,
        } => cmd_estimate(&config, traces, output.as_deref(), json.as_deref()),
        Commands::Assemble {
            artifacts,
            output,
            json,
        } => cmd_assemble(&config, artifacts.as_deref(), output.as_deref(), json.as_deref()),
        Commands::CheckConfig => cmd_check_config(&config),
    }
}
