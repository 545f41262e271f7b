use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use statbucket::config::Config;
use statbucket::health::HealthMetrics;
use statbucket::replay::{self, Trace};

/// Bucketed, condition-gated metric aggregation with anomaly detection.
#[derive(Parser)]
#[command(name = "statbucket", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Replay a recorded trace and print each report as a JSON line.
    Replay {
        /// Path to the YAML trace file.
        #[arg(short, long)]
        trace: PathBuf,

        /// Print health metrics to stderr when done.
        #[arg(long)]
        health: bool,
    },
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (trace_path, print_health) = match cli.command {
        Command::Version => {
            println!("statbucket {}", version::full());
            return Ok(());
        }
        Command::Replay { trace, health } => (trace, health),
    };

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        metrics = cfg.metrics.len(),
        alerts = cfg.alerts.len(),
        "starting statbucket",
    );

    let trace = Trace::load(&trace_path)?;
    let health = Arc::new(HealthMetrics::new().context("registering health metrics")?);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    replay::run(&cfg, trace, Arc::clone(&health), &mut out)?;
    out.flush().context("flushing reports")?;

    if print_health {
        eprint!("{}", health.encode()?);
    }

    Ok(())
}
