mod config;
mod extract;
mod reader;
mod report;
mod runner;
mod signals;
mod supervisor;
mod window;

use clap::Parser;
use config::{ConfigError, ReportFormat, TallyConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::LaunchError;

/// Repeatedly run a process, watch its output for a fixed window, and tally
/// the last matching number against a threshold.
#[derive(Parser, Debug)]
#[command(name = "runtally", version, about)]
pub struct Cli {
    /// Stop after this many cycles (default: run until interrupted)
    #[arg(value_name = "MAX_CYCLES")]
    max_cycles: Option<u64>,

    /// Config file path
    #[arg(short, long, default_value = "runtally.toml")]
    config: PathBuf,

    /// Observation window in milliseconds (overrides config)
    #[arg(long)]
    window_ms: Option<u64>,

    /// Threshold to compare against (overrides config)
    #[arg(long)]
    threshold: Option<u64>,

    /// Filter substring a line must contain (overrides config)
    #[arg(long)]
    filter: Option<String>,

    /// Emit one JSON object per cycle instead of text
    #[arg(long)]
    json: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (window and termination details)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply_overrides(&self, config: &mut TallyConfig) {
        if let Some(max) = self.max_cycles {
            config.run.max_cycles = Some(max);
        }
        if let Some(window_ms) = self.window_ms {
            config.timing.window_ms = window_ms;
        }
        if let Some(threshold) = self.threshold {
            config.filter.threshold = threshold;
        }
        if let Some(filter) = &self.filter {
            config.filter.substring = filter.clone();
        }
        if self.json {
            config.report.format = ReportFormat::Json;
        }
    }

    fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

/// Fatal errors, each with its own process exit status.
#[derive(Debug)]
enum RunError {
    Config(ConfigError),
    Launch(LaunchError),
}

impl RunError {
    fn exit_code(&self) -> u8 {
        match self {
            RunError::Config(_) => 2,
            RunError::Launch(_) => 1,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Config(e) => write!(f, "invalid config: {}", e),
            RunError::Launch(e) => write!(f, "cannot launch target: {}", e),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Config(e) => Some(e),
            RunError::Launch(e) => Some(e),
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        RunError::Config(e)
    }
}

impl From<LaunchError> for RunError {
    fn from(e: LaunchError) -> Self {
        RunError::Launch(e)
    }
}

/// Load the config file, apply CLI overrides, and validate the result.
fn resolve_config(cli: &Cli) -> Result<TallyConfig, RunError> {
    let mut config = TallyConfig::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.default_log_level());
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            return ExitCode::from(e.exit_code());
        }
    };

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                return ExitCode::from(2);
            }
        }
        return ExitCode::SUCCESS;
    }

    let signals = signals::SignalHandler::install();
    let mut sink = report::ConsoleSink::new(&config.report);

    tracing::info!("starting runner, press Ctrl-C to stop");
    match runner::run(&config, &signals.token(), &mut sink).await {
        Ok(summary) => {
            tracing::info!(
                cycles = summary.cycles,
                greater = summary.tally.greater,
                lesser = summary.tally.lesser,
                reason = ?summary.exit_reason,
                "stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            let e = RunError::from(e);
            tracing::error!(error = %e, "exiting");
            ExitCode::from(e.exit_code())
        }
    }
}
