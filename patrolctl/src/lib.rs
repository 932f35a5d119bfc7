pub mod commands;

use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] patrol_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("driver error: {0}")]
    Driver(#[from] patrol_core::DriverError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] patrol_core::TelemetryError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Patrol command-line control interface", long_about = None)]
pub struct Cli {
    /// Path to the main patrol.toml
    #[arg(long, default_value = "configs/patrol.toml")]
    pub config: PathBuf,
    /// Path to the targets file
    #[arg(long, default_value = "configs/targets.toml")]
    pub targets: PathBuf,
    /// Directory with per-target credential files
    #[arg(long)]
    pub secrets_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the configured targets and write results
    Run(RunArgs),
    /// Inspect the targets file
    #[command(subcommand)]
    Targets(TargetsCommands),
    /// Query the telemetry database
    #[command(subcommand)]
    Report(ReportCommands),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Where to write the result set
    #[arg(long, default_value = "results.json")]
    pub out: PathBuf,
    /// Override runner.max_concurrency
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    /// Run the browser with a visible window
    #[arg(long, default_value_t = false)]
    pub headed: bool,
    /// Only run targets whose name is listed (repeatable)
    #[arg(long = "only")]
    pub only: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum TargetsCommands {
    /// List configured targets
    List,
    /// Parse and validate the targets file
    Validate,
}

#[derive(Subcommand, Debug)]
pub enum ReportCommands {
    /// Show recent failed attempts
    Failures(ReportArgs),
    /// Show recent target results
    Results(ReportArgs),
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Maximum rows returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();
    match &cli.command {
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(commands::run::execute(&cli, args))
        }
        Commands::Targets(command) => commands::targets::execute(&cli, command),
        Commands::Report(command) => commands::report::execute(&cli, command),
        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "patrolctl",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
