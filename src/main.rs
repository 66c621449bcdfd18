use anyhow::Result;
use clap::{Parser, Subcommand};
use proxy_harvest::{
    config::{Config, DEFAULT_CONFIG_FILE},
    logging::init_logging,
    proxy::{CheckerConfig, LivenessChecker},
    Pipeline,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Aggregates public proxy lists into a deduplicated catalog and checks which entries are live
#[derive(Parser)]
#[command(name = "proxy-harvest")]
#[command(about = "Aggregates public proxy lists and checks which entries are live")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Source configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Snapshot directory (overrides settings.output_dir)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch all sources, deduplicate, check liveness and write every tier
    Run,
    /// Fetch all sources and deduplicate, without checking liveness
    Fetch,
    /// Re-check the existing clean tier and rewrite the active tier
    Check {
        /// Number of concurrent checks
        #[arg(short = 'n', long)]
        threads: Option<usize>,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;

    let mut config = Config::load(&cli.config)?;
    if let Some(output) = cli.output {
        config.settings.output_dir = output;
    }

    let summary = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => Pipeline::new(config).run().await?,
        Commands::Fetch => Pipeline::new(config).fetch().await?,
        Commands::Check { threads, timeout } => {
            let settings = &config.settings;
            let checker = LivenessChecker::with_config(
                CheckerConfig::new()
                    .with_concurrency(threads.unwrap_or(settings.max_workers))
                    .with_timeout(timeout.map_or(settings.check_timeout(), Duration::from_secs))
                    .with_probe_endpoints(settings.probe_endpoints.clone()),
            );
            Pipeline::new(config).with_checker(checker).check().await?
        }
    };

    summary.log();
    info!("Done.");
    Ok(())
}
