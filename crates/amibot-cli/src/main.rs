use std::path::PathBuf;
use std::sync::Arc;

use amibot_storage::SeenStore;
use amibot_sync::{build_scheduler, run_poll, PollPipeline, SyncConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "amibot")]
#[command(about = "Watches Ubuntu AMI releases and opens pull requests for new images")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single poll and exit.
    Poll(PollArgs),
    /// Create the seen-image table if it does not exist.
    Migrate,
    /// Poll on the configured cron schedule until interrupted.
    Watch(PollArgs),
}

#[derive(Debug, Default, clap::Args)]
struct PollArgs {
    /// Read the releases table from a local file instead of the network.
    #[arg(long)]
    fixture: Option<PathBuf>,
    #[arg(long)]
    skip_notifications: bool,
    #[arg(long)]
    skip_pull_requests: bool,
}

impl PollArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(path) = &self.fixture {
            config.fixture_path = Some(path.clone());
        }
        if self.skip_notifications {
            config.send_notifications = false;
        }
        if self.skip_pull_requests {
            config.open_pull_requests = false;
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Poll(PollArgs::default())) {
        Commands::Poll(args) => {
            args.apply(&mut config);
            let pipeline = PollPipeline::from_config(&config).await?;
            let report = run_poll(&pipeline, &config).await?;
            println!("{}", report.summary_line());
        }
        Commands::Migrate => {
            let store = SeenStore::open(&config.database_path)
                .await
                .with_context(|| format!("opening {}", config.database_path.display()))?;
            println!(
                "migrate complete: database={} images={}",
                config.database_path.display(),
                store.count().await?
            );
        }
        Commands::Watch(args) => {
            args.apply(&mut config);
            let pipeline = Arc::new(PollPipeline::from_config(&config).await?);
            let mut sched = build_scheduler(pipeline, &config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.poll_cron, "watching for new images");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
