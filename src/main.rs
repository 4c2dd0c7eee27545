use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use chronos::config::Config;
use chronos::health::HealthClient;
use chronos::shutdown::install_shutdown_handler;
use chronos::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "chronos")]
#[command(version)]
#[command(about = "Run shell tasks on schedules with retries and health reporting")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a Chronos worker
    Worker {
        /// Config file (.yaml, .yml, .json or .toml)
        config: PathBuf,
    },

    /// Invoke the health check API of a Chronos worker
    #[command(alias = "health")]
    Healthcheck {
        /// Health endpoint URL, e.g. http://localhost:8080/health
        url: String,

        /// Timeout for the request in seconds
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Commands::Worker { config } => run_worker(config).await,
        Commands::Healthcheck { url, timeout } => run_healthcheck(&url, timeout).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_worker(path: PathBuf) -> anyhow::Result<ExitCode> {
    let config = Config::load(&path)
        .with_context(|| format!("failed to load config file {}", path.display()))?;

    chronos::logging::init(config.log_level);

    let worker = Worker::new(&config).context("failed to build worker")?;
    let cancel = install_shutdown_handler().context("failed to install signal handlers")?;

    worker.run(cancel).await.context("worker stopped")?;
    Ok(ExitCode::SUCCESS)
}

async fn run_healthcheck(url: &str, timeout: u64) -> anyhow::Result<ExitCode> {
    let ok = HealthClient::new()
        .check(url, Duration::from_secs(timeout))
        .await
        .context("failed to invoke healthcheck endpoint")?;

    if ok {
        println!("healthcheck OK");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("healthcheck API returned failed status");
        Ok(ExitCode::FAILURE)
    }
}
