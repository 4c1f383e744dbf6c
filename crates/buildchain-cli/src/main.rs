//! buildchain CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildchain")]
#[command(about = "Dependency-aware build orchestrator", long_about = None)]
struct Cli {
    /// Path to the job table
    #[arg(long, global = true, env = "BUILDCHAIN_CONFIG", default_value = "buildchain.kdl")]
    config: String,

    /// PostgreSQL URL; requests are kept in memory when unset
    #[arg(long, global = true, env = "BUILDCHAIN_DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a job table and print its execution order
    Validate {
        /// Path to the configuration file, overrides --config
        path: Option<String>,
    },
    /// Run a job and everything it needs for a revision
    Run {
        /// Job name
        job: String,
        /// Source revision to build
        #[arg(long)]
        revision: String,
        /// Recorded as the requester
        #[arg(long, env = "USER")]
        requested_by: Option<String>,
        /// Print engine events as JSON lines
        #[arg(long)]
        events_json: bool,
    },
    /// Show all build requests for a revision
    Status {
        /// Source revision
        #[arg(long)]
        revision: String,
    },
    /// Report the result of a job run elsewhere, then run whatever it unblocks
    Complete {
        /// Job name
        job: String,
        /// Source revision
        #[arg(long)]
        revision: String,
        /// Report a failure instead of a success
        #[arg(long)]
        failed: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(path.as_deref().unwrap_or(&cli.config))?;
        }
        Commands::Run {
            job,
            revision,
            requested_by,
            events_json,
        } => {
            let opts = commands::run::RunOptions {
                config_path: cli.config,
                database_url: cli.database_url,
                events_json,
            };
            commands::run::run(&opts, &job, &revision, requested_by).await?;
        }
        Commands::Status { revision } => {
            let url = cli
                .database_url
                .ok_or_else(|| anyhow::anyhow!("status needs --database-url"))?;
            commands::status(&url, &revision).await?;
        }
        Commands::Complete {
            job,
            revision,
            failed,
        } => {
            let url = cli
                .database_url
                .ok_or_else(|| anyhow::anyhow!("complete needs --database-url"))?;
            let opts = commands::run::RunOptions {
                config_path: cli.config,
                database_url: Some(url),
                events_json: false,
            };
            commands::run::complete(&opts, &job, &revision, !failed).await?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
