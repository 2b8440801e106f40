//! fairq CLI
//!
//! Command-line interface for the fairq daemon's control API.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// fairq - fair-share GPU container queue
#[derive(Parser, Debug)]
#[command(name = "fairq")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show scheduler status
    Status,

    /// List pending jobs in dispatch order
    Pending,

    /// List running jobs
    Running,

    /// List finished jobs, most recent first
    History {
        /// Show at most this many entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show per-user fairness statistics
    Users,

    /// Show free and assigned GPUs
    Gpus,

    /// Stop dispatching new jobs
    Lock,

    /// Resume dispatching
    Unlock,

    /// Delete pending jobs by id or name
    Delete {
        /// Job id (repeatable)
        #[arg(long = "id")]
        ids: Vec<Uuid>,

        /// Job name (repeatable)
        #[arg(long = "name")]
        names: Vec<String>,
    },

    /// Remove all finished jobs from the history
    ClearHistory,

    /// Stop the daemon
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Status => commands::status(&client).await?,
        Commands::Pending => commands::pending(&client).await?,
        Commands::Running => commands::running(&client).await?,
        Commands::History { limit } => commands::history(&client, limit).await?,
        Commands::Users => commands::users(&client).await?,
        Commands::Gpus => commands::gpus(&client).await?,
        Commands::Lock => commands::lock(&client, true).await?,
        Commands::Unlock => commands::lock(&client, false).await?,
        Commands::Delete { ids, names } => commands::delete(&client, ids, names).await?,
        Commands::ClearHistory => commands::clear_history(&client).await?,
        Commands::Shutdown => commands::shutdown(&client).await?,
    }

    Ok(())
}
