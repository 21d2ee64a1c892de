mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kiln_common::types::Action;

#[derive(Parser)]
#[command(name = "kiln-cli")]
#[command(about = "Kiln CLI - Submit build jobs, fetch results, inspect dead letters and in-flight jobs", long_about = None)]
struct Cli {
    /// Worker config file whose broker section is used
    #[arg(long, global = true, default_value = "config/worker.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a job on the jobs exchange
    Submit {
        /// Project root as seen by the worker
        #[arg(short, long)]
        project: String,

        /// run, jar or test
        #[arg(short, long, default_value = "run")]
        action: Action,

        /// Request id (generated when omitted)
        #[arg(short, long)]
        request_id: Option<String>,

        /// Block up to this many seconds for the result
        #[arg(short, long)]
        wait: Option<f64>,
    },

    /// Fetch the result published for a request
    Result {
        request_id: String,

        /// Block up to this many seconds, consuming the result
        #[arg(short, long)]
        wait: Option<f64>,
    },

    /// List dead-lettered jobs
    DeadLetters {
        /// Move them back onto the jobs exchange
        #[arg(long, default_value = "false")]
        requeue: bool,
    },

    /// List jobs claimed by workers but not yet settled
    InFlight {
        /// Requeue everything claimed by this (stopped) worker
        #[arg(long)]
        recover: Option<String>,
    },

    /// Write a default worker configuration
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            project,
            action,
            request_id,
            wait,
        } => {
            let broker = commands::load_broker_config(&cli.config)?;
            commands::submit(&broker, &project, action, request_id, wait).await?;
        }
        Commands::Result { request_id, wait } => {
            let broker = commands::load_broker_config(&cli.config)?;
            commands::fetch_result(&broker, &request_id, wait).await?;
        }
        Commands::DeadLetters { requeue } => {
            let broker = commands::load_broker_config(&cli.config)?;
            commands::dead_letters(&broker, requeue).await?;
        }
        Commands::InFlight { recover } => {
            let broker = commands::load_broker_config(&cli.config)?;
            commands::in_flight(&broker, recover).await?;
        }
        Commands::Init { path } => {
            commands::init_project(&path).await?;
        }
    }

    Ok(())
}
