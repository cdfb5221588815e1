mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "blankcode-cli")]
#[command(about = "Blankcode CLI - Grade code locally and manage the submission queue", long_about = None)]
struct Cli {
    /// Redis URL (defaults to $REDIS_URL, then redis://127.0.0.1:6379)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a solution directly, without the queue
    Run {
        /// Language name or alias (e.g., python, ts, golang)
        #[arg(short, long)]
        language: String,

        /// File with the submitted code
        #[arg(short, long)]
        code: PathBuf,

        /// File with the test code (omit for program mode)
        #[arg(short, long)]
        tests: Option<PathBuf>,

        /// Use the local process sandbox instead of Docker
        #[arg(long, default_value = "false")]
        local: bool,

        /// Print the raw result as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Store hidden test code for an exercise
    AddExercise {
        /// Language name or alias
        #[arg(short, long)]
        language: String,

        /// File with the test code
        #[arg(short, long)]
        tests: PathBuf,

        /// Exercise id (generated when omitted)
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Create a submission and enqueue it for grading
    Submit {
        /// Exercise id
        #[arg(short, long)]
        exercise: Uuid,

        /// File with the submitted code
        #[arg(short, long)]
        code: PathBuf,

        /// Submitting user (generated when omitted)
        #[arg(short, long)]
        user: Option<Uuid>,
    },

    /// Re-queue a failed or errored submission
    Retry {
        /// Submission id
        submission: Uuid,
    },

    /// Show a submission and the user's progress on its exercise
    Status {
        /// Submission id
        submission: Uuid,

        /// Print the raw record as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let redis_url = cli
        .redis_url
        .or_else(|| std::env::var("REDIS_URL").ok())
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

    match cli.command {
        Commands::Run {
            language,
            code,
            tests,
            local,
            json,
        } => {
            let passed = commands::run_local(&language, &code, tests.as_deref(), local, json).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::AddExercise { language, tests, id } => {
            commands::add_exercise(&redis_url, &language, &tests, id).await?;
        }
        Commands::Submit {
            exercise,
            code,
            user,
        } => {
            commands::submit(&redis_url, exercise, &code, user).await?;
        }
        Commands::Retry { submission } => {
            commands::retry(&redis_url, submission).await?;
        }
        Commands::Status { submission, json } => {
            commands::status(&redis_url, submission, json).await?;
        }
    }

    Ok(())
}
