mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gradebox-cli")]
#[command(about = "Gradebox CLI - Manage challenges and submissions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint a challenge document and store it
    AddChallenge {
        /// Challenge id (overrides any id in the document)
        #[arg(short, long)]
        id: String,

        /// Challenge document (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Check a challenge document without storing it
    LintChallenge {
        /// Challenge document (JSON)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Queue a submission for grading
    Submit {
        /// Challenge id
        #[arg(short, long)]
        challenge: String,

        /// Submitting user id
        #[arg(short, long)]
        user: String,

        /// File holding the submitted code
        #[arg(short, long)]
        file: PathBuf,

        /// Language hint passed through to the result
        #[arg(short, long)]
        language: Option<String>,
    },

    /// Show the stored result of a submission
    Result {
        /// Execution id printed by `submit`
        #[arg(short, long)]
        id: uuid::Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::AddChallenge { id, file } => {
            commands::add_challenge(&id, &file).await?;
        }
        Commands::LintChallenge { file } => {
            commands::lint_challenge(&file)?;
        }
        Commands::Submit {
            challenge,
            user,
            file,
            language,
        } => {
            commands::submit(&challenge, &user, &file, language).await?;
        }
        Commands::Result { id } => {
            commands::show_result(&id).await?;
        }
    }

    Ok(())
}
