use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use labcheck::config::LabcheckConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "labcheck")]
#[command(version, about = "Automated homework grading pipeline")]
pub struct Cli {
    /// Path to labcheck.toml (defaults to ./labcheck.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path. Overrides labcheck.toml and LABCHECK_DB.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and optionally seed disciplines
    Init {
        /// JSON file with a `disciplines` array
        #[arg(long)]
        disciplines: Option<PathBuf>,
    },
    /// Create a student's homework record for a discipline
    Enroll {
        #[arg(long)]
        student: i64,
        #[arg(long)]
        discipline: i64,
    },
    /// Queue answer files for grading
    Submit {
        #[arg(long)]
        student: i64,
        /// Delivery channel for the results (defaults to the student id)
        #[arg(long)]
        chat: Option<i64>,
        #[arg(long)]
        discipline: i64,
        #[arg(long)]
        lab: u32,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Start the grading workers until Ctrl+C
    Run {
        /// Number of concurrent sandbox workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Deliver pending results and rejections to stdout
    Drain {
        /// Stop after this many messages
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show queue depths and, optionally, a student's scores
    Status {
        #[arg(long)]
        student: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = LabcheckConfig::load(cli.config.as_deref())?;
    config.apply_env()?;
    if let Some(db_path) = &cli.db_path {
        config.checker.db_path = db_path.clone();
    }

    match &cli.command {
        Commands::Init { disciplines } => cmd::cmd_init(&config, disciplines.as_deref())?,
        Commands::Enroll {
            student,
            discipline,
        } => cmd::cmd_enroll(&config, *student, *discipline)?,
        Commands::Submit {
            student,
            chat,
            discipline,
            lab,
            files,
        } => cmd::cmd_submit(
            &config,
            cmd::SubmitArgs {
                student_id: *student,
                channel_id: chat.unwrap_or(*student),
                discipline_id: *discipline,
                lab_number: *lab,
                files,
            },
        )?,
        Commands::Run { workers } => {
            if let Some(workers) = workers {
                config.checker.workers = *workers;
            }
            let _guard = labcheck::telemetry::init(&config.logging)?;
            cmd::cmd_run(&config).await?;
        }
        Commands::Drain { limit } => cmd::cmd_drain(&config, *limit)?,
        Commands::Status { student } => cmd::cmd_status(&config, *student)?,
    }

    Ok(())
}
