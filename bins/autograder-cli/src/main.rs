mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "autograder-cli")]
#[command(about = "Autograder CLI - Grade submissions, manage images, and run course tasks", long_about = None)]
struct Cli {
    /// Config file (without extension), defaults to $AUTOGRADER_CONFIG or `autograder`
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a submission directory against an assignment
    Grade {
        /// Course directory (contains course.json)
        #[arg(short, long)]
        course_dir: PathBuf,

        /// Assignment ID
        #[arg(short, long)]
        assignment: String,

        /// Directory holding the submitted files
        #[arg(short, long)]
        submission: PathBuf,

        /// Submitting user's email
        #[arg(short, long)]
        user: String,

        /// Message attached to the submission
        #[arg(short, long, default_value = "")]
        message: String,

        /// Run the grader as a local process instead of a container
        #[arg(long)]
        no_container: bool,

        /// Do not save the submission
        #[arg(long)]
        no_store: bool,

        /// Skip submission limits
        #[arg(long)]
        no_rejection: bool,

        /// Keep the temporary grading dir for inspection
        #[arg(long)]
        leave_temp_dir: bool,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build the Docker image for one assignment (or every assignment in the course)
    BuildImage {
        #[arg(short, long)]
        course_dir: PathBuf,

        /// Assignment ID, all assignments when omitted
        #[arg(short, long)]
        assignment: Option<String>,

        /// Rebuild even when nothing changed, without the layer cache
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Report whether an assignment image is out of date
    NeedRebuild {
        #[arg(short, long)]
        course_dir: PathBuf,

        #[arg(short, long)]
        assignment: String,

        /// Stop at the first detected change
        #[arg(long)]
        quick: bool,
    },

    /// List a user's submissions for an assignment
    History {
        #[arg(short, long)]
        course_dir: PathBuf,

        #[arg(short, long)]
        assignment: String,

        #[arg(short, long)]
        user: String,
    },

    /// Score every LMS-bound assignment and upload to the LMS
    UploadScores {
        #[arg(short, long)]
        course_dir: PathBuf,

        /// Print the upload plan instead of writing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one course task immediately
    RunTask {
        #[arg(short, long)]
        course_dir: PathBuf,

        #[arg(short, long, value_enum)]
        kind: TaskArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TaskArg {
    Backup,
    LmsSync,
    ScoringUpload,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Grade {
            course_dir,
            assignment,
            submission,
            user,
            message,
            no_container,
            no_store,
            no_rejection,
            leave_temp_dir,
            json,
        } => {
            let options = commands::GradeFlags {
                no_container,
                no_store,
                no_rejection,
                leave_temp_dir,
                json,
            };
            commands::grade(config, &course_dir, &assignment, &submission, &user, &message, options)
                .await?;
        }
        Commands::BuildImage {
            course_dir,
            assignment,
            force,
        } => {
            commands::build_images(config, &course_dir, assignment.as_deref(), force).await?;
        }
        Commands::NeedRebuild {
            course_dir,
            assignment,
            quick,
        } => {
            commands::need_rebuild(config, &course_dir, &assignment, quick).await?;
        }
        Commands::History {
            course_dir,
            assignment,
            user,
        } => {
            commands::history(config, &course_dir, &assignment, &user).await?;
        }
        Commands::UploadScores { course_dir, dry_run } => {
            commands::upload_scores(config, &course_dir, dry_run).await?;
        }
        Commands::RunTask { course_dir, kind } => {
            let kind = match kind {
                TaskArg::Backup => autograder_engine::TaskKind::Backup,
                TaskArg::LmsSync => autograder_engine::TaskKind::LmsSync,
                TaskArg::ScoringUpload => autograder_engine::TaskKind::ScoringUpload,
            };
            commands::run_task(config, &course_dir, kind).await?;
        }
    }

    Ok(())
}
